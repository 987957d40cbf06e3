//! Per-source receive pipeline
//!
//! Every sender heard on the session gets a [`PersistentSourceEntry`]
//! (statistics and playout state that survive silence) and, while it is
//! active, a [`Source`] holding the live decode state. The [`SourceManager`]
//! owns both and drives them from the periodic service tick:
//!
//! 1. queued packets are validated, checked for reconfiguration and
//!    talkspurt boundaries, given a playout time and put in the channel
//!    buffer;
//! 2. the channel coder expands channel buffer entries into media units;
//! 3. media units due in the tick window are decoded (or repaired), skew
//!    corrected, converted and handed to the mixer;
//! 4. played history beyond the retention window is trimmed.
//!
//! Everything that goes wrong on this path costs at most some audio from one
//! source; other sources carry on.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::audio::AudioFrame;
use crate::buffer::{CursorId, PlayoutBuffer};
use crate::channel::{ChannelCodec, ChannelCoder, ChannelCoderKind, ChannelPacket, ChannelPayloadTypes, DecodedUnit};
use crate::codec::{CodecRegistry, CodecStateStore};
use crate::config::PipelineConfig;
use crate::convert::{Converter, LinearConverter};
use crate::error::{Error, Result};
use crate::mixer::Mixer;
use crate::playout::{PacketTiming, PlayoutDelayEstimator};
use crate::render::Spatializer;
use crate::repair::{self, Repair, RepairRequest};
use crate::skew::{SkewState, SourceSkewAdapter};
use crate::stats::SourceStats;
use crate::time::Timestamp;
use crate::unit::MediaUnit;

pub mod participant;

pub use participant::{MemoryParticipantStore, ParticipantStore, PersistentSourceEntry, RtpClock};

/// The parts of an RTP header the pipeline needs, plus the arrival time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacketInfo {
    pub ssrc: u32,
    pub seq: u16,
    pub rtp_ts: u32,
    pub marker: bool,
    pub payload_type: u8,
    /// Local receive time
    pub arrival: Timestamp,
}

impl RtpPacketInfo {
    pub fn new(ssrc: u32, seq: u16, rtp_ts: u32, payload_type: u8, arrival: Timestamp) -> Self {
        Self {
            ssrc,
            seq,
            rtp_ts,
            marker: false,
            payload_type,
            arrival,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }
}

/// Live decode state of one active sender
///
/// Buffer keys are local playout times on the sender's codec clock.
pub struct Source {
    ssrc: u32,
    config: PipelineConfig,
    registry: Arc<CodecRegistry>,
    payload_types: ChannelPayloadTypes,

    coder: Option<ChannelCoder>,
    channel: PlayoutBuffer<ChannelPacket>,
    channel_cursor: CursorId,
    media: PlayoutBuffer<MediaUnit>,
    /// On the last unit handed to the mixer
    read: CursorId,

    codecs: CodecStateStore,
    converter: Box<dyn Converter>,
    spatializer: Option<Box<dyn Spatializer>>,
    repair: Option<Box<dyn Repair>>,
    skew: SourceSkewAdapter,

    queue: VecDeque<(RtpPacketInfo, Bytes)>,

    /// End of the audio handed to the mixer so far
    next_played: Option<Timestamp>,
    /// Playout times at which talkspurts start, not yet reached
    boundaries: VecDeque<Timestamp>,
    /// Channel coder latency included in the current playout offset
    latency: Timestamp,
    /// Last frame that came out of a decoder, before skew correction
    last_frame: Option<AudioFrame>,
    unit_dur: Option<Timestamp>,
    units_since_start: u32,
    consecutive_repairs: u32,
    last_repair: Option<Timestamp>,
    backoff_until: Option<Timestamp>,
    last_activity: Option<Timestamp>,
}

impl Source {
    pub fn new(ssrc: u32, registry: Arc<CodecRegistry>, config: &PipelineConfig) -> Result<Self> {
        let mut channel = PlayoutBuffer::new();
        let channel_cursor = channel.create_cursor()?;
        let mut media = PlayoutBuffer::new();
        let read = media.create_cursor()?;

        Ok(Self {
            ssrc,
            config: config.clone(),
            payload_types: config.payload_types,
            codecs: CodecStateStore::new(registry.clone()),
            registry,
            coder: None,
            channel,
            channel_cursor,
            media,
            read,
            converter: Box::new(LinearConverter::new()),
            spatializer: None,
            repair: repair::for_scheme(config.repair.scheme),
            skew: SourceSkewAdapter::new(config.skew.clone()),
            queue: VecDeque::new(),
            next_played: None,
            boundaries: VecDeque::new(),
            latency: Timestamp::zero(8000),
            last_frame: None,
            unit_dur: None,
            units_since_start: 0,
            consecutive_repairs: 0,
            last_repair: None,
            backoff_until: None,
            last_activity: None,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn coder_kind(&self) -> Option<ChannelCoderKind> {
        self.coder.as_ref().map(|c| c.kind())
    }

    /// Parameter string of the active channel coder
    pub fn coder_parameters(&self) -> Option<String> {
        self.coder.as_ref().map(|c| c.parameters())
    }

    /// Packets waiting for channel decoding
    pub fn channel_len(&self) -> usize {
        self.channel.len()
    }

    /// Media units buffered, played history included
    pub fn media_len(&self) -> usize {
        self.media.len()
    }

    pub fn next_played(&self) -> Option<Timestamp> {
        self.next_played
    }

    pub fn last_repair(&self) -> Option<Timestamp> {
        self.last_repair
    }

    pub fn set_spatializer(&mut self, spatializer: Option<Box<dyn Spatializer>>) {
        self.spatializer = spatializer;
    }

    pub fn set_converter(&mut self, converter: Box<dyn Converter>) {
        self.converter = converter;
    }

    pub fn enqueue(&mut self, info: RtpPacketInfo, payload: Bytes) {
        self.queue.push_back((info, payload));
    }

    /// Nothing queued or left to play, and silent for `timeout`
    pub fn is_idle(&self, now: Timestamp, timeout: Timestamp) -> bool {
        if !self.queue.is_empty() || !self.channel.is_empty() {
            return false;
        }
        if matches!(self.media.peek_next(self.read), Ok(Some(_))) {
            return false;
        }
        match self.last_activity {
            Some(last) => !(last + timeout).is_after(&now),
            None => true,
        }
    }

    /// Run one service tick over `[start, end]`
    pub fn service(
        &mut self,
        entry: &mut PersistentSourceEntry,
        estimator: &PlayoutDelayEstimator,
        start: Timestamp,
        end: Timestamp,
        mixer: &mut dyn Mixer,
    ) -> Result<()> {
        while let Some((info, payload)) = self.queue.pop_front() {
            self.ingest(entry, estimator, info, payload);
        }
        self.decode(entry, end)?;
        self.play(entry, start, end, mixer)?;
        self.media
            .audit(self.read, Timestamp::from_millis(self.config.history_ms as u64, 1000))?;
        Ok(())
    }

    fn ingest(
        &mut self,
        entry: &mut PersistentSourceEntry,
        estimator: &PlayoutDelayEstimator,
        info: RtpPacketInfo,
        payload: Bytes,
    ) {
        entry.stats.packets_received += 1;
        entry.stats.bytes_received += payload.len() as u64;
        self.last_activity = Some(info.arrival);

        let kind = match self.payload_types.classify(info.payload_type, &self.registry) {
            Ok(kind) => kind,
            Err(e) => {
                entry.stats.packets_invalid += 1;
                warn!("Dropping packet {} from {:#010x}: {}", info.seq, self.ssrc, e);
                return;
            }
        };
        let mut packet = ChannelPacket::new(Timestamp::zero(8000), info.marker, info.payload_type, payload);
        let shape = match &self.coder {
            Some(coder) if coder.kind() == kind => coder.describe(&packet),
            _ => ChannelCoder::new(kind, self.registry.clone(), self.payload_types).describe(&packet),
        };
        let described = shape.and_then(|s| {
            let frame = self.registry.require(s.codec)?.frame_duration();
            Ok((s, frame))
        });
        let (shape, frame) = match described {
            Ok(found) => found,
            Err(e) => {
                entry.stats.packets_invalid += 1;
                warn!("Dropping malformed packet {} from {:#010x}: {}", info.seq, self.ssrc, e);
                return;
            }
        };
        let freq = frame.freq();
        let src_ts = entry.source_timestamp(info.rtp_ts, freq);
        packet.ts = src_ts;

        let mut talkspurt = self.coder.is_none() || info.marker;
        let mut in_order = true;
        if let (Some(last_seq), Some(last_ts)) = (entry.last_seq, entry.last_src_ts) {
            let seq_delta = info.seq.wrapping_sub(last_seq) as i16;
            if seq_delta == 0 {
                entry.stats.packets_duplicate += 1;
                trace!("Duplicate packet {} from {:#010x}", info.seq, self.ssrc);
                return;
            }
            if seq_delta < 0 {
                entry.stats.packets_misordered += 1;
                in_order = false;
            } else if kind != ChannelCoderKind::Interleaver && entry.units_per_packet > 0 && !talkspurt {
                // Silence suppression without a marker shows as a timestamp
                // jump larger than the sequence gap explains.
                let expected = frame.scale(entry.units_per_packet as u64 * seq_delta as u64);
                if src_ts.signed_delta(&last_ts) > expected.convert(freq).ticks() as i64 {
                    trace!("Timestamp jump from {} to {} on {:#010x}", last_ts, src_ts, self.ssrc);
                    talkspurt = true;
                }
            }
        } else {
            talkspurt = true;
        }

        let upp_changed = kind != ChannelCoderKind::Interleaver
            && entry.units_per_packet > 0
            && shape.units > 0
            && shape.units != entry.units_per_packet
            && (shape.units > entry.units_per_packet || info.marker);
        let changed = entry.coder != Some(kind) || entry.codec != Some(shape.codec) || upp_changed;
        if changed || self.coder.is_none() {
            if changed && entry.coder.is_some() {
                entry.stats.reconfigurations += 1;
                debug!(
                    "Source {:#010x} reconfigured to {} / {} / {} units per packet",
                    self.ssrc, kind, shape.codec, shape.units
                );
            }
            if changed {
                self.codecs.clear();
                self.converter.reset();
            }
            self.coder = Some(ChannelCoder::new(kind, self.registry.clone(), self.payload_types));
            entry.coder = Some(kind);
            entry.codec = Some(shape.codec);
            talkspurt = true;
        }
        if kind != ChannelCoderKind::Interleaver && shape.units > 0 && (entry.units_per_packet == 0 || changed) {
            entry.units_per_packet = shape.units;
        }

        // Senders that only reveal their redundancy offset after the first
        // packet need a fresh offset, with a silence boundary, once it shows.
        let announced = shape.latency.convert(freq);
        let latency = self
            .coder
            .as_ref()
            .map_or(announced, |c| announced.max(c.latency().convert(freq)));
        if !talkspurt && latency.is_after(&self.latency) {
            debug!("Source {:#010x} channel latency grew to {}", self.ssrc, latency);
            talkspurt = true;
        }

        if talkspurt {
            entry.stats.talkspurts += 1;
            self.units_since_start = 0;
        }
        let timing = PacketTiming {
            src_ts,
            arrival: info.arrival.convert(freq),
            gap: frame.scale(shape.units.max(1) as u64),
            talkspurt_start: talkspurt,
        };
        let decision = estimator.update(entry, timing, latency);
        if decision.recomputed.is_some() {
            self.latency = latency;
        }
        let playout = decision.playout;
        if talkspurt {
            debug!("Source {:#010x} talkspurt starts at {} (plays at {})", self.ssrc, src_ts, playout);
            self.boundaries.push_back(playout);
        }
        match self.next_played {
            Some(next) if playout.is_before(&next) => {
                estimator.note_late(entry);
            }
            _ => estimator.note_on_time(entry),
        }

        if in_order {
            entry.last_seq = Some(info.seq);
            entry.last_src_ts = Some(src_ts);
        }
        entry.last_arrival = Some(timing.arrival);

        match self.channel.add(packet, playout) {
            Ok(()) => trace!("Source {:#010x} packet {} queued for {}", self.ssrc, info.seq, playout),
            Err(Error::DuplicateTimestamp) => entry.stats.packets_duplicate += 1,
            Err(e) => {
                entry.stats.packets_invalid += 1;
                warn!("Could not buffer packet {} from {:#010x}: {}", info.seq, self.ssrc, e);
            }
        }
    }

    /// Expand channel buffer entries due before the decode horizon
    fn decode(&mut self, entry: &mut PersistentSourceEntry, end: Timestamp) -> Result<()> {
        let coder = match self.coder.as_mut() {
            Some(coder) => coder,
            None => return Ok(()),
        };
        let horizon = end + Timestamp::from_millis(self.config.decode_horizon_ms as u64, end.freq());

        let mut ready: Vec<(DecodedUnit, Timestamp)> = Vec::new();
        loop {
            self.channel.rewind(self.channel_cursor)?;
            if !self.channel.advance(self.channel_cursor)? {
                break;
            }
            match self.channel.cursor_timestamp(self.channel_cursor)? {
                Some(key) if !key.is_after(&horizon) => {}
                _ => break,
            }
            let (packet, key) = match self.channel.detach_at(self.channel_cursor)? {
                Some(detached) => detached,
                None => break,
            };
            match coder.decode(&packet) {
                Ok(units) => ready.extend(units.into_iter().map(|unit| {
                    let at = key.add_ticks(unit.ts.signed_delta(&packet.ts));
                    (unit, at)
                })),
                Err(e) if e.is_protocol_violation() => {
                    entry.stats.packets_invalid += 1;
                    warn!("Channel decode of {:#010x} packet at {} failed: {}", self.ssrc, packet.ts, e);
                }
                Err(e) => {
                    entry.stats.decode_errors += 1;
                    debug!("Channel decode of {:#010x} packet at {} failed: {}", self.ssrc, packet.ts, e);
                }
            }
        }

        let now = end.convert(entry.playout.freq()) - entry.playout;
        for unit in coder.flush(now) {
            let at = unit.ts + entry.playout;
            ready.push((unit, at));
        }
        for (unit, at) in ready {
            self.place(unit, at);
        }
        Ok(())
    }

    /// Merge one decoded unit into the media buffer
    fn place(&mut self, decoded: DecodedUnit, at: Timestamp) {
        if self.next_played.is_some_and(|next| at.is_before(&next)) {
            trace!("Unit for {} arrived after its playout time", at);
            return;
        }
        let DecodedUnit { unit, primary, .. } = decoded;
        if let Some(existing) = self.media.find_mut(at) {
            // A placeholder never displaces what is already known.
            if let Some(unit) = unit {
                let added = if primary {
                    existing.add_primary(unit)
                } else {
                    existing.add_redundant(unit)
                };
                if !added {
                    trace!("Representation for {} already buffered", at);
                }
            }
            return;
        }
        let media = unit.map_or_else(MediaUnit::placeholder, MediaUnit::coded);
        if let Err(e) = self.media.add(media, at) {
            trace!("Could not buffer unit at {}: {}", at, e);
        }
    }

    fn unit_duration(&self, entry: &PersistentSourceEntry) -> Timestamp {
        self.unit_dur
            .or_else(|| {
                entry
                    .codec
                    .and_then(|c| self.registry.info(c))
                    .map(|info| info.frame_duration())
            })
            .unwrap_or_else(|| Timestamp::from_millis(20, 8000))
    }

    /// True if a talkspurt starts in `(expected, ts]`
    fn silence_between(&self, expected: Timestamp, ts: Timestamp) -> bool {
        self.boundaries
            .iter()
            .any(|b| b.is_after(&expected) && !b.is_after(&ts))
    }

    /// Forget boundaries playback has reached
    fn pass_boundaries(&mut self, ts: Timestamp) {
        while self.boundaries.front().is_some_and(|b| !b.is_after(&ts)) {
            self.boundaries.pop_front();
        }
    }

    /// Jump playback to `ts`; a repair run in progress still counts
    fn resync(&mut self, ts: Timestamp) {
        self.next_played = Some(ts);
        self.converter.reset();
    }

    fn play(
        &mut self,
        entry: &mut PersistentSourceEntry,
        start: Timestamp,
        end: Timestamp,
        mixer: &mut dyn Mixer,
    ) -> Result<()> {
        loop {
            // The next buffered unit may lie beyond this tick; a gap in front
            // of it is still due now.
            let ts = match self.media.peek_next(self.read)? {
                Some((_, ts)) => ts,
                None => break,
            };
            let unit_dur = self.unit_duration(entry);

            if let Some(expected) = self.next_played {
                if ts.is_before(&expected) {
                    self.media.advance(self.read)?;
                    entry.stats.units_lost += 1;
                    trace!("Unit at {} overlaps audio already played", ts);
                    continue;
                }
                let unit_ticks = unit_dur.convert(ts.freq()).ticks().max(1) as i64;
                let missing = ts.signed_delta(&expected);
                if missing >= unit_ticks && !expected.is_after(&end) {
                    if self.silence_between(expected, ts) {
                        trace!("Silence from {} to {} on {:#010x}", expected, ts, self.ssrc);
                        self.consecutive_repairs = 0;
                        self.resync(ts);
                    } else if !(expected + unit_dur).is_after(&start) {
                        entry.stats.units_lost += 1;
                        trace!("Gap at {} is already behind the tick window", expected);
                        self.next_played = Some(expected + unit_dur);
                        continue;
                    } else if let Some(frame) = self.conceal(entry, expected, start) {
                        if let Err(e) = self.media.add(MediaUnit::audio(frame.clone()), expected) {
                            trace!("Could not buffer repaired unit at {}: {}", expected, e);
                        }
                        self.media.advance(self.read)?;
                        self.emit(entry, frame, expected, mixer);
                        continue;
                    } else {
                        let lost = (missing / unit_ticks) as u64;
                        entry.stats.units_lost += lost;
                        debug!("Source {:#010x} lost {} units before {}", self.ssrc, lost, ts);
                        self.resync(ts);
                    }
                }
            }

            if ts.is_after(&end) {
                break;
            }
            self.pass_boundaries(ts);
            self.media.advance(self.read)?;
            if !(ts + unit_dur).is_after(&start) {
                entry.stats.units_lost += 1;
                trace!("Unit at {} is already behind the tick window", ts);
                self.resync(ts + unit_dur);
                continue;
            }

            let decoded = match self.media.get_at_mut(self.read)? {
                Some((unit, _)) => match unit.decoded() {
                    Some(frame) => Some(frame.clone()),
                    None => {
                        let mut result = None;
                        for rep in unit.coded_reps() {
                            match self.codecs.decode(rep) {
                                Ok(frame) => {
                                    result = Some(frame);
                                    break;
                                }
                                Err(e) => {
                                    entry.stats.decode_errors += 1;
                                    trace!("Decoding {} at {} failed: {}", rep.codec, ts, e);
                                }
                            }
                        }
                        if let Some(frame) = &result {
                            unit.set_decoded(frame.clone());
                        }
                        result
                    }
                },
                None => None,
            };

            match decoded {
                Some(frame) => self.play_decoded(entry, frame, ts, mixer),
                None => match self.conceal(entry, ts, start) {
                    Some(frame) => {
                        if let Some((unit, _)) = self.media.get_at_mut(self.read)? {
                            unit.set_decoded(frame.clone());
                        }
                        self.emit(entry, frame, ts, mixer);
                    }
                    None => {
                        entry.stats.units_lost += 1;
                        self.resync(ts + unit_dur);
                    }
                },
            }
        }
        Ok(())
    }

    fn play_decoded(&mut self, entry: &mut PersistentSourceEntry, frame: AudioFrame, ts: Timestamp, mixer: &mut dyn Mixer) {
        self.consecutive_repairs = 0;
        self.units_since_start += 1;
        self.unit_dur = Some(frame.duration());
        self.last_frame = Some(frame.clone());

        let mut frame = frame;
        let estimate = self.skew.classify(entry, self.units_since_start);
        if estimate.state != SkewState::None {
            let changed = self.skew.adapt(estimate, &mut frame);
            if changed > 0 {
                self.shift(entry, estimate.state, Timestamp::new(changed as u64, frame.format.sample_rate));
            }
        }
        self.emit(entry, frame, ts, mixer);
    }

    /// Move everything scheduled after the current unit by a skew correction
    fn shift(&mut self, entry: &mut PersistentSourceEntry, state: SkewState, delta: Timestamp) {
        let samples = delta.ticks();
        match state {
            SkewState::Fast => {
                self.media.shift_backward(delta);
                self.channel.shift_backward(delta);
                entry.playout = entry.playout - delta;
                for b in self.boundaries.iter_mut() {
                    *b = *b - delta;
                }
                self.last_repair = self.last_repair.map(|t| t - delta);
                self.backoff_until = self.backoff_until.map(|t| t - delta);
                entry.stats.skew_fast_corrections += 1;
                entry.stats.samples_dropped += samples;
            }
            SkewState::Slow => {
                self.media.shift_forward(delta);
                self.channel.shift_forward(delta);
                entry.playout = entry.playout + delta;
                for b in self.boundaries.iter_mut() {
                    *b = *b + delta;
                }
                self.last_repair = self.last_repair.map(|t| t + delta);
                self.backoff_until = self.backoff_until.map(|t| t + delta);
                entry.stats.skew_slow_corrections += 1;
                entry.stats.samples_inserted += samples;
            }
            SkewState::None => {}
        }
    }

    /// Replacement audio for a missing unit at `at`, if repair is allowed
    fn conceal(&mut self, entry: &mut PersistentSourceEntry, at: Timestamp, start: Timestamp) -> Option<AudioFrame> {
        let info = entry.codec.and_then(|c| self.registry.info(c))?;
        let (format, samples_per_channel) = (info.format, info.samples_per_frame);
        if !(at + info.frame_duration()).is_after(&start) {
            return None;
        }
        let repair = self.repair.as_mut()?;
        if self.consecutive_repairs >= self.config.repair.max_consecutive {
            trace!("Source {:#010x}: repair run limit reached at {}", self.ssrc, at);
            return None;
        }
        if let Some(until) = self.backoff_until {
            if at.is_before(&until) {
                return None;
            }
            self.backoff_until = None;
        }

        let request = RepairRequest {
            consecutive: self.consecutive_repairs + 1,
            previous: self.last_frame.as_ref(),
            format,
            samples_per_channel,
        };
        match repair.produce_replacement(&request, &mut self.codecs) {
            Ok(frame) => {
                self.consecutive_repairs += 1;
                self.last_repair = Some(at);
                entry.stats.units_repaired += 1;
                trace!("Source {:#010x}: {} repaired unit at {}", self.ssrc, repair.name(), at);
                Some(frame)
            }
            Err(e) => {
                entry.stats.repair_failures += 1;
                let until = at + Timestamp::from_millis(self.config.repair.backoff_ms as u64, at.freq());
                warn!("Repair for {:#010x} failed ({}), backing off until {}", self.ssrc, e, until);
                self.backoff_until = Some(until);
                None
            }
        }
    }

    /// Convert, render and hand a native frame to the mixer
    fn emit(&mut self, entry: &mut PersistentSourceEntry, frame: AudioFrame, ts: Timestamp, mixer: &mut dyn Mixer) {
        self.next_played = Some(ts + frame.duration());
        let output = self.config.output_format;
        let mut out = if frame.format == output {
            frame
        } else {
            match self.converter.convert(&frame, output) {
                Ok(converted) => converted,
                Err(e) => {
                    entry.stats.decode_errors += 1;
                    warn!("Source {:#010x}: dropping unit at {}: {}", self.ssrc, ts, e);
                    return;
                }
            }
        };
        if let Some(spatializer) = self.spatializer.as_mut() {
            spatializer.spatialize(&mut out);
        }
        mixer.accept(&out, self.ssrc, ts.convert(output.sample_rate));
        entry.stats.units_played += 1;
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        // Cursors go before their buffers.
        let _ = self.channel.destroy_cursor(self.channel_cursor);
        let _ = self.media.destroy_cursor(self.read);
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("ssrc", &format_args!("{:#010x}", self.ssrc))
            .field("coder", &self.coder_kind())
            .field("channel", &self.channel.len())
            .field("media", &self.media.len())
            .field("next_played", &self.next_played)
            .finish()
    }
}

/// Owns every sender's state and runs the service tick
pub struct SourceManager<P: ParticipantStore = MemoryParticipantStore> {
    config: PipelineConfig,
    registry: Arc<CodecRegistry>,
    estimator: PlayoutDelayEstimator,
    participants: P,
    sources: HashMap<u32, Source>,
}

impl SourceManager<MemoryParticipantStore> {
    pub fn new(config: PipelineConfig, registry: Arc<CodecRegistry>) -> Result<Self> {
        Self::with_store(config, registry, MemoryParticipantStore::new())
    }
}

impl<P: ParticipantStore> SourceManager<P> {
    /// Create a manager backed by an external participant store
    pub fn with_store(config: PipelineConfig, registry: Arc<CodecRegistry>, participants: P) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            estimator: PlayoutDelayEstimator::new(config.playout.clone()),
            config,
            registry,
            participants,
            sources: HashMap::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn participants(&self) -> &P {
        &self.participants
    }

    /// Queue a received packet for the next tick
    pub fn enqueue(&mut self, info: RtpPacketInfo, payload: Bytes) -> Result<()> {
        self.participants.get_or_create(info.ssrc);
        let source = match self.sources.entry(info.ssrc) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let source = Source::new(info.ssrc, self.registry.clone(), &self.config)?;
                debug!("Created decode state for source {:#010x}", info.ssrc);
                e.insert(source)
            }
        };
        source.enqueue(info, payload);
        Ok(())
    }

    /// Service every active source over `[start, end]`
    pub fn tick(&mut self, start: Timestamp, end: Timestamp, mixer: &mut dyn Mixer) {
        let idle_timeout = Timestamp::from_millis(self.config.idle_timeout_ms as u64, 1000);
        let mut ssrcs: Vec<u32> = self.sources.keys().copied().collect();
        ssrcs.sort_unstable();

        for ssrc in ssrcs {
            let idle = match self.sources.get_mut(&ssrc) {
                Some(source) => {
                    let entry = self.participants.get_or_create(ssrc);
                    if let Err(e) = source.service(entry, &self.estimator, start, end, mixer) {
                        warn!("Service tick for source {:#010x} failed: {}", ssrc, e);
                    }
                    source.is_idle(end, idle_timeout)
                }
                None => false,
            };
            if idle {
                self.sources.remove(&ssrc);
                debug!("Source {:#010x} idle, released decode state", ssrc);
            }
        }
    }

    pub fn source(&self, ssrc: u32) -> Option<&Source> {
        self.sources.get(&ssrc)
    }

    pub fn source_mut(&mut self, ssrc: u32) -> Result<&mut Source> {
        self.sources.get_mut(&ssrc).ok_or(Error::SourceNotFound(ssrc))
    }

    /// Senders with live decode state, sorted
    pub fn active_sources(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.sources.keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }

    pub fn entry(&self, ssrc: u32) -> Option<&PersistentSourceEntry> {
        self.participants.lookup(ssrc)
    }

    pub fn stats(&self, ssrc: u32) -> Option<&SourceStats> {
        self.participants.lookup(ssrc).map(|e| &e.stats)
    }

    pub fn set_spatializer(&mut self, ssrc: u32, spatializer: Box<dyn Spatializer>) -> Result<()> {
        self.source_mut(ssrc)?.set_spatializer(Some(spatializer));
        Ok(())
    }

    /// Forget a sender entirely (explicit leave or timeout)
    pub fn remove_participant(&mut self, ssrc: u32) -> Result<PersistentSourceEntry> {
        self.sources.remove(&ssrc);
        let entry = self.participants.remove(ssrc).ok_or(Error::SourceNotFound(ssrc))?;
        debug!("Removed participant {:#010x}", ssrc);
        Ok(entry)
    }
}

impl<P: ParticipantStore> std::fmt::Debug for SourceManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("sources", &self.active_sources())
            .field("participants", &self.participants.ssrcs())
            .finish()
    }
}
