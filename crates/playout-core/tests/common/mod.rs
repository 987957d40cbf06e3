//! Shared harness: a synthetic talker and a tick-driven receiver

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use voxmesh_playout_core::channel::{ChannelCodec, ChannelCoder, ChannelCoderKind, ChannelPacket};
use voxmesh_playout_core::codec::{CodecRegistry, Encoder};
use voxmesh_playout_core::mixer::{MixedUnit, Mixer, RecordingMixer};
use voxmesh_playout_core::unit::MediaUnit;
use voxmesh_playout_core::{AudioFormat, AudioFrame, PipelineConfig, RtpPacketInfo, SourceManager, Timestamp};

pub const RATE: u32 = 8000;
pub const FRAME: u64 = 160;

pub fn ts(ticks: u64) -> Timestamp {
    Timestamp::new(ticks, RATE)
}

/// One packet as it left the sender
#[derive(Debug, Clone)]
pub struct Sent {
    pub seq: u16,
    pub packet: ChannelPacket,
    /// Index of the unit whose encoding produced the packet
    pub emitted_by: u64,
}

/// Encodes a 400 Hz tone through a channel coder
pub struct Talker {
    pub ssrc: u32,
    coder: ChannelCoder,
    encoders: Vec<Box<dyn Encoder>>,
    next_unit: u64,
    seq: u16,
}

impl Talker {
    /// `codecs` lists the primary codec first, then any redundant ones
    pub fn new(ssrc: u32, kind: ChannelCoderKind, params: &str, codecs: &[&str]) -> Self {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let encoders = codecs
            .iter()
            .map(|name| registry.encoder(registry.by_name(name).unwrap()).unwrap())
            .collect();
        let coder = ChannelCoder::with_parameters(kind, registry, PipelineConfig::default().payload_types, params).unwrap();
        Self {
            ssrc,
            coder,
            encoders,
            next_unit: 0,
            seq: 1000,
        }
    }

    /// Encode `count` voiced units followed by `silent` silent ones
    pub fn talk(&mut self, count: u64, silent: u64) -> Vec<Sent> {
        let mut out = Vec::new();
        for i in 0..count + silent {
            let n = self.next_unit;
            self.next_unit += 1;
            let unit = if i < count { self.voiced(n) } else { MediaUnit::placeholder() };
            for packet in self.coder.encode(ts(n * FRAME), &unit).unwrap() {
                self.seq = self.seq.wrapping_add(1);
                out.push(Sent {
                    seq: self.seq,
                    packet,
                    emitted_by: n,
                });
            }
        }
        out
    }

    /// Skip `count` units of sender time without sending anything
    pub fn pause(&mut self, count: u64) {
        self.next_unit += count;
    }

    fn voiced(&mut self, n: u64) -> MediaUnit {
        let samples = (0..FRAME)
            .map(|i| {
                let t = (n * FRAME + i) as f64 / RATE as f64;
                ((t * 400.0 * 2.0 * std::f64::consts::PI).sin() * 9000.0) as i16
            })
            .collect();
        let frame = AudioFrame::new(samples, AudioFormat::telephony());
        let mut unit = MediaUnit::placeholder();
        for (i, encoder) in self.encoders.iter_mut().enumerate() {
            let coded = encoder.encode(&frame).unwrap();
            if i == 0 {
                unit.add_primary(coded);
            } else {
                unit.add_redundant(coded);
            }
        }
        unit
    }
}

/// A packet scheduled to reach the receiver at `arrival` ticks
#[derive(Debug, Clone)]
pub struct Delivery {
    pub arrival: u64,
    pub info: RtpPacketInfo,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(ssrc: u32, sent: &Sent, arrival: u64) -> Self {
        let pt = sent.packet.payload_type().unwrap();
        let info = RtpPacketInfo::new(ssrc, sent.seq, sent.packet.ts.ticks() as u32, pt, ts(arrival))
            .with_marker(sent.packet.marker);
        Self {
            arrival,
            info,
            payload: sent.packet.payload(),
        }
    }
}

/// Deliver each packet when the tick containing its arrival runs, ticking
/// one frame at a time from 0 until `until`
pub fn drive(manager: &mut SourceManager, mixer: &mut dyn Mixer, mut deliveries: Vec<Delivery>, until: u64) {
    deliveries.sort_by_key(|d| d.arrival);
    let mut pending = deliveries.into_iter().peekable();
    let mut start = 0;
    while start < until {
        let end = start + FRAME;
        while let Some(d) = pending.next_if(|d| d.arrival <= end) {
            manager.enqueue(d.info, d.payload).unwrap();
        }
        manager.tick(ts(start), ts(end), mixer);
        start = end;
    }
}

/// Units handed to the mixer are back to back: each starts where the
/// previous one ended
pub fn assert_contiguous(units: &[&MixedUnit]) {
    for pair in units.windows(2) {
        let end = pair[0].playout.add_ticks(pair[0].frame.samples_per_channel() as i64);
        assert_eq!(pair[1].playout, end, "gap or overlap after {}", pair[0].playout);
    }
}

pub fn played(mixer: &RecordingMixer, ssrc: u32) -> Vec<&MixedUnit> {
    mixer.for_source(ssrc).collect()
}
