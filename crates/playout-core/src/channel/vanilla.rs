//! Unprotected channel coding
//!
//! Up to eight consecutive units of one codec are concatenated into a
//! packet. The RTP payload type names the codec, so there is no in-band
//! header; the receiver slices the payload by the codec's frame size.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use super::{frame_span, put_unit, split_frames, ChannelCodec, ChannelCoderKind, ChannelPacket, DecodedUnit, PacketShape};
use crate::codec::{CodecId, CodecRegistry};
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::unit::{CodedUnit, MediaUnit};

/// Largest number of units grouped into one packet
pub const MAX_UNITS_PER_PACKET: usize = 8;

/// Headerless packing of one codec's units; the codec is known only from
/// the RTP payload type the packet arrived with
#[derive(Debug)]
pub struct VanillaCoder {
    registry: Arc<CodecRegistry>,
    units_per_packet: usize,
    pending: Vec<CodedUnit>,
    group_ts: Option<Timestamp>,
    talkspurt_start: bool,
}

impl VanillaCoder {
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self {
            registry,
            units_per_packet: 1,
            pending: Vec::new(),
            group_ts: None,
            talkspurt_start: true,
        }
    }

    pub fn units_per_packet(&self) -> usize {
        self.units_per_packet
    }

    fn pending_codec(&self) -> Option<CodecId> {
        self.pending.first().map(|u| u.codec)
    }

    fn emit(&mut self) -> Result<Option<ChannelPacket>> {
        let (codec, ts) = match (self.pending_codec(), self.group_ts) {
            (Some(codec), Some(ts)) => (codec, ts),
            _ => return Ok(None),
        };
        let info = self.registry.require(codec)?;
        let mut payload = BytesMut::with_capacity(self.pending.len() * info.wire_frame_len());
        for unit in self.pending.drain(..) {
            put_unit(&mut payload, &unit);
        }
        let packet = ChannelPacket::new(ts, self.talkspurt_start, info.payload_type, payload.freeze());
        trace!("Vanilla packet at {} ({} bytes)", ts, packet.data.payload_len());
        self.talkspurt_start = false;
        self.group_ts = None;
        Ok(Some(packet))
    }
}

impl ChannelCodec for VanillaCoder {
    fn kind(&self) -> ChannelCoderKind {
        ChannelCoderKind::Vanilla
    }

    fn encode(&mut self, ts: Timestamp, unit: &MediaUnit) -> Result<Vec<ChannelPacket>> {
        let mut out = Vec::new();

        let coded = match unit.coded_reps().next() {
            Some(coded) => coded,
            None => {
                // Silence ends the group; the next unit opens a new talkspurt.
                out.extend(self.emit()?);
                self.talkspurt_start = true;
                return Ok(out);
            }
        };

        if self.pending_codec().is_some_and(|c| c != coded.codec) {
            out.extend(self.emit()?);
        }
        if self.pending.is_empty() {
            self.group_ts = Some(ts);
        }
        self.pending.push(coded.clone());
        if self.pending.len() >= self.units_per_packet {
            out.extend(self.emit()?);
        }
        Ok(out)
    }

    fn decode(&mut self, packet: &ChannelPacket) -> Result<Vec<DecodedUnit>> {
        let pt = packet
            .payload_type()
            .ok_or_else(|| Error::ProtocolViolation("empty packet".into()))?;
        let codec = self
            .registry
            .by_payload_type(pt)
            .ok_or(Error::UnknownPayloadType(pt))?;
        let units = split_frames(&self.registry, codec, &packet.payload())?;
        let step = frame_span(&self.registry, codec, 1)?;

        Ok(units
            .into_iter()
            .enumerate()
            .map(|(i, unit)| DecodedUnit::primary(packet.ts + step.scale(i as u64), unit))
            .collect())
    }

    fn describe(&self, packet: &ChannelPacket) -> Result<PacketShape> {
        let pt = packet
            .payload_type()
            .ok_or_else(|| Error::ProtocolViolation("empty packet".into()))?;
        let codec = self
            .registry
            .by_payload_type(pt)
            .ok_or(Error::UnknownPayloadType(pt))?;
        let info = self.registry.require(codec)?;
        let len = packet.data.payload_len();
        if len == 0 || len % info.wire_frame_len() != 0 {
            return Err(Error::ProtocolViolation(format!(
                "{} byte payload is not a whole number of {} frames",
                len, info.name
            )));
        }
        Ok(PacketShape {
            codec,
            units: len / info.wire_frame_len(),
            latency: self.latency(),
        })
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.group_ts = None;
        self.talkspurt_start = true;
    }

    fn set_parameters(&mut self, params: &str) -> Result<()> {
        let upp: usize = params
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid units per packet '{}'", params)))?;
        if !(1..=MAX_UNITS_PER_PACKET).contains(&upp) {
            return Err(Error::Configuration(format!(
                "units per packet must be 1..={}, got {}",
                MAX_UNITS_PER_PACKET, upp
            )));
        }
        self.units_per_packet = upp;
        self.reset();
        Ok(())
    }

    fn parameters(&self) -> String {
        self.units_per_packet.to_string()
    }

    fn latency(&self) -> Timestamp {
        Timestamp::zero(1000)
    }
}
