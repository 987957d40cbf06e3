//! Redundant audio data (RFC 2198 style)
//!
//! Every packet carries the primary encoding of the current unit(s) plus
//! copies of earlier units, usually in a cheaper codec. A packet lost in
//! transit can then be rebuilt from the redundant layer of a later packet,
//! at the cost of a playout delay covering the largest offset.
//!
//! Layers are configured as `"<codec>/<offset>/<codec>/<offset>..."`, where
//! the first layer is the primary (offset 0) and offsets are counted in
//! units. On the wire the offset is the RTP timestamp distance in samples.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::header::{RedundancyHeader, MAX_PAYLOAD_TYPE, MAX_RED_BLOCK_LEN, MAX_RED_OFFSET};
use super::{frame_span, put_unit, split_frames, ChannelCodec, ChannelCoderKind, ChannelPacket, DecodedUnit, PacketShape};
use crate::codec::{CodecId, CodecRegistry};
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::unit::{CodedUnit, MediaUnit};

/// Largest number of layers (primary included)
pub const MAX_LAYERS: usize = 4;

/// One configured encoding layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub codec: CodecId,
    /// Distance from the primary, in units
    pub offset: usize,
}

#[derive(Debug)]
pub struct RedundancyCoder {
    registry: Arc<CodecRegistry>,
    payload_type: u8,
    layers: Vec<Layer>,
    units_per_packet: usize,
    /// Recent units, oldest first, for building redundant layers
    history: VecDeque<MediaUnit>,
    pending: usize,
    group_ts: Option<Timestamp>,
    talkspurt_start: bool,
    /// Largest offset seen by the decoder, as a timestamp interval
    rx_latency: Timestamp,
}

struct Block {
    header: RedundancyHeader,
    data: bytes::Bytes,
}

impl RedundancyCoder {
    pub fn new(registry: Arc<CodecRegistry>, payload_type: u8) -> Self {
        Self {
            registry,
            payload_type,
            layers: Vec::new(),
            units_per_packet: 1,
            history: VecDeque::new(),
            pending: 0,
            group_ts: None,
            talkspurt_start: true,
            rx_latency: Timestamp::zero(1000),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn units_per_packet(&self) -> usize {
        self.units_per_packet
    }

    /// Units of each block; offsets must stay multiples of this
    pub fn set_units_per_packet(&mut self, units: usize) -> Result<()> {
        let layers = self.layers.clone();
        self.validate(&layers, units)?;
        self.units_per_packet = units;
        self.reset();
        Ok(())
    }

    fn parse_layers(&self, params: &str) -> Result<Vec<Layer>> {
        let fields: Vec<&str> = params.trim().split('/').collect();
        if fields.len() < 2 || fields.len() % 2 != 0 {
            return Err(Error::Configuration(format!(
                "redundancy parameters must be codec/offset pairs, got '{}'",
                params
            )));
        }
        fields
            .chunks_exact(2)
            .map(|pair| {
                let codec = self
                    .registry
                    .by_name(pair[0])
                    .ok_or_else(|| Error::Configuration(format!("unknown codec '{}'", pair[0])))?;
                let offset = pair[1]
                    .parse()
                    .map_err(|_| Error::Configuration(format!("invalid offset '{}'", pair[1])))?;
                Ok(Layer { codec, offset })
            })
            .collect()
    }

    /// Check that every layer fits the wire format
    fn validate(&self, layers: &[Layer], units_per_packet: usize) -> Result<()> {
        if units_per_packet == 0 {
            return Err(Error::Configuration("units per packet must be positive".into()));
        }
        if layers.len() > MAX_LAYERS {
            return Err(Error::Configuration(format!("at most {} layers", MAX_LAYERS)));
        }
        let primary = match layers.first() {
            Some(primary) => primary,
            None => return Ok(()),
        };
        if primary.offset != 0 {
            return Err(Error::Configuration("primary layer must have offset 0".into()));
        }
        let primary_info = self.registry.require(primary.codec)?;

        let mut previous: Option<usize> = None;
        for layer in layers {
            if previous.is_some_and(|p| layer.offset <= p) {
                return Err(Error::Configuration("layer offsets must be strictly increasing".into()));
            }
            previous = Some(layer.offset);

            let info = self.registry.require(layer.codec)?;
            if info.format.sample_rate != primary_info.format.sample_rate
                || info.samples_per_frame != primary_info.samples_per_frame
            {
                return Err(Error::Configuration(format!(
                    "{} does not share {}'s frame timing",
                    info.name, primary_info.name
                )));
            }
            if info.payload_type > MAX_PAYLOAD_TYPE {
                return Err(Error::Configuration(format!(
                    "{} payload type {} does not fit in 7 bits",
                    info.name, info.payload_type
                )));
            }
            if layer.offset % units_per_packet != 0 {
                return Err(Error::Configuration(format!(
                    "offset {} is not a multiple of {} units per packet",
                    layer.offset, units_per_packet
                )));
            }
            let samples = layer.offset as u64 * primary_info.samples_per_frame as u64;
            if samples > MAX_RED_OFFSET as u64 {
                return Err(Error::Configuration(format!(
                    "offset of {} samples exceeds {}",
                    samples, MAX_RED_OFFSET
                )));
            }
            let block_len = units_per_packet * info.wire_frame_len();
            if block_len > MAX_RED_BLOCK_LEN {
                return Err(Error::Configuration(format!(
                    "{} byte {} block exceeds {}",
                    block_len, info.name, MAX_RED_BLOCK_LEN
                )));
            }
        }
        Ok(())
    }

    fn max_offset(&self) -> usize {
        self.layers.last().map_or(0, |l| l.offset)
    }

    /// The coded units of `codec` for the `count` units ending `back` units
    /// before the newest one, or `None` if any is unavailable
    fn collect_units(&self, codec: CodecId, back: usize, count: usize) -> Option<Vec<CodedUnit>> {
        let end = self.history.len().checked_sub(back)?;
        let start = end.checked_sub(count)?;
        self.history
            .range(start..end)
            .map(|unit| unit.coded_for(codec).cloned())
            .collect()
    }

    fn emit(&mut self) -> Result<Option<ChannelPacket>> {
        let ts = match self.group_ts {
            Some(ts) if self.pending > 0 => ts,
            _ => return Ok(None),
        };
        let count = self.pending;
        self.pending = 0;
        self.group_ts = None;

        let primary = self.layers[0];
        let primary_units = self.collect_units(primary.codec, 0, count).ok_or_else(|| {
            Error::Codec(format!("unit lacks a primary {} encoding", primary.codec))
        })?;
        let samples_per_frame = self.registry.require(primary.codec)?.samples_per_frame;

        // Oldest layer first; the primary block always comes last.
        let mut headers = BytesMut::new();
        let mut body = BytesMut::new();
        for layer in self.layers[1..].iter().rev() {
            // Without history the layer still goes out, empty, so the
            // receiver learns the offset from the first packet.
            let mut block = BytesMut::new();
            if let Some(units) = self.collect_units(layer.codec, layer.offset, count) {
                units.iter().for_each(|u| put_unit(&mut block, u));
            }
            RedundancyHeader::Extension {
                payload_type: self.registry.require(layer.codec)?.payload_type,
                ts_offset: (layer.offset * samples_per_frame) as u32,
                length: block.len(),
            }
            .serialize(&mut headers)?;
            body.extend_from_slice(&block);
        }
        RedundancyHeader::Primary {
            payload_type: self.registry.require(primary.codec)?.payload_type,
        }
        .serialize(&mut headers)?;
        primary_units.iter().for_each(|u| put_unit(&mut body, u));

        headers.extend_from_slice(&body);
        let packet = ChannelPacket::new(ts, self.talkspurt_start, self.payload_type, headers.freeze());
        self.talkspurt_start = false;
        trace!("Redundant packet at {} ({} bytes)", ts, packet.data.payload_len());
        Ok(Some(packet))
    }

    fn parse(&self, packet: &ChannelPacket) -> Result<Vec<Block>> {
        let mut payload = packet.payload();
        let headers = RedundancyHeader::parse_chain(&mut payload)?;

        let mut blocks = Vec::with_capacity(headers.len());
        for header in headers {
            let data = match header {
                RedundancyHeader::Extension { length, .. } => {
                    if payload.remaining() < length {
                        return Err(Error::truncated(length, payload.remaining()));
                    }
                    payload.split_to(length)
                }
                RedundancyHeader::Primary { .. } => std::mem::take(&mut payload),
            };
            blocks.push(Block { header, data });
        }
        Ok(blocks)
    }

    /// Primary codec and its frame duration, from the final header
    fn primary_of(&self, blocks: &[Block]) -> Result<(CodecId, Timestamp)> {
        let pt = blocks
            .last()
            .map(|b| b.header.payload_type())
            .ok_or_else(|| Error::ProtocolViolation("no primary block".into()))?;
        let codec = self
            .registry
            .by_payload_type(pt)
            .ok_or(Error::UnknownPayloadType(pt))?;
        Ok((codec, frame_span(&self.registry, codec, 1)?))
    }
}

impl ChannelCodec for RedundancyCoder {
    fn kind(&self) -> ChannelCoderKind {
        ChannelCoderKind::Redundancy
    }

    fn encode(&mut self, ts: Timestamp, unit: &MediaUnit) -> Result<Vec<ChannelPacket>> {
        if self.layers.is_empty() {
            return Err(Error::Configuration("redundancy layers not configured".into()));
        }
        let mut out = Vec::new();
        if unit.is_placeholder() {
            out.extend(self.emit()?);
            self.history.clear();
            self.talkspurt_start = true;
            return Ok(out);
        }

        self.history.push_back(unit.clone());
        while self.history.len() > self.max_offset() + self.units_per_packet {
            self.history.pop_front();
        }
        if self.pending == 0 {
            self.group_ts = Some(ts);
        }
        self.pending += 1;
        if self.pending >= self.units_per_packet {
            out.extend(self.emit()?);
        }
        Ok(out)
    }

    fn decode(&mut self, packet: &ChannelPacket) -> Result<Vec<DecodedUnit>> {
        let blocks = self.parse(packet)?;
        let (primary_codec, primary_step) = self.primary_of(&blocks)?;
        let primary_rate = primary_step.freq();

        let mut out = Vec::new();
        let mut max_offset = 0;
        for block in &blocks {
            let (pt, offset, is_primary) = match block.header {
                RedundancyHeader::Extension {
                    payload_type,
                    ts_offset,
                    ..
                } => (payload_type, ts_offset, false),
                RedundancyHeader::Primary { payload_type } => (payload_type, 0, true),
            };
            max_offset = max_offset.max(offset);
            if !is_primary && block.data.is_empty() {
                continue;
            }

            let codec = match self.registry.by_payload_type(pt) {
                Some(codec) => codec,
                None => {
                    debug!("Skipping redundant layer with unknown payload type {}", pt);
                    continue;
                }
            };
            let units = match split_frames(&self.registry, codec, &block.data) {
                Ok(units) => units,
                Err(e) if !is_primary => {
                    debug!("Skipping malformed redundant layer: {}", e);
                    continue;
                }
                // An empty primary block is allowed; anything else is malformed.
                Err(_) if block.data.is_empty() => continue,
                Err(e) => return Err(e),
            };

            let base = packet.ts - Timestamp::new(offset as u64, primary_rate);
            let step = frame_span(&self.registry, codec, 1)?;
            for (i, unit) in units.into_iter().enumerate() {
                let ts = base + step.scale(i as u64);
                out.push(if is_primary {
                    DecodedUnit::primary(ts, unit)
                } else {
                    DecodedUnit::redundant(ts, unit)
                });
            }
        }

        self.rx_latency = Timestamp::new(max_offset as u64, primary_rate);
        trace!(
            "Redundant packet at {} gave {} units ({} primary)",
            packet.ts,
            out.len(),
            primary_codec
        );
        Ok(out)
    }

    fn describe(&self, packet: &ChannelPacket) -> Result<PacketShape> {
        let blocks = self.parse(packet)?;
        let (codec, step) = self.primary_of(&blocks)?;
        let info = self.registry.require(codec)?;
        let primary_len = blocks.last().map_or(0, |b| b.data.len());
        if primary_len % info.wire_frame_len() != 0 {
            return Err(Error::ProtocolViolation(format!(
                "{} byte primary block is not a whole number of {} frames",
                primary_len, info.name
            )));
        }
        let max_offset = blocks
            .iter()
            .map(|b| match b.header {
                RedundancyHeader::Extension { ts_offset, .. } => ts_offset,
                RedundancyHeader::Primary { .. } => 0,
            })
            .max()
            .unwrap_or(0);
        Ok(PacketShape {
            codec,
            units: primary_len / info.wire_frame_len(),
            latency: Timestamp::new(max_offset as u64, step.freq()),
        })
    }

    fn reset(&mut self) {
        self.history.clear();
        self.pending = 0;
        self.group_ts = None;
        self.talkspurt_start = true;
    }

    fn set_parameters(&mut self, params: &str) -> Result<()> {
        let layers = self.parse_layers(params)?;
        self.validate(&layers, self.units_per_packet)?;
        debug!("Redundancy layers set to {}", params.trim());
        self.layers = layers;
        self.reset();
        Ok(())
    }

    fn parameters(&self) -> String {
        self.layers
            .iter()
            .map(|layer| {
                let name = self
                    .registry
                    .info(layer.codec)
                    .map_or_else(|| layer.codec.to_string(), |i| i.name.clone());
                format!("{}/{}", name, layer.offset)
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn latency(&self) -> Timestamp {
        match self.layers.first().and_then(|l| self.registry.info(l.codec)) {
            Some(info) => info.frame_duration().scale(self.max_offset() as u64),
            None => self.rx_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Fixture {
        coder: RedundancyCoder,
        l16: CodecId,
        l8: CodecId,
    }

    fn fixture(params: &str) -> Fixture {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let l16 = registry.by_name("L16-8K-MONO").unwrap();
        let l8 = registry.by_name("L8-8K-MONO").unwrap();
        let mut coder = RedundancyCoder::new(registry, 121);
        coder.set_parameters(params).unwrap();
        Fixture { coder, l16, l8 }
    }

    fn unit(f: &Fixture, n: u8) -> MediaUnit {
        let mut unit = MediaUnit::coded(CodedUnit::new(f.l16, Bytes::from(vec![n; 320])));
        unit.add_redundant(CodedUnit::new(f.l8, Bytes::from(vec![n; 160])));
        unit
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n * 160, 8000)
    }

    #[test]
    fn test_parameters_round_trip() {
        let f = fixture("l16-8k-mono/0/L8-8K-MONO/2");
        assert_eq!(f.coder.parameters(), "L16-8K-MONO/0/L8-8K-MONO/2");
        assert_eq!(f.coder.layers().len(), 2);
        assert_eq!(f.coder.latency(), Timestamp::new(320, 8000));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut f = fixture("L16-8K-MONO/0/L8-8K-MONO/1");
        for bad in [
            "L16-8K-MONO/1",
            "L16-8K-MONO/0/L8-8K-MONO/0",
            "L16-8K-MONO/0/G729/1",
            "L16-8K-MONO/0/L8-8K-MONO",
            "L16-8K-MONO/0/L8-16K-MONO/1",
            // 103 * 160 samples overflows the 14-bit offset
            "L16-8K-MONO/0/L8-8K-MONO/103",
        ] {
            assert!(
                matches!(f.coder.set_parameters(bad), Err(Error::Configuration(_))),
                "accepted {}",
                bad
            );
        }
        // Offset 1 is not a whole number of 2-unit packets
        assert!(f.coder.set_units_per_packet(2).is_err());
        f.coder.set_parameters("L16-8K-MONO/0/L8-8K-MONO/4").unwrap();
        // 4 L16 frames = 1280 bytes, over the 10-bit block length
        assert!(f.coder.set_units_per_packet(4).is_err());
        f.coder.set_parameters("L16-8K-MONO/0/L8-8K-MONO/1").unwrap();
        assert_eq!(f.coder.parameters(), "L16-8K-MONO/0/L8-8K-MONO/1");
        assert_eq!(f.coder.units_per_packet(), 1);
    }

    #[test]
    fn test_round_trip_without_loss() {
        let mut f = fixture("L16-8K-MONO/0/L8-8K-MONO/2");
        let mut packets = Vec::new();
        for n in 0..5u8 {
            let u = unit(&f, n);
            packets.extend(f.coder.encode(ts(n as u64), &u).unwrap());
        }
        assert_eq!(packets.len(), 5);
        assert!(packets[0].marker);
        // The first two packets have no history to draw on, but still
        // announce the layer.
        assert_eq!(packets[0].data.payload_len(), 4 + 1 + 320);
        assert_eq!(packets[2].data.payload_len(), 4 + 1 + 160 + 320);
        assert_eq!(f.coder.describe(&packets[0]).unwrap().latency, Timestamp::new(320, 8000));
        assert_eq!(f.coder.decode(&packets[0]).unwrap().len(), 1);

        let decoded = f.coder.decode(&packets[4]).unwrap();
        assert_eq!(decoded.len(), 2);
        let primary = decoded.iter().find(|d| d.primary).unwrap();
        assert_eq!(primary.ts, ts(4));
        assert_eq!(primary.unit.as_ref().unwrap().data, Bytes::from(vec![4u8; 320]));
        let redundant = decoded.iter().find(|d| !d.primary).unwrap();
        assert_eq!(redundant.ts, ts(2));
        assert_eq!(redundant.unit.as_ref().unwrap().codec, f.l8);
        assert_eq!(redundant.unit.as_ref().unwrap().data, Bytes::from(vec![2u8; 160]));
        assert_eq!(f.coder.describe(&packets[4]).unwrap().latency, Timestamp::new(320, 8000));
    }

    #[test]
    fn test_unknown_redundant_layer_skipped() {
        let f = fixture("L16-8K-MONO/0");
        let mut coder = f.coder;
        let mut payload = BytesMut::new();
        RedundancyHeader::Extension {
            payload_type: 77,
            ts_offset: 160,
            length: 10,
        }
        .serialize(&mut payload)
        .unwrap();
        RedundancyHeader::Primary { payload_type: 100 }
            .serialize(&mut payload)
            .unwrap();
        payload.extend_from_slice(&[0xab; 10]);
        payload.extend_from_slice(&[0x01; 320]);

        let packet = ChannelPacket::new(ts(1), false, 121, payload.freeze());
        let decoded = coder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].primary);
        assert_eq!(decoded[0].ts, ts(1));
    }

    #[test]
    fn test_truncated_block_aborts_packet() {
        let f = fixture("L16-8K-MONO/0");
        let mut coder = f.coder;
        let mut payload = BytesMut::new();
        RedundancyHeader::Extension {
            payload_type: 110,
            ts_offset: 160,
            length: 160,
        }
        .serialize(&mut payload)
        .unwrap();
        RedundancyHeader::Primary { payload_type: 100 }
            .serialize(&mut payload)
            .unwrap();
        payload.extend_from_slice(&[0; 50]);
        let packet = ChannelPacket::new(ts(1), false, 121, payload.freeze());
        assert!(coder.decode(&packet).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_encode_requires_configuration() {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let mut coder = RedundancyCoder::new(registry, 121);
        assert!(matches!(
            coder.encode(ts(0), &MediaUnit::placeholder()),
            Err(Error::Configuration(_))
        ));
    }
}
