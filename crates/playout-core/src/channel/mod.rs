//! Loss-resilient channel coding
//!
//! A channel coder sits between the codec and the network. On the send side
//! it groups coded [`MediaUnit`]s into packets; on the receive side it turns
//! packets back into timestamped [`CodedUnit`]s, possibly with alternative
//! encodings and placeholders for units it knows are missing.
//!
//! Three schemes are provided:
//!
//! - [`VanillaCoder`]: several units per packet, no protection
//! - [`RedundancyCoder`]: RFC 2198 style piggybacked copies of earlier units
//! - [`InterleaverCoder`]: n1×n2 matrix interleaving so bursts become
//!   isolated single-unit losses
//!
//! [`ChannelCoder`] is the tagged union the pipeline holds; the variant is
//! chosen once at construction and only changes by building a new coder.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecId, CodecRegistry};
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::unit::{ChannelData, CodedUnit, MediaUnit};

pub mod header;
pub mod interleaver;
pub mod redundancy;
pub mod vanilla;

pub use header::{InterleaverHeader, RedundancyHeader};
pub use interleaver::InterleaverCoder;
pub use redundancy::RedundancyCoder;
pub use vanilla::VanillaCoder;

/// Default dynamic payload type for redundant packets
pub const DEFAULT_REDUNDANCY_PT: u8 = 121;

/// Default dynamic payload type for interleaved packets
pub const DEFAULT_INTERLEAVER_PT: u8 = 122;

/// Which channel coding scheme a stream uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelCoderKind {
    Vanilla,
    Redundancy,
    Interleaver,
}

impl ChannelCoderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelCoderKind::Vanilla => "vanilla",
            ChannelCoderKind::Redundancy => "redundancy",
            ChannelCoderKind::Interleaver => "interleaver",
        }
    }
}

impl fmt::Display for ChannelCoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChannelCoderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vanilla" | "none" => Ok(ChannelCoderKind::Vanilla),
            "redundancy" | "red" => Ok(ChannelCoderKind::Redundancy),
            "interleaver" | "interleaved" => Ok(ChannelCoderKind::Interleaver),
            other => Err(Error::Configuration(format!("unknown channel coder '{}'", other))),
        }
    }
}

/// Payload types announced for the non-vanilla schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPayloadTypes {
    pub redundancy: u8,
    pub interleaver: u8,
}

impl Default for ChannelPayloadTypes {
    fn default() -> Self {
        Self {
            redundancy: DEFAULT_REDUNDANCY_PT,
            interleaver: DEFAULT_INTERLEAVER_PT,
        }
    }
}

impl ChannelPayloadTypes {
    /// Scheme that produced a packet with this payload type
    ///
    /// Anything that is neither the redundancy nor the interleaver payload
    /// type must name a registered codec, carried vanilla.
    pub fn classify(&self, payload_type: u8, registry: &CodecRegistry) -> Result<ChannelCoderKind> {
        if payload_type == self.redundancy {
            Ok(ChannelCoderKind::Redundancy)
        } else if payload_type == self.interleaver {
            Ok(ChannelCoderKind::Interleaver)
        } else if registry.by_payload_type(payload_type).is_some() {
            Ok(ChannelCoderKind::Vanilla)
        } else {
            Err(Error::UnknownPayloadType(payload_type))
        }
    }
}

/// One packet produced by, or handed to, a channel coder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPacket {
    /// Timestamp of the first unit the packet describes
    pub ts: Timestamp,
    /// Set on the first packet of a talkspurt
    pub marker: bool,
    pub data: ChannelData,
}

impl ChannelPacket {
    pub fn new(ts: Timestamp, marker: bool, payload_type: u8, payload: Bytes) -> Self {
        Self {
            ts,
            marker,
            data: ChannelData::single(payload_type, payload),
        }
    }

    pub fn payload_type(&self) -> Option<u8> {
        self.data.payload_type()
    }

    pub fn payload(&self) -> Bytes {
        self.data.to_payload()
    }
}

/// A coded unit recovered from the channel, or a placeholder for one that
/// is known to be missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUnit {
    pub ts: Timestamp,
    /// `None` marks a placeholder
    pub unit: Option<CodedUnit>,
    /// Whether this is the primary encoding of the interval
    pub primary: bool,
}

impl DecodedUnit {
    pub fn primary(ts: Timestamp, unit: CodedUnit) -> Self {
        Self {
            ts,
            unit: Some(unit),
            primary: true,
        }
    }

    pub fn redundant(ts: Timestamp, unit: CodedUnit) -> Self {
        Self {
            ts,
            unit: Some(unit),
            primary: false,
        }
    }

    pub fn placeholder(ts: Timestamp) -> Self {
        Self {
            ts,
            unit: None,
            primary: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.unit.is_none()
    }
}

/// What a packet carries, as seen without decoding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketShape {
    /// Codec of the primary encoding
    pub codec: CodecId,
    /// Primary units in this packet
    pub units: usize,
    /// Extra playout delay the scheme needs for this stream
    pub latency: Timestamp,
}

/// Common contract of the channel coding schemes
pub trait ChannelCodec {
    fn kind(&self) -> ChannelCoderKind;

    /// Feed one media unit for the interval starting at `ts`
    ///
    /// A placeholder unit marks silence and closes any partially built
    /// group. Returns the packets that became ready.
    fn encode(&mut self, ts: Timestamp, unit: &MediaUnit) -> Result<Vec<ChannelPacket>>;

    /// Expand one received packet
    ///
    /// `packet.ts` is the local playout time of the packet's first unit.
    /// Schemes that hold units back (the interleaver) may return nothing now
    /// and release them from a later call or from [`ChannelCodec::flush`].
    fn decode(&mut self, packet: &ChannelPacket) -> Result<Vec<DecodedUnit>>;

    /// Release held-back units whose playout deadline is `now` or earlier
    fn flush(&mut self, _now: Timestamp) -> Vec<DecodedUnit> {
        Vec::new()
    }

    /// Inspect a packet without consuming it
    fn describe(&self, packet: &ChannelPacket) -> Result<PacketShape>;

    /// Discard all in-flight state
    fn reset(&mut self);

    /// Apply a persisted parameter string; on error the previous parameters
    /// are kept
    fn set_parameters(&mut self, params: &str) -> Result<()>;

    /// Current parameters in persisted form
    fn parameters(&self) -> String;

    /// Extra playout delay this scheme needs
    fn latency(&self) -> Timestamp;
}

/// Interval covered by `n` frames of a codec, at that codec's clock
pub(crate) fn frame_span(registry: &CodecRegistry, codec: CodecId, n: usize) -> Result<Timestamp> {
    Ok(registry.require(codec)?.frame_duration().scale(n as u64))
}

/// Split a block into coded units of one codec's wire frame size
pub(crate) fn split_frames(registry: &CodecRegistry, codec: CodecId, block: &Bytes) -> Result<Vec<CodedUnit>> {
    let info = registry.require(codec)?;
    let frame_len = info.wire_frame_len();
    if block.is_empty() || block.len() % frame_len != 0 {
        return Err(Error::ProtocolViolation(format!(
            "{} byte block is not a whole number of {} byte {} frames",
            block.len(),
            frame_len,
            info.name
        )));
    }
    let units = (0..block.len() / frame_len)
        .map(|i| {
            let frame = block.slice(i * frame_len..(i + 1) * frame_len);
            if info.state_bytes > 0 {
                CodedUnit::with_state(codec, frame.slice(..info.state_bytes), frame.slice(info.state_bytes..))
            } else {
                CodedUnit::new(codec, frame)
            }
        })
        .collect();
    Ok(units)
}

/// Append a unit's wire form (state, then data)
pub(crate) fn put_unit(buf: &mut bytes::BytesMut, unit: &CodedUnit) {
    if let Some(state) = &unit.state {
        buf.extend_from_slice(state);
    }
    buf.extend_from_slice(&unit.data);
}

/// The channel coder a source or sender uses
#[derive(Debug)]
pub enum ChannelCoder {
    Vanilla(VanillaCoder),
    Redundancy(RedundancyCoder),
    Interleaver(InterleaverCoder),
}

impl ChannelCoder {
    /// Build a coder with default parameters
    pub fn new(kind: ChannelCoderKind, registry: Arc<CodecRegistry>, payload_types: ChannelPayloadTypes) -> Self {
        match kind {
            ChannelCoderKind::Vanilla => ChannelCoder::Vanilla(VanillaCoder::new(registry)),
            ChannelCoderKind::Redundancy => {
                ChannelCoder::Redundancy(RedundancyCoder::new(registry, payload_types.redundancy))
            }
            ChannelCoderKind::Interleaver => {
                ChannelCoder::Interleaver(InterleaverCoder::new(registry, payload_types.interleaver))
            }
        }
    }

    /// Build a coder and apply a persisted parameter string
    pub fn with_parameters(
        kind: ChannelCoderKind,
        registry: Arc<CodecRegistry>,
        payload_types: ChannelPayloadTypes,
        params: &str,
    ) -> Result<Self> {
        let mut coder = Self::new(kind, registry, payload_types);
        coder.set_parameters(params)?;
        Ok(coder)
    }

    fn inner(&self) -> &dyn ChannelCodec {
        match self {
            ChannelCoder::Vanilla(c) => c,
            ChannelCoder::Redundancy(c) => c,
            ChannelCoder::Interleaver(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ChannelCodec {
        match self {
            ChannelCoder::Vanilla(c) => c,
            ChannelCoder::Redundancy(c) => c,
            ChannelCoder::Interleaver(c) => c,
        }
    }
}

impl ChannelCodec for ChannelCoder {
    fn kind(&self) -> ChannelCoderKind {
        self.inner().kind()
    }

    fn encode(&mut self, ts: Timestamp, unit: &MediaUnit) -> Result<Vec<ChannelPacket>> {
        self.inner_mut().encode(ts, unit)
    }

    fn decode(&mut self, packet: &ChannelPacket) -> Result<Vec<DecodedUnit>> {
        self.inner_mut().decode(packet)
    }

    fn flush(&mut self, now: Timestamp) -> Vec<DecodedUnit> {
        self.inner_mut().flush(now)
    }

    fn describe(&self, packet: &ChannelPacket) -> Result<PacketShape> {
        self.inner().describe(packet)
    }

    fn reset(&mut self) {
        self.inner_mut().reset()
    }

    fn set_parameters(&mut self, params: &str) -> Result<()> {
        self.inner_mut().set_parameters(params)
    }

    fn parameters(&self) -> String {
        self.inner().parameters()
    }

    fn latency(&self) -> Timestamp {
        self.inner().latency()
    }
}
