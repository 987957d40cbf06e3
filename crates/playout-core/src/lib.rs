//! # Playout-Core: Receive-Side Audio Pipeline for Conferencing
//!
//! This crate turns a stream of RTP audio packets from many senders into
//! correctly timed, loss-repaired, skew-corrected audio for a mixer.
//!
//! ## Pipeline
//!
//! For every sender (identified by SSRC) a [`source::Source`] runs, once per
//! service tick:
//!
//! 1. packet validation, talkspurt and reconfiguration detection, and
//!    adaptive playout delay ([`playout::PlayoutDelayEstimator`]);
//! 2. channel decoding: plain, RFC 2198 redundancy, or matrix interleaving
//!    ([`channel`]);
//! 3. codec decoding, loss repair ([`repair`]), clock skew correction
//!    ([`skew`]), format conversion ([`convert`]) and optional spatial
//!    rendering ([`render`]);
//! 4. hand-off to the [`mixer::Mixer`] at each unit's playout time.
//!
//! The [`source::SourceManager`] owns all sources and their persistent
//! statistics.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use voxmesh_playout_core::prelude::*;
//!
//! let registry = Arc::new(CodecRegistry::with_defaults());
//! let mut manager = SourceManager::new(PipelineConfig::default(), registry)?;
//! let mut mixer = RecordingMixer::new();
//!
//! // One 20 ms L16 frame (payload type 100) from sender 0x1234
//! let info = RtpPacketInfo::new(0x1234, 1, 0, 100, Timestamp::new(80, 8000));
//! manager.enqueue(info, Bytes::from(vec![0u8; 320]))?;
//!
//! let mut t = 0;
//! while t < 1600 {
//!     manager.tick(Timestamp::new(t, 8000), Timestamp::new(t + 160, 8000), &mut mixer);
//!     t += 160;
//! }
//! assert_eq!(manager.stats(0x1234).map(|s| s.units_played), Some(1));
//! # Ok::<(), voxmesh_playout_core::Error>(())
//! ```
//!
//! Timestamps are sample-clock values tagged with their frequency; see
//! [`time::Timestamp`].

pub mod audio;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod convert;
pub mod error;
pub mod mixer;
pub mod playout;
pub mod render;
pub mod repair;
pub mod skew;
pub mod source;
pub mod stats;
pub mod time;
pub mod unit;

// Re-export commonly used types
pub use audio::{AudioFormat, AudioFrame, Sample};
pub use buffer::{CursorId, PlayoutBuffer};
pub use channel::{ChannelCodec, ChannelCoder, ChannelCoderKind, ChannelPacket, ChannelPayloadTypes};
pub use codec::{CodecId, CodecInfo, CodecRegistry, CodecStateStore};
pub use config::{PipelineConfig, PlayoutConfig, RepairConfig, RepairScheme, SkewConfig};
pub use error::{Error, Result};
pub use source::{RtpPacketInfo, Source, SourceManager};
pub use stats::SourceStats;
pub use time::Timestamp;

/// Version information for the playout library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::audio::{AudioFormat, AudioFrame};
    pub use crate::channel::{ChannelCodec, ChannelCoder, ChannelCoderKind, ChannelPayloadTypes};
    pub use crate::codec::{CodecId, CodecRegistry};
    pub use crate::config::{PipelineConfig, RepairScheme};
    pub use crate::convert::{Converter, LinearConverter};
    pub use crate::error::{Error, Result};
    pub use crate::mixer::{Mixer, RecordingMixer, SummingMixer};
    pub use crate::render::{Spatializer, StereoPanner};
    pub use crate::source::{ParticipantStore, RtpPacketInfo, SourceManager};
    pub use crate::stats::SourceStats;
    pub use crate::time::Timestamp;
    pub use crate::unit::{CodedUnit, MediaUnit};
}
