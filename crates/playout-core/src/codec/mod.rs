//! Codec collaborator interface
//!
//! The playout pipeline never looks inside a codec's bitstream; it only needs
//! the frame geometry ([`CodecInfo`]) and per-source encoder/decoder state.
//! Concrete codecs register with a [`CodecRegistry`], which hands out stable
//! [`CodecId`]s and resolves payload types and persisted names.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use tracing::debug;

use crate::audio::{AudioFormat, AudioFrame};
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::unit::CodedUnit;

pub mod linear;
pub use linear::{Linear16Codec, Linear8Codec};

/// Registry-assigned codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodecId(pub u16);

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec#{}", self.0)
    }
}

/// Native frame geometry of a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// Persisted name, e.g. `L16-8K-MONO`
    pub name: String,
    /// RTP payload type
    pub payload_type: u8,
    /// Format of decoded audio
    pub format: AudioFormat,
    /// Sample periods per frame
    pub samples_per_frame: usize,
    /// Encoded bytes per frame (excluding state)
    pub bytes_per_frame: usize,
    /// In-band state bytes preceding each frame (0 for stateless codecs)
    pub state_bytes: usize,
}

impl CodecInfo {
    /// Duration of one frame at the codec's sample rate
    pub fn frame_duration(&self) -> Timestamp {
        Timestamp::new(self.samples_per_frame as u64, self.format.sample_rate)
    }

    /// Bytes one frame occupies on the wire, state included
    pub fn wire_frame_len(&self) -> usize {
        self.state_bytes + self.bytes_per_frame
    }
}

/// A codec implementation
pub trait Codec: Send + Sync + Debug {
    /// Frame geometry and naming
    fn info(&self) -> &CodecInfo;

    /// Create fresh encoder state; units it produces carry `id`
    fn new_encoder(&self, id: CodecId) -> Box<dyn Encoder>;

    /// Create fresh decoder state
    fn new_decoder(&self) -> Box<dyn Decoder>;
}

/// Stateful encoder
pub trait Encoder: Send + Debug {
    fn encode(&mut self, frame: &AudioFrame) -> Result<CodedUnit>;

    fn reset(&mut self) {}
}

/// Stateful decoder
pub trait Decoder: Send + Debug {
    fn decode(&mut self, unit: &CodedUnit) -> Result<AudioFrame>;

    fn reset(&mut self) {}
}

/// Codec lookup by id, name and payload type
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the linear PCM reference codecs
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let mono_rates = [(8000, 0u8), (16000, 1), (32000, 2), (48000, 3)];
        let stereo_rates = [(8000, 4u8), (16000, 5), (48000, 6)];

        for (rate, slot) in mono_rates {
            registry.register_default(Arc::new(Linear16Codec::new(AudioFormat::mono(rate), 100 + slot)));
            registry.register_default(Arc::new(Linear8Codec::new(AudioFormat::mono(rate), 110 + slot)));
        }
        for (rate, slot) in stereo_rates {
            registry.register_default(Arc::new(Linear16Codec::new(AudioFormat::stereo(rate), 100 + slot)));
            registry.register_default(Arc::new(Linear8Codec::new(AudioFormat::stereo(rate), 110 + slot)));
        }
        registry
    }

    fn register_default(&mut self, codec: Arc<dyn Codec>) {
        // Built-in names and payload types are unique by construction.
        if let Err(e) = self.register(codec) {
            debug!("Skipping built-in codec: {}", e);
        }
    }

    /// Register a codec; names and payload types must be unique
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<CodecId> {
        let info = codec.info();
        if self.by_name(&info.name).is_some() {
            return Err(Error::Configuration(format!("codec {} already registered", info.name)));
        }
        if self.by_payload_type(info.payload_type).is_some() {
            return Err(Error::Configuration(format!(
                "payload type {} already registered",
                info.payload_type
            )));
        }
        if info.samples_per_frame == 0 || info.bytes_per_frame == 0 {
            return Err(Error::Configuration(format!("codec {} has an empty frame", info.name)));
        }

        let id = CodecId(self.codecs.len() as u16 + 1);
        debug!("Registered codec {} as {} (pt {})", info.name, id, info.payload_type);
        self.codecs.push(codec);
        Ok(id)
    }

    pub fn get(&self, id: CodecId) -> Option<&Arc<dyn Codec>> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.codecs.get(i))
    }

    pub fn info(&self, id: CodecId) -> Option<&CodecInfo> {
        self.get(id).map(|c| c.info())
    }

    /// Case-insensitive lookup by persisted name
    pub fn by_name(&self, name: &str) -> Option<CodecId> {
        self.codecs
            .iter()
            .position(|c| c.info().name.eq_ignore_ascii_case(name))
            .map(|i| CodecId(i as u16 + 1))
    }

    pub fn by_payload_type(&self, pt: u8) -> Option<CodecId> {
        self.codecs
            .iter()
            .position(|c| c.info().payload_type == pt)
            .map(|i| CodecId(i as u16 + 1))
    }

    /// Frame geometry, or a configuration error naming the unknown id
    pub fn require(&self, id: CodecId) -> Result<&CodecInfo> {
        self.info(id)
            .ok_or_else(|| Error::Configuration(format!("unknown {}", id)))
    }

    pub fn ids(&self) -> impl Iterator<Item = CodecId> + '_ {
        (1..=self.codecs.len()).map(|i| CodecId(i as u16))
    }

    /// Create an encoder for `id`
    pub fn encoder(&self, id: CodecId) -> Result<Box<dyn Encoder>> {
        self.get(id)
            .map(|c| c.new_encoder(id))
            .ok_or_else(|| Error::Codec(format!("unknown {}", id)))
    }
}

/// Per-source decoder state, created lazily per codec
pub struct CodecStateStore {
    registry: Arc<CodecRegistry>,
    decoders: HashMap<CodecId, Box<dyn Decoder>>,
}

impl CodecStateStore {
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self {
            registry,
            decoders: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    /// Decoder state for `id`, created on first use
    pub fn decoder(&mut self, id: CodecId) -> Result<&mut Box<dyn Decoder>> {
        if !self.decoders.contains_key(&id) {
            let codec = self
                .registry
                .get(id)
                .ok_or_else(|| Error::Codec(format!("no decoder for unknown {}", id)))?;
            self.decoders.insert(id, codec.new_decoder());
        }
        self.decoders
            .get_mut(&id)
            .ok_or_else(|| Error::Codec(format!("decoder state for {} missing", id)))
    }

    /// Decode one unit with this source's decoder state
    pub fn decode(&mut self, unit: &CodedUnit) -> Result<AudioFrame> {
        self.decoder(unit.codec)?.decode(unit)
    }

    /// Whether decoder state exists for `id`
    pub fn contains(&self, id: CodecId) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Drop all decoder state
    pub fn clear(&mut self) {
        self.decoders.clear();
    }
}

impl Debug for CodecStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecStateStore")
            .field("decoders", &self.decoders.len())
            .finish()
    }
}
