use thiserror::Error;

/// Result type for playout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the receive-side playout pipeline
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or truncated packet/header, field overflow on the wire
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Buffer too small to hold a header or payload block
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall {
        required: usize,
        available: usize,
    },

    /// Payload type that no registered codec or channel coder claims
    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u8),

    /// Rejected configuration (bad codec name, out-of-range offset or dimension)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fixed-capacity resource exhausted (cursor registry, etc.)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Loss concealment could not produce a replacement
    #[error("Repair failed: {0}")]
    RepairFailed(String),

    /// Codec encode/decode failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Sample rate or channel conversion failure
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A node with the same timestamp is already buffered
    #[error("Duplicate timestamp")]
    DuplicateTimestamp,

    /// Cursor handle does not refer to a live cursor of this buffer
    #[error("Invalid cursor")]
    InvalidCursor,

    /// No source with this SSRC
    #[error("Source not found: {0:#010x}")]
    SourceNotFound(u32),
}

impl Error {
    /// Whether this error means the packet or unit should be dropped and counted
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::BufferTooSmall { .. } | Error::UnknownPayloadType(_)
        )
    }

    /// Whether the decode path can continue after this error
    ///
    /// Configuration and resource errors are surfaced to the caller; everything
    /// else only costs one unit of audio.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Configuration(_) | Error::ResourceExhausted(_) | Error::InvalidCursor
        )
    }

    pub(crate) fn truncated(required: usize, available: usize) -> Self {
        Error::BufferTooSmall { required, available }
    }
}
