//! Buffer management for the receive path
//!
//! Channel data (raw packet payloads) and media units (per-interval audio)
//! are both held in [`PlayoutBuffer`]s ordered by playout timestamp.

// Ordered timestamped buffer with relocating cursors
pub mod playout;
pub use playout::{CursorId, Iter, PlayoutBuffer, MAX_CURSORS};
