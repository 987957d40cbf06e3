//! Per-source counters

use serde::Serialize;

/// Receive statistics for one sender
///
/// Counters live in the sender's persistent entry and survive the decode
/// state being torn down during silence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets rejected as malformed or of unknown type
    pub packets_invalid: u64,
    pub packets_duplicate: u64,
    pub packets_misordered: u64,
    /// Packets that arrived after their playout time
    pub packets_late: u64,
    pub talkspurts: u64,
    pub reconfigurations: u64,
    pub playout_recomputes: u64,
    pub units_played: u64,
    pub units_repaired: u64,
    pub repair_failures: u64,
    /// Gaps passed to the mixer as nothing
    pub units_lost: u64,
    pub decode_errors: u64,
    pub skew_fast_corrections: u64,
    pub skew_slow_corrections: u64,
    pub samples_dropped: u64,
    pub samples_inserted: u64,
}

impl SourceStats {
    /// Fraction of played intervals that needed concealment
    pub fn repair_ratio(&self) -> f64 {
        let total = self.units_played + self.units_lost;
        if total == 0 {
            0.0
        } else {
            (self.units_repaired + self.units_lost) as f64 / total as f64
        }
    }
}
