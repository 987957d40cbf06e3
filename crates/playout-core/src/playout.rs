//! Adaptive playout delay
//!
//! The playout offset maps sender time to local playout time. It is fixed
//! for the duration of a talkspurt, so that units play back at exactly the
//! rate they were captured; only silence (or a run of late packets) gives
//! an opportunity to adapt it to the network's current jitter.
//!
//! Jitter follows the RTP interarrival estimate, with a gain of 1/8:
//!
//! ```text
//! J = (7·J + |transit − last_transit|) / 8
//! ```

use tracing::{debug, trace};

use crate::config::PlayoutConfig;
use crate::source::participant::PersistentSourceEntry;
use crate::time::Timestamp;

/// Timing of one arriving packet
#[derive(Debug, Clone, Copy)]
pub struct PacketTiming {
    /// Sender timestamp on the codec clock
    pub src_ts: Timestamp,
    /// Local arrival time
    pub arrival: Timestamp,
    /// Interval between this packet and the previous one at the sender
    pub gap: Timestamp,
    pub talkspurt_start: bool,
}

/// Why the playout offset was recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeReason {
    TalkspurtStart,
    LateRun,
    /// The offset in force would have scheduled the packet in the past
    PastDeadline,
}

/// Outcome of feeding one packet to the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutDecision {
    /// Local playout time of the packet's first unit
    pub playout: Timestamp,
    pub recomputed: Option<RecomputeReason>,
}

/// Computes per-source playout times from jitter statistics
#[derive(Debug, Clone)]
pub struct PlayoutDelayEstimator {
    config: PlayoutConfig,
}

impl PlayoutDelayEstimator {
    pub fn new(config: PlayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlayoutConfig {
        &self.config
    }

    /// Update the entry's statistics and return the packet's playout time
    ///
    /// `latency` is the extra delay the channel coder needs to reassemble
    /// units (redundancy offset or interleave period).
    pub fn update(
        &self,
        entry: &mut PersistentSourceEntry,
        timing: PacketTiming,
        latency: Timestamp,
    ) -> PlayoutDecision {
        let freq = timing.src_ts.freq();
        let transit = timing.arrival.convert(freq) - timing.src_ts;

        if timing.talkspurt_start {
            entry.jitter = Timestamp::from_millis(self.config.initial_jitter_ms as u64, freq).ticks() as f64;
            entry.avg_transit = transit;
        } else {
            let delta = transit.abs_diff(&entry.last_transit.convert(freq)).ticks() as f64;
            let jitter = entry.jitter * freq as f64 / entry.transit.freq() as f64;
            entry.jitter = (7.0 * jitter + delta) / 8.0;

            let avg = entry.avg_transit.convert(freq);
            entry.avg_transit = avg.add_ticks(transit.signed_delta(&avg) / 16);
        }
        entry.transit = transit;
        entry.last_transit = transit;
        entry.last_gap = timing.gap.convert(freq);

        let mut recomputed = if timing.talkspurt_start {
            Some(RecomputeReason::TalkspurtStart)
        } else if entry.force_recompute {
            Some(RecomputeReason::LateRun)
        } else {
            None
        };
        if recomputed.is_some() {
            self.recompute(entry, latency);
        }

        let mut playout = timing.src_ts + entry.playout.convert(freq);
        if playout.is_before(&timing.arrival) {
            self.recompute(entry, latency);
            recomputed = Some(RecomputeReason::PastDeadline);
            playout = timing.src_ts + entry.playout;
        }

        if let Some(reason) = recomputed {
            debug!(
                "Source {:#010x} playout offset {} ({:?}, jitter {:.1} ms, desired {} ms)",
                entry.ssrc,
                entry.playout,
                reason,
                entry.jitter_ms(),
                entry.desired_delay.as_millis()
            );
        } else {
            trace!("Source {:#010x} packet {} plays at {}", entry.ssrc, timing.src_ts, playout);
        }
        PlayoutDecision { playout, recomputed }
    }

    /// `playout = transit + max(variable, jitter) + latency`
    fn recompute(&self, entry: &mut PersistentSourceEntry, latency: Timestamp) {
        let freq = entry.transit.freq();
        let cushion = Timestamp::from_millis(self.config.cushion_ms as u64, freq);
        let cushion = cushion.scale(3).ticks() / 2;
        let min = Timestamp::from_millis(self.config.min_playout_ms as u64, freq).ticks();
        let max = Timestamp::from_millis(self.config.max_playout_ms as u64, freq).ticks();

        let variable = entry.last_gap.ticks().max(cushion).max(min).min(max);
        let jitter = entry.jitter.round() as u64;
        let delay = Timestamp::new(variable.max(jitter), freq) + latency;

        entry.desired_delay = delay;
        entry.playout = entry.transit + delay;
        entry.consecutive_late = 0;
        entry.force_recompute = false;
        entry.stats.playout_recomputes += 1;
    }

    /// Record a packet that missed its playout time
    ///
    /// Returns `true` once enough consecutive late packets have been seen
    /// that the next packet will recompute the playout offset.
    pub fn note_late(&self, entry: &mut PersistentSourceEntry) -> bool {
        entry.consecutive_late += 1;
        entry.stats.packets_late += 1;
        if entry.consecutive_late >= self.config.late_recompute_threshold {
            debug!(
                "Source {:#010x}: {} late packets in a row, forcing playout recompute",
                entry.ssrc, entry.consecutive_late
            );
            entry.force_recompute = true;
            entry.consecutive_late = 0;
            return true;
        }
        false
    }

    /// Record a packet that arrived in time
    pub fn note_on_time(&self, entry: &mut PersistentSourceEntry) {
        entry.consecutive_late = 0;
    }

    /// Current buffering beyond the desired delay (positive when the
    /// sender's clock runs ahead and the buffer over-fills)
    pub fn discrepancy(entry: &PersistentSourceEntry) -> i64 {
        let freq = entry.playout.freq();
        let buffered = entry.playout - entry.avg_transit.convert(freq);
        buffered.signed_delta(&entry.desired_delay.convert(freq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn timing(n: u64, arrival: u64, start: bool) -> PacketTiming {
        PacketTiming {
            src_ts: Timestamp::new(n * 160, 8000),
            arrival: Timestamp::new(arrival, 8000),
            gap: Timestamp::new(160, 8000),
            talkspurt_start: start,
        }
    }

    fn latency() -> Timestamp {
        Timestamp::zero(8000)
    }

    #[test]
    fn test_talkspurt_start_sets_offset() {
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        // Transit 400 ticks; cushion 40 ms -> 1.5 × 320 = 480 ticks
        let decision = estimator.update(&mut entry, timing(0, 400, true), latency());
        assert_eq!(decision.recomputed, Some(RecomputeReason::TalkspurtStart));
        assert_eq!(entry.desired_delay.ticks(), 480);
        assert_eq!(decision.playout.ticks(), 880);
        assert_eq!(entry.jitter, 40.0);
    }

    #[test]
    fn test_offset_fixed_within_talkspurt() {
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        estimator.update(&mut entry, timing(0, 400, true), latency());
        let offset = entry.playout;
        let decision = estimator.update(&mut entry, timing(1, 160 + 480, false), latency());
        assert_eq!(decision.recomputed, None);
        assert_eq!(entry.playout, offset);
        assert_eq!(decision.playout.ticks(), 160 + 880);
        // (7 × 40 + 80) / 8
        assert_eq!(entry.jitter, 45.0);
    }

    #[test]
    fn test_jitter_converges_to_fixed_point() {
        // Transit alternates between base and base + d, so every sample of
        // |transit − last_transit| is exactly d and the estimate tends to d.
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        let d = 24;
        estimator.update(&mut entry, timing(0, 400, true), latency());
        for n in 1..200u64 {
            let transit = 400 + (n % 2) * d;
            estimator.update(&mut entry, timing(n, n * 160 + transit, false), latency());
        }
        assert!((entry.jitter - d as f64).abs() < 0.01, "jitter {}", entry.jitter);

        // A new talkspurt discards it.
        estimator.update(&mut entry, timing(500, 500 * 160 + 400, true), latency());
        assert_eq!(entry.jitter, 40.0);
    }

    #[test]
    fn test_random_jitter_stays_bounded() {
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        let mut rng = SmallRng::seed_from_u64(7);
        estimator.update(&mut entry, timing(0, 400, true), latency());
        for n in 1..500u64 {
            let transit = 400 + rng.gen_range(0..=80u64);
            estimator.update(&mut entry, timing(n, n * 160 + transit, false), latency());
        }
        // Mean |X − Y| for X, Y uniform on [0, 80] is 80/3.
        assert!(entry.jitter > 10.0 && entry.jitter < 45.0, "jitter {}", entry.jitter);
    }

    #[test]
    fn test_never_schedules_in_the_past() {
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        estimator.update(&mut entry, timing(0, 400, true), latency());
        // Arrives 2000 ticks later than the first packet's transit allows.
        let decision = estimator.update(&mut entry, timing(1, 160 + 2400, false), latency());
        assert_eq!(decision.recomputed, Some(RecomputeReason::PastDeadline));
        assert!(!decision.playout.is_before(&Timestamp::new(2560, 8000)));
    }

    #[test]
    fn test_late_run_forces_recompute() {
        let estimator = PlayoutDelayEstimator::new(PlayoutConfig::default());
        let mut entry = PersistentSourceEntry::new(1);
        estimator.update(&mut entry, timing(0, 400, true), latency());
        assert!(!estimator.note_late(&mut entry));
        estimator.note_on_time(&mut entry);
        assert!(!estimator.note_late(&mut entry));
        assert!(!estimator.note_late(&mut entry));
        assert!(estimator.note_late(&mut entry));
        assert_eq!(entry.stats.packets_late, 4);

        let decision = estimator.update(&mut entry, timing(1, 560, false), latency());
        assert_eq!(decision.recomputed, Some(RecomputeReason::LateRun));
        assert!(!entry.force_recompute);
    }

    #[test]
    fn test_latency_and_clamping() {
        let config = PlayoutConfig {
            max_playout_ms: 30,
            ..PlayoutConfig::default()
        };
        let estimator = PlayoutDelayEstimator::new(config);
        let mut entry = PersistentSourceEntry::new(1);
        let decision = estimator.update(&mut entry, timing(0, 400, true), Timestamp::new(320, 8000));
        // Variable part clamped to 240 ticks, plus 320 ticks of coder latency.
        assert_eq!(entry.desired_delay.ticks(), 560);
        assert_eq!(decision.playout.ticks(), 960);
        assert_eq!(PlayoutDelayEstimator::discrepancy(&entry), 0);
    }
}
