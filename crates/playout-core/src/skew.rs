//! Sender/receiver clock skew
//!
//! A sender whose sample clock runs slightly fast delivers more audio than
//! the receiver plays, and the playout buffer slowly fills; a slow sender
//! drains it. Within a talkspurt the playout offset is fixed, so the drift
//! shows up as a growing gap between the playout offset and the average
//! transit time.
//!
//! Correction happens on the decoded frame about to be played: a fast
//! source loses a pitch-matched stretch of samples, a slow one has a stretch
//! repeated. Either way the seam is cross-faded, and the caller shifts every
//! buffered timestamp by the same amount.

use tracing::{debug, trace};

use crate::audio::{AudioFrame, Sample};
use crate::config::SkewConfig;
use crate::playout::PlayoutDelayEstimator;
use crate::source::participant::PersistentSourceEntry;
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewState {
    None,
    /// Sender clock ahead; buffer over-filling
    Fast,
    /// Sender clock behind; buffer draining
    Slow,
}

/// Result of judging a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewEstimate {
    pub state: SkewState,
    /// Magnitude of the discrepancy, as an interval on the source clock
    pub outstanding: Timestamp,
}

/// Detects and corrects sustained clock skew for one source
#[derive(Debug, Clone)]
pub struct SourceSkewAdapter {
    config: SkewConfig,
}

impl SourceSkewAdapter {
    pub fn new(config: SkewConfig) -> Self {
        Self { config }
    }

    /// Classify the source; `units` counts units played since talkspurt start
    pub fn classify(&self, entry: &PersistentSourceEntry, units: u32) -> SkewEstimate {
        let freq = entry.playout.freq();
        let none = SkewEstimate {
            state: SkewState::None,
            outstanding: Timestamp::zero(freq),
        };
        if !self.config.enabled || units < self.config.min_units {
            return none;
        }

        let discrepancy = PlayoutDelayEstimator::discrepancy(entry);
        let threshold = Timestamp::from_millis(self.config.threshold_ms as u64, freq).ticks() as i64;
        let state = if discrepancy > threshold {
            SkewState::Fast
        } else if discrepancy < -threshold {
            SkewState::Slow
        } else {
            return none;
        };
        trace!("Source {:#010x} skew {:?} by {} ticks", entry.ssrc, state, discrepancy);
        SkewEstimate {
            state,
            outstanding: Timestamp::new(discrepancy.unsigned_abs(), freq),
        }
    }

    /// Correct `frame` in place
    ///
    /// Returns the number of sample periods removed (fast) or inserted
    /// (slow); never more than the outstanding discrepancy.
    pub fn adapt(&self, estimate: SkewEstimate, frame: &mut AudioFrame) -> usize {
        let outstanding = estimate.outstanding.convert(frame.format.sample_rate).ticks() as usize;
        if outstanding == 0 || frame.is_empty() {
            return 0;
        }
        let changed = match estimate.state {
            SkewState::None => 0,
            SkewState::Fast => self.drop_samples(frame, outstanding),
            SkewState::Slow => self.insert_samples(frame, outstanding),
        };
        if changed > 0 {
            debug!(
                "Skew {:?}: {} samples {} (outstanding {})",
                estimate.state,
                changed,
                if estimate.state == SkewState::Fast { "dropped" } else { "inserted" },
                outstanding
            );
        }
        changed
    }

    fn crossfade_len(&self, limit: usize) -> usize {
        self.config.crossfade_samples.min(limit)
    }

    fn drop_samples(&self, frame: &mut AudioFrame, outstanding: usize) -> usize {
        let n = frame.samples_per_channel();
        let start = (n / 8).max(1);
        let window = (n / 8).max(1);
        let fade = self.crossfade_len(start);
        let upper = self.config.upper_bound_frames as usize * n;

        let drop = if outstanding > upper {
            // Far off: no time for finesse.
            (n / 2).min(n.saturating_sub(start + fade))
        } else {
            let max_drop = outstanding
                .min(n / 2)
                .min(n.saturating_sub(start + window.max(fade)));
            best_match(frame, start, window, max_drop)
        };
        if drop == 0 {
            return 0;
        }
        splice(frame, start, start + drop, fade);
        drop
    }

    fn insert_samples(&self, frame: &mut AudioFrame, outstanding: usize) -> usize {
        let n = frame.samples_per_channel();
        let fade = self.crossfade_len(n / 8);
        let insert = outstanding.min(n.saturating_sub(fade));
        if insert == 0 {
            return 0;
        }
        // Replay the last `insert` periods; the repeat ends where the next
        // unit begins, so only the jump back needs smoothing.
        splice(frame, n, n - insert, fade);
        insert
    }
}

/// Drop length in `1..=max_drop` whose following window best matches the
/// window at `start` (minimum mean absolute difference)
fn best_match(frame: &AudioFrame, start: usize, window: usize, max_drop: usize) -> usize {
    let channels = frame.format.channels.max(1) as usize;
    let s = &frame.samples;
    let mut best = (0, u64::MAX);
    for drop in 1..=max_drop {
        let score: u64 = (0..window * channels)
            .map(|i| {
                let a = s[start * channels + i] as i32;
                let b = s[(start + drop) * channels + i] as i32;
                (a - b).unsigned_abs() as u64
            })
            .sum();
        if score < best.1 {
            best = (drop, score);
        }
    }
    best.0
}

/// Play up to period `from`, then continue at period `to`
///
/// The `fade` periods before the jump are blended with the periods before
/// the landing point. `from > to` repeats audio, `from < to` drops it.
fn splice(frame: &mut AudioFrame, from: usize, to: usize, fade: usize) {
    let channels = frame.format.channels.max(1) as usize;
    let s = &frame.samples;
    let fade = fade.min(from).min(to);

    let mut out: Vec<Sample> = Vec::with_capacity(s.len() + from * channels);
    out.extend_from_slice(&s[..(from - fade) * channels]);
    for i in 0..fade {
        let alpha = (i + 1) as f32 / (fade + 1) as f32;
        for c in 0..channels {
            let outgoing = s[(from - fade + i) * channels + c] as f32;
            let incoming = s[(to - fade + i) * channels + c] as f32;
            out.push((outgoing * (1.0 - alpha) + incoming * alpha).round() as Sample);
        }
    }
    out.extend_from_slice(&s[to * channels..]);
    frame.samples = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    fn tone(period: usize, len: usize) -> AudioFrame {
        let samples = (0..len)
            .map(|i| ((i as f64 * 2.0 * std::f64::consts::PI / period as f64).sin() * 8000.0) as i16)
            .collect();
        AudioFrame::new(samples, AudioFormat::telephony())
    }

    fn entry_with_discrepancy(ticks: i64) -> PersistentSourceEntry {
        let mut entry = PersistentSourceEntry::new(9);
        entry.avg_transit = Timestamp::new(1000, 8000);
        entry.desired_delay = Timestamp::new(480, 8000);
        entry.playout = Timestamp::new(1480, 8000).add_ticks(ticks);
        entry
    }

    #[test]
    fn test_classification_thresholds() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        // threshold 5 ms = 40 ticks
        let fast = entry_with_discrepancy(100);
        assert_eq!(adapter.classify(&fast, 15).state, SkewState::None);
        let estimate = adapter.classify(&fast, 16);
        assert_eq!(estimate.state, SkewState::Fast);
        assert_eq!(estimate.outstanding.ticks(), 100);

        assert_eq!(adapter.classify(&entry_with_discrepancy(-41), 20).state, SkewState::Slow);
        assert_eq!(adapter.classify(&entry_with_discrepancy(40), 20).state, SkewState::None);
        assert_eq!(adapter.classify(&entry_with_discrepancy(0), 100).state, SkewState::None);
    }

    #[test]
    fn test_fast_drop_finds_pitch_period() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        let mut frame = tone(40, 160);
        let estimate = SkewEstimate {
            state: SkewState::Fast,
            outstanding: Timestamp::new(60, 8000),
        };
        let dropped = adapter.adapt(estimate, &mut frame);
        assert_eq!(dropped, 40);
        assert_eq!(frame.samples.len(), 120);
    }

    #[test]
    fn test_fast_drop_capped_by_outstanding() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        let mut frame = tone(40, 160);
        let estimate = SkewEstimate {
            state: SkewState::Fast,
            outstanding: Timestamp::new(12, 8000),
        };
        let dropped = adapter.adapt(estimate, &mut frame);
        assert!(dropped >= 1 && dropped <= 12);
        assert_eq!(frame.samples.len(), 160 - dropped);
    }

    #[test]
    fn test_far_skew_drops_half_frame() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        let mut frame = tone(40, 160);
        let estimate = SkewEstimate {
            state: SkewState::Fast,
            outstanding: Timestamp::new(5 * 160, 8000),
        };
        assert_eq!(adapter.adapt(estimate, &mut frame), 80);
        assert_eq!(frame.samples.len(), 80);
    }

    #[test]
    fn test_slow_inserts_bounded_by_frame() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        let mut frame = tone(40, 160);
        let original = frame.clone();
        let estimate = SkewEstimate {
            state: SkewState::Slow,
            outstanding: Timestamp::new(50, 8000),
        };
        assert_eq!(adapter.adapt(estimate, &mut frame), 50);
        assert_eq!(frame.samples.len(), 210);
        // Untouched before the seam, and the repeat ends on the original tail.
        assert_eq!(&frame.samples[..150], &original.samples[..150]);
        assert_eq!(&frame.samples[160..], &original.samples[110..]);

        let mut frame = tone(40, 160);
        let estimate = SkewEstimate {
            state: SkewState::Slow,
            outstanding: Timestamp::new(1000, 8000),
        };
        assert_eq!(adapter.adapt(estimate, &mut frame), 152);
    }

    #[test]
    fn test_stereo_splice_keeps_channels_aligned() {
        let adapter = SourceSkewAdapter::new(SkewConfig::default());
        let samples: Vec<i16> = (0..160).flat_map(|i| [i as i16, -(i as i16)]).collect();
        let mut frame = AudioFrame::new(samples, AudioFormat::stereo(8000));
        let estimate = SkewEstimate {
            state: SkewState::Fast,
            outstanding: Timestamp::new(10, 8000),
        };
        let dropped = adapter.adapt(estimate, &mut frame);
        assert!(dropped > 0);
        assert_eq!(frame.samples.len(), (160 - dropped) * 2);
        for pair in frame.samples.chunks_exact(2) {
            assert_eq!(pair[0], -pair[1]);
        }
    }
}
