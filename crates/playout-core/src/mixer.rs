//! Mixer collaborator
//!
//! The pipeline hands every played unit to a [`Mixer`] at its playout time.
//! Two implementations are provided: [`RecordingMixer`] keeps everything it
//! is given (tests, diagnostics), [`SummingMixer`] sums all sources onto one
//! output timeline with clip protection.

use std::collections::VecDeque;

use tracing::trace;

use crate::audio::{AudioFormat, AudioFrame, Sample};
use crate::time::Timestamp;

/// Receives native audio from every source
pub trait Mixer {
    /// Accept one unit of `ssrc`'s audio for playback at `playout`
    fn accept(&mut self, frame: &AudioFrame, ssrc: u32, playout: Timestamp);
}

/// One unit handed to a [`RecordingMixer`]
#[derive(Debug, Clone, PartialEq)]
pub struct MixedUnit {
    pub ssrc: u32,
    pub playout: Timestamp,
    pub frame: AudioFrame,
}

/// Mixer that records what it is given
#[derive(Debug, Default)]
pub struct RecordingMixer {
    pub units: Vec<MixedUnit>,
}

impl RecordingMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units of one source, in arrival order
    pub fn for_source(&self, ssrc: u32) -> impl Iterator<Item = &MixedUnit> {
        self.units.iter().filter(move |u| u.ssrc == ssrc)
    }

    /// Total sample periods received from one source
    pub fn periods(&self, ssrc: u32) -> usize {
        self.for_source(ssrc).map(|u| u.frame.samples_per_channel()).sum()
    }

    pub fn clear(&mut self) {
        self.units.clear();
    }
}

impl Mixer for RecordingMixer {
    fn accept(&mut self, frame: &AudioFrame, ssrc: u32, playout: Timestamp) {
        self.units.push(MixedUnit {
            ssrc,
            playout,
            frame: frame.clone(),
        });
    }
}

/// How far past the read position audio is accepted
const MIX_HORIZON_SECS: u64 = 5;

/// Sums sources onto a single output timeline
///
/// Audio that arrives for a time already read out is discarded.
#[derive(Debug)]
pub struct SummingMixer {
    format: AudioFormat,
    /// Output time of the first accumulated period
    base: Timestamp,
    mix: VecDeque<i32>,
    /// Sample periods discarded because they arrived too late
    pub late_periods: u64,
    /// Sample periods discarded for lying beyond the mix horizon
    pub early_periods: u64,
}

impl SummingMixer {
    pub fn new(format: AudioFormat, start: Timestamp) -> Self {
        Self {
            format,
            base: start.convert(format.sample_rate),
            mix: VecDeque::new(),
            late_periods: 0,
            early_periods: 0,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Output time of the next period [`SummingMixer::read`] returns
    pub fn position(&self) -> Timestamp {
        self.base
    }

    /// Take `periods` sample periods of mixed output, silence where nothing
    /// was contributed
    pub fn read(&mut self, periods: usize) -> AudioFrame {
        let channels = self.format.channels as usize;
        let wanted = periods * channels;
        let mut samples = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            let value = self.mix.pop_front().unwrap_or(0);
            samples.push(value.clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample);
        }
        self.base = self.base.add_ticks(periods as i64);
        AudioFrame::new(samples, self.format)
    }
}

impl Mixer for SummingMixer {
    fn accept(&mut self, frame: &AudioFrame, ssrc: u32, playout: Timestamp) {
        if frame.format != self.format {
            trace!("Mixer ignoring {:?} audio from {:#010x}", frame.format, ssrc);
            return;
        }
        let channels = self.format.channels as usize;
        let offset = playout.convert(self.format.sample_rate).signed_delta(&self.base);
        let horizon = MIX_HORIZON_SECS * self.format.sample_rate as u64;
        if offset > 0 && offset as u64 + frame.samples_per_channel() as u64 > horizon {
            trace!("Mixer dropping audio from {:#010x} at {}, past the horizon", ssrc, playout);
            self.early_periods += frame.samples_per_channel() as u64;
            return;
        }
        let skip = if offset < 0 { (-offset) as usize } else { 0 };
        let skip = skip.min(frame.samples_per_channel());
        self.late_periods += skip as u64;

        let start = offset.max(0) as usize * channels;
        let samples = &frame.samples[skip * channels..];
        if self.mix.len() < start + samples.len() {
            self.mix.resize(start + samples.len(), 0);
        }
        for (i, &s) in samples.iter().enumerate() {
            self.mix[start + i] += s as i32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ticks: u64) -> Timestamp {
        Timestamp::new(ticks, 8000)
    }

    #[test]
    fn test_sources_sum_and_clip() {
        let format = AudioFormat::telephony();
        let mut mixer = SummingMixer::new(format, ts(1000));
        mixer.accept(&AudioFrame::new(vec![20000; 4], format), 1, ts(1000));
        mixer.accept(&AudioFrame::new(vec![20000; 4], format), 2, ts(1002));
        mixer.accept(&AudioFrame::new(vec![-5; 2], format), 3, ts(1000));

        let out = mixer.read(8);
        assert_eq!(out.samples, vec![19995, 19995, 32767, 32767, 20000, 20000, 0, 0]);
        assert_eq!(mixer.position(), ts(1008));
    }

    #[test]
    fn test_late_audio_partially_discarded() {
        let format = AudioFormat::telephony();
        let mut mixer = SummingMixer::new(format, ts(0));
        mixer.read(4);
        mixer.accept(&AudioFrame::new(vec![1, 2, 3, 4, 5, 6], format), 1, ts(2));
        assert_eq!(mixer.late_periods, 2);
        assert_eq!(mixer.read(4).samples, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_audio_past_horizon_rejected() {
        let format = AudioFormat::telephony();
        let mut mixer = SummingMixer::new(format, ts(0));
        // A minute ahead would otherwise queue half a million periods.
        mixer.accept(&AudioFrame::new(vec![7; 160], format), 1, ts(60 * 8000));
        assert_eq!(mixer.early_periods, 160);
        assert!(mixer.mix.is_empty());

        // The last frame that still fits is kept.
        mixer.accept(&AudioFrame::new(vec![7; 160], format), 1, ts(5 * 8000 - 160));
        assert_eq!(mixer.early_periods, 160);
        assert_eq!(mixer.mix.len(), 5 * 8000);
    }

    #[test]
    fn test_recording_mixer_filters_by_source() {
        let mut mixer = RecordingMixer::new();
        let frame = AudioFrame::silence(AudioFormat::telephony(), 160);
        mixer.accept(&frame, 1, ts(0));
        mixer.accept(&frame, 2, ts(0));
        mixer.accept(&frame, 1, ts(160));
        assert_eq!(mixer.periods(1), 320);
        assert_eq!(mixer.for_source(2).count(), 1);
    }
}
