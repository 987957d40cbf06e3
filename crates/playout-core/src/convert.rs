//! Sample rate and channel conversion
//!
//! Decoded audio arrives in whatever format the sender's codec uses; the
//! mixer wants one format for everybody.

use std::fmt::Debug;

use crate::audio::{AudioFormat, AudioFrame, Sample};
use crate::error::{Error, Result};

/// Converter collaborator
pub trait Converter: Debug + Send {
    /// Convert one frame to `target`; state carries over between frames of
    /// the same stream
    fn convert(&mut self, frame: &AudioFrame, target: AudioFormat) -> Result<AudioFrame>;

    /// Forget inter-frame state (after a discontinuity)
    fn reset(&mut self);
}

/// Channel mixing plus linear-interpolation resampling
#[derive(Debug, Default)]
pub struct LinearConverter {
    /// Fractional input position of the next output sample
    phase: f64,
    /// Stream the phase belongs to
    stream: Option<(u32, u32)>,
}

impl LinearConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Up- or down-mix between mono and stereo
    pub fn rechannel(samples: &[Sample], from: u16, to: u16) -> Result<Vec<Sample>> {
        match (from, to) {
            (a, b) if a == b => Ok(samples.to_vec()),
            (1, 2) => Ok(samples.iter().flat_map(|&s| [s, s]).collect()),
            (2, 1) => Ok(samples
                .chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as Sample)
                .collect()),
            _ => Err(Error::Conversion(format!(
                "cannot convert {} channels to {}",
                from, to
            ))),
        }
    }

    fn resample(&mut self, samples: &[Sample], channels: usize, from: u32, to: u32) -> Vec<Sample> {
        if from == to {
            return samples.to_vec();
        }
        if self.stream != Some((from, to)) {
            self.phase = 0.0;
            self.stream = Some((from, to));
        }

        let frames = samples.len() / channels;
        let step = from as f64 / to as f64;
        let mut out = Vec::with_capacity(frames * to as usize / from as usize * channels + channels);
        let mut pos = self.phase;
        while pos < frames as f64 {
            let index = pos.floor() as usize;
            let next = (index + 1).min(frames - 1);
            let frac = pos - index as f64;
            for c in 0..channels {
                let a = samples[index * channels + c] as f64;
                let b = samples[next * channels + c] as f64;
                out.push((a + (b - a) * frac).round() as Sample);
            }
            pos += step;
        }
        self.phase = pos - frames as f64;
        out
    }
}

impl Converter for LinearConverter {
    fn convert(&mut self, frame: &AudioFrame, target: AudioFormat) -> Result<AudioFrame> {
        if frame.format == target {
            return Ok(frame.clone());
        }
        if frame.format.sample_rate == 0 || target.sample_rate == 0 {
            return Err(Error::Conversion("zero sample rate".into()));
        }
        let samples = Self::rechannel(&frame.samples, frame.format.channels, target.channels)?;
        if samples.is_empty() {
            return Ok(AudioFrame::new(samples, target));
        }
        let samples = self.resample(
            &samples,
            target.channels as usize,
            frame.format.sample_rate,
            target.sample_rate,
        );
        Ok(AudioFrame::new(samples, target))
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_keeps_duration() {
        let mut conv = LinearConverter::new();
        let frame = AudioFrame::new((0..160).map(|i| i * 10).collect(), AudioFormat::mono(8000));
        let out = conv.convert(&frame, AudioFormat::mono(16000)).unwrap();
        assert_eq!(out.samples.len(), 320);
        assert_eq!(out.samples[0], 0);
        assert_eq!(out.samples[1], 5);
        assert_eq!(out.samples[2], 10);
        assert_eq!(out.duration(), frame.duration());

        // Continuous across frames.
        let out = conv.convert(&frame, AudioFormat::mono(16000)).unwrap();
        assert_eq!(out.samples.len(), 320);
    }

    #[test]
    fn test_downsample_and_downmix() {
        let mut conv = LinearConverter::new();
        let samples: Vec<i16> = (0..320).flat_map(|_| [1000, 3000]).collect();
        let frame = AudioFrame::new(samples, AudioFormat::stereo(16000));
        let out = conv.convert(&frame, AudioFormat::mono(8000)).unwrap();
        assert_eq!(out.samples.len(), 160);
        assert!(out.samples.iter().all(|&s| s == 2000));
    }

    #[test]
    fn test_fractional_ratio_accumulates_phase() {
        let mut conv = LinearConverter::new();
        let frame = AudioFrame::silence(AudioFormat::mono(48000), 960);
        let total: usize = (0..10)
            .map(|_| conv.convert(&frame, AudioFormat::mono(44100)).unwrap().samples.len())
            .sum();
        // 200 ms at 44.1 kHz
        assert!((8819..=8821).contains(&total), "{}", total);
    }

    #[test]
    fn test_unsupported_layout() {
        assert!(LinearConverter::rechannel(&[0; 12], 6, 2).is_err());
        assert_eq!(LinearConverter::rechannel(&[7], 1, 2).unwrap(), vec![7, 7]);
    }
}
