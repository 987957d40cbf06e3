//! PCM audio frames
//!
//! Native (decoded) audio travelling between the codec, converter, skew
//! adapter and mixer stages.

use crate::time::Timestamp;

/// Media sample type (raw audio data)
pub type Sample = i16;

/// Audio format (channels and sample rate, always 16-bit samples)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels (1 for mono, 2 for stereo)
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Mono at the given sample rate
    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Stereo at the given sample rate
    pub fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2)
    }

    /// Standard narrowband telephony format (mono, 8kHz)
    pub fn telephony() -> Self {
        Self::mono(8000)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::telephony()
    }
}

/// A block of interleaved PCM samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Interleaved samples
    pub samples: Vec<Sample>,
    /// Format of `samples`
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(samples: Vec<Sample>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    /// A frame of digital silence
    pub fn silence(format: AudioFormat, samples_per_channel: usize) -> Self {
        Self::new(vec![0; samples_per_channel * format.channels as usize], format)
    }

    /// Number of sample periods (samples per channel)
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    /// Playback duration, in ticks of the frame's own sample rate
    pub fn duration(&self) -> Timestamp {
        Timestamp::new(self.samples_per_channel() as u64, self.format.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean absolute amplitude over all channels
    pub fn mean_amplitude(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.unsigned_abs() as u64).sum();
        total as f64 / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::silence(AudioFormat::stereo(16000), 320);
        assert_eq!(frame.samples.len(), 640);
        assert_eq!(frame.samples_per_channel(), 320);
        assert_eq!(frame.duration(), Timestamp::from_millis(20, 16000));
        assert_eq!(frame.mean_amplitude(), 0.0);
    }
}
