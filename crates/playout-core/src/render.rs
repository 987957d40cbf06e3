//! Spatial rendering collaborator
//!
//! Runs on converted audio just before the mixer, so it always sees the
//! output format.

use std::fmt::Debug;

use crate::audio::{AudioFrame, Sample};

/// Places one source's audio in the output sound field
pub trait Spatializer: Debug + Send {
    fn spatialize(&mut self, frame: &mut AudioFrame);
}

/// Constant-power stereo panner with a gain
///
/// Mono frames only get the gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoPanner {
    left: f32,
    right: f32,
    gain: f32,
}

impl StereoPanner {
    /// `azimuth` in `-1.0` (hard left) ..= `1.0` (hard right)
    pub fn new(azimuth: f32, gain: f32) -> Self {
        let azimuth = azimuth.clamp(-1.0, 1.0);
        let angle = (azimuth + 1.0) * std::f32::consts::FRAC_PI_4;
        Self {
            left: angle.cos(),
            right: angle.sin(),
            gain: gain.clamp(0.0, 2.0),
        }
    }

    pub fn centre() -> Self {
        Self::new(0.0, 1.0)
    }
}

fn scale(sample: Sample, factor: f32) -> Sample {
    (sample as f32 * factor)
        .round()
        .clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample
}

impl Spatializer for StereoPanner {
    fn spatialize(&mut self, frame: &mut AudioFrame) {
        if frame.format.channels == 2 {
            for pair in frame.samples.chunks_exact_mut(2) {
                pair[0] = scale(pair[0], self.left * self.gain);
                pair[1] = scale(pair[1], self.right * self.gain);
            }
        } else {
            for s in frame.samples.iter_mut() {
                *s = scale(*s, self.gain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    #[test]
    fn test_hard_left_silences_right() {
        let mut panner = StereoPanner::new(-1.0, 1.0);
        let mut frame = AudioFrame::new(vec![1000, 1000, -1000, -1000], AudioFormat::stereo(8000));
        panner.spatialize(&mut frame);
        assert_eq!(frame.samples, vec![1000, 0, -1000, 0]);
    }

    #[test]
    fn test_centre_is_constant_power() {
        let mut panner = StereoPanner::centre();
        let mut frame = AudioFrame::new(vec![10000, 10000], AudioFormat::stereo(8000));
        panner.spatialize(&mut frame);
        assert_eq!(frame.samples, vec![7071, 7071]);
    }

    #[test]
    fn test_mono_gain_saturates() {
        let mut panner = StereoPanner::new(0.5, 2.0);
        let mut frame = AudioFrame::new(vec![20000, -3], AudioFormat::telephony());
        panner.spatialize(&mut frame);
        assert_eq!(frame.samples, vec![32767, -6]);
    }
}
