//! Loss concealment
//!
//! When a unit that should have arrived is missing, the pipeline asks a
//! [`Repair`] implementation for a replacement built from the previous unit.
//! Repair is only ever asked to bridge short gaps inside a talkspurt; the
//! pipeline enforces the run-length limit and backs off after failures.

use std::fmt::Debug;

use tracing::trace;

use crate::audio::{AudioFormat, AudioFrame};
use crate::codec::CodecStateStore;
use crate::config::RepairScheme;
use crate::error::{Error, Result};

/// Attenuation applied per consecutive repaired unit
pub const FADE_DB_PER_UNIT: f32 = 3.0;

/// What a repair implementation gets to work with
#[derive(Debug)]
pub struct RepairRequest<'a> {
    /// Position of this unit in the current run of losses, starting at 1
    pub consecutive: u32,
    /// Decoded audio of the unit before the gap, if any
    pub previous: Option<&'a AudioFrame>,
    /// Native format of the stream
    pub format: AudioFormat,
    /// Sample periods the replacement must cover
    pub samples_per_channel: usize,
}

/// Concealment collaborator
pub trait Repair: Debug + Send {
    fn name(&self) -> &'static str;

    /// Produce a replacement for one missing unit
    ///
    /// `codecs` is the source's decoder state, for schemes that conceal
    /// inside the codec.
    fn produce_replacement(&mut self, request: &RepairRequest<'_>, codecs: &mut CodecStateStore) -> Result<AudioFrame>;
}

/// Build the repair implementation for a configured scheme
pub fn for_scheme(scheme: RepairScheme) -> Option<Box<dyn Repair>> {
    match scheme {
        RepairScheme::None => None,
        RepairScheme::Silence => Some(Box::new(SilenceRepair)),
        RepairScheme::Repetition => Some(Box::new(RepetitionRepair)),
    }
}

/// Fill gaps with digital silence
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceRepair;

impl Repair for SilenceRepair {
    fn name(&self) -> &'static str {
        "silence"
    }

    fn produce_replacement(&mut self, request: &RepairRequest<'_>, _codecs: &mut CodecStateStore) -> Result<AudioFrame> {
        Ok(AudioFrame::silence(request.format, request.samples_per_channel))
    }
}

/// Repeat the previous unit, 3 dB quieter for every further loss
#[derive(Debug, Default, Clone, Copy)]
pub struct RepetitionRepair;

impl Repair for RepetitionRepair {
    fn name(&self) -> &'static str {
        "repetition"
    }

    fn produce_replacement(&mut self, request: &RepairRequest<'_>, _codecs: &mut CodecStateStore) -> Result<AudioFrame> {
        let previous = request
            .previous
            .ok_or_else(|| Error::RepairFailed("no previous unit to repeat".into()))?;
        if previous.format != request.format || previous.samples_per_channel() != request.samples_per_channel {
            return Err(Error::RepairFailed(format!(
                "previous unit is {} periods of {:?}, need {} of {:?}",
                previous.samples_per_channel(),
                previous.format,
                request.samples_per_channel,
                request.format
            )));
        }

        let gain = 10f32.powf(-FADE_DB_PER_UNIT * request.consecutive as f32 / 20.0);
        trace!("Repeating previous unit at gain {:.3}", gain);
        let samples = previous
            .samples
            .iter()
            .map(|&s| (s as f32 * gain).round() as i16)
            .collect();
        Ok(AudioFrame::new(samples, request.format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use std::sync::Arc;

    fn store() -> CodecStateStore {
        CodecStateStore::new(Arc::new(CodecRegistry::with_defaults()))
    }

    #[test]
    fn test_repetition_fades() {
        let previous = AudioFrame::new(vec![10000; 160], AudioFormat::telephony());
        let mut repair = RepetitionRepair;
        let mut codecs = store();

        let mut levels = Vec::new();
        for consecutive in 1..=3 {
            let request = RepairRequest {
                consecutive,
                previous: Some(&previous),
                format: AudioFormat::telephony(),
                samples_per_channel: 160,
            };
            let frame = repair.produce_replacement(&request, &mut codecs).unwrap();
            levels.push(frame.samples[0]);
        }
        // -3 dB, -6 dB, -9 dB
        assert_eq!(levels, vec![7079, 5012, 3548]);
    }

    #[test]
    fn test_repetition_needs_matching_previous() {
        let mut repair = RepetitionRepair;
        let mut codecs = store();
        let request = RepairRequest {
            consecutive: 1,
            previous: None,
            format: AudioFormat::telephony(),
            samples_per_channel: 160,
        };
        assert!(matches!(
            repair.produce_replacement(&request, &mut codecs),
            Err(Error::RepairFailed(_))
        ));

        let short = AudioFrame::silence(AudioFormat::telephony(), 80);
        let request = RepairRequest {
            previous: Some(&short),
            ..request
        };
        assert!(repair.produce_replacement(&request, &mut codecs).is_err());
    }

    #[test]
    fn test_scheme_selection() {
        assert!(for_scheme(RepairScheme::None).is_none());
        assert_eq!(for_scheme(RepairScheme::Silence).unwrap().name(), "silence");
        let mut silence = SilenceRepair;
        let request = RepairRequest {
            consecutive: 4,
            previous: None,
            format: AudioFormat::stereo(16000),
            samples_per_channel: 320,
        };
        let frame = silence.produce_replacement(&request, &mut store()).unwrap();
        assert_eq!(frame.samples.len(), 640);
    }
}
