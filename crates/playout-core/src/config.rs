//! Pipeline configuration
//!
//! Every section has working defaults, so a partial JSON document (or none
//! at all) yields a usable configuration.

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::channel::ChannelPayloadTypes;
use crate::error::{Error, Result};

/// Playout delay estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Lower bound of the variable playout component
    pub min_playout_ms: u32,
    /// Upper bound of the variable playout component
    pub max_playout_ms: u32,
    /// Output cushion the receiver keeps buffered
    pub cushion_ms: u32,
    /// Jitter assumed at the start of every talkspurt
    pub initial_jitter_ms: u32,
    /// Consecutive late packets that force a playout recompute
    pub late_recompute_threshold: u32,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            min_playout_ms: 0,
            max_playout_ms: 1000,
            cushion_ms: 40,
            initial_jitter_ms: 5,
            late_recompute_threshold: 3,
        }
    }
}

/// Clock skew detection and correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkewConfig {
    pub enabled: bool,
    /// Units played since talkspurt start before skew is judged
    pub min_units: u32,
    /// Discrepancy tolerated before correcting
    pub threshold_ms: u32,
    /// Beyond this many frames of discrepancy, drop half a frame blindly
    pub upper_bound_frames: u32,
    /// Samples over which a splice is cross-faded
    pub crossfade_samples: usize,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_units: 16,
            threshold_ms: 5,
            upper_bound_frames: 4,
            crossfade_samples: 8,
        }
    }
}

/// Loss concealment scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairScheme {
    /// Leave gaps unfilled
    None,
    /// Fill gaps with silence
    Silence,
    /// Repeat the previous unit, fading out
    Repetition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub scheme: RepairScheme,
    /// Longest run of consecutive units repaired in one gap
    pub max_consecutive: u32,
    /// Pause after a failed repair
    pub backoff_ms: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            scheme: RepairScheme::Repetition,
            max_consecutive: 5,
            backoff_ms: 200,
        }
    }
}

/// Complete receive pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub playout: PlayoutConfig,
    pub skew: SkewConfig,
    pub repair: RepairConfig,
    pub payload_types: ChannelPayloadTypes,
    /// Format the mixer expects
    pub output_format: AudioFormat,
    /// Played audio retained behind the read position
    pub history_ms: u32,
    /// Silence after which a source's decode state is dropped
    pub idle_timeout_ms: u32,
    /// Channel data further ahead than this is left undecoded for now
    pub decode_horizon_ms: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            playout: PlayoutConfig::default(),
            skew: SkewConfig::default(),
            repair: RepairConfig::default(),
            payload_types: ChannelPayloadTypes::default(),
            output_format: AudioFormat::telephony(),
            history_ms: 500,
            idle_timeout_ms: 2000,
            decode_horizon_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Configuration(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let p = &self.playout;
        if p.min_playout_ms > p.max_playout_ms {
            return Err(Error::Configuration(format!(
                "min playout {} ms exceeds max {} ms",
                p.min_playout_ms, p.max_playout_ms
            )));
        }
        if p.late_recompute_threshold == 0 {
            return Err(Error::Configuration("late recompute threshold must be positive".into()));
        }
        if self.skew.min_units == 0 || self.skew.upper_bound_frames == 0 {
            return Err(Error::Configuration("skew bounds must be positive".into()));
        }
        if self.payload_types.redundancy == self.payload_types.interleaver {
            return Err(Error::Configuration(
                "redundancy and interleaver payload types must differ".into(),
            ));
        }
        if self.payload_types.redundancy > 127 || self.payload_types.interleaver > 127 {
            return Err(Error::Configuration("channel payload types must fit in 7 bits".into()));
        }
        let fmt = self.output_format;
        if fmt.sample_rate == 0 || !(1..=2).contains(&fmt.channels) {
            return Err(Error::Configuration(format!("unsupported output format {:?}", fmt)));
        }
        if self.history_ms == 0 {
            return Err(Error::Configuration("history must be positive".into()));
        }
        Ok(())
    }
}
