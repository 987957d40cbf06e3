//! Channel and media units
//!
//! A [`ChannelData`] is what one packet carries on the wire; channel coders
//! turn it into [`MediaUnit`]s, each covering one codec frame interval with
//! one or more alternative representations of that interval.

use bytes::{Bytes, BytesMut};

use crate::audio::AudioFrame;
use crate::codec::CodecId;

/// One self-describing sub-frame of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUnit {
    /// Payload type identifying the codec or channel coder
    pub payload_type: u8,
    /// Payload bytes
    pub data: Bytes,
}

impl ChannelUnit {
    pub fn new(payload_type: u8, data: Bytes) -> Self {
        Self { payload_type, data }
    }
}

/// The channel units of one packet, in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelData {
    pub units: Vec<ChannelUnit>,
}

impl ChannelData {
    pub fn new(units: Vec<ChannelUnit>) -> Self {
        Self { units }
    }

    /// Packet data made of a single channel unit
    pub fn single(payload_type: u8, data: Bytes) -> Self {
        Self::new(vec![ChannelUnit::new(payload_type, data)])
    }

    /// Payload type of the first unit
    pub fn payload_type(&self) -> Option<u8> {
        self.units.first().map(|u| u.payload_type)
    }

    /// Total payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.units.iter().map(|u| u.data.len()).sum()
    }

    /// Concatenate all units into one packet payload
    pub fn to_payload(&self) -> Bytes {
        if self.units.len() == 1 {
            return self.units[0].data.clone();
        }
        let mut buf = BytesMut::with_capacity(self.payload_len());
        for unit in &self.units {
            buf.extend_from_slice(&unit.data);
        }
        buf.freeze()
    }
}

/// One codec frame, optionally with in-band codec state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedUnit {
    pub codec: CodecId,
    /// Codec state transmitted alongside the frame, for stateful codecs
    pub state: Option<Bytes>,
    pub data: Bytes,
}

impl CodedUnit {
    pub fn new(codec: CodecId, data: Bytes) -> Self {
        Self {
            codec,
            state: None,
            data,
        }
    }

    pub fn with_state(codec: CodecId, state: Bytes, data: Bytes) -> Self {
        Self {
            codec,
            state: Some(state),
            data,
        }
    }

    /// Length on the wire (state followed by data)
    pub fn wire_len(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.len()) + self.data.len()
    }
}

/// One representation of an audio interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    /// Encoded by some codec, not yet decoded
    Coded(CodedUnit),
    /// Native PCM, decoded or synthesized
    Audio(AudioFrame),
}

/// Alternative representations of the same audio interval
///
/// Index 0 is the primary; redundant and fallback encodings are appended.
/// A unit with no representations is a placeholder for a known loss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaUnit {
    pub reps: Vec<Representation>,
}

impl MediaUnit {
    /// A media unit holding a single coded representation
    pub fn coded(unit: CodedUnit) -> Self {
        Self {
            reps: vec![Representation::Coded(unit)],
        }
    }

    /// A media unit holding native audio only
    pub fn audio(frame: AudioFrame) -> Self {
        Self {
            reps: vec![Representation::Audio(frame)],
        }
    }

    /// An empty unit marking an interval known to be missing (or, on the
    /// encode side, silence)
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.reps.is_empty()
    }

    /// Coded representations in preference order
    pub fn coded_reps(&self) -> impl Iterator<Item = &CodedUnit> {
        self.reps.iter().filter_map(|r| match r {
            Representation::Coded(unit) => Some(unit),
            Representation::Audio(_) => None,
        })
    }

    /// The coded representation produced by `codec`, if any
    pub fn coded_for(&self, codec: CodecId) -> Option<&CodedUnit> {
        self.coded_reps().find(|u| u.codec == codec)
    }

    /// Native audio, if this unit has been decoded or synthesized
    pub fn decoded(&self) -> Option<&AudioFrame> {
        self.reps.iter().find_map(|r| match r {
            Representation::Audio(frame) => Some(frame),
            Representation::Coded(_) => None,
        })
    }

    /// Attach (or replace) the native audio representation
    pub fn set_decoded(&mut self, frame: AudioFrame) {
        for rep in self.reps.iter_mut() {
            if let Representation::Audio(existing) = rep {
                *existing = frame;
                return;
            }
        }
        self.reps.push(Representation::Audio(frame));
    }

    /// Insert a primary encoding at index 0
    ///
    /// Returns `false` if a representation from the same codec is already present.
    pub fn add_primary(&mut self, unit: CodedUnit) -> bool {
        if self.coded_for(unit.codec).is_some() {
            return false;
        }
        self.reps.insert(0, Representation::Coded(unit));
        true
    }

    /// Append a redundant encoding
    ///
    /// Returns `false` if a representation from the same codec is already present.
    pub fn add_redundant(&mut self, unit: CodedUnit) -> bool {
        if self.coded_for(unit.codec).is_some() {
            return false;
        }
        self.reps.push(Representation::Coded(unit));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    #[test]
    fn test_primary_goes_first_redundant_appended() {
        let primary = CodedUnit::new(CodecId(1), Bytes::from_static(&[1, 2]));
        let redundant = CodedUnit::new(CodecId(2), Bytes::from_static(&[3]));

        let mut unit = MediaUnit::coded(redundant.clone());
        assert!(unit.add_primary(primary.clone()));
        assert!(!unit.add_redundant(redundant.clone()));

        let codecs: Vec<CodecId> = unit.coded_reps().map(|u| u.codec).collect();
        assert_eq!(codecs, vec![CodecId(1), CodecId(2)]);
    }

    #[test]
    fn test_decoded_representation_replaced() {
        let mut unit = MediaUnit::placeholder();
        assert!(unit.is_placeholder());
        unit.set_decoded(AudioFrame::silence(AudioFormat::telephony(), 160));
        unit.set_decoded(AudioFrame::silence(AudioFormat::telephony(), 80));
        assert_eq!(unit.reps.len(), 1);
        assert_eq!(unit.decoded().map(|f| f.samples.len()), Some(80));
    }

    #[test]
    fn test_channel_data_concatenation() {
        let data = ChannelData::new(vec![
            ChannelUnit::new(121, Bytes::from_static(&[0xaa])),
            ChannelUnit::new(121, Bytes::from_static(&[0xbb, 0xcc])),
        ]);
        assert_eq!(data.payload_len(), 3);
        assert_eq!(&data.to_payload()[..], &[0xaa, 0xbb, 0xcc]);
        assert_eq!(data.payload_type(), Some(121));
    }
}
