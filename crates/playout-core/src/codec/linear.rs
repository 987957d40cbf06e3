//! Linear PCM reference codecs
//!
//! `L16` carries 16-bit big-endian samples, `L8` keeps only the high byte of
//! each sample. Both use 20 ms frames and no in-band state. They give the
//! pipeline real frame geometry to work with and a cheap low-rate secondary
//! encoding for redundancy.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Codec, CodecId, CodecInfo, Decoder, Encoder};
use crate::audio::{AudioFormat, AudioFrame};
use crate::error::{Error, Result};
use crate::unit::CodedUnit;

/// Frame length shared by the linear codecs
pub const FRAME_MS: u32 = 20;

fn linear_info(prefix: &str, format: AudioFormat, payload_type: u8, bytes_per_sample: usize) -> CodecInfo {
    let samples_per_frame = (format.sample_rate * FRAME_MS / 1000) as usize;
    let layout = if format.channels == 1 { "MONO" } else { "STEREO" };
    CodecInfo {
        name: format!("{}-{}K-{}", prefix, format.sample_rate / 1000, layout),
        payload_type,
        format,
        samples_per_frame,
        bytes_per_frame: samples_per_frame * format.channels as usize * bytes_per_sample,
        state_bytes: 0,
    }
}

fn check_frame(info: &CodecInfo, frame: &AudioFrame) -> Result<()> {
    if frame.format != info.format {
        return Err(Error::Codec(format!(
            "{} expects {:?}, got {:?}",
            info.name, info.format, frame.format
        )));
    }
    if frame.samples_per_channel() != info.samples_per_frame {
        return Err(Error::Codec(format!(
            "{} expects {} samples per frame, got {}",
            info.name,
            info.samples_per_frame,
            frame.samples_per_channel()
        )));
    }
    Ok(())
}

fn check_unit(info: &CodecInfo, unit: &CodedUnit) -> Result<()> {
    if unit.data.len() != info.bytes_per_frame {
        return Err(Error::Codec(format!(
            "{} frame must be {} bytes, got {}",
            info.name,
            info.bytes_per_frame,
            unit.data.len()
        )));
    }
    Ok(())
}

/// 16-bit linear PCM
#[derive(Debug, Clone)]
pub struct Linear16Codec {
    info: CodecInfo,
}

impl Linear16Codec {
    pub fn new(format: AudioFormat, payload_type: u8) -> Self {
        Self {
            info: linear_info("L16", format, payload_type, 2),
        }
    }
}

impl Codec for Linear16Codec {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn new_encoder(&self, id: CodecId) -> Box<dyn Encoder> {
        Box::new(Linear16Encoder {
            id,
            info: self.info.clone(),
        })
    }

    fn new_decoder(&self) -> Box<dyn Decoder> {
        Box::new(Linear16Decoder {
            info: self.info.clone(),
        })
    }
}

#[derive(Debug)]
struct Linear16Encoder {
    id: CodecId,
    info: CodecInfo,
}

impl Encoder for Linear16Encoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<CodedUnit> {
        check_frame(&self.info, frame)?;
        let mut buf = BytesMut::with_capacity(self.info.bytes_per_frame);
        for &sample in &frame.samples {
            buf.put_i16(sample);
        }
        Ok(CodedUnit::new(self.id, buf.freeze()))
    }
}

#[derive(Debug)]
struct Linear16Decoder {
    info: CodecInfo,
}

impl Decoder for Linear16Decoder {
    fn decode(&mut self, unit: &CodedUnit) -> Result<AudioFrame> {
        check_unit(&self.info, unit)?;
        let samples = unit
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(AudioFrame::new(samples, self.info.format))
    }
}

/// 8-bit linear PCM (high byte of each 16-bit sample)
#[derive(Debug, Clone)]
pub struct Linear8Codec {
    info: CodecInfo,
}

impl Linear8Codec {
    pub fn new(format: AudioFormat, payload_type: u8) -> Self {
        Self {
            info: linear_info("L8", format, payload_type, 1),
        }
    }
}

impl Codec for Linear8Codec {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn new_encoder(&self, id: CodecId) -> Box<dyn Encoder> {
        Box::new(Linear8Encoder {
            id,
            info: self.info.clone(),
        })
    }

    fn new_decoder(&self) -> Box<dyn Decoder> {
        Box::new(Linear8Decoder {
            info: self.info.clone(),
        })
    }
}

#[derive(Debug)]
struct Linear8Encoder {
    id: CodecId,
    info: CodecInfo,
}

impl Encoder for Linear8Encoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<CodedUnit> {
        check_frame(&self.info, frame)?;
        let data: Vec<u8> = frame.samples.iter().map(|&s| (s >> 8) as i8 as u8).collect();
        Ok(CodedUnit::new(self.id, Bytes::from(data)))
    }
}

#[derive(Debug)]
struct Linear8Decoder {
    info: CodecInfo,
}

impl Decoder for Linear8Decoder {
    fn decode(&mut self, unit: &CodedUnit) -> Result<AudioFrame> {
        check_unit(&self.info, unit)?;
        let samples = unit.data.iter().map(|&b| ((b as i8) as i16) << 8).collect();
        Ok(AudioFrame::new(samples, self.info.format))
    }
}
