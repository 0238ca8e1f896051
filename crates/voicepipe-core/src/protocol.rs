//! Control messages exchanged with the transport collaborator.
//!
//! Audio arrives as a JSON `audio_chunk` announcement followed by one binary
//! frame; an `audio_complete` message ends the response. Everything is
//! validated here so the audio core only ever sees typed, in-range values.

use crate::error::{FormatError, ProtocolError};
use crate::types::{AudioChunk, AudioFormat};
use serde::Deserialize;

/// Message types the server sends that carry no audio. Parsed and ignored.
const PASSTHROUGH_TYPES: &[&str] = &[
    "text",
    "response",
    "status_update",
    "error",
    "pong",
    "function_call",
    "audio_received",
    "connection_info",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Pcm,
    Wav,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    AudioChunk(AudioChunkHeader),
    AudioComplete(AudioCompleteNotice),
    Other(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AudioChunkHeader {
    #[serde(default)]
    pub size: Option<usize>,

    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,

    #[serde(default = "default_streaming")]
    pub streaming: bool,

    #[serde(default)]
    pub chunk_id: Option<String>,

    #[serde(default)]
    pub chunk_count: Option<u64>,

    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct AudioCompleteNotice {
    #[serde(default)]
    pub chunks_sent: Option<u64>,

    #[serde(default)]
    pub total_size: Option<usize>,

    #[serde(default)]
    pub format: Option<String>,
}

fn default_format() -> String {
    "pcm".to_string()
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_channels() -> u16 {
    1
}

fn default_bits_per_sample() -> u16 {
    16
}

fn default_streaming() -> bool {
    true
}

impl AudioChunkHeader {
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }

    pub fn encoding(&self) -> Result<PayloadEncoding, ProtocolError> {
        match self.format.to_ascii_lowercase().as_str() {
            "pcm" | "pcm_16_16000" => Ok(PayloadEncoding::Pcm),
            "wav" => Ok(PayloadEncoding::Wav),
            other => Err(ProtocolError::InvalidField {
                field: "format",
                reason: format!("unsupported payload format '{other}'"),
            }),
        }
    }

    /// Pair the announcement with the binary frame it describes.
    pub fn into_chunk(self, data: Vec<u8>, sequence: u64) -> AudioChunk {
        AudioChunk {
            format: self.audio_format(),
            streaming: self.streaming,
            chunk_id: self.chunk_id,
            data,
            sequence,
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        self.encoding()?;
        self.audio_format().validate()?;
        if self.encoding()? == PayloadEncoding::Pcm && self.bits_per_sample != 16 {
            return Err(FormatError::BitsPerSample(self.bits_per_sample).into());
        }
        Ok(())
    }
}

impl ControlMessage {
    /// Parse and validate one text frame from the transport.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "type",
                reason: "missing or not a string".to_string(),
            })?
            .to_string();

        match kind.as_str() {
            "audio_chunk" => {
                let header: AudioChunkHeader = serde_json::from_value(value)?;
                header.validate()?;
                Ok(Self::AudioChunk(header))
            }
            "audio_complete" => Ok(Self::AudioComplete(serde_json::from_value(value)?)),
            other if PASSTHROUGH_TYPES.contains(&other) => Ok(Self::Other(other.to_string())),
            other => Err(ProtocolError::InvalidField {
                field: "type",
                reason: format!("unknown message type '{other}'"),
            }),
        }
    }
}
