use crate::error::FormatError;
use std::time::SystemTime;

/// PCM layout of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Response audio from the voice service: 24kHz mono PCM16.
    pub const RESPONSE: Self = Self {
        sample_rate: 24000,
        channels: 1,
        bits_per_sample: 16,
    };

    /// Capture frames sent upstream: 16kHz mono PCM16.
    pub const CAPTURE: Self = Self {
        sample_rate: 16000,
        channels: 1,
        bits_per_sample: 16,
    };

    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if !(8000..=192_000).contains(&self.sample_rate) {
            return Err(FormatError::SampleRate(self.sample_rate));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(FormatError::Channels(self.channels));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 32) {
            return Err(FormatError::BitsPerSample(self.bits_per_sample));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Size of one interleaved frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::RESPONSE
    }
}

/// One inbound network chunk of encoded audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    pub chunk_id: Option<String>,
    /// Arrival order within the session.
    pub sequence: u64,
    /// Part of a live response rather than a standalone clip.
    pub streaming: bool,
}

impl AudioChunk {
    /// Queue item kind for this chunk when it goes through the queue.
    pub fn kind(&self) -> QueueItemKind {
        if self.streaming {
            QueueItemKind::Streaming
        } else {
            QueueItemKind::Normal
        }
    }
}

/// Whether a queue item belongs to a live stream or is a standalone clip.
///
/// Streaming items are never retried; replaying them would repeat audio the
/// listener already heard part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueItemKind {
    Streaming,
    #[default]
    Normal,
}

/// Caller-supplied description of an enqueued payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueMetadata {
    pub source_tag: String,
    pub kind: QueueItemKind,
    /// Layout for raw PCM payloads. WAV payloads carry their own header.
    pub format: Option<AudioFormat>,
}

impl EnqueueMetadata {
    pub fn tagged(source_tag: &str) -> Self {
        Self {
            source_tag: source_tag.to_string(),
            ..Self::default()
        }
    }
}

pub type ItemId = u64;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: ItemId,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
    pub source_tag: String,
    pub retry_count: u32,
    pub kind: QueueItemKind,
    pub format: Option<AudioFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Idle,
    ConfirmingVoice,
    Speaking,
    ConfirmingSilence,
}

impl VadState {
    /// True while speech is considered ongoing, including the silence grace period.
    pub fn is_speaking(&self) -> bool {
        matches!(self, Self::Speaking | Self::ConfirmingSilence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    VoiceStart,
    VoiceEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_default_is_response() {
        let f = AudioFormat::default();
        assert_eq!(f.sample_rate, 24000);
        assert_eq!(f.channels, 1);
        assert_eq!(f.bits_per_sample, 16);
        assert_eq!(f.frame_bytes(), 2);
    }

    #[test]
    fn test_audio_format_validate_rejects_out_of_range() {
        assert_eq!(
            AudioFormat::pcm16(4000, 1).validate(),
            Err(FormatError::SampleRate(4000))
        );
        assert_eq!(
            AudioFormat::pcm16(16000, 0).validate(),
            Err(FormatError::Channels(0))
        );
        let f = AudioFormat {
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 12,
        };
        assert_eq!(f.validate(), Err(FormatError::BitsPerSample(12)));
        assert!(AudioFormat::CAPTURE.validate().is_ok());
    }

    #[test]
    fn test_stereo_frame_bytes() {
        assert_eq!(AudioFormat::pcm16(48000, 2).frame_bytes(), 4);
    }

    #[test]
    fn test_queue_item_kind_default_normal() {
        assert_eq!(QueueItemKind::default(), QueueItemKind::Normal);
        assert_eq!(EnqueueMetadata::tagged("cue").kind, QueueItemKind::Normal);
    }

    #[test]
    fn test_vad_state_is_speaking() {
        assert!(!VadState::Idle.is_speaking());
        assert!(!VadState::ConfirmingVoice.is_speaking());
        assert!(VadState::Speaking.is_speaking());
        assert!(VadState::ConfirmingSilence.is_speaking());
    }
}
