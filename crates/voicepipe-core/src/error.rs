use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate devices: {0}")]
    DeviceEnumeration(String),

    #[error("failed to build stream: {0}")]
    StreamBuild(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("audio clock has been released")]
    ClockClosed,

    #[error("failed to resume audio clock: {0}")]
    ResumeFailed(String),

    #[error("failed to schedule voice: {0}")]
    ScheduleFailed(String),

    #[error("failed to resample: {0}")]
    Resample(String),
}

/// Failure while decoding or playing a single audio item.
///
/// The variant decides the queue's reaction: decode failures skip the item,
/// context and playback failures are retried (unless the item is streaming).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("audio context error: {0}")]
    Context(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("unclassified playback failure: {0}")]
    Other(String),
}

/// Coarse failure class used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Decode,
    Context,
    Playback,
}

impl PlaybackError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Decode(_) => FailureClass::Decode,
            Self::Context(_) => FailureClass::Context,
            Self::Playback(_) | Self::Other(_) => FailureClass::Playback,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != FailureClass::Decode
    }
}

impl From<AudioError> for PlaybackError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::ClockClosed | AudioError::ResumeFailed(_) => Self::Context(e.to_string()),
            AudioError::ScheduleFailed(_) | AudioError::StreamError(_) => {
                Self::Playback(e.to_string())
            }
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported sample rate {0} Hz")]
    SampleRate(u32),

    #[error("unsupported channel count {0}")]
    Channels(u16),

    #[error("unsupported bits per sample {0}")]
    BitsPerSample(u16),
}

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid audio format: {0}")]
    InvalidFormat(#[from] FormatError),

    #[error("playback queue is unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid audio format in control message: {0}")]
    InvalidFormat(#[from] FormatError),

    #[error("invalid {field} in control message: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failure of a session-level control, wrapping the component that failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unclassified_failure_is_playback_class() {
        let e = PlaybackError::Other("boom".to_string());
        assert_eq!(e.class(), FailureClass::Playback);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_decode_failure_not_retryable() {
        assert!(!PlaybackError::Decode("bad header".into()).is_retryable());
        assert!(PlaybackError::Context("suspended".into()).is_retryable());
    }

    #[test]
    fn test_audio_error_maps_to_context() {
        let e: PlaybackError = AudioError::ResumeFailed("denied".into()).into();
        assert_eq!(e.class(), FailureClass::Context);
        let e: PlaybackError = AudioError::ClockClosed.into();
        assert_eq!(e.class(), FailureClass::Context);
    }

    #[test]
    fn test_audio_error_maps_to_playback() {
        let e: PlaybackError = AudioError::ScheduleFailed("device gone".into()).into();
        assert_eq!(e.class(), FailureClass::Playback);
    }

    #[test]
    fn test_session_error_is_transparent() {
        let e: SessionError = QueueError::EmptyPayload.into();
        assert_eq!(e.to_string(), "payload is empty");
    }

    #[test]
    fn test_config_error_invalid_message() {
        let e = ConfigError::invalid("vad.threshold", "must be within 0..=1");
        assert_eq!(e.to_string(), "invalid vad.threshold: must be within 0..=1");
    }
}
