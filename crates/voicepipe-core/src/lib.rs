pub mod config;
pub mod config_diff;
pub mod error;
pub mod protocol;
pub mod status_types;
pub mod types;

pub use config::{
    AppConfig, CaptureConfig, DedupConfig, GeneralConfig, OutputBackendKind, OutputConfig,
    PlaybackConfig, QueueConfig, VadConfig,
};
pub use config_diff::ConfigDiff;
pub use error::{
    AudioError, ConfigError, FailureClass, FormatError, PlaybackError, ProtocolError, QueueError,
    SessionError,
};
pub use protocol::{AudioChunkHeader, AudioCompleteNotice, ControlMessage, PayloadEncoding};
pub use status_types::{HealthLevel, QueueStatus, SessionStatus, UiCommand};
pub use types::{
    AudioChunk, AudioFormat, EnqueueMetadata, ItemId, QueueItem, QueueItemKind, VadEvent,
    VadState,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_creation() {
        let chunk = AudioChunk {
            data: vec![0, 0, 0x10, 0x00],
            format: AudioFormat::RESPONSE,
            chunk_id: Some("chunk_1".to_string()),
            sequence: 7,
            streaming: true,
        };
        assert_eq!(chunk.data.len(), 4);
        assert_eq!(chunk.format.sample_rate, 24000);
        assert_eq!(chunk.sequence, 7);
        assert_eq!(chunk.kind(), QueueItemKind::Streaming);
    }

    #[test]
    fn test_enqueue_metadata_streaming_kind() {
        let meta = EnqueueMetadata {
            source_tag: "gemini".to_string(),
            kind: QueueItemKind::Streaming,
            format: Some(AudioFormat::RESPONSE),
        };
        assert_eq!(meta.kind, QueueItemKind::Streaming);
        assert_eq!(meta.source_tag, "gemini");
    }
}
