use crate::types::EnqueueMetadata;

/// Coarse health of the playback path, for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthLevel {
    #[default]
    Healthy,
    /// Some recent failures, still playing.
    Degraded,
    /// Error threshold crossed; processing halted until `recover()`.
    Paused,
}

/// State of the playback queue, broadcast via watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub is_playing: bool,
    pub is_paused: bool,
    pub queue_length: usize,
    pub last_error: Option<String>,
    pub is_healthy: bool,
    pub health: HealthLevel,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self {
            is_playing: false,
            is_paused: false,
            queue_length: 0,
            last_error: None,
            is_healthy: true,
            health: HealthLevel::Healthy,
        }
    }
}

/// Aggregate session state broadcast to the UI collaborator via watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub is_listening: bool,
    pub is_speaking: bool,
    pub volume: f32,
    pub is_playing: bool,
    pub queue_length: usize,
    pub last_error: Option<String>,
    pub is_healthy: bool,
    pub is_muted: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            is_listening: false,
            is_speaking: false,
            volume: 0.0,
            is_playing: false,
            queue_length: 0,
            last_error: None,
            is_healthy: true,
            is_muted: false,
        }
    }
}

/// Commands sent from the UI collaborator → session.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    StartCapture,
    StopCapture,
    EnqueueAudio {
        payload: Vec<u8>,
        metadata: EnqueueMetadata,
    },
    SetVolume(f32),
    ToggleMute,
    ClearQueue,
    Recover,
}
