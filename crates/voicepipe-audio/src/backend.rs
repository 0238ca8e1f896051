use crate::gain::GainNode;
use async_trait::async_trait;
use std::sync::Arc;
use voicepipe_core::AudioError;

/// Lifecycle of an output backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// Created but not rendering; the clock does not advance.
    Suspended,
    Running,
    Closed,
}

/// A block of mono samples bound to an absolute start time on the clock.
#[derive(Debug, Clone)]
pub struct ScheduledVoice {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Clock seconds at which the first sample plays.
    pub start_at: f64,
    pub gain: Arc<GainNode>,
}

impl ScheduledVoice {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration()
    }
}

/// An output device with a monotonic clock that voices are scheduled against.
///
/// `now()` is the single time base for every scheduling decision; it must
/// never go backwards for the lifetime of the backend.
#[async_trait]
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Current clock time in seconds.
    fn now(&self) -> f64;

    fn sample_rate(&self) -> u32;

    fn state(&self) -> ClockState;

    async fn resume(&self) -> Result<(), AudioError>;

    fn close(&self);

    fn schedule(&self, voice: ScheduledVoice) -> Result<(), AudioError>;
}
