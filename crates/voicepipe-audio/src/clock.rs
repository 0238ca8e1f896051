use crate::backend::{ClockState, OutputBackend};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use voicepipe_core::AudioError;

type BackendFactory = Box<dyn Fn() -> Result<Arc<dyn OutputBackend>, AudioError> + Send + Sync>;

/// The one output backend shared by every playback component.
///
/// The backend is created lazily on first `acquire()` so no device is opened
/// before audio actually needs to play. Streaming playback and the queue
/// schedule against the same instance, which keeps their timelines on one
/// clock. Once released, the clock refuses to hand out a backend again.
pub struct SharedAudioClock {
    factory: BackendFactory,
    backend: Mutex<Option<Arc<dyn OutputBackend>>>,
    released: AtomicBool,
    generation: AtomicU64,
}

impl SharedAudioClock {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn OutputBackend>, AudioError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            backend: Mutex::new(None),
            released: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Get the backend, creating it on first use.
    pub fn acquire(&self) -> Result<Arc<dyn OutputBackend>, AudioError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AudioError::ClockClosed);
        }
        let mut slot = self
            .backend
            .lock()
            .map_err(|_| AudioError::StreamError("audio clock lock poisoned".to_string()))?;
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend = (self.factory)()?;
        tracing::info!(
            "audio clock created: backend={}, sample_rate={}",
            backend.name(),
            backend.sample_rate()
        );
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Make sure the backend is running, resuming it if suspended.
    /// Returns `false` if the backend has been closed underneath us.
    pub async fn ensure_ready(&self) -> Result<bool, AudioError> {
        let backend = self.acquire()?;
        match backend.state() {
            ClockState::Running => Ok(true),
            ClockState::Closed => Ok(false),
            ClockState::Suspended => {
                backend.resume().await?;
                tracing::debug!("audio clock resumed");
                Ok(true)
            }
        }
    }

    /// Close the current backend and create a fresh one.
    pub fn rebuild(&self) -> Result<(), AudioError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AudioError::ClockClosed);
        }
        let mut slot = self
            .backend
            .lock()
            .map_err(|_| AudioError::StreamError("audio clock lock poisoned".to_string()))?;
        if let Some(old) = slot.take() {
            old.close();
        }
        let backend = (self.factory)()?;
        *slot = Some(backend);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("audio clock rebuilt (generation {})", generation);
        Ok(())
    }

    /// Close the backend for good. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.backend.lock() {
            if let Some(backend) = slot.take() {
                backend.close();
            }
        }
        tracing::info!("audio clock released");
    }

    pub fn state(&self) -> ClockState {
        if self.released.load(Ordering::SeqCst) {
            return ClockState::Closed;
        }
        match self.backend.lock() {
            Ok(slot) => slot
                .as_ref()
                .map_or(ClockState::Suspended, |b| b.state()),
            Err(_) => ClockState::Closed,
        }
    }

    /// Number of rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
