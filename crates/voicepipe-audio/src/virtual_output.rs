//! Device-free output backend.
//!
//! The clock follows tokio's time source, so under a paused test runtime it
//! advances deterministically with `tokio::time::sleep`. Scheduled voices
//! are recorded instead of rendered. Used for `--output null` and in tests.

use crate::backend::{ClockState, OutputBackend, ScheduledVoice};
use crate::clock::SharedAudioClock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use voicepipe_core::AudioError;

/// Observation and fault-injection point shared by every virtual backend a
/// clock creates, so it survives rebuilds.
#[derive(Debug, Default)]
pub struct VirtualProbe {
    resume_failures: AtomicUsize,
    schedule_failures: AtomicUsize,
    backends_created: AtomicUsize,
    log: Mutex<Vec<ScheduledVoice>>,
}

impl VirtualProbe {
    /// Fail the next `n` resume attempts. `usize::MAX` fails forever.
    pub fn fail_resumes(&self, n: usize) {
        self.resume_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` schedule attempts. `usize::MAX` fails forever.
    pub fn fail_schedules(&self, n: usize) {
        self.schedule_failures.store(n, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.fail_resumes(0);
        self.fail_schedules(0);
    }

    pub fn backends_created(&self) -> usize {
        self.backends_created.load(Ordering::SeqCst)
    }

    /// Every voice accepted so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledVoice> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn schedule_count(&self) -> usize {
        self.log.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

pub struct VirtualBackend {
    origin: Instant,
    sample_rate: u32,
    state: Mutex<ClockState>,
    probe: Arc<VirtualProbe>,
}

impl VirtualBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_probe(sample_rate, Arc::new(VirtualProbe::default()))
    }

    pub fn with_probe(sample_rate: u32, probe: Arc<VirtualProbe>) -> Self {
        probe.backends_created.fetch_add(1, Ordering::SeqCst);
        Self {
            origin: Instant::now(),
            sample_rate,
            state: Mutex::new(ClockState::Suspended),
            probe,
        }
    }

    fn set_state(&self, state: ClockState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }
}

#[async_trait]
impl OutputBackend for VirtualBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ClockState {
        self.state.lock().map(|s| *s).unwrap_or(ClockState::Closed)
    }

    async fn resume(&self) -> Result<(), AudioError> {
        match self.state() {
            ClockState::Closed => return Err(AudioError::ClockClosed),
            ClockState::Running => return Ok(()),
            ClockState::Suspended => {}
        }
        if VirtualProbe::take_fault(&self.probe.resume_failures) {
            return Err(AudioError::ResumeFailed("injected resume failure".to_string()));
        }
        self.set_state(ClockState::Running);
        Ok(())
    }

    fn close(&self) {
        self.set_state(ClockState::Closed);
    }

    fn schedule(&self, voice: ScheduledVoice) -> Result<(), AudioError> {
        if self.state() == ClockState::Closed {
            return Err(AudioError::ClockClosed);
        }
        if VirtualProbe::take_fault(&self.probe.schedule_failures) {
            return Err(AudioError::ScheduleFailed(
                "injected schedule failure".to_string(),
            ));
        }
        if let Ok(mut log) = self.probe.log.lock() {
            log.push(voice);
        }
        Ok(())
    }
}

/// A clock whose backends are [`VirtualBackend`]s sharing one [`VirtualProbe`].
pub fn virtual_clock(sample_rate: u32) -> (Arc<SharedAudioClock>, Arc<VirtualProbe>) {
    let probe = Arc::new(VirtualProbe::default());
    let factory_probe = Arc::clone(&probe);
    let clock = SharedAudioClock::new(move || {
        Ok(Arc::new(VirtualBackend::with_probe(sample_rate, Arc::clone(&factory_probe)))
            as Arc<dyn OutputBackend>)
    });
    (Arc::new(clock), probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gain::GainNode;
    use std::time::Duration;

    fn silent_voice(start_at: f64) -> ScheduledVoice {
        ScheduledVoice {
            samples: vec![0.0; 240].into(),
            sample_rate: 24000,
            start_at,
            gain: Arc::new(GainNode::default()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let backend = VirtualBackend::new(24000);
        assert_eq!(backend.now(), 0.0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((backend.now() - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_starts_suspended_then_resumes() {
        let backend = VirtualBackend::new(24000);
        assert_eq!(backend.state(), ClockState::Suspended);
        backend.resume().await.unwrap();
        assert_eq!(backend.state(), ClockState::Running);
    }

    #[tokio::test]
    async fn test_injected_resume_failure_is_consumed() {
        let probe = Arc::new(VirtualProbe::default());
        let backend = VirtualBackend::with_probe(24000, Arc::clone(&probe));
        probe.fail_resumes(1);
        assert!(matches!(
            backend.resume().await,
            Err(AudioError::ResumeFailed(_))
        ));
        backend.resume().await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_records_voice() {
        let probe = Arc::new(VirtualProbe::default());
        let backend = VirtualBackend::with_probe(24000, Arc::clone(&probe));
        backend.schedule(silent_voice(0.1)).unwrap();
        backend.schedule(silent_voice(0.2)).unwrap();
        let log = probe.scheduled();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].start_at, 0.2);
    }

    #[tokio::test]
    async fn test_persistent_schedule_failure() {
        let probe = Arc::new(VirtualProbe::default());
        let backend = VirtualBackend::with_probe(24000, Arc::clone(&probe));
        probe.fail_schedules(usize::MAX);
        for _ in 0..3 {
            assert!(backend.schedule(silent_voice(0.0)).is_err());
        }
        probe.clear_faults();
        assert!(backend.schedule(silent_voice(0.0)).is_ok());
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_work() {
        let backend = VirtualBackend::new(24000);
        backend.close();
        assert!(matches!(
            backend.schedule(silent_voice(0.0)),
            Err(AudioError::ClockClosed)
        ));
        assert!(backend.resume().await.is_err());
    }
}
