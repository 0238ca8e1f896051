use crate::task::TaskGuard;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use voicepipe_core::{ConfigError, VadConfig, VadEvent, VadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirm {
    Voice,
    Silence,
}

struct VadInner {
    config: VadConfig,
    state: VadState,
    volume: f32,
    deadline: Option<TaskGuard>,
    /// Bumped whenever a pending confirmation is cancelled.
    timer_generation: u64,
    events: mpsc::UnboundedSender<VadEvent>,
}

impl VadInner {
    fn cancel_deadline(&mut self) {
        self.timer_generation += 1;
        self.deadline = None;
    }

    fn transition(&mut self, to: VadState) {
        tracing::trace!("vad {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn emit(&self, event: VadEvent) {
        tracing::debug!("vad event {:?}", event);
        let _ = self.events.send(event);
    }
}

/// Hysteresis voice detector driven by per-frame volume levels.
///
/// Crossing the threshold only starts a confirmation timer; speech is
/// declared after the level stays above the threshold for `voice_timeout`,
/// and ended after it stays at or below for `silence_timeout`. Timers run as
/// tokio tasks, so feeding volumes requires a runtime.
pub struct VoiceActivityDetector {
    inner: Arc<Mutex<VadInner>>,
    event_rx: Option<mpsc::UnboundedReceiver<VadEvent>>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(VadInner {
                config,
                state: VadState::Idle,
                volume: 0.0,
                deadline: None,
                timer_generation: 0,
                events,
            })),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<VadEvent>> {
        self.event_rx.take()
    }

    pub fn process_volume(&self, volume: f32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.volume = volume;
        let above = volume > inner.config.threshold;

        match (inner.state, above) {
            (VadState::Idle, true) => {
                inner.transition(VadState::ConfirmingVoice);
                self.arm(&mut inner, Confirm::Voice);
            }
            (VadState::ConfirmingVoice, false) => {
                inner.cancel_deadline();
                inner.transition(VadState::Idle);
            }
            (VadState::Speaking, false) => {
                inner.transition(VadState::ConfirmingSilence);
                self.arm(&mut inner, Confirm::Silence);
            }
            (VadState::ConfirmingSilence, true) => {
                inner.cancel_deadline();
                inner.transition(VadState::Speaking);
            }
            _ => {}
        }
    }

    fn arm(&self, inner: &mut VadInner, confirm: Confirm) {
        inner.cancel_deadline();
        let generation = inner.timer_generation;
        let delay = match confirm {
            Confirm::Voice => inner.config.voice_timeout(),
            Confirm::Silence => inner.config.silence_timeout(),
        };
        let weak: Weak<Mutex<VadInner>> = Arc::downgrade(&self.inner);
        inner.deadline = Some(TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(mut inner) = shared.lock() else {
                return;
            };
            if inner.timer_generation != generation {
                return;
            }
            if let Some(guard) = inner.deadline.take() {
                guard.disarm();
            }
            confirm_elapsed(&mut inner, confirm);
        }));
    }

    pub fn state(&self) -> VadState {
        self.inner.lock().map(|i| i.state).unwrap_or_default()
    }

    pub fn is_speaking(&self) -> bool {
        self.state().is_speaking()
    }

    /// Most recent volume fed in.
    pub fn volume(&self) -> f32 {
        self.inner.lock().map(|i| i.volume).unwrap_or(0.0)
    }

    pub fn config(&self) -> VadConfig {
        self.inner
            .lock()
            .map(|i| i.config.clone())
            .unwrap_or_default()
    }

    /// Replace the tunables. An invalid config is rejected and the previous
    /// one stays in effect. Pending confirmations keep their original timeout.
    pub fn update_config(&self, config: VadConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Ok(mut inner) = self.inner.lock() {
            tracing::info!(
                "vad config updated: threshold={}, voice_timeout={}ms, silence_timeout={}ms",
                config.threshold,
                config.voice_timeout_ms,
                config.silence_timeout_ms
            );
            inner.config = config;
        }
        Ok(())
    }

    /// Back to idle, cancelling any pending confirmation without emitting.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.cancel_deadline();
            inner.state = VadState::Idle;
            inner.volume = 0.0;
        }
    }
}

fn confirm_elapsed(inner: &mut VadInner, confirm: Confirm) {
    let above = inner.volume > inner.config.threshold;
    match (confirm, inner.state) {
        (Confirm::Voice, VadState::ConfirmingVoice) if above => {
            inner.transition(VadState::Speaking);
            inner.emit(VadEvent::VoiceStart);
        }
        (Confirm::Voice, VadState::ConfirmingVoice) => inner.transition(VadState::Idle),
        (Confirm::Silence, VadState::ConfirmingSilence) if !above => {
            inner.transition(VadState::Idle);
            inner.emit(VadEvent::VoiceEnd);
        }
        (Confirm::Silence, VadState::ConfirmingSilence) => inner.transition(VadState::Speaking),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn detector() -> (VoiceActivityDetector, mpsc::UnboundedReceiver<VadEvent>) {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let rx = vad.take_event_receiver().unwrap();
        (vad, rx)
    }

    /// Feed `volume` every 50ms for `total`.
    async fn feed(vad: &VoiceActivityDetector, volume: f32, total: Duration) {
        let steps = total.as_millis() / 50;
        for _ in 0..steps {
            vad.process_volume(volume);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_start_then_end() {
        let (vad, mut rx) = detector();
        let start = Instant::now();

        let feeder = async {
            feed(&vad, 0.02, Duration::from_millis(400)).await;
            feed(&vad, 0.0, Duration::from_millis(2000)).await;
        };
        let mut events = Vec::new();
        let collector = async {
            while let Some(ev) = rx.recv().await {
                events.push((ev, start.elapsed()));
                if ev == VadEvent::VoiceEnd {
                    break;
                }
            }
        };
        tokio::join!(feeder, collector);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, VadEvent::VoiceStart);
        assert_eq!(events[0].1, Duration::from_millis(300));
        assert_eq!(events[1].0, VadEvent::VoiceEnd);
        assert_eq!(events[1].1, Duration::from_millis(1900));
        assert_eq!(vad.state(), VadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_burst_is_not_speech() {
        let (vad, mut rx) = detector();
        feed(&vad, 0.5, Duration::from_millis(200)).await;
        assert_eq!(vad.state(), VadState::ConfirmingVoice);
        feed(&vad, 0.0, Duration::from_millis(1000)).await;
        assert_eq!(vad.state(), VadState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_pause_keeps_speaking() {
        let (vad, mut rx) = detector();
        feed(&vad, 0.3, Duration::from_millis(400)).await;
        assert_eq!(rx.recv().await, Some(VadEvent::VoiceStart));

        feed(&vad, 0.0, Duration::from_millis(1000)).await;
        assert_eq!(vad.state(), VadState::ConfirmingSilence);
        assert!(vad.is_speaking());

        feed(&vad, 0.3, Duration::from_millis(1000)).await;
        assert_eq!(vad.state(), VadState::Speaking);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_exclusive() {
        let (vad, _rx) = detector();
        vad.process_volume(0.01);
        assert_eq!(vad.state(), VadState::Idle);
        vad.process_volume(0.0101);
        assert_eq!(vad.state(), VadState::ConfirmingVoice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_confirmation() {
        let (vad, mut rx) = detector();
        vad.process_volume(0.5);
        vad.reset();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(vad.state(), VadState::Idle);
        assert_eq!(vad.volume(), 0.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_rejects_invalid() {
        let (vad, _rx) = detector();
        let bad = VadConfig {
            threshold: 2.0,
            ..VadConfig::default()
        };
        assert!(vad.update_config(bad).is_err());
        assert_eq!(vad.config(), VadConfig::default());

        let good = VadConfig {
            threshold: 0.2,
            voice_timeout_ms: 100,
            silence_timeout_ms: 200,
        };
        vad.update_config(good.clone()).unwrap();
        assert_eq!(vad.config(), good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updated_timeout_applies_to_next_confirmation() {
        let (vad, mut rx) = detector();
        vad.update_config(VadConfig {
            threshold: 0.01,
            voice_timeout_ms: 100,
            silence_timeout_ms: 1500,
        })
        .unwrap();
        let start = Instant::now();
        vad.process_volume(0.5);
        assert_eq!(rx.recv().await, Some(VadEvent::VoiceStart));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_event_receiver_once() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert!(vad.take_event_receiver().is_some());
        assert!(vad.take_event_receiver().is_none());
    }
}
