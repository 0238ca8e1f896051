use crate::backend::ScheduledVoice;
use crate::clock::SharedAudioClock;
use crate::gain::GainNode;
use crate::pcm;
use crate::task::TaskGuard;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Notify};
use voicepipe_core::{
    AudioError, EnqueueMetadata, HealthLevel, ItemId, PlaybackError, QueueConfig, QueueError,
    QueueItem, QueueItemKind, QueueStatus,
};

/// Per-item notifications from the queue worker.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Started { id: ItemId },
    Finished { id: ItemId },
    Retrying { id: ItemId, attempt: u32 },
    Skipped { id: ItemId, error: PlaybackError },
    /// The error threshold was crossed; nothing plays until `recover()`.
    Halted { error_count: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub error_count: u32,
    pub is_recovering: bool,
    pub level: HealthLevel,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Health {
    error_count: u32,
    is_recovering: bool,
}

impl Health {
    fn record_success(&mut self) {
        self.error_count = self.error_count.saturating_sub(1);
    }

    fn record_failure(&mut self, threshold: u32) -> bool {
        self.error_count += 1;
        if self.error_count >= threshold {
            self.is_recovering = true;
        }
        self.is_recovering
    }

    fn level(&self) -> HealthLevel {
        if self.is_recovering {
            HealthLevel::Paused
        } else if self.error_count > 0 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }
}

struct CurrentItem {
    item: QueueItem,
    gain: Arc<GainNode>,
    cancel: Arc<Notify>,
}

struct QueueInner {
    clock: Arc<SharedAudioClock>,
    config: QueueConfig,
    stop_ramp: Duration,
    pending: VecDeque<QueueItem>,
    current: Option<CurrentItem>,
    worker: Option<TaskGuard>,
    /// Bumped by stop/pause/recover so a superseded worker leaves state alone.
    generation: u64,
    paused: bool,
    health: Health,
    last_error: Option<String>,
    next_id: ItemId,
    volume: f32,
    muted: bool,
    status_tx: watch::Sender<QueueStatus>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl QueueInner {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            is_playing: self.current.is_some(),
            is_paused: self.paused,
            queue_length: self.pending.len() + usize::from(self.current.is_some()),
            last_error: self.last_error.clone(),
            is_healthy: !self.health.is_recovering,
            health: self.health.level(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn can_run(&self) -> bool {
        !self.paused && !self.health.is_recovering && !self.pending.is_empty()
    }

    /// Fade out and abandon the item currently playing, if any.
    fn cancel_current(&mut self) -> Option<QueueItem> {
        let current = self.current.take()?;
        let ramp = self.stop_ramp;
        match self.clock.acquire() {
            Ok(backend) => {
                current.gain.fade_out(backend.now(), ramp.as_secs_f64());
                let gain = Arc::clone(&current.gain);
                tokio::spawn(async move {
                    tokio::time::sleep(ramp).await;
                    gain.disconnect();
                });
            }
            Err(_) => current.gain.disconnect(),
        }
        current.cancel.notify_one();
        Some(current.item)
    }

    /// Drop the worker and invalidate anything it was doing.
    fn halt_worker(&mut self) {
        self.generation += 1;
        self.worker = None;
    }

    /// Pop the head item and publish the shorter queue.
    fn take_next(&mut self) -> Option<QueueItem> {
        let item = self.pending.pop_front()?;
        self.publish();
        Some(item)
    }
}

enum Outcome {
    Played,
    Cancelled,
    Failed(PlaybackError),
}

/// Single-flight FIFO player for standalone audio clips.
///
/// Items are decoded and played one at a time on the shared clock. Context
/// and playback failures are retried with exponential backoff; decode
/// failures skip the item. Too many recent failures halt the queue until
/// `recover()` rebuilds the output.
pub struct PlaybackQueueManager {
    inner: Arc<Mutex<QueueInner>>,
    status_rx: watch::Receiver<QueueStatus>,
    event_rx: Option<mpsc::UnboundedReceiver<QueueEvent>>,
}

impl PlaybackQueueManager {
    pub fn new(clock: Arc<SharedAudioClock>, config: QueueConfig, stop_ramp: Duration) -> Self {
        let (status_tx, status_rx) = watch::channel(QueueStatus::default());
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                clock,
                config,
                stop_ramp,
                pending: VecDeque::new(),
                current: None,
                worker: None,
                generation: 0,
                paused: false,
                health: Health::default(),
                last_error: None,
                next_id: 1,
                volume: 1.0,
                muted: false,
                status_tx,
                events,
            })),
            status_rx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.event_rx.take()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status_rx.clone()
    }

    /// Append a copy of `payload` and start playback if idle.
    /// Must be called within a tokio runtime.
    pub fn enqueue(&self, payload: &[u8], metadata: EnqueueMetadata) -> Result<ItemId, QueueError> {
        if payload.is_empty() {
            return Err(QueueError::EmptyPayload);
        }
        if let Some(format) = metadata.format {
            format.validate()?;
        }
        let mut inner = self.lock()?;
        let limit = inner.config.max_item_bytes;
        if payload.len() > limit {
            return Err(QueueError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back(QueueItem {
            id,
            payload: payload.to_vec(),
            timestamp: SystemTime::now(),
            source_tag: metadata.source_tag,
            retry_count: 0,
            kind: metadata.kind,
            format: metadata.format,
        });
        tracing::debug!(
            "queued item {} ({} bytes), {} pending",
            id,
            payload.len(),
            inner.pending.len()
        );
        self.ensure_worker(&mut inner);
        inner.publish();
        Ok(id)
    }

    /// Take the head item without playing it.
    pub fn dequeue_next(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock().ok()?;
        inner.take_next()
    }

    /// Drop all pending items. The item currently playing is unaffected.
    pub fn clear(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let dropped = inner.pending.len();
        inner.pending.clear();
        if dropped > 0 {
            tracing::info!("cleared {} pending item(s)", dropped);
        }
        inner.publish();
        dropped
    }

    /// Remove an item by id, stopping it if it is the one playing.
    pub fn remove(&self, id: ItemId) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let removed = if inner.current.as_ref().is_some_and(|c| c.item.id == id) {
            inner.cancel_current().is_some()
        } else if let Some(pos) = inner.pending.iter().position(|i| i.id == id) {
            inner.pending.remove(pos).is_some()
        } else {
            false
        };
        inner.publish();
        removed
    }

    /// Clear everything and stop the current item.
    pub fn stop(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.halt_worker();
        inner.pending.clear();
        if let Some(item) = inner.cancel_current() {
            tracing::info!("stopped item {}", item.id);
        }
        inner.publish();
    }

    /// Stop the current item and hold the queue. The interrupted item goes
    /// back to the head and restarts from the beginning on `resume()`.
    pub fn pause(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.paused {
            return;
        }
        inner.paused = true;
        inner.halt_worker();
        if let Some(item) = inner.cancel_current() {
            inner.pending.push_front(item);
        }
        tracing::info!("queue paused");
        inner.publish();
    }

    pub fn resume(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.paused {
            return;
        }
        inner.paused = false;
        tracing::info!("queue resumed");
        self.ensure_worker(&mut inner);
        inner.publish();
    }

    /// Rebuild the output and clear the failure count, then resume any
    /// pending items. On rebuild failure the health state is left as it was.
    pub fn recover(&self) -> Result<(), AudioError> {
        let clock = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| AudioError::StreamError("queue lock poisoned".to_string()))?;
            inner.halt_worker();
            if let Some(item) = inner.cancel_current() {
                inner.pending.push_front(item);
            }
            Arc::clone(&inner.clock)
        };

        if let Err(e) = clock.rebuild() {
            tracing::error!("queue recovery failed: {}", e);
            if let Ok(mut inner) = self.inner.lock() {
                inner.last_error = Some(e.to_string());
                // A healthy queue keeps playing what it has.
                self.ensure_worker(&mut inner);
                inner.publish();
            }
            return Err(e);
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| AudioError::StreamError("queue lock poisoned".to_string()))?;
        inner.health = Health::default();
        inner.last_error = None;
        tracing::info!("queue recovered, {} item(s) pending", inner.pending.len());
        self.ensure_worker(&mut inner);
        inner.publish();
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        match self.inner.lock() {
            Ok(inner) => HealthReport {
                error_count: inner.health.error_count,
                is_recovering: inner.health.is_recovering,
                level: inner.health.level(),
                last_error: inner.last_error.clone(),
            },
            Err(_) => HealthReport {
                error_count: 0,
                is_recovering: true,
                level: HealthLevel::Paused,
                last_error: Some("queue lock poisoned".to_string()),
            },
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.status_rx.borrow().clone()
    }

    /// Pending items plus the one playing.
    pub fn queue_length(&self) -> usize {
        self.status().queue_length
    }

    pub fn is_playing(&self) -> bool {
        self.status().is_playing
    }

    pub fn set_volume(&self, volume: f32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.volume = volume.clamp(0.0, 1.0);
            if let Some(current) = &inner.current {
                current.gain.set_volume(inner.volume);
            }
        }
    }

    pub fn set_muted(&self, muted: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.muted = muted;
            if let Some(current) = &inner.current {
                current.gain.set_muted(muted);
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Unavailable)
    }

    fn ensure_worker(&self, inner: &mut QueueInner) {
        if inner.worker.is_some() || !inner.can_run() {
            return;
        }
        let generation = inner.generation;
        let shared = Arc::clone(&self.inner);
        inner.worker = Some(TaskGuard::spawn(run_worker(shared, generation)));
    }
}

impl Drop for PlaybackQueueManager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.halt_worker();
            if let Some(current) = inner.current.take() {
                current.gain.disconnect();
                current.cancel.notify_one();
            }
        }
    }
}

async fn run_worker(shared: Arc<Mutex<QueueInner>>, generation: u64) {
    loop {
        let (item, clock, gain, cancel) = {
            let Ok(mut inner) = shared.lock() else {
                return;
            };
            if inner.generation != generation {
                return;
            }
            if !inner.can_run() {
                if let Some(worker) = inner.worker.take() {
                    worker.disarm();
                }
                inner.publish();
                return;
            }
            let Some(item) = inner.take_next() else {
                return;
            };
            let gain = Arc::new(GainNode::new(inner.volume, inner.muted));
            let cancel = Arc::new(Notify::new());
            inner.current = Some(CurrentItem {
                item: item.clone(),
                gain: Arc::clone(&gain),
                cancel: Arc::clone(&cancel),
            });
            inner.emit(QueueEvent::Started { id: item.id });
            inner.publish();
            (item, Arc::clone(&inner.clock), gain, cancel)
        };

        let outcome = play_item(&clock, &item, gain, &cancel).await;

        let backoff = {
            let Ok(mut inner) = shared.lock() else {
                return;
            };
            if inner.generation != generation {
                return;
            }
            inner.current = None;
            let backoff = apply_outcome(&mut inner, item, outcome);
            if inner.health.is_recovering {
                if let Some(worker) = inner.worker.take() {
                    worker.disarm();
                }
                inner.publish();
                return;
            }
            inner.publish();
            backoff
        };

        if let Some(delay) = backoff {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Update health and the queue for a finished attempt. Returns the backoff
/// to wait before the next attempt if the item was requeued.
fn apply_outcome(inner: &mut QueueInner, mut item: QueueItem, outcome: Outcome) -> Option<Duration> {
    match outcome {
        Outcome::Played => {
            inner.health.record_success();
            tracing::debug!("item {} finished", item.id);
            inner.emit(QueueEvent::Finished { id: item.id });
            None
        }
        Outcome::Cancelled => {
            tracing::debug!("item {} removed while playing", item.id);
            None
        }
        Outcome::Failed(error) => {
            tracing::warn!("item {} failed: {}", item.id, error);
            inner.last_error = Some(error.to_string());
            let retry = error.is_retryable()
                && item.kind == QueueItemKind::Normal
                && item.retry_count < inner.config.max_retries;

            let backoff = if retry {
                item.retry_count += 1;
                let delay = inner.config.backoff(item.retry_count);
                inner.emit(QueueEvent::Retrying {
                    id: item.id,
                    attempt: item.retry_count,
                });
                inner.pending.push_front(item);
                Some(delay)
            } else {
                inner.emit(QueueEvent::Skipped { id: item.id, error });
                None
            };

            let threshold = inner.config.error_threshold;
            if inner.health.record_failure(threshold) {
                tracing::error!(
                    "{} playback failures, halting queue until recovery",
                    inner.health.error_count
                );
                inner.emit(QueueEvent::Halted {
                    error_count: inner.health.error_count,
                });
            }
            backoff
        }
    }
}

async fn play_item(
    clock: &SharedAudioClock,
    item: &QueueItem,
    gain: Arc<GainNode>,
    cancel: &Notify,
) -> Outcome {
    let payload = item.payload.clone();
    let format = item.format;
    let decoded = match tokio::task::spawn_blocking(move || pcm::decode_payload(&payload, format))
        .await
    {
        Ok(Ok(decoded)) => decoded,
        Ok(Err(e)) => return Outcome::Failed(e),
        Err(e) => return Outcome::Failed(PlaybackError::Other(e.to_string())),
    };

    match clock.ensure_ready().await {
        Ok(true) => {}
        Ok(false) => {
            return Outcome::Failed(PlaybackError::Context("audio clock is closed".to_string()))
        }
        Err(e) => return Outcome::Failed(e.into()),
    }
    let backend = match clock.acquire() {
        Ok(b) => b,
        Err(e) => return Outcome::Failed(e.into()),
    };

    let voice = ScheduledVoice {
        samples: decoded.samples.into(),
        sample_rate: decoded.sample_rate,
        start_at: backend.now(),
        gain,
    };
    let duration = Duration::from_secs_f64(voice.duration());
    if let Err(e) = backend.schedule(voice) {
        return Outcome::Failed(e.into());
    }
    tracing::debug!(
        "playing item {} from '{}' ({:.2}s)",
        item.id,
        item.source_tag,
        duration.as_secs_f64()
    );

    tokio::select! {
        _ = tokio::time::sleep(duration) => Outcome::Played,
        _ = cancel.notified() => Outcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_output::{virtual_clock, VirtualProbe};

    fn manager() -> (
        PlaybackQueueManager,
        mpsc::UnboundedReceiver<QueueEvent>,
        Arc<VirtualProbe>,
    ) {
        let (clock, probe) = virtual_clock(24000);
        let mut q = PlaybackQueueManager::new(
            clock,
            QueueConfig::default(),
            Duration::from_millis(100),
        );
        let rx = q.take_event_receiver().unwrap();
        (q, rx, probe)
    }

    fn pcm(samples: usize) -> Vec<u8> {
        vec![0x20; samples * 2]
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
        rx.recv().await.expect("queue event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_play_in_fifo_order() {
        let (q, mut rx, probe) = manager();
        let a = q.enqueue(&[0u8; 100], EnqueueMetadata::tagged("a")).unwrap();
        let b = q.enqueue(&[0u8; 200], EnqueueMetadata::tagged("b")).unwrap();
        let c = q.enqueue(&[0u8; 150], EnqueueMetadata::tagged("c")).unwrap();
        assert_eq!(q.queue_length(), 3);

        let mut lengths = Vec::new();
        for id in [a, b, c] {
            assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id });
            lengths.push(q.queue_length());
            assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id });
        }
        assert_eq!(lengths, vec![3, 2, 1]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.queue_length(), 0);
        assert!(!q.is_playing());
        let played: Vec<usize> = probe.scheduled().iter().map(|v| v.samples.len()).collect();
        assert_eq!(played, vec![50, 100, 75]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_playback() {
        let (q, _rx, probe) = manager();
        for _ in 0..3 {
            q.enqueue(&pcm(2400), EnqueueMetadata::tagged("clip")).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let voices = probe.scheduled();
        assert_eq!(voices.len(), 3);
        for pair in voices.windows(2) {
            assert!(pair[1].start_at >= pair[0].end_at() - 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_validation() {
        let (q, _rx, _probe) = manager();
        assert_eq!(
            q.enqueue(&[], EnqueueMetadata::default()),
            Err(QueueError::EmptyPayload)
        );
        let too_big = vec![0u8; 10 * 1024 * 1024 + 1];
        assert!(matches!(
            q.enqueue(&too_big, EnqueueMetadata::default()),
            Err(QueueError::PayloadTooLarge { .. })
        ));
        let meta = EnqueueMetadata {
            format: Some(voicepipe_core::AudioFormat::pcm16(1000, 1)),
            ..EnqueueMetadata::default()
        };
        assert!(matches!(
            q.enqueue(&[0, 0], meta),
            Err(QueueError::InvalidFormat(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_skips_without_retry() {
        let (q, mut rx, _probe) = manager();
        let bad = q.enqueue(&[0x42], EnqueueMetadata::tagged("bad")).unwrap();
        let good = q.enqueue(&pcm(240), EnqueueMetadata::tagged("good")).unwrap();

        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: bad });
        assert!(matches!(
            next_event(&mut rx).await,
            QueueEvent::Skipped { id, error: PlaybackError::Decode(_) } if id == bad
        ));
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: good });
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id: good });
        assert_eq!(q.health().error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_failure_retried_with_backoff() {
        let (q, mut rx, probe) = manager();
        probe.fail_schedules(2);
        let id = q.enqueue(&pcm(240), EnqueueMetadata::tagged("flaky")).unwrap();

        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id });
        assert_eq!(next_event(&mut rx).await, QueueEvent::Retrying { id, attempt: 1 });
        let t0 = tokio::time::Instant::now();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id });
        assert_eq!(t0.elapsed(), Duration::from_millis(250));
        assert_eq!(next_event(&mut rx).await, QueueEvent::Retrying { id, attempt: 2 });
        let t1 = tokio::time::Instant::now();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id });
        assert_eq!(t1.elapsed(), Duration::from_millis(500));
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id });

        // Two failures, one success.
        assert_eq!(q.health().error_count, 1);
        assert_eq!(q.health().level, HealthLevel::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_item_not_retried() {
        let (q, mut rx, probe) = manager();
        probe.fail_schedules(1);
        let meta = EnqueueMetadata {
            source_tag: "live".to_string(),
            kind: QueueItemKind::Streaming,
            format: None,
        };
        let id = q.enqueue(&pcm(240), meta).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id });
        assert!(matches!(
            next_event(&mut rx).await,
            QueueEvent::Skipped { error: PlaybackError::Playback(_), .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_threshold_halts_then_recover_resumes() {
        let (q, mut rx, probe) = manager();
        probe.fail_schedules(usize::MAX);
        let a = q.enqueue(&pcm(240), EnqueueMetadata::tagged("a")).unwrap();
        let b = q.enqueue(&pcm(240), EnqueueMetadata::tagged("b")).unwrap();

        loop {
            if let QueueEvent::Halted { error_count } = next_event(&mut rx).await {
                assert_eq!(error_count, 5);
                break;
            }
        }
        let health = q.health();
        assert!(health.is_recovering);
        assert_eq!(health.level, HealthLevel::Paused);
        assert!(health.last_error.is_some());
        let status = q.status();
        assert!(!status.is_healthy);
        assert!(!status.is_playing);

        // Item a exhausted its retries; b failed twice and waits at the head.
        assert_eq!(q.queue_length(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        probe.clear_faults();
        q.recover().unwrap();
        assert_eq!(probe.backends_created(), 2);
        let health = q.health();
        assert_eq!(health.error_count, 0);
        assert!(!health.is_recovering);
        assert!(q.status().is_healthy);

        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: b });
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id: b });
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_counter_floors_at_zero() {
        let mut health = Health::default();
        health.record_success();
        assert_eq!(health.error_count, 0);
        assert!(!health.record_failure(5));
        health.record_success();
        assert_eq!(health.level(), HealthLevel::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_current_item() {
        let (q, mut rx, _probe) = manager();
        let a = q.enqueue(&pcm(24000), EnqueueMetadata::tagged("long")).unwrap();
        q.enqueue(&pcm(240), EnqueueMetadata::tagged("x")).unwrap();
        q.enqueue(&pcm(240), EnqueueMetadata::tagged("y")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });

        assert_eq!(q.clear(), 2);
        assert_eq!(q.queue_length(), 1);
        assert!(q.is_playing());
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id: a });
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_pending_and_current() {
        let (q, mut rx, probe) = manager();
        let a = q.enqueue(&pcm(24000), EnqueueMetadata::tagged("a")).unwrap();
        let b = q.enqueue(&pcm(240), EnqueueMetadata::tagged("b")).unwrap();
        let c = q.enqueue(&pcm(240), EnqueueMetadata::tagged("c")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });

        assert!(q.remove(b));
        assert!(!q.remove(b));
        assert!(q.remove(a));
        let gain = Arc::clone(&probe.scheduled()[0].gain);
        assert!(gain.is_fading());

        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: c });
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id: c });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(gain.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_everything() {
        let (q, mut rx, _probe) = manager();
        let a = q.enqueue(&pcm(24000), EnqueueMetadata::tagged("a")).unwrap();
        q.enqueue(&pcm(240), EnqueueMetadata::tagged("b")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });

        q.stop();
        assert_eq!(q.queue_length(), 0);
        assert!(!q.is_playing());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        // The queue accepts new work after a stop.
        let d = q.enqueue(&pcm(240), EnqueueMetadata::tagged("d")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: d });
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_requeues_current_and_resume_restarts_it() {
        let (q, mut rx, probe) = manager();
        let a = q.enqueue(&pcm(24000), EnqueueMetadata::tagged("a")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });

        q.pause();
        let status = q.status();
        assert!(status.is_paused);
        assert!(!status.is_playing);
        assert_eq!(status.queue_length, 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        q.resume();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });
        assert_eq!(next_event(&mut rx).await, QueueEvent::Finished { id: a });
        assert_eq!(probe.schedule_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_watch_tracks_length() {
        let (q, _rx, _probe) = manager();
        let mut status = q.subscribe();
        q.enqueue(&pcm(240), EnqueueMetadata::tagged("a")).unwrap();
        status.changed().await.unwrap();
        assert!(status.borrow().queue_length >= 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(status.borrow_and_update().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_applies_to_current_item() {
        let (q, mut rx, probe) = manager();
        let a = q.enqueue(&pcm(24000), EnqueueMetadata::tagged("a")).unwrap();
        assert_eq!(next_event(&mut rx).await, QueueEvent::Started { id: a });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.set_volume(0.3);
        q.set_muted(true);
        let gain = Arc::clone(&probe.scheduled()[0].gain);
        assert!((gain.volume() - 0.3).abs() < 1e-6);
        assert!(gain.is_muted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_next_takes_head() {
        let (q, _rx, _probe) = manager();
        q.pause();
        let a = q.enqueue(&pcm(240), EnqueueMetadata::tagged("a")).unwrap();
        let b = q.enqueue(&pcm(240), EnqueueMetadata::tagged("b")).unwrap();

        assert_eq!(q.dequeue_next().map(|i| i.id), Some(a));
        assert_eq!(q.queue_length(), 1);
        assert_eq!(q.dequeue_next().map(|i| i.id), Some(b));
        assert!(q.dequeue_next().is_none());
        assert_eq!(q.status().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recover_keeps_healthy_queue_healthy() {
        let (clock, _probe) = virtual_clock(24000);
        let q = PlaybackQueueManager::new(
            Arc::clone(&clock),
            QueueConfig::default(),
            Duration::from_millis(100),
        );
        clock.release();

        assert!(q.recover().is_err());
        let health = q.health();
        assert!(!health.is_recovering);
        assert_eq!(health.error_count, 0);
        assert_eq!(health.level, HealthLevel::Healthy);
        assert!(health.last_error.is_some());
        assert!(q.status().is_healthy);
    }
}
