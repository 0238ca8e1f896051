use crate::backend::ScheduledVoice;
use crate::clock::SharedAudioClock;
use crate::gain::GainNode;
use crate::pcm;
use crate::task::TaskGuard;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use voicepipe_core::{AudioFormat, PlaybackConfig};

/// Notifications from the streaming scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started { stream_id: u64 },
    /// The stream was marked complete and every scheduled block has played.
    Completed { stream_id: u64 },
    Stopped { stream_id: u64 },
    DecodeError { stream_id: u64, malformed_samples: usize },
    PlaybackError { stream_id: u64, message: String },
}

/// Samples waiting to be bound to the clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBlock {
    pub samples: Vec<f32>,
    pub scheduled_start: Option<f64>,
}

/// Point-in-time view of the active stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub stream_id: u64,
    pub sample_rate: u32,
    /// Clock time at which the next block will start.
    pub cursor: Option<f64>,
    pub complete: bool,
    pub queued_blocks: usize,
    pub scheduled_blocks: usize,
    /// End time of the last block handed to the backend.
    pub last_end: f64,
}

struct StreamSession {
    id: u64,
    cursor: Option<f64>,
    complete: bool,
    queued: VecDeque<PlaybackBlock>,
    scheduled_blocks: usize,
    last_end: f64,
    /// Clock generation the cursor was measured against.
    generation: u64,
    ticker: Option<TaskGuard>,
}

impl StreamSession {
    fn append(&mut self, mut samples: &[f32], block_size: usize) {
        let block_size = block_size.max(1);
        // Top up a short tail block first so blocks stay full-sized.
        if let Some(tail) = self.queued.back_mut() {
            if tail.samples.len() < block_size {
                let take = (block_size - tail.samples.len()).min(samples.len());
                tail.samples.extend_from_slice(&samples[..take]);
                samples = &samples[take..];
            }
        }
        for chunk in samples.chunks(block_size) {
            self.queued.push_back(PlaybackBlock {
                samples: chunk.to_vec(),
                scheduled_start: None,
            });
        }
    }
}

struct SchedulerInner {
    clock: Arc<SharedAudioClock>,
    config: PlaybackConfig,
    format: AudioFormat,
    session: Option<StreamSession>,
    next_stream_id: u64,
    gain: Arc<GainNode>,
    volume: f32,
    muted: bool,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl SchedulerInner {
    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Bind queued blocks to the clock while they fall inside the lookahead
    /// window.
    fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        // A rebuilt clock restarts its timeline; old positions mean nothing.
        let generation = self.clock.generation();
        if session.generation != generation {
            tracing::info!(
                "stream {}: audio clock rebuilt, rescheduling from now",
                session.id
            );
            session.generation = generation;
            session.cursor = None;
            session.last_end = 0.0;
        }
        if session.queued.is_empty() {
            return;
        }
        let backend = match self.clock.acquire() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("stream {}: no audio clock: {}", session.id, e);
                let event = StreamEvent::PlaybackError {
                    stream_id: session.id,
                    message: e.to_string(),
                };
                let _ = self.events.send(event);
                return;
            }
        };

        let now = backend.now();
        let horizon = now + self.config.lookahead().as_secs_f64();
        let latency = self.config.initial_buffer_latency().as_secs_f64();
        let cursor = session.cursor.get_or_insert(now + latency);

        while *cursor < horizon {
            let Some(mut block) = session.queued.pop_front() else {
                break;
            };
            let start = (*cursor).max(now);
            block.scheduled_start = Some(start);
            let voice = ScheduledVoice {
                samples: block.samples.into(),
                sample_rate: self.format.sample_rate,
                start_at: start,
                gain: Arc::clone(&self.gain),
            };
            let end = voice.end_at();
            match backend.schedule(voice) {
                Ok(()) => {
                    tracing::trace!("stream {}: block at {:.3}..{:.3}", session.id, start, end);
                    *cursor = end;
                    session.last_end = end;
                    session.scheduled_blocks += 1;
                }
                Err(e) => {
                    tracing::error!("stream {}: failed to schedule block: {}", session.id, e);
                    let _ = self.events.send(StreamEvent::PlaybackError {
                        stream_id: session.id,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// One poll tick. Returns `false` once the ticker should exit.
    fn tick(&mut self, stream_id: u64) -> bool {
        if self.session.as_ref().map(|s| s.id) != Some(stream_id) {
            return false;
        }
        self.pump();

        let now = match self.clock.acquire() {
            Ok(b) => b.now(),
            Err(_) => return true,
        };
        let done = self
            .session
            .as_ref()
            .is_some_and(|s| s.complete && s.queued.is_empty() && now >= s.last_end);
        if done {
            if let Some(mut session) = self.session.take() {
                if let Some(ticker) = session.ticker.take() {
                    ticker.disarm();
                }
                tracing::info!(
                    "stream {} completed ({} blocks)",
                    session.id,
                    session.scheduled_blocks
                );
                self.emit(StreamEvent::Completed {
                    stream_id: session.id,
                });
            }
            return false;
        }
        true
    }
}

/// Turns a live stream of PCM chunks into gapless, clock-scheduled blocks.
///
/// Blocks are scheduled back to back on the shared clock, never further
/// ahead than the lookahead window, and never in the past. A background
/// ticker keeps the window filled and detects when a completed stream has
/// finished playing.
pub struct StreamScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    event_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

impl StreamScheduler {
    pub fn new(clock: Arc<SharedAudioClock>, format: AudioFormat, config: PlaybackConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let volume = config.volume;
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                clock,
                config,
                format,
                session: None,
                next_stream_id: 1,
                gain: Arc::new(GainNode::new(volume, false)),
                volume,
                muted: false,
                events,
            })),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.event_rx.take()
    }

    /// Route events to an external channel instead of the built-in one.
    pub fn set_event_sender(&self, sender: mpsc::UnboundedSender<StreamEvent>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.events = sender;
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.inner
            .lock()
            .map(|i| i.format)
            .unwrap_or_default()
    }

    /// Decode one chunk and append it to the active stream, starting a new
    /// stream if none is active. Must be called within a tokio runtime.
    pub fn add_chunk(&self, bytes: &[u8]) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let decoded = pcm::decode_pcm(bytes, inner.format);

        if inner.session.is_none() && !decoded.samples.is_empty() {
            let id = inner.next_stream_id;
            inner.next_stream_id += 1;
            let ticker = self.spawn_ticker(id, inner.config.poll_interval());
            let generation = inner.clock.generation();
            inner.session = Some(StreamSession {
                id,
                cursor: None,
                complete: false,
                queued: VecDeque::new(),
                scheduled_blocks: 0,
                last_end: 0.0,
                generation,
                ticker: Some(ticker),
            });
            tracing::info!("stream {} started at {} Hz", id, inner.format.sample_rate);
            inner.emit(StreamEvent::Started { stream_id: id });
        }

        let stream_id = inner.session.as_ref().map_or(0, |s| s.id);
        if decoded.malformed > 0 {
            for _ in 0..decoded.malformed {
                tracing::warn!("stream {}: malformed trailing sample dropped", stream_id);
            }
            inner.emit(StreamEvent::DecodeError {
                stream_id,
                malformed_samples: decoded.malformed,
            });
        }
        if decoded.samples.is_empty() {
            return;
        }

        let block_size = inner.config.block_size;
        if let Some(session) = inner.session.as_mut() {
            if session.complete {
                tracing::warn!("stream {}: chunk arrived after completion", session.id);
            }
            session.append(&decoded.samples, block_size);
        }
        inner.pump();
    }

    /// Mark the active stream as having no more chunks. No-op without one.
    pub fn complete(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.session.as_mut() {
            Some(session) => {
                session.complete = true;
                tracing::debug!("stream {} marked complete", session.id);
            }
            None => tracing::debug!("complete() with no active stream"),
        }
    }

    /// Stop the active stream immediately.
    ///
    /// Already-scheduled audio fades out over the stop ramp on the old gain
    /// path, which is then disconnected; new streams use a fresh gain path
    /// right away. Idempotent.
    pub fn stop(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(session) = inner.session.take() else {
            return;
        };
        drop(session.ticker);

        let fresh = Arc::new(GainNode::new(inner.volume, inner.muted));
        let old = std::mem::replace(&mut inner.gain, fresh);
        let ramp = inner.config.stop_ramp();
        match inner.clock.acquire() {
            Ok(backend) => {
                old.fade_out(backend.now(), ramp.as_secs_f64());
                tokio::spawn(async move {
                    tokio::time::sleep(ramp).await;
                    old.disconnect();
                });
            }
            Err(_) => old.disconnect(),
        }

        tracing::info!(
            "stream {} stopped ({} queued blocks dropped)",
            session.id,
            session.queued.len()
        );
        inner.emit(StreamEvent::Stopped {
            stream_id: session.id,
        });
    }

    pub fn set_volume(&self, volume: f32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.volume = volume.clamp(0.0, 1.0);
            inner.gain.set_volume(inner.volume);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.muted = muted;
            inner.gain.set_muted(muted);
        }
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().map(|i| i.volume).unwrap_or(0.0)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .map(|i| i.session.is_some())
            .unwrap_or(false)
    }

    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        let inner = self.inner.lock().ok()?;
        let session = inner.session.as_ref()?;
        Some(SessionSnapshot {
            stream_id: session.id,
            sample_rate: inner.format.sample_rate,
            cursor: session.cursor,
            complete: session.complete,
            queued_blocks: session.queued.len(),
            scheduled_blocks: session.scheduled_blocks,
            last_end: session.last_end,
        })
    }

    fn spawn_ticker(&self, stream_id: u64, period: std::time::Duration) -> TaskGuard {
        let weak: Weak<Mutex<SchedulerInner>> = Arc::downgrade(&self.inner);
        TaskGuard::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let Ok(mut inner) = shared.lock() else {
                    break;
                };
                if !inner.tick(stream_id) {
                    break;
                }
            }
        })
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.session = None;
        }
    }
}
