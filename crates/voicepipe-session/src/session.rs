use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use voicepipe_audio::task::TaskGuard;
use voicepipe_audio::{
    AudioCaptureEngine, ChunkDeduplicator, PlaybackQueueManager, QueueEvent, SharedAudioClock,
    StreamEvent, StreamScheduler, VoiceActivityDetector,
};
use voicepipe_core::{
    AppConfig, AudioChunk, AudioChunkHeader, AudioError, AudioFormat, ConfigError, ControlMessage,
    EnqueueMetadata, ItemId, PayloadEncoding, ProtocolError, QueueError,
    QueueStatus, SessionError, SessionStatus, UiCommand, VadConfig, VadEvent,
};

/// Source tag for items that arrive as non-streaming server audio.
const SERVER_SOURCE_TAG: &str = "server";

/// Wires capture, voice detection and both playback paths to one clock.
///
/// The transport collaborator feeds inbound frames through
/// [`handle_text`](Self::handle_text) and [`handle_binary`](Self::handle_binary)
/// and drains outbound capture frames from
/// [`take_outbound_receiver`](Self::take_outbound_receiver). A UI observes
/// [`subscribe_status`](Self::subscribe_status) and drives
/// [`apply`](Self::apply). Must be created within a tokio runtime.
pub struct VoiceSession {
    config: AppConfig,
    clock: Arc<SharedAudioClock>,
    vad: Arc<VoiceActivityDetector>,
    capture: AudioCaptureEngine,
    dedup: ChunkDeduplicator,
    scheduler: StreamScheduler,
    queue: PlaybackQueueManager,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    gate_on_voice: Arc<AtomicBool>,
    pending: Option<AudioChunkHeader>,
    next_sequence: u64,
    volume: f32,
    muted: bool,
    _capture_task: TaskGuard,
    _status_task: TaskGuard,
}

impl VoiceSession {
    /// Build a session from a validated configuration.
    pub fn new(config: AppConfig, clock: Arc<SharedAudioClock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut vad = VoiceActivityDetector::new(config.vad.clone());
        let vad_rx = vad.take_event_receiver();
        let vad = Arc::new(vad);

        let mut capture = AudioCaptureEngine::new(config.capture.clone());
        let frame_rx = capture.take_frame_receiver();
        let volume_rx = capture.take_volume_receiver();

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let stream_format = AudioFormat::pcm16(config.playback.sample_rate, 1);
        let scheduler = new_scheduler(&clock, &config, stream_format, &stream_tx);

        let mut queue = PlaybackQueueManager::new(
            Arc::clone(&clock),
            config.queue.clone(),
            config.playback.stop_ramp(),
        );
        let queue_events = queue.take_event_receiver();
        let queue_status = queue.subscribe();

        let volume = config.playback.volume.clamp(0.0, 1.0);
        let (status_tx, _) = watch::channel(SessionStatus {
            is_healthy: queue_status.borrow().is_healthy,
            ..SessionStatus::default()
        });
        let status_tx = Arc::new(status_tx);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let gate_on_voice = Arc::new(AtomicBool::new(config.general.gate_on_voice));

        let capture_task = TaskGuard::spawn(run_capture_feed(
            volume_rx,
            frame_rx,
            Arc::clone(&vad),
            Arc::clone(&gate_on_voice),
            outbound_tx,
            Arc::clone(&status_tx),
        ));
        let status_task = TaskGuard::spawn(run_status_feed(
            vad_rx,
            Arc::clone(&vad),
            stream_rx,
            queue_events,
            queue_status,
            Arc::clone(&status_tx),
        ));

        Ok(Self {
            dedup: ChunkDeduplicator::new(config.dedup.cache_size),
            config,
            clock,
            vad,
            capture,
            scheduler,
            queue,
            stream_tx,
            status_tx,
            outbound_rx: Some(outbound_rx),
            gate_on_voice,
            pending: None,
            next_sequence: 0,
            volume,
            muted: false,
            _capture_task: capture_task,
            _status_task: status_task,
        })
    }

    /// Take the outbound capture frame receiver. Can only be called once.
    pub fn take_outbound_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.outbound_rx.take()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Format of the streaming scheduler currently accepting chunks.
    pub fn stream_format(&self) -> AudioFormat {
        self.scheduler.format()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn gate_on_voice(&self) -> bool {
        self.gate_on_voice.load(Ordering::Relaxed)
    }

    pub fn vad(&self) -> &VoiceActivityDetector {
        &self.vad
    }

    pub fn capture(&self) -> &AudioCaptureEngine {
        &self.capture
    }

    /// Parse one text frame from the transport.
    ///
    /// An `audio_chunk` announcement is held until the binary frame it
    /// describes arrives. A streaming announcement with a different sample
    /// rate than the active stream replaces the scheduler.
    pub fn handle_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        match ControlMessage::parse(text)? {
            ControlMessage::AudioChunk(header) => {
                if self.pending.is_some() {
                    tracing::warn!("audio_chunk announcement replaced before its payload arrived");
                }
                if header.streaming && header.encoding()? == PayloadEncoding::Pcm {
                    self.prepare_stream(header.audio_format());
                }
                self.pending = Some(header);
            }
            ControlMessage::AudioComplete(notice) => {
                tracing::debug!(
                    chunks_sent = ?notice.chunks_sent,
                    total_size = ?notice.total_size,
                    "audio_complete"
                );
                self.scheduler.complete();
            }
            ControlMessage::Other(kind) => {
                tracing::debug!(kind = %kind, "ignoring control message");
            }
        }
        Ok(())
    }

    /// Route one binary frame according to the pending announcement.
    /// Returns true if the payload was handed to a playback path.
    pub async fn handle_binary(&mut self, frame: Vec<u8>) -> bool {
        let Some(header) = self.pending.take() else {
            tracing::warn!(len = frame.len(), "binary frame without audio_chunk announcement, dropping");
            return false;
        };
        if let Some(expected) = header.size {
            if expected != frame.len() {
                tracing::warn!(
                    expected,
                    actual = frame.len(),
                    chunk_id = ?header.chunk_id,
                    "audio chunk size does not match announcement"
                );
            }
        }

        let encoding = match header.encoding() {
            Ok(encoding) => encoding,
            Err(e) => {
                tracing::warn!("dropping audio chunk: {e}");
                return false;
            }
        };

        let chunk = header.into_chunk(frame, self.next_sequence);
        self.next_sequence += 1;

        if chunk.streaming && encoding == PayloadEncoding::Pcm {
            self.handle_stream_chunk(chunk).await
        } else {
            let metadata = EnqueueMetadata {
                source_tag: SERVER_SOURCE_TAG.to_string(),
                kind: chunk.kind(),
                format: match encoding {
                    PayloadEncoding::Wav => None,
                    PayloadEncoding::Pcm => Some(chunk.format),
                },
            };
            match self.enqueue_audio(&chunk.data, metadata) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("failed to enqueue server audio: {e}");
                    self.record_error(e.to_string());
                    false
                }
            }
        }
    }

    async fn handle_stream_chunk(&mut self, chunk: AudioChunk) -> bool {
        if !self.dedup.should_forward(&chunk.data) {
            tracing::debug!(
                chunk_id = ?chunk.chunk_id,
                sequence = chunk.sequence,
                "duplicate audio chunk dropped"
            );
            return false;
        }
        match self.clock.ensure_ready().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("audio clock released, dropping stream chunk");
                return false;
            }
            Err(e) => {
                tracing::warn!("audio clock not ready: {e}");
                self.record_error(e.to_string());
                return false;
            }
        }
        self.scheduler.add_chunk(&chunk.data);
        true
    }

    fn prepare_stream(&mut self, format: AudioFormat) {
        if self.scheduler.format() == format {
            return;
        }
        tracing::info!(
            from = self.scheduler.format().sample_rate,
            to = format.sample_rate,
            "stream format changed, rebuilding scheduler"
        );
        self.scheduler.stop();
        self.scheduler = new_scheduler(&self.clock, &self.config, format, &self.stream_tx);
        self.scheduler.set_volume(self.volume);
        self.scheduler.set_muted(self.muted);
    }

    /// Open the microphone and start feeding the VAD.
    pub fn start_capture(&mut self) -> Result<(), AudioError> {
        self.capture.start()?;
        self.status_tx.send_modify(|s| s.is_listening = true);
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        self.capture.stop();
        self.vad.reset();
        self.status_tx.send_modify(|s| {
            s.is_listening = false;
            s.is_speaking = false;
            s.volume = 0.0;
        });
    }

    /// Feed samples as if they came from the microphone.
    pub fn push_capture_samples(&self, samples: &[f32]) {
        self.capture.push_samples(samples);
    }

    pub fn enqueue_audio(
        &self,
        payload: &[u8],
        metadata: EnqueueMetadata,
    ) -> Result<ItemId, QueueError> {
        self.queue.enqueue(payload, metadata)
    }

    /// Set output volume for both playback paths.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.scheduler.set_volume(self.volume);
        self.queue.set_volume(self.volume);
    }

    /// Flip output mute and return the new state.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.scheduler.set_muted(self.muted);
        self.queue.set_muted(self.muted);
        let muted = self.muted;
        self.status_tx.send_modify(|s| s.is_muted = muted);
        muted
    }

    /// Drop pending queue items and cut the active stream.
    pub fn clear_queue(&self) -> usize {
        self.scheduler.stop();
        self.queue.clear()
    }

    /// Rebuild the output and restart queue processing after a halt.
    pub fn recover(&self) -> Result<(), AudioError> {
        self.queue.recover()?;
        self.status_tx.send_modify(|s| s.last_error = None);
        Ok(())
    }

    pub fn update_vad_config(&self, config: VadConfig) -> Result<(), ConfigError> {
        self.vad.update_config(config)
    }

    pub fn set_gate_on_voice(&self, enabled: bool) {
        self.gate_on_voice.store(enabled, Ordering::Relaxed);
    }

    pub fn apply(&mut self, command: UiCommand) -> Result<(), SessionError> {
        match command {
            UiCommand::StartCapture => self.start_capture()?,
            UiCommand::StopCapture => self.stop_capture(),
            UiCommand::EnqueueAudio { payload, metadata } => {
                self.enqueue_audio(&payload, metadata)?;
            }
            UiCommand::SetVolume(volume) => self.set_volume(volume),
            UiCommand::ToggleMute => {
                self.toggle_mute();
            }
            UiCommand::ClearQueue => {
                let removed = self.clear_queue();
                tracing::info!(removed, "queue cleared");
            }
            UiCommand::Recover => self.recover()?,
        }
        Ok(())
    }

    /// Stop capture and playback and release the output device.
    pub fn shutdown(&mut self) {
        self.stop_capture();
        self.scheduler.stop();
        self.queue.stop();
        self.clock.release();
        self.pending = None;
        tracing::info!("voice session shut down");
    }

    fn record_error(&self, message: String) {
        self.status_tx.send_modify(|s| s.last_error = Some(message));
    }
}

fn new_scheduler(
    clock: &Arc<SharedAudioClock>,
    config: &AppConfig,
    format: AudioFormat,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> StreamScheduler {
    let scheduler = StreamScheduler::new(Arc::clone(clock), format, config.playback.clone());
    scheduler.set_event_sender(events.clone());
    scheduler
}

/// Feed capture volume to the VAD and forward frames past the voice gate.
async fn run_capture_feed(
    volume_rx: Option<mpsc::UnboundedReceiver<f32>>,
    frame_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    vad: Arc<VoiceActivityDetector>,
    gate_on_voice: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    status: Arc<watch::Sender<SessionStatus>>,
) {
    let (Some(mut volume_rx), Some(mut frame_rx)) = (volume_rx, frame_rx) else {
        tracing::error!("capture receivers already taken");
        return;
    };
    loop {
        tokio::select! {
            // Volume is published ahead of its frame; draining it first keeps
            // the gate decision current.
            biased;
            Some(volume) = volume_rx.recv() => {
                vad.process_volume(volume);
                status.send_if_modified(|s| {
                    if s.volume == volume {
                        return false;
                    }
                    s.volume = volume;
                    true
                });
            }
            Some(frame) = frame_rx.recv() => {
                if gate_on_voice.load(Ordering::Relaxed) && !vad.is_speaking() {
                    continue;
                }
                if outbound.send(frame).is_err() {
                    tracing::debug!("outbound receiver dropped");
                }
            }
            else => break,
        }
    }
}

/// A start event queued before the detector was reset must not mark the
/// session as speaking again.
fn fold_vad_event(
    status: &watch::Sender<SessionStatus>,
    vad: &VoiceActivityDetector,
    event: VadEvent,
) {
    tracing::info!(?event, "voice activity");
    let speaking = matches!(event, VadEvent::VoiceStart) && vad.is_speaking();
    status.send_modify(|s| s.is_speaking = speaking);
}

/// Fold detector, stream and queue notifications into the session status.
async fn run_status_feed(
    vad_rx: Option<mpsc::UnboundedReceiver<VadEvent>>,
    vad: Arc<VoiceActivityDetector>,
    mut stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
    queue_events: Option<mpsc::UnboundedReceiver<QueueEvent>>,
    mut queue_status: watch::Receiver<QueueStatus>,
    status: Arc<watch::Sender<SessionStatus>>,
) {
    let (Some(mut vad_rx), Some(mut queue_events)) = (vad_rx, queue_events) else {
        tracing::error!("session event receivers already taken");
        return;
    };
    let mut streaming = false;
    let mut queue_playing = queue_status.borrow().is_playing;

    loop {
        tokio::select! {
            Some(event) = vad_rx.recv() => fold_vad_event(&status, &vad, event),
            Some(event) = stream_rx.recv() => {
                match &event {
                    StreamEvent::Started { stream_id } => {
                        tracing::debug!(stream_id, "stream started");
                        streaming = true;
                    }
                    StreamEvent::Completed { stream_id } | StreamEvent::Stopped { stream_id } => {
                        tracing::debug!(stream_id, "stream ended");
                        streaming = false;
                    }
                    StreamEvent::DecodeError { stream_id, malformed_samples } => {
                        let message = format!("{malformed_samples} malformed samples in stream {stream_id}");
                        status.send_modify(|s| s.last_error = Some(message));
                    }
                    StreamEvent::PlaybackError { message, .. } => {
                        let message = message.clone();
                        status.send_modify(|s| s.last_error = Some(message));
                    }
                }
                let playing = streaming || queue_playing;
                status.send_if_modified(|s| {
                    let changed = s.is_playing != playing;
                    s.is_playing = playing;
                    changed
                });
            }
            Some(event) = queue_events.recv() => match event {
                QueueEvent::Skipped { id, error } => {
                    tracing::warn!(id, "queue item skipped: {error}");
                }
                QueueEvent::Halted { error_count } => {
                    tracing::error!(error_count, "queue halted, recovery required");
                }
                other => tracing::debug!(?other, "queue event"),
            },
            Ok(()) = queue_status.changed() => {
                let q = queue_status.borrow_and_update().clone();
                queue_playing = q.is_playing;
                let playing = streaming || queue_playing;
                status.send_modify(|s| {
                    s.is_playing = playing;
                    s.queue_length = q.queue_length;
                    s.is_healthy = q.is_healthy;
                    if q.last_error.is_some() {
                        s.last_error = q.last_error.clone();
                    }
                });
            }
            else => break,
        }
    }
}
