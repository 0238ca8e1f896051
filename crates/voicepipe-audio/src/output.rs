use crate::backend::{ClockState, OutputBackend, ScheduledVoice};
use crate::device::DeviceManager;
use crate::mixer::VoiceMixer;
use crate::resample;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use voicepipe_core::AudioError;

const STATE_SUSPENDED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;
const STATE_FAILED: u8 = 3;

// ── OutputShared ──────────────────────────────────────────────

/// State shared between the backend handle and the device callback.
struct OutputShared {
    mixer: Mutex<VoiceMixer>,
    frames_rendered: AtomicU64,
    state: AtomicU8,
    sample_rate: u32,
}

impl OutputShared {
    fn render(&self, data: &mut [f32]) {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            data.fill(0.0);
            return;
        }
        let origin = self.frames_rendered.load(Ordering::Relaxed);
        let frames = match self.mixer.lock() {
            Ok(mut mixer) => mixer.render(data, origin),
            Err(_) => {
                // Mutex poisoned — fill with silence
                data.fill(0.0);
                return;
            }
        };
        self.frames_rendered
            .fetch_add(frames as u64, Ordering::Relaxed);
    }
}

// ── CpalBackend ───────────────────────────────────────────────

/// Output backend driving a cpal device.
///
/// The clock is the number of frames the device has pulled, so it only
/// advances while the backend is running. `cpal::Stream` is not `Send` on
/// every host, so the stream lives on its own thread and this handle talks
/// to it through shared atomics.
pub struct CpalBackend {
    shared: Arc<OutputShared>,
    device_name: String,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CpalBackend {
    /// Open `device_name` ("default" for the host default) at its default
    /// output config.
    pub fn open(device_name: &str) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Arc<OutputShared>, AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let name = device_name.to_string();

        let thread = std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match build_stream(&name) {
                    Ok((stream, shared)) => {
                        let _ = ready_tx.send(Ok(shared));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until closed; dropping the stream stops the device.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamBuild(format!("failed to spawn output thread: {e}")))?;

        let shared = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamBuild("output thread exited early".to_string()))??;

        tracing::info!(
            "output device '{}' opened at {} Hz",
            device_name,
            shared.sample_rate
        );

        Ok(Self {
            shared,
            device_name: device_name.to_string(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn build_stream(device_name: &str) -> Result<(cpal::Stream, Arc<OutputShared>), AudioError> {
    let manager = DeviceManager::new();
    let device = manager.get_output_device(device_name)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
    let config: cpal::StreamConfig = supported.into();

    let shared = Arc::new(OutputShared {
        mixer: Mutex::new(VoiceMixer::new(config.sample_rate.0, config.channels)),
        frames_rendered: AtomicU64::new(0),
        state: AtomicU8::new(STATE_SUSPENDED),
        sample_rate: config.sample_rate.0,
    });

    let render_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);
    let err_callback = move |err: cpal::StreamError| {
        tracing::error!("output stream error: {}", err);
        error_shared.state.store(STATE_FAILED, Ordering::Release);
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render_shared.render(data),
            err_callback,
            None,
        )
        .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
    stream
        .play()
        .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

    Ok((stream, shared))
}

#[async_trait]
impl OutputBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn now(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::Relaxed) as f64 / self.shared.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn state(&self) -> ClockState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_RUNNING => ClockState::Running,
            STATE_SUSPENDED => ClockState::Suspended,
            // A failed stream can't be resumed; treat as closed until rebuilt.
            _ => ClockState::Closed,
        }
    }

    async fn resume(&self) -> Result<(), AudioError> {
        match self.shared.state.compare_exchange(
            STATE_SUSPENDED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(STATE_RUNNING) => Ok(()),
            Err(STATE_FAILED) => Err(AudioError::ResumeFailed(
                "output stream reported an error".to_string(),
            )),
            Err(_) => Err(AudioError::ClockClosed),
        }
    }

    fn close(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        if let Ok(mut mixer) = self.shared.mixer.lock() {
            mixer.clear();
        }
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
            if thread.join().is_err() {
                tracing::warn!("output thread panicked");
            }
        }
    }

    fn schedule(&self, voice: ScheduledVoice) -> Result<(), AudioError> {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_CLOSED => return Err(AudioError::ClockClosed),
            STATE_FAILED => {
                return Err(AudioError::ScheduleFailed(
                    "output stream reported an error".to_string(),
                ))
            }
            _ => {}
        }
        // Convert before taking the lock the device callback renders under.
        let voice = to_device_rate(voice, self.shared.sample_rate)?;
        self.shared
            .mixer
            .lock()
            .map_err(|_| AudioError::ScheduleFailed("mixer lock poisoned".to_string()))?
            .add(voice)
    }
}

/// Resample a voice to the device rate, keeping its start time and gain.
fn to_device_rate(voice: ScheduledVoice, device_rate: u32) -> Result<ScheduledVoice, AudioError> {
    if voice.sample_rate == device_rate {
        return Ok(voice);
    }
    let samples = resample::resample(&voice.samples, voice.sample_rate, device_rate)?;
    Ok(ScheduledVoice {
        samples: samples.into(),
        sample_rate: device_rate,
        ..voice
    })
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.close();
    }
}
