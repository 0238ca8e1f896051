use crate::create_ring_buffer;
use crate::device::DeviceManager;
use crate::pcm;
use crate::resample::StreamResampler;
use crate::task::TaskGuard;
use cpal::traits::{DeviceTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voicepipe_core::{AudioError, CaptureConfig};

const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// One second of interleaved stereo at 48kHz.
const RING_CAPACITY: usize = 96_000;

// ── FrameAssembler ────────────────────────────────────────────

/// One fixed-size block of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    /// Mono PCM16 little-endian.
    pub pcm: Vec<u8>,
    /// RMS level of the frame, 0..=1.
    pub volume: f32,
}

/// Collects interleaved device samples into mono frames of `frame_size`,
/// converting to the frame rate first when the device runs at another one.
pub struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    pending: Vec<f32>,
    /// Samples of an interleaved frame split across two pushes.
    carry: Vec<f32>,
    resampler: Option<StreamResampler>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, channels: u16) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            channels: channels.max(1) as usize,
            pending: Vec::with_capacity(frame_size * 2),
            carry: Vec::new(),
            resampler: None,
        }
    }

    pub fn with_resampler(mut self, resampler: StreamResampler) -> Self {
        self.resampler = Some(resampler);
        self
    }

    /// Append interleaved samples; returns every frame completed by them.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<CaptureFrame> {
        let channels = self.channels;
        let mut input = interleaved;
        let mut mono = Vec::with_capacity(input.len() / channels + 1);
        if !self.carry.is_empty() {
            let take = (channels - self.carry.len()).min(input.len());
            self.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.carry.len() == channels {
                mono.push(self.carry.iter().sum::<f32>() / channels as f32);
                self.carry.clear();
            }
        }
        let chunks = input.chunks_exact(channels);
        self.carry.extend_from_slice(chunks.remainder());
        mono.extend(chunks.map(|f| f.iter().sum::<f32>() / channels as f32));

        match self.resampler.as_mut() {
            Some(resampler) => self.pending.extend(resampler.process(&mono)),
            None => self.pending.extend(mono),
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let block: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(CaptureFrame {
                pcm: pcm::encode_pcm16(&block),
                volume: pcm::rms(&block),
            });
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.carry.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

// ── AudioCaptureEngine ────────────────────────────────────────

struct CaptureOutputs {
    assembler: FrameAssembler,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    volume_tx: mpsc::UnboundedSender<f32>,
}

impl CaptureOutputs {
    fn feed(&mut self, samples: &[f32]) {
        for frame in self.assembler.push(samples) {
            let _ = self.volume_tx.send(frame.volume);
            let _ = self.frame_tx.send(frame.pcm);
        }
    }
}

struct RunningCapture {
    shutdown: std_mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
    _pump: TaskGuard,
}

/// Microphone capture producing mono PCM16 frames and per-frame volume.
///
/// The device callback only pushes samples into a lock-free ring buffer; a
/// tokio task drains it, assembles frames and publishes them on two
/// channels. Both receivers are taken once and survive stop/start cycles.
pub struct AudioCaptureEngine {
    config: CaptureConfig,
    outputs: Arc<Mutex<CaptureOutputs>>,
    frame_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    volume_rx: Option<mpsc::UnboundedReceiver<f32>>,
    stream_failed: Arc<AtomicBool>,
    running: Option<RunningCapture>,
}

impl AudioCaptureEngine {
    pub fn new(config: CaptureConfig) -> Self {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (volume_tx, volume_rx) = mpsc::unbounded_channel();
        let assembler = FrameAssembler::new(config.frame_size, 1);
        Self {
            config,
            outputs: Arc::new(Mutex::new(CaptureOutputs {
                assembler,
                frame_tx,
                volume_tx,
            })),
            frame_rx: Some(frame_rx),
            volume_rx: Some(volume_rx),
            stream_failed: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    /// Take the frame receiver. Can only be called once.
    pub fn take_frame_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.frame_rx.take()
    }

    /// Take the volume receiver. Can only be called once.
    pub fn take_volume_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<f32>> {
        self.volume_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// True if the device reported an error since the last start.
    pub fn has_failed(&self) -> bool {
        self.stream_failed.load(Ordering::Relaxed)
    }

    /// Open the configured input device and start producing frames.
    /// Must be called within a tokio runtime.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.is_some() {
            return Ok(());
        }

        let (producer, consumer) = create_ring_buffer(RING_CAPACITY);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(u16, u32), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let device_name = self.config.device_name.clone();
        let sample_rate = self.config.sample_rate;
        let failed = Arc::clone(&self.stream_failed);
        failed.store(false, Ordering::Relaxed);

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                match build_input_stream(&device_name, sample_rate, producer, failed) {
                    Ok((stream, channels, device_rate)) => {
                        let _ = ready_tx.send(Ok((channels, device_rate)));
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamBuild(format!("failed to spawn capture thread: {e}")))?;

        let (channels, device_rate) = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamBuild("capture thread exited early".to_string()));
            }
        };

        let mut assembler = FrameAssembler::new(self.config.frame_size, channels);
        if device_rate != sample_rate {
            match StreamResampler::new(device_rate, sample_rate) {
                Ok(resampler) => assembler = assembler.with_resampler(resampler),
                Err(e) => {
                    let _ = shutdown_tx.send(());
                    let _ = thread.join();
                    return Err(e);
                }
            }
            tracing::info!("capture device runs at {} Hz, converting to {} Hz", device_rate, sample_rate);
        }
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.assembler = assembler;
        }
        let pump = TaskGuard::spawn(pump_ring(consumer, Arc::clone(&self.outputs)));

        tracing::info!(
            "capture started on '{}', frames at {} Hz ({} ch, {}-sample frames)",
            self.config.device_name,
            sample_rate,
            channels,
            self.config.frame_size
        );
        self.running = Some(RunningCapture {
            shutdown: shutdown_tx,
            thread,
            _pump: pump,
        });
        Ok(())
    }

    /// Stop capturing and release the device. Idempotent.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if running.thread.join().is_err() {
            tracing::warn!("capture thread panicked");
        }
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.assembler = FrameAssembler::new(self.config.frame_size, 1);
        }
        tracing::info!("capture stopped");
    }

    /// Feed samples from a source other than the input device, such as a
    /// file. Mono while the device is stopped. Frames come out on the same
    /// channels as device audio.
    pub fn push_samples(&self, samples: &[f32]) {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.feed(samples);
        }
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    device_name: &str,
    sample_rate: u32,
    mut producer: HeapProd<f32>,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u16, u32), AudioError> {
    let manager = DeviceManager::new();
    let device = manager.get_input_device(device_name)?;
    let supported = DeviceManager::input_config(&device, sample_rate)?;
    let channels = supported.channels();
    let device_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let err_callback = move |err: cpal::StreamError| {
        tracing::error!("capture stream error: {}", err);
        failed.store(true, Ordering::Relaxed);
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Overflow is dropped; the pump drains every 10ms.
                producer.push_slice(data);
            },
            err_callback,
            None,
        )
        .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
    stream
        .play()
        .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
    Ok((stream, channels, device_rate))
}

async fn pump_ring(mut consumer: HeapCons<f32>, outputs: Arc<Mutex<CaptureOutputs>>) {
    let mut interval = tokio::time::interval(PUMP_INTERVAL);
    let mut buf = vec![0.0f32; 4096];
    loop {
        interval.tick().await;
        loop {
            let n = consumer.pop_slice(&mut buf);
            if n == 0 {
                break;
            }
            let Ok(mut outputs) = outputs.lock() else {
                return;
            };
            outputs.feed(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_emits_full_frames_only() {
        let mut asm = FrameAssembler::new(4, 1);
        assert!(asm.push(&[0.1, 0.1, 0.1]).is_empty());
        assert_eq!(asm.buffered(), 3);
        let frames = asm.push(&[0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(frames.len(), 2);
        assert_eq!(asm.buffered(), 1);
        assert_eq!(frames[0].pcm.len(), 8);
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let mut asm = FrameAssembler::new(2, 2);
        let frames = asm.push(&[0.5, -0.5, 0.5, 0.5]);
        assert_eq!(frames.len(), 1);
        let first = i16::from_le_bytes([frames[0].pcm[0], frames[0].pcm[1]]);
        let second = i16::from_le_bytes([frames[0].pcm[2], frames[0].pcm[3]]);
        assert_eq!(first, 0);
        assert_eq!(second, (0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn test_assembler_carries_split_stereo_frame() {
        let mut asm = FrameAssembler::new(2, 2);
        assert!(asm.push(&[0.5, 0.5, 0.5]).is_empty());
        let frames = asm.push(&[0.5]);
        assert_eq!(frames.len(), 1);
        let second = i16::from_le_bytes([frames[0].pcm[2], frames[0].pcm[3]]);
        assert_eq!(second, (0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn test_frame_volume_is_rms() {
        let mut asm = FrameAssembler::new(4, 1);
        let frames = asm.push(&[0.5, -0.5, 0.5, -0.5]);
        assert!((frames[0].volume - 0.5).abs() < 1e-6);
        let frames = asm.push(&[0.0; 4]);
        assert_eq!(frames[0].volume, 0.0);
    }

    #[test]
    fn test_assembler_converts_device_rate() {
        let resampler = StreamResampler::new(48000, 16000).unwrap();
        let mut asm = FrameAssembler::new(1600, 2).with_resampler(resampler);
        let mut frames = Vec::new();
        // One second of 48kHz stereo in device-callback-sized pushes.
        for _ in 0..100 {
            frames.extend(asm.push(&[0.25; 960]));
        }
        // Ten 100ms frames at 16kHz, less what the resampler still holds.
        assert!(frames.len() >= 9 && frames.len() <= 10, "{} frames", frames.len());
        assert!(frames.iter().all(|f| f.pcm.len() == 3200));
        assert!((frames.last().unwrap().volume - 0.25).abs() < 0.02);
    }

    #[test]
    fn test_assembler_reset_drops_partial() {
        let mut asm = FrameAssembler::new(4, 1);
        asm.push(&[0.2; 3]);
        asm.reset();
        assert_eq!(asm.buffered(), 0);
    }

    #[tokio::test]
    async fn test_push_samples_publishes_frames_and_volume() {
        let mut engine = AudioCaptureEngine::new(CaptureConfig {
            frame_size: 4,
            ..CaptureConfig::default()
        });
        let mut frames = engine.take_frame_receiver().unwrap();
        let mut volumes = engine.take_volume_receiver().unwrap();
        assert!(engine.take_frame_receiver().is_none());

        engine.push_samples(&[0.25; 10]);
        assert_eq!(frames.recv().await.unwrap().len(), 8);
        assert_eq!(frames.recv().await.unwrap().len(), 8);
        assert!(frames.try_recv().is_err());
        assert!((volumes.recv().await.unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut engine = AudioCaptureEngine::new(CaptureConfig::default());
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(!engine.has_failed());
    }

    #[tokio::test]
    #[ignore] // Requires audio hardware
    async fn test_capture_from_default_device() {
        let mut engine = AudioCaptureEngine::new(CaptureConfig::default());
        let mut frames = engine.take_frame_receiver().unwrap();
        engine.start().unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 2048 * 2);
        engine.stop();
    }
}
