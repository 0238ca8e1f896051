pub mod backend;
pub mod capture;
pub mod clock;
pub mod dedup;
pub mod device;
pub mod gain;
pub mod mixer;
pub mod output;
pub mod pcm;
pub mod queue;
pub mod resample;
pub mod scheduler;
pub mod task;
pub mod vad;
pub mod virtual_output;

pub use backend::{ClockState, OutputBackend, ScheduledVoice};
pub use capture::{AudioCaptureEngine, CaptureFrame, FrameAssembler};
pub use clock::SharedAudioClock;
pub use dedup::ChunkDeduplicator;
pub use device::DeviceManager;
pub use gain::GainNode;
pub use mixer::VoiceMixer;
pub use output::CpalBackend;
pub use queue::{HealthReport, PlaybackQueueManager, QueueEvent};
pub use resample::{resample, StreamResampler};
pub use scheduler::{PlaybackBlock, SessionSnapshot, StreamEvent, StreamScheduler};
pub use vad::VoiceActivityDetector;
pub use virtual_output::{virtual_clock, VirtualBackend, VirtualProbe};

use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use voicepipe_core::{OutputBackendKind, OutputConfig, PlaybackConfig};

/// Create a ring buffer split into producer and consumer halves.
pub fn create_ring_buffer(capacity: usize) -> (HeapProd<f32>, HeapCons<f32>) {
    HeapRb::<f32>::new(capacity).split()
}

/// Build the shared clock for the configured output backend.
pub fn clock_for_output(output: &OutputConfig, playback: &PlaybackConfig) -> Arc<SharedAudioClock> {
    match output.backend {
        OutputBackendKind::Cpal => {
            let device_name = output.device_name.clone();
            Arc::new(SharedAudioClock::new(move || {
                Ok(Arc::new(CpalBackend::open(&device_name)?) as Arc<dyn OutputBackend>)
            }))
        }
        OutputBackendKind::Null => virtual_clock(playback.sample_rate).0,
    }
}
