use crate::backend::ScheduledVoice;
use voicepipe_core::AudioError;

// Absorbs float error when a frame time lands exactly on a sample boundary.
const POSITION_EPSILON: f64 = 1e-6;

// ── VoiceMixer ─────────────────────────────────────────────────

/// Sums scheduled voices into interleaved device buffers.
///
/// Time is derived from the running frame counter of the device, so a voice
/// starts on the first device frame whose timestamp reaches `start_at`.
/// Voices must already be at the device rate.
pub struct VoiceMixer {
    voices: Vec<ScheduledVoice>,
    device_rate: u32,
    channels: usize,
}

impl VoiceMixer {
    pub fn new(device_rate: u32, channels: u16) -> Self {
        Self {
            voices: Vec::new(),
            device_rate,
            channels: channels.max(1) as usize,
        }
    }

    pub fn add(&mut self, voice: ScheduledVoice) -> Result<(), AudioError> {
        if voice.sample_rate != self.device_rate {
            return Err(AudioError::ScheduleFailed(format!(
                "voice at {} Hz on a {} Hz mixer",
                voice.sample_rate, self.device_rate
            )));
        }
        self.voices.push(voice);
        Ok(())
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Drop every voice, audible or not.
    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Render one interleaved block starting at device frame `frame_origin`.
    /// Returns the number of frames rendered.
    pub fn render(&mut self, out: &mut [f32], frame_origin: u64) -> usize {
        out.fill(0.0);
        let frames = out.len() / self.channels;
        if self.voices.is_empty() {
            return frames;
        }

        let rate = self.device_rate as f64;
        for (i, frame) in out.chunks_exact_mut(self.channels).enumerate() {
            let t = (frame_origin + i as u64) as f64 / rate;
            let mut sum = 0.0f32;
            for voice in &self.voices {
                let offset = (t - voice.start_at) * rate + POSITION_EPSILON;
                if offset < 0.0 {
                    continue;
                }
                let pos = offset as usize;
                if let Some(&s) = voice.samples.get(pos) {
                    sum += s * voice.gain.level_at(t);
                }
            }
            frame.fill(sum.clamp(-1.0, 1.0));
        }

        let block_end = (frame_origin + frames as u64) as f64 / rate;
        self.voices
            .retain(|v| !v.gain.is_disconnected() && v.end_at() > block_end);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gain::GainNode;
    use std::sync::Arc;

    fn voice(samples: Vec<f32>, rate: u32, start_at: f64, gain: &Arc<GainNode>) -> ScheduledVoice {
        ScheduledVoice {
            samples: samples.into(),
            sample_rate: rate,
            start_at,
            gain: Arc::clone(gain),
        }
    }

    #[test]
    fn test_render_empty_is_silence() {
        let mut mixer = VoiceMixer::new(1000, 2);
        let mut out = vec![1.0f32; 8];
        assert_eq!(mixer.render(&mut out, 0), 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_voice_starts_at_scheduled_frame() {
        let gain = Arc::new(GainNode::default());
        let mut mixer = VoiceMixer::new(1000, 1);
        mixer.add(voice(vec![0.5; 4], 1000, 0.002, &gain)).unwrap();

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_gain_applied_at_render_time() {
        let gain = Arc::new(GainNode::new(0.5, false));
        let mut mixer = VoiceMixer::new(1000, 1);
        mixer.add(voice(vec![1.0; 100], 1000, 0.0, &gain)).unwrap();

        let mut out = vec![0.0f32; 10];
        mixer.render(&mut out, 0);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        gain.set_muted(true);
        mixer.render(&mut out, 10);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_overlapping_voices_sum_and_clip() {
        let gain = Arc::new(GainNode::default());
        let mut mixer = VoiceMixer::new(1000, 1);
        mixer.add(voice(vec![0.25; 10], 1000, 0.0, &gain)).unwrap();
        mixer.add(voice(vec![0.5; 10], 1000, 0.0, &gain)).unwrap();
        mixer.add(voice(vec![0.75; 10], 1000, 0.0, &gain)).unwrap();

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 1.0));
        assert_eq!(mixer.active_voices(), 3);
    }

    #[test]
    fn test_voice_at_other_rate_rejected() {
        let gain = Arc::new(GainNode::default());
        let mut mixer = VoiceMixer::new(2000, 1);
        let err = mixer.add(voice(vec![0.1, 0.2], 1000, 0.0, &gain)).unwrap_err();
        assert!(matches!(err, AudioError::ScheduleFailed(_)));
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_disconnected_voice_is_dropped() {
        let gain = Arc::new(GainNode::default());
        let mut mixer = VoiceMixer::new(1000, 1);
        mixer.add(voice(vec![1.0; 1000], 1000, 0.0, &gain)).unwrap();
        gain.disconnect();

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(mixer.active_voices(), 0);
    }
}
