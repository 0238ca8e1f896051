use crate::config::AppConfig;
use crate::config::VadConfig;

/// Describes runtime-safe changes between two configs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub vad_change: Option<VadConfig>,
    pub volume_change: Option<f32>,
    pub gate_on_voice_change: Option<bool>,
    pub non_reloadable: Vec<String>,
}

impl ConfigDiff {
    /// Compare two configs and return the diff.
    /// Reloadable: VAD tuning, playback volume, voice gating.
    /// Non-reloadable: sample rates, block size, devices, cache and queue sizing — logged as warnings.
    pub fn diff(old: &AppConfig, new: &AppConfig) -> Self {
        let mut result = Self::default();

        if old.vad != new.vad {
            result.vad_change = Some(new.vad.clone());
        }

        if (old.playback.volume - new.playback.volume).abs() > f32::EPSILON {
            result.volume_change = Some(new.playback.volume);
        }

        if old.general.gate_on_voice != new.general.gate_on_voice {
            result.gate_on_voice_change = Some(new.general.gate_on_voice);
        }

        if old.playback.sample_rate != new.playback.sample_rate {
            result.non_reloadable.push(format!(
                "playback sample_rate changed ({} → {}), requires restart",
                old.playback.sample_rate, new.playback.sample_rate
            ));
        }
        if old.playback.block_size != new.playback.block_size {
            result.non_reloadable.push(format!(
                "block_size changed ({} → {}), requires restart",
                old.playback.block_size, new.playback.block_size
            ));
        }
        if old.playback.initial_buffer_latency_ms != new.playback.initial_buffer_latency_ms
            || old.playback.lookahead_ms != new.playback.lookahead_ms
            || old.playback.poll_interval_ms != new.playback.poll_interval_ms
            || old.playback.stop_ramp_ms != new.playback.stop_ramp_ms
        {
            result
                .non_reloadable
                .push("scheduler timing changed, requires restart".to_string());
        }

        if old.capture.device_name != new.capture.device_name {
            result.non_reloadable.push(format!(
                "capture device changed ('{}' → '{}'), requires restart",
                old.capture.device_name, new.capture.device_name
            ));
        }
        if old.capture.sample_rate != new.capture.sample_rate
            || old.capture.frame_size != new.capture.frame_size
        {
            result
                .non_reloadable
                .push("capture format changed, requires restart".to_string());
        }

        if old.output != new.output {
            result.non_reloadable.push(format!(
                "output changed ('{}' → '{}'), requires restart",
                old.output.device_name, new.output.device_name
            ));
        }

        if old.dedup != new.dedup {
            result.non_reloadable.push(format!(
                "dedup cache_size changed ({} → {}), requires restart",
                old.dedup.cache_size, new.dedup.cache_size
            ));
        }

        if old.queue != new.queue {
            result
                .non_reloadable
                .push("queue policy changed, requires restart".to_string());
        }

        result
    }

    pub fn is_empty(&self) -> bool {
        self.vad_change.is_none()
            && self.volume_change.is_none()
            && self.gate_on_voice_change.is_none()
            && self.non_reloadable.is_empty()
    }
}
