use crate::error::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Forward capture frames only while the VAD reports speech.
    #[serde(default = "default_true")]
    pub gate_on_voice: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            gate_on_voice: default_true(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct VadConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    #[serde(default = "default_voice_timeout_ms")]
    pub voice_timeout_ms: u64,

    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            voice_timeout_ms: default_voice_timeout_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
        }
    }
}

impl VadConfig {
    pub fn voice_timeout(&self) -> Duration {
        Duration::from_millis(self.voice_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) || self.threshold.is_nan() {
            return Err(ConfigError::invalid(
                "vad.threshold",
                format!("{} is outside 0..=1", self.threshold),
            ));
        }
        if self.voice_timeout_ms == 0 {
            return Err(ConfigError::invalid("vad.voice_timeout_ms", "must be > 0"));
        }
        if self.silence_timeout_ms == 0 {
            return Err(ConfigError::invalid("vad.silence_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PlaybackConfig {
    #[serde(default = "default_playback_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_initial_buffer_latency_ms")]
    pub initial_buffer_latency_ms: u64,

    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stop_ramp_ms")]
    pub stop_ramp_ms: u64,

    #[serde(default = "default_volume")]
    pub volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_playback_sample_rate(),
            block_size: default_block_size(),
            initial_buffer_latency_ms: default_initial_buffer_latency_ms(),
            lookahead_ms: default_lookahead_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_ramp_ms: default_stop_ramp_ms(),
            volume: default_volume(),
        }
    }
}

impl PlaybackConfig {
    pub fn initial_buffer_latency(&self) -> Duration {
        Duration::from_millis(self.initial_buffer_latency_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_ramp(&self) -> Duration {
        Duration::from_millis(self.stop_ramp_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8000..=192_000).contains(&self.sample_rate) {
            return Err(ConfigError::invalid(
                "playback.sample_rate",
                format!("{} Hz is not supported", self.sample_rate),
            ));
        }
        if self.block_size == 0 {
            return Err(ConfigError::invalid("playback.block_size", "must be > 0"));
        }
        if self.lookahead_ms == 0 {
            return Err(ConfigError::invalid("playback.lookahead_ms", "must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("playback.poll_interval_ms", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.volume) || self.volume.is_nan() {
            return Err(ConfigError::invalid(
                "playback.volume",
                format!("{} is outside 0..=1", self.volume),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DedupConfig {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            error_threshold: default_error_threshold(),
            max_item_bytes: default_max_item_bytes(),
        }
    }
}

impl QueueConfig {
    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CaptureConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_capture_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            sample_rate: default_capture_sample_rate(),
            frame_size: default_frame_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackendKind {
    #[default]
    Cpal,
    Null,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default)]
    pub backend: OutputBackendKind,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            backend: OutputBackendKind::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    0.01
}

fn default_voice_timeout_ms() -> u64 {
    300
}

fn default_silence_timeout_ms() -> u64 {
    1500
}

fn default_playback_sample_rate() -> u32 {
    24000
}

fn default_block_size() -> usize {
    7680
}

fn default_initial_buffer_latency_ms() -> u64 {
    100
}

fn default_lookahead_ms() -> u64 {
    200
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_ramp_ms() -> u64 {
    100
}

fn default_volume() -> f32 {
    1.0
}

fn default_cache_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_error_threshold() -> u32 {
    5
}

fn default_max_item_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_device_name() -> String {
    "default".to_string()
}

fn default_capture_sample_rate() -> u32 {
    16000
}

fn default_frame_size() -> usize {
    2048
}

/// Interpolate `${VAR}` patterns with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                errors.push(var_name.to_string());
            }
        }
    }

    if let Some(first_missing) = errors.into_iter().next() {
        return Err(ConfigError::EnvVarNotFound(first_missing));
    }

    Ok(result)
}

impl AppConfig {
    /// Load configuration from a TOML file, with environment variable interpolation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(s)?;
        let config: AppConfig = toml::from_str(&interpolated)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vad.validate()?;
        self.playback.validate()?;
        if self.dedup.cache_size == 0 {
            return Err(ConfigError::invalid("dedup.cache_size", "must be > 0"));
        }
        if self.queue.error_threshold == 0 {
            return Err(ConfigError::invalid("queue.error_threshold", "must be > 0"));
        }
        if self.queue.max_item_bytes == 0 {
            return Err(ConfigError::invalid("queue.max_item_bytes", "must be > 0"));
        }
        if self.capture.frame_size == 0 {
            return Err(ConfigError::invalid("capture.frame_size", "must be > 0"));
        }
        if !(8000..=192_000).contains(&self.capture.sample_rate) {
            return Err(ConfigError::invalid(
                "capture.sample_rate",
                format!("{} Hz is not supported", self.capture.sample_rate),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse_valid_toml() {
        let toml_str = r#"
[general]
log_level = "debug"
gate_on_voice = false

[vad]
threshold = 0.02
voice_timeout_ms = 250
silence_timeout_ms = 1200

[playback]
sample_rate = 48000
block_size = 4096
lookahead_ms = 300

[dedup]
cache_size = 32

[queue]
max_retries = 3

[capture]
device_name = "USB Microphone"
frame_size = 1024

[output]
device_name = "speakers"
backend = "null"
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert!(!config.general.gate_on_voice);
        assert_eq!(config.vad.threshold, 0.02);
        assert_eq!(config.vad.voice_timeout(), Duration::from_millis(250));
        assert_eq!(config.vad.silence_timeout(), Duration::from_millis(1200));
        assert_eq!(config.playback.sample_rate, 48000);
        assert_eq!(config.playback.block_size, 4096);
        assert_eq!(config.playback.lookahead(), Duration::from_millis(300));
        assert_eq!(config.dedup.cache_size, 32);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.capture.device_name, "USB Microphone");
        assert_eq!(config.capture.frame_size, 1024);
        assert_eq!(config.output.device_name, "speakers");
        assert_eq!(config.output.backend, OutputBackendKind::Null);
    }

    #[test]
    fn test_config_default_values() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert!(config.general.gate_on_voice);
        assert_eq!(config.vad.threshold, 0.01);
        assert_eq!(config.vad.voice_timeout_ms, 300);
        assert_eq!(config.vad.silence_timeout_ms, 1500);
        assert_eq!(config.playback.sample_rate, 24000);
        assert_eq!(config.playback.block_size, 7680);
        assert_eq!(config.playback.initial_buffer_latency_ms, 100);
        assert_eq!(config.playback.lookahead_ms, 200);
        assert_eq!(config.playback.poll_interval_ms, 100);
        assert_eq!(config.playback.stop_ramp_ms, 100);
        assert_eq!(config.dedup.cache_size, 100);
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.error_threshold, 5);
        assert_eq!(config.capture.sample_rate, 16000);
        assert_eq!(config.capture.frame_size, 2048);
        assert_eq!(config.output.backend, OutputBackendKind::Cpal);
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_config_env_var_interpolation() {
        std::env::set_var("VOICEPIPE_TEST_DEVICE", "Headset Mic");
        let toml_str = r#"
[capture]
device_name = "${VOICEPIPE_TEST_DEVICE}"
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.capture.device_name, "Headset Mic");
        std::env::remove_var("VOICEPIPE_TEST_DEVICE");
    }

    #[test]
    fn test_config_missing_env_var_error() {
        let toml_str = r#"
[general]
log_level = "${DEFINITELY_DOES_NOT_EXIST_12345}"
"#;
        let err = AppConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("DEFINITELY_DOES_NOT_EXIST_12345"));
    }

    #[test]
    fn test_config_invalid_toml_error() {
        let result = AppConfig::from_toml_str("this is not valid toml [[[");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_config_rejects_threshold_out_of_range() {
        let err = AppConfig::from_toml_str("[vad]\nthreshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("vad.threshold"));
    }

    #[test]
    fn test_config_rejects_zero_block_size() {
        let err = AppConfig::from_toml_str("[playback]\nblock_size = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "playback.block_size",
                ..
            }
        ));
    }

    #[test]
    fn test_config_rejects_zero_cache_size() {
        let err = AppConfig::from_toml_str("[dedup]\ncache_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("dedup.cache_size"));
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        let result = AppConfig::from_toml_str("[output]\nbackend = \"jack\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_queue_backoff_doubles() {
        let q = QueueConfig::default();
        assert_eq!(q.backoff(1), Duration::from_millis(250));
        assert_eq!(q.backoff(2), Duration::from_millis(500));
        assert_eq!(q.backoff(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = std::env::temp_dir().join("voicepipe_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.toml");
        std::fs::write(
            &path,
            r#"
[general]
log_level = "warn"

[vad]
threshold = 0.05
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.vad.threshold, 0.05);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_load_from_file_not_found() {
        let result = AppConfig::load_from_file(Path::new("/nonexistent/path.toml"));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("failed to read config file"));
    }
}
