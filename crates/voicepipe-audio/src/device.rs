use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host, SupportedStreamConfig, SupportedStreamConfigRange};
use voicepipe_core::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

pub struct DeviceManager {
    host: Host,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    pub fn list_input_devices(&self) -> Result<Vec<(String, Device)>, AudioError> {
        self.list(Direction::Input)
    }

    pub fn list_output_devices(&self) -> Result<Vec<(String, Device)>, AudioError> {
        self.list(Direction::Output)
    }

    /// Resolve a capture device by name; `"default"` picks the host default.
    pub fn get_input_device(&self, name: &str) -> Result<Device, AudioError> {
        self.find(Direction::Input, name)
    }

    /// Resolve a playback device by name; `"default"` picks the host default.
    pub fn get_output_device(&self, name: &str) -> Result<Device, AudioError> {
        self.find(Direction::Output, name)
    }

    /// Pick an f32 input config for capture, preferring `preferred_rate` and
    /// then the fewest channels. Devices without that rate open at their
    /// closest supported rate; capture converts afterwards.
    pub fn input_config(
        device: &Device,
        preferred_rate: u32,
    ) -> Result<SupportedStreamConfig, AudioError> {
        let ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?
            .collect();
        pick_input_config(ranges, preferred_rate)
            .ok_or_else(|| AudioError::StreamBuild("input device has no f32 config".to_string()))
    }

    fn list(&self, direction: Direction) -> Result<Vec<(String, Device)>, AudioError> {
        let devices: Box<dyn Iterator<Item = Device>> = match direction {
            Direction::Input => Box::new(
                self.host
                    .input_devices()
                    .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?,
            ),
            Direction::Output => Box::new(
                self.host
                    .output_devices()
                    .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?,
            ),
        };

        Ok(devices
            .map(|device| {
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                (name, device)
            })
            .collect())
    }

    fn find(&self, direction: Direction, name: &str) -> Result<Device, AudioError> {
        if name == "default" {
            let device = match direction {
                Direction::Input => self.host.default_input_device(),
                Direction::Output => self.host.default_output_device(),
            };
            return device.ok_or_else(|| {
                AudioError::DeviceNotFound(format!("no default {} device", direction.label()))
            });
        }

        self.list(direction)?
            .into_iter()
            .find(|(dev_name, _)| dev_name == name)
            .map(|(_, device)| device)
            .ok_or_else(|| {
                AudioError::DeviceNotFound(format!(
                    "{} device not found: {}",
                    direction.label(),
                    name
                ))
            })
    }
}

fn pick_input_config(
    ranges: Vec<SupportedStreamConfigRange>,
    preferred_rate: u32,
) -> Option<SupportedStreamConfig> {
    let mut candidates: Vec<_> = ranges
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .collect();
    // Native support for the preferred rate first, then fewest channels.
    candidates.sort_by_key(|c| {
        let native = (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&preferred_rate);
        (!native, c.channels())
    });
    let best = candidates.into_iter().next()?;
    let rate = preferred_rate.clamp(best.min_sample_rate().0, best.max_sample_rate().0);
    Some(best.with_sample_rate(cpal::SampleRate(rate)))
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::Input.label(), "input");
        assert_eq!(Direction::Output.label(), "output");
    }

    fn range(channels: u16, min: u32, max: u32, format: cpal::SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_pick_native_rate_fewest_channels() {
        let ranges = vec![
            range(2, 8000, 48000, cpal::SampleFormat::F32),
            range(1, 8000, 48000, cpal::SampleFormat::F32),
            range(1, 8000, 48000, cpal::SampleFormat::I16),
        ];
        let config = pick_input_config(ranges, 16000).unwrap();
        assert_eq!(config.channels(), 1);
        assert_eq!(config.sample_rate().0, 16000);
    }

    #[test]
    fn test_pick_falls_back_to_closest_rate() {
        // A 48kHz-only microphone still opens; capture resamples to 16kHz.
        let ranges = vec![range(2, 48000, 48000, cpal::SampleFormat::F32)];
        let config = pick_input_config(ranges, 16000).unwrap();
        assert_eq!(config.sample_rate().0, 48000);
        assert_eq!(config.channels(), 2);
    }

    #[test]
    fn test_pick_prefers_native_over_mono() {
        let ranges = vec![
            range(1, 44100, 44100, cpal::SampleFormat::F32),
            range(2, 8000, 48000, cpal::SampleFormat::F32),
        ];
        let config = pick_input_config(ranges, 16000).unwrap();
        assert_eq!(config.sample_rate().0, 16000);
        assert_eq!(config.channels(), 2);
    }

    #[test]
    fn test_pick_without_f32_is_none() {
        let ranges = vec![range(1, 8000, 48000, cpal::SampleFormat::I16)];
        assert!(pick_input_config(ranges, 16000).is_none());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_device_enumeration() {
        let manager = DeviceManager::new();
        let inputs = manager.list_input_devices().unwrap();
        let outputs = manager.list_output_devices().unwrap();
        println!("Input devices: {}", inputs.len());
        for (name, _) in &inputs {
            println!("  - {}", name);
        }
        println!("Output devices: {}", outputs.len());
        for (name, _) in &outputs {
            println!("  - {}", name);
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_unknown_device_not_found() {
        let manager = DeviceManager::new();
        let err = manager
            .get_output_device("definitely-not-a-real-device")
            .err().expect("expected DeviceNotFound error");
        assert!(matches!(err, AudioError::DeviceNotFound(_)));
    }
}
