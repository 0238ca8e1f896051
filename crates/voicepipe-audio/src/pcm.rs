//! Sample conversion between wire bytes and normalized f32.

use std::io::Cursor;
use voicepipe_core::{AudioFormat, PlaybackError};

/// Mono samples decoded from a raw PCM buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPcm {
    pub samples: Vec<f32>,
    /// Trailing samples that did not form a complete frame and were dropped.
    pub malformed: usize,
}

/// Audio ready to schedule: mono samples at `sample_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode interleaved little-endian PCM and average channels down to mono.
pub fn decode_pcm(bytes: &[u8], format: AudioFormat) -> DecodedPcm {
    let bps = format.bytes_per_sample().max(1);
    let channels = format.channels.max(1) as usize;
    let frame_bytes = bps * channels;

    let whole = bytes.len() / frame_bytes * frame_bytes;
    let leftover = bytes.len() - whole;
    let malformed = leftover.div_ceil(bps);

    let samples = bytes[..whole]
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(bps)
                .map(|s| decode_sample(s, format.bits_per_sample))
                .sum();
            sum / channels as f32
        })
        .collect();

    DecodedPcm { samples, malformed }
}

fn decode_sample(bytes: &[u8], bits: u16) -> f32 {
    match bits {
        8 => (bytes[0] as f32 - 128.0) / 128.0,
        32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
    }
}

/// Encode mono f32 samples as PCM16 little-endian, clamping to [-1, 1].
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Root-mean-square level of a block, clamped to 0..=1.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decode a complete WAV file to mono f32.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PlaybackError::Decode(format!("WAV sample error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PlaybackError::Decode(format!("WAV sample error: {e}")))?
        }
    };

    let samples = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode a queue payload: WAV if it carries a RIFF header, raw PCM otherwise.
pub fn decode_payload(
    bytes: &[u8],
    format: Option<AudioFormat>,
) -> Result<DecodedAudio, PlaybackError> {
    let decoded = if is_wav(bytes) {
        decode_wav(bytes)?
    } else {
        let format = format.unwrap_or_default();
        let pcm = decode_pcm(bytes, format);
        if pcm.malformed > 0 {
            tracing::warn!(
                "dropped {} trailing malformed sample(s) from {}-byte payload",
                pcm.malformed,
                bytes.len()
            );
        }
        DecodedAudio {
            samples: pcm.samples,
            sample_rate: format.sample_rate,
        }
    };

    if decoded.samples.is_empty() {
        return Err(PlaybackError::Decode(
            "payload contains no complete samples".to_string(),
        ));
    }
    Ok(decoded)
}
