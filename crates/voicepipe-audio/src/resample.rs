use rubato::{FftFixedIn, Resampler};
use voicepipe_core::AudioError;

/// Input frames per resampler pass.
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

fn build(from: u32, to: u32) -> Result<FftFixedIn<f32>, AudioError> {
    FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_FRAMES, SUB_CHUNKS, 1)
        .map_err(|e| AudioError::Resample(format!("{from} Hz -> {to} Hz: {e}")))
}

fn first_channel(channels: Vec<Vec<f32>>) -> Vec<f32> {
    channels.into_iter().next().unwrap_or_default()
}

/// Convert one complete mono clip between rates.
///
/// The resampler delay is trimmed and the tail flushed, so the output is
/// aligned with the input and lasts the same time.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, AudioError> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = build(from, to)?;
    let expected = (samples.len() as u64 * to as u64).div_ceil(from as u64) as usize;
    let delay = resampler.output_delay();
    let wanted = delay + expected;
    let map_err = |e: rubato::ResampleError| AudioError::Resample(e.to_string());

    let mut out = Vec::with_capacity(wanted + CHUNK_FRAMES);
    let mut input = samples;
    while input.len() >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let chunk = resampler.process(&[&input[..n]], None).map_err(map_err)?;
        out.extend(first_channel(chunk));
        input = &input[n..];
    }
    if !input.is_empty() {
        let chunk = resampler
            .process_partial(Some(&[input][..]), None)
            .map_err(map_err)?;
        out.extend(first_channel(chunk));
    }
    while out.len() < wanted {
        let chunk = first_channel(
            resampler
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(map_err)?,
        );
        if chunk.is_empty() {
            break;
        }
        out.extend(chunk);
    }

    let end = wanted.min(out.len());
    Ok(out[delay.min(end)..end].to_vec())
}

/// Continuous mono rate conversion for live capture.
///
/// Input is buffered until a full resampler chunk is available, so output
/// trails input by at most one chunk plus the filter delay.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
    from: u32,
    to: u32,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> Result<Self, AudioError> {
        Ok(Self {
            resampler: build(from, to)?,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
            from,
            to,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.from
    }

    pub fn output_rate(&self) -> u32 {
        self.to
    }

    /// Feed samples and return whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let need = self.resampler.input_frames_next();
            if self.pending.len() < need {
                break;
            }
            match self.resampler.process(&[&self.pending[..need]], None) {
                Ok(chunk) => out.extend(first_channel(chunk)),
                Err(e) => tracing::warn!("capture resample failed: {}", e),
            }
            self.pending.drain(..need);
        }
        out
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }
}
