use anyhow::Context;
use rubato::{Resampler, SincFixedIn};

/// Streaming mono sample-rate converter with a fixed chunk length.
///
/// Input of any length is buffered and fed to one rubato instance in `chunk_len` pieces, so the
/// filter state carries across calls and arbitrary chunk boundaries stay seamless. Samples that
/// do not fill a chunk wait for the next call.
pub struct MonoResampler {
    from_hz: u32,
    to_hz: u32,
    chunk_len: usize,
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl MonoResampler {
    pub fn new(from_hz: u32, to_hz: u32, chunk_len: usize) -> anyhow::Result<Self> {
        if from_hz == 0 || to_hz == 0 {
            anyhow::bail!("sample rate must be non-zero");
        }
        if chunk_len == 0 {
            anyhow::bail!("chunk length must be non-zero");
        }
        Ok(Self {
            from_hz,
            to_hz,
            chunk_len,
            inner: None,
            pending: Vec::with_capacity(chunk_len),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_hz == self.to_hz
    }

    /// Input samples buffered until the next full chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        if self.is_passthrough() {
            return Ok(input.to_vec());
        }

        self.pending.extend_from_slice(input);
        if self.pending.len() < self.chunk_len {
            return Ok(Vec::new());
        }
        if self.inner.is_none() {
            self.inner = Some(self.build()?);
        }
        let Some(resampler) = self.inner.as_mut() else {
            anyhow::bail!("resampler unavailable");
        };

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_len {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_len).collect();
            let resampled = resampler
                .process(&[chunk.as_slice()], None)
                .context("resample")?;
            out.extend(resampled.into_iter().next().unwrap_or_default());
        }
        Ok(out)
    }

    /// Drops buffered input and filter history, e.g. when playback is cut off.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.inner = None;
    }

    fn build(&self) -> anyhow::Result<SincFixedIn<f32>> {
        // Short streaming chunks: a small filter keeps latency down.
        let params = rubato::SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: rubato::SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: rubato::WindowFunction::BlackmanHarris2,
        };

        SincFixedIn::<f32>::new(
            self.to_hz as f64 / self.from_hz as f64,
            2.0,
            params,
            self.chunk_len,
            1,
        )
        .context("create resampler")
    }
}

/// One-shot conversion of a whole buffer.
pub fn resample_mono_f32(
    input_samples: &[f32],
    input_sample_rate_hz: u32,
    target_sample_rate_hz: u32,
) -> anyhow::Result<Vec<f32>> {
    if input_samples.is_empty() {
        return Ok(Vec::new());
    }
    MonoResampler::new(input_sample_rate_hz, target_sample_rate_hz, input_samples.len())?
        .process(input_samples)
}
