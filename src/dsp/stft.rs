//! Short-time Fourier transform front end
//!
//! Slides a Hann-windowed analysis frame over the sample buffer and
//! produces half-spectra in the log-magnitude domain. One FFT plan and one
//! set of scratch buffers per pipeline instance; no allocation per frame in
//! the steady state.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::error::EngineError;

/// Windowed FFT pipeline over a fixed analysis grid
///
/// Frame `t` covers samples `[t*hop, t*hop + win)`; magnitudes are
/// `log1p(|X[k]|)` for `k < win/2`. The log compression stabilizes peak
/// ordering against loudness differences between encodes.
pub struct Stft {
    win: usize,
    hop: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl Stft {
    /// Create a pipeline for the given grid
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidInput` when `win` is not a power of two
    /// or `hop` is zero.
    pub fn new(win: usize, hop: usize) -> Result<Self, EngineError> {
        if win == 0 || !win.is_power_of_two() {
            return Err(EngineError::InvalidInput(format!(
                "Window size must be a power of two, got {}",
                win
            )));
        }
        if hop == 0 {
            return Err(EngineError::InvalidInput("Hop size must be > 0".to_string()));
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(win);
        let scratch_len = fft.get_inplace_scratch_len();

        // Hann window, precomputed once per pipeline
        let denom = (win - 1) as f32;
        let window = (0..win)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / denom).cos()))
            .collect();

        Ok(Self {
            win,
            hop,
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); win],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            magnitudes: vec![0.0; win / 2],
        })
    }

    /// Window size in samples
    pub fn win(&self) -> usize {
        self.win
    }

    /// Hop size in samples
    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of spectral bins per frame (`win / 2`)
    pub fn bins(&self) -> usize {
        self.win / 2
    }

    /// Number of complete frames in a buffer of `n_samples`
    pub fn frame_count(&self, n_samples: usize) -> usize {
        if n_samples < self.win {
            return 0;
        }
        (n_samples - self.win) / self.hop + 1
    }

    /// Compute the log-magnitude half-spectrum of frame `t`
    ///
    /// Returns a borrow of the internal magnitude buffer, valid until the
    /// next call. `None` when the frame does not fit inside `samples`.
    pub fn magnitudes(&mut self, samples: &[f32], t: usize) -> Option<&[f32]> {
        let start = t.checked_mul(self.hop)?;
        let end = start.checked_add(self.win)?;
        if end > samples.len() {
            return None;
        }

        for (i, (&sample, &w)) in samples[start..end].iter().zip(&self.window).enumerate() {
            self.buffer[i] = Complex::new(sample * w, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (m, c) in self.magnitudes.iter_mut().zip(&self.buffer[..self.win / 2]) {
            *m = (c.re * c.re + c.im * c.im).sqrt().ln_1p();
        }

        Some(&self.magnitudes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pure tone at the given frequency
    fn tone(freq: f32, sample_rate: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_frame_count_arithmetic() {
        let stft = Stft::new(4096, 512).unwrap();
        assert_eq!(stft.frame_count(0), 0);
        assert_eq!(stft.frame_count(4095), 0);
        assert_eq!(stft.frame_count(4096), 1);
        assert_eq!(stft.frame_count(4096 + 511), 1);
        assert_eq!(stft.frame_count(4096 + 512), 2);
    }

    #[test]
    fn test_invalid_grid_rejected() {
        assert!(Stft::new(4000, 512).is_err());
        assert!(Stft::new(4096, 0).is_err());
    }

    #[test]
    fn test_tone_lands_on_expected_bin() {
        let sample_rate = 11025.0;
        let win = 4096;
        let mut stft = Stft::new(win, 512).unwrap();

        // 1 kHz should peak at bin round(1000 * win / sr) = 372
        let samples = tone(1000.0, sample_rate, win * 2);
        let mags = stft.magnitudes(&samples, 0).unwrap();

        let (argmax, _) = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();

        let expected = (1000.0 * win as f32 / sample_rate).round() as usize;
        assert!(
            (argmax as i64 - expected as i64).abs() <= 1,
            "Tone should peak at bin {}, got {}",
            expected,
            argmax
        );
    }

    #[test]
    fn test_out_of_range_frame_is_none() {
        let mut stft = Stft::new(4096, 512).unwrap();
        let samples = vec![0.0f32; 4096];
        assert!(stft.magnitudes(&samples, 0).is_some());
        assert!(stft.magnitudes(&samples, 1).is_none());
    }

    #[test]
    fn test_magnitudes_nonnegative() {
        let mut stft = Stft::new(1024, 256).unwrap();
        let samples = tone(440.0, 11025.0, 4096);
        let mags = stft.magnitudes(&samples, 2).unwrap();
        assert!(mags.iter().all(|&m| m >= 0.0));
    }
}
