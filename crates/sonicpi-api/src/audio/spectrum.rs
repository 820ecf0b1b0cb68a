use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// Hann-windowed magnitude spectrum of a fixed frame size.
///
/// All buffers are allocated in `new`; `magnitudes` does no allocation.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(2);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_size);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        let window = (0..frame_size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / frame_size as f32).cos())
            .collect();
        Self {
            fft,
            window,
            input,
            output,
            scratch,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.window.len()
    }

    /// Number of magnitude bins produced (DC up to, excluding, Nyquist).
    pub fn bins(&self) -> usize {
        self.frame_size() / 2
    }

    /// Compute magnitudes of `samples` into `out`.
    ///
    /// Short input is zero-padded, long input uses its first `frame_size`
    /// samples. `out` is resized to [`SpectrumAnalyzer::bins`] within its
    /// existing capacity when callers size it up front.
    pub fn magnitudes(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let n = self.frame_size();
        for (i, slot) in self.input.iter_mut().enumerate() {
            *slot = samples.get(i).copied().unwrap_or(0.0) * self.window[i];
        }

        out.clear();
        if let Err(e) = self
            .fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
        {
            log::error!("[AUDIO] FFT failed: {}", e);
            out.resize(self.bins(), 0.0);
            return;
        }

        let scale = 2.0 / n as f32;
        out.extend(self.output[..self.bins()].iter().map(|c| c.norm() * scale));
    }
}

/// Downsample `spectrum` into at most `max_buckets` log-spaced buckets.
///
/// Each bucket holds the peak of its bins. Bucket edges depend only on the
/// spectrum length and bucket count, so identical input gives identical
/// output. Every bucket spans at least one bin.
pub fn quantize(spectrum: &[f32], max_buckets: usize, out: &mut Vec<f32>) {
    out.clear();
    let bins = spectrum.len();
    let count = max_buckets.min(bins);
    if count == 0 {
        return;
    }

    let mut start = 0usize;
    for b in 0..count {
        let remaining = count - b - 1;
        let end = if remaining == 0 {
            bins
        } else {
            let edge = (bins as f64).powf((b + 1) as f64 / count as f64).round() as usize;
            edge.max(start + 1).min(bins - remaining)
        };
        let peak = spectrum[start..end]
            .iter()
            .copied()
            .fold(0.0f32, f32::max);
        out.push(peak);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_bin: usize, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq_bin as f32 * i as f32 / n as f32).sin())
            .collect()
    }

    #[test]
    fn test_sine_peak_lands_in_its_bin() {
        let mut analyzer = SpectrumAnalyzer::new(1024);
        let mut out = Vec::with_capacity(analyzer.bins());
        analyzer.magnitudes(&sine(64, 1024), &mut out);
        assert_eq!(out.len(), 512);
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64);
    }

    #[test]
    fn test_silence_and_short_input() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        let mut out = Vec::new();
        analyzer.magnitudes(&[0.0; 10], &mut out);
        assert_eq!(out.len(), 128);
        assert!(out.iter().all(|m| *m == 0.0));
    }

    #[test]
    fn test_quantize_never_exceeds_max() {
        let spectrum: Vec<f32> = (0..512).map(|i| i as f32).collect();
        let mut out = Vec::new();
        for max in [0, 1, 2, 7, 64, 511, 512, 513, 4096] {
            quantize(&spectrum, max, &mut out);
            assert!(out.len() <= max);
            assert_eq!(out.len(), max.min(512));
        }
    }

    #[test]
    fn test_quantize_takes_peak_and_covers_all_bins() {
        let mut spectrum = vec![0.0f32; 100];
        spectrum[99] = 5.0;
        spectrum[0] = 1.0;
        let mut out = Vec::new();
        quantize(&spectrum, 8, &mut out);
        assert_eq!(out[0], 1.0);
        assert_eq!(*out.last().unwrap(), 5.0);
    }

    #[test]
    fn test_quantize_is_deterministic() {
        let spectrum: Vec<f32> = (0..300).map(|i| ((i * 37) % 11) as f32).collect();
        let mut a = Vec::new();
        let mut b = Vec::new();
        quantize(&spectrum, 24, &mut a);
        quantize(&spectrum, 24, &mut b);
        assert_eq!(a, b);
    }
}
