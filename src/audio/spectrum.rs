//! Analysis tap
//!
//! A small FFT analyzer fed from the end of the graph. External visualizers
//! read band magnitudes or byte-scaled bins; nothing in the playback path
//! depends on it.

use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// FFT window length (power of two)
const FFT_SIZE: usize = 1024;

/// Log-spaced magnitude bands exposed to visualizers
pub const ANALYSIS_BANDS: usize = 32;

pub struct AnalysisTap {
    fft: Arc<dyn RealToComplex<f32>>,
    ring: Vec<f32>,
    write_pos: usize,
    windowed: Vec<f32>,
    window: Vec<f32>,
    spectrum: Vec<realfft::num_complex::Complex<f32>>,
    bands: [f32; ANALYSIS_BANDS],
    band_edges: [f32; ANALYSIS_BANDS + 1],
    sample_rate: f32,
    /// 0..1, higher = slower band response
    smoothing: f32,
}

impl AnalysisTap {
    pub fn new(sample_rate: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let spectrum = fft.make_output_vec();

        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / FFT_SIZE as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();

        // Log-spaced band edges, 20 Hz up to Nyquist (capped at 20 kHz).
        let low = 20.0f32.ln();
        let high = (20_000.0f32.min(sample_rate / 2.0)).ln();
        let mut band_edges = [0.0f32; ANALYSIS_BANDS + 1];
        for (i, edge) in band_edges.iter_mut().enumerate() {
            let t = i as f32 / ANALYSIS_BANDS as f32;
            *edge = (low + t * (high - low)).exp();
        }

        Self {
            fft,
            ring: vec![0.0; FFT_SIZE],
            write_pos: 0,
            windowed: vec![0.0; FFT_SIZE],
            window,
            spectrum,
            bands: [0.0; ANALYSIS_BANDS],
            band_edges,
            sample_rate,
            smoothing: 0.8,
        }
    }

    /// Feed mono samples from the render loop.
    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.ring[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % FFT_SIZE;
        }
    }

    /// Run the FFT over the current window and refresh band magnitudes.
    pub fn analyze(&mut self) {
        for (i, (&s, &w)) in self.ring.iter().zip(&self.window).enumerate() {
            self.windowed[i] = s * w;
        }
        if self
            .fft
            .process(&mut self.windowed, &mut self.spectrum)
            .is_err()
        {
            return;
        }

        let bin_hz = self.sample_rate / FFT_SIZE as f32;
        let bins = self.spectrum.len();

        for band in 0..ANALYSIS_BANDS {
            let low_bin = ((self.band_edges[band] / bin_hz) as usize).max(1);
            let high_bin = ((self.band_edges[band + 1] / bin_hz) as usize).min(bins - 1);

            let mut sum = 0.0;
            let mut count = 0usize;
            for bin in low_bin..=high_bin.max(low_bin) {
                sum += self.spectrum[bin].norm();
                count += 1;
            }
            let magnitude = if count > 0 {
                (sum / count as f32 / (FFT_SIZE as f32 / 4.0)).min(1.0)
            } else {
                0.0
            };

            self.bands[band] =
                self.bands[band] * self.smoothing + magnitude * (1.0 - self.smoothing);
        }
    }

    /// Current band magnitudes, 0..1 linear.
    pub fn band_magnitudes(&self) -> [f32; ANALYSIS_BANDS] {
        self.bands
    }

    /// Bands scaled into 0..255, the shape visualizers expect.
    pub fn byte_bands(&self) -> [u8; ANALYSIS_BANDS] {
        let mut out = [0u8; ANALYSIS_BANDS];
        for (dst, &mag) in out.iter_mut().zip(&self.bands) {
            *dst = (mag * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write_pos = 0;
        self.bands = [0.0; ANALYSIS_BANDS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_yields_empty_bands() {
        let mut tap = AnalysisTap::new(44_100.0);
        tap.push(&vec![0.0; FFT_SIZE]);
        tap.analyze();
        assert!(tap.band_magnitudes().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn a_tone_shows_up_in_the_right_band() {
        let mut tap = AnalysisTap::new(44_100.0);
        let freq = 1000.0f32;
        let samples: Vec<f32> = (0..FFT_SIZE * 4)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32 / 44_100.0).sin())
            .collect();
        tap.push(&samples);
        for _ in 0..8 {
            tap.analyze(); // let smoothing settle
        }

        let bands = tap.band_magnitudes();
        let loudest = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        // 1 kHz sits a bit above the middle of a 20..20k log scale.
        assert!(
            (14..=22).contains(&loudest),
            "1 kHz landed in band {loudest}"
        );
        assert!(bands[loudest] > 0.0);
    }

    #[test]
    fn byte_bands_track_magnitudes() {
        let mut tap = AnalysisTap::new(44_100.0);
        let samples: Vec<f32> = (0..FFT_SIZE).map(|n| (0.3 * n as f32).sin()).collect();
        tap.push(&samples);
        tap.analyze();
        let mags = tap.band_magnitudes();
        let bytes = tap.byte_bands();
        for (m, b) in mags.iter().zip(&bytes) {
            assert_eq!(*b, (m * 255.0).round() as u8);
        }
    }
}
