//! Numeric synthesis boundary
//!
//! Pure, deterministic sample-buffer generation: band-limited oscillators
//! (PolyBLEP for sawtooth/square), two-operator FM, and an offline ADSR
//! envelope. The `WaveformSynth` trait is the seam the waveform cache calls
//! through; `PolyBlepSynth` is the in-process implementation.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

const TWO_PI: f32 = 2.0 * PI;

/// Oscillator waveform shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    Sine,
    Sawtooth,
    Square,
    Triangle,
}

impl WaveformKind {
    /// Lenient parse matching the names UIs and manifests use.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sine" => Some(Self::Sine),
            "saw" | "sawtooth" => Some(Self::Sawtooth),
            "square" => Some(Self::Square),
            "triangle" => Some(Self::Triangle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sine => "sine",
            Self::Sawtooth => "sawtooth",
            Self::Square => "square",
            Self::Triangle => "triangle",
        }
    }
}

/// ADSR envelope times/levels for offline application
#[derive(Debug, Clone, Copy)]
pub struct Adsr {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

/// Boundary for raw waveform generation and envelope application.
///
/// Implementations must be pure: same inputs, same samples, no side effects.
pub trait WaveformSynth: Send + Sync {
    /// Generate `duration` seconds of the given waveform.
    /// `phase_offset` is in radians.
    fn generate(
        &self,
        kind: WaveformKind,
        frequency: f32,
        phase_offset: f32,
        duration: f32,
        sample_rate: f32,
    ) -> Vec<f32>;

    /// Generate a two-operator FM tone (sine carrier, sine modulator).
    fn generate_fm(
        &self,
        carrier: f32,
        modulator: f32,
        index: f32,
        duration: f32,
        sample_rate: f32,
    ) -> Vec<f32>;

    /// Apply an ADSR envelope in place. The release segment occupies the tail
    /// of the buffer; attack/decay are truncated on very short buffers.
    fn apply_adsr(&self, samples: &mut [f32], adsr: Adsr, sample_rate: f32);
}

/// PolyBLEP correction for step discontinuities. `t` is normalized phase,
/// `dt` the per-sample phase increment.
#[inline(always)]
fn poly_blep(t: f32, dt: f32) -> f32 {
    if t < dt {
        let x = t / dt;
        2.0 * x - x * x - 1.0
    } else if t > 1.0 - dt {
        let x = (t - 1.0) / dt;
        x * x + 2.0 * x + 1.0
    } else {
        0.0
    }
}

/// In-process synthesizer
#[derive(Debug, Default, Clone, Copy)]
pub struct PolyBlepSynth;

impl WaveformSynth for PolyBlepSynth {
    fn generate(
        &self,
        kind: WaveformKind,
        frequency: f32,
        phase_offset: f32,
        duration: f32,
        sample_rate: f32,
    ) -> Vec<f32> {
        let count = (duration * sample_rate) as usize;
        let dt = frequency / sample_rate;
        let phase_cycles = phase_offset / TWO_PI;

        (0..count)
            .map(|n| {
                let t = n as f32 / sample_rate;
                match kind {
                    WaveformKind::Sine => (TWO_PI * frequency * t + phase_offset).sin(),
                    WaveformKind::Sawtooth => {
                        let phase = (frequency * t + phase_cycles).fract();
                        2.0 * phase - 1.0 - poly_blep(phase, dt)
                    }
                    WaveformKind::Square => {
                        let phase = (frequency * t + phase_cycles).fract();
                        let square = if phase < 0.5 { 1.0 } else { -1.0 };
                        square + poly_blep(phase, dt) - poly_blep((phase + 0.5).fract(), dt)
                    }
                    WaveformKind::Triangle => {
                        let phase = (frequency * t + phase_cycles).fract();
                        2.0 * (2.0 * phase - 1.0).abs() - 1.0
                    }
                }
            })
            .collect()
    }

    fn generate_fm(
        &self,
        carrier: f32,
        modulator: f32,
        index: f32,
        duration: f32,
        sample_rate: f32,
    ) -> Vec<f32> {
        let count = (duration * sample_rate) as usize;
        (0..count)
            .map(|n| {
                let t = n as f32 / sample_rate;
                (TWO_PI * carrier * t + index * (TWO_PI * modulator * t).sin()).sin()
            })
            .collect()
    }

    fn apply_adsr(&self, samples: &mut [f32], adsr: Adsr, sample_rate: f32) {
        let total = samples.len();
        let attack = (adsr.attack * sample_rate) as usize;
        let decay = (adsr.decay * sample_rate) as usize;
        let release = (adsr.release * sample_rate) as usize;
        let sustain_level = adsr.sustain.clamp(0.0, 1.0);
        let sustain = total.saturating_sub(attack + decay + release);

        for (i, sample) in samples.iter_mut().enumerate() {
            let amplitude = if i < attack {
                i as f32 / attack.max(1) as f32
            } else if i < attack + decay {
                1.0 - (1.0 - sustain_level) * (i - attack) as f32 / decay.max(1) as f32
            } else if i < attack + decay + sustain {
                sustain_level
            } else {
                let into_release = i - attack - decay - sustain;
                sustain_level * (1.0 - into_release as f32 / release.max(1) as f32)
            };
            *sample *= amplitude.clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44_100.0;

    #[test]
    fn generates_expected_length() {
        let synth = PolyBlepSynth;
        let samples = synth.generate(WaveformKind::Sine, 440.0, 0.0, 1.0, SR);
        assert_eq!(samples.len(), 44_100);
    }

    #[test]
    fn sine_starts_at_phase_offset() {
        let synth = PolyBlepSynth;
        let zero = synth.generate(WaveformKind::Sine, 440.0, 0.0, 0.01, SR);
        let quarter = synth.generate(WaveformKind::Sine, 440.0, PI / 2.0, 0.01, SR);
        assert!(zero[0].abs() < 1e-6);
        assert!((quarter[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_waveforms_stay_in_range() {
        let synth = PolyBlepSynth;
        for kind in [
            WaveformKind::Sine,
            WaveformKind::Sawtooth,
            WaveformKind::Square,
            WaveformKind::Triangle,
        ] {
            let samples = synth.generate(kind, 440.0, 0.0, 0.1, SR);
            for &s in &samples {
                assert!(s.abs() <= 1.5, "{:?} produced out-of-range {s}", kind);
            }
        }
    }

    #[test]
    fn fm_with_zero_index_is_a_sine() {
        let synth = PolyBlepSynth;
        let fm = synth.generate_fm(220.0, 440.0, 0.0, 0.05, SR);
        let sine = synth.generate(WaveformKind::Sine, 220.0, 0.0, 0.05, SR);
        for (a, b) in fm.iter().zip(&sine) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn adsr_shapes_the_buffer() {
        let synth = PolyBlepSynth;
        let mut samples = vec![1.0f32; SR as usize]; // 1s of full scale
        synth.apply_adsr(
            &mut samples,
            Adsr {
                attack: 0.1,
                decay: 0.1,
                sustain: 0.5,
                release: 0.2,
            },
            SR,
        );
        // Start of attack is silent, end of attack is full scale.
        assert!(samples[0].abs() < 1e-3);
        let attack_end = (0.1 * SR) as usize;
        assert!((samples[attack_end - 1] - 1.0).abs() < 0.01);
        // Mid-sustain sits at the sustain level.
        assert!((samples[SR as usize / 2] - 0.5).abs() < 0.01);
        // Final sample has released to (near) zero.
        assert!(samples[samples.len() - 1].abs() < 0.01);
    }

    #[test]
    fn waveform_names_parse_leniently() {
        assert_eq!(WaveformKind::parse("saw"), Some(WaveformKind::Sawtooth));
        assert_eq!(WaveformKind::parse("Sawtooth"), Some(WaveformKind::Sawtooth));
        assert_eq!(WaveformKind::parse(" SINE "), Some(WaveformKind::Sine));
        assert_eq!(WaveformKind::parse("noise"), None);
    }
}
