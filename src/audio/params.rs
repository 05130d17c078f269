//! Synthesis parameter sanitizing
//!
//! External callers hand the engine arbitrary partial parameter sets
//! (typically deserialized from JSON). `SynthParams::from_partial` defaults
//! and range-clamps every recognized field so the rest of the engine only
//! ever sees a fully populated, in-range struct. Sanitizing never fails.

use serde::{Deserialize, Serialize};

/// Shortest usable ramp/fade time in seconds. Also the floor for attack and
/// release so gain changes never jump instantaneously.
pub const MICRO_FADE: f64 = 0.005;

#[inline]
fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return min;
    }
    value.clamp(min, max)
}

/// Partial parameter input. Every field is optional; unknown fields in the
/// source JSON are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialParams {
    pub volume: Option<f64>,
    pub delay_ms: Option<f64>,
    pub reverb: Option<f64>,
    pub distortion: Option<f64>,
    pub pan: Option<f64>,
    pub phase_offset: Option<f64>,
    pub use_adsr: Option<bool>,
    pub attack: Option<f64>,
    pub decay: Option<f64>,
    pub sustain: Option<f64>,
    pub release: Option<f64>,
    pub use_fm: Option<bool>,
    pub fm_ratio: Option<f64>,
    pub fm_index: Option<f64>,
    pub use_filter: Option<bool>,
    pub filter_cutoff: Option<f64>,
    pub filter_resonance: Option<f64>,
    pub filter_mode: Option<f64>,
    pub lfo_rate: Option<f64>,
    pub lfo_depth: Option<f64>,
    pub lfo_target: Option<f64>,
    pub unison_voices: Option<f64>,
    pub unison_detune: Option<f64>,
}

/// Canonical synthesis parameters. Every field is always present and clamped
/// to its documented range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthParams {
    /// Master volume, 0..1
    pub volume: f64,
    /// Delay time in milliseconds, 0..500
    pub delay_ms: f64,
    /// Reverb send level, 0..1
    pub reverb: f64,
    /// Distortion amount, 0..1
    pub distortion: f64,
    /// Stereo position, 0 = left, 0.5 = center, 1 = right
    pub pan: f64,
    /// Oscillator phase offset in degrees, 0..360
    pub phase_offset: f64,
    pub use_adsr: bool,
    /// Attack time in seconds, MICRO_FADE..5
    pub attack: f64,
    /// Decay time in seconds, 0..5
    pub decay: f64,
    /// Sustain level relative to peak, 0..1
    pub sustain: f64,
    /// Release time in seconds, MICRO_FADE..5
    pub release: f64,
    pub use_fm: bool,
    /// FM modulator/carrier frequency ratio, 0.5..8
    pub fm_ratio: f64,
    /// FM modulation index, 0..30
    pub fm_index: f64,
    pub use_filter: bool,
    pub filter_cutoff: f64,
    pub filter_resonance: f64,
    /// 0 lowpass, 1 highpass, 2 bandpass, 3 notch
    pub filter_mode: u8,
    pub lfo_rate: f64,
    pub lfo_depth: f64,
    /// 0 none, 1 pitch, 2 amplitude, 3 filter
    pub lfo_target: u8,
    /// 1..4 stacked detuned oscillators
    pub unison_voices: u8,
    /// Unison spread in cents, 0..50
    pub unison_detune: f64,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self::from_partial(&PartialParams::default())
    }
}

impl SynthParams {
    /// Default then clamp every field. Any input yields a valid struct.
    pub fn from_partial(input: &PartialParams) -> Self {
        Self {
            volume: clamp(input.volume.unwrap_or(0.7), 0.0, 1.0),
            delay_ms: clamp(input.delay_ms.unwrap_or(0.0), 0.0, 500.0),
            reverb: clamp(input.reverb.unwrap_or(0.3), 0.0, 1.0),
            distortion: clamp(input.distortion.unwrap_or(0.0), 0.0, 1.0),
            pan: clamp(input.pan.unwrap_or(0.5), 0.0, 1.0),
            phase_offset: clamp(input.phase_offset.unwrap_or(0.0), 0.0, 360.0),
            use_adsr: input.use_adsr.unwrap_or(true),
            attack: clamp(input.attack.unwrap_or(0.01), MICRO_FADE, 5.0),
            decay: clamp(input.decay.unwrap_or(0.1), 0.0, 5.0),
            sustain: clamp(input.sustain.unwrap_or(0.8), 0.0, 1.0),
            release: clamp(input.release.unwrap_or(0.3), MICRO_FADE, 5.0),
            use_fm: input.use_fm.unwrap_or(false),
            fm_ratio: clamp(input.fm_ratio.unwrap_or(2.0), 0.5, 8.0),
            fm_index: clamp(input.fm_index.unwrap_or(2.0), 0.0, 30.0),
            use_filter: input.use_filter.unwrap_or(false),
            filter_cutoff: clamp(input.filter_cutoff.unwrap_or(18_000.0), 20.0, 20_000.0),
            filter_resonance: clamp(input.filter_resonance.unwrap_or(0.7), 0.1, 10.0),
            filter_mode: clamp(input.filter_mode.unwrap_or(0.0).floor(), 0.0, 3.0) as u8,
            lfo_rate: clamp(input.lfo_rate.unwrap_or(0.0), 0.0, 20.0),
            lfo_depth: clamp(input.lfo_depth.unwrap_or(0.0), 0.0, 1.0),
            lfo_target: clamp(input.lfo_target.unwrap_or(0.0).floor(), 0.0, 3.0) as u8,
            unison_voices: clamp(input.unison_voices.unwrap_or(1.0).floor(), 1.0, 4.0) as u8,
            unison_detune: clamp(input.unison_detune.unwrap_or(0.0), 0.0, 50.0),
        }
    }

    /// Stable textual fingerprint of the parameter set. The graph compares
    /// signatures to skip redundant automation scheduling.
    pub fn signature(&self) -> String {
        format!(
            "{:.4}|{:.4}|{:.4}|{:.4}|{:.4}|{:.4}|{}|{:.4}|{:.4}|{:.4}|{:.4}|{}|{:.4}|{:.4}|{}|{:.4}|{:.4}|{}|{:.4}|{:.4}|{}|{}|{:.4}",
            self.volume,
            self.delay_ms,
            self.reverb,
            self.distortion,
            self.pan,
            self.phase_offset,
            self.use_adsr,
            self.attack,
            self.decay,
            self.sustain,
            self.release,
            self.use_fm,
            self.fm_ratio,
            self.fm_index,
            self.use_filter,
            self.filter_cutoff,
            self.filter_resonance,
            self.filter_mode,
            self.lfo_rate,
            self.lfo_depth,
            self.lfo_target,
            self.unison_voices,
            self.unison_detune,
        )
    }
}
