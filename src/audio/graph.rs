//! The persistent effects graph
//!
//! One instance lives for the whole engine lifetime. Signal flow:
//!
//! ```text
//! voices ─► compressor ─► distortion ─┬────────────────┐
//!                                     └► delay ◄─ fb ──┤ (wet mix)
//! voices ──────────────► reverb ─► send ───────────────┤
//!                                                      ▼
//!                                 master gain ─► pan ─► (L, R) + taps
//! ```
//!
//! Every automated value moves through a smoothed target so parameter
//! updates never click. `apply_params` compares the sanitized parameter
//! signature and does nothing when the set is unchanged.

use std::f32::consts::FRAC_PI_2;

use super::fx::{Compressor, DelayLine, DistortionCurveCache, Reverb, Smoothed, WaveShaper};
use super::params::SynthParams;

/// Longest delay time the graph supports, seconds
const MAX_DELAY: f32 = 5.0;

pub struct AudioGraph {
    sample_rate: f32,
    compressor: Compressor,
    shaper: WaveShaper,
    delay: DelayLine,
    delay_wet: Smoothed,
    reverb: Reverb,
    reverb_send: Smoothed,
    master_gain: Smoothed,
    /// -1 (left) .. 1 (right)
    pan: Smoothed,
    curves: DistortionCurveCache,
    last_signature: String,
}

impl AudioGraph {
    pub fn new(sample_rate: f32) -> Self {
        let mut curves = DistortionCurveCache::new();
        let identity = curves.get(0.0);
        Self {
            sample_rate,
            compressor: Compressor::new(sample_rate, -8.0, 2.2, 0.003, 0.25),
            shaper: WaveShaper::new(identity),
            delay: DelayLine::new(sample_rate, MAX_DELAY),
            delay_wet: Smoothed::new(sample_rate, 0.0),
            reverb: Reverb::new(sample_rate),
            reverb_send: Smoothed::new(sample_rate, 0.0),
            master_gain: Smoothed::new(sample_rate, 0.7),
            pan: Smoothed::new(sample_rate, 0.0),
            curves,
            last_signature: String::new(),
        }
    }

    /// Schedule smoothed ramps toward the new parameter set.
    ///
    /// Returns `false` (and does nothing) when the signature is unchanged.
    pub fn apply_params(&mut self, params: &SynthParams) -> bool {
        let signature = params.signature();
        if signature == self.last_signature {
            return false;
        }

        self.master_gain.set_target(params.volume as f32, 0.01);

        let delay_seconds = (params.delay_ms / 1000.0) as f32;
        self.delay
            .time
            .set_target(delay_seconds * self.sample_rate, 0.05);
        let feedback = (params.delay_ms / 400.0).clamp(0.0, 0.7) as f32;
        self.delay.feedback.set_target(feedback, 0.1);
        let wet = if delay_seconds > 0.01 { 0.5 } else { 0.0 };
        self.delay_wet.set_target(wet, 0.05);

        self.reverb_send.set_target(params.reverb as f32, 0.1);
        self.shaper.set_curve(self.curves.get(params.distortion));
        self.pan.set_target(((params.pan - 0.5) * 2.0) as f32, 0.05);

        self.last_signature = signature;
        true
    }

    /// Process one mixed voice sample into a stereo frame.
    #[inline]
    pub fn process(&mut self, input: f32) -> (f32, f32) {
        let dry = self.compressor.process(input);
        let shaped = self.shaper.shape(dry);

        let delayed = self.delay.process(shaped);
        let mixed = shaped + delayed * self.delay_wet.next();

        let wet_reverb = self.reverb.process(input) * self.reverb_send.next();

        let pre = (mixed + wet_reverb) * self.master_gain.next();

        // Equal-power pan: -1..1 mapped onto a quarter circle.
        let pan = self.pan.next().clamp(-1.0, 1.0);
        let angle = (pan + 1.0) * 0.5 * FRAC_PI_2;
        (pre * angle.cos(), pre * angle.sin())
    }

    /// Clear all time-based state (delay/reverb tails, compressor envelope).
    pub fn reset(&mut self) {
        self.delay.reset();
        self.reverb.reset();
        self.compressor.reset();
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
}
