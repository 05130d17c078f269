//! Effect primitives used by the audio graph
//!
//! Smoothed parameter targets, the distortion waveshaper and its curve
//! cache, a feedback delay line, a program compressor and a comb/allpass
//! reverb. All are mono in the dry path; stereo is produced by the pan
//! stage at the end of the graph.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::f32::consts::PI;
use std::sync::Arc;

/// Samples in a distortion transfer curve
const CURVE_RESOLUTION: usize = 8192;

/// Distortion curves kept before the oldest is evicted
const MAX_CURVES: usize = 64;

// ---------------------------------------------------------------------------
// Parameter smoothing
// ---------------------------------------------------------------------------

/// A parameter that approaches its target exponentially with a configurable
/// time constant. Automation never jumps, so gain/pan/delay changes stay
/// click-free.
#[derive(Debug, Clone, Copy)]
pub struct Smoothed {
    current: f32,
    target: f32,
    coeff: f32,
    sample_rate: f32,
}

impl Smoothed {
    pub fn new(sample_rate: f32, initial: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: 0.0,
            sample_rate,
        }
    }

    /// Start ramping toward `target` with the given time constant (seconds).
    pub fn set_target(&mut self, target: f32, time_constant: f32) {
        self.target = target;
        let tc = time_constant.max(1e-4);
        self.coeff = (-1.0 / (tc * self.sample_rate)).exp();
    }

    /// Set the value immediately, bypassing the ramp.
    pub fn snap(&mut self, value: f32) {
        self.current = value;
        self.target = value;
    }

    /// Advance one sample and return the smoothed value.
    #[inline]
    pub fn next(&mut self) -> f32 {
        self.current = self.target + (self.current - self.target) * self.coeff;
        self.current
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }
}

// ---------------------------------------------------------------------------
// Distortion
// ---------------------------------------------------------------------------

/// Transfer curves keyed by drive amount rounded to three decimals.
pub struct DistortionCurveCache {
    curves: HashMap<u32, Arc<Vec<f32>>>,
    order: VecDeque<u32>,
}

impl DistortionCurveCache {
    pub fn new() -> Self {
        Self {
            curves: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Curve for `amount` in 0..1. Zero yields the identity curve.
    pub fn get(&mut self, amount: f64) -> Arc<Vec<f32>> {
        let normalized = amount.clamp(0.0, 1.0);
        let key = (normalized * 1000.0).round() as u32;

        if let Some(curve) = self.curves.get(&key) {
            return Arc::clone(curve);
        }

        let curve = Arc::new(build_curve(key as f32 / 1000.0));
        if self.curves.len() >= MAX_CURVES {
            if let Some(oldest) = self.order.pop_front() {
                self.curves.remove(&oldest);
            }
        }
        self.curves.insert(key, Arc::clone(&curve));
        self.order.push_back(key);
        curve
    }
}

impl Default for DistortionCurveCache {
    fn default() -> Self {
        Self::new()
    }
}

fn build_curve(amount: f32) -> Vec<f32> {
    let n = CURVE_RESOLUTION;
    if amount <= 0.0 {
        return (0..n).map(|i| (i as f32 * 2.0) / n as f32 - 1.0).collect();
    }
    let k = amount * 150.0;
    let deg = PI / 180.0;
    (0..n)
        .map(|i| {
            let x = (i as f32 * 2.0) / n as f32 - 1.0;
            ((3.0 + k) * x * 20.0 * deg) / (PI + k * x.abs())
        })
        .collect()
}

/// Maps samples through a transfer curve with linear interpolation.
pub struct WaveShaper {
    curve: Arc<Vec<f32>>,
}

impl WaveShaper {
    pub fn new(curve: Arc<Vec<f32>>) -> Self {
        Self { curve }
    }

    pub fn set_curve(&mut self, curve: Arc<Vec<f32>>) {
        self.curve = curve;
    }

    #[inline]
    pub fn shape(&self, input: f32) -> f32 {
        let n = self.curve.len();
        let pos = (input.clamp(-1.0, 1.0) + 1.0) * 0.5 * (n - 1) as f32;
        let idx = pos as usize;
        let frac = pos - idx as f32;
        if idx + 1 >= n {
            self.curve[n - 1]
        } else {
            self.curve[idx] * (1.0 - frac) + self.curve[idx + 1] * frac
        }
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Feedback delay line with a smoothed delay time.
pub struct DelayLine {
    buffer: Vec<f32>,
    write: usize,
    /// delay time in samples
    pub time: Smoothed,
    pub feedback: Smoothed,
}

impl DelayLine {
    /// `max_seconds` bounds the longest representable delay.
    pub fn new(sample_rate: f32, max_seconds: f32) -> Self {
        let len = ((max_seconds * sample_rate) as usize).max(1);
        Self {
            buffer: vec![0.0; len],
            write: 0,
            time: Smoothed::new(sample_rate, 0.0),
            feedback: Smoothed::new(sample_rate, 0.0),
        }
    }

    /// Push one input sample, return the delayed (wet) sample.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let len = self.buffer.len();
        let delay = self.time.next().clamp(1.0, (len - 1) as f32);

        let read_pos = self.write as f32 - delay;
        let read_pos = if read_pos < 0.0 {
            read_pos + len as f32
        } else {
            read_pos
        };
        let idx = read_pos as usize % len;
        let frac = read_pos - read_pos.floor();
        let a = self.buffer[idx];
        let b = self.buffer[(idx + 1) % len];
        let delayed = a * (1.0 - frac) + b * frac;

        self.buffer[self.write] = input + delayed * self.feedback.next();
        self.write = (self.write + 1) % len;

        delayed
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write = 0;
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Feed-forward dynamics compressor with attack/release level following.
pub struct Compressor {
    pub threshold_db: f32,
    pub ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: f32, threshold_db: f32, ratio: f32, attack: f32, release: f32) -> Self {
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: (-1.0 / (attack.max(1e-4) * sample_rate)).exp(),
            release_coeff: (-1.0 / (release.max(1e-4) * sample_rate)).exp(),
            envelope: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let level = input.abs();
        let coeff = if level > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = level + (self.envelope - level) * coeff;

        let env_db = 20.0 * self.envelope.max(1e-6).log10();
        let over_db = env_db - self.threshold_db;
        if over_db <= 0.0 {
            return input;
        }
        let gain_db = -over_db * (1.0 - 1.0 / self.ratio);
        input * 10f32.powf(gain_db / 20.0)
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

// ---------------------------------------------------------------------------
// Reverb
// ---------------------------------------------------------------------------

/// Base comb delay lengths at 44.1 kHz (Schroeder/Freeverb tunings).
const COMB_TUNINGS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNINGS: [usize; 4] = [556, 441, 341, 225];

struct Comb {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damp: f32,
    filter_state: f32,
}

impl Comb {
    fn new(len: usize, feedback: f32, damp: f32) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
            feedback,
            damp,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let out = self.buffer[self.index];
        self.filter_state = out * (1.0 - self.damp) + self.filter_state * self.damp;
        self.buffer[self.index] = input + self.filter_state * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }
}

struct Allpass {
    buffer: Vec<f32>,
    index: usize,
}

impl Allpass {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.index];
        let out = delayed - input;
        self.buffer[self.index] = input + delayed * 0.5;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }
}

/// Parallel-comb + series-allpass reverb. Comb lengths are jittered a few
/// percent at construction so the tail decorrelates instead of ringing at
/// the textbook tunings.
pub struct Reverb {
    combs: Vec<Comb>,
    allpasses: Vec<Allpass>,
}

impl Reverb {
    pub fn new(sample_rate: f32) -> Self {
        let scale = sample_rate / 44_100.0;
        let mut rng = rand::thread_rng();

        let combs = COMB_TUNINGS
            .iter()
            .map(|&len| {
                let jitter = rng.gen_range(0.98..1.02);
                let scaled = (len as f32 * scale * jitter) as usize;
                Comb::new(scaled, 0.84, 0.2)
            })
            .collect();

        let allpasses = ALLPASS_TUNINGS
            .iter()
            .map(|&len| Allpass::new((len as f32 * scale) as usize))
            .collect();

        Self { combs, allpasses }
    }

    /// One sample in, one wet sample out.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let mut out = 0.0;
        for comb in &mut self.combs {
            out += comb.process(input);
        }
        out /= self.combs.len() as f32;
        for allpass in &mut self.allpasses {
            out = allpass.process(out);
        }
        out
    }

    pub fn reset(&mut self) {
        for comb in &mut self.combs {
            comb.buffer.fill(0.0);
            comb.filter_state = 0.0;
        }
        for allpass in &mut self.allpasses {
            allpass.buffer.fill(0.0);
        }
    }
}
