//! Sample voice pool
//!
//! Buffer-backed voices for recorded-instrument playback. Pitch shifting is
//! playback-rate resampling (`frequency / base_frequency`, corrected for the
//! buffer's own sample rate) with linear interpolation. Unlike the
//! oscillator pool, these voices drive a full ADSR envelope themselves:
//! attack to peak, decay to `sustain * peak`, hold, then `release(t)` ramps
//! out and recycles. `stop` is the hard cutoff path (micro-fade) used for
//! voice stealing and global stops.

use std::collections::HashMap;
use std::sync::Arc;

use super::params::MICRO_FADE;

/// Pool capacity
pub const SAMPLE_POOL_SIZE: usize = 64;

const MIN_GAIN: f32 = 1e-4;

/// A decoded PCM sample (mono) with its native rate.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub data: Vec<f32>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.data.len() as f64 / self.sample_rate as f64
    }
}

/// Envelope configuration handed to a voice at trigger time.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeSettings {
    pub use_adsr: bool,
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub volume: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

struct SampleVoice {
    note_id: Option<String>,
    buffer: Option<Arc<SampleBuffer>>,
    position: f64,
    rate: f64,
    looped: bool,
    stage: Stage,
    start_frame: u64,
    value: f32,
    peak: f32,
    sustain_gain: f32,
    attack_step: f32,
    decay_step: f32,
    release_step: f32,
}

impl SampleVoice {
    fn new() -> Self {
        Self {
            note_id: None,
            buffer: None,
            position: 0.0,
            rate: 1.0,
            looped: false,
            stage: Stage::Idle,
            start_frame: 0,
            value: 0.0,
            peak: 0.0,
            sustain_gain: 0.0,
            attack_step: 0.0,
            decay_step: 0.0,
            release_step: 0.0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        note_id: &str,
        buffer: Arc<SampleBuffer>,
        frequency: f64,
        base_frequency: f64,
        velocity: f32,
        env: EnvelopeSettings,
        looped: bool,
        engine_rate: f32,
        frame: u64,
    ) {
        let pitch_ratio = if base_frequency > 0.0 && frequency > 0.0 {
            frequency / base_frequency
        } else {
            1.0
        };
        self.rate = pitch_ratio * (buffer.sample_rate as f64 / engine_rate as f64);
        self.buffer = Some(buffer);
        self.note_id = Some(note_id.to_string());
        self.position = 0.0;
        self.looped = looped;
        self.stage = Stage::Attack;
        self.start_frame = frame;
        self.value = 0.0;
        self.peak = (env.volume * velocity.clamp(0.0, 1.0)).max(0.0);

        let (attack, decay, sustain) = if env.use_adsr {
            (env.attack, env.decay, env.sustain)
        } else {
            (MICRO_FADE as f32, 0.0, 1.0)
        };
        // The decay ramp only exists when it has somewhere to go.
        self.sustain_gain = if decay > 0.0 && sustain < 1.0 {
            self.peak * sustain
        } else {
            self.peak
        };
        let attack_samples = (attack.max(MICRO_FADE as f32) * engine_rate).max(1.0);
        self.attack_step = self.peak / attack_samples;
        let decay_samples = (decay * engine_rate).max(1.0);
        self.decay_step = (self.peak - self.sustain_gain) / decay_samples;
        self.release_step = 0.0;
    }

    /// Start the release ramp. Safe to call repeatedly.
    fn release(&mut self, release_time: f32, engine_rate: f32) {
        if matches!(self.stage, Stage::Idle | Stage::Release) {
            return;
        }
        self.stage = Stage::Release;
        let release_samples = (release_time.max(MICRO_FADE as f32) * engine_rate).max(1.0);
        self.release_step = self.value.max(MIN_GAIN) / release_samples;
    }

    /// Hard cutoff: micro-fade regardless of the configured release.
    fn stop(&mut self, engine_rate: f32) {
        if self.stage == Stage::Idle {
            return;
        }
        self.stage = Stage::Release;
        let fade_samples = (MICRO_FADE as f32 * engine_rate).max(1.0);
        self.release_step = self.value.max(MIN_GAIN) / fade_samples;
    }

    fn reset(&mut self) {
        self.note_id = None;
        self.buffer = None;
        self.position = 0.0;
        self.stage = Stage::Idle;
        self.value = 0.0;
    }

    #[inline]
    fn next_sample(&mut self) -> (f32, bool) {
        let buffer = match &self.buffer {
            Some(b) => b,
            None => return (0.0, true),
        };
        let len = buffer.data.len();
        if len == 0 {
            return (0.0, true);
        }

        match self.stage {
            Stage::Attack => {
                self.value += self.attack_step;
                if self.value >= self.peak {
                    self.value = self.peak;
                    self.stage = if self.sustain_gain < self.peak {
                        Stage::Decay
                    } else {
                        Stage::Sustain
                    };
                }
            }
            Stage::Decay => {
                self.value -= self.decay_step;
                if self.value <= self.sustain_gain {
                    self.value = self.sustain_gain;
                    self.stage = Stage::Sustain;
                }
            }
            Stage::Sustain => {
                self.value = self.sustain_gain;
            }
            Stage::Release => {
                self.value -= self.release_step;
                if self.value <= MIN_GAIN {
                    return (0.0, true);
                }
            }
            Stage::Idle => return (0.0, true),
        }

        let idx = self.position as usize;
        let frac = (self.position - idx as f64) as f32;
        let a = buffer.data[idx.min(len - 1)];
        let b = buffer.data[(idx + 1).min(len - 1)];
        let sample = (a * (1.0 - frac) + b * frac) * self.value;

        self.position += self.rate;
        if self.position >= len as f64 {
            if self.looped {
                self.position -= len as f64;
            } else {
                return (sample, true);
            }
        }
        (sample, false)
    }
}

/// Fixed-capacity sample voice pool, steal-oldest on exhaustion.
pub struct SamplePool {
    voices: Vec<SampleVoice>,
    bindings: HashMap<String, usize>,
    free: Vec<usize>,
    engine_rate: f32,
    frame: u64,
}

impl SamplePool {
    pub fn new(engine_rate: f32, capacity: usize) -> Self {
        Self {
            voices: (0..capacity).map(|_| SampleVoice::new()).collect(),
            bindings: HashMap::new(),
            free: (0..capacity).rev().collect(),
            engine_rate,
            frame: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn trigger(
        &mut self,
        note_id: &str,
        buffer: Arc<SampleBuffer>,
        frequency: f64,
        base_frequency: f64,
        velocity: f32,
        env: EnvelopeSettings,
        looped: bool,
    ) {
        let index = self.acquire(note_id);
        self.voices[index].start(
            note_id,
            buffer,
            frequency,
            base_frequency,
            velocity,
            env,
            looped,
            self.engine_rate,
            self.frame,
        );
    }

    fn acquire(&mut self, note_id: &str) -> usize {
        if let Some(&index) = self.bindings.get(note_id) {
            return index;
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None => self.steal(),
        };
        self.bindings.insert(note_id.to_string(), index);
        index
    }

    fn steal(&mut self) -> usize {
        let index = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.stage != Stage::Idle)
            .min_by_key(|(_, v)| v.start_frame)
            .map(|(i, _)| i)
            .unwrap_or(0);
        if let Some(id) = self.voices[index].note_id.take() {
            self.bindings.remove(&id);
        }
        self.voices[index].reset();
        index
    }

    pub fn release(&mut self, note_id: &str, release_time: f32) {
        if let Some(&index) = self.bindings.get(note_id) {
            self.voices[index].release(release_time, self.engine_rate);
        }
    }

    pub fn release_all(&mut self, release_time: f32) {
        for voice in &mut self.voices {
            if voice.stage != Stage::Idle {
                voice.release(release_time, self.engine_rate);
            }
        }
    }

    /// Hard cutoff for every active voice (global stop).
    pub fn stop_all(&mut self) {
        for voice in &mut self.voices {
            if voice.stage != Stage::Idle {
                voice.stop(self.engine_rate);
            }
        }
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.frame += 1;
        let mut mix = 0.0;
        let mut finished: Option<Vec<usize>> = None;
        for (i, voice) in self.voices.iter_mut().enumerate() {
            if voice.stage == Stage::Idle {
                continue;
            }
            let (sample, done) = voice.next_sample();
            mix += sample;
            if done {
                finished.get_or_insert_with(Vec::new).push(i);
            }
        }
        if let Some(done) = finished {
            for i in done {
                self.recycle(i);
            }
        }
        mix
    }

    fn recycle(&mut self, index: usize) {
        if let Some(id) = self.voices[index].note_id.take() {
            if self.bindings.get(&id) == Some(&index) {
                self.bindings.remove(&id);
            }
        }
        self.voices[index].reset();
        if !self.free.contains(&index) {
            self.free.push(index);
        }
    }

    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| v.stage != Stage::Idle).count()
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    pub fn is_bound(&self, note_id: &str) -> bool {
        self.bindings.contains_key(note_id)
    }
}
