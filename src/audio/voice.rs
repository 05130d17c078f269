//! Oscillator voice pool
//!
//! Fixed-capacity pool of buffer-playback voices for synthesized waveforms.
//! The envelope shape is baked into the buffer by the synthesis boundary;
//! voices only ramp gain in (attack) and out (note-off fade) to stay
//! click-free. On exhaustion the voice with the earliest start frame is
//! stolen and silenced immediately before rebinding.

use std::collections::HashMap;
use std::sync::Arc;

/// Pool capacity
pub const OSC_POOL_SIZE: usize = 32;

/// Gain below which a releasing voice is considered silent
const MIN_GAIN: f32 = 1e-4;

/// Note-off fade time in seconds (fixed, independent of ADSR release;
/// the buffer already carries the release tail)
const STOP_FADE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Attack,
    Sustain,
    Release,
}

struct OscillatorVoice {
    note_id: Option<String>,
    buffer: Option<Arc<Vec<f32>>>,
    position: usize,
    state: VoiceState,
    start_frame: u64,
    gain: f32,
    target_gain: f32,
    attack_step: f32,
    release_step: f32,
}

impl OscillatorVoice {
    fn new() -> Self {
        Self {
            note_id: None,
            buffer: None,
            position: 0,
            state: VoiceState::Idle,
            start_frame: 0,
            gain: 0.0,
            target_gain: 0.0,
            attack_step: 0.0,
            release_step: 0.0,
        }
    }

    fn start(
        &mut self,
        note_id: &str,
        buffer: Arc<Vec<f32>>,
        gain: f32,
        attack: f32,
        sample_rate: f32,
        frame: u64,
    ) {
        self.note_id = Some(note_id.to_string());
        self.buffer = Some(buffer);
        self.position = 0;
        self.state = VoiceState::Attack;
        self.start_frame = frame;
        self.gain = 0.0;
        self.target_gain = gain.max(0.0);
        let attack_samples = (attack.max(crate::audio::params::MICRO_FADE as f32) * sample_rate)
            .max(1.0);
        self.attack_step = self.target_gain / attack_samples;
        self.release_step = 0.0;
    }

    /// Begin the fixed note-off fade. No-op if already releasing or idle.
    fn release(&mut self, sample_rate: f32) {
        if matches!(self.state, VoiceState::Idle | VoiceState::Release) {
            return;
        }
        self.state = VoiceState::Release;
        let fade_samples = (STOP_FADE * sample_rate).max(1.0);
        self.release_step = self.gain.max(MIN_GAIN) / fade_samples;
    }

    /// Immediate silence, used when the voice is stolen.
    fn reset(&mut self) {
        self.note_id = None;
        self.buffer = None;
        self.position = 0;
        self.state = VoiceState::Idle;
        self.gain = 0.0;
    }

    /// Advance one sample. Returns the sample and whether the voice finished.
    #[inline]
    fn next_sample(&mut self) -> (f32, bool) {
        let buffer = match &self.buffer {
            Some(b) => b,
            None => return (0.0, true),
        };
        if self.position >= buffer.len() {
            return (0.0, true);
        }

        match self.state {
            VoiceState::Attack => {
                self.gain += self.attack_step;
                if self.gain >= self.target_gain {
                    self.gain = self.target_gain;
                    self.state = VoiceState::Sustain;
                }
            }
            VoiceState::Release => {
                self.gain -= self.release_step;
                if self.gain <= MIN_GAIN {
                    return (0.0, true);
                }
            }
            _ => {}
        }

        let sample = buffer[self.position] * self.gain;
        self.position += 1;
        let done = self.position >= buffer.len();
        (sample, done)
    }
}

/// Fixed-capacity oscillator voice pool with steal-oldest allocation.
pub struct OscillatorPool {
    voices: Vec<OscillatorVoice>,
    bindings: HashMap<String, usize>,
    free: Vec<usize>,
    sample_rate: f32,
    frame: u64,
}

impl OscillatorPool {
    pub fn new(sample_rate: f32, capacity: usize) -> Self {
        let voices = (0..capacity).map(|_| OscillatorVoice::new()).collect();
        Self {
            voices,
            bindings: HashMap::new(),
            free: (0..capacity).rev().collect(),
            sample_rate,
            frame: 0,
        }
    }

    /// Bind a voice to `note_id` and start the buffer. Reuses the voice
    /// already bound to the id, else a free voice, else steals the oldest.
    pub fn trigger(&mut self, note_id: &str, buffer: Arc<Vec<f32>>, gain: f32, attack: f32) {
        let index = self.acquire(note_id);
        self.voices[index].start(note_id, buffer, gain, attack, self.sample_rate, self.frame);
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

    /// Earliest-started active voice: silence it immediately, drop its
    /// binding and hand the slot over.
    fn steal(&mut self) -> usize {
        let index = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state != VoiceState::Idle)
            .min_by_key(|(_, v)| v.start_frame)
            .map(|(i, _)| i)
            .unwrap_or(0);
        if let Some(id) = self.voices[index].note_id.take() {
            self.bindings.remove(&id);
        }
        self.voices[index].reset();
        index
    }

    /// Begin the note-off fade for the voice bound to `note_id`.
    /// Recycling is deferred until the fade finishes. Double-stop safe.
    pub fn release(&mut self, note_id: &str) {
        if let Some(&index) = self.bindings.get(note_id) {
            self.voices[index].release(self.sample_rate);
        }
    }

    /// Release every active voice.
    pub fn release_all(&mut self) {
        for voice in &mut self.voices {
            if voice.state != VoiceState::Idle {
                voice.release(self.sample_rate);
            }
        }
    }

    /// Hard-silence everything (global stop).
    pub fn silence_all(&mut self) {
        for (i, voice) in self.voices.iter_mut().enumerate() {
            if voice.state != VoiceState::Idle {
                voice.reset();
                if !self.free.contains(&i) {
                    self.free.push(i);
                }
            }
        }
        self.bindings.clear();
    }

    /// Mix one sample from every active voice.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.frame += 1;
        let mut mix = 0.0;
        let mut finished: Option<Vec<usize>> = None;
        for (i, voice) in self.voices.iter_mut().enumerate() {
            if voice.state == VoiceState::Idle {
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
        self.voices
            .iter()
            .filter(|v| v.state != VoiceState::Idle)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    pub fn is_bound(&self, note_id: &str) -> bool {
        self.bindings.contains_key(note_id)
    }
}
