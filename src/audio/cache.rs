//! Waveform cache
//!
//! Memoizes synthesized sample buffers so repeated notes at the same
//! frequency/duration reuse one buffer instead of re-invoking the synthesis
//! boundary. Keys are rounded to fixed decimal precision to keep float
//! inputs from exploding the key space. The cache is bounded; once full,
//! the oldest entry is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::synth::{WaveformKind, WaveformSynth};

/// Entries kept before the oldest is evicted
const MAX_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: WaveformKind,
    /// frequency in mHz
    frequency: u64,
    /// duration in ms
    duration: u64,
    sample_rate: u32,
    /// phase offset in milliradians
    phase: u64,
    /// (ratio in hundredths, index in hundredths) when FM is active
    fm: Option<(u32, u32)>,
}

#[inline]
fn thousandths(value: f32) -> u64 {
    (value.max(0.0) as f64 * 1000.0).round() as u64
}

#[inline]
fn hundredths(value: f32) -> u32 {
    (value.max(0.0) as f64 * 100.0).round() as u32
}

/// Memoizing front of the synthesis boundary.
pub struct WaveformCache {
    synth: Arc<dyn WaveformSynth>,
    entries: HashMap<CacheKey, Arc<Vec<f32>>>,
    order: VecDeque<CacheKey>,
}

impl WaveformCache {
    pub fn new(synth: Arc<dyn WaveformSynth>) -> Self {
        Self {
            synth,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Fetch a synthesized buffer, generating it on first use.
    ///
    /// A hit returns the same `Arc` (pointer-equal with earlier fetches).
    /// `fm` carries `(ratio, index)`; when present the buffer is a two-
    /// operator FM tone with a modulator at `frequency * ratio`.
    pub fn fetch(
        &mut self,
        kind: WaveformKind,
        frequency: f32,
        duration: f32,
        sample_rate: f32,
        phase_offset: f32,
        fm: Option<(f32, f32)>,
    ) -> Arc<Vec<f32>> {
        let key = CacheKey {
            kind,
            frequency: thousandths(frequency),
            duration: thousandths(duration),
            sample_rate: sample_rate as u32,
            phase: thousandths(phase_offset),
            fm: fm.map(|(ratio, index)| (hundredths(ratio), hundredths(index))),
        };

        if let Some(buffer) = self.entries.get(&key) {
            return Arc::clone(buffer);
        }

        let samples = match fm {
            Some((ratio, index)) => {
                self.synth
                    .generate_fm(frequency, frequency * ratio, index, duration, sample_rate)
            }
            None => self
                .synth
                .generate(kind, frequency, phase_offset, duration, sample_rate),
        };
        let buffer = Arc::new(samples);

        if self.entries.len() >= MAX_ENTRIES {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, Arc::clone(&buffer));
        self.order.push_back(key);

        buffer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synth::Adsr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts boundary invocations so tests can assert single generation.
    struct CountingSynth {
        calls: AtomicUsize,
    }

    impl WaveformSynth for CountingSynth {
        fn generate(&self, _: WaveformKind, _: f32, _: f32, duration: f32, rate: f32) -> Vec<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![0.5; (duration * rate) as usize]
        }

        fn generate_fm(&self, _: f32, _: f32, _: f32, duration: f32, rate: f32) -> Vec<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![0.25; (duration * rate) as usize]
        }

        fn apply_adsr(&self, _: &mut [f32], _: Adsr, _: f32) {}
    }

    fn counting_cache() -> (Arc<CountingSynth>, WaveformCache) {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
        });
        let cache = WaveformCache::new(synth.clone() as Arc<dyn WaveformSynth>);
        (synth, cache)
    }

    #[test]
    fn identical_keys_invoke_synthesis_once() {
        let (synth, mut cache) = counting_cache();
        let a = cache.fetch(WaveformKind::Sine, 440.0, 1.0, 44_100.0, 0.0, None);
        let b = cache.fetch(WaveformKind::Sine, 440.0, 1.0, 44_100.0, 0.0, None);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b), "hit must return the same buffer");
    }

    #[test]
    fn near_identical_floats_share_a_key() {
        let (synth, mut cache) = counting_cache();
        cache.fetch(WaveformKind::Sine, 440.0, 1.0, 44_100.0, 0.0, None);
        cache.fetch(WaveformKind::Sine, 440.0000001, 1.0, 44_100.0, 0.0, None);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_parameters_miss() {
        let (synth, mut cache) = counting_cache();
        cache.fetch(WaveformKind::Sine, 440.0, 1.0, 44_100.0, 0.0, None);
        cache.fetch(WaveformKind::Square, 440.0, 1.0, 44_100.0, 0.0, None);
        cache.fetch(WaveformKind::Sine, 441.0, 1.0, 44_100.0, 0.0, None);
        cache.fetch(WaveformKind::Sine, 440.0, 1.0, 44_100.0, 0.0, Some((2.0, 5.0)));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cache_stays_bounded() {
        let (_, mut cache) = counting_cache();
        for i in 0..(MAX_ENTRIES + 50) {
            cache.fetch(WaveformKind::Sine, 100.0 + i as f32, 0.01, 44_100.0, 0.0, None);
        }
        assert!(cache.len() <= MAX_ENTRIES);
    }
}
