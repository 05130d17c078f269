//! Sampled-instrument manifests, selection and loading
//!
//! A sound set manifest declares instruments (sample file, base pitch,
//! families, optional MIDI range). `InstrumentLibrary` decodes samples via
//! symphonia into mono PCM and caches loaded sets. Selection resolves a
//! note's layer families to concrete instruments: range match first,
//! nearest base pitch second, first-seen on ties, deduplicated by id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer as SymphoniaBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::note::{midi_to_frequency, note_id_to_midi};
use crate::audio::sampler::SampleBuffer;
use super::NoteEvent;

/// One instrument entry in a sound set manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentDefinition {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// GM families this instrument answers for
    #[serde(default)]
    pub families: Vec<String>,
    /// Explicit instrument names this instrument answers for
    #[serde(default)]
    pub names: Vec<String>,
    /// Sample file path, relative to the library's base directory
    pub sample_path: String,
    /// Pitch the sample was recorded at, as a note id ("C4")
    #[serde(default)]
    pub base_note: Option<String>,
    /// Pitch the sample was recorded at, as a MIDI number (wins over base_note)
    #[serde(default)]
    pub base_midi: Option<i32>,
    #[serde(default)]
    pub min_midi: Option<i32>,
    #[serde(default)]
    pub max_midi: Option<i32>,
}

impl InstrumentDefinition {
    fn resolved_base_midi(&self) -> Option<i32> {
        self.base_midi
            .or_else(|| self.base_note.as_deref().and_then(note_id_to_midi))
    }
}

/// A sound set manifest: named collection of instruments, with optional
/// default layer families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundSetDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub layer_families: Option<Vec<String>>,
    pub instruments: Vec<InstrumentDefinition>,
}

/// An instrument with its sample decoded and base frequency resolved.
#[derive(Debug, Clone)]
pub struct LoadedInstrument {
    pub id: String,
    pub families: Vec<String>,
    pub names: Vec<String>,
    pub base_midi: Option<i32>,
    pub base_frequency: f64,
    pub min_midi: Option<i32>,
    pub max_midi: Option<i32>,
    pub buffer: Arc<SampleBuffer>,
}

impl LoadedInstrument {
    /// Does the instrument's declared range contain this pitch?
    /// Open bounds always match.
    pub fn matches_range(&self, midi: i32) -> bool {
        self.min_midi.map_or(true, |min| midi >= min)
            && self.max_midi.map_or(true, |max| midi <= max)
    }
}

/// A fully loaded sound set with family/name lookups built.
pub struct LoadedSoundSet {
    pub id: String,
    pub name: String,
    pub layer_families: Option<Vec<String>>,
    pub instruments: Vec<Arc<LoadedInstrument>>,
    by_family: HashMap<String, Vec<usize>>,
    by_name: HashMap<String, usize>,
}

impl LoadedSoundSet {
    pub(crate) fn build(
        id: String,
        name: String,
        layer_families: Option<Vec<String>>,
        instruments: Vec<Arc<LoadedInstrument>>,
    ) -> Self {
        let mut by_family: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_name = HashMap::new();
        for (index, instrument) in instruments.iter().enumerate() {
            for family in &instrument.families {
                by_family.entry(family.clone()).or_default().push(index);
            }
            for name in &instrument.names {
                by_name.entry(name.clone()).or_insert(index);
            }
        }
        Self {
            id,
            name,
            layer_families,
            instruments,
            by_family,
            by_name,
        }
    }

    /// Resolve the instruments stacked for one note, in family order.
    ///
    /// Per family: candidates tagged with the family, preferring those whose
    /// range contains the pitch; among those, nearest base pitch wins with
    /// first-seen on ties. Duplicate ids are dropped while preserving order.
    pub fn pick_instruments(
        &self,
        note: &NoteEvent,
        layer_families: &[String],
    ) -> Vec<Arc<LoadedInstrument>> {
        let midi = note.midi() as i32;
        let mut picked: Vec<Arc<LoadedInstrument>> = Vec::new();

        for family in layer_families {
            let Some(indices) = self.by_family.get(family) else {
                continue;
            };
            let candidates: Vec<&Arc<LoadedInstrument>> =
                indices.iter().map(|&i| &self.instruments[i]).collect();
            if let Some(best) = pick_best_candidate(&candidates, midi) {
                if !picked.iter().any(|p| p.id == best.id) {
                    picked.push(Arc::clone(best));
                }
            }
        }
        picked
    }

    /// Single-instrument fallback: explicit name first, then family with
    /// range preference.
    pub fn pick_instrument(&self, note: &NoteEvent) -> Option<Arc<LoadedInstrument>> {
        if let Some(name) = note.instrument_name.as_deref() {
            if let Some(&index) = self.by_name.get(name) {
                return Some(Arc::clone(&self.instruments[index]));
            }
        }
        let family = note.instrument_family.as_deref()?;
        let indices = self.by_family.get(family)?;
        let midi = note.midi() as i32;
        let candidates: Vec<&Arc<LoadedInstrument>> =
            indices.iter().map(|&i| &self.instruments[i]).collect();
        pick_best_candidate(&candidates, midi).map(Arc::clone)
    }
}

/// Range-preferred, nearest-base-pitch selection with first-seen ties.
fn pick_best_candidate<'a>(
    candidates: &[&'a Arc<LoadedInstrument>],
    midi: i32,
) -> Option<&'a Arc<LoadedInstrument>> {
    if candidates.is_empty() {
        return None;
    }
    let ranged: Vec<&Arc<LoadedInstrument>> = candidates
        .iter()
        .copied()
        .filter(|c| c.matches_range(midi))
        .collect();
    let pool: &[&Arc<LoadedInstrument>] = if ranged.is_empty() {
        candidates
    } else {
        &ranged
    };

    let mut best = pool[0];
    let mut best_distance = i32::MAX;
    for candidate in pool {
        let Some(base) = candidate.base_midi else {
            continue;
        };
        let distance = (base - midi).abs();
        if distance < best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    Some(best)
}

/// Source of loadable sound sets. The player talks to this seam so tests
/// (and alternative storage backends) can stand in for the file-backed
/// library; loads may block, the player always calls from a worker thread.
pub trait SoundSetProvider: Send + Sync {
    fn ensure_loaded(&self, id: &str) -> Result<Arc<LoadedSoundSet>, String>;
}

impl SoundSetProvider for InstrumentLibrary {
    fn ensure_loaded(&self, id: &str) -> Result<Arc<LoadedSoundSet>, String> {
        InstrumentLibrary::ensure_loaded(self, id)
    }
}

/// Registry of manifests plus a cache of loaded sound sets.
pub struct InstrumentLibrary {
    base_dir: PathBuf,
    manifests: Mutex<HashMap<String, SoundSetDefinition>>,
    loaded: Mutex<HashMap<String, Arc<LoadedSoundSet>>>,
}

impl InstrumentLibrary {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            manifests: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_manifest(&self, definition: SoundSetDefinition) {
        self.manifests
            .lock()
            .insert(definition.id.clone(), definition);
    }

    pub fn register_manifest_json(&self, json: &str) -> Result<(), String> {
        let definition: SoundSetDefinition =
            serde_json::from_str(json).map_err(|e| format!("invalid sound set manifest: {e}"))?;
        self.register_manifest(definition);
        Ok(())
    }

    pub fn manifest(&self, id: &str) -> Option<SoundSetDefinition> {
        self.manifests.lock().get(id).cloned()
    }

    /// Load (or fetch the cached) sound set, decoding every sample.
    pub fn ensure_loaded(&self, id: &str) -> Result<Arc<LoadedSoundSet>, String> {
        if let Some(loaded) = self.loaded.lock().get(id) {
            return Ok(Arc::clone(loaded));
        }

        let definition = self
            .manifest(id)
            .ok_or_else(|| format!("unknown sound set '{id}'"))?;

        let mut instruments = Vec::with_capacity(definition.instruments.len());
        for entry in &definition.instruments {
            let path = self.base_dir.join(&entry.sample_path);
            let buffer = decode_sample_file(&path)
                .map_err(|e| format!("failed to load sample '{}': {e}", entry.sample_path))?;
            let base_midi = entry.resolved_base_midi();
            let base_frequency = base_midi
                .map(|m| midi_to_frequency(m as f64))
                .unwrap_or(261.63);
            instruments.push(Arc::new(LoadedInstrument {
                id: entry.id.clone(),
                families: entry.families.clone(),
                names: entry.names.clone(),
                base_midi,
                base_frequency,
                min_midi: entry.min_midi,
                max_midi: entry.max_midi,
                buffer: Arc::new(buffer),
            }));
        }

        let loaded = Arc::new(LoadedSoundSet::build(
            definition.id.clone(),
            definition.name.clone(),
            definition.layer_families.clone(),
            instruments,
        ));
        self.loaded
            .lock()
            .insert(id.to_string(), Arc::clone(&loaded));
        log::info!(
            "sound set '{}' loaded: {} instruments",
            loaded.name,
            loaded.instruments.len()
        );
        Ok(loaded)
    }
}

/// Decode an audio file into mono f32 PCM at its native rate.
pub fn decode_sample_file(path: &Path) -> Result<SampleBuffer, String> {
    let file = File::open(path).map_err(|e| format!("open {}: {e}", path.display()))?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("unrecognized audio format: {e}"))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| "no audio track".to_string())?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("unsupported codec: {e}"))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(format!("read error: {e}")),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut interleaved =
                    SymphoniaBuffer::<f32>::new(decoded.capacity() as u64, spec);
                interleaved.copy_interleaved_ref(decoded);
                let channels = spec.channels.count().max(1);
                for frame in interleaved.samples().chunks(channels) {
                    mono.push(frame.iter().sum::<f32>() / channels as f32);
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("skipping undecodable packet in {}: {e}", path.display());
            }
            Err(e) => return Err(format!("decode error: {e}")),
        }
    }

    if mono.is_empty() {
        return Err("decoded zero samples".to_string());
    }
    Ok(SampleBuffer {
        data: mono,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(
        id: &str,
        families: &[&str],
        base_midi: i32,
        min_midi: Option<i32>,
        max_midi: Option<i32>,
    ) -> Arc<LoadedInstrument> {
        Arc::new(LoadedInstrument {
            id: id.to_string(),
            families: families.iter().map(|s| s.to_string()).collect(),
            names: Vec::new(),
            base_midi: Some(base_midi),
            base_frequency: midi_to_frequency(base_midi as f64),
            min_midi,
            max_midi,
            buffer: Arc::new(SampleBuffer {
                data: vec![0.0; 8],
                sample_rate: 44_100,
            }),
        })
    }

    fn note(midi: f64, family: Option<&str>, name: Option<&str>) -> NoteEvent {
        NoteEvent {
            pitch: midi,
            start: 0.0,
            duration: 1.0,
            velocity: 1.0,
            instrument_family: family.map(|s| s.to_string()),
            instrument_name: name.map(|s| s.to_string()),
            channel: None,
        }
    }

    fn chamber_set() -> LoadedSoundSet {
        LoadedSoundSet::build(
            "chamber".into(),
            "Chamber".into(),
            Some(vec!["piano".into(), "strings".into()]),
            vec![
                instrument("piano", &["piano"], 60, None, None),
                instrument("violin", &["strings", "ensemble"], 55, Some(60), None),
                instrument("cello", &["strings", "ensemble"], 36, None, Some(59)),
            ],
        )
    }

    #[test]
    fn range_match_beats_nearest_base() {
        let set = chamber_set();
        // MIDI 50 is out of the violin's range, so the cello must win even
        // though pitch-distance alone favors the violin.
        let picks = set.pick_instruments(&note(50.0, None, None), &["strings".into()]);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].id, "cello");
        // High notes land on the violin.
        let picks = set.pick_instruments(&note(72.0, None, None), &["strings".into()]);
        assert_eq!(picks[0].id, "violin");
    }

    #[test]
    fn layering_preserves_family_order_and_dedups() {
        let set = chamber_set();
        let picks = set.pick_instruments(
            &note(64.0, None, None),
            &["piano".into(), "strings".into(), "ensemble".into()],
        );
        // "strings" and "ensemble" both resolve to the violin; dedup keeps one.
        assert_eq!(
            picks.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["piano", "violin"]
        );
    }

    #[test]
    fn unknown_families_resolve_to_nothing() {
        let set = chamber_set();
        let picks = set.pick_instruments(&note(64.0, None, None), &["theremin".into()]);
        assert!(picks.is_empty());
    }

    #[test]
    fn out_of_range_pool_falls_back_to_all_candidates() {
        let set = LoadedSoundSet::build(
            "s".into(),
            "S".into(),
            None,
            vec![instrument("high", &["strings"], 80, Some(70), None)],
        );
        // Nothing matches the range, so the full candidate set is used.
        let picks = set.pick_instruments(&note(40.0, None, None), &["strings".into()]);
        assert_eq!(picks[0].id, "high");
    }

    #[test]
    fn single_resolution_prefers_explicit_name() {
        let mut piano = instrument("piano", &["piano"], 60, None, None);
        Arc::get_mut(&mut piano).unwrap().names = vec!["acoustic grand piano".into()];
        let set = LoadedSoundSet::build(
            "s".into(),
            "S".into(),
            None,
            vec![piano, instrument("violin", &["strings"], 55, None, None)],
        );
        let picked = set
            .pick_instrument(&note(70.0, Some("strings"), Some("acoustic grand piano")))
            .unwrap();
        assert_eq!(picked.id, "piano");
        let by_family = set.pick_instrument(&note(70.0, Some("strings"), None)).unwrap();
        assert_eq!(by_family.id, "violin");
        assert!(set.pick_instrument(&note(70.0, None, None)).is_none());
    }

    #[test]
    fn manifest_json_round_trips() {
        let library = InstrumentLibrary::new("/tmp");
        library
            .register_manifest_json(
                r#"{
                    "id": "chamber-lite",
                    "name": "Chamber Lite",
                    "layerFamilies": ["piano", "strings"],
                    "instruments": [
                        {"id": "piano", "families": ["piano"],
                         "samplePath": "piano-c4.wav", "baseNote": "C4"},
                        {"id": "violin", "families": ["strings"],
                         "samplePath": "violin-g3.wav", "baseNote": "G3", "minMidi": 60}
                    ]
                }"#,
            )
            .unwrap();
        let manifest = library.manifest("chamber-lite").unwrap();
        assert_eq!(manifest.instruments.len(), 2);
        assert_eq!(manifest.instruments[0].resolved_base_midi(), Some(60));
        assert_eq!(manifest.instruments[1].min_midi, Some(60));
    }

    #[test]
    fn loading_an_unknown_set_errors() {
        let library = InstrumentLibrary::new("/tmp");
        assert!(library.ensure_loaded("nope").is_err());
    }

    #[test]
    fn loads_and_caches_a_wav_backed_set() {
        use crate::audio::wav::encode_wav;

        let dir = std::env::temp_dir().join("arioso-instrument-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let sample_path = dir.join("tone-c4.wav");
        let tone: Vec<f32> = (0..4410)
            .map(|n| (2.0 * std::f32::consts::PI * 261.63 * n as f32 / 44_100.0).sin())
            .collect();
        std::fs::write(&sample_path, encode_wav(&tone, None, 44_100)).unwrap();

        let library = InstrumentLibrary::new(&dir);
        library.register_manifest(SoundSetDefinition {
            id: "test-set".into(),
            name: "Test Set".into(),
            layer_families: None,
            instruments: vec![InstrumentDefinition {
                id: "tone".into(),
                label: None,
                families: vec!["piano".into()],
                names: Vec::new(),
                sample_path: "tone-c4.wav".into(),
                base_note: Some("C4".into()),
                base_midi: None,
                min_midi: None,
                max_midi: None,
            }],
        });

        let loaded = library.ensure_loaded("test-set").unwrap();
        assert_eq!(loaded.instruments.len(), 1);
        let instrument = &loaded.instruments[0];
        assert_eq!(instrument.buffer.sample_rate, 44_100);
        assert!((instrument.buffer.data.len() as i64 - 4410).abs() < 16);
        assert!((instrument.base_frequency - 261.63).abs() < 0.01);

        // Second load must come from the cache (same Arc).
        let again = library.ensure_loaded("test-set").unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));

        std::fs::remove_file(&sample_path).ok();
    }
}
