//! Score data model
//!
//! Scores arrive already parsed (MIDI-container parsing happens outside
//! this crate): a note list plus optional duration/tempo/sound-set
//! metadata. Validation runs per field before anything is scheduled;
//! structurally broken notes are dropped individually.

pub mod instruments;
pub mod player;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::audio::synth::WaveformKind;

/// One timed note event in score-relative seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    /// MIDI pitch 0..=127
    pub pitch: f64,
    /// Start time in seconds, score-relative
    #[serde(alias = "time", alias = "startTime")]
    pub start: f64,
    /// Duration in seconds, > 0
    pub duration: f64,
    /// 0..=1
    pub velocity: f64,
    #[serde(default)]
    pub instrument_family: Option<String>,
    #[serde(default)]
    pub instrument_name: Option<String>,
    #[serde(default)]
    pub channel: Option<u8>,
}

impl NoteEvent {
    /// End time in score-relative seconds.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Pitch as a MIDI note number (valid notes only).
    pub fn midi(&self) -> u8 {
        self.pitch.round().clamp(0.0, 127.0) as u8
    }
}

/// A parsed score handed to `ScorePlayer::play`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    #[serde(default)]
    pub name: Option<String>,
    /// Declared total duration in seconds; derived from the notes if absent.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    pub notes: Vec<NoteEvent>,
    /// Sampled-instrument set to resolve for layered playback.
    #[serde(default)]
    pub sound_set_id: Option<String>,
    /// Instrument families stacked per note, in declared order.
    #[serde(default)]
    pub layer_families: Option<Vec<String>>,
}

fn default_bpm() -> f64 {
    120.0
}

impl Default for Score {
    fn default() -> Self {
        Self {
            name: None,
            duration: None,
            bpm: default_bpm(),
            notes: Vec::new(),
            sound_set_id: None,
            layer_families: None,
        }
    }
}

impl Score {
    /// Total duration: declared when sane, otherwise the latest note end,
    /// never less than one second.
    pub fn resolved_duration(&self, valid_notes: &[NoteEvent]) -> f64 {
        let declared = self
            .duration
            .filter(|d| d.is_finite() && *d > 0.0);
        let derived = valid_notes
            .iter()
            .map(|n| n.end())
            .fold(0.0f64, f64::max);
        declared.unwrap_or(derived).max(1.0)
    }
}

/// Drop invalid notes, clamp what is clampable. Field rules:
/// pitch finite and within 0..=127 after rounding; start finite and
/// non-negative; duration finite and positive; velocity clamped to 0..=1.
pub fn sanitize_notes(notes: &[NoteEvent]) -> Vec<NoteEvent> {
    let mut valid = Vec::with_capacity(notes.len());
    for note in notes {
        if !note.pitch.is_finite() {
            continue;
        }
        let pitch = note.pitch.round();
        if !(0.0..=127.0).contains(&pitch) {
            continue;
        }
        if !note.start.is_finite() || note.start < 0.0 {
            continue;
        }
        if !note.duration.is_finite() || note.duration <= 0.0 {
            continue;
        }
        let velocity = if note.velocity.is_finite() {
            note.velocity.clamp(0.0, 1.0)
        } else {
            1.0
        };
        valid.push(NoteEvent {
            pitch,
            velocity,
            ..note.clone()
        });
    }
    valid
}

/// How notes are being voiced for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayeringMode {
    /// Single synthesized waveform per note
    Waveform,
    /// One synthesized waveform per layer family
    WaveLayered,
    /// Sampled instruments resolved per note
    SampleLayered,
}

/// Point-in-time view of the player, for UIs and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub is_paused: bool,
    /// 0..=1 over the untempo-scaled score timeline
    pub progress: f64,
    pub active_note_ids: HashSet<String>,
    pub tempo_factor: f64,
    pub layering_mode: LayeringMode,
    pub sound_set_name: Option<String>,
}

/// What a GM instrument family sounds like without samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilySound {
    /// Family maps to a waveform
    Waveform(WaveformKind),
    /// Family is deliberately silent (percussion, sound effects)
    Silent,
    /// Unknown family: callers fall back to their default waveform
    Unmapped,
}

/// Static GM family → waveform mapping for waveform-mode playback.
pub fn family_sound(family: &str) -> FamilySound {
    use WaveformKind::*;
    match family.trim().to_ascii_lowercase().as_str() {
        "piano" => FamilySound::Waveform(Triangle),
        "chromatic percussion" => FamilySound::Waveform(Triangle),
        "organ" => FamilySound::Waveform(Sine),
        "guitar" => FamilySound::Waveform(Triangle),
        "bass" => FamilySound::Waveform(Sawtooth),
        "strings" => FamilySound::Waveform(Sawtooth),
        "ensemble" => FamilySound::Waveform(Sawtooth),
        "brass" => FamilySound::Waveform(Square),
        "reed" => FamilySound::Waveform(Sawtooth),
        "pipe" => FamilySound::Waveform(Sine),
        "synth lead" => FamilySound::Waveform(Sawtooth),
        "synth pad" => FamilySound::Waveform(Triangle),
        "synth effects" => FamilySound::Waveform(Sawtooth),
        "ethnic" => FamilySound::Waveform(Triangle),
        "percussive" | "sound effects" => FamilySound::Silent,
        _ => FamilySound::Unmapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: f64, start: f64, duration: f64, velocity: f64) -> NoteEvent {
        NoteEvent {
            pitch,
            start,
            duration,
            velocity,
            instrument_family: None,
            instrument_name: None,
            channel: None,
        }
    }

    #[test]
    fn per_field_validation_rules() {
        let notes = vec![
            note(59.6, 0.0, 0.5, 1.0),       // fractional pitch: normalized
            note(f64::NAN, 0.0, 0.5, 1.0),   // non-finite pitch: dropped
            note(130.0, 0.0, 0.5, 1.0),      // out-of-range pitch: dropped
            note(62.0, -0.2, 0.0, 1.0),      // negative start + zero duration: dropped
            note(64.0, 0.1, 0.2, 3.0),       // hot velocity: clamped
        ];
        let valid = sanitize_notes(&notes);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].midi(), 60);
        assert_eq!(valid[1].velocity, 1.0);
    }

    #[test]
    fn duration_falls_back_to_latest_note_end() {
        let notes = vec![note(60.0, 0.0, 1.0, 1.0), note(64.0, 2.0, 1.5, 1.0)];
        let score = Score {
            notes: notes.clone(),
            ..Default::default()
        };
        assert_eq!(score.resolved_duration(&notes), 3.5);
    }

    #[test]
    fn duration_has_a_one_second_floor() {
        let notes = vec![note(60.0, 0.0, 0.1, 1.0)];
        let score = Score {
            notes: notes.clone(),
            ..Default::default()
        };
        assert_eq!(score.resolved_duration(&notes), 1.0);
    }

    #[test]
    fn declared_duration_wins_when_sane() {
        let notes = vec![note(60.0, 0.0, 0.1, 1.0)];
        let score = Score {
            duration: Some(12.0),
            notes: notes.clone(),
            ..Default::default()
        };
        assert_eq!(score.resolved_duration(&notes), 12.0);
        let broken = Score {
            duration: Some(f64::NAN),
            notes: notes.clone(),
            ..Default::default()
        };
        assert_eq!(broken.resolved_duration(&notes), 1.0);
    }

    #[test]
    fn family_mapping_covers_the_gm_set() {
        assert_eq!(family_sound("piano"), FamilySound::Waveform(WaveformKind::Triangle));
        assert_eq!(family_sound("brass"), FamilySound::Waveform(WaveformKind::Square));
        assert_eq!(family_sound("percussive"), FamilySound::Silent);
        assert_eq!(family_sound("theremin section"), FamilySound::Unmapped);
    }

    #[test]
    fn scores_deserialize_from_parser_output() {
        let json = r#"{
            "name": "Prelude",
            "duration": 10.5,
            "bpm": 96,
            "notes": [
                {"pitch": 60, "time": 0.0, "duration": 0.5, "velocity": 0.8,
                 "instrumentFamily": "piano"}
            ],
            "soundSetId": "chamber-set",
            "layerFamilies": ["piano", "strings"]
        }"#;
        let score: Score = serde_json::from_str(json).unwrap();
        assert_eq!(score.bpm, 96.0);
        assert_eq!(score.notes.len(), 1);
        assert_eq!(score.notes[0].start, 0.0);
        assert_eq!(score.notes[0].instrument_family.as_deref(), Some("piano"));
        assert_eq!(score.sound_set_id.as_deref(), Some("chamber-set"));
        assert_eq!(score.layer_families.as_deref().unwrap().len(), 2);
    }
}
