//! Note names, octaves and equal-temperament frequency lookup
//!
//! All conversions use A4 = 440 Hz tuning. The name/octave table covers the
//! playable keyboard range (octaves -1 through 7) and is built once.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Chromatic note names in order (C = 0 .. B = 11)
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Lowest octave present in the frequency table
pub const MIN_OCTAVE: i32 = -1;
/// Highest octave present in the frequency table
pub const MAX_OCTAVE: i32 = 7;

/// Semitone offset of each note name relative to A within the same octave
fn offset_from_a(name: &str) -> Option<i32> {
    let offset = match name {
        "C" => -9,
        "C#" => -8,
        "D" => -7,
        "D#" => -6,
        "E" => -5,
        "F" => -4,
        "F#" => -3,
        "G" => -2,
        "G#" => -1,
        "A" => 0,
        "A#" => 1,
        "B" => 2,
        _ => return None,
    };
    Some(offset)
}

static FREQUENCY_TABLE: Lazy<HashMap<String, f64>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for octave in MIN_OCTAVE..=MAX_OCTAVE {
        for name in NOTE_NAMES {
            let Some(offset) = offset_from_a(name) else {
                continue;
            };
            let semitones = (octave - 4) * 12 + offset;
            let frequency = 440.0 * 2f64.powf(semitones as f64 / 12.0);
            table.insert(format!("{}{}", name, octave), frequency);
        }
    }
    table
});

/// Look up the frequency of a note id such as `"C4"` or `"F#-1"`.
///
/// Returns `None` outside the table's octave range or for unknown names.
pub fn note_frequency(note_id: &str) -> Option<f64> {
    FREQUENCY_TABLE.get(note_id).copied()
}

/// MIDI note number to frequency in Hz (A4 = 69 = 440 Hz).
#[inline]
pub fn midi_to_frequency(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

/// MIDI note number to its note id, e.g. `60 -> "C4"`.
pub fn midi_to_note_id(midi: u8) -> String {
    let octave = (midi as i32) / 12 - 1;
    let name = NOTE_NAMES[(midi as usize) % 12];
    format!("{}{}", name, octave)
}

/// Note name + octave to MIDI note number. `("C", 4) -> Some(60)`.
pub fn name_to_midi(name: &str, octave: i32) -> Option<i32> {
    let index = NOTE_NAMES.iter().position(|&n| n == name)? as i32;
    Some((octave + 1) * 12 + index)
}

/// Parse a note id (`"G#3"`, `"A-1"`) into a MIDI note number.
pub fn note_id_to_midi(note_id: &str) -> Option<i32> {
    let (name, octave_str) = if note_id.len() >= 2 && note_id.as_bytes()[1] == b'#' {
        note_id.split_at(2)
    } else if !note_id.is_empty() {
        note_id.split_at(1)
    } else {
        return None;
    };
    if !NOTE_NAMES.contains(&name) {
        return None;
    }
    let octave: i32 = octave_str.parse().ok()?;
    name_to_midi(name, octave)
}
