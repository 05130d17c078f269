//! arioso: real-time synthesis and score playback engine
//!
//! The crate has two halves:
//!
//! - [`audio`]: the engine proper. Waveform synthesis and caching, the
//!   shared effects graph, oscillator/sample voice pools, cpal (or offline)
//!   rendering, recording and analysis taps.
//! - [`score`]: the score data model, sampled-instrument manifests and
//!   selection, and the playback scheduler with pause/resume/tempo control.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use arioso::{AudioConfig, AudioEngine, InstrumentLibrary, Score, ScorePlayer};
//!
//! let engine = AudioEngine::start(None, &AudioConfig::default()).expect("audio device");
//! let library = Arc::new(InstrumentLibrary::new("assets/samples"));
//! let player = ScorePlayer::new(engine.handle(), library);
//!
//! let score: Score = serde_json::from_str(r#"{"notes": [
//!     {"pitch": 60, "time": 0.0, "duration": 0.5, "velocity": 0.9}
//! ]}"#).unwrap();
//! player.play(score).unwrap();
//! ```

pub mod audio;
pub mod score;

pub use audio::engine::{
    get_engine_handle, init_engine, init_offline_engine, shutdown_engine, AudioConfig,
    AudioEngine, EngineHandle, EngineStatus,
};
pub use audio::params::{PartialParams, SynthParams};
pub use audio::synth::WaveformKind;
pub use score::instruments::{
    InstrumentDefinition, InstrumentLibrary, LoadedSoundSet, SoundSetDefinition, SoundSetProvider,
};
pub use score::player::ScorePlayer;
pub use score::{LayeringMode, NoteEvent, PlaybackSnapshot, Score};
