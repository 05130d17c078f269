//! Score playback scheduling
//!
//! `ScorePlayer` is the top-level state machine: Stopped → Playing ⇄ Paused
//! → Stopped. A dedicated player thread (1 ms tick while playing, 50 ms
//! while idle) fires note-on/note-off events against the engine.
//!
//! Position is tracked in *original* score time:
//! `elapsed = elapsed_at_anchor + wall_since_anchor * tempo`. Pause, resume
//! and tempo changes all fold the current elapsed-original value into a new
//! anchor and rebuild the remaining schedule from that offset, so elapsed
//! time stays continuous across the boundary and completed notes are never
//! rescheduled. Asynchronous sound-set loads are guarded by a generation
//! counter: anything resolving after a newer `play()` or a `stop()` is
//! silently discarded.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::engine::EngineHandle;
use crate::audio::note::midi_to_frequency;
use crate::audio::params::{PartialParams, SynthParams};
use crate::audio::synth::WaveformKind;

use super::instruments::{LoadedSoundSet, SoundSetProvider};
use super::{
    family_sound, sanitize_notes, FamilySound, LayeringMode, NoteEvent, PlaybackSnapshot, Score,
};

const MIN_TEMPO: f64 = 0.25;
const MAX_TEMPO: f64 = 2.0;
const TEMPO_EPSILON: f64 = 1e-6;

const ACTIVE_TICK: Duration = Duration::from_millis(1);
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Listener notifications while playing happen at least this often (ticks).
const NOTIFY_EVERY_TICKS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    On,
    Off,
}

/// One scheduled trigger, in original score time.
#[derive(Debug, Clone, Copy)]
struct ScheduledEvent {
    at: f64,
    kind: EventKind,
    note_index: usize,
}

/// Build the event list for playback starting at `offset` seconds of
/// original time. Notes whose remaining duration at the offset is zero are
/// skipped; notes already sounding at the offset get an immediate note-on
/// (resume re-includes them). Off-time ≥ on-time by construction.
fn build_schedule(notes: &[NoteEvent], offset: f64) -> Vec<ScheduledEvent> {
    let mut schedule = Vec::with_capacity(notes.len() * 2);
    for (note_index, note) in notes.iter().enumerate() {
        let end = note.end();
        let on_at = note.start.max(offset);
        if end - on_at <= 0.0 {
            continue;
        }
        schedule.push(ScheduledEvent {
            at: on_at,
            kind: EventKind::On,
            note_index,
        });
        schedule.push(ScheduledEvent {
            at: end,
            kind: EventKind::Off,
            note_index,
        });
    }
    schedule.sort_by(|a, b| {
        a.at.partial_cmp(&b.at)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| match (a.kind, b.kind) {
                (EventKind::On, EventKind::Off) => std::cmp::Ordering::Less,
                (EventKind::Off, EventKind::On) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            })
    });
    schedule
}

/// How the current session voices its notes.
enum Layering {
    Waveform,
    WaveLayered(Vec<String>),
    SampleLayered {
        set: Arc<LoadedSoundSet>,
        families: Vec<String>,
    },
}

impl Layering {
    fn mode(&self) -> LayeringMode {
        match self {
            Layering::Waveform => LayeringMode::Waveform,
            Layering::WaveLayered(_) => LayeringMode::WaveLayered,
            Layering::SampleLayered { .. } => LayeringMode::SampleLayered,
        }
    }
}

/// Decide the layering for a session from the score and the (possibly
/// failed) sound-set load. Never fails: a missing or empty set degrades to
/// waveform layering.
fn resolve_layering(
    score: &Score,
    loaded: Option<Arc<LoadedSoundSet>>,
) -> (Layering, Option<String>) {
    let families = score
        .layer_families
        .clone()
        .or_else(|| loaded.as_ref().and_then(|s| s.layer_families.clone()))
        .unwrap_or_default();

    if let Some(set) = loaded {
        if !set.instruments.is_empty() && !families.is_empty() {
            let name = set.name.clone();
            return (
                Layering::SampleLayered {
                    set,
                    families,
                },
                Some(name),
            );
        }
        let name = set.name.clone();
        if !families.is_empty() {
            return (Layering::WaveLayered(families), Some(name));
        }
        return (Layering::Waveform, Some(name));
    }

    if !families.is_empty() {
        (Layering::WaveLayered(families), None)
    } else {
        (Layering::Waveform, None)
    }
}

/// Per-note defaults used when the session triggers voices.
#[derive(Clone)]
struct Settings {
    params: SynthParams,
    waveform: WaveformKind,
}

/// The active session's mutable state, behind one lock.
struct SessionState {
    score: Option<Arc<Score>>,
    notes: Vec<NoteEvent>,
    duration: f64,
    schedule: Vec<ScheduledEvent>,
    cursor: usize,
    anchor: Instant,
    elapsed_at_anchor: f64,
    layering: Layering,
    sound_set_name: Option<String>,
    /// note instance → ids of the voices its note-on started
    voices: HashMap<usize, Vec<String>>,
    active_notes: HashSet<String>,
}

impl SessionState {
    fn empty() -> Self {
        Self {
            score: None,
            notes: Vec::new(),
            duration: 0.0,
            schedule: Vec::new(),
            cursor: 0,
            anchor: Instant::now(),
            elapsed_at_anchor: 0.0,
            layering: Layering::Waveform,
            sound_set_name: None,
            voices: HashMap::new(),
            active_notes: HashSet::new(),
        }
    }
}

type SnapshotListener = Box<dyn Fn(&PlaybackSnapshot) + Send>;

struct PlayerShared {
    engine: EngineHandle,
    provider: Arc<dyn SoundSetProvider>,
    session: Mutex<SessionState>,
    settings: Mutex<Settings>,
    /// Cancellation token for async loads; bumped by play() and stop().
    generation: AtomicU64,
    is_playing: AtomicBool,
    is_paused: AtomicBool,
    should_exit: AtomicBool,
    tempo_bits: AtomicU64,
    progress_bits: AtomicU64,
    listeners: Mutex<Vec<(u64, SnapshotListener)>>,
    listener_serial: AtomicU64,
}

enum TickOutcome {
    Idle,
    Fired,
    Finished,
}

impl PlayerShared {
    fn tempo(&self) -> f64 {
        f64::from_bits(self.tempo_bits.load(Ordering::SeqCst))
    }

    fn store_tempo(&self, tempo: f64) {
        self.tempo_bits.store(tempo.to_bits(), Ordering::SeqCst);
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::SeqCst))
    }

    fn store_progress(&self, progress: f64) {
        self.progress_bits
            .store(progress.to_bits(), Ordering::SeqCst);
    }

    fn elapsed_original(&self, session: &SessionState) -> f64 {
        session.elapsed_at_anchor + session.anchor.elapsed().as_secs_f64() * self.tempo()
    }

    /// Begin (or decline) playback for a resolved layering. No-op when the
    /// captured generation went stale, or the engine is unavailable.
    fn begin(&self, generation: u64, layering: Layering, sound_set_name: Option<String>) {
        let mut session = self.session.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("discarding stale playback start (generation moved on)");
            return;
        }
        if !self.engine.is_ready() {
            log::error!("cannot start playback: audio engine is not ready");
            return;
        }

        session.layering = layering;
        session.sound_set_name = sound_set_name;
        session.schedule = build_schedule(&session.notes, 0.0);
        session.cursor = 0;
        session.anchor = Instant::now();
        session.elapsed_at_anchor = 0.0;
        self.store_progress(0.0);
        self.is_paused.store(false, Ordering::SeqCst);
        self.is_playing.store(true, Ordering::SeqCst);
        drop(session);

        self.notify();
    }

    /// Fire due events, refresh progress, detect completion.
    fn tick(&self) -> TickOutcome {
        let mut session = self.session.lock();
        // Flags flip under the session lock, so this check is race-free
        // against pause/stop folding the position.
        if !self.is_playing.load(Ordering::SeqCst) {
            return TickOutcome::Idle;
        }
        if session.schedule.is_empty() && session.score.is_none() {
            return TickOutcome::Idle;
        }
        let tempo = self.tempo();
        let elapsed = self.elapsed_original(&session);

        let mut fired = false;
        while session.cursor < session.schedule.len()
            && session.schedule[session.cursor].at <= elapsed
        {
            let event = session.schedule[session.cursor];
            session.cursor += 1;
            match event.kind {
                EventKind::On => self.fire_note_on(&mut session, event, tempo),
                EventKind::Off => self.fire_note_off(&mut session, event.note_index),
            }
            fired = true;
        }

        let progress = if session.duration > 0.0 {
            (elapsed / session.duration).clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.store_progress(progress);

        if progress >= 1.0 {
            TickOutcome::Finished
        } else if fired {
            TickOutcome::Fired
        } else {
            TickOutcome::Idle
        }
    }

    fn note_instance_id(note: &NoteEvent, note_index: usize) -> String {
        format!("midi-{}-{}", note.midi(), note_index)
    }

    fn fire_note_on(&self, session: &mut SessionState, event: ScheduledEvent, tempo: f64) {
        let note = session.notes[event.note_index].clone();
        let id = Self::note_instance_id(&note, event.note_index);
        let settings = self.settings.lock().clone();
        let frequency = midi_to_frequency(note.pitch);
        // Wall-clock seconds the note still has at the current tempo; the
        // synthesized buffer must cover exactly that window.
        let wall_duration = ((note.end() - event.at).max(0.05)) / tempo.max(MIN_TEMPO);

        let mut voice_ids: Vec<String> = Vec::new();
        match &session.layering {
            Layering::SampleLayered { set, families } => {
                let picks = set.pick_instruments(&note, families);
                if picks.is_empty() {
                    if let Some(instrument) = set.pick_instrument(&note) {
                        if self
                            .engine
                            .play_sample(
                                &id,
                                Arc::clone(&instrument.buffer),
                                frequency,
                                instrument.base_frequency,
                                note.velocity,
                                &settings.params,
                                false,
                            )
                            .is_ok()
                        {
                            voice_ids.push(id.clone());
                        }
                    } else {
                        self.trigger_waveform_note(
                            &note,
                            &id,
                            frequency,
                            wall_duration,
                            &settings,
                            &mut voice_ids,
                        );
                    }
                } else {
                    for instrument in picks {
                        let voice_id = format!("{id}:{}", instrument.id);
                        match self.engine.play_sample(
                            &voice_id,
                            Arc::clone(&instrument.buffer),
                            frequency,
                            instrument.base_frequency,
                            note.velocity,
                            &settings.params,
                            false,
                        ) {
                            Ok(()) => voice_ids.push(voice_id),
                            Err(e) => log::warn!("sample voice failed: {e}"),
                        }
                    }
                }
            }
            Layering::WaveLayered(families) => {
                for family in families {
                    if let FamilySound::Waveform(kind) = family_sound(family) {
                        let voice_id = format!("{id}:{family}");
                        match self.engine.play_waveform(
                            &voice_id,
                            frequency,
                            kind,
                            wall_duration,
                            note.velocity,
                            &settings.params,
                        ) {
                            Ok(()) => voice_ids.push(voice_id),
                            Err(e) => log::warn!("waveform voice failed: {e}"),
                        }
                    }
                }
            }
            Layering::Waveform => {
                self.trigger_waveform_note(
                    &note,
                    &id,
                    frequency,
                    wall_duration,
                    &settings,
                    &mut voice_ids,
                );
            }
        }

        if !voice_ids.is_empty() {
            session.voices.insert(event.note_index, voice_ids);
            session.active_notes.insert(id);
        }
    }

    /// Single-waveform voicing: the note's family picks the waveform,
    /// percussive families stay silent, unknown families use the default.
    fn trigger_waveform_note(
        &self,
        note: &NoteEvent,
        id: &str,
        frequency: f64,
        wall_duration: f64,
        settings: &Settings,
        voice_ids: &mut Vec<String>,
    ) {
        let kind = match note.instrument_family.as_deref().map(family_sound) {
            Some(FamilySound::Silent) => return,
            Some(FamilySound::Waveform(kind)) => kind,
            _ => settings.waveform,
        };
        match self.engine.play_waveform(
            id,
            frequency,
            kind,
            wall_duration,
            note.velocity,
            &settings.params,
        ) {
            Ok(()) => voice_ids.push(id.to_string()),
            Err(e) => log::warn!("waveform voice failed: {e}"),
        }
    }

    /// Release exactly the voices the paired note-on started.
    fn fire_note_off(&self, session: &mut SessionState, note_index: usize) {
        if let Some(voice_ids) = session.voices.remove(&note_index) {
            for voice_id in voice_ids {
                self.engine.release_voice(&voice_id);
            }
        }
        let id = Self::note_instance_id(&session.notes[note_index], note_index);
        session.active_notes.remove(&id);
    }

    /// Shared teardown for stop()/auto-stop. `clear_score` distinguishes an
    /// explicit stop (unloads the score) from reaching the end of playback.
    fn halt(&self, clear_score: bool) {
        let mut session = self.session.lock();
        self.engine.silence_all();
        session.schedule.clear();
        session.cursor = 0;
        session.voices.clear();
        session.active_notes.clear();
        session.elapsed_at_anchor = 0.0;
        if clear_score {
            session.score = None;
            session.notes.clear();
            session.duration = 0.0;
            session.sound_set_name = None;
            session.layering = Layering::Waveform;
        }
        self.is_playing.store(false, Ordering::SeqCst);
        self.is_paused.store(false, Ordering::SeqCst);
        self.store_progress(0.0);
        drop(session);

        self.notify();
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        let session = self.session.lock();
        PlaybackSnapshot {
            is_playing: self.is_playing.load(Ordering::SeqCst),
            is_paused: self.is_paused.load(Ordering::SeqCst),
            progress: self.progress(),
            active_note_ids: session.active_notes.clone(),
            tempo_factor: self.tempo(),
            layering_mode: session.layering.mode(),
            sound_set_name: session.sound_set_name.clone(),
        }
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let listeners = self.listeners.lock();
        for (_, listener) in listeners.iter() {
            listener(&snapshot);
        }
    }
}

fn player_thread(shared: Arc<PlayerShared>) {
    let mut ticks_since_notify = 0u32;
    loop {
        if shared.should_exit.load(Ordering::SeqCst) {
            break;
        }
        if !shared.is_playing.load(Ordering::SeqCst) {
            thread::sleep(IDLE_TICK);
            continue;
        }
        thread::sleep(ACTIVE_TICK);
        match shared.tick() {
            TickOutcome::Finished => {
                log::info!("playback complete");
                shared.halt(false);
                ticks_since_notify = 0;
            }
            TickOutcome::Fired => {
                shared.notify();
                ticks_since_notify = 0;
            }
            TickOutcome::Idle => {
                ticks_since_notify += 1;
                if ticks_since_notify >= NOTIFY_EVERY_TICKS {
                    ticks_since_notify = 0;
                    shared.notify();
                }
            }
        }
    }
}

/// Score playback controller.
pub struct ScorePlayer {
    shared: Arc<PlayerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ScorePlayer {
    pub fn new(engine: EngineHandle, provider: Arc<dyn SoundSetProvider>) -> Self {
        let shared = Arc::new(PlayerShared {
            engine,
            provider,
            session: Mutex::new(SessionState::empty()),
            settings: Mutex::new(Settings {
                params: SynthParams::default(),
                waveform: WaveformKind::Sine,
            }),
            generation: AtomicU64::new(0),
            is_playing: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            should_exit: AtomicBool::new(false),
            tempo_bits: AtomicU64::new(1.0f64.to_bits()),
            progress_bits: AtomicU64::new(0.0f64.to_bits()),
            listeners: Mutex::new(Vec::new()),
            listener_serial: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || player_thread(thread_shared));

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Start playing a parsed score. Stops any current session first.
    ///
    /// Instrument layering resolves asynchronously when the score names a
    /// sound set; a load failure degrades to waveform layering and never
    /// fails the play. Scores with no structurally valid notes abort with a
    /// warning and no state change.
    pub fn play(&self, score: Score) -> Result<(), String> {
        let notes = sanitize_notes(&score.notes);
        if notes.is_empty() {
            log::warn!("score has no playable notes");
            return Err("score has no playable notes".to_string());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.halt(true);

        let duration = score.resolved_duration(&notes);
        let score = Arc::new(score);
        {
            let mut session = self.shared.session.lock();
            session.score = Some(Arc::clone(&score));
            session.notes = notes;
            session.duration = duration;
        }

        match score.sound_set_id.clone() {
            None => {
                let (layering, name) = resolve_layering(&score, None);
                self.shared.begin(generation, layering, name);
            }
            Some(sound_set_id) => {
                let shared = Arc::clone(&self.shared);
                let score = Arc::clone(&score);
                thread::spawn(move || {
                    let loaded = match shared.provider.ensure_loaded(&sound_set_id) {
                        Ok(set) => Some(set),
                        Err(e) => {
                            log::warn!(
                                "sound set '{}' unavailable, falling back to waveforms: {e}",
                                sound_set_id
                            );
                            None
                        }
                    };
                    if shared.generation.load(Ordering::SeqCst) != generation {
                        log::debug!("sound set load resolved after a newer request, discarded");
                        return;
                    }
                    let (layering, name) = resolve_layering(&score, loaded);
                    shared.begin(generation, layering, name);
                });
            }
        }
        Ok(())
    }

    /// Pause at the current position. The score stays loaded.
    pub fn pause(&self) {
        if !self.shared.is_playing.load(Ordering::SeqCst)
            || self.shared.is_paused.load(Ordering::SeqCst)
        {
            return;
        }
        let mut session = self.shared.session.lock();
        let elapsed = self.shared.elapsed_original(&session);
        session.elapsed_at_anchor = elapsed.min(session.duration);
        session.schedule.clear();
        session.cursor = 0;
        session.voices.clear();
        session.active_notes.clear();
        self.shared.is_playing.store(false, Ordering::SeqCst);
        self.shared.is_paused.store(true, Ordering::SeqCst);
        drop(session);

        self.shared.engine.release_all();
        self.shared.notify();
    }

    /// Resume from the paused position. Notes whose duration spans the
    /// resume point are re-triggered for their remaining duration.
    pub fn resume(&self) {
        if !self.shared.is_paused.load(Ordering::SeqCst) {
            return;
        }
        if !self.shared.engine.is_ready() {
            log::error!("cannot resume: audio engine is not ready");
            return;
        }
        let mut session = self.shared.session.lock();
        let offset = session.elapsed_at_anchor;
        session.schedule = build_schedule(&session.notes, offset);
        session.cursor = 0;
        session.anchor = Instant::now();
        self.shared.is_paused.store(false, Ordering::SeqCst);
        self.shared.is_playing.store(true, Ordering::SeqCst);
        drop(session);

        self.shared.notify();
    }

    /// Stop completely: silence voices, unload the score, progress to zero.
    /// Pending async loads become no-ops.
    pub fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.halt(true);
    }

    /// Change the tempo factor, clamped to [0.25, 2.0]. While playing, the
    /// remaining schedule is rebuilt from the current elapsed-original
    /// position so the timeline stays continuous; notes already sounding
    /// re-trigger for their remaining duration at the new tempo.
    pub fn set_tempo(&self, factor: f64) {
        let clamped = factor.clamp(MIN_TEMPO, MAX_TEMPO);
        let current = self.shared.tempo();
        if (clamped - current).abs() < TEMPO_EPSILON {
            return;
        }

        if self.shared.is_playing.load(Ordering::SeqCst) {
            let mut session = self.shared.session.lock();
            // Fold elapsed time under the old tempo before switching.
            let elapsed = self.shared.elapsed_original(&session);
            self.shared.engine.release_all();
            session.voices.clear();
            session.active_notes.clear();
            session.elapsed_at_anchor = elapsed.min(session.duration);
            session.anchor = Instant::now();
            session.schedule = build_schedule(&session.notes, elapsed);
            session.cursor = 0;
            self.shared.store_tempo(clamped);
            drop(session);
        } else {
            // Paused/stopped: the stored position is already in original
            // time, nothing to reschedule until resume.
            self.shared.store_tempo(clamped);
        }
        self.shared.notify();
    }

    /// Sanitize and adopt a parameter set for subsequent notes (applied to
    /// the engine graph immediately).
    pub fn set_params(&self, input: &PartialParams) -> SynthParams {
        let sanitized = self.shared.engine.set_params(input);
        self.shared.settings.lock().params = sanitized.clone();
        sanitized
    }

    /// Default waveform for notes with no (or unknown) instrument family.
    pub fn set_waveform(&self, kind: WaveformKind) {
        self.shared.settings.lock().waveform = kind;
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.shared.snapshot()
    }

    /// The score currently loaded (playing or paused), if any.
    pub fn current_score(&self) -> Option<Arc<Score>> {
        self.shared.session.lock().score.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.is_playing.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    pub fn tempo(&self) -> f64 {
        self.shared.tempo()
    }

    /// Register a snapshot listener; returns an id for `unsubscribe`.
    pub fn subscribe(&self, listener: impl Fn(&PlaybackSnapshot) + Send + 'static) -> u64 {
        let id = self.shared.listener_serial.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.lock().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.shared.listeners.lock().retain(|(i, _)| *i != id);
    }
}

impl Drop for ScorePlayer {
    fn drop(&mut self) {
        self.shared.should_exit.store(true, Ordering::SeqCst);
        self.shared.is_playing.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::AudioEngine;
    use crate::audio::sampler::SampleBuffer;
    use crate::score::instruments::{InstrumentLibrary, LoadedInstrument};
    use std::sync::mpsc;

    fn note(midi: f64, start: f64, duration: f64) -> NoteEvent {
        NoteEvent {
            pitch: midi,
            start,
            duration,
            velocity: 1.0,
            instrument_family: None,
            instrument_name: None,
            channel: None,
        }
    }

    fn score(notes: Vec<NoteEvent>) -> Score {
        Score {
            notes,
            ..Default::default()
        }
    }

    fn init_test_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn player() -> (ScorePlayer, EngineHandle) {
        init_test_logging();
        let engine = AudioEngine::offline(44_100).handle();
        let library = Arc::new(InstrumentLibrary::new("/tmp"));
        (ScorePlayer::new(engine.clone(), library), engine)
    }

    /// Poll until `predicate` holds or the timeout passes; renders engine
    /// blocks along the way so queued voices actually start and stop.
    fn wait_for(
        engine: &EngineHandle,
        timeout: Duration,
        mut predicate: impl FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut block = vec![0.0f32; 256 * 2];
        while Instant::now() < deadline {
            engine.render_block(&mut block, 2);
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // ------------------------------------------------------------------
    // Pure scheduling
    // ------------------------------------------------------------------

    #[test]
    fn schedule_pairs_every_note_with_off_after_on() {
        let notes = vec![note(60.0, 0.0, 0.5), note(64.0, 0.25, 0.5), note(67.0, 1.0, 0.1)];
        let schedule = build_schedule(&notes, 0.0);
        assert_eq!(schedule.len(), 6);
        for index in 0..notes.len() {
            let on = schedule
                .iter()
                .find(|e| e.note_index == index && e.kind == EventKind::On)
                .unwrap();
            let off = schedule
                .iter()
                .find(|e| e.note_index == index && e.kind == EventKind::Off)
                .unwrap();
            assert!(off.at >= on.at);
        }
        // Sorted by time.
        for pair in schedule.windows(2) {
            assert!(pair[0].at <= pair[1].at);
        }
    }

    #[test]
    fn schedule_from_offset_skips_finished_and_reincludes_spanning_notes() {
        let notes = vec![
            note(60.0, 0.0, 0.5),  // finished before the offset
            note(64.0, 0.5, 2.0),  // sounding at the offset
            note(67.0, 3.0, 0.5),  // entirely in the future
        ];
        let schedule = build_schedule(&notes, 1.0);
        let indices: Vec<usize> = schedule
            .iter()
            .filter(|e| e.kind == EventKind::On)
            .map(|e| e.note_index)
            .collect();
        assert_eq!(indices, vec![1, 2]);
        // The spanning note starts immediately at the offset...
        let spanning_on = schedule
            .iter()
            .find(|e| e.note_index == 1 && e.kind == EventKind::On)
            .unwrap();
        assert_eq!(spanning_on.at, 1.0);
        // ...and still ends at its original end time.
        let spanning_off = schedule
            .iter()
            .find(|e| e.note_index == 1 && e.kind == EventKind::Off)
            .unwrap();
        assert_eq!(spanning_off.at, 2.5);
    }

    #[test]
    fn zero_remaining_duration_is_skipped() {
        let notes = vec![note(60.0, 0.0, 1.0)];
        assert!(build_schedule(&notes, 1.0).is_empty());
        assert!(build_schedule(&notes, 2.0).is_empty());
    }

    // ------------------------------------------------------------------
    // Layering resolution
    // ------------------------------------------------------------------

    fn toy_set(instruments: usize, layer_families: Option<Vec<String>>) -> Arc<LoadedSoundSet> {
        let buffer = Arc::new(SampleBuffer {
            data: vec![0.1; 88_200],
            sample_rate: 44_100,
        });
        let instruments = (0..instruments)
            .map(|i| {
                Arc::new(LoadedInstrument {
                    id: format!("inst-{i}"),
                    families: vec!["piano".to_string()],
                    names: Vec::new(),
                    base_midi: Some(60),
                    base_frequency: 261.63,
                    min_midi: None,
                    max_midi: None,
                    buffer: Arc::clone(&buffer),
                })
            })
            .collect();
        Arc::new(LoadedSoundSet::build(
            "toy".into(),
            "Toy Set".into(),
            layer_families,
            instruments,
        ))
    }

    #[test]
    fn layering_uses_samples_when_the_set_has_instruments() {
        let mut s = score(vec![note(60.0, 0.0, 0.5)]);
        s.layer_families = Some(vec!["piano".into()]);
        let (layering, name) = resolve_layering(&s, Some(toy_set(2, None)));
        assert_eq!(layering.mode(), LayeringMode::SampleLayered);
        assert_eq!(name.as_deref(), Some("Toy Set"));
    }

    #[test]
    fn layering_degrades_to_waveforms_when_load_fails() {
        let mut s = score(vec![note(60.0, 0.0, 0.5)]);
        s.layer_families = Some(vec!["piano".into(), "strings".into()]);
        let (layering, name) = resolve_layering(&s, None);
        assert_eq!(layering.mode(), LayeringMode::WaveLayered);
        assert!(name.is_none());
    }

    #[test]
    fn layering_takes_families_from_the_sound_set_when_score_has_none() {
        let s = score(vec![note(60.0, 0.0, 0.5)]);
        let set = toy_set(0, Some(vec!["piano".into(), "strings".into()]));
        let (layering, name) = resolve_layering(&s, Some(set));
        // No instruments in the set: families still drive wave layering.
        assert_eq!(layering.mode(), LayeringMode::WaveLayered);
        assert_eq!(name.as_deref(), Some("Toy Set"));
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    #[test]
    fn empty_score_aborts_without_state_change() {
        let (player, _engine) = player();
        let bad = score(vec![note(f64::NAN, 0.0, 1.0), note(200.0, 0.0, 1.0)]);
        assert!(player.play(bad).is_err());
        assert!(!player.is_playing());
        assert_eq!(player.progress(), 0.0);
    }

    #[test]
    fn single_note_plays_to_completion_and_auto_stops() {
        let (player, engine) = player();
        player
            .play(score(vec![note(60.0, 0.0, 0.1)]))
            .unwrap();

        // The note fires almost immediately.
        assert!(
            wait_for(&engine, Duration::from_secs(2), || {
                player.snapshot().active_note_ids.contains("midi-60-0")
            }),
            "note-on never fired"
        );
        // Resolved duration has a 1 s floor; completion auto-stops and
        // resets progress.
        assert!(
            wait_for(&engine, Duration::from_secs(3), || !player.is_playing()
                && !player.is_paused()),
            "playback never auto-stopped"
        );
        assert_eq!(player.progress(), 0.0);
        assert!(player.snapshot().active_note_ids.is_empty());
        assert!(
            wait_for(&engine, Duration::from_secs(1), || engine.active_voices() == 0),
            "voices were not released"
        );
    }

    #[test]
    fn pause_silences_and_resume_retriggers_spanning_notes() {
        let (player, engine) = player();
        player
            .play(score(vec![note(60.0, 0.0, 4.0), note(64.0, 3.0, 0.5)]))
            .unwrap();

        assert!(wait_for(&engine, Duration::from_secs(2), || {
            player.snapshot().active_note_ids.contains("midi-60-0")
        }));

        player.pause();
        assert!(player.is_paused());
        assert!(!player.is_playing());
        assert!(player.snapshot().active_note_ids.is_empty());
        let paused_progress = player.progress();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(player.progress(), paused_progress, "progress frozen while paused");

        player.resume();
        assert!(player.is_playing());
        // The long note spans the resume point and must come back.
        assert!(
            wait_for(&engine, Duration::from_secs(2), || {
                player.snapshot().active_note_ids.contains("midi-60-0")
            }),
            "spanning note did not re-trigger on resume"
        );
    }

    #[test]
    fn stop_resets_everything() {
        let (player, engine) = player();
        player.play(score(vec![note(60.0, 0.0, 5.0)])).unwrap();
        assert!(wait_for(&engine, Duration::from_secs(2), || {
            !player.snapshot().active_note_ids.is_empty()
        }));

        player.stop();
        assert!(!player.is_playing());
        assert!(!player.is_paused());
        assert_eq!(player.progress(), 0.0);
        assert!(player.snapshot().active_note_ids.is_empty());
        assert!(wait_for(&engine, Duration::from_secs(1), || engine
            .active_voices()
            == 0));
    }

    #[test]
    fn tempo_is_clamped_and_epsilon_stable() {
        let (player, _engine) = player();
        player.set_tempo(10.0);
        assert_eq!(player.tempo(), 2.0);
        player.set_tempo(0.01);
        assert_eq!(player.tempo(), 0.25);
        player.set_tempo(0.25 + 1e-9); // inside epsilon: no-op
        assert_eq!(player.tempo(), 0.25);
    }

    #[test]
    fn tempo_change_scales_remaining_wall_clock() {
        let (player, engine) = player();
        // One note two seconds in; at tempo 2 it should fire around the
        // one-second mark instead.
        player
            .play(score(vec![note(72.0, 2.0, 0.5)]))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        player.set_tempo(2.0);

        let started = Instant::now();
        assert!(
            wait_for(&engine, Duration::from_secs(3), || {
                player.snapshot().active_note_ids.contains("midi-72-0")
            }),
            "note never fired after tempo change"
        );
        let waited = started.elapsed().as_secs_f64();
        assert!(
            (0.4..1.7).contains(&waited),
            "note fired after {waited:.2}s, expected ~0.95s"
        );
    }

    #[test]
    fn tempo_change_preserves_elapsed_continuity() {
        let (player, _engine) = player();
        player.play(score(vec![note(60.0, 0.0, 10.0)])).unwrap();
        thread::sleep(Duration::from_millis(200));
        let before = {
            let session = player.shared.session.lock();
            player.shared.elapsed_original(&session)
        };
        player.set_tempo(0.5);
        let after = {
            let session = player.shared.session.lock();
            player.shared.elapsed_original(&session)
        };
        assert!(
            (after - before).abs() < 0.1,
            "elapsed jumped across tempo change: {before:.3} -> {after:.3}"
        );
    }

    // ------------------------------------------------------------------
    // Async sound-set resolution
    // ------------------------------------------------------------------

    /// Provider whose loads block until the test releases them.
    struct GatedProvider {
        gate: Mutex<mpsc::Receiver<Result<Arc<LoadedSoundSet>, String>>>,
    }

    impl SoundSetProvider for GatedProvider {
        fn ensure_loaded(&self, _id: &str) -> Result<Arc<LoadedSoundSet>, String> {
            self.gate
                .lock()
                .recv()
                .unwrap_or_else(|_| Err("gate closed".to_string()))
        }
    }

    fn gated_player() -> (
        ScorePlayer,
        EngineHandle,
        mpsc::Sender<Result<Arc<LoadedSoundSet>, String>>,
    ) {
        init_test_logging();
        let engine = AudioEngine::offline(44_100).handle();
        let (sender, receiver) = mpsc::channel();
        let provider = Arc::new(GatedProvider {
            gate: Mutex::new(receiver),
        });
        (
            ScorePlayer::new(engine.clone(), provider),
            engine,
            sender,
        )
    }

    #[test]
    fn stop_before_load_resolves_stays_stopped() {
        let (player, engine, gate) = gated_player();
        let mut s = score(vec![note(64.0, 0.0, 0.5)]);
        s.sound_set_id = Some("slow-set".into());
        player.play(s).unwrap();
        assert!(!player.is_playing(), "playback must wait for the load");

        player.stop();
        gate.send(Ok(toy_set(1, Some(vec!["piano".into()])))).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(!player.is_playing());
        assert!(player.snapshot().active_note_ids.is_empty());
        let mut block = vec![0.0f32; 256 * 2];
        engine.render_block(&mut block, 2);
        assert_eq!(engine.active_voices(), 0, "stale load must not trigger voices");
    }

    #[test]
    fn stale_load_loses_to_a_newer_play() {
        let (player, engine, gate) = gated_player();
        let mut first = score(vec![note(60.0, 0.0, 0.5)]);
        first.sound_set_id = Some("slow-set".into());
        player.play(first).unwrap();

        // Second play has no sound set and starts immediately.
        player.play(score(vec![note(67.0, 0.0, 3.0)])).unwrap();
        assert!(wait_for(&engine, Duration::from_secs(2), || {
            player.snapshot().active_note_ids.contains("midi-67-0")
        }));

        // Now the first load resolves; it must be discarded.
        gate.send(Ok(toy_set(1, Some(vec!["piano".into()])))).unwrap();
        thread::sleep(Duration::from_millis(100));
        let snapshot = player.snapshot();
        assert!(snapshot.active_note_ids.contains("midi-67-0"));
        assert!(!snapshot.active_note_ids.contains("midi-60-0"));
        assert_eq!(snapshot.layering_mode, LayeringMode::Waveform);
        let current = player.current_score().expect("second score stays loaded");
        assert_eq!(current.notes[0].pitch, 67.0);
    }

    #[test]
    fn failed_load_degrades_to_wave_layering_and_still_plays() {
        let (player, engine, gate) = gated_player();
        let mut s = score(vec![NoteEvent {
            instrument_family: Some("piano".into()),
            ..note(60.0, 0.0, 2.0)
        }]);
        s.sound_set_id = Some("broken-set".into());
        s.layer_families = Some(vec!["piano".into(), "strings".into()]);
        player.play(s).unwrap();

        gate.send(Err("disk on fire".to_string())).unwrap();
        assert!(
            wait_for(&engine, Duration::from_secs(2), || player.is_playing()),
            "playback should proceed on load failure"
        );
        let snapshot = player.snapshot();
        assert_eq!(snapshot.layering_mode, LayeringMode::WaveLayered);
        // Two wave layers were started for the note.
        assert!(wait_for(&engine, Duration::from_secs(2), || {
            engine.active_voices() == 2
        }));
    }

    #[test]
    fn sample_layering_triggers_one_voice_per_instrument() {
        let (player, engine, gate) = gated_player();
        let mut s = score(vec![NoteEvent {
            instrument_family: Some("piano".into()),
            ..note(60.0, 0.0, 2.0)
        }]);
        s.sound_set_id = Some("toy".into());
        s.layer_families = Some(vec!["piano".into()]);
        player.play(s).unwrap();

        // Two instruments both tagged "piano": selection dedups to the
        // nearest single candidate per family, so exactly one voice here.
        gate.send(Ok(toy_set(2, None))).unwrap();
        assert!(wait_for(&engine, Duration::from_secs(2), || player.is_playing()));
        assert_eq!(player.snapshot().layering_mode, LayeringMode::SampleLayered);
        assert!(wait_for(&engine, Duration::from_secs(2), || {
            engine.active_voices() == 1
        }));
    }
}
