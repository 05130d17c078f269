//! Main audio engine
//!
//! Owns the shared effects graph, both voice pools, the waveform cache and
//! the analysis/recording taps, and renders them either through a cpal
//! output stream or on demand (offline mode, used by tests and headless
//! export). Control threads talk to the render path through `EngineHandle`:
//! parameter updates go through the graph's smoothed targets, voice
//! triggers go through the command queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::cache::WaveformCache;
use super::events::{CommandQueue, EngineCommand};
use super::graph::AudioGraph;
use super::params::{PartialParams, SynthParams};
use super::sampler::{EnvelopeSettings, SampleBuffer, SamplePool, SAMPLE_POOL_SIZE};
use super::spectrum::{AnalysisTap, ANALYSIS_BANDS};
use super::synth::{Adsr, PolyBlepSynth, WaveformKind, WaveformSynth};
use super::voice::{OscillatorPool, OSC_POOL_SIZE};
use super::wav::encode_wav;

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// How often (in render blocks) the spectrum tap re-analyzes
const SPECTRUM_EVERY_BLOCKS: u32 = 2;

/// Preferred output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            buffer_size: 512,
        }
    }
}

/// Engine readiness/status snapshot, delivered to subscribers on change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub context_ready: bool,
    pub graph_ready: bool,
    pub is_recording: bool,
    pub has_custom_sample: bool,
    pub error: Option<String>,
}

struct CustomSample {
    buffer: Arc<SampleBuffer>,
    base_frequency: f64,
    looped: bool,
}

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

type StatusListener = Box<dyn Fn(&EngineStatus) + Send>;

/// State shared between the render path and every engine handle.
struct SharedState {
    sample_rate: u32,
    graph: Mutex<AudioGraph>,
    osc_pool: Mutex<OscillatorPool>,
    sample_pool: Mutex<SamplePool>,
    commands: CommandQueue,
    cache: Mutex<WaveformCache>,
    synth: Arc<dyn WaveformSynth>,
    params: Mutex<SynthParams>,
    custom_sample: RwLock<Option<CustomSample>>,
    ready: AtomicBool,
    recording: AtomicBool,
    recorded: Mutex<(Vec<f32>, Vec<f32>)>,
    spectrum: Mutex<AnalysisTap>,
    spectrum_bands: [AtomicU32; ANALYSIS_BANDS],
    frames_rendered: AtomicU64,
    last_error: Mutex<Option<String>>,
    listeners: Mutex<Vec<(u64, StatusListener)>>,
    listener_serial: AtomicU64,
}

impl SharedState {
    fn new(sample_rate: u32) -> Self {
        let synth: Arc<dyn WaveformSynth> = Arc::new(PolyBlepSynth);
        const INIT_BAND: AtomicU32 = AtomicU32::new(0);
        Self {
            sample_rate,
            graph: Mutex::new(AudioGraph::new(sample_rate as f32)),
            osc_pool: Mutex::new(OscillatorPool::new(sample_rate as f32, OSC_POOL_SIZE)),
            sample_pool: Mutex::new(SamplePool::new(sample_rate as f32, SAMPLE_POOL_SIZE)),
            commands: CommandQueue::new(COMMAND_QUEUE_CAPACITY),
            cache: Mutex::new(WaveformCache::new(Arc::clone(&synth))),
            synth,
            params: Mutex::new(SynthParams::default()),
            custom_sample: RwLock::new(None),
            ready: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            recorded: Mutex::new((Vec::new(), Vec::new())),
            spectrum: Mutex::new(AnalysisTap::new(sample_rate as f32)),
            spectrum_bands: [INIT_BAND; ANALYSIS_BANDS],
            frames_rendered: AtomicU64::new(0),
            last_error: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            listener_serial: AtomicU64::new(0),
        }
    }

    /// Apply queued commands, then mix and process one interleaved block.
    fn render(
        &self,
        data: &mut [f32],
        channels: usize,
        scratch: &mut Vec<EngineCommand>,
        spectrum_counter: &mut u32,
    ) {
        self.commands.drain_into(scratch);
        if !scratch.is_empty() {
            let mut osc = self.osc_pool.lock();
            let mut samples = self.sample_pool.lock();
            for command in scratch.drain(..) {
                match command {
                    EngineCommand::WaveOn {
                        voice_id,
                        buffer,
                        gain,
                        attack,
                    } => osc.trigger(&voice_id, buffer, gain, attack),
                    EngineCommand::SampleOn {
                        voice_id,
                        buffer,
                        frequency,
                        base_frequency,
                        velocity,
                        env,
                        looped,
                    } => samples.trigger(
                        &voice_id,
                        buffer,
                        frequency,
                        base_frequency,
                        velocity,
                        env,
                        looped,
                    ),
                    EngineCommand::Release { voice_id, release } => {
                        osc.release(&voice_id);
                        samples.release(&voice_id, release);
                    }
                    EngineCommand::ReleaseAll { release } => {
                        osc.release_all();
                        samples.release_all(release);
                    }
                    EngineCommand::SilenceAll => {
                        osc.silence_all();
                        samples.stop_all();
                    }
                }
            }
        }

        let frames = data.len() / channels.max(1);
        {
            let mut graph = self.graph.lock();
            let mut osc = self.osc_pool.lock();
            let mut samples = self.sample_pool.lock();
            let recording = self.recording.load(Ordering::Relaxed);
            let mut recorded = if recording {
                Some(self.recorded.lock())
            } else {
                None
            };

            for frame in data.chunks_mut(channels.max(1)) {
                let mixed = osc.next_sample() + samples.next_sample();
                let (l, r) = graph.process(mixed);
                frame[0] = l;
                if channels > 1 {
                    frame[1] = r;
                }
                if let Some(recorded) = recorded.as_mut() {
                    recorded.0.push(l);
                    recorded.1.push(if channels > 1 { r } else { l });
                }
            }
        }
        self.frames_rendered
            .fetch_add(frames as u64, Ordering::Relaxed);

        // Analysis tap: mono mix, throttled, magnitudes published lock-free.
        *spectrum_counter += 1;
        if *spectrum_counter >= SPECTRUM_EVERY_BLOCKS {
            *spectrum_counter = 0;
            if let Some(mut tap) = self.spectrum.try_lock() {
                if channels > 1 {
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|c| (c[0] + c[1]) * 0.5)
                        .collect();
                    tap.push(&mono);
                } else {
                    tap.push(data);
                }
                tap.analyze();
                for (slot, &mag) in self.spectrum_bands.iter().zip(&tap.band_magnitudes()) {
                    slot.store(f32_to_u32(mag), Ordering::Relaxed);
                }
            }
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            context_ready: self.ready.load(Ordering::SeqCst),
            graph_ready: self.ready.load(Ordering::SeqCst),
            is_recording: self.recording.load(Ordering::SeqCst),
            has_custom_sample: self.custom_sample.read().is_some(),
            error: self.last_error.lock().clone(),
        }
    }

    fn notify(&self) {
        let snapshot = self.status();
        let listeners = self.listeners.lock();
        for (_, listener) in listeners.iter() {
            listener(&snapshot);
        }
    }
}

/// Handle to control the engine from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<SharedState>,
}

impl EngineHandle {
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status()
    }

    /// Register a status listener; returns an id for `unsubscribe_status`.
    pub fn subscribe_status(&self, listener: impl Fn(&EngineStatus) + Send + 'static) -> u64 {
        let id = self.shared.listener_serial.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.lock().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe_status(&self, id: u64) {
        self.shared.listeners.lock().retain(|(i, _)| *i != id);
    }

    /// Sanitize and apply a parameter set to the graph (smoothed, no-op when
    /// unchanged). Also becomes the default set for subsequent notes.
    pub fn set_params(&self, input: &PartialParams) -> SynthParams {
        let sanitized = SynthParams::from_partial(input);
        self.apply_params(&sanitized);
        sanitized
    }

    fn apply_params(&self, params: &SynthParams) {
        let changed = self.shared.graph.lock().apply_params(params);
        if changed {
            log::debug!("engine params updated: {}", params.signature());
        }
        *self.shared.params.lock() = params.clone();
    }

    /// Current sanitized parameter set.
    pub fn params(&self) -> SynthParams {
        self.shared.params.lock().clone()
    }

    /// Start a synthesized note. Fetches the buffer from the waveform cache
    /// (exactly one synthesis per distinct key), applies the ADSR envelope
    /// and hands the voice to the oscillator pool.
    ///
    /// While a custom sample override is loaded, notes route through the
    /// sample pool at the override's base frequency instead.
    pub fn play_waveform(
        &self,
        voice_id: &str,
        frequency: f64,
        kind: WaveformKind,
        duration: f64,
        velocity: f64,
        params: &SynthParams,
    ) -> Result<(), String> {
        if !self.is_ready() {
            return Err("audio engine is not ready".to_string());
        }
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(format!("invalid frequency {frequency}"));
        }

        if let Some(custom) = self.shared.custom_sample.read().as_ref() {
            let buffer = Arc::clone(&custom.buffer);
            let base = custom.base_frequency;
            let looped = custom.looped;
            return self.play_sample(voice_id, buffer, frequency, base, velocity, params, looped);
        }

        self.apply_params(params);

        let duration = duration.clamp(0.05, 10.0) as f32;
        let fm = params
            .use_fm
            .then(|| (params.fm_ratio as f32, params.fm_index as f32));
        let phase = (params.phase_offset.to_radians()) as f32;

        let raw = self.shared.cache.lock().fetch(
            kind,
            frequency as f32,
            duration,
            self.shared.sample_rate as f32,
            phase,
            fm,
        );

        let buffer = if params.use_adsr {
            let mut enveloped = (*raw).clone();
            self.shared.synth.apply_adsr(
                &mut enveloped,
                Adsr {
                    attack: params.attack as f32,
                    decay: params.decay as f32,
                    sustain: params.sustain as f32,
                    release: params.release as f32,
                },
                self.shared.sample_rate as f32,
            );
            Arc::new(enveloped)
        } else {
            raw
        };

        let gain = (params.volume * velocity.clamp(0.0, 1.0)) as f32;
        self.shared.commands.push(EngineCommand::WaveOn {
            voice_id: voice_id.to_string(),
            buffer,
            gain,
            attack: params.attack as f32,
        });
        Ok(())
    }

    /// Start a sample voice for a decoded buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn play_sample(
        &self,
        voice_id: &str,
        buffer: Arc<SampleBuffer>,
        frequency: f64,
        base_frequency: f64,
        velocity: f64,
        params: &SynthParams,
        looped: bool,
    ) -> Result<(), String> {
        if !self.is_ready() {
            return Err("audio engine is not ready".to_string());
        }
        self.apply_params(params);

        let env = EnvelopeSettings {
            use_adsr: params.use_adsr,
            attack: params.attack as f32,
            decay: params.decay as f32,
            sustain: params.sustain as f32,
            volume: params.volume as f32,
        };
        self.shared.commands.push(EngineCommand::SampleOn {
            voice_id: voice_id.to_string(),
            buffer,
            frequency,
            base_frequency,
            velocity: velocity.clamp(0.0, 1.0) as f32,
            env,
            looped,
        });
        Ok(())
    }

    /// Note-off for one voice, using the current release time.
    pub fn release_voice(&self, voice_id: &str) {
        let release = self.shared.params.lock().release as f32;
        self.shared.commands.push(EngineCommand::Release {
            voice_id: voice_id.to_string(),
            release,
        });
    }

    /// Graceful note-off for every active voice.
    pub fn release_all(&self) {
        let release = self.shared.params.lock().release as f32;
        self.shared
            .commands
            .push(EngineCommand::ReleaseAll { release });
    }

    /// Hard micro-fade cutoff for every active voice.
    pub fn silence_all(&self) {
        self.shared.commands.push(EngineCommand::SilenceAll);
    }

    // ------------------------------------------------------------------
    // Custom sample override
    // ------------------------------------------------------------------

    pub fn set_custom_sample(&self, buffer: Arc<SampleBuffer>, base_frequency: f64, looped: bool) {
        *self.shared.custom_sample.write() = Some(CustomSample {
            buffer,
            base_frequency: if base_frequency > 0.0 {
                base_frequency
            } else {
                261.63 // default to middle C
            },
            looped,
        });
        self.shared.notify();
    }

    pub fn clear_custom_sample(&self) {
        self.silence_all();
        *self.shared.custom_sample.write() = None;
        self.shared.notify();
    }

    pub fn has_custom_sample(&self) -> bool {
        self.shared.custom_sample.read().is_some()
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn start_recording(&self) {
        {
            let mut recorded = self.shared.recorded.lock();
            recorded.0.clear();
            recorded.1.clear();
        }
        self.shared.recording.store(true, Ordering::SeqCst);
        self.shared.notify();
        log::info!("recording started");
    }

    pub fn stop_recording(&self) {
        self.shared.recording.store(false, Ordering::SeqCst);
        self.shared.notify();
        log::info!("recording stopped");
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// Encode the captured master mix as a stereo WAV container.
    /// Returns `None` when nothing has been recorded.
    pub fn export_wav(&self) -> Option<Vec<u8>> {
        let recorded = self.shared.recorded.lock();
        if recorded.0.is_empty() {
            return None;
        }
        Some(encode_wav(
            &recorded.0,
            Some(&recorded.1),
            self.shared.sample_rate,
        ))
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Latest analysis-tap band magnitudes (0..1).
    pub fn spectrum_bands(&self) -> [f32; ANALYSIS_BANDS] {
        let mut bands = [0.0f32; ANALYSIS_BANDS];
        for (dst, slot) in bands.iter_mut().zip(&self.shared.spectrum_bands) {
            *dst = u32_to_f32(slot.load(Ordering::Relaxed));
        }
        bands
    }

    pub fn rendered_frames(&self) -> u64 {
        self.shared.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn active_voices(&self) -> usize {
        self.shared.osc_pool.lock().active_count() + self.shared.sample_pool.lock().active_count()
    }

    /// Render one interleaved block. Only meaningful for offline engines;
    /// a live engine's cpal callback does this on its own.
    pub fn render_block(&self, data: &mut [f32], channels: usize) {
        let mut scratch = Vec::with_capacity(COMMAND_QUEUE_CAPACITY);
        let mut counter = SPECTRUM_EVERY_BLOCKS; // analyze every offline block
        self.shared.render(data, channels, &mut scratch, &mut counter);
    }
}

/// The engine itself: shared state plus (for live engines) the output stream.
pub struct AudioEngine {
    _stream: Option<cpal::Stream>,
    handle: EngineHandle,
}

impl AudioEngine {
    /// Create a live engine on an output device and start the stream.
    pub fn start(device_name: Option<&str>, config: &AudioConfig) -> Result<Self, String> {
        let device = output_device(device_name)?;
        let stream_config = pick_stream_config(&device, config)?;
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "starting audio engine: {} Hz, {} channels",
            sample_rate,
            channels
        );

        let shared = Arc::new(SharedState::new(sample_rate));
        let render_shared = Arc::clone(&shared);
        let error_shared = Arc::clone(&shared);
        let mut scratch = Vec::with_capacity(COMMAND_QUEUE_CAPACITY);
        let mut spectrum_counter = 0u32;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render_shared.render(data, channels, &mut scratch, &mut spectrum_counter);
                },
                move |err| {
                    log::error!("audio stream error: {}", err);
                    *error_shared.last_error.lock() = Some(err.to_string());
                    error_shared.notify();
                },
                None,
            )
            .map_err(|e| format!("failed to build output stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("failed to start stream: {}", e))?;

        shared.ready.store(true, Ordering::SeqCst);
        shared.notify();

        Ok(Self {
            _stream: Some(stream),
            handle: EngineHandle { shared },
        })
    }

    /// Create an engine without an output device. Audio is produced by
    /// calling `EngineHandle::render_block`.
    pub fn offline(sample_rate: u32) -> Self {
        let shared = Arc::new(SharedState::new(sample_rate));
        shared.ready.store(true, Ordering::SeqCst);
        Self {
            _stream: None,
            handle: EngineHandle { shared },
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }
}

fn output_device(name: Option<&str>) -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => {
            let devices = host
                .output_devices()
                .map_err(|e| format!("failed to enumerate output devices: {}", e))?;
            for device in devices {
                if let Ok(name) = device.name() {
                    if name == wanted {
                        return Ok(device);
                    }
                }
            }
            Err(format!("output device '{}' not found", wanted))
        }
        None => host
            .default_output_device()
            .ok_or_else(|| "no default output device".to_string()),
    }
}

fn pick_stream_config(
    device: &cpal::Device,
    preferred: &AudioConfig,
) -> Result<cpal::StreamConfig, String> {
    let supported = device
        .supported_output_configs()
        .map_err(|e| format!("failed to query output configs: {}", e))?;

    for config in supported {
        let rate_ok = preferred.sample_rate >= config.min_sample_rate().0
            && preferred.sample_rate <= config.max_sample_rate().0;
        if rate_ok && config.channels() >= preferred.channels {
            return Ok(cpal::StreamConfig {
                channels: preferred.channels,
                sample_rate: cpal::SampleRate(preferred.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(preferred.buffer_size),
            });
        }
    }

    let default = device
        .default_output_config()
        .map_err(|e| format!("failed to get default output config: {}", e))?;
    Ok(cpal::StreamConfig {
        channels: default.channels().min(2),
        sample_rate: default.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    })
}

// ---------------------------------------------------------------------------
// Global engine
// ---------------------------------------------------------------------------

static ENGINE_HANDLE: once_cell::sync::OnceCell<RwLock<Option<EngineHandle>>> =
    once_cell::sync::OnceCell::new();

/// Initialize the global live engine. Safe to call again after a failure;
/// the engine simply stays unavailable until an attempt succeeds.
pub fn init_engine(device_name: Option<&str>, config: &AudioConfig) -> Result<(), String> {
    if let Some(cell) = ENGINE_HANDLE.get() {
        if cell.read().is_some() {
            log::debug!("audio engine already initialized");
            return Ok(());
        }
    }

    let engine = AudioEngine::start(device_name, config)?;
    let handle = engine.handle();

    let cell = ENGINE_HANDLE.get_or_init(|| RwLock::new(None));
    *cell.write() = Some(handle);

    // The stream must outlive this call; it lives for the process.
    std::mem::forget(engine);

    log::info!("audio engine initialized");
    Ok(())
}

/// Initialize the global engine in offline mode (no device).
pub fn init_offline_engine(sample_rate: u32) {
    let cell = ENGINE_HANDLE.get_or_init(|| RwLock::new(None));
    let mut slot = cell.write();
    if slot.is_none() {
        *slot = Some(AudioEngine::offline(sample_rate).handle());
        log::info!("offline audio engine initialized at {} Hz", sample_rate);
    }
}

pub fn get_engine_handle() -> Option<EngineHandle> {
    ENGINE_HANDLE.get().and_then(|cell| cell.read().clone())
}

/// Drop the global handle. A leaked live stream keeps running but renders
/// silence once every voice is released.
pub fn shutdown_engine() {
    if let Some(cell) = ENGINE_HANDLE.get() {
        if let Some(handle) = cell.read().as_ref() {
            handle.silence_all();
        }
        *cell.write() = None;
    }
}
