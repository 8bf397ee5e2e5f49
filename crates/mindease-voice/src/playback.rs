//! Speech playback adapter.
//!
//! Owns one logical speaker. Text is split into segments and played in order
//! by a worker task; a segment that does not start within the load timeout
//! fails the whole queue. `stop` interrupts the current segment and clears
//! the queue.
//!
//! Ducking lowers the volume of whatever is playing without stopping it. The
//! pre-duck volume is captured once, so any number of duck/restore cycles
//! end at exactly the original level.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mindease_core::config::VoiceConfig;

use crate::error::VoiceError;
use crate::text::split_for_speech;

/// One segment handed to the synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub rate: f32,
    pub volume: f32,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthEvent {
    Started,
    Ended,
    /// Backend error code. `interrupted` and `canceled` follow a cancel.
    Error(String),
}

/// A text-to-speech backend.
pub trait SpeechSynthesizer: Send + Sync {
    fn speak(
        &self,
        utterance: Utterance,
        events: mpsc::UnboundedSender<SynthEvent>,
    ) -> Result<(), VoiceError>;

    /// Change the volume of the utterance in progress.
    fn set_volume(&self, volume: f32);

    fn pause(&self);

    fn resume(&self);

    /// Drop the utterance in progress. Safe to call when idle.
    fn cancel(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// A segment started playing.
    Started,
    /// The queue drained.
    Idle,
    /// A segment failed; the rest of the queue was dropped.
    Failed { error: VoiceError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackPhase {
    Idle,
    Starting,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy)]
struct Duck {
    original: f32,
    factor: f32,
}

#[derive(Debug)]
struct PlaybackState {
    phase: PlaybackPhase,
    queue: VecDeque<String>,
    rate: f32,
    volume: f32,
    voice: Option<String>,
    duck: Option<Duck>,
    generation: u64,
}

impl PlaybackState {
    fn effective_volume(&self) -> f32 {
        match self.duck {
            Some(duck) => self.volume * duck.factor,
            None => self.volume,
        }
    }
}

struct Shared {
    state: Mutex<PlaybackState>,
    wake: Notify,
    generation: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> Option<MutexGuard<'_, PlaybackState>> {
        self.state.lock().ok()
    }
}

/// Timing applied by the worker.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub max_chunk_chars: usize,
    pub start_timeout: Duration,
    pub segment_gap: Duration,
}

impl PlaybackSettings {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            max_chunk_chars: config.max_chunk_chars,
            start_timeout: Duration::from_millis(config.playback_timeout_ms),
            segment_gap: Duration::from_millis(config.segment_gap_ms),
        }
    }
}

pub struct PlaybackAdapter {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    shared: Arc<Shared>,
    max_chunk_chars: usize,
    worker: JoinHandle<()>,
}

impl PlaybackAdapter {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        settings: PlaybackSettings,
        rate: f32,
        volume: f32,
        output: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        let (generation, generation_rx) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState {
                phase: PlaybackPhase::Idle,
                queue: VecDeque::new(),
                rate,
                volume: volume.clamp(0.0, 1.0),
                voice: None,
                duck: None,
                generation: 0,
            }),
            wake: Notify::new(),
            generation,
        });
        let worker = tokio::spawn(run_worker(
            shared.clone(),
            synthesizer.clone(),
            generation_rx,
            settings.clone(),
            output,
        ));
        Self {
            synthesizer,
            shared,
            max_chunk_chars: settings.max_chunk_chars,
            worker,
        }
    }

    /// Replace anything playing or queued with `text`. Returns the number of
    /// segments queued.
    pub fn speak(&self, text: &str) -> usize {
        self.stop_playback();
        self.enqueue(text)
    }

    /// Queue `text` after whatever is already playing.
    pub fn enqueue(&self, text: &str) -> usize {
        let segments = split_for_speech(text, self.max_chunk_chars);
        let count = segments.len();
        if count == 0 {
            return 0;
        }
        if let Some(mut state) = self.shared.lock() {
            state.queue.extend(segments);
            if state.phase == PlaybackPhase::Idle {
                state.phase = PlaybackPhase::Starting;
            }
        }
        self.shared.wake.notify_one();
        debug!(segments = count, "Playback queued");
        count
    }

    /// Interrupt playback, clear the queue and undo any ducking.
    pub fn stop(&self) {
        self.stop_playback();
        self.restore();
    }

    fn stop_playback(&self) {
        let was_playing = match self.shared.lock() {
            Some(mut state) => {
                let was_playing = state.phase != PlaybackPhase::Idle;
                state.queue.clear();
                state.phase = PlaybackPhase::Idle;
                state.generation += 1;
                self.shared.generation.send_replace(state.generation);
                was_playing
            }
            None => false,
        };
        if was_playing {
            self.synthesizer.cancel();
            debug!("Playback stopped");
        }
    }

    pub fn pause(&self) -> bool {
        let Some(mut state) = self.shared.lock() else {
            return false;
        };
        if state.phase != PlaybackPhase::Playing {
            return false;
        }
        state.phase = PlaybackPhase::Paused;
        drop(state);
        self.synthesizer.pause();
        true
    }

    pub fn resume(&self) -> bool {
        let Some(mut state) = self.shared.lock() else {
            return false;
        };
        if state.phase != PlaybackPhase::Paused {
            return false;
        }
        state.phase = PlaybackPhase::Playing;
        drop(state);
        self.synthesizer.resume();
        true
    }

    /// Playing, paused, or with segments waiting.
    pub fn is_playing(&self) -> bool {
        self.shared
            .lock()
            .is_some_and(|s| s.phase != PlaybackPhase::Idle)
    }

    pub fn is_paused(&self) -> bool {
        self.shared
            .lock()
            .is_some_and(|s| s.phase == PlaybackPhase::Paused)
    }

    pub fn is_ducked(&self) -> bool {
        self.shared.lock().is_some_and(|s| s.duck.is_some())
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Volume currently applied, including ducking.
    pub fn volume(&self) -> f32 {
        self.shared
            .lock()
            .map(|s| s.effective_volume())
            .unwrap_or(0.0)
    }

    /// Volume before ducking.
    pub fn base_volume(&self) -> f32 {
        self.shared
            .lock()
            .map(|s| s.duck.map(|d| d.original).unwrap_or(s.volume))
            .unwrap_or(0.0)
    }

    pub fn rate(&self) -> f32 {
        self.shared.lock().map(|s| s.rate).unwrap_or(1.0)
    }

    /// Applies to the next segment.
    pub fn set_rate(&self, rate: f32) {
        if let Some(mut state) = self.shared.lock() {
            state.rate = rate;
        }
    }

    pub fn set_voice(&self, voice: Option<String>) {
        if let Some(mut state) = self.shared.lock() {
            state.voice = voice;
        }
    }

    /// Set the undocked volume. While ducked the new level becomes the level
    /// restored later.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let effective = match self.shared.lock() {
            Some(mut state) => {
                state.volume = volume;
                if let Some(duck) = state.duck.as_mut() {
                    duck.original = volume;
                }
                state.effective_volume()
            }
            None => return,
        };
        self.synthesizer.set_volume(effective);
    }

    /// Lower the volume to `factor` of the original. Returns `true` when this
    /// call started the duck.
    pub fn duck(&self, factor: f32) -> bool {
        let effective = match self.shared.lock() {
            Some(mut state) => {
                if state.duck.is_some() {
                    return false;
                }
                state.duck = Some(Duck {
                    original: state.volume,
                    factor: factor.clamp(0.0, 1.0),
                });
                state.effective_volume()
            }
            None => return false,
        };
        self.synthesizer.set_volume(effective);
        debug!(volume = effective, "Playback ducked");
        true
    }

    /// Return to the pre-duck volume. Returns `true` if a duck was undone.
    pub fn restore(&self) -> bool {
        let original = match self.shared.lock() {
            Some(mut state) => match state.duck.take() {
                Some(duck) => {
                    state.volume = duck.original;
                    duck.original
                }
                None => return false,
            },
            None => return false,
        };
        self.synthesizer.set_volume(original);
        debug!(volume = original, "Playback volume restored");
        true
    }
}

impl Drop for PlaybackAdapter {
    fn drop(&mut self) {
        self.worker.abort();
        self.synthesizer.cancel();
    }
}

enum SegmentEnd {
    Finished,
    Interrupted,
    Failed(VoiceError),
}

/// Resolves once `stop` has moved past `generation`.
async fn interrupted(rx: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *rx.borrow_and_update() != generation {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn synth_error(code: String) -> SegmentEnd {
    match code.as_str() {
        "interrupted" | "canceled" => SegmentEnd::Interrupted,
        _ => SegmentEnd::Failed(VoiceError::Synthesis(code)),
    }
}

async fn wait_started(rx: &mut mpsc::UnboundedReceiver<SynthEvent>) -> Option<SegmentEnd> {
    match rx.recv().await {
        Some(SynthEvent::Started) => None,
        // Backends may skip the start notification for very short text.
        Some(SynthEvent::Ended) => Some(SegmentEnd::Finished),
        Some(SynthEvent::Error(code)) => Some(synth_error(code)),
        None => Some(SegmentEnd::Failed(VoiceError::Synthesis(
            "synthesizer closed".to_string(),
        ))),
    }
}

async fn wait_ended(rx: &mut mpsc::UnboundedReceiver<SynthEvent>) -> SegmentEnd {
    loop {
        match rx.recv().await {
            Some(SynthEvent::Started) => continue,
            Some(SynthEvent::Ended) | None => return SegmentEnd::Finished,
            Some(SynthEvent::Error(code)) => return synth_error(code),
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    mut generation_rx: watch::Receiver<u64>,
    settings: PlaybackSettings,
    output: mpsc::UnboundedSender<PlaybackEvent>,
) {
    loop {
        let next = shared.lock().and_then(|mut state| {
            let text = state.queue.pop_front()?;
            Some((
                Utterance {
                    text,
                    rate: state.rate,
                    volume: state.effective_volume(),
                    voice: state.voice.clone(),
                },
                state.generation,
            ))
        });
        let Some((utterance, generation)) = next else {
            shared.wake.notified().await;
            continue;
        };

        let chars = utterance.text.chars().count();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let end = match synthesizer.speak(utterance, tx) {
            Err(e) => SegmentEnd::Failed(e),
            Ok(()) => {
                let started = tokio::select! {
                    _ = interrupted(&mut generation_rx, generation) => Some(SegmentEnd::Interrupted),
                    r = tokio::time::timeout(settings.start_timeout, wait_started(&mut rx)) => match r {
                        Ok(early) => early,
                        Err(_) => {
                            synthesizer.cancel();
                            Some(SegmentEnd::Failed(VoiceError::PlaybackTimeout(
                                settings.start_timeout.as_millis() as u64,
                            )))
                        }
                    },
                };
                match started {
                    Some(end) => end,
                    None => {
                        let current = shared.lock().is_some_and(|mut state| {
                            if state.generation != generation {
                                return false;
                            }
                            if state.phase == PlaybackPhase::Starting {
                                state.phase = PlaybackPhase::Playing;
                            }
                            true
                        });
                        if current {
                            debug!(chars, "Playback segment started");
                            let _ = output.send(PlaybackEvent::Started);
                        }
                        tokio::select! {
                            _ = interrupted(&mut generation_rx, generation) => SegmentEnd::Interrupted,
                            end = wait_ended(&mut rx) => end,
                        }
                    }
                }
            }
        };

        match end {
            SegmentEnd::Interrupted => {
                debug!("Playback segment interrupted");
            }
            SegmentEnd::Finished => {
                let drained = shared.lock().is_some_and(|mut state| {
                    if state.generation != generation {
                        return false;
                    }
                    if state.queue.is_empty() {
                        state.phase = PlaybackPhase::Idle;
                        return true;
                    }
                    state.phase = PlaybackPhase::Starting;
                    false
                });
                if drained {
                    info!("Playback finished");
                    let _ = output.send(PlaybackEvent::Idle);
                } else {
                    tokio::time::sleep(settings.segment_gap).await;
                }
            }
            SegmentEnd::Failed(error) => {
                let current = shared.lock().is_some_and(|mut state| {
                    if state.generation != generation {
                        return false;
                    }
                    state.queue.clear();
                    state.phase = PlaybackPhase::Idle;
                    true
                });
                if current {
                    warn!(error = %error, "Playback failed");
                    let _ = output.send(PlaybackEvent::Failed { error });
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
