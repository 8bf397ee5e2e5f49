//! Hands-free voice conversation coordinator.
//!
//! One actor task owns the capture adapter, the playback adapter and every
//! piece of loop state. Callers, capture events, playback events, the
//! restart timer and settings changes all arrive through its `select!`, so
//! each check-then-act happens within a single turn of the loop.
//!
//! The loop: listen, take the final transcript, either apply it as a voice
//! command or send it as a chat message, then listen again. Bot replies are
//! spoken while listening continues; detected speech ducks the reply.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use mindease_core::config::VoiceConfig;
use mindease_core::error::Result;
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{Message, Timestamp, VoiceConversationState};

use crate::capture::{CaptureAdapter, CaptureEvent, CaptureSettings, SpeechRecognizer};
use crate::commands::{classify, VoiceCommand};
use crate::error::VoiceError;
use crate::playback::{PlaybackAdapter, PlaybackEvent, PlaybackSettings, SpeechSynthesizer};
use crate::settings::{VoiceSettings, VoiceSettingsManager, VoiceSettingsUpdate};
use crate::vad::{EnergyVad, SpeechEdge, SpeechGate};

const MIN_SPEECH: Duration = Duration::from_millis(100);
const SPEECH_HANGOVER: Duration = Duration::from_millis(500);

/// Why the host refused microphone access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("microphone permission denied")]
    Denied,
    #[error("no microphone found")]
    NoDevice,
    #[error("microphone in use")]
    InUse,
    #[error("microphone access unsupported")]
    Unsupported,
    #[error("{0}")]
    Other(String),
}

impl PermissionError {
    /// What the user can do about it.
    pub fn guidance(&self) -> String {
        match self {
            PermissionError::Denied => {
                "Microphone access was denied. Allow microphone access for MindEase in your system settings, then start voice mode again.".to_string()
            }
            PermissionError::NoDevice => {
                "No microphone was found. Connect a microphone and try again.".to_string()
            }
            PermissionError::InUse => {
                "The microphone is being used by another application. Close it and try again.".to_string()
            }
            PermissionError::Unsupported => {
                "Voice input is not supported on this device. You can keep chatting by typing.".to_string()
            }
            PermissionError::Other(detail) => {
                format!("Could not access the microphone ({}). Check your audio settings and try again.", detail)
            }
        }
    }
}

/// Host microphone permission prompt.
#[async_trait]
pub trait MicrophonePermission: Send + Sync {
    async fn request(&self) -> std::result::Result<(), PermissionError>;
}

/// The chat conversation the coordinator talks into.
#[async_trait]
pub trait ConversationLink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn send_transcript(&self, text: &str) -> Result<()>;
}

/// External collaborators of the coordinator.
pub struct VoiceServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub permission: Arc<dyn MicrophonePermission>,
    pub link: Arc<dyn ConversationLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated,
    /// First use: activation waits for [`VoiceCoordinator::acknowledge_tutorial`].
    TutorialRequired,
    AlreadyActive,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSnapshot {
    pub state: VoiceConversationState,
    pub visible: bool,
    pub tutorial_pending: bool,
    pub consecutive_failures: u32,
    /// Transcript that could not be sent, kept for a manual retry.
    pub staged_transcript: Option<String>,
    pub last_bot_message: Option<String>,
    pub playback_volume: f32,
    pub speech_rate: f32,
}

enum Input {
    Activate(oneshot::Sender<std::result::Result<ActivationOutcome, VoiceError>>),
    AcknowledgeTutorial(oneshot::Sender<std::result::Result<ActivationOutcome, VoiceError>>),
    Deactivate {
        reason: String,
        reply: oneshot::Sender<Option<Duration>>,
    },
    BotMessage {
        id: Option<String>,
        text: String,
    },
    Visibility(bool),
    AudioFrame {
        samples: Vec<f32>,
        frame_len: Duration,
    },
    TranscriptSent {
        text: String,
        result: std::result::Result<(), String>,
    },
    Snapshot(oneshot::Sender<VoiceSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone)]
struct Timing {
    restart_delay: Duration,
    restart_delay_speaking: Duration,
    resume_delay: Duration,
    duck_factor: f32,
    max_failures: u32,
}

/// Handle to the coordinator actor.
pub struct VoiceCoordinator {
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<VoiceConversationState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceCoordinator {
    pub fn spawn(
        services: VoiceServices,
        settings: Arc<VoiceSettingsManager>,
        config: &VoiceConfig,
        events: EventBus,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VoiceConversationState::Inactive);

        let current = settings.current();
        let capture = CaptureAdapter::new(
            services.recognizer,
            CaptureSettings::from_config(config),
            capture_tx,
        );
        let playback = PlaybackAdapter::new(
            services.synthesizer,
            PlaybackSettings::from_config(config),
            current.speech_rate,
            current.volume,
            playback_tx,
        );
        playback.set_voice(current.selected_voice.clone());

        let actor = Actor {
            capture,
            playback,
            permission: services.permission,
            link: services.link,
            settings_rx: settings.subscribe(),
            settings,
            cooldown: Duration::from_millis(current.cooldown_period),
            gate: SpeechGate::new(
                EnergyVad::new(current.vad_threshold),
                MIN_SPEECH,
                SPEECH_HANGOVER,
            ),
            current,
            timing: Timing {
                restart_delay: Duration::from_millis(config.restart_delay_ms),
                restart_delay_speaking: Duration::from_millis(config.restart_delay_speaking_ms),
                resume_delay: Duration::from_millis(config.resume_delay_ms),
                duck_factor: config.duck_factor,
                max_failures: config.max_consecutive_failures,
            },
            events,
            state: state_tx,
            inbox_tx: inbox_tx.clone(),
            active: false,
            activated_at: None,
            tutorial_pending: false,
            visible: true,
            capture_session: None,
            transcribing: false,
            last_capture_start: None,
            restart_at: None,
            failures: 0,
            last_bot_text: None,
            last_spoken_id: None,
            staged: None,
        };
        let task = tokio::spawn(actor.run(inbox_rx, capture_rx, playback_rx));

        Self {
            inbox: inbox_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Input,
    ) -> std::result::Result<T, VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).map_err(|_| VoiceError::Closed)?;
        rx.await.map_err(|_| VoiceError::Closed)
    }

    /// Turn voice mode on. Requires input and output enabled, a connected
    /// chat and microphone permission.
    pub async fn activate(&self) -> std::result::Result<ActivationOutcome, VoiceError> {
        self.request(Input::Activate).await?
    }

    /// Record that the first-use tutorial was shown and finish activation.
    pub async fn acknowledge_tutorial(
        &self,
    ) -> std::result::Result<ActivationOutcome, VoiceError> {
        self.request(Input::AcknowledgeTutorial).await?
    }

    /// Turn voice mode off. Returns how long it was active, or `None` if it
    /// was not.
    pub async fn deactivate(
        &self,
        reason: &str,
    ) -> std::result::Result<Option<Duration>, VoiceError> {
        let reason = reason.to_string();
        self.request(|reply| Input::Deactivate { reason, reply }).await
    }

    /// Offer a bot reply for playback.
    pub fn register_bot_message(&self, message: &Message) {
        let id = (!message.id.is_empty()).then(|| message.id.clone());
        let _ = self.inbox.send(Input::BotMessage {
            id,
            text: message.content.clone(),
        });
    }

    /// Host surface shown or hidden.
    pub fn set_visible(&self, visible: bool) {
        let _ = self.inbox.send(Input::Visibility(visible));
    }

    /// Raw microphone frame for speech detection.
    pub fn feed_audio(&self, samples: Vec<f32>, frame_len: Duration) {
        let _ = self.inbox.send(Input::AudioFrame { samples, frame_len });
    }

    pub fn state(&self) -> VoiceConversationState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceConversationState> {
        self.state.clone()
    }

    pub async fn snapshot(&self) -> std::result::Result<VoiceSnapshot, VoiceError> {
        self.request(Input::Snapshot).await
    }

    /// Deactivate and stop the actor.
    pub async fn shutdown(&self) {
        let _ = self.inbox.send(Input::Shutdown);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Voice coordinator panicked");
            }
        }
    }
}

impl Drop for VoiceCoordinator {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Shutdown);
    }
}

struct Actor {
    capture: CaptureAdapter,
    playback: PlaybackAdapter,
    permission: Arc<dyn MicrophonePermission>,
    link: Arc<dyn ConversationLink>,
    settings: Arc<VoiceSettingsManager>,
    settings_rx: watch::Receiver<VoiceSettings>,
    current: VoiceSettings,
    cooldown: Duration,
    gate: SpeechGate<EnergyVad>,
    timing: Timing,
    events: EventBus,
    state: watch::Sender<VoiceConversationState>,
    inbox_tx: mpsc::UnboundedSender<Input>,

    active: bool,
    activated_at: Option<Instant>,
    tutorial_pending: bool,
    visible: bool,
    capture_session: Option<u64>,
    transcribing: bool,
    last_capture_start: Option<Instant>,
    restart_at: Option<Instant>,
    failures: u32,
    last_bot_text: Option<String>,
    last_spoken_id: Option<String>,
    staged: Option<String>,
}

impl Actor {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Input>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let mut settings_open = true;
        info!("Voice coordinator started");

        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                input = inbox.recv() => match input {
                    None | Some(Input::Shutdown) => break,
                    Some(input) => self.handle_input(input).await,
                },
                Some(event) = capture_rx.recv() => self.on_capture(event),
                Some(event) = playback_rx.recv() => self.on_playback(event),
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.try_start_capture();
                }
                changed = self.settings_rx.changed(), if settings_open => match changed {
                    Ok(()) => {
                        let next = self.settings_rx.borrow_and_update().clone();
                        self.apply_settings(next);
                    }
                    Err(_) => settings_open = false,
                },
            }
        }

        self.deactivate("shutdown");
        info!("Voice coordinator stopped");
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Activate(reply) => {
                let outcome = self.activate(false).await;
                let _ = reply.send(outcome);
            }
            Input::AcknowledgeTutorial(reply) => {
                if let Err(e) = self.settings.mark_tutorial_seen() {
                    warn!(error = %e, "Failed to persist tutorial flag");
                }
                let outcome = self.activate(true).await;
                let _ = reply.send(outcome);
            }
            Input::Deactivate { reason, reply } => {
                let _ = reply.send(self.deactivate(&reason));
            }
            Input::BotMessage { id, text } => self.register_bot_message(id, text),
            Input::Visibility(visible) => self.set_visible(visible),
            Input::AudioFrame { samples, frame_len } => {
                if self.active && self.visible {
                    if let Some(SpeechEdge::Started) = self.gate.push(&samples, frame_len) {
                        debug!("Speech detected");
                        self.duck_if_playing();
                    }
                }
            }
            Input::TranscriptSent { text, result } => match result {
                Ok(()) => {
                    if self.staged.as_deref() == Some(text.as_str()) {
                        self.staged = None;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Transcript could not be sent, staged for retry");
                    self.staged = Some(text.clone());
                    self.events.publish(ChatEvent::TranscriptStaged {
                        text,
                        timestamp: Timestamp::now(),
                    });
                }
            },
            Input::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Input::Shutdown => {}
        }
        self.settle();
    }

    async fn activate(
        &mut self,
        tutorial_acknowledged: bool,
    ) -> std::result::Result<ActivationOutcome, VoiceError> {
        if self.active {
            return Ok(ActivationOutcome::AlreadyActive);
        }
        if !self.current.voice_input_enabled {
            return Err(VoiceError::Unavailable("voice input is disabled".to_string()));
        }
        if !self.current.voice_output_enabled {
            return Err(VoiceError::Unavailable("voice output is disabled".to_string()));
        }
        if !self.link.is_connected() {
            return Err(VoiceError::Unavailable("chat is not connected".to_string()));
        }
        if let Err(e) = self.permission.request().await {
            warn!(error = %e, "Microphone permission refused");
            return Err(VoiceError::PermissionDenied(e.guidance()));
        }

        if !tutorial_acknowledged {
            let seen = self.settings.tutorial_seen().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read tutorial flag");
                false
            });
            if !seen {
                self.tutorial_pending = true;
                self.events.publish(ChatEvent::VoiceTutorialRequired {
                    timestamp: Timestamp::now(),
                });
                return Ok(ActivationOutcome::TutorialRequired);
            }
        }

        self.tutorial_pending = false;
        self.active = true;
        self.activated_at = Some(Instant::now());
        self.failures = 0;
        self.gate.reset();
        info!("Voice conversation activated");
        self.events.publish(ChatEvent::VoiceActivated {
            timestamp: Timestamp::now(),
        });
        self.try_start_capture();
        Ok(ActivationOutcome::Activated)
    }

    fn deactivate(&mut self, reason: &str) -> Option<Duration> {
        self.tutorial_pending = false;
        if !self.active {
            return None;
        }
        self.active = false;
        self.restart_at = None;
        self.capture_session = None;
        self.transcribing = false;
        self.capture.cancel();
        self.playback.stop();
        self.gate.reset();

        let elapsed = self
            .activated_at
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        info!(reason, duration_ms = elapsed.as_millis() as u64, "Voice conversation deactivated");
        self.events.publish(ChatEvent::VoiceDeactivated {
            duration_ms: elapsed.as_millis() as i64,
            reason: reason.to_string(),
            timestamp: Timestamp::now(),
        });
        self.settle();
        Some(elapsed)
    }

    fn set_visible(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;
        if !self.active {
            return;
        }
        if visible {
            debug!("Surface visible, resuming capture");
            self.schedule_restart(self.timing.resume_delay);
        } else {
            info!("Surface hidden, pausing voice loop");
            self.restart_at = None;
            self.capture_session = None;
            self.transcribing = false;
            self.capture.cancel();
            self.playback.stop();
            self.gate.reset();
        }
    }

    fn register_bot_message(&mut self, id: Option<String>, text: String) {
        if text.trim().is_empty() {
            return;
        }
        self.last_bot_text = Some(text.clone());
        if id.is_some() && id == self.last_spoken_id {
            debug!("Bot message already spoken");
            return;
        }
        if self.active && self.visible && self.current.voice_output_enabled {
            self.last_spoken_id = id;
            let segments = self.playback.speak(&text);
            debug!(segments, "Speaking bot reply");
        }
    }

    fn restart_delay(&self) -> Duration {
        if self.playback.is_playing() {
            self.timing.restart_delay_speaking
        } else {
            self.timing.restart_delay
        }
    }

    /// Arm the restart timer unless one is already pending.
    fn schedule_restart(&mut self, delay: Duration) {
        if self.restart_at.is_none() {
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    fn try_start_capture(&mut self) {
        if !self.active || !self.visible {
            return;
        }
        if self.capture.is_busy() || self.transcribing {
            debug!(phase = %self.capture.phase(), "Capture busy, restart skipped");
            return;
        }
        if let Some(last) = self.last_capture_start {
            let since = last.elapsed();
            if since < self.cooldown {
                self.schedule_restart(self.cooldown - since);
                return;
            }
        }

        match self.capture.start() {
            Ok(session) => {
                self.capture_session = Some(session);
                self.last_capture_start = Some(Instant::now());
                self.gate.reset();
            }
            Err(e) => {
                self.on_failure(e);
                // Keep retrying until the failure limit leaves voice mode.
                if self.active {
                    self.schedule_restart(self.restart_delay());
                }
            }
        }
    }

    fn duck_if_playing(&mut self) {
        if self.playback.is_playing() && self.playback.duck(self.timing.duck_factor) {
            info!(factor = self.timing.duck_factor, "Ducking playback for user speech");
        }
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        if self.capture_session != Some(event.session()) {
            debug!(session = event.session(), "Stale capture event dropped");
            return;
        }
        match event {
            CaptureEvent::Started { .. } => {}
            CaptureEvent::Interim { .. } => {
                self.transcribing = true;
                self.duck_if_playing();
            }
            CaptureEvent::Error { error, .. } => self.on_failure(error),
            CaptureEvent::Ended { transcript, .. } => {
                self.capture_session = None;
                self.transcribing = false;
                self.playback.restore();
                if self.active {
                    let transcript = transcript.trim().to_string();
                    if transcript.is_empty() {
                        self.schedule_restart(self.restart_delay());
                    } else {
                        self.failures = 0;
                        self.handle_transcript(transcript);
                    }
                }
            }
        }
        self.settle();
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => {}
            PlaybackEvent::Idle => {
                if self.active && !self.capture.is_busy() {
                    self.schedule_restart(self.timing.restart_delay);
                }
            }
            PlaybackEvent::Failed { error } => {
                self.on_failure(error);
                if self.active && !self.capture.is_busy() {
                    self.schedule_restart(self.timing.restart_delay);
                }
            }
        }
        self.settle();
    }

    fn on_failure(&mut self, error: VoiceError) {
        if let VoiceError::PermissionDenied(guidance) = &error {
            self.events.publish(ChatEvent::VoiceError {
                message: guidance.clone(),
                consecutive_failures: self.failures,
                timestamp: Timestamp::now(),
            });
            self.deactivate("microphone permission denied");
            return;
        }

        self.failures += 1;
        warn!(error = %error, failures = self.failures, "Speech service error");
        self.events.publish(ChatEvent::VoiceError {
            message: error.to_string(),
            consecutive_failures: self.failures,
            timestamp: Timestamp::now(),
        });
        if self.failures >= self.timing.max_failures {
            error!(failures = self.failures, "Too many speech errors, leaving voice mode");
            self.deactivate("too many speech errors");
        }
    }

    fn handle_transcript(&mut self, text: String) {
        match classify(&text) {
            Some(VoiceCommand::Stop) => {
                info!("Stop command received");
                self.deactivate("voice command");
            }
            Some(command) => {
                info!(%command, "Voice command");
                self.apply_command(command);
                self.events.publish(ChatEvent::VoiceCommand {
                    command: command.to_string(),
                    timestamp: Timestamp::now(),
                });
                self.schedule_restart(self.timing.resume_delay);
            }
            None => {
                debug!(chars = text.len(), "Sending transcript");
                let link = self.link.clone();
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    let result = link
                        .send_transcript(&text)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = inbox.send(Input::TranscriptSent { text, result });
                });
                self.schedule_restart(self.restart_delay());
            }
        }
    }

    fn apply_command(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::Stop => {}
            VoiceCommand::Pause => {
                self.playback.pause();
            }
            VoiceCommand::Resume => {
                self.playback.resume();
            }
            VoiceCommand::Repeat => match self.last_bot_text.clone() {
                Some(text) if self.current.voice_output_enabled => {
                    self.playback.speak(&text);
                }
                _ => debug!("Nothing to repeat"),
            },
            VoiceCommand::Slower | VoiceCommand::Faster => {
                if let Some(rate) = command.adjust_rate(self.playback.rate()) {
                    self.playback.set_rate(rate);
                    self.persist(VoiceSettingsUpdate {
                        speech_rate: Some(rate),
                        ..Default::default()
                    });
                }
            }
            VoiceCommand::Louder | VoiceCommand::Quieter => {
                if let Some(volume) = command.adjust_volume(self.playback.base_volume()) {
                    self.playback.set_volume(volume);
                    self.persist(VoiceSettingsUpdate {
                        volume: Some(volume),
                        ..Default::default()
                    });
                }
            }
        }
    }

    fn persist(&mut self, update: VoiceSettingsUpdate) {
        match self.settings.update(update) {
            Ok(saved) => self.current = saved,
            Err(e) => warn!(error = %e, "Failed to save voice settings"),
        }
    }

    fn apply_settings(&mut self, next: VoiceSettings) {
        self.playback.set_rate(next.speech_rate);
        self.playback.set_volume(next.volume);
        self.playback.set_voice(next.selected_voice.clone());
        self.gate.detector_mut().threshold = next.vad_threshold;
        self.cooldown = Duration::from_millis(next.cooldown_period);
        let disabled = !next.voice_input_enabled || !next.voice_output_enabled;
        self.current = next;
        if self.active && disabled {
            self.deactivate("voice disabled in settings");
        }
    }

    fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot {
            state: *self.state.borrow(),
            visible: self.visible,
            tutorial_pending: self.tutorial_pending,
            consecutive_failures: self.failures,
            staged_transcript: self.staged.clone(),
            last_bot_message: self.last_bot_text.clone(),
            playback_volume: self.playback.volume(),
            speech_rate: self.playback.rate(),
        }
    }

    /// Derive the public state from the loop state and publish changes.
    fn settle(&mut self) {
        let next = if !self.active {
            VoiceConversationState::Inactive
        } else if self.playback.is_playing() && self.playback.is_ducked() {
            VoiceConversationState::Ducked
        } else if self.transcribing {
            VoiceConversationState::Transcribing
        } else if self.playback.is_playing() {
            VoiceConversationState::Speaking
        } else {
            VoiceConversationState::Listening
        };

        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "Voice state");
        self.state.send_replace(next);
        self.events.publish(ChatEvent::VoiceStateChanged {
            state: next,
            timestamp: Timestamp::now(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
