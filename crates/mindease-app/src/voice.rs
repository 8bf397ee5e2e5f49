//! Terminal stand-ins for the speech backends, and the glue between the chat
//! session and the voice coordinator.
//!
//! The terminal has no microphone: typed `/say` lines play the role of
//! recognised speech. Spoken replies are printed and "last" for a time
//! proportional to their length so the listen/speak loop behaves as it would
//! with real audio.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use mindease_chat::{BotMessageSink, ChatSession, SendOutcome};
use mindease_core::error::{MindeaseError, Result};
use mindease_core::types::Message;
use mindease_voice::{
    ConversationLink, MicrophonePermission, PermissionError, RecognizerEvent, SpeechRecognizer,
    SpeechSynthesizer, SynthEvent, Utterance, VoiceCoordinator, VoiceError,
};

/// Speaking time per word at rate 1.0.
const WORD_DURATION: Duration = Duration::from_millis(280);

/// Recognizer fed from typed lines.
#[derive(Default)]
pub struct TypedRecognizer {
    listening: Mutex<Option<mpsc::UnboundedSender<RecognizerEvent>>>,
}

impl TypedRecognizer {
    /// Deliver `text` as one finished utterance. Returns `false` when no
    /// capture session is open.
    pub fn say(&self, text: &str) -> bool {
        let Ok(mut listening) = self.listening.lock() else {
            return false;
        };
        let Some(tx) = listening.take() else {
            return false;
        };
        let _ = tx.send(RecognizerEvent::Result {
            text: text.to_string(),
            is_final: true,
        });
        let _ = tx.send(RecognizerEvent::Ended);
        true
    }

    pub fn is_listening(&self) -> bool {
        self.listening.lock().is_ok_and(|l| l.is_some())
    }
}

impl SpeechRecognizer for TypedRecognizer {
    fn start(
        &self,
        _language: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> std::result::Result<(), VoiceError> {
        let mut listening = self.listening.lock().map_err(|_| VoiceError::Closed)?;
        let _ = events.send(RecognizerEvent::Started);
        *listening = Some(events);
        Ok(())
    }

    fn stop(&self) {
        if let Some(tx) = self.listening.lock().ok().and_then(|mut l| l.take()) {
            let _ = tx.send(RecognizerEvent::Ended);
        }
    }

    fn abort(&self) {
        if let Ok(mut listening) = self.listening.lock() {
            listening.take();
        }
    }
}

/// Synthesizer that prints what it says.
#[derive(Default)]
pub struct ConsoleSynthesizer {
    current: Mutex<Option<Speaking>>,
}

struct Speaking {
    events: mpsc::UnboundedSender<SynthEvent>,
    timer: JoinHandle<()>,
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn speak(
        &self,
        utterance: Utterance,
        events: mpsc::UnboundedSender<SynthEvent>,
    ) -> std::result::Result<(), VoiceError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| VoiceError::Synthesis("synthesizer lock poisoned".to_string()))?;
        if let Some(previous) = current.take() {
            previous.timer.abort();
        }

        println!("(speaking) {}", utterance.text);
        let words = utterance.text.split_whitespace().count().max(1) as u32;
        let duration = WORD_DURATION
            .mul_f32(1.0 / utterance.rate.max(0.1))
            .saturating_mul(words);

        let _ = events.send(SynthEvent::Started);
        let done = events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = done.send(SynthEvent::Ended);
        });
        *current = Some(Speaking { events, timer });
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        debug!(volume, "Console volume");
    }

    fn pause(&self) {
        println!("(paused)");
    }

    fn resume(&self) {
        println!("(resumed)");
    }

    fn cancel(&self) {
        if let Some(speaking) = self.current.lock().ok().and_then(|mut c| c.take()) {
            speaking.timer.abort();
            let _ = speaking
                .events
                .send(SynthEvent::Error("interrupted".to_string()));
        }
    }
}

/// The terminal always has "microphone" access.
pub struct ConsolePermission;

#[async_trait]
impl MicrophonePermission for ConsolePermission {
    async fn request(&self) -> std::result::Result<(), PermissionError> {
        Ok(())
    }
}

/// Sends voice transcripts through the chat session.
pub struct SessionLink {
    session: Arc<ChatSession>,
}

impl SessionLink {
    pub fn new(session: Arc<ChatSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ConversationLink for SessionLink {
    fn is_connected(&self) -> bool {
        self.session.is_online()
    }

    async fn send_transcript(&self, text: &str) -> Result<()> {
        match self.session.send(text).await? {
            SendOutcome::Failed { local_id, .. } => Err(MindeaseError::Network(format!(
                "message {} was not delivered",
                local_id
            ))),
            _ => Ok(()),
        }
    }
}

/// Hands bot replies to the voice coordinator.
pub struct CoordinatorSink {
    coordinator: Arc<VoiceCoordinator>,
}

impl CoordinatorSink {
    pub fn new(coordinator: Arc<VoiceCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl BotMessageSink for CoordinatorSink {
    async fn on_bot_message(&self, message: Message) {
        self.coordinator.register_bot_message(&message);
    }
}
