//! Line-oriented terminal front end.
//!
//! Plain lines are sent as chat messages; lines starting with `/` are
//! commands. Store and voice events are printed as they arrive.

use std::sync::Arc;

use chrono::{Local, TimeZone};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use mindease_chat::{ChatSession, ConnectionManager, HistoryOutcome, SendOutcome};
use mindease_core::error::Result;
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{Message, Timestamp};
use mindease_voice::{ActivationOutcome, VoiceCoordinator};

use crate::voice::TypedRecognizer;

/// Content height reported to the paginator. The terminal has no scroll
/// position to restore, so any constant works.
const TERMINAL_CONTENT_HEIGHT: f64 = 0.0;

const HELP: &str = "\
commands:
  /older            load an older page of history
  /retry <id>       resend a failed message
  /status           connection, queue and voice status
  /voice on|off|ok  start or stop voice mode, ok confirms the tutorial
  /say <text>       speak <text> while voice mode is listening
  /hide, /show      simulate the window going to the background and back
  /quit             disconnect and exit";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Send(String),
    Older,
    Retry(String),
    Status,
    VoiceOn,
    VoiceOff,
    VoiceAcknowledge,
    Say(String),
    Hide,
    Show,
    Help,
    Quit,
    Empty,
}

impl ReplCommand {
    /// Parse one input line. Unknown commands are reported as errors.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ReplCommand::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(ReplCommand::Send(line.to_string()));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("older", _) => Ok(ReplCommand::Older),
            ("retry", "") => Err("usage: /retry <id>".to_string()),
            ("retry", id) => Ok(ReplCommand::Retry(id.to_string())),
            ("status", _) => Ok(ReplCommand::Status),
            ("voice", "on") => Ok(ReplCommand::VoiceOn),
            ("voice", "off") => Ok(ReplCommand::VoiceOff),
            ("voice", "ok") => Ok(ReplCommand::VoiceAcknowledge),
            ("voice", _) => Err("usage: /voice on|off|ok".to_string()),
            ("say", "") => Err("usage: /say <text>".to_string()),
            ("say", text) => Ok(ReplCommand::Say(text.to_string())),
            ("hide", _) => Ok(ReplCommand::Hide),
            ("show", _) => Ok(ReplCommand::Show),
            ("help", _) => Ok(ReplCommand::Help),
            ("quit" | "exit", _) => Ok(ReplCommand::Quit),
            (other, _) => Err(format!("unknown command /{} (try /help)", other)),
        }
    }
}

/// Everything the front end talks to.
pub struct Repl {
    pub session: Arc<ChatSession>,
    pub connection: Arc<ConnectionManager>,
    pub voice: Arc<VoiceCoordinator>,
    pub recognizer: Arc<TypedRecognizer>,
}

impl Repl {
    /// Read stdin until EOF or `/quit`.
    pub async fn run(&self) -> Result<()> {
        println!("{}", HELP);
        self.print_transcript();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match ReplCommand::parse(&line) {
                Ok(ReplCommand::Quit) => break,
                Ok(command) => {
                    if let Err(e) = self.execute(command).await {
                        println!("! {}", e);
                    }
                }
                Err(usage) => println!("! {}", usage),
            }
        }
        Ok(())
    }

    async fn execute(&self, command: ReplCommand) -> Result<()> {
        match command {
            ReplCommand::Empty | ReplCommand::Quit => {}
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Send(text) => match self.session.send(&text).await? {
                SendOutcome::Ignored => {}
                SendOutcome::Queued { queue_id } => {
                    println!("(offline, queued as {})", queue_id);
                }
                // The reply is printed from the MessageAdded event.
                SendOutcome::Delivered { .. } => {}
                SendOutcome::Failed { local_id, .. } => {
                    println!("(not delivered, /retry {} to resend)", local_id);
                }
            },
            ReplCommand::Retry(id) => match self.session.retry(&id).await? {
                SendOutcome::Delivered { .. } => println!("(delivered)"),
                SendOutcome::Queued { queue_id } => println!("(offline, queued as {})", queue_id),
                SendOutcome::Failed { local_id, .. } => println!("(still failing: {})", local_id),
                SendOutcome::Ignored => println!("(nothing to retry for {})", id),
            },
            ReplCommand::Older => {
                match self
                    .session
                    .history()
                    .load_older(TERMINAL_CONTENT_HEIGHT)
                    .await?
                {
                    HistoryOutcome::Skipped => println!("(no older messages)"),
                    HistoryOutcome::Loaded { added, .. } => {
                        let messages = self.session.store().messages();
                        for message in messages.iter().take(added) {
                            print_message(message);
                        }
                    }
                }
            }
            ReplCommand::Status => self.print_status().await?,
            ReplCommand::VoiceOn => match self.voice.activate().await? {
                ActivationOutcome::Activated => println!("(voice on)"),
                ActivationOutcome::AlreadyActive => println!("(voice already on)"),
                ActivationOutcome::TutorialRequired => println!(
                    "(first time: voice mode listens and speaks replies aloud; /voice ok to continue)"
                ),
            },
            ReplCommand::VoiceAcknowledge => match self.voice.acknowledge_tutorial().await? {
                ActivationOutcome::Activated => println!("(voice on)"),
                _ => println!("(nothing to confirm)"),
            },
            ReplCommand::VoiceOff => match self.voice.deactivate("user").await? {
                Some(duration) => println!("(voice off after {}s)", duration.as_secs()),
                None => println!("(voice already off)"),
            },
            ReplCommand::Say(text) => {
                if !self.recognizer.say(&text) {
                    println!("(not listening right now)");
                }
            }
            ReplCommand::Hide => self.voice.set_visible(false),
            ReplCommand::Show => self.voice.set_visible(true),
        }
        Ok(())
    }

    fn print_transcript(&self) {
        for message in self.session.store().messages() {
            print_message(&message);
        }
    }

    async fn print_status(&self) -> Result<()> {
        let status = self.connection.status();
        let queued = self.session.queue().len()?;
        let voice = self.voice.snapshot().await?;

        println!("connection: {} (failed attempts: {})", status.state, status.attempts);
        if let Some(ms) = status.next_retry_ms {
            println!("next retry: {} ms", ms);
        }
        println!("offline queue: {} pending", queued);
        println!(
            "voice: {} (failures: {}, volume: {:.2}, rate: {:.2})",
            voice.state, voice.consecutive_failures, voice.playback_volume, voice.speech_rate
        );
        if let Some(text) = voice.staged_transcript {
            println!("unsent transcript: {}", text);
        }
        Ok(())
    }
}

/// Print chat events that matter to a person at the terminal.
pub fn spawn_event_printer(events: &EventBus, session: Arc<ChatSession>) -> JoinHandle<()> {
    let mut stream = BroadcastStream::new(events.subscribe());
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, "Event printer lagged");
                    continue;
                }
            };
            if let Some(line) = describe(&event, &session) {
                println!("[{}] {}", clock(event.timestamp()), line);
            }
        }
    })
}

fn describe(event: &ChatEvent, session: &ChatSession) -> Option<String> {
    match event {
        ChatEvent::MessageAdded {
            message_id,
            is_user_message: false,
            ..
        } => session
            .store()
            .get(message_id)
            .map(|m| format!("bot: {}", m.content)),
        ChatEvent::ConnectionStateChanged { state, .. } => Some(format!("connection {}", state)),
        ChatEvent::ReconnectScheduled {
            attempt, delay_ms, ..
        } => Some(format!("reconnecting in {} ms (attempt {})", delay_ms, attempt)),
        ChatEvent::SessionUnauthenticated { reason, .. } => {
            Some(format!("signed out: {}", reason))
        }
        ChatEvent::TypingChanged { is_typing: true, .. } => Some("bot is typing...".to_string()),
        ChatEvent::QueueFlushed { sent, pending, .. } => Some(format!(
            "sent {} queued message(s), {} still pending",
            sent, pending
        )),
        ChatEvent::HistoryFailed { error, .. } => Some(format!("history unavailable: {}", error)),
        ChatEvent::SendFailed { message_id, error, .. } => {
            Some(format!("send failed ({}): {}", message_id, error))
        }
        ChatEvent::VoiceStateChanged { state, .. } => Some(format!("voice {}", state)),
        ChatEvent::VoiceError { message, .. } => Some(format!("voice error: {}", message)),
        ChatEvent::VoiceCommand { command, .. } => Some(format!("voice command: {}", command)),
        ChatEvent::TranscriptStaged { text, .. } => {
            Some(format!("could not send \"{}\", type it to retry", text))
        }
        _ => None,
    }
}

fn print_message(message: &Message) {
    let who = if message.is_user_message { "you" } else { "bot" };
    println!("{}: {}", who, message.content);
}

fn clock(timestamp: Timestamp) -> String {
    match Local.timestamp_millis_opt(timestamp.0).single() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => "--:--:--".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text_is_send() {
        assert_eq!(
            ReplCommand::parse("  hello there "),
            Ok(ReplCommand::Send("hello there".to_string()))
        );
        assert_eq!(ReplCommand::parse("   "), Ok(ReplCommand::Empty));
    }

    #[test]
    fn test_parse_commands_with_arguments() {
        assert_eq!(
            ReplCommand::parse("/retry local-42"),
            Ok(ReplCommand::Retry("local-42".to_string()))
        );
        assert_eq!(
            ReplCommand::parse("/say  I feel calmer today"),
            Ok(ReplCommand::Say("I feel calmer today".to_string()))
        );
        assert_eq!(ReplCommand::parse("/voice on"), Ok(ReplCommand::VoiceOn));
        assert_eq!(ReplCommand::parse("/voice ok"), Ok(ReplCommand::VoiceAcknowledge));
        assert_eq!(ReplCommand::parse("/exit"), Ok(ReplCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_usage() {
        assert!(ReplCommand::parse("/retry").is_err());
        assert!(ReplCommand::parse("/say").is_err());
        assert!(ReplCommand::parse("/voice maybe").is_err());
        assert!(ReplCommand::parse("/dance").is_err());
    }

    #[test]
    fn test_clock_formats_time() {
        let formatted = clock(Timestamp::now());
        assert_eq!(formatted.len(), 8);
        assert_eq!(formatted.matches(':').count(), 2);
    }
}
