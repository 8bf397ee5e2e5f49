//! Speech capture adapter.
//!
//! Wraps a callback-style recognizer in an explicit state machine:
//! - Idle -> Starting (start requested)
//! - Starting -> Active (recognizer reported start)
//! - Starting | Active -> Ending (graceful stop, silence or duration cap)
//! - any -> Idle (recognizer ended, or cancel)
//!
//! Each capture gets a session number. Every event carries it so the consumer
//! can drop events from a session it already cancelled.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use mindease_core::config::VoiceConfig;

use crate::error::VoiceError;

/// Raw notification from a recognizer backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Started,
    Result { text: String, is_final: bool },
    /// Backend error code (`no-speech`, `not-allowed`, `network`, ...).
    Error { code: String, message: String },
    Ended,
}

/// A speech-to-text backend.
///
/// `start` begins one recognition run that reports through `events` and must
/// eventually send [`RecognizerEvent::Ended`] (or drop the sender).
pub trait SpeechRecognizer: Send + Sync {
    fn start(
        &self,
        language: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<(), VoiceError>;

    /// Finish the current run, delivering any pending result.
    fn stop(&self);

    /// Drop the current run without results. Safe to call when idle.
    fn abort(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePhase {
    Idle,
    Starting,
    Active,
    Ending,
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePhase::Idle => write!(f, "Idle"),
            CapturePhase::Starting => write!(f, "Starting"),
            CapturePhase::Active => write!(f, "Active"),
            CapturePhase::Ending => write!(f, "Ending"),
        }
    }
}

impl CapturePhase {
    pub fn can_transition_to(&self, target: &CapturePhase) -> bool {
        matches!(
            (self, target),
            (CapturePhase::Idle, CapturePhase::Starting)
                | (CapturePhase::Starting, CapturePhase::Active)
                | (CapturePhase::Starting, CapturePhase::Ending)
                | (CapturePhase::Active, CapturePhase::Ending)
                // End and cancel
                | (CapturePhase::Starting, CapturePhase::Idle)
                | (CapturePhase::Active, CapturePhase::Idle)
                | (CapturePhase::Ending, CapturePhase::Idle)
        )
    }
}

/// Why a capture session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Silence,
    MaxDuration,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started {
        session: u64,
    },
    Interim {
        session: u64,
        text: String,
    },
    Error {
        session: u64,
        error: VoiceError,
    },
    /// Always the last event of a session. `transcript` joins every final
    /// result of the run and is empty when nothing was recognised.
    Ended {
        session: u64,
        reason: EndReason,
        transcript: String,
    },
}

impl CaptureEvent {
    pub fn session(&self) -> u64 {
        match self {
            CaptureEvent::Started { session }
            | CaptureEvent::Interim { session, .. }
            | CaptureEvent::Error { session, .. }
            | CaptureEvent::Ended { session, .. } => *session,
        }
    }
}

/// Guidance shown when the recognizer reports a blocked microphone.
pub const MICROPHONE_BLOCKED_GUIDANCE: &str =
    "Microphone access is blocked. Allow microphone access for MindEase in your system settings and try again.";

/// Map a recognizer error code. Expected codes (`aborted`, `no-speech`)
/// return `None` and are not reported.
pub fn map_recognizer_error(code: &str, message: &str) -> Option<VoiceError> {
    match code {
        "aborted" | "no-speech" => None,
        "not-allowed" | "service-not-allowed" => Some(VoiceError::PermissionDenied(
            MICROPHONE_BLOCKED_GUIDANCE.to_string(),
        )),
        "audio-capture" => Some(VoiceError::Recognition(
            "No microphone was found".to_string(),
        )),
        _ if message.is_empty() => Some(VoiceError::Recognition(code.to_string())),
        _ => Some(VoiceError::Recognition(format!("{}: {}", code, message))),
    }
}

/// Timeouts applied to every capture session.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub language: String,
    pub silence_timeout: Duration,
    pub max_duration: Duration,
}

impl CaptureSettings {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            language: config.language.clone(),
            silence_timeout: Duration::from_millis(config.silence_timeout_ms),
            max_duration: Duration::from_millis(config.max_duration_ms),
        }
    }
}

#[derive(Debug)]
struct CaptureState {
    phase: CapturePhase,
    session: u64,
}

impl CaptureState {
    fn transition(&mut self, target: CapturePhase) -> Result<(), VoiceError> {
        if !self.phase.can_transition_to(&target) {
            return Err(VoiceError::InvalidTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        debug!(from = %self.phase, to = %target, session = self.session, "Capture transition");
        self.phase = target;
        Ok(())
    }
}

/// One logical microphone.
pub struct CaptureAdapter {
    recognizer: Arc<dyn SpeechRecognizer>,
    settings: CaptureSettings,
    state: Arc<Mutex<CaptureState>>,
    output: mpsc::UnboundedSender<CaptureEvent>,
    pump: Option<JoinHandle<()>>,
}

impl CaptureAdapter {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        settings: CaptureSettings,
        output: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            recognizer,
            settings,
            state: Arc::new(Mutex::new(CaptureState {
                phase: CapturePhase::Idle,
                session: 0,
            })),
            output,
            pump: None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.state
            .lock()
            .map(|s| s.phase)
            .unwrap_or(CapturePhase::Idle)
    }

    /// Whether a session is starting, running or finishing.
    pub fn is_busy(&self) -> bool {
        self.phase() != CapturePhase::Idle
    }

    /// Begin a capture session and return its number.
    pub fn start(&mut self) -> Result<u64, VoiceError> {
        let session = {
            let mut state = self.state.lock().map_err(|_| VoiceError::Closed)?;
            state.transition(CapturePhase::Starting)?;
            state.session += 1;
            state.session
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .recognizer
            .start(&self.settings.language, tx)
        {
            if let Ok(mut state) = self.state.lock() {
                state.phase = CapturePhase::Idle;
            }
            warn!(session, error = %e, "Recognizer failed to start");
            return Err(e);
        }

        if let Some(old) = self.pump.take() {
            old.abort();
        }
        self.pump = Some(tokio::spawn(pump(
            session,
            rx,
            self.state.clone(),
            self.output.clone(),
            self.recognizer.clone(),
            self.settings.clone(),
        )));
        info!(session, "Capture started");
        Ok(session)
    }

    /// Ask the recognizer to finish. The session still ends with a transcript.
    pub fn stop(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.transition(CapturePhase::Ending).is_err() {
            return false;
        }
        drop(state);
        self.recognizer.stop();
        true
    }

    /// Abort the current session without a transcript. Idempotent.
    pub fn cancel(&mut self) -> bool {
        let session = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if state.phase == CapturePhase::Idle {
                return false;
            }
            state.phase = CapturePhase::Idle;
            state.session
        };

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.recognizer.abort();
        debug!(session, "Capture cancelled");
        let _ = self.output.send(CaptureEvent::Ended {
            session,
            reason: EndReason::Cancelled,
            transcript: String::new(),
        });
        true
    }
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            self.recognizer.abort();
        }
    }
}

/// Move the state to `Ending` and stop the recognizer, once.
fn request_stop(
    state: &Mutex<CaptureState>,
    recognizer: &dyn SpeechRecognizer,
    session: u64,
) -> bool {
    let Ok(mut guard) = state.lock() else {
        return false;
    };
    if guard.session != session || guard.transition(CapturePhase::Ending).is_err() {
        return false;
    }
    drop(guard);
    recognizer.stop();
    true
}

async fn pump(
    session: u64,
    mut raw: mpsc::UnboundedReceiver<RecognizerEvent>,
    state: Arc<Mutex<CaptureState>>,
    output: mpsc::UnboundedSender<CaptureEvent>,
    recognizer: Arc<dyn SpeechRecognizer>,
    settings: CaptureSettings,
) {
    let started_at = Instant::now();
    let mut silence_deadline = started_at + settings.silence_timeout;
    let max_deadline = started_at + settings.max_duration;
    let mut finals: Vec<String> = Vec::new();
    let mut reason = EndReason::Completed;
    let mut stopping = false;

    loop {
        tokio::select! {
            event = raw.recv() => match event {
                Some(RecognizerEvent::Started) => {
                    if let Ok(mut guard) = state.lock() {
                        if guard.session == session && guard.phase == CapturePhase::Starting {
                            let _ = guard.transition(CapturePhase::Active);
                        }
                    }
                    silence_deadline = Instant::now() + settings.silence_timeout;
                    let _ = output.send(CaptureEvent::Started { session });
                }
                Some(RecognizerEvent::Result { text, is_final }) => {
                    silence_deadline = Instant::now() + settings.silence_timeout;
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    if is_final {
                        finals.push(text);
                    } else {
                        let _ = output.send(CaptureEvent::Interim { session, text });
                    }
                }
                Some(RecognizerEvent::Error { code, message }) => {
                    match map_recognizer_error(&code, &message) {
                        None => debug!(session, code = %code, "Expected recognizer condition"),
                        Some(error) => {
                            warn!(session, code = %code, error = %error, "Recognizer error");
                            reason = EndReason::Error;
                            let _ = output.send(CaptureEvent::Error { session, error });
                        }
                    }
                }
                Some(RecognizerEvent::Ended) | None => break,
            },
            _ = sleep_until(silence_deadline), if !stopping => {
                debug!(session, "Silence timeout, stopping capture");
                reason = EndReason::Silence;
                stopping = request_stop(&state, recognizer.as_ref(), session);
            }
            _ = sleep_until(max_deadline), if !stopping => {
                debug!(session, "Maximum capture duration reached");
                reason = EndReason::MaxDuration;
                stopping = request_stop(&state, recognizer.as_ref(), session);
            }
        }
    }

    let current = match state.lock() {
        Ok(mut guard) if guard.session == session && guard.phase != CapturePhase::Idle => {
            guard.phase = CapturePhase::Idle;
            true
        }
        _ => false,
    };
    if !current {
        return;
    }

    let transcript = if reason == EndReason::Error {
        String::new()
    } else {
        finals.join(" ")
    };
    info!(
        session,
        ?reason,
        chars = transcript.len(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Capture ended"
    );
    let _ = output.send(CaptureEvent::Ended {
        session,
        reason,
        transcript,
    });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Recognizer whose event sender is exposed to the test.
    #[derive(Default)]
    struct ScriptedRecognizer {
        sender: Mutex<Option<mpsc::UnboundedSender<RecognizerEvent>>>,
        stops: Mutex<u32>,
        aborts: Mutex<u32>,
        fail_start: Mutex<Option<VoiceError>>,
    }

    impl ScriptedRecognizer {
        fn emit(&self, event: RecognizerEvent) {
            if let Some(tx) = self.sender.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn stops(&self) -> u32 {
            *self.stops.lock().unwrap()
        }
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn start(
            &self,
            _language: &str,
            events: mpsc::UnboundedSender<RecognizerEvent>,
        ) -> Result<(), VoiceError> {
            if let Some(e) = self.fail_start.lock().unwrap().take() {
                return Err(e);
            }
            *self.sender.lock().unwrap() = Some(events);
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
            // A real backend ends the run after a stop.
            self.emit(RecognizerEvent::Ended);
        }

        fn abort(&self) {
            *self.aborts.lock().unwrap() += 1;
            self.sender.lock().unwrap().take();
        }
    }

    fn adapter(
        recognizer: Arc<ScriptedRecognizer>,
    ) -> (CaptureAdapter, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = CaptureSettings {
            language: "en-US".to_string(),
            silence_timeout: Duration::from_secs(5),
            max_duration: Duration::from_secs(60),
        };
        (CaptureAdapter::new(recognizer, settings, tx), rx)
    }

    #[test]
    fn test_phase_transitions() {
        assert!(CapturePhase::Idle.can_transition_to(&CapturePhase::Starting));
        assert!(CapturePhase::Starting.can_transition_to(&CapturePhase::Active));
        assert!(CapturePhase::Active.can_transition_to(&CapturePhase::Ending));
        assert!(CapturePhase::Ending.can_transition_to(&CapturePhase::Idle));
        assert!(!CapturePhase::Idle.can_transition_to(&CapturePhase::Active));
        assert!(!CapturePhase::Active.can_transition_to(&CapturePhase::Starting));
        assert!(!CapturePhase::Ending.can_transition_to(&CapturePhase::Active));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(map_recognizer_error("aborted", ""), None);
        assert_eq!(map_recognizer_error("no-speech", ""), None);
        assert!(matches!(
            map_recognizer_error("not-allowed", ""),
            Some(VoiceError::PermissionDenied(_))
        ));
        assert!(matches!(
            map_recognizer_error("service-not-allowed", ""),
            Some(VoiceError::PermissionDenied(_))
        ));
        assert_eq!(
            map_recognizer_error("network", "offline"),
            Some(VoiceError::Recognition("network: offline".to_string()))
        );
    }

    #[tokio::test]
    async fn test_session_lifecycle_joins_finals() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());

        let session = capture.start().unwrap();
        assert_eq!(capture.phase(), CapturePhase::Starting);
        assert!(capture.start().is_err());

        recognizer.emit(RecognizerEvent::Started);
        assert_eq!(rx.recv().await, Some(CaptureEvent::Started { session }));
        assert_eq!(capture.phase(), CapturePhase::Active);

        recognizer.emit(RecognizerEvent::Result {
            text: "I feel".to_string(),
            is_final: false,
        });
        assert_eq!(
            rx.recv().await,
            Some(CaptureEvent::Interim {
                session,
                text: "I feel".to_string()
            })
        );

        recognizer.emit(RecognizerEvent::Result {
            text: "I feel calm".to_string(),
            is_final: true,
        });
        recognizer.emit(RecognizerEvent::Result {
            text: "today".to_string(),
            is_final: true,
        });
        recognizer.emit(RecognizerEvent::Ended);

        assert_eq!(
            rx.recv().await,
            Some(CaptureEvent::Ended {
                session,
                reason: EndReason::Completed,
                transcript: "I feel calm today".to_string(),
            })
        );
        assert_eq!(capture.phase(), CapturePhase::Idle);
        assert_eq!(capture.start().unwrap(), session + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_timeout_stops_capture() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());
        let session = capture.start().unwrap();
        recognizer.emit(RecognizerEvent::Started);
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(4000)).await;
        recognizer.emit(RecognizerEvent::Result {
            text: "hello".to_string(),
            is_final: true,
        });
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(recognizer.stops(), 0);

        let ended = rx.recv().await.unwrap();
        assert_eq!(
            ended,
            CaptureEvent::Ended {
                session,
                reason: EndReason::Silence,
                transcript: "hello".to_string(),
            }
        );
        assert_eq!(recognizer.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_caps_session() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = CaptureSettings {
            language: "en-US".to_string(),
            silence_timeout: Duration::from_secs(5),
            max_duration: Duration::from_secs(8),
        };
        let mut capture = CaptureAdapter::new(recognizer.clone(), settings, tx);
        capture.start().unwrap();
        recognizer.emit(RecognizerEvent::Started);
        rx.recv().await.unwrap();

        // Keep talking so silence never fires.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            recognizer.emit(RecognizerEvent::Result {
                text: "still talking".to_string(),
                is_final: false,
            });
        }

        let mut reason = None;
        while let Some(event) = rx.recv().await {
            if let CaptureEvent::Ended { reason: r, .. } = event {
                reason = Some(r);
                break;
            }
        }
        assert_eq!(reason, Some(EndReason::MaxDuration));
    }

    #[tokio::test]
    async fn test_expected_errors_are_suppressed() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());
        let session = capture.start().unwrap();

        recognizer.emit(RecognizerEvent::Error {
            code: "no-speech".to_string(),
            message: String::new(),
        });
        recognizer.emit(RecognizerEvent::Ended);

        assert_eq!(
            rx.recv().await,
            Some(CaptureEvent::Ended {
                session,
                reason: EndReason::Completed,
                transcript: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_unexpected_error_is_reported() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());
        let session = capture.start().unwrap();

        recognizer.emit(RecognizerEvent::Error {
            code: "not-allowed".to_string(),
            message: String::new(),
        });
        recognizer.emit(RecognizerEvent::Ended);

        match rx.recv().await {
            Some(CaptureEvent::Error {
                session: s,
                error: VoiceError::PermissionDenied(_),
            }) => assert_eq!(s, session),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(CaptureEvent::Ended {
                reason: EndReason::Error,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());
        let session = capture.start().unwrap();

        assert!(capture.cancel());
        assert!(!capture.cancel());
        assert_eq!(capture.phase(), CapturePhase::Idle);
        assert_eq!(*recognizer.aborts.lock().unwrap(), 1);
        assert_eq!(
            rx.recv().await,
            Some(CaptureEvent::Ended {
                session,
                reason: EndReason::Cancelled,
                transcript: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (mut capture, mut rx) = adapter(recognizer.clone());
        assert!(!capture.stop());

        let session = capture.start().unwrap();
        recognizer.emit(RecognizerEvent::Result {
            text: "done".to_string(),
            is_final: true,
        });
        assert!(capture.stop());
        assert_eq!(
            rx.recv().await,
            Some(CaptureEvent::Ended {
                session,
                reason: EndReason::Completed,
                transcript: "done".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_start_failure_returns_to_idle() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        *recognizer.fail_start.lock().unwrap() =
            Some(VoiceError::Unavailable("no recognizer".to_string()));
        let (mut capture, _rx) = adapter(recognizer);

        assert!(capture.start().is_err());
        assert_eq!(capture.phase(), CapturePhase::Idle);
        assert!(capture.start().is_ok());
    }
}
