//! MindEase voice crate - hands-free voice conversation on top of the chat.
//!
//! Wraps speech recognition and synthesis backends in explicit state-machine
//! adapters and ties them together in a coordinator that listens, sends
//! transcripts, speaks bot replies and ducks playback while the user talks.

pub mod capture;
pub mod commands;
pub mod coordinator;
pub mod error;
pub mod playback;
pub mod settings;
pub mod text;
pub mod vad;

pub use capture::{
    CaptureAdapter, CaptureEvent, CapturePhase, EndReason, RecognizerEvent, SpeechRecognizer,
};
pub use commands::{classify, VoiceCommand};
pub use coordinator::{
    ActivationOutcome, ConversationLink, MicrophonePermission, PermissionError, VoiceCoordinator,
    VoiceServices, VoiceSnapshot,
};
pub use error::VoiceError;
pub use playback::{PlaybackAdapter, PlaybackEvent, SpeechSynthesizer, SynthEvent, Utterance};
pub use settings::{VoiceSettings, VoiceSettingsManager, VoiceSettingsUpdate};
pub use text::split_for_speech;
pub use vad::{EnergyVad, SpeechEdge, SpeechGate, VadResult, VoiceActivityDetector};
