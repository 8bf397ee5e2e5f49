use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ConnectionState, DeliveryStatus, Timestamp, VoiceConversationState};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// All events emitted by the transport and voice layer.
///
/// Events are the only way components surface non-fatal conditions
/// (reconnect attempts, queued counts, voice failures) to the front end.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ChatEvent {
    // =========================================================================
    // Message Store Events
    // =========================================================================
    /// A message was admitted to the store.
    MessageAdded {
        message_id: String,
        is_user_message: bool,
        timestamp: Timestamp,
    },

    /// An inbound message was recognised as a duplicate and dropped.
    DuplicateSkipped {
        message_id: String,
        timestamp: Timestamp,
    },

    /// The store exceeded its bound and dropped its oldest entries.
    MessagesTrimmed { removed: usize, timestamp: Timestamp },

    /// A message changed delivery status.
    StatusChanged {
        message_id: String,
        status: DeliveryStatus,
        timestamp: Timestamp,
    },

    // =========================================================================
    // History Events
    // =========================================================================
    /// A history page was merged into the store.
    HistoryLoaded {
        page: u32,
        added: usize,
        has_more: bool,
        timestamp: Timestamp,
    },

    /// A history fetch failed. No automatic retry follows.
    HistoryFailed { error: String, timestamp: Timestamp },

    // =========================================================================
    // Connection Events
    // =========================================================================
    /// The push connection changed state.
    ConnectionStateChanged {
        state: ConnectionState,
        timestamp: Timestamp,
    },

    /// A reconnect was scheduled after a failure.
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
        timestamp: Timestamp,
    },

    /// Expired credentials were replaced and the connection is being reopened.
    CredentialsRefreshed { timestamp: Timestamp },

    /// Credential refresh failed; the session must sign in again.
    SessionUnauthenticated { reason: String, timestamp: Timestamp },

    /// The peer started or stopped typing.
    TypingChanged { is_typing: bool, timestamp: Timestamp },

    // =========================================================================
    // Offline Queue Events
    // =========================================================================
    /// A message was queued while offline.
    MessageQueued {
        queue_id: String,
        pending: usize,
        timestamp: Timestamp,
    },

    /// The offline queue was replayed.
    QueueFlushed {
        sent: usize,
        pending: usize,
        timestamp: Timestamp,
    },

    /// A send failed; the text is kept for manual retry.
    SendFailed {
        message_id: String,
        error: String,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Voice Events
    // =========================================================================
    /// The voice conversation coordinator changed state.
    VoiceStateChanged {
        state: VoiceConversationState,
        timestamp: Timestamp,
    },

    /// Voice mode was switched on.
    VoiceActivated { timestamp: Timestamp },

    /// Voice mode was switched off.
    VoiceDeactivated {
        duration_ms: i64,
        reason: String,
        timestamp: Timestamp,
    },

    /// Activation is waiting on the first-use tutorial.
    VoiceTutorialRequired { timestamp: Timestamp },

    /// An unexpected speech-service error occurred.
    VoiceError {
        message: String,
        consecutive_failures: u32,
        timestamp: Timestamp,
    },

    /// A spoken command was recognised and applied.
    VoiceCommand { command: String, timestamp: Timestamp },

    /// A final transcript could not be sent and is staged for manual retry.
    TranscriptStaged { text: String, timestamp: Timestamp },

    /// Voice settings were saved.
    SettingsChanged { timestamp: Timestamp },
}

impl ChatEvent {
    /// Returns the timestamp when this event occurred.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            ChatEvent::MessageAdded { timestamp, .. }
            | ChatEvent::DuplicateSkipped { timestamp, .. }
            | ChatEvent::MessagesTrimmed { timestamp, .. }
            | ChatEvent::StatusChanged { timestamp, .. }
            | ChatEvent::HistoryLoaded { timestamp, .. }
            | ChatEvent::HistoryFailed { timestamp, .. }
            | ChatEvent::ConnectionStateChanged { timestamp, .. }
            | ChatEvent::ReconnectScheduled { timestamp, .. }
            | ChatEvent::CredentialsRefreshed { timestamp }
            | ChatEvent::SessionUnauthenticated { timestamp, .. }
            | ChatEvent::TypingChanged { timestamp, .. }
            | ChatEvent::MessageQueued { timestamp, .. }
            | ChatEvent::QueueFlushed { timestamp, .. }
            | ChatEvent::SendFailed { timestamp, .. }
            | ChatEvent::VoiceStateChanged { timestamp, .. }
            | ChatEvent::VoiceActivated { timestamp }
            | ChatEvent::VoiceDeactivated { timestamp, .. }
            | ChatEvent::VoiceTutorialRequired { timestamp }
            | ChatEvent::VoiceError { timestamp, .. }
            | ChatEvent::VoiceCommand { timestamp, .. }
            | ChatEvent::TranscriptStaged { timestamp, .. }
            | ChatEvent::SettingsChanged { timestamp } => *timestamp,
        }
    }

    /// Returns a short name for the event type, used in logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            ChatEvent::MessageAdded { .. } => "message_added",
            ChatEvent::DuplicateSkipped { .. } => "duplicate_skipped",
            ChatEvent::MessagesTrimmed { .. } => "messages_trimmed",
            ChatEvent::StatusChanged { .. } => "status_changed",
            ChatEvent::HistoryLoaded { .. } => "history_loaded",
            ChatEvent::HistoryFailed { .. } => "history_failed",
            ChatEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            ChatEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            ChatEvent::CredentialsRefreshed { .. } => "credentials_refreshed",
            ChatEvent::SessionUnauthenticated { .. } => "session_unauthenticated",
            ChatEvent::TypingChanged { .. } => "typing_changed",
            ChatEvent::MessageQueued { .. } => "message_queued",
            ChatEvent::QueueFlushed { .. } => "queue_flushed",
            ChatEvent::SendFailed { .. } => "send_failed",
            ChatEvent::VoiceStateChanged { .. } => "voice_state_changed",
            ChatEvent::VoiceActivated { .. } => "voice_activated",
            ChatEvent::VoiceDeactivated { .. } => "voice_deactivated",
            ChatEvent::VoiceTutorialRequired { .. } => "voice_tutorial_required",
            ChatEvent::VoiceError { .. } => "voice_error",
            ChatEvent::VoiceCommand { .. } => "voice_command",
            ChatEvent::TranscriptStaged { .. } => "transcript_staged",
            ChatEvent::SettingsChanged { .. } => "settings_changed",
        }
    }
}

/// Cloneable handle to the process-wide event broadcast channel.
///
/// Publishing never fails: events sent while nobody is subscribed are
/// dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChatEvent) {
        tracing::trace!(event = event.event_name(), "Event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================
