use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Delivery status of a message.
///
/// Statuses advance `Queued -> Sending -> Sent -> Delivered`. `Failed` can be
/// entered from any undelivered status and left again only by an explicit
/// retry (back to `Queued` or `Sending`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Queued => write!(f, "queued"),
            DeliveryStatus::Sending => write!(f, "sending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl DeliveryStatus {
    fn rank(&self) -> Option<u8> {
        match self {
            DeliveryStatus::Queued => Some(0),
            DeliveryStatus::Sending => Some(1),
            DeliveryStatus::Sent => Some(2),
            DeliveryStatus::Delivered => Some(3),
            DeliveryStatus::Failed => None,
        }
    }

    /// Returns whether a message in status `self` may move to `target`.
    pub fn can_transition_to(&self, target: &DeliveryStatus) -> bool {
        match (self.rank(), target.rank()) {
            (Some(from), Some(to)) => to >= from,
            // Retry out of a failure.
            (None, _) => matches!(target, DeliveryStatus::Queued | DeliveryStatus::Sending),
            (Some(_), None) => *self != DeliveryStatus::Delivered,
        }
    }
}

/// Crisis risk level attached to a message by server-side moderation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Parse a wire value, treating anything unrecognised as `None`.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            "HIGH" => RiskLevel::High,
            "CRITICAL" => RiskLevel::Critical,
            _ => RiskLevel::None,
        }
    }
}

/// Moderation decision attached to a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationAction {
    #[default]
    None,
    Flagged,
    Warned,
    Blocked,
}

impl ModerationAction {
    /// Parse a wire value, treating anything unrecognised as `None`.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "FLAGGED" => ModerationAction::Flagged,
            "WARNED" | "WARN" => ModerationAction::Warned,
            "BLOCKED" | "BLOCK" => ModerationAction::Blocked,
            _ => ModerationAction::None,
        }
    }
}

/// Lifecycle of the push-transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

impl ConnectionState {
    /// Returns whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        matches!(
            (self, target),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }
}

/// Which party currently holds the audio floor in a voice conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceConversationState {
    /// Voice mode is off.
    Inactive,
    /// Capture holds the floor and is waiting for speech.
    Listening,
    /// A final transcript is being classified and dispatched.
    Transcribing,
    /// Playback holds the floor.
    Speaking,
    /// Capture detected speech while playback was active; playback continues
    /// at reduced volume.
    Ducked,
}

impl fmt::Display for VoiceConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceConversationState::Inactive => write!(f, "Inactive"),
            VoiceConversationState::Listening => write!(f, "Listening"),
            VoiceConversationState::Transcribing => write!(f, "Transcribing"),
            VoiceConversationState::Speaking => write!(f, "Speaking"),
            VoiceConversationState::Ducked => write!(f, "Ducked"),
        }
    }
}

impl VoiceConversationState {
    pub fn is_active(&self) -> bool {
        *self != VoiceConversationState::Inactive
    }
}

// =============================================================================
// Structs
// =============================================================================

/// A crisis support resource attached to a flagged message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CrisisResource {
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub resource_type: Option<String>,
    pub contact_info: Option<String>,
    pub availability: Option<String>,
    pub language: Option<String>,
    pub region: Option<String>,
    pub display_order: Option<i32>,
}

/// A chat message in canonical shape.
///
/// `created_at` keeps the raw wire value; ordering uses
/// [`Message::parsed_created_at`], under which unparseable values sort first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub is_user_message: bool,
    pub created_at: String,
    pub risk_level: RiskLevel,
    pub moderation_action: ModerationAction,
    pub moderation_reason: Option<String>,
    pub is_crisis_flagged: bool,
    pub crisis_resources: Vec<CrisisResource>,
    pub provider: Option<String>,
}

impl Message {
    /// Build a locally-authored user message stamped with the current time.
    pub fn local_user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            is_user_message: true,
            created_at: Utc::now().to_rfc3339(),
            risk_level: RiskLevel::None,
            moderation_action: ModerationAction::None,
            moderation_reason: None,
            is_crisis_flagged: false,
            crisis_resources: Vec::new(),
            provider: None,
        }
    }

    /// Parse `created_at` into a UTC instant.
    ///
    /// Accepts RFC 3339, zone-less ISO-8601 local date-times (interpreted as
    /// UTC) and integer epoch milliseconds.
    pub fn parsed_created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

/// An outbound message persisted while the push connection was unavailable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueItem {
    pub id: String,
    pub message: String,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
}

/// Parse a wire timestamp. Returns `None` when the value is not recognised.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    None
}

// =============================================================================
// Newtype Wrappers
// =============================================================================

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// Milliseconds elapsed between `self` and `now`, never negative.
    pub fn elapsed_ms(&self, now: Timestamp) -> i64 {
        (now.0 - self.0).max(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
