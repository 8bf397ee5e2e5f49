//! Normalization of inbound message payloads.
//!
//! Messages reach the client through the push topic, the send response and
//! history pages, each with slightly different field names. Normalization
//! never fails: every missing or malformed field degrades to a default.

use chrono::{TimeZone, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use mindease_core::types::{CrisisResource, Message, ModerationAction, RiskLevel};

/// Content used when a payload carries no readable text.
pub const PLACEHOLDER_CONTENT: &str = "Empty message";

/// Generate a local fallback id for a message that arrived without one.
pub fn fallback_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

/// Map a raw payload into the canonical [`Message`] shape.
pub fn normalize(raw: &Value) -> Message {
    let Some(obj) = raw.as_object() else {
        warn!(kind = json_kind(raw), "Inbound message is not an object, using placeholder");
        return Message {
            id: fallback_id(),
            content: PLACEHOLDER_CONTENT.to_string(),
            is_user_message: false,
            created_at: Utc::now().to_rfc3339(),
            risk_level: RiskLevel::None,
            moderation_action: ModerationAction::None,
            moderation_reason: None,
            is_crisis_flagged: false,
            crisis_resources: Vec::new(),
            provider: None,
        };
    };

    let id = match obj.get("id").and_then(scalar_string) {
        Some(id) => id,
        None => {
            let id = fallback_id();
            warn!(fallback_id = %id, "Inbound message has no id, assigned fallback");
            id
        }
    };

    let content = ["content", "message", "text"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(scalar_string))
        .unwrap_or_else(|| PLACEHOLDER_CONTENT.to_string());

    let is_user_message = match obj.get("isUserMessage").and_then(Value::as_bool) {
        Some(flag) => flag,
        None => obj.get("sender").and_then(Value::as_str) == Some("user"),
    };

    let created_at = ["createdAt", "timestamp"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(timestamp_string))
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    Message {
        id,
        content,
        is_user_message,
        created_at,
        risk_level: obj
            .get("riskLevel")
            .and_then(Value::as_str)
            .map(RiskLevel::parse_lossy)
            .unwrap_or_default(),
        moderation_action: obj
            .get("moderationAction")
            .and_then(Value::as_str)
            .map(ModerationAction::parse_lossy)
            .unwrap_or_default(),
        moderation_reason: ["moderationReason", "moderationWarning"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_string)),
        is_crisis_flagged: obj
            .get("isCrisisFlagged")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        crisis_resources: crisis_resources(obj),
        provider: obj.get("provider").and_then(scalar_string),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Non-empty strings and numbers as text; everything else is absent.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts ISO strings, epoch-millisecond numbers and the
/// `[year, month, day, hour, minute, second, nanos]` array form.
fn timestamp_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|dt| dt.to_rfc3339()),
        Value::Array(parts) => {
            let nums: Vec<i64> = parts.iter().filter_map(Value::as_i64).collect();
            if nums.len() < 3 || nums.len() != parts.len() {
                return None;
            }
            let field = |i: usize| nums.get(i).copied().unwrap_or(0);
            let date = chrono::NaiveDate::from_ymd_opt(
                i32::try_from(field(0)).ok()?,
                u32::try_from(field(1)).ok()?,
                u32::try_from(field(2)).ok()?,
            )?;
            let time = chrono::NaiveTime::from_hms_nano_opt(
                u32::try_from(field(3)).ok()?,
                u32::try_from(field(4)).ok()?,
                u32::try_from(field(5)).ok()?,
                u32::try_from(field(6)).ok()?,
            )?;
            Some(Utc.from_utc_datetime(&date.and_time(time)).to_rfc3339())
        }
        _ => None,
    }
}

fn crisis_resources(obj: &serde_json::Map<String, Value>) -> Vec<CrisisResource> {
    if let Some(Value::Array(items)) = obj.get("crisisResources") {
        return parse_resource_items(items);
    }

    match obj.get("crisisResourcesJson").and_then(Value::as_str) {
        Some(blob) if !blob.trim().is_empty() => match serde_json::from_str::<Value>(blob) {
            Ok(Value::Array(items)) => parse_resource_items(&items),
            Ok(_) => {
                warn!("crisisResourcesJson is not an array, ignoring");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse crisisResourcesJson, ignoring");
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

fn parse_resource_items(items: &[Value]) -> Vec<CrisisResource> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<CrisisResource>(item.clone()).ok())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
