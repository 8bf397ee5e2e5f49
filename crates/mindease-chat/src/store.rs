//! In-memory message store with deduplication, ordering and a size bound.
//!
//! The live list is kept sorted by parsed `createdAt` ascending (unparseable
//! timestamps first). Identity is checked twice: against a bounded LRU of
//! admitted ids, then against the live list by id or by
//! content + direction + time window for copies that arrived with a
//! different id on the other channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use mindease_core::config::StoreConfig;
use mindease_core::error::{MindeaseError, Result};
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{DeliveryStatus, Message, Timestamp};

use crate::lru::LruCache;
use crate::normalize::normalize;

struct StoreInner {
    messages: Vec<Message>,
    statuses: HashMap<String, DeliveryStatus>,
    seen: LruCache<String, ()>,
}

/// Ordered, bounded, deduplicating message list.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
    events: EventBus,
}

fn sort_key(message: &Message) -> Option<DateTime<Utc>> {
    message.parsed_created_at()
}

impl MessageStore {
    pub fn new(config: StoreConfig, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                messages: Vec::new(),
                statuses: HashMap::new(),
                seen: LruCache::new(config.dedup_capacity),
            }),
            config,
            events,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|e| MindeaseError::Storage(format!("Message store lock poisoned: {}", e)))
    }

    /// Normalize and admit one payload. Returns whether it was inserted.
    pub fn add(&self, raw: &Value) -> bool {
        self.admit(raw).is_some()
    }

    /// Normalize and admit one payload, returning the stored message when it
    /// was new.
    pub fn admit(&self, raw: &Value) -> Option<Message> {
        self.admit_message(normalize(raw))
    }

    /// Admit an already-normalized message (for example an optimistic local
    /// copy of an outgoing send).
    pub fn admit_message(&self, message: Message) -> Option<Message> {
        let Ok(mut inner) = self.lock() else {
            return None;
        };

        if self.is_duplicate(&inner, &message) {
            debug!(message_id = %message.id, "Duplicate message skipped");
            self.events.publish(ChatEvent::DuplicateSkipped {
                message_id: message.id,
                timestamp: Timestamp::now(),
            });
            return None;
        }

        inner.seen.set(message.id.clone(), ());
        let key = sort_key(&message);
        let at = inner.messages.partition_point(|m| sort_key(m) <= key);
        inner.messages.insert(at, message.clone());

        self.events.publish(ChatEvent::MessageAdded {
            message_id: message.id.clone(),
            is_user_message: message.is_user_message,
            timestamp: Timestamp::now(),
        });
        self.trim_locked(&mut inner);
        Some(message)
    }

    /// Admit a batch appended after the existing list. Returns the number of
    /// messages inserted.
    pub fn add_many(&self, raws: &[Value]) -> usize {
        self.merge(raws, false)
    }

    /// Admit a batch of older messages ahead of the existing list. Returns
    /// the number of batch messages still held after trimming, which is zero
    /// when the store is already full of newer messages.
    pub fn prepend_many(&self, raws: &[Value]) -> usize {
        self.merge(raws, true)
    }

    fn merge(&self, raws: &[Value], prepend: bool) -> usize {
        let Ok(mut inner) = self.lock() else {
            return 0;
        };

        let mut batch: Vec<Message> = Vec::with_capacity(raws.len());
        let mut batch_ids: HashSet<String> = HashSet::new();
        for raw in raws {
            let message = normalize(raw);
            if batch_ids.contains(&message.id) || self.is_duplicate(&inner, &message) {
                debug!(message_id = %message.id, "Duplicate history message skipped");
                continue;
            }
            batch_ids.insert(message.id.clone());
            batch.push(message);
        }

        let added = batch.len();
        if added == 0 {
            return 0;
        }

        for message in &batch {
            inner.seen.set(message.id.clone(), ());
        }

        let existing = std::mem::take(&mut inner.messages);
        let mut merged = if prepend {
            batch.extend(existing);
            batch
        } else {
            let mut merged = existing;
            merged.extend(batch);
            merged
        };
        // Stable: equal timestamps keep their merge order.
        merged.sort_by_key(sort_key);
        inner.messages = merged;

        debug!(added, prepend, "Merged message batch");
        if self.trim_locked(&mut inner) == 0 {
            return added;
        }
        inner
            .messages
            .iter()
            .filter(|m| batch_ids.contains(&m.id))
            .count()
    }

    fn is_duplicate(&self, inner: &StoreInner, candidate: &Message) -> bool {
        if inner.seen.has(&candidate.id) {
            return true;
        }
        let candidate_ms = candidate.parsed_created_at().map(|t| t.timestamp_millis());
        inner.messages.iter().any(|m| {
            if m.id == candidate.id {
                return true;
            }
            if m.content != candidate.content || m.is_user_message != candidate.is_user_message {
                return false;
            }
            match (m.parsed_created_at(), candidate_ms) {
                (Some(t), Some(c)) => (t.timestamp_millis() - c).abs() < self.config.dedup_window_ms,
                _ => false,
            }
        })
    }

    /// Drop the oldest messages beyond the bound. Returns how many were
    /// removed.
    pub fn trim(&self) -> usize {
        match self.lock() {
            Ok(mut inner) => self.trim_locked(&mut inner),
            Err(_) => 0,
        }
    }

    fn trim_locked(&self, inner: &mut StoreInner) -> usize {
        let max = self.config.max_messages;
        if inner.messages.len() <= max {
            return 0;
        }
        let excess = inner.messages.len() - max;
        let removed: Vec<Message> = inner.messages.drain(..excess).collect();
        for message in &removed {
            inner.statuses.remove(&message.id);
        }
        info!(removed = excess, kept = max, "Message store trimmed");
        self.events.publish(ChatEvent::MessagesTrimmed {
            removed: excess,
            timestamp: Timestamp::now(),
        });
        excess
    }

    /// Set the delivery status of a message.
    ///
    /// Returns `false` when the transition is not allowed (for example
    /// `delivered -> sent`); the previous status is kept in that case.
    pub fn update_status(&self, id: &str, status: DeliveryStatus) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        if let Some(current) = inner.statuses.get(id) {
            if *current == status {
                return true;
            }
            if !current.can_transition_to(&status) {
                debug!(message_id = %id, from = %current, to = %status, "Status regression ignored");
                return false;
            }
        }
        inner.statuses.insert(id.to_string(), status);
        self.events.publish(ChatEvent::StatusChanged {
            message_id: id.to_string(),
            status,
            timestamp: Timestamp::now(),
        });
        true
    }

    pub fn mark_delivered(&self, id: &str) -> bool {
        self.update_status(id, DeliveryStatus::Delivered)
    }

    pub fn mark_failed(&self, id: &str) -> bool {
        self.update_status(id, DeliveryStatus::Failed)
    }

    /// Remove a message and its status. The id stays in the dedup cache so
    /// a late echo of the same id is still recognised.
    pub fn remove(&self, id: &str) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        let before = inner.messages.len();
        inner.messages.retain(|m| m.id != id);
        inner.statuses.remove(id);
        inner.messages.len() != before
    }

    pub fn status_of(&self, id: &str) -> Option<DeliveryStatus> {
        self.lock().ok()?.statuses.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.lock().ok()?.messages.iter().find(|m| m.id == id).cloned()
    }

    /// Whether `id` has been admitted recently or is in the live list.
    pub fn is_known(&self, id: &str) -> bool {
        match self.lock() {
            Ok(inner) => inner.seen.has(&id.to_string()) || inner.messages.iter().any(|m| m.id == id),
            Err(_) => false,
        }
    }

    /// Snapshot of the live list in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().map(|i| i.messages.clone()).unwrap_or_default()
    }

    /// Snapshot with each message's current status.
    pub fn messages_with_status(&self) -> Vec<(Message, Option<DeliveryStatus>)> {
        match self.lock() {
            Ok(inner) => inner
                .messages
                .iter()
                .map(|m| (m.clone(), inner.statuses.get(&m.id).copied()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.messages.clear();
            inner.statuses.clear();
            inner.seen.clear();
        }
    }

    /// Evict dedup entries older than `max_age`. Returns the number removed.
    pub fn sweep_dedup(&self, max_age: Duration) -> usize {
        match self.lock() {
            Ok(mut inner) => inner.seen.remove_older_than(max_age),
            Err(_) => 0,
        }
    }

    /// Spawn the periodic dedup sweep. The task exits when `shutdown` is
    /// notified.
    pub fn spawn_dedup_sweeper(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let every = Duration::from_secs(store.config.dedup_sweep_interval_secs.max(1));
        let max_age = Duration::from_secs(store.config.dedup_max_age_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = store.sweep_dedup(max_age);
                        if removed > 0 {
                            debug!(removed, "Dedup cache swept");
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        })
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
