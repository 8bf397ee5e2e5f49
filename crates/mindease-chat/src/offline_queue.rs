//! Offline send queue.
//!
//! Messages typed while the push connection is down are persisted and
//! replayed in insertion order once the connection manager reports a
//! successful connect. The queue never flushes on its own.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use uuid::Uuid;

use mindease_core::error::Result;
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{OfflineQueueItem, Timestamp};
use mindease_storage::OfflineQueueRepository;

/// Persisted FIFO of unsent outbound text.
pub struct OfflineQueue {
    repo: OfflineQueueRepository,
    max_retries: u32,
    flushing: AtomicBool,
    events: EventBus,
}

/// Clears the in-progress flag even if the flush future is dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of one [`OfflineQueue::flush`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub pending: usize,
}

impl OfflineQueue {
    pub fn new(repo: OfflineQueueRepository, max_retries: u32, events: EventBus) -> Self {
        Self {
            repo,
            max_retries,
            flushing: AtomicBool::new(false),
            events,
        }
    }

    /// Persist `text` and return its queue id.
    pub fn enqueue(&self, text: &str) -> Result<String> {
        let now = Timestamp::now();
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("offline-{}-{}", now.0, &simple[..8]);
        self.repo.insert(&OfflineQueueItem {
            id: id.clone(),
            message: text.to_string(),
            enqueued_at: now,
            retry_count: 0,
        })?;

        let pending = self.repo.count()?;
        info!(queue_id = %id, pending, "Message queued while offline");
        self.events.publish(ChatEvent::MessageQueued {
            queue_id: id.clone(),
            pending,
            timestamp: now,
        });
        Ok(id)
    }

    /// Remove an item. Returns whether it was present.
    pub fn dequeue(&self, id: &str) -> Result<bool> {
        self.repo.delete(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<OfflineQueueItem>> {
        self.repo.find(id)
    }

    pub fn list(&self) -> Result<Vec<OfflineQueueItem>> {
        self.repo.list()
    }

    pub fn len(&self) -> Result<usize> {
        self.repo.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.repo.count()? == 0)
    }

    pub fn clear(&self) -> Result<usize> {
        self.repo.clear()
    }

    /// Increment an item's retry counter. Returns the new count.
    pub fn increment_retry(&self, id: &str) -> Result<Option<u32>> {
        let count = self.repo.increment_retry(id)?;
        if let Some(n) = count {
            if n >= self.max_retries {
                warn!(queue_id = %id, retries = n, "Queued message keeps failing");
            }
        }
        Ok(count)
    }

    /// Replay every queued item through `send` in insertion order.
    ///
    /// Items whose send succeeds are removed; failures stay queued with their
    /// retry counter bumped. A flush already in progress makes this call a
    /// no-op that only reports the current pending count.
    pub async fn flush<F, Fut>(&self, mut send: F) -> Result<FlushReport>
    where
        F: FnMut(OfflineQueueItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress");
            return Ok(FlushReport {
                sent: 0,
                pending: self.repo.count()?,
            });
        }

        let report = {
            let _guard = FlushGuard(&self.flushing);
            self.flush_items(&mut send).await?
        };

        info!(sent = report.sent, pending = report.pending, "Offline queue flushed");
        self.events.publish(ChatEvent::QueueFlushed {
            sent: report.sent,
            pending: report.pending,
            timestamp: Timestamp::now(),
        });
        Ok(report)
    }

    async fn flush_items<F, Fut>(&self, send: &mut F) -> Result<FlushReport>
    where
        F: FnMut(OfflineQueueItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let items = self.repo.list()?;
        let mut sent = 0;
        for item in items {
            let id = item.id.clone();
            match send(item).await {
                Ok(()) => {
                    self.repo.delete(&id)?;
                    sent += 1;
                }
                Err(e) => {
                    warn!(queue_id = %id, error = %e, "Queued message send failed");
                    self.increment_retry(&id)?;
                }
            }
        }
        Ok(FlushReport {
            sent,
            pending: self.repo.count()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
