//! History paginator.
//!
//! Pages arrive newest-first from the server. Each page is reversed into
//! chronological order, filtered against ids the store already knows, and
//! merged: the first page through the append path, older pages through the
//! prepend path. A call made while a fetch is in flight is a no-op.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use mindease_core::error::{MindeaseError, Result};
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::Timestamp;

use crate::api::{ChatApi, HistoryPage, HistoryQuery, SortOrder};
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerPhase {
    Idle,
    Loading,
}

/// Scroll position captured before older messages were prepended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub previous_content_height: f64,
}

impl ScrollAnchor {
    /// Scroll offset that keeps the previously visible content in place once
    /// the container has grown to `new_content_height`.
    pub fn restore(&self, new_content_height: f64) -> f64 {
        (new_content_height - self.previous_content_height).max(0.0)
    }
}

/// Result of a paginator call.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    /// Another load was in flight, or there is nothing more to load.
    Skipped,
    Loaded {
        page: u32,
        added: usize,
        has_more: bool,
        /// Present for older-page loads.
        anchor: Option<ScrollAnchor>,
    },
}

struct PagerState {
    phase: PagerPhase,
    /// Last page merged, `None` until the first page has loaded.
    page: Option<u32>,
    has_more: bool,
    session_id: Option<String>,
}

/// Loads chat history pages into a [`MessageStore`].
pub struct HistoryPaginator {
    api: Arc<dyn ChatApi>,
    store: Arc<MessageStore>,
    events: EventBus,
    page_size: u32,
    timeout: Duration,
    state: Mutex<PagerState>,
}

impl HistoryPaginator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Arc<MessageStore>,
        events: EventBus,
        page_size: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            store,
            events,
            page_size,
            timeout,
            state: Mutex::new(PagerState {
                phase: PagerPhase::Idle,
                page: None,
                has_more: false,
                session_id: None,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PagerState>> {
        self.state
            .lock()
            .map_err(|e| MindeaseError::Storage(format!("Paginator lock poisoned: {}", e)))
    }

    pub fn phase(&self) -> PagerPhase {
        self.lock().map(|s| s.phase).unwrap_or(PagerPhase::Idle)
    }

    pub fn has_more(&self) -> bool {
        self.lock().map(|s| s.has_more).unwrap_or(false)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().map(|s| s.page.is_some()).unwrap_or(false)
    }

    /// Server session id reported by the last page, if any.
    pub fn session_id(&self) -> Option<String> {
        self.lock().ok()?.session_id.clone()
    }

    /// Restrict history to one server session.
    pub fn set_session_id(&self, session_id: Option<String>) {
        if let Ok(mut state) = self.lock() {
            state.session_id = session_id;
        }
    }

    /// Enter `Loading`, or return `None` when a load is already running or
    /// `ready` rejects the current state.
    fn begin(&self, ready: impl Fn(&PagerState) -> Option<u32>) -> Result<Option<u32>> {
        let mut state = self.lock()?;
        if state.phase == PagerPhase::Loading {
            debug!("History load already in flight");
            return Ok(None);
        }
        let Some(page) = ready(&state) else {
            return Ok(None);
        };
        state.phase = PagerPhase::Loading;
        Ok(Some(page))
    }

    async fn fetch(&self, page: u32) -> Result<HistoryPage> {
        let query = HistoryQuery {
            page,
            size: self.page_size,
            sort: SortOrder::Desc,
            session_id: self.session_id(),
        };
        match tokio::time::timeout(self.timeout, self.api.fetch_history(&query)).await {
            Ok(result) => result,
            Err(_) => Err(MindeaseError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    fn fail(&self, error: MindeaseError) -> MindeaseError {
        if let Ok(mut state) = self.lock() {
            state.phase = PagerPhase::Idle;
        }
        warn!(error = %error, "History load failed");
        self.events.publish(ChatEvent::HistoryFailed {
            error: error.to_string(),
            timestamp: Timestamp::now(),
        });
        error
    }

    /// Fetch the newest page and merge it into the store.
    pub async fn load_initial(&self) -> Result<HistoryOutcome> {
        let Some(page) = self.begin(|_| Some(0))? else {
            return Ok(HistoryOutcome::Skipped);
        };

        let fetched = match self.fetch(page).await {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };

        let fresh = self.chronological_unknown(fetched.items);
        let added = self.store.add_many(&fresh);
        let has_more = fetched.total_pages > 1;
        self.finish(page, has_more, fetched.session_id)?;

        info!(added, has_more, "Initial history loaded");
        self.publish_loaded(page, added, has_more);
        Ok(HistoryOutcome::Loaded {
            page,
            added,
            has_more,
            anchor: None,
        })
    }

    /// Fetch the next older page and prepend it.
    ///
    /// `previous_content_height` is the scroll container's content height
    /// before the update; the returned anchor computes the restored offset.
    pub async fn load_older(&self, previous_content_height: f64) -> Result<HistoryOutcome> {
        let Some(page) = self.begin(|s| match s.page {
            Some(current) if s.has_more => Some(current + 1),
            _ => None,
        })?
        else {
            return Ok(HistoryOutcome::Skipped);
        };
        let anchor = ScrollAnchor {
            previous_content_height,
        };

        let fetched = match self.fetch(page).await {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };

        let fresh = self.chronological_unknown(fetched.items);
        if fresh.is_empty() {
            // Nothing new: keep the page cursor, stop paging.
            let mut state = self.lock()?;
            state.phase = PagerPhase::Idle;
            state.has_more = false;
            drop(state);
            self.publish_loaded(page, 0, false);
            return Ok(HistoryOutcome::Loaded {
                page,
                added: 0,
                has_more: false,
                anchor: Some(anchor),
            });
        }

        let added = self.store.prepend_many(&fresh);
        // Nothing survived the store bound, so older pages would not either.
        let has_more = added > 0 && page + 1 < fetched.total_pages;
        self.finish(page, has_more, fetched.session_id)?;

        info!(page, added, has_more, "Older history loaded");
        self.publish_loaded(page, added, has_more);
        Ok(HistoryOutcome::Loaded {
            page,
            added,
            has_more,
            anchor: Some(anchor),
        })
    }

    fn chronological_unknown(&self, mut items: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        items.reverse();
        items.retain(|item| match item.get("id").and_then(|v| v.as_str()) {
            Some(id) => !self.store.is_known(id),
            None => true,
        });
        items
    }

    fn finish(&self, page: u32, has_more: bool, session_id: Option<String>) -> Result<()> {
        let mut state = self.lock()?;
        state.phase = PagerPhase::Idle;
        state.page = Some(page);
        state.has_more = has_more;
        if session_id.is_some() {
            state.session_id = session_id;
        }
        Ok(())
    }

    fn publish_loaded(&self, page: u32, added: usize, has_more: bool) {
        self.events.publish(ChatEvent::HistoryLoaded {
            page,
            added,
            has_more,
            timestamp: Timestamp::now(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
