//! Chat session: the send path and the push handler.
//!
//! The session and the connection manager need each other. The manager is
//! built with the session as its [`PushHandler`]; the session learns the
//! manager's status channel afterwards through [`ChatSession::bind_connection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mindease_core::error::{MindeaseError, Result};
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{ConnectionState, DeliveryStatus, Message, OfflineQueueItem, Timestamp};

use crate::api::{ChatApi, SendRequest, SendResponse};
use crate::connection::{ConnectionStatus, PushHandler};
use crate::history::HistoryPaginator;
use crate::normalize::normalize;
use crate::offline_queue::{FlushReport, OfflineQueue};
use crate::store::MessageStore;

/// Receives bot replies as they are admitted, e.g. for spoken playback.
#[async_trait]
pub trait BotMessageSink: Send + Sync {
    async fn on_bot_message(&self, message: Message);
}

/// Result of [`ChatSession::send`] and [`ChatSession::retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Blank input.
    Ignored,
    /// Offline: persisted for the next connect.
    Queued { queue_id: String },
    /// The server accepted the message.
    Delivered { bot_message: Option<Message> },
    /// The send failed; `text` is kept for a manual retry of `local_id`.
    Failed { local_id: String, text: String },
}

pub struct ChatSession {
    store: Arc<MessageStore>,
    queue: Arc<OfflineQueue>,
    api: Arc<dyn ChatApi>,
    history: Arc<HistoryPaginator>,
    events: EventBus,
    connection: OnceLock<watch::Receiver<ConnectionStatus>>,
    bot_sink: OnceLock<Arc<dyn BotMessageSink>>,
    typing: AtomicBool,
    flush_delay: Duration,
}

impl ChatSession {
    pub fn new(
        store: Arc<MessageStore>,
        queue: Arc<OfflineQueue>,
        api: Arc<dyn ChatApi>,
        history: Arc<HistoryPaginator>,
        events: EventBus,
        flush_delay: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            api,
            history,
            events,
            connection: OnceLock::new(),
            bot_sink: OnceLock::new(),
            typing: AtomicBool::new(false),
            flush_delay,
        }
    }

    /// Attach the connection status channel. Only the first call has effect.
    pub fn bind_connection(&self, status: watch::Receiver<ConnectionStatus>) -> bool {
        self.connection.set(status).is_ok()
    }

    /// Attach the bot reply sink. Only the first call has effect.
    pub fn bind_bot_sink(&self, sink: Arc<dyn BotMessageSink>) -> bool {
        self.bot_sink.set(sink).is_ok()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn history(&self) -> &Arc<HistoryPaginator> {
        &self.history
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
            .get()
            .map(|rx| *rx.borrow())
            .unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.connection_status().state == ConnectionState::Connected
    }

    pub fn is_typing(&self) -> bool {
        self.typing.load(Ordering::Acquire)
    }

    /// Send user text.
    ///
    /// Offline, the text is queued and shown with status `queued`. Online, an
    /// optimistic copy is shown as `sending` and replaced by the server's
    /// copy once the request succeeds.
    pub async fn send(&self, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        if !self.is_online() {
            let queue_id = self.queue.enqueue(text)?;
            self.show_local(&queue_id, text, DeliveryStatus::Queued);
            return Ok(SendOutcome::Queued { queue_id });
        }

        let local_id = format!("local-{}", Uuid::new_v4());
        self.show_local(&local_id, text, DeliveryStatus::Sending);
        Ok(self.deliver(&local_id, text).await)
    }

    /// Re-send a failed or queued message.
    pub async fn retry(&self, id: &str) -> Result<SendOutcome> {
        if let Some(item) = self.queue.get(id)? {
            if !self.is_online() {
                return Ok(SendOutcome::Queued {
                    queue_id: item.id,
                });
            }
            let outcome = self.deliver(&item.id, &item.message).await;
            match outcome {
                SendOutcome::Delivered { .. } => {
                    self.queue.dequeue(&item.id)?;
                }
                _ => {
                    self.queue.increment_retry(&item.id)?;
                }
            }
            return Ok(outcome);
        }

        let message = self
            .store
            .get(id)
            .ok_or_else(|| MindeaseError::InvalidState(format!("unknown message {}", id)))?;
        if self.store.status_of(id) != Some(DeliveryStatus::Failed) {
            return Err(MindeaseError::InvalidState(format!(
                "message {} has not failed",
                id
            )));
        }

        if !self.is_online() {
            self.store.remove(id);
            let queue_id = self.queue.enqueue(&message.content)?;
            self.show_local(&queue_id, &message.content, DeliveryStatus::Queued);
            return Ok(SendOutcome::Queued { queue_id });
        }

        self.store.update_status(id, DeliveryStatus::Sending);
        Ok(self.deliver(id, &message.content).await)
    }

    /// Replay the offline queue through the send endpoint.
    pub async fn flush_offline_queue(&self) -> Result<FlushReport> {
        self.queue.flush(|item| self.flush_one(item)).await
    }

    async fn flush_one(&self, item: OfflineQueueItem) -> Result<()> {
        if self.store.status_of(&item.id).is_some() {
            self.store.update_status(&item.id, DeliveryStatus::Sending);
        }
        match self.api.send_message(&self.request(&item.message)).await {
            Ok(response) => {
                self.store.remove(&item.id);
                self.apply_response(response).await;
                Ok(())
            }
            Err(e) => {
                self.store.mark_failed(&item.id);
                Err(e)
            }
        }
    }

    /// Admit a payload delivered on the push channel.
    pub async fn handle_incoming(&self, payload: Value) {
        let message = normalize(&payload);
        if message.is_user_message {
            self.admit_user(message);
        } else {
            self.admit_bot(message).await;
        }
    }

    fn request(&self, text: &str) -> SendRequest {
        let mut request = SendRequest::new(text);
        request.session_id = self.history.session_id();
        request
    }

    fn show_local(&self, id: &str, text: &str, status: DeliveryStatus) {
        self.store.admit_message(Message::local_user(id, text));
        self.store.update_status(id, status);
    }

    async fn deliver(&self, local_id: &str, text: &str) -> SendOutcome {
        match self.api.send_message(&self.request(text)).await {
            Ok(response) => {
                // Drop the optimistic copy first so the server copy is not
                // mistaken for a duplicate of it.
                self.store.remove(local_id);
                let bot_message = self.apply_response(response).await;
                debug!(local_id, "Message delivered");
                SendOutcome::Delivered { bot_message }
            }
            Err(e) => {
                warn!(local_id, error = %e, "Send failed");
                self.store.mark_failed(local_id);
                self.events.publish(ChatEvent::SendFailed {
                    message_id: local_id.to_string(),
                    error: e.to_string(),
                    timestamp: Timestamp::now(),
                });
                SendOutcome::Failed {
                    local_id: local_id.to_string(),
                    text: text.to_string(),
                }
            }
        }
    }

    /// Admit the messages of a send response. Returns the bot reply, if new.
    async fn apply_response(&self, response: SendResponse) -> Option<Message> {
        if let Some(raw) = response.user_message {
            self.admit_user(normalize(&raw));
        }
        let mut bot_message = None;
        for raw in [response.bot_message, response.crisis_message]
            .into_iter()
            .flatten()
        {
            let admitted = self.admit_bot(normalize(&raw)).await;
            if bot_message.is_none() {
                bot_message = admitted;
            }
        }
        bot_message
    }

    fn admit_user(&self, message: Message) {
        let id = message.id.clone();
        self.store.admit_message(message);
        if self.store.get(&id).is_some() {
            self.store.mark_delivered(&id);
        }
    }

    async fn admit_bot(&self, message: Message) -> Option<Message> {
        let admitted = self.store.admit_message(message)?;
        if let Some(sink) = self.bot_sink.get() {
            sink.on_bot_message(admitted.clone()).await;
        }
        Some(admitted)
    }
}

#[async_trait]
impl PushHandler for ChatSession {
    async fn on_connected(&self) {
        tokio::time::sleep(self.flush_delay).await;
        match self.flush_offline_queue().await {
            Ok(report) if report.sent > 0 || report.pending > 0 => {
                info!(sent = report.sent, pending = report.pending, "Offline queue replayed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Offline queue flush failed"),
        }

        if !self.history.is_loaded() {
            if let Err(e) = self.history.load_initial().await {
                warn!(error = %e, "Initial history load failed");
            }
        }
    }

    async fn on_message(&self, payload: Value) {
        self.handle_incoming(payload).await;
    }

    async fn on_typing(&self, is_typing: bool) {
        let previous = self.typing.swap(is_typing, Ordering::AcqRel);
        if previous != is_typing {
            self.events.publish(ChatEvent::TypingChanged {
                is_typing,
                timestamp: Timestamp::now(),
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HistoryPage, HistoryQuery};
    use mindease_core::config::StoreConfig;
    use mindease_storage::{Database, OfflineQueueRepository};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, Weak};

    #[derive(Default)]
    struct MockApi {
        fail: AtomicBool,
        counter: AtomicUsize,
        sent: Mutex<Vec<String>>,
        history: Vec<Value>,
        history_calls: AtomicUsize,
        /// When set, the bot reply is pushed to this session before the
        /// send response returns.
        push_reply_to: OnceLock<Weak<ChatSession>>,
    }

    #[async_trait]
    impl ChatApi for MockApi {
        async fn send_message(&self, request: &SendRequest) -> Result<SendResponse> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MindeaseError::Network("unreachable".into()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(request.message.clone());
            let bot = json!({
                "id": format!("b-{}", n),
                "content": format!("reply: {}", request.message),
                "isUserMessage": false
            });
            if let Some(session) = self.push_reply_to.get().and_then(Weak::upgrade) {
                session.handle_incoming(bot.clone()).await;
            }
            Ok(SendResponse {
                user_message: Some(json!({
                    "id": format!("u-{}", n),
                    "content": request.message,
                    "isUserMessage": true
                })),
                bot_message: Some(bot),
                crisis_message: None,
            })
        }

        async fn fetch_history(&self, _query: &HistoryQuery) -> Result<HistoryPage> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            Ok(HistoryPage {
                items: self.history.clone(),
                total_pages: 1,
                session_id: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BotMessageSink for RecordingSink {
        async fn on_bot_message(&self, message: Message) {
            self.received.lock().unwrap().push(message.id);
        }
    }

    struct Fixture {
        session: Arc<ChatSession>,
        api: Arc<MockApi>,
        sink: Arc<RecordingSink>,
        status: watch::Sender<ConnectionStatus>,
    }

    fn fixture(api: MockApi, online: bool) -> Fixture {
        let events = EventBus::new();
        let api = Arc::new(api);
        let store = Arc::new(MessageStore::new(StoreConfig::default(), events.clone()));
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = Arc::new(OfflineQueue::new(
            OfflineQueueRepository::new(db),
            3,
            events.clone(),
        ));
        let history = Arc::new(HistoryPaginator::new(
            api.clone(),
            store.clone(),
            events.clone(),
            50,
            Duration::from_secs(10),
        ));
        let session = Arc::new(ChatSession::new(
            store,
            queue,
            api.clone(),
            history,
            events,
            Duration::ZERO,
        ));

        let (status, rx) = watch::channel(ConnectionStatus::default());
        assert!(session.bind_connection(rx));
        set_online(&status, online);
        let sink = Arc::new(RecordingSink::default());
        assert!(session.bind_bot_sink(sink.clone()));
        Fixture {
            session,
            api,
            sink,
            status,
        }
    }

    fn set_online(status: &watch::Sender<ConnectionStatus>, online: bool) {
        status.send_replace(ConnectionStatus {
            state: if online {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            ..ConnectionStatus::default()
        });
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let f = fixture(MockApi::default(), true);
        assert_eq!(f.session.send("   ").await.unwrap(), SendOutcome::Ignored);
        assert!(f.session.store().is_empty());
    }

    #[tokio::test]
    async fn test_offline_send_is_queued() {
        let f = fixture(MockApi::default(), false);
        let outcome = f.session.send("hello").await.unwrap();
        let SendOutcome::Queued { queue_id } = outcome else {
            panic!("expected queued outcome");
        };
        assert_eq!(f.session.queue().len().unwrap(), 1);
        assert_eq!(
            f.session.store().status_of(&queue_id),
            Some(DeliveryStatus::Queued)
        );
        assert!(f.api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_online_send_replaces_optimistic_copy() {
        let f = fixture(MockApi::default(), true);
        let outcome = f.session.send("hello").await.unwrap();

        match outcome {
            SendOutcome::Delivered { bot_message } => {
                assert_eq!(bot_message.unwrap().id, "b-0");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let ids: Vec<String> = f.session.store().messages().into_iter().map(|m| m.id).collect();
        assert!(ids.contains(&"u-0".to_string()));
        assert!(ids.contains(&"b-0".to_string()));
        assert!(!ids.iter().any(|id| id.starts_with("local-")));
        assert_eq!(
            f.session.store().status_of("u-0"),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(*f.sink.received.lock().unwrap(), vec!["b-0"]);
    }

    #[tokio::test]
    async fn test_reply_pushed_before_response_is_stored_once() {
        let f = fixture(MockApi::default(), true);
        f.api
            .push_reply_to
            .set(Arc::downgrade(&f.session))
            .unwrap();

        let outcome = f.session.send("hi").await.unwrap();
        assert_eq!(outcome, SendOutcome::Delivered { bot_message: None });

        let bots: Vec<Message> = f
            .session
            .store()
            .messages()
            .into_iter()
            .filter(|m| !m.is_user_message)
            .collect();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].id, "b-0");
        assert_eq!(bots[0].content, "reply: hi");
        assert_eq!(*f.sink.received.lock().unwrap(), vec!["b-0"]);
        assert_eq!(
            f.session.store().status_of("u-0"),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_failed_send_can_be_retried() {
        let api = MockApi::default();
        api.fail.store(true, Ordering::SeqCst);
        let f = fixture(api, true);

        let outcome = f.session.send("are you there").await.unwrap();
        let SendOutcome::Failed { local_id, text } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(text, "are you there");
        assert_eq!(
            f.session.store().status_of(&local_id),
            Some(DeliveryStatus::Failed)
        );

        f.api.fail.store(false, Ordering::SeqCst);
        let retried = f.session.retry(&local_id).await.unwrap();
        assert!(matches!(retried, SendOutcome::Delivered { .. }));
        assert!(f.session.store().get(&local_id).is_none());
    }

    #[tokio::test]
    async fn test_retry_rejects_unknown_and_delivered() {
        let f = fixture(MockApi::default(), true);
        assert!(f.session.retry("nope").await.is_err());
        f.session.send("hi").await.unwrap();
        assert!(f.session.retry("u-0").await.is_err());
    }

    #[tokio::test]
    async fn test_queue_flushes_once_online() {
        let f = fixture(MockApi::default(), false);
        f.session.send("one").await.unwrap();
        f.session.send("two").await.unwrap();
        assert_eq!(f.session.queue().len().unwrap(), 2);

        set_online(&f.status, true);
        let report = f.session.flush_offline_queue().await.unwrap();
        assert_eq!(report, FlushReport { sent: 2, pending: 0 });
        assert_eq!(*f.api.sent.lock().unwrap(), vec!["one", "two"]);
        assert!(f
            .session
            .store()
            .messages()
            .iter()
            .all(|m| !m.id.starts_with("offline-")));
    }

    #[tokio::test]
    async fn test_queued_retry_while_offline_stays_queued() {
        let f = fixture(MockApi::default(), false);
        let SendOutcome::Queued { queue_id } = f.session.send("later").await.unwrap() else {
            panic!("expected queued outcome");
        };
        let again = f.session.retry(&queue_id).await.unwrap();
        assert_eq!(again, SendOutcome::Queued { queue_id });
    }

    #[tokio::test]
    async fn test_incoming_messages() {
        let f = fixture(MockApi::default(), true);
        let bot = json!({"id": "b-9", "content": "hello from bot", "isUserMessage": false});
        f.session.handle_incoming(bot.clone()).await;
        f.session.handle_incoming(bot).await;
        f.session
            .handle_incoming(json!({"id": "u-9", "content": "mine", "isUserMessage": true}))
            .await;

        assert_eq!(f.session.store().len(), 2);
        assert_eq!(*f.sink.received.lock().unwrap(), vec!["b-9"]);
        assert_eq!(
            f.session.store().status_of("u-9"),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_typing_indicator() {
        let f = fixture(MockApi::default(), true);
        f.session.on_typing(true).await;
        assert!(f.session.is_typing());
        f.session.on_typing(false).await;
        assert!(!f.session.is_typing());
    }

    #[tokio::test]
    async fn test_on_connected_flushes_and_loads_history_once() {
        let api = MockApi {
            history: vec![json!({"id": "h1", "content": "earlier", "isUserMessage": false,
                "createdAt": "2024-01-01T00:00:00Z"})],
            ..MockApi::default()
        };
        let f = fixture(api, false);
        f.session.send("queued").await.unwrap();
        set_online(&f.status, true);

        f.session.on_connected().await;
        assert!(f.session.queue().is_empty().unwrap());
        assert!(f.session.history().is_loaded());
        assert!(f.session.store().get("h1").is_some());

        f.session.on_connected().await;
        assert_eq!(f.api.history_calls.load(Ordering::SeqCst), 1);
    }
}
