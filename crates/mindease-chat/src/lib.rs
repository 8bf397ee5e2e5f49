//! Real-time chat transport for the MindEase client.
//!
//! Provides the deduplicating message store, history pagination, the
//! persisted offline send queue, the push connection manager with its STOMP
//! transport, and the chat session that ties the send path together.

pub mod api;
pub mod auth;
pub mod connection;
pub mod history;
pub mod lru;
pub mod normalize;
pub mod offline_queue;
pub mod session;
pub mod stomp;
pub mod store;

pub use api::{ChatApi, HistoryPage, HistoryQuery, HttpChatApi, SendRequest, SendResponse, SortOrder};
pub use auth::{CredentialProvider, Credentials, HttpCredentialProvider, StaticCredentials};
pub use connection::{
    BackoffPolicy, ConnectionManager, ConnectionStatus, PushFrame, PushHandler, PushSession,
    PushTransport,
};
pub use history::{HistoryOutcome, HistoryPaginator, ScrollAnchor};
pub use lru::LruCache;
pub use normalize::normalize;
pub use offline_queue::{FlushReport, OfflineQueue};
pub use session::{BotMessageSink, ChatSession, SendOutcome};
pub use stomp::{StompFrame, StompTransport};
pub use store::MessageStore;
