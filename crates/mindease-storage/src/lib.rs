//! MindEase storage crate - SQLite persistence for client-side durable state.
//!
//! Provides a WAL-mode SQLite database with migrations, the offline send
//! queue repository and a small key/value repository for voice settings.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{KvRepository, OfflineQueueRepository};
