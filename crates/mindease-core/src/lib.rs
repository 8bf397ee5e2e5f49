//! MindEase core crate - configuration, error taxonomy, domain types and the
//! event bus shared by the chat transport and voice crates.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::MindeaseConfig;
pub use error::{MindeaseError, Result};
pub use events::{ChatEvent, EventBus};
pub use types::*;
