use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MindeaseError, Result};

/// Environment variable that overrides `api.base_url`.
pub const API_BASE_URL_ENV: &str = "MINDEASE_API_BASE_URL";

/// Top-level configuration for the MindEase client.
///
/// Loaded from `~/.mindease/config.toml` by default. Each section corresponds
/// to one component of the transport and voice layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MindeaseConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

impl MindeaseConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MindeaseConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| MindeaseError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply environment overrides. Read once at startup.
    pub fn with_env_overrides(self) -> Self {
        self.with_base_url_override(std::env::var(API_BASE_URL_ENV).ok())
    }

    /// Replace the API base URL when an override is present and non-empty.
    pub fn with_base_url_override(mut self, base_url: Option<String>) -> Self {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.api.base_url = url.trim_end_matches('/').to_string();
        }
        self
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.mindease/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Request/response backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the backend, without trailing slash.
    pub base_url: String,
    /// Per-request timeout. History fetches fail explicitly after this.
    pub request_timeout_secs: u64,
    /// Number of messages per history page.
    pub history_page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: 10,
            history_page_size: 50,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Push-transport connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket path relative to the API base URL.
    pub ws_path: String,
    /// Base reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds.
    pub max_delay_ms: u64,
    /// STOMP heart-beat interval (both directions) in milliseconds.
    pub heartbeat_ms: u64,
    /// Delay between a successful connect and the offline-queue flush.
    pub flush_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_path: "/ws/websocket".to_string(),
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            heartbeat_ms: 4000,
            flush_delay_ms: 1000,
        }
    }
}

/// Message store bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of messages kept in memory.
    pub max_messages: usize,
    /// Capacity of the id deduplication cache.
    pub dedup_capacity: usize,
    /// Age after which dedup entries are swept.
    pub dedup_max_age_secs: u64,
    /// Interval between dedup sweeps.
    pub dedup_sweep_interval_secs: u64,
    /// Time window for the content-based duplicate check.
    pub dedup_window_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            dedup_capacity: 1000,
            dedup_max_age_secs: 300,
            dedup_sweep_interval_secs: 300,
            dedup_window_ms: 1000,
        }
    }
}

/// Offline send queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry count after which a queued item is reported as stuck.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Voice conversation timing and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Capture stops after this much silence.
    pub silence_timeout_ms: u64,
    /// Absolute cap on one capture session.
    pub max_duration_ms: u64,
    /// Playback volume multiplier while ducked.
    pub duck_factor: f32,
    /// Delay before restarting capture when nothing is playing.
    pub restart_delay_ms: u64,
    /// Delay before restarting capture while playback is active.
    pub restart_delay_speaking_ms: u64,
    /// Delay before resuming after a command or returning to the foreground.
    pub resume_delay_ms: u64,
    /// Consecutive unexpected speech errors before deactivating.
    pub max_consecutive_failures: u32,
    /// Longest text handed to the synthesizer in one segment.
    pub max_chunk_chars: usize,
    /// Playback segments that fail to start within this window are failed.
    pub playback_timeout_ms: u64,
    /// Gap between queued playback segments.
    pub segment_gap_ms: u64,
    /// Recognition language tag.
    pub language: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 5000,
            max_duration_ms: 60_000,
            duck_factor: 0.3,
            restart_delay_ms: 100,
            restart_delay_speaking_ms: 500,
            resume_delay_ms: 300,
            max_consecutive_failures: 3,
            max_chunk_chars: 2500,
            playback_timeout_ms: 10_000,
            segment_gap_ms: 100,
            language: "en-US".to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = MindeaseConfig::default();
        assert_eq!(config.general.data_dir, "~/.mindease/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.api.request_timeout_secs, 10);
        assert_eq!(config.api.history_page_size, 50);
        assert_eq!(config.connection.base_delay_ms, 1000);
        assert_eq!(config.connection.max_delay_ms, 30_000);
        assert_eq!(config.store.max_messages, 200);
        assert_eq!(config.store.dedup_capacity, 1000);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.voice.silence_timeout_ms, 5000);
        assert_eq!(config.voice.resume_delay_ms, 300);
        assert!((config.voice.duck_factor - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[api]
base_url = "https://api.example.com"

[connection]
max_delay_ms = 10000
"#;
        let file = create_temp_config(content);
        let config = MindeaseConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.api.base_url, "https://api.example.com");
        assert_eq!(config.connection.max_delay_ms, 10_000);
        // Untouched fields in a present section keep their defaults.
        assert_eq!(config.connection.base_delay_ms, 1000);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = MindeaseConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.store.max_messages, 200);
        assert_eq!(config.voice.max_duration_ms, 60_000);
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let file = create_temp_config("[general\nlog_level = ");
        let result = MindeaseConfig::load(file.path());
        assert!(matches!(result, Err(MindeaseError::Config(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = MindeaseConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.mindease/data");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = MindeaseConfig::default();
        config.voice.language = "ne-NP".to_string();
        config.save(&path).unwrap();

        let reloaded = MindeaseConfig::load(&path).unwrap();
        assert_eq!(reloaded.voice.language, "ne-NP");
        assert_eq!(reloaded.api.base_url, config.api.base_url);
    }

    #[test]
    fn test_base_url_override() {
        let config = MindeaseConfig::default()
            .with_base_url_override(Some("https://chat.example.org/".to_string()));
        assert_eq!(config.api.base_url, "https://chat.example.org");
    }

    #[test]
    fn test_base_url_override_ignores_empty() {
        let config = MindeaseConfig::default().with_base_url_override(Some("  ".to_string()));
        assert_eq!(config.api.base_url, "http://localhost:8080");
        let config = MindeaseConfig::default().with_base_url_override(None);
        assert_eq!(config.api.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_request_timeout_duration() {
        assert_eq!(ApiConfig::default().request_timeout(), Duration::from_secs(10));
    }
}
