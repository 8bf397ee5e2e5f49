//! CLI argument definitions for the MindEase terminal client.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// MindEase: chat with your wellness companion from the terminal.
#[derive(Parser, Debug)]
#[command(name = "mindease", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory for the local SQLite database.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Backend base URL. Overrides MINDEASE_API_BASE_URL and the config file.
    #[arg(long = "base-url")]
    pub base_url: Option<String>,

    /// Signed-in user id.
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Access token.
    #[arg(long = "token")]
    pub token: Option<String>,

    /// Refresh token used when the access token expires.
    #[arg(long = "refresh-token")]
    pub refresh_token: Option<String>,

    /// Chat session to attach to.
    #[arg(long = "session")]
    pub session: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > MINDEASE_CONFIG env var > ~/.mindease/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("MINDEASE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory, expanding a leading `~`.
    pub fn resolve_data_dir(&self, config_dir: &str) -> PathBuf {
        match self.data_dir {
            Some(ref p) => p.clone(),
            None => expand_home(config_dir),
        }
    }

    /// Resolve the log filter. `None` means use RUST_LOG or the config value.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }

    /// The --base-url override, if given.
    pub fn resolve_base_url(&self) -> Option<String> {
        self.base_url.clone()
    }

    /// Priority: --user flag > MINDEASE_USER_ID env var.
    pub fn resolve_user(&self) -> Option<String> {
        flag_or_env(&self.user, "MINDEASE_USER_ID")
    }

    /// Priority: --token flag > MINDEASE_TOKEN env var.
    pub fn resolve_token(&self) -> Option<String> {
        flag_or_env(&self.token, "MINDEASE_TOKEN")
    }

    /// Priority: --refresh-token flag > MINDEASE_REFRESH_TOKEN env var.
    pub fn resolve_refresh_token(&self) -> Option<String> {
        flag_or_env(&self.refresh_token, "MINDEASE_REFRESH_TOKEN")
    }
}

fn flag_or_env(flag: &Option<String>, var: &str) -> Option<String> {
    flag.clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty())
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME");
    home.ok().map(PathBuf::from)
}

/// Expand `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".mindease").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_args() {
        let args = CliArgs::parse_from(["mindease", "--user", "u1", "--token", "t"]);
        assert_eq!(args.resolve_user().as_deref(), Some("u1"));
        assert_eq!(args.resolve_token().as_deref(), Some("t"));
        assert!(args.resolve_base_url().is_none());
    }

    #[test]
    fn test_explicit_paths_win() {
        let args = CliArgs::parse_from([
            "mindease",
            "-u",
            "u1",
            "--token",
            "t",
            "-c",
            "/tmp/custom.toml",
            "-d",
            "/tmp/data",
        ]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/custom.toml"));
        assert_eq!(args.resolve_data_dir("~/.mindease/data"), PathBuf::from("/tmp/data"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/lib/mindease"), PathBuf::from("/var/lib/mindease"));
        if let Some(home) = home_dir() {
            assert_eq!(expand_home("~/.mindease/data"), home.join(".mindease/data"));
        }
    }
}
