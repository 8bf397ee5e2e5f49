//! Persisted voice settings.
//!
//! The manager is the only reader and writer of the stored settings. Stored
//! values are migrated to the current version field by field and validated;
//! any field that is missing, mistyped or out of range falls back to its
//! default instead of failing the load. Changes are published on a `watch`
//! channel.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mindease_core::error::Result;
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::Timestamp;
use mindease_storage::KvRepository;

pub const SETTINGS_VERSION: u32 = 2;

const SETTINGS_KEY: &str = "voice.settings";
const TUTORIAL_KEY: &str = "voice.tutorial_seen";

const RATE_RANGE: RangeInclusive<f32> = 0.1..=10.0;
const VOLUME_RANGE: RangeInclusive<f32> = 0.0..=1.0;
const VAD_RANGE: RangeInclusive<f32> = 0.0..=1.0;
const COOLDOWN_RANGE: RangeInclusive<u64> = 0..=5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub version: u32,
    pub voice_input_enabled: bool,
    pub voice_output_enabled: bool,
    pub speech_rate: f32,
    pub volume: f32,
    pub selected_voice: Option<String>,
    /// Energy level above which a capture frame counts as speech.
    pub vad_threshold: f32,
    /// Minimum gap between capture starts, in milliseconds.
    pub cooldown_period: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            voice_input_enabled: true,
            voice_output_enabled: false,
            speech_rate: 1.0,
            volume: 1.0,
            selected_voice: None,
            vad_threshold: 0.02,
            cooldown_period: 350,
        }
    }
}

/// Partial update for [`VoiceSettingsManager::update`].
#[derive(Debug, Clone, Default)]
pub struct VoiceSettingsUpdate {
    pub voice_input_enabled: Option<bool>,
    pub voice_output_enabled: Option<bool>,
    pub speech_rate: Option<f32>,
    pub volume: Option<f32>,
    /// `Some(None)` clears the selection.
    pub selected_voice: Option<Option<String>>,
    pub vad_threshold: Option<f32>,
    pub cooldown_period: Option<u64>,
}

impl VoiceSettings {
    /// Replace out-of-range fields with their defaults.
    pub fn validated(mut self) -> Self {
        let defaults = VoiceSettings::default();
        if !RATE_RANGE.contains(&self.speech_rate) {
            warn!(value = self.speech_rate, "Invalid speech rate, using default");
            self.speech_rate = defaults.speech_rate;
        }
        if !VOLUME_RANGE.contains(&self.volume) {
            warn!(value = self.volume, "Invalid volume, using default");
            self.volume = defaults.volume;
        }
        if !VAD_RANGE.contains(&self.vad_threshold) {
            warn!(value = self.vad_threshold, "Invalid VAD threshold, using default");
            self.vad_threshold = defaults.vad_threshold;
        }
        if !COOLDOWN_RANGE.contains(&self.cooldown_period) {
            warn!(value = self.cooldown_period, "Invalid cooldown, using default");
            self.cooldown_period = defaults.cooldown_period;
        }
        if self.selected_voice.as_deref().is_some_and(|v| v.trim().is_empty()) {
            self.selected_voice = None;
        }
        self.version = SETTINGS_VERSION;
        self
    }

    fn apply(mut self, update: VoiceSettingsUpdate) -> Self {
        if let Some(v) = update.voice_input_enabled {
            self.voice_input_enabled = v;
        }
        if let Some(v) = update.voice_output_enabled {
            self.voice_output_enabled = v;
        }
        if let Some(v) = update.speech_rate {
            self.speech_rate = v;
        }
        if let Some(v) = update.volume {
            self.volume = v;
        }
        if let Some(v) = update.selected_voice {
            self.selected_voice = v;
        }
        if let Some(v) = update.vad_threshold {
            self.vad_threshold = v;
        }
        if let Some(v) = update.cooldown_period {
            self.cooldown_period = v;
        }
        self
    }
}

/// Build current-version settings from a stored value of any version.
///
/// Version 1 predates `vadThreshold` and `cooldownPeriod`; those take their
/// defaults. Each field is read independently so one bad field does not
/// discard the rest.
pub fn migrate(stored: &Value) -> VoiceSettings {
    let defaults = VoiceSettings::default();
    // Unversioned records are v1. Versions beyond u32 are treated as current.
    let version = stored
        .get("version")
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(SETTINGS_VERSION))
        .unwrap_or(1);

    let flag = |name: &str, default: bool| stored.get(name).and_then(Value::as_bool).unwrap_or(default);
    let number = |name: &str, default: f32| {
        stored
            .get(name)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    };

    let mut settings = VoiceSettings {
        version,
        voice_input_enabled: flag("voiceInputEnabled", defaults.voice_input_enabled),
        voice_output_enabled: flag("voiceOutputEnabled", defaults.voice_output_enabled),
        speech_rate: number("speechRate", defaults.speech_rate),
        volume: number("volume", defaults.volume),
        selected_voice: stored
            .get("selectedVoice")
            .and_then(Value::as_str)
            .map(str::to_string),
        vad_threshold: defaults.vad_threshold,
        cooldown_period: defaults.cooldown_period,
    };

    if version >= 2 {
        settings.vad_threshold = number("vadThreshold", defaults.vad_threshold);
        settings.cooldown_period = stored
            .get("cooldownPeriod")
            .and_then(Value::as_u64)
            .unwrap_or(defaults.cooldown_period);
    } else {
        info!(from = version, to = SETTINGS_VERSION, "Migrating voice settings");
    }

    settings.validated()
}

/// Process-wide owner of the voice settings.
pub struct VoiceSettingsManager {
    repo: KvRepository,
    current: watch::Sender<VoiceSettings>,
    events: EventBus,
}

impl VoiceSettingsManager {
    /// Load, migrate and validate the stored settings. A migrated or repaired
    /// record is written back.
    pub fn load(repo: KvRepository, events: EventBus) -> Result<Self> {
        let stored = repo.get(SETTINGS_KEY)?;
        let settings = match stored.as_deref() {
            None => {
                debug!("No stored voice settings, using defaults");
                VoiceSettings::default()
            }
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    let settings = migrate(&value);
                    if serde_json::to_value(&settings).ok().as_ref() != Some(&value) {
                        repo.set(SETTINGS_KEY, &serde_json::to_string(&settings)?)?;
                    }
                    settings
                }
                Err(e) => {
                    warn!(error = %e, "Stored voice settings unreadable, using defaults");
                    VoiceSettings::default()
                }
            },
        };

        let (current, _) = watch::channel(settings);
        Ok(Self {
            repo,
            current,
            events,
        })
    }

    pub fn current(&self) -> VoiceSettings {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceSettings> {
        self.current.subscribe()
    }

    /// Apply a partial update, validate, persist and publish.
    pub fn update(&self, update: VoiceSettingsUpdate) -> Result<VoiceSettings> {
        let next = self.current().apply(update).validated();
        self.store(next)
    }

    /// Restore defaults.
    pub fn reset(&self) -> Result<VoiceSettings> {
        self.store(VoiceSettings::default())
    }

    fn store(&self, settings: VoiceSettings) -> Result<VoiceSettings> {
        self.repo
            .set(SETTINGS_KEY, &serde_json::to_string(&settings)?)?;
        self.current.send_replace(settings.clone());
        self.events.publish(ChatEvent::SettingsChanged {
            timestamp: Timestamp::now(),
        });
        Ok(settings)
    }

    pub fn tutorial_seen(&self) -> Result<bool> {
        Ok(self.repo.get(TUTORIAL_KEY)?.as_deref() == Some("true"))
    }

    pub fn mark_tutorial_seen(&self) -> Result<()> {
        self.repo.set(TUTORIAL_KEY, "true")
    }
}

// =============================================================================
// Tests
// =============================================================================
