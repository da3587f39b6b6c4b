//! Coordinator settings loaded from TOML.
//!
//! The baseline in `config/default.toml` is compiled into the binary. Setting
//! `BLOODLINK_CONFIG` to a path replaces it with that file; any key the file
//! omits falls back to the same default.

use std::path::Path;

use bloodlink_blood_models::Urgency;
use bloodlink_matching::MatchSettings;
use chrono::Duration;
use serde::Deserialize;

/// Embedded baseline configuration.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Environment variable naming an override config file.
pub const CONFIG_ENV_VAR: &str = "BLOODLINK_CONFIG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// All coordinator settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub matching: MatchingConfig,
    pub dispatch: DispatchConfig,
    pub lifecycle: LifecycleConfig,
    pub notifier: NotifierConfig,
}

// ── Matching ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub min_candidates: usize,
    pub max_radius_m: f64,
    pub band_width_m: f64,
    pub staleness_minutes: i64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_candidates: 3,
            max_radius_m: 50_000.0,
            band_width_m: 500.0,
            staleness_minutes: 30,
        }
    }
}

impl MatchingConfig {
    #[must_use]
    pub fn settings(&self) -> MatchSettings {
        MatchSettings {
            min_candidates: self.min_candidates.max(1),
            max_radius_m: self.max_radius_m,
            band_width_m: self.band_width_m,
            staleness: Duration::minutes(self.staleness_minutes),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Alerts per round for non-critical requests.
    pub batch_size: usize,
    /// Upper bound on alerts per round for critical requests.
    pub critical_batch_cap: usize,
    pub critical_timeout_secs: i64,
    pub standard_timeout_secs: i64,
    /// Applied to the round timeout when every notified donor is in
    /// emergency mode.
    pub emergency_timeout_factor: f64,
    pub notify_timeout_ms: u64,
    /// Rounds one dispatch call may burn through when nobody can be
    /// notified.
    pub max_rounds_per_dispatch: u32,
    /// Arm a timer per round. When off, rounds only time out through the
    /// sweep or explicit `on_timeout` calls.
    pub schedule_timeouts: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            critical_batch_cap: 25,
            critical_timeout_secs: 300,
            standard_timeout_secs: 1800,
            emergency_timeout_factor: 0.5,
            notify_timeout_ms: 5000,
            max_rounds_per_dispatch: 8,
            schedule_timeouts: true,
        }
    }
}

impl DispatchConfig {
    /// How many alerts a round for `urgency` may send.
    #[must_use]
    pub fn round_size(&self, urgency: Urgency, available: usize) -> usize {
        let limit = if urgency == Urgency::Critical {
            self.critical_batch_cap
        } else {
            self.batch_size
        };
        available.min(limit)
    }

    /// How long donors in a round have to respond.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn round_timeout(&self, urgency: Urgency, all_emergency: bool) -> Duration {
        let secs = if urgency == Urgency::Critical {
            self.critical_timeout_secs
        } else {
            self.standard_timeout_secs
        };
        if all_emergency {
            Duration::milliseconds((secs as f64 * 1000.0 * self.emergency_timeout_factor) as i64)
        } else {
            Duration::seconds(secs)
        }
    }

    #[must_use]
    pub const fn notify_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.notify_timeout_ms)
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub default_lifetime_hours: i64,
    pub sweep_interval_secs: u64,
    /// How long an active request with no round in flight waits before the
    /// sweep searches again.
    pub idle_retry_secs: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_lifetime_hours: 24,
            sweep_interval_secs: 60,
            idle_retry_secs: 300,
        }
    }
}

// ── Notifier ─────────────────────────────────────────────────────────────

/// Where alerts are delivered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifierConfig {
    /// Write alerts to the log (development).
    #[default]
    Log,
    /// POST each alert as JSON to `url`.
    Webhook { url: String },
}

impl CoordinatorConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(toml_str)?)
    }

    /// Loads the file at `path`.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read
    /// * If the file is not valid config TOML
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Loads the override named by `BLOODLINK_CONFIG`, or the embedded
    /// default.
    ///
    /// # Errors
    ///
    /// * If the override file cannot be read or parsed
    /// * If the embedded default fails to parse
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => {
                log::info!("Loading coordinator config from {path}");
                Self::from_path(Path::new(&path))
            }
            _ => Self::from_toml_str(DEFAULT_CONFIG_TOML),
        }
    }
}
