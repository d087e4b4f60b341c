use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::event::DEFAULT_EVENT_CAPACITY;
use crate::matching::ReactionPrefixes;
use crate::model::PlatformVersion;
use crate::outbox::{OutboxConfig, DEFAULT_MAX_AGE_MS, DEFAULT_MAX_ENTRIES};
use crate::scanner::DEFAULT_MATCH_WINDOW;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Every tunable of the correlation engine. Missing fields take defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelatorConfig {
    /// Budget for every direct confirmation wait.
    pub confirmation_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Outbox entries older than this are dropped unmatched.
    pub outbox_max_age_ms: u64,
    pub outbox_max_entries: usize,
    /// SQLite file backing the outbox; in-memory when unset.
    pub outbox_path: Option<PathBuf>,
    pub scanner_interval_ms: u64,
    pub observer_interval_ms: u64,
    pub dedup_capacity: usize,
    /// Most-recent candidates considered per outbox entry.
    pub match_window: usize,
    pub event_capacity: usize,
    pub private_api_enabled: bool,
    pub platform_version: PlatformVersion,
    pub staging_dir: PathBuf,
    pub reaction_prefixes: ReactionPrefixes,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 30_000,
            poll_interval_ms: 500,
            outbox_max_age_ms: DEFAULT_MAX_AGE_MS,
            outbox_max_entries: DEFAULT_MAX_ENTRIES,
            outbox_path: None,
            scanner_interval_ms: 1_000,
            observer_interval_ms: 1_000,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            match_window: DEFAULT_MATCH_WINDOW,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            private_api_enabled: false,
            platform_version: PlatformVersion::new(13, 0),
            staging_dir: std::env::temp_dir().join("send-correlator").join("staging"),
            reaction_prefixes: ReactionPrefixes::default(),
        }
    }
}

impl CorrelatorConfig {
    /// Reads a JSON config. A missing file yields the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("confirmation_timeout_ms", self.confirmation_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("outbox_max_age_ms", self.outbox_max_age_ms),
            ("scanner_interval_ms", self.scanner_interval_ms),
            ("observer_interval_ms", self.observer_interval_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        if self.poll_interval_ms > self.confirmation_timeout_ms {
            return Err(ConfigError::Invalid(
                "poll_interval_ms cannot exceed confirmation_timeout_ms".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedup_capacity must be greater than 0".into()));
        }
        if self.match_window == 0 {
            return Err(ConfigError::Invalid("match_window must be greater than 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than 0".into()));
        }

        let unknown = self.reaction_prefixes.unknown_keys();
        if !unknown.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "unknown reaction kinds in reaction_prefixes: {}",
                unknown.join(", ")
            )));
        }

        self.outbox_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scanner_interval(&self) -> Duration {
        Duration::from_millis(self.scanner_interval_ms)
    }

    pub fn observer_interval(&self) -> Duration {
        Duration::from_millis(self.observer_interval_ms)
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            max_entries: self.outbox_max_entries,
            max_age_ms: self.outbox_max_age_ms,
        }
    }
}
