//! Session configuration, stored as JSON next to the application data.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CollaborationError, LockConfig, Result};
use jobs::PollConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the document service
    pub api_url: Option<String>,

    /// How often a held lease is extended
    pub heartbeat_interval_ms: u64,

    /// How often a contested lease is checked for release
    pub availability_poll_interval_ms: u64,

    /// Delay between the last unsubscribe and the release call
    pub release_grace_ms: u64,

    pub job_poll_interval_ms: u64,
    pub job_max_attempts: u32,

    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            heartbeat_interval_ms: 30_000,
            availability_poll_interval_ms: 30_000,
            release_grace_ms: 50,
            job_poll_interval_ms: 5_000,
            job_max_attempts: 120,
            request_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_availability_poll_interval(mut self, interval: Duration) -> Self {
        self.availability_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_job_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.job_poll_interval_ms = interval.as_millis() as u64;
        self.job_max_attempts = max_attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn availability_poll_interval(&self) -> Duration {
        Duration::from_millis(self.availability_poll_interval_ms)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            heartbeat_interval: self.heartbeat_interval(),
            availability_poll_interval: self.availability_poll_interval(),
            release_grace: self.release_grace(),
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(self.job_poll_interval_ms),
            self.job_max_attempts,
        )
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            (
                "availability_poll_interval_ms",
                self.availability_poll_interval_ms,
            ),
            ("job_poll_interval_ms", self.job_poll_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(CollaborationError::Config(format!("{} must be positive", name)));
        }
        if self.job_max_attempts == 0 {
            return Err(CollaborationError::Config(
                "job_max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| CollaborationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration from JSON. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CollaborationError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
