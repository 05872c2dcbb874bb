//! Collaborative session coordination for threat model documents.
//!
//! One writer per document is enforced with server-side leases
//! ([`LockCoordinator`]); slow generation work is tracked with the job poller
//! from the `jobs` crate; rejected saves are turned into a reviewable
//! [`ChangeSet`] by the [`ConflictDiffEngine`]. [`SessionOrchestrator`] ties the
//! three together for one document.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod client;
pub use client::*;

mod config;
pub use config::*;

mod conflict;
pub use conflict::*;

mod document;
pub use document::*;

mod generation;
pub use generation::*;

mod http;
pub use http::*;

mod lock;
pub use lock::*;

mod session;
pub use session::*;

pub use jobs::{
    CancellationToken, Job, JobId, JobPoller, JobStatus, JobStatusReport, PageVisibility, PollConfig,
    PollOutcome, VisibilityWatch,
};
pub use threat_model::ThreatModel;

#[derive(Debug, Clone, Error)]
pub enum CollaborationError {
    #[error("resource is being edited by {holder}")]
    LockConflict {
        holder: String,
        since: Option<chrono::DateTime<chrono::Utc>>,
    },

    #[error("edit lease was lost")]
    LockLost,

    #[error("edit lease is not held")]
    LockNotHeld,

    #[error("generation failed: {}", detail_text(.detail))]
    JobFailed { detail: Option<String> },

    #[error("generation did not finish after {attempts} checks ({})", elapsed_text(.elapsed))]
    JobTimedOut { attempts: u32, elapsed: Duration },

    #[error("generation cancelled")]
    JobCancelled,

    #[error("generation job not found: {0}")]
    JobNotFound(JobId),

    #[error("document changed on the server")]
    SaveConflict,

    #[error("cannot compare versions of {0} and {1}")]
    Incomparable(ResourceId, ResourceId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    NetworkFailure(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CollaborationError {
    /// Whether the UI should offer the user a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockConflict { .. }
                | Self::JobFailed { .. }
                | Self::JobTimedOut { .. }
                | Self::NetworkFailure(_)
        )
    }

    /// Cancellation is initiated by the caller and never shown as an error.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::JobCancelled)
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

fn detail_text(detail: &Option<String>) -> &str {
    detail.as_deref().unwrap_or("no detail reported")
}

fn elapsed_text(elapsed: &Duration) -> String {
    jobs::format_elapsed(*elapsed)
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Opaque identifier of a protected document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies one editing session in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease token issued by the server. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LeaseToken(..)")
    }
}
