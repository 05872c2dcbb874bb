//! Tracking of long-running backend jobs.
//!
//! The backend performs generation work that takes minutes. A [`JobPoller`]
//! drives a caller-supplied [`JobSource`] until the job reaches a terminal
//! status or polling stops.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod poller;
pub use poller::*;

mod visibility;
pub use visibility::*;

pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {job_id} already finished as {status}, refusing transition to {attempted}")]
    AlreadyTerminal {
        job_id: JobId,
        status: JobStatus,
        attempted: JobStatus,
    },
}

/// Server-issued job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Finalizing,
    Complete,
    Failed,
    /// The job does not exist (yet); distinct from a job that failed.
    NotFound,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// One answer from the job status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

impl JobStatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            attempt: 0,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Client-side record of a unit of backend work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Number of status checks issued so far
    pub attempt: u32,
    pub detail: Option<String>,
}

impl Job {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            attempt: 0,
            detail: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Records a status report. Once a terminal status has been recorded the
    /// job never changes again.
    pub fn apply(&mut self, report: &JobStatusReport) -> Result<(), JobError> {
        if self.status.is_terminal() && report.status != self.status {
            return Err(JobError::AlreadyTerminal {
                job_id: self.job_id.clone(),
                status: self.status,
                attempted: report.status,
            });
        }
        if self.status.is_terminal() {
            return Ok(());
        }
        self.status = report.status;
        if report.detail.is_some() {
            self.detail = report.detail.clone();
        }
        Ok(())
    }
}

/// Poller settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
        }
    }
}

/// How a poll ended. Transport failures are reported separately as the
/// source's error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Completed(T),
    Failed { detail: Option<String> },
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled,
    NotFound,
}

impl<T> PollOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Renders a duration for display next to a timeout message.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
