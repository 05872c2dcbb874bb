//! Narrow interface to the remote document service.
//!
//! Transport, credentials and persistence live behind these traits; the
//! coordination layer only relies on the request/response shapes below.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DocumentVersion, LeaseToken, ResourceId, Result};
use jobs::{JobId, JobStatusReport};
use threat_model::ThreatModel;

/// Answer to a lease acquisition request
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireResponse {
    Granted {
        token: LeaseToken,
    },
    /// Somebody else holds the lease
    Conflict {
        holder: String,
        since: Option<DateTime<Utc>>,
        message: Option<String>,
    },
}

/// Answer to a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResponse {
    Extended,
    /// The lease expired or now belongs to someone else
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn free() -> Self {
        Self {
            locked: false,
            holder: None,
            since: None,
            expires_at: None,
        }
    }
}

/// Answer to a document save
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResponse {
    Saved { last_modified_at: DateTime<Utc> },
    /// The server copy changed since the timestamp the client sent
    Conflict { server_version: DocumentVersion },
}

#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    async fn acquire_lock(&self, resource: &ResourceId) -> Result<AcquireResponse>;

    async fn heartbeat(&self, resource: &ResourceId, token: &LeaseToken) -> Result<HeartbeatResponse>;

    async fn release_lock(&self, resource: &ResourceId, token: &LeaseToken) -> Result<()>;

    async fn lock_status(&self, resource: &ResourceId) -> Result<LockStatus>;

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport>;

    /// Starts a new generation job for the document
    async fn request_generation(&self, resource: &ResourceId) -> Result<JobId>;

    /// Generation job still running for the document, if any
    async fn pending_generation(&self, resource: &ResourceId) -> Result<Option<JobId>>;

    async fn fetch_document(&self, resource: &ResourceId) -> Result<DocumentVersion>;

    async fn save_document(
        &self,
        resource: &ResourceId,
        document: &ThreatModel,
        client_last_modified_at: Option<DateTime<Utc>>,
    ) -> Result<SaveResponse>;
}

/// Supplies short-lived bearer credentials
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// Token provider handing out one fixed credential
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
