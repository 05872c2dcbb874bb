//! HTTP implementation of [`RemoteResourceClient`]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{
    AcquireResponse, CollaborationError, DocumentVersion, HeartbeatResponse, LeaseToken,
    LockStatus, RemoteResourceClient, ResourceId, Result, SaveResponse, SessionConfig,
    TokenProvider,
};
use jobs::{JobId, JobStatus, JobStatusReport};
use threat_model::ThreatModel;

impl From<reqwest::Error> for CollaborationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::SerializationError(e.to_string())
        } else {
            Self::NetworkFailure(e.to_string())
        }
    }
}

/// Talks to the document service over JSON/HTTP with bearer credentials
#[derive(Clone)]
pub struct HttpResourceClient {
    base: Url,
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpResourceClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        Self::with_client(base_url, reqwest::Client::new(), tokens)
    }

    pub fn from_config(config: &SessionConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let base_url = config
            .api_url
            .as_deref()
            .ok_or_else(|| CollaborationError::Config("api_url is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CollaborationError::Config(e.to_string()))?;
        Self::with_client(base_url, client, tokens)
    }

    fn with_client(
        base_url: &str,
        client: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| CollaborationError::Config(format!("invalid api_url {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(CollaborationError::Config(format!(
                "api_url {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            base,
            client,
            tokens,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.url(segments);
        debug!(%method, %url, "request");
        let token = self.tokens.bearer_token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }
}

/// Turns an unexpected status into an error, keeping the body as message
async fn unexpected(response: Response) -> CollaborationError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CollaborationError::Unauthorized(
            if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        ),
        _ => CollaborationError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

async fn expect_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(unexpected(response).await)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockGranted {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockHeld {
    #[serde(default)]
    holder: Option<String>,
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobCreated {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingJob {
    #[serde(default)]
    job_id: Option<JobId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest<'a> {
    document: &'a ThreatModel,
    client_last_modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Saved {
    last_modified_at: DateTime<Utc>,
}

/// Document body as served; the resource id comes from the request path
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionBody {
    document: ThreatModel,
    last_modified_at: DateTime<Utc>,
    #[serde(default)]
    owner: Option<String>,
}

impl VersionBody {
    fn into_version(self, resource: &ResourceId) -> DocumentVersion {
        DocumentVersion {
            resource_id: resource.clone(),
            document: self.document,
            last_modified_at: self.last_modified_at,
            owner: self.owner,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveRejected {
    server_version: VersionBody,
    #[serde(default)]
    server_timestamp: Option<DateTime<Utc>>,
}

impl SaveRejected {
    fn into_version(self, resource: &ResourceId) -> DocumentVersion {
        let mut version = self.server_version.into_version(resource);
        if let Some(timestamp) = self.server_timestamp {
            version.last_modified_at = timestamp;
        }
        version
    }
}

#[async_trait]
impl RemoteResourceClient for HttpResourceClient {
    async fn acquire_lock(&self, resource: &ResourceId) -> Result<AcquireResponse> {
        let response = self
            .request(Method::POST, &[resource.as_str(), "lock"])
            .await?
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let held: LockHeld = response.json().await?;
            return Ok(AcquireResponse::Conflict {
                holder: held.holder.unwrap_or_else(|| "another user".to_string()),
                since: held.since,
                message: held.message,
            });
        }

        let granted: LockGranted = expect_success(response).await?.json().await?;
        match granted.token.filter(|t| granted.success && !t.is_empty()) {
            Some(token) => Ok(AcquireResponse::Granted {
                token: LeaseToken::new(token),
            }),
            None => Err(CollaborationError::Server {
                status: StatusCode::OK.as_u16(),
                message: "lock response carried no token".to_string(),
            }),
        }
    }

    async fn heartbeat(&self, resource: &ResourceId, token: &LeaseToken) -> Result<HeartbeatResponse> {
        let response = self
            .request(Method::PUT, &[resource.as_str(), "lock", "heartbeat"])
            .await?
            .json(&TokenBody {
                token: token.as_str(),
            })
            .send()
            .await?;

        if response.status() == StatusCode::GONE {
            return Ok(HeartbeatResponse::Gone);
        }
        expect_success(response).await?;
        Ok(HeartbeatResponse::Extended)
    }

    async fn release_lock(&self, resource: &ResourceId, token: &LeaseToken) -> Result<()> {
        let response = self
            .request(Method::DELETE, &[resource.as_str(), "lock"])
            .await?
            .json(&TokenBody {
                token: token.as_str(),
            })
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn lock_status(&self, resource: &ResourceId) -> Result<LockStatus> {
        let response = self
            .request(Method::GET, &[resource.as_str(), "lock", "status"])
            .await?
            .send()
            .await?;
        Ok(expect_success(response).await?.json().await?)
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport> {
        let response = self
            .request(Method::GET, &["jobs", job_id.as_str(), "status"])
            .await?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(JobStatusReport::new(JobStatus::NotFound));
        }
        Ok(expect_success(response).await?.json().await?)
    }

    async fn request_generation(&self, resource: &ResourceId) -> Result<JobId> {
        let response = self
            .request(Method::POST, &["documents", resource.as_str(), "generate"])
            .await?
            .send()
            .await?;
        let created: JobCreated = expect_success(response).await?.json().await?;
        Ok(created.job_id)
    }

    async fn pending_generation(&self, resource: &ResourceId) -> Result<Option<JobId>> {
        let response = self
            .request(Method::GET, &["documents", resource.as_str(), "generate"])
            .await?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND
            || response.status() == StatusCode::NO_CONTENT
        {
            return Ok(None);
        }
        let pending: PendingJob = expect_success(response).await?.json().await?;
        Ok(pending.job_id)
    }

    async fn fetch_document(&self, resource: &ResourceId) -> Result<DocumentVersion> {
        let response = self
            .request(Method::GET, &["documents", resource.as_str()])
            .await?
            .send()
            .await?;
        let body: VersionBody = expect_success(response).await?.json().await?;
        Ok(body.into_version(resource))
    }

    async fn save_document(
        &self,
        resource: &ResourceId,
        document: &ThreatModel,
        client_last_modified_at: Option<DateTime<Utc>>,
    ) -> Result<SaveResponse> {
        let response = self
            .request(Method::PUT, &["documents", resource.as_str()])
            .await?
            .json(&SaveRequest {
                document,
                client_last_modified_at,
            })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let rejected: SaveRejected = response.json().await?;
            return Ok(SaveResponse::Conflict {
                server_version: rejected.into_version(resource),
            });
        }

        let saved: Saved = expect_success(response).await?.json().await?;
        Ok(SaveResponse::Saved {
            last_modified_at: saved.last_modified_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticTokenProvider;

    fn client(base: &str) -> HttpResourceClient {
        HttpResourceClient::new(base, Arc::new(StaticTokenProvider::new("t"))).unwrap()
    }

    #[test]
    fn test_url_building() {
        let c = client("https://api.example.com/v1/");
        assert_eq!(
            c.url(&["tm-1", "lock", "heartbeat"]).as_str(),
            "https://api.example.com/v1/tm-1/lock/heartbeat"
        );

        let c = client("https://api.example.com");
        assert_eq!(
            c.url(&["jobs", "job-1", "status"]).as_str(),
            "https://api.example.com/jobs/job-1/status"
        );
    }

    #[test]
    fn test_resource_ids_are_escaped() {
        let c = client("https://api.example.com/");
        assert_eq!(
            c.url(&["documents", "a/b c"]).as_str(),
            "https://api.example.com/documents/a%2Fb%20c"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new("t"));
        assert!(matches!(
            HttpResourceClient::new("not a url", tokens.clone()),
            Err(CollaborationError::Config(_))
        ));
        assert!(matches!(
            HttpResourceClient::new("mailto:someone@example.com", tokens),
            Err(CollaborationError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_requires_url() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new("t"));
        assert!(HttpResourceClient::from_config(&SessionConfig::default(), tokens.clone()).is_err());

        let config = SessionConfig::default().with_api_url("http://localhost:8080/api");
        let client = HttpResourceClient::from_config(&config, tokens).unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:8080/api");
    }

    #[test]
    fn test_wire_bodies() {
        let held: LockHeld = serde_json::from_str(
            r#"{"holder":"alice@example.com","since":"2024-05-01T10:00:00Z","message":"locked"}"#,
        )
        .unwrap();
        assert_eq!(held.holder.as_deref(), Some("alice@example.com"));
        assert!(held.since.is_some());

        let status: LockStatus = serde_json::from_str(
            r#"{"locked":true,"holder":"bob","since":"2024-05-01T10:00:00Z","expiresAt":"2024-05-01T10:05:00Z"}"#,
        )
        .unwrap();
        assert!(status.locked);
        assert!(status.expires_at.is_some());

        let report: JobStatusReport =
            serde_json::from_str(r#"{"status":"FINALIZING","attempt":3,"detail":"writing"}"#).unwrap();
        assert_eq!(report.status, JobStatus::Finalizing);
        assert_eq!(report.attempt, 3);

        let pending: PendingJob = serde_json::from_str("{}").unwrap();
        assert!(pending.job_id.is_none());
    }

    #[test]
    fn test_rejected_save_uses_server_timestamp() {
        let rejected: SaveRejected = serde_json::from_str(
            r#"{
                "serverVersion": {
                    "document": {"description": "server copy"},
                    "lastModifiedAt": "2024-05-01T10:00:00Z",
                    "owner": "bob"
                },
                "serverTimestamp": "2024-05-01T11:00:00Z"
            }"#,
        )
        .unwrap();
        let version = rejected.into_version(&ResourceId::from("tm-1"));
        assert_eq!(version.resource_id, ResourceId::from("tm-1"));
        assert_eq!(version.owner.as_deref(), Some("bob"));
        assert_eq!(version.document.description, "server copy");
        assert_eq!(version.last_modified_at.to_rfc3339(), "2024-05-01T11:00:00+00:00");
    }

    #[test]
    fn test_document_body_takes_id_from_request() {
        let body: VersionBody = serde_json::from_str(
            r#"{"document": {"description": "payments"}, "lastModifiedAt": "2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        let version = body.into_version(&ResourceId::from("tm-7"));
        assert_eq!(version.resource_id, ResourceId::from("tm-7"));
        assert_eq!(version.owner, None);
        assert_eq!(version.document.description, "payments");
    }
}
