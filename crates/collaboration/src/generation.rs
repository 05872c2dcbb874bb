//! Generation jobs tracked through the remote document service
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{CollaborationError, DocumentVersion, RemoteResourceClient, ResourceId, Result};
use jobs::{CancellationToken, Job, JobId, JobPoller, JobSource, JobStatusReport, PollOutcome};

/// A generation job whose result is the regenerated document
pub struct RemoteJob {
    client: Arc<dyn RemoteResourceClient>,
    resource: ResourceId,
    job_id: JobId,
}

impl RemoteJob {
    pub fn new(client: Arc<dyn RemoteResourceClient>, resource: ResourceId, job_id: JobId) -> Self {
        Self {
            client,
            resource,
            job_id,
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource
    }
}

#[async_trait]
impl JobSource for RemoteJob {
    type Output = DocumentVersion;
    type Error = CollaborationError;

    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    async fn check_status(&self) -> Result<JobStatusReport> {
        self.client.job_status(&self.job_id).await
    }

    async fn fetch_result(&self) -> Result<DocumentVersion> {
        self.client.fetch_document(&self.resource).await
    }
}

/// Polls a generation job to completion and flattens every non-success
/// outcome into the error taxonomy.
pub async fn poll_job<F>(
    poller: &JobPoller,
    job: &RemoteJob,
    cancel: &CancellationToken,
    on_update: F,
) -> Result<DocumentVersion>
where
    F: FnMut(&Job) + Send,
{
    let outcome = poller.poll(job, cancel, on_update).await?;
    outcome_to_result(job.job_id(), outcome)
}

pub(crate) fn outcome_to_result(
    job_id: &JobId,
    outcome: PollOutcome<DocumentVersion>,
) -> Result<DocumentVersion> {
    match outcome {
        PollOutcome::Completed(document) => {
            info!(job = %job_id, "generation complete");
            Ok(document)
        }
        PollOutcome::Failed { detail } => {
            warn!(job = %job_id, "generation failed");
            Err(CollaborationError::JobFailed { detail })
        }
        PollOutcome::TimedOut { attempts, elapsed } => {
            Err(CollaborationError::JobTimedOut { attempts, elapsed })
        }
        PollOutcome::Cancelled => Err(CollaborationError::JobCancelled),
        PollOutcome::NotFound => Err(CollaborationError::JobNotFound(job_id.clone())),
    }
}
