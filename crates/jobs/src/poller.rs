use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Job, JobId, JobStatus, JobStatusReport, PollConfig, PollOutcome, VisibilityWatch};

/// Status endpoint of one job, plus the call that fetches its final payload
#[async_trait]
pub trait JobSource: Send + Sync {
    type Output: Send;
    type Error: Send;

    fn job_id(&self) -> &JobId;

    async fn check_status(&self) -> Result<JobStatusReport, Self::Error>;

    /// Only called after a `Complete` status was observed
    async fn fetch_result(&self) -> Result<Self::Output, Self::Error>;
}

/// Drives a [`JobSource`] to a terminal status under a bounded number of
/// attempts.
///
/// The cancellation token is checked before every status call and every
/// wait, and interrupts both. While the page is hidden no calls are issued;
/// on becoming visible the next check happens immediately.
#[derive(Debug, Clone)]
pub struct JobPoller {
    config: PollConfig,
    visibility: VisibilityWatch,
}

impl JobPoller {
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            visibility: VisibilityWatch::always_visible(),
        }
    }

    pub fn with_visibility(mut self, visibility: VisibilityWatch) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Polls until the job finishes. `on_update` sees every intermediate
    /// status. Errors from the source end the poll and are returned as is.
    pub async fn poll<S, F>(
        &self,
        source: &S,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<PollOutcome<S::Output>, S::Error>
    where
        S: JobSource + ?Sized,
        F: FnMut(&Job) + Send,
    {
        let started = Instant::now();
        let mut visibility = self.visibility.clone();
        let mut job = Job::new(source.job_id().clone());

        loop {
            if cancel.is_cancelled() {
                debug!(job = %job.job_id, "poll cancelled");
                return Ok(PollOutcome::Cancelled);
            }

            if !visibility.is_visible() {
                debug!(job = %job.job_id, "page hidden, poll suspended");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                    _ = visibility.wait_visible() => {}
                }
            }

            if job.attempt >= self.config.max_attempts {
                return Ok(self.timed_out(&job, started));
            }
            job.attempt += 1;

            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                report = source.check_status() => report?,
            };
            debug!(job = %job.job_id, attempt = job.attempt, status = %report.status, "job status");

            match report.status {
                JobStatus::NotFound => return Ok(PollOutcome::NotFound),
                JobStatus::Failed => {
                    return Ok(PollOutcome::Failed {
                        detail: report.detail,
                    })
                }
                JobStatus::Complete => {
                    if cancel.is_cancelled() {
                        return Ok(PollOutcome::Cancelled);
                    }
                    let output = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                        output = source.fetch_result() => output?,
                    };
                    return Ok(PollOutcome::Completed(output));
                }
                JobStatus::Pending | JobStatus::Running | JobStatus::Finalizing => {
                    if let Err(e) = job.apply(&report) {
                        warn!(job = %job.job_id, "ignoring status report: {}", e);
                    }
                    on_update(&job);
                }
            }

            if job.attempt >= self.config.max_attempts {
                return Ok(self.timed_out(&job, started));
            }

            let sleep = tokio::time::sleep(self.config.interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                    _ = &mut sleep => break,
                    visible = visibility.changed() => {
                        if !visible {
                            debug!(job = %job.job_id, "page hidden, poll suspended");
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                                _ = visibility.wait_visible() => {}
                            }
                            debug!(job = %job.job_id, "page visible, checking immediately");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn timed_out<T>(&self, job: &Job, started: Instant) -> PollOutcome<T> {
        let elapsed = started.elapsed();
        warn!(
            job = %job.job_id,
            attempts = job.attempt,
            "job did not finish after {}",
            crate::format_elapsed(elapsed)
        );
        PollOutcome::TimedOut {
            attempts: job.attempt,
            elapsed,
        }
    }
}
