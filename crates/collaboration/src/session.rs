//! Per-document editing session
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    poll_job, CollaborationError, ConflictDiffEngine, DocumentVersion, LockCoordinator,
    LockSnapshot, LockState, LockSubscription, PendingConflict, ReleaseMode, RemoteJob,
    RemoteResourceClient, Resolution, ResourceId, Result, SaveResponse, SessionId,
};
use jobs::{CancellationToken, Job, JobId, JobPoller};
use threat_model::ThreatModel;

/// Everything a UI needs to render the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Lock(LockSnapshot),
    /// A new generation job was started or picked up; previous results are stale
    GenerationStarted(JobId),
    GenerationProgress(Job),
    GenerationCompleted(DocumentVersion),
    GenerationFailed(CollaborationError),
    GenerationCancelled(JobId),
}

/// Result of a save or of a conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(DocumentVersion),
    /// The server copy changed; the user has to choose a side
    Conflict(PendingConflict),
}

impl SaveOutcome {
    pub fn into_saved(self) -> Result<DocumentVersion> {
        match self {
            Self::Saved(version) => Ok(version),
            Self::Conflict(_) => Err(CollaborationError::SaveConflict),
        }
    }
}

struct SessionShared {
    session_id: SessionId,
    resource: ResourceId,
    client: Arc<dyn RemoteResourceClient>,
    locks: LockCoordinator,
    poller: JobPoller,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    document: Mutex<Option<DocumentVersion>>,
    /// Latest progress of the tracked generation job
    progress: Mutex<Option<Job>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // A closed receiver just means nobody is listening anymore
            let _ = tx.send(event);
        }
    }

    async fn run_generation(&self, job_id: JobId, cancel: CancellationToken) -> Result<DocumentVersion> {
        info!(session = %self.session_id, resource = %self.resource, job = %job_id, "tracking generation");
        self.emit(SessionEvent::GenerationStarted(job_id.clone()));

        let job = RemoteJob::new(self.client.clone(), self.resource.clone(), job_id.clone());
        let result = poll_job(&self.poller, &job, &cancel, |progress: &Job| {
            *self.progress.lock() = Some(progress.clone());
            self.emit(SessionEvent::GenerationProgress(progress.clone()))
        })
        .await;

        match &result {
            Ok(version) => {
                *self.document.lock() = Some(version.clone());
                self.emit(SessionEvent::GenerationCompleted(version.clone()));
            }
            Err(CollaborationError::JobCancelled) => {
                debug!(job = %job_id, "generation poll cancelled");
                self.emit(SessionEvent::GenerationCancelled(job_id));
            }
            Err(e) => {
                warn!(job = %job_id, "generation ended with error: {}", e);
                self.emit(SessionEvent::GenerationFailed(e.clone()));
            }
        }
        result
    }

    fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        self.document.lock().as_ref().map(|v| v.last_modified_at)
    }

    fn owner(&self) -> Option<String> {
        self.document.lock().as_ref().and_then(|v| v.owner.clone())
    }
}

struct GenerationTask {
    job_id: JobId,
    cancel: CancellationToken,
    handle: JoinHandle<Result<DocumentVersion>>,
}

/// Composes the lease, generation polling and save reconciliation for one
/// document.
pub struct SessionOrchestrator {
    shared: Arc<SessionShared>,
    subscription: Mutex<Option<LockSubscription>>,
    /// At most one generation poll per session
    generation: tokio::sync::Mutex<Option<GenerationTask>>,
    active_cancel: Mutex<Option<CancellationToken>>,
}

impl SessionOrchestrator {
    pub fn new(
        resource: impl Into<ResourceId>,
        client: Arc<dyn RemoteResourceClient>,
        locks: LockCoordinator,
        poller: JobPoller,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                session_id: SessionId::new(),
                resource: resource.into(),
                client,
                locks,
                poller,
                events: Mutex::new(None),
                document: Mutex::new(None),
                progress: Mutex::new(None),
            }),
            subscription: Mutex::new(None),
            generation: tokio::sync::Mutex::new(None),
            active_cancel: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.shared.resource
    }

    /// Subscribes to the lease, loads the document and resumes a generation
    /// job left running by a previous session. Returns the event stream.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.events.lock() = Some(tx.clone());

        info!(session = %self.shared.session_id, resource = %self.shared.resource, "session started");
        let subscription = self.shared.locks.subscribe(
            self.shared.resource.clone(),
            move |lock: &LockSnapshot| {
                let _ = tx.send(SessionEvent::Lock(lock.clone()));
            },
        );
        // Replacing an earlier subscription keeps the lease: the new one is
        // registered before the old one goes away
        *self.subscription.lock() = Some(subscription);

        let version = self.shared.client.fetch_document(&self.shared.resource).await?;
        *self.shared.document.lock() = Some(version);

        if let Some(job_id) = self.shared.client.pending_generation(&self.shared.resource).await? {
            info!(job = %job_id, "resuming pending generation");
            let mut generation = self.generation.lock().await;
            self.supersede(&mut generation).await;
            self.shared.progress.lock().take();
            *generation = Some(self.spawn_generation(job_id));
        }

        Ok(rx)
    }

    /// Requests a new generation job, superseding any poll still running.
    /// Progress of the superseded job is cleared before the request is made.
    pub async fn generate(&self) -> Result<JobId> {
        self.cancel_generation();
        let mut generation = self.generation.lock().await;
        self.supersede(&mut generation).await;
        self.shared.progress.lock().take();

        let job_id = self
            .shared
            .client
            .request_generation(&self.shared.resource)
            .await?;
        *generation = Some(self.spawn_generation(job_id.clone()));
        Ok(job_id)
    }

    /// Waits for the current generation poll. `None` when nothing is running.
    pub async fn wait_generation(&self) -> Option<Result<DocumentVersion>> {
        let task = self.generation.lock().await.take()?;
        Some(join_generation(task).await)
    }

    /// Cancels the running generation poll, if any. The job keeps running on
    /// the server.
    pub fn cancel_generation(&self) {
        if let Some(cancel) = self.active_cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    /// Saves the local document against the last server timestamp seen.
    pub async fn save(&self, document: ThreatModel) -> Result<SaveOutcome> {
        self.ensure_writable()?;
        let since = self.shared.last_modified_at();
        self.submit(document, since).await
    }

    /// Settles a conflict returned by [`save`](Self::save).
    pub async fn resolve(&self, conflict: PendingConflict, resolution: Resolution) -> Result<SaveOutcome> {
        match resolution {
            Resolution::KeepLocal => {
                self.ensure_writable()?;
                info!(resource = %self.shared.resource, "overriding server copy with local document");
                self.submit(conflict.local, Some(conflict.server.last_modified_at))
                    .await
            }
            Resolution::AcceptServer => {
                info!(resource = %self.shared.resource, "adopting server copy");
                *self.shared.document.lock() = Some(conflict.server.clone());
                Ok(SaveOutcome::Saved(conflict.server))
            }
        }
    }

    /// Ends the session. When the page is unloading the lease is released
    /// without waiting for the server.
    pub async fn end(&self, unloading: bool) {
        info!(session = %self.shared.session_id, resource = %self.shared.resource, unloading, "session ended");
        self.cancel_generation();
        if unloading {
            self.shared
                .locks
                .release(&self.shared.resource, ReleaseMode::BestEffort)
                .await;
        }
        // Otherwise the last unsubscribe releases after the grace delay
        self.subscription.lock().take();
    }

    pub fn document(&self) -> Option<DocumentVersion> {
        self.shared.document.lock().clone()
    }

    /// Progress of the job being tracked, if any
    pub fn generation_progress(&self) -> Option<Job> {
        self.shared.progress.lock().clone()
    }

    pub fn lock_state(&self) -> Option<LockSnapshot> {
        self.shared.locks.snapshot(&self.shared.resource)
    }

    fn ensure_writable(&self) -> Result<()> {
        let snapshot = self.lock_state();
        match snapshot {
            Some(lock) if lock.state == LockState::Held => Ok(()),
            Some(LockSnapshot {
                state: LockState::Contested,
                holder,
                held_since,
                ..
            }) => Err(CollaborationError::LockConflict {
                holder: holder.unwrap_or_default(),
                since: held_since,
            }),
            Some(LockSnapshot {
                state: LockState::Lost,
                ..
            }) => Err(CollaborationError::LockLost),
            _ => Err(CollaborationError::LockNotHeld),
        }
    }

    async fn submit(&self, document: ThreatModel, since: Option<DateTime<Utc>>) -> Result<SaveOutcome> {
        let resource = &self.shared.resource;
        match self.shared.client.save_document(resource, &document, since).await? {
            SaveResponse::Saved { last_modified_at } => {
                debug!(resource = %resource, "document saved");
                let mut version = DocumentVersion::new(resource.clone(), document, last_modified_at);
                version.owner = self.shared.owner();
                *self.shared.document.lock() = Some(version.clone());
                Ok(SaveOutcome::Saved(version))
            }
            SaveResponse::Conflict { server_version } => {
                info!(resource = %resource, "save rejected, server copy changed");
                let local = DocumentVersion::new(
                    resource.clone(),
                    document,
                    since.unwrap_or(server_version.last_modified_at),
                );
                let changes = ConflictDiffEngine::diff(&local, &server_version)?;
                Ok(SaveOutcome::Conflict(PendingConflict {
                    local: local.document,
                    server: server_version,
                    changes,
                }))
            }
        }
    }

    /// Cancels and joins the previous poll so two never run at once.
    async fn supersede(&self, generation: &mut Option<GenerationTask>) {
        if let Some(task) = generation.take() {
            debug!(job = %task.job_id, "superseding generation poll");
            task.cancel.cancel();
            let _ = join_generation(task).await;
        }
    }

    fn spawn_generation(&self, job_id: JobId) -> GenerationTask {
        let cancel = CancellationToken::new();
        *self.active_cancel.lock() = Some(cancel.clone());

        let shared = self.shared.clone();
        let token = cancel.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move { shared.run_generation(id, token).await });

        GenerationTask {
            job_id,
            cancel,
            handle,
        }
    }
}

async fn join_generation(task: GenerationTask) -> Result<DocumentVersion> {
    match task.handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!(job = %task.job_id, "generation task ended abnormally: {}", e);
            Err(CollaborationError::JobCancelled)
        }
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.cancel_generation();
    }
}
