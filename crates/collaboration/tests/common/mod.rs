//! In-memory document service shared by several simulated clients.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use collaboration::*;
use parking_lot::Mutex;

struct Lease {
    holder: String,
    token: String,
    since: DateTime<Utc>,
}

struct ScriptedJob {
    resource: ResourceId,
    statuses: VecDeque<JobStatusReport>,
    result: ThreatModel,
}

#[derive(Default)]
struct ServerState {
    leases: HashMap<ResourceId, Lease>,
    documents: HashMap<ResourceId, DocumentVersion>,
    jobs: HashMap<JobId, ScriptedJob>,
    pending: HashMap<ResourceId, JobId>,
    next_script: Option<(Vec<JobStatusReport>, ThreatModel)>,
    job_checks: HashMap<JobId, usize>,
    next_token: u64,
    next_job: u64,
    clock: i64,
}

impl ServerState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        base_time() + chrono::Duration::minutes(self.clock)
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    offline: Mutex<bool>,
    acquire_latency: Mutex<Option<Duration>>,
    hide_lease_since: Mutex<bool>,
    pub acquires: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub releases: AtomicUsize,
    pub status_checks: AtomicUsize,
    pub saves: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, identity: &str) -> Arc<dyn RemoteResourceClient> {
        Arc::new(FakeClient {
            server: self.clone(),
            identity: identity.to_string(),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn set_acquire_latency(&self, latency: Duration) {
        *self.acquire_latency.lock() = Some(latency);
    }

    /// Lock status responses stop reporting when the lease was taken
    pub fn hide_lease_since(&self, hide: bool) {
        *self.hide_lease_since.lock() = hide;
    }

    pub fn holder(&self, resource: &str) -> Option<String> {
        self.state
            .lock()
            .leases
            .get(&ResourceId::from(resource))
            .map(|lease| lease.holder.clone())
    }

    /// Drops the lease as if it had timed out
    pub fn expire(&self, resource: &str) {
        self.state.lock().leases.remove(&ResourceId::from(resource));
    }

    pub fn seed_document(&self, resource: &str, document: ThreatModel) -> DocumentVersion {
        let mut state = self.state.lock();
        let timestamp = state.tick();
        let version = DocumentVersion::new(resource, document, timestamp).with_owner("alice");
        state
            .documents
            .insert(ResourceId::from(resource), version.clone());
        version
    }

    /// Another writer changes the stored document
    pub fn edit_document(&self, resource: &str, edit: impl FnOnce(&mut ThreatModel)) {
        let mut state = self.state.lock();
        let timestamp = state.tick();
        if let Some(version) = state.documents.get_mut(&ResourceId::from(resource)) {
            edit(&mut version.document);
            version.last_modified_at = timestamp;
        }
    }

    pub fn document(&self, resource: &str) -> Option<DocumentVersion> {
        self.state
            .lock()
            .documents
            .get(&ResourceId::from(resource))
            .cloned()
    }

    /// Status sequence and result for the next requested generation job.
    /// The last status repeats once the sequence is exhausted.
    pub fn script_next_job(&self, statuses: &[JobStatus], result: ThreatModel) {
        let reports = statuses.iter().map(|status| report(*status)).collect();
        self.state.lock().next_script = Some((reports, result));
    }

    /// Registers a job already running for the resource
    pub fn add_pending_job(&self, resource: &str, statuses: &[JobStatus], result: ThreatModel) -> JobId {
        let mut state = self.state.lock();
        let job_id = JobId::new("job-pending");
        state.jobs.insert(
            job_id.clone(),
            ScriptedJob {
                resource: ResourceId::from(resource),
                statuses: statuses.iter().map(|status| report(*status)).collect(),
                result,
            },
        );
        state.pending.insert(ResourceId::from(resource), job_id.clone());
        job_id
    }

    pub fn job_checks(&self, job_id: &JobId) -> usize {
        self.state
            .lock()
            .job_checks
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<()> {
        if *self.offline.lock() {
            Err(CollaborationError::NetworkFailure("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

fn report(status: JobStatus) -> JobStatusReport {
    match status {
        JobStatus::Failed => JobStatusReport::new(status).with_detail("model quota exceeded"),
        _ => JobStatusReport::new(status),
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// One client of the fake service, identified by its user name
pub struct FakeClient {
    server: Arc<FakeServer>,
    identity: String,
}

#[async_trait]
impl RemoteResourceClient for FakeClient {
    async fn acquire_lock(&self, resource: &ResourceId) -> Result<AcquireResponse> {
        self.server.acquires.fetch_add(1, Ordering::SeqCst);
        let latency = *self.server.acquire_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.server.check_online()?;

        let mut state = self.server.state.lock();
        if let Some(lease) = state.leases.get(resource) {
            if lease.holder != self.identity {
                return Ok(AcquireResponse::Conflict {
                    holder: lease.holder.clone(),
                    since: Some(lease.since),
                    message: Some("resource is locked".to_string()),
                });
            }
        }
        state.next_token += 1;
        let token = format!("lease-{}", state.next_token);
        let since = state.tick();
        state.leases.insert(
            resource.clone(),
            Lease {
                holder: self.identity.clone(),
                token: token.clone(),
                since,
            },
        );
        Ok(AcquireResponse::Granted {
            token: LeaseToken::new(token),
        })
    }

    async fn heartbeat(&self, resource: &ResourceId, token: &LeaseToken) -> Result<HeartbeatResponse> {
        self.server.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.server.check_online()?;
        let state = self.server.state.lock();
        match state.leases.get(resource) {
            Some(lease) if lease.token == token.as_str() => Ok(HeartbeatResponse::Extended),
            _ => Ok(HeartbeatResponse::Gone),
        }
    }

    async fn release_lock(&self, resource: &ResourceId, token: &LeaseToken) -> Result<()> {
        self.server.releases.fetch_add(1, Ordering::SeqCst);
        self.server.check_online()?;
        let mut state = self.server.state.lock();
        if state
            .leases
            .get(resource)
            .map_or(false, |lease| lease.token == token.as_str())
        {
            state.leases.remove(resource);
        }
        Ok(())
    }

    async fn lock_status(&self, resource: &ResourceId) -> Result<LockStatus> {
        self.server.status_checks.fetch_add(1, Ordering::SeqCst);
        self.server.check_online()?;
        let hide_since = *self.server.hide_lease_since.lock();
        let state = self.server.state.lock();
        Ok(match state.leases.get(resource) {
            Some(lease) => LockStatus {
                locked: true,
                holder: Some(lease.holder.clone()),
                since: (!hide_since).then_some(lease.since),
                expires_at: None,
            },
            None => LockStatus::free(),
        })
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport> {
        self.server.check_online()?;
        let mut state = self.server.state.lock();
        *state.job_checks.entry(job_id.clone()).or_insert(0) += 1;

        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(JobStatusReport::new(JobStatus::NotFound));
        };
        let next = if job.statuses.len() > 1 {
            job.statuses.pop_front()
        } else {
            job.statuses.front().cloned()
        };
        let report = next.unwrap_or_else(|| JobStatusReport::new(JobStatus::Running));

        if report.status == JobStatus::Complete {
            let resource = job.resource.clone();
            let result = job.result.clone();
            let timestamp = state.tick();
            state.pending.remove(&resource);
            state
                .documents
                .insert(resource.clone(), DocumentVersion::new(resource, result, timestamp));
        }
        Ok(report)
    }

    async fn request_generation(&self, resource: &ResourceId) -> Result<JobId> {
        self.server.check_online()?;
        let mut state = self.server.state.lock();
        state.next_job += 1;
        let job_id = JobId::new(format!("job-{}", state.next_job));
        let (statuses, result) = state
            .next_script
            .take()
            .unwrap_or_else(|| (vec![report(JobStatus::Complete)], ThreatModel::default()));
        state.jobs.insert(
            job_id.clone(),
            ScriptedJob {
                resource: resource.clone(),
                statuses: statuses.into(),
                result,
            },
        );
        state.pending.insert(resource.clone(), job_id.clone());
        Ok(job_id)
    }

    async fn pending_generation(&self, resource: &ResourceId) -> Result<Option<JobId>> {
        self.server.check_online()?;
        Ok(self.server.state.lock().pending.get(resource).cloned())
    }

    async fn fetch_document(&self, resource: &ResourceId) -> Result<DocumentVersion> {
        self.server.check_online()?;
        self.server
            .state
            .lock()
            .documents
            .get(resource)
            .cloned()
            .ok_or_else(|| CollaborationError::Server {
                status: 404,
                message: format!("no document {}", resource),
            })
    }

    async fn save_document(
        &self,
        resource: &ResourceId,
        document: &ThreatModel,
        client_last_modified_at: Option<DateTime<Utc>>,
    ) -> Result<SaveResponse> {
        self.server.saves.fetch_add(1, Ordering::SeqCst);
        self.server.check_online()?;
        let mut state = self.server.state.lock();

        if let Some(current) = state.documents.get(resource) {
            if client_last_modified_at != Some(current.last_modified_at) {
                return Ok(SaveResponse::Conflict {
                    server_version: current.clone(),
                });
            }
        }

        let timestamp = state.tick();
        let version = DocumentVersion::new(resource.clone(), document.clone(), timestamp)
            .with_owner(self.identity.clone());
        state.documents.insert(resource.clone(), version);
        Ok(SaveResponse::Saved {
            last_modified_at: timestamp,
        })
    }
}

pub fn lock_config() -> LockConfig {
    LockConfig {
        heartbeat_interval: Duration::from_secs(30),
        availability_poll_interval: Duration::from_secs(30),
        release_grace: Duration::from_millis(50),
    }
}

/// Lets spawned tasks run; virtual time advances by one millisecond
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub type Recorded = Arc<Mutex<Vec<LockSnapshot>>>;

pub fn recorder() -> (Recorded, impl Fn(&LockSnapshot) + Send + Sync + 'static) {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |lock: &LockSnapshot| sink.lock().push(lock.clone()))
}

pub fn states(recorded: &Recorded) -> Vec<LockState> {
    recorded.lock().iter().map(|lock| lock.state).collect()
}
