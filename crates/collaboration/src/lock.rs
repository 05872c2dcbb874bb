//! Lease-based edit locks.
//!
//! A [`LockCoordinator`] owns one lease per resource and multiplexes any
//! number of local observers onto it. The first subscriber triggers
//! acquisition; the last one to leave schedules a release after a short grace
//! delay so that a UI re-mount (unsubscribe immediately followed by
//! subscribe) neither leaks nor flaps the lease.
//!
//! Heartbeat, availability-poll and grace timers are spawned tasks whose
//! handles live in the lock entry; dropping a handle aborts the task. Every
//! explicit release moves the entry to a fresh epoch, and asynchronous
//! completions compare epochs before touching the entry.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    AcquireResponse, CollaborationError, HeartbeatResponse, LeaseToken, LockStatus,
    RemoteResourceClient, ResourceId, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockState {
    Unheld,
    Acquiring,
    Held,
    /// Another party holds the lease; we poll until it is released
    Contested,
    /// The lease expired or was taken over while we held it
    Lost,
}

/// What observers see of a lock
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSnapshot {
    pub resource_id: ResourceId,
    pub state: LockState,
    /// Present only while contested
    pub holder: Option<String>,
    pub held_since: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    pub last_error: Option<String>,
}

impl LockSnapshot {
    pub fn can_edit(&self) -> bool {
        self.state == LockState::Held
    }
}

pub trait LockObserver: Send + Sync {
    fn on_lock_state_changed(&self, lock: &LockSnapshot);
}

impl<F> LockObserver for F
where
    F: Fn(&LockSnapshot) + Send + Sync,
{
    fn on_lock_state_changed(&self, lock: &LockSnapshot) {
        self(lock)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Held,
    Contested {
        holder: String,
        since: Option<DateTime<Utc>>,
    },
    /// Another acquisition for the resource is already in flight
    InProgress,
    /// The lock was released while the request was in flight; any lease the
    /// server granted has been handed back
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Wait for the server to confirm the release
    #[default]
    Confirmed,
    /// Fire the release call without waiting, for page teardown. The server
    /// lease expiry covers a lost request.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub heartbeat_interval: Duration,
    pub availability_poll_interval: Duration,
    pub release_grace: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            availability_poll_interval: Duration::from_secs(30),
            release_grace: Duration::from_millis(50),
        }
    }
}

/// Aborts its task when dropped
struct TimerHandle(Option<AbortHandle>);

impl TimerHandle {
    fn new(handle: AbortHandle) -> Self {
        Self(Some(handle))
    }

    /// Forget the task without aborting it. Used by a task clearing its own
    /// handle.
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

type ObserverId = u64;

struct LockEntry {
    state: LockState,
    token: Option<LeaseToken>,
    holder: Option<String>,
    held_since: Option<DateTime<Utc>>,
    observers: Vec<(ObserverId, Arc<dyn LockObserver>)>,
    acquiring: bool,
    epoch: u64,
    /// Heartbeat while held, availability poll while contested
    timer: Option<TimerHandle>,
    grace: Option<TimerHandle>,
    last_error: Option<String>,
}

impl LockEntry {
    fn new(epoch: u64) -> Self {
        Self {
            state: LockState::Unheld,
            token: None,
            holder: None,
            held_since: None,
            observers: Vec::new(),
            acquiring: false,
            epoch,
            timer: None,
            grace: None,
            last_error: None,
        }
    }

    fn snapshot(&self, resource: &ResourceId) -> LockSnapshot {
        debug_assert_eq!(
            self.token.as_ref().map_or(false, |t| !t.is_empty()),
            self.state == LockState::Held
        );
        LockSnapshot {
            resource_id: resource.clone(),
            state: self.state,
            holder: self.holder.clone(),
            held_since: self.held_since,
            subscriber_count: self.observers.len(),
            last_error: self.last_error.clone(),
        }
    }

    fn notification(&self, resource: &ResourceId) -> Notification {
        Notification {
            snapshot: self.snapshot(resource),
            observers: self.observers.iter().map(|(_, o)| o.clone()).collect(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }
}

/// Observer calls collected under the entry lock and delivered after it is
/// released
struct Notification {
    snapshot: LockSnapshot,
    observers: Vec<Arc<dyn LockObserver>>,
}

impl Notification {
    fn deliver(self) {
        for observer in &self.observers {
            observer.on_lock_state_changed(&self.snapshot);
        }
    }
}

struct Shared {
    client: Arc<dyn RemoteResourceClient>,
    config: LockConfig,
    runtime: Handle,
    entries: Mutex<HashMap<ResourceId, LockEntry>>,
    next_id: AtomicU64,
}

/// Process-wide lease coordinator, keyed by resource id.
///
/// Cloning is cheap; clones share the same leases and subscribers.
#[derive(Clone)]
pub struct LockCoordinator {
    shared: Arc<Shared>,
}

static GLOBAL: OnceLock<LockCoordinator> = OnceLock::new();

impl LockCoordinator {
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(client: Arc<dyn RemoteResourceClient>, config: LockConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                runtime: Handle::current(),
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Installs the process-wide coordinator. Later calls return the first
    /// instance and ignore their arguments.
    pub fn install_global(
        client: Arc<dyn RemoteResourceClient>,
        config: LockConfig,
    ) -> &'static LockCoordinator {
        GLOBAL.get_or_init(|| Self::new(client, config))
    }

    pub fn global() -> Option<&'static LockCoordinator> {
        GLOBAL.get()
    }

    pub fn config(&self) -> &LockConfig {
        &self.shared.config
    }

    /// Registers interest in a resource. The observer immediately receives
    /// the current state; the first subscriber starts acquisition.
    pub fn subscribe<O>(&self, resource: ResourceId, observer: O) -> LockSubscription
    where
        O: LockObserver + 'static,
    {
        self.shared.subscribe(resource, Arc::new(observer))
    }

    pub async fn acquire(&self, resource: &ResourceId) -> Result<AcquireOutcome> {
        self.shared.acquire(resource).await
    }

    /// Stops timers, asks the server to release and then clears local state.
    /// Local state is cleared whatever the network outcome.
    pub async fn release(&self, resource: &ResourceId, mode: ReleaseMode) {
        let Some((epoch, token)) = self.shared.begin_release(resource) else {
            return;
        };
        if let Some(token) = token {
            self.shared.send_release(resource, token, mode).await;
        }
        if let Some(notification) = self.shared.finish_release(resource, epoch) {
            notification.deliver();
        }
    }

    /// Queries the server without changing local state
    pub async fn status(&self, resource: &ResourceId) -> Result<LockStatus> {
        self.shared.client.lock_status(resource).await
    }

    pub fn snapshot(&self, resource: &ResourceId) -> Option<LockSnapshot> {
        self.shared
            .entries
            .lock()
            .get(resource)
            .map(|entry| entry.snapshot(resource))
    }

    /// Cancels every timer and hands back every held lease without waiting.
    pub fn shutdown(&self) {
        let drained: Vec<(ResourceId, LockEntry)> = self.shared.entries.lock().drain().collect();
        for (resource, mut entry) in drained {
            entry.timer = None;
            entry.grace = None;
            entry.acquiring = false;
            entry.holder = None;
            entry.held_since = None;
            entry.state = LockState::Unheld;
            if let Some(token) = entry.token.take() {
                self.shared.spawn_release_call(resource.clone(), token);
            }
            entry.notification(&resource).deliver();
        }
    }
}

impl Shared {
    fn next_epoch(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(self: &Arc<Self>, resource: ResourceId, observer: Arc<dyn LockObserver>) -> LockSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (start, snapshot) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(resource.clone())
                .or_insert_with(|| LockEntry::new(self.next_epoch()));
            if entry.grace.take().is_some() {
                debug!(resource = %resource, "pending release cancelled by new subscriber");
            }
            entry.observers.push((id, observer.clone()));
            let start = entry.state == LockState::Unheld && !entry.acquiring;
            (start, entry.snapshot(&resource))
        };

        observer.on_lock_state_changed(&snapshot);

        if start {
            let shared = self.clone();
            let resource = resource.clone();
            self.runtime.spawn(async move {
                // Failures are recorded on the entry and reported to observers
                let _ = shared.acquire(&resource).await;
            });
        }

        LockSubscription {
            shared: Arc::downgrade(self),
            resource,
            id: Some(id),
        }
    }

    fn unsubscribe(self: &Arc<Self>, resource: &ResourceId, id: ObserverId) {
        let notification = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(resource) else {
                return;
            };
            let before = entry.observers.len();
            entry.observers.retain(|(observer, _)| *observer != id);
            if entry.observers.len() == before {
                return;
            }
            if entry.observers.is_empty() {
                debug!(resource = %resource, "last subscriber left, release scheduled");
                entry.grace = Some(self.spawn_grace_release(resource.clone()));
                None
            } else {
                Some(entry.notification(resource))
            }
        };
        if let Some(notification) = notification {
            notification.deliver();
        }
    }

    async fn acquire(self: &Arc<Self>, resource: &ResourceId) -> Result<AcquireOutcome> {
        let (epoch, notification) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(resource.clone())
                .or_insert_with(|| LockEntry::new(self.next_epoch()));
            if entry.state == LockState::Held {
                return Ok(AcquireOutcome::Held);
            }
            if entry.acquiring {
                return Ok(AcquireOutcome::InProgress);
            }
            entry.acquiring = true;
            // A contested lock keeps showing its holder while we retry
            let notification = if entry.state == LockState::Contested {
                None
            } else {
                entry.state = LockState::Acquiring;
                Some(entry.notification(resource))
            };
            (entry.epoch, notification)
        };
        if let Some(notification) = notification {
            notification.deliver();
        }

        let response = self.client.acquire_lock(resource).await;

        let mut entries = self.entries.lock();
        let current = entries
            .get(resource)
            .map_or(false, |entry| entry.is_current(epoch));
        if !current {
            drop(entries);
            if let Ok(AcquireResponse::Granted { token }) = response {
                info!(resource = %resource, "lease granted after release was requested, handing it back");
                self.spawn_release_call(resource.clone(), token);
            }
            return Ok(AcquireOutcome::Abandoned);
        }
        let Some(entry) = entries.get_mut(resource) else {
            return Ok(AcquireOutcome::Abandoned);
        };

        entry.acquiring = false;
        let outcome = match response {
            Ok(AcquireResponse::Granted { token }) => {
                info!(resource = %resource, "lease acquired");
                entry.state = LockState::Held;
                entry.token = Some(token);
                entry.holder = None;
                entry.held_since = Some(Utc::now());
                entry.last_error = None;
                entry.timer = Some(self.spawn_heartbeat(resource.clone(), epoch));
                Ok(AcquireOutcome::Held)
            }
            Ok(AcquireResponse::Conflict {
                holder,
                since,
                message,
            }) => {
                info!(resource = %resource, holder = %holder, "lease held elsewhere");
                entry.state = LockState::Contested;
                entry.token = None;
                entry.holder = Some(holder.clone());
                entry.held_since = since;
                entry.last_error = message;
                if entry.timer.is_none() {
                    entry.timer = Some(self.spawn_availability_poll(resource.clone(), epoch));
                }
                Ok(AcquireOutcome::Contested { holder, since })
            }
            Err(e) => {
                // Never assume ownership on failure
                warn!(resource = %resource, "lease acquisition failed: {}", e);
                if entry.state != LockState::Contested {
                    entry.state = LockState::Unheld;
                }
                entry.token = None;
                entry.last_error = Some(e.to_string());
                Err(e)
            }
        };
        let notification = entry.notification(resource);
        drop(entries);
        notification.deliver();
        outcome
    }

    /// Stops the entry's timers and takes its token so nothing treats the
    /// lease as held while the release call is in flight. Returns the epoch
    /// to hand to [`Shared::finish_release`].
    fn begin_release(&self, resource: &ResourceId) -> Option<(u64, Option<LeaseToken>)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(resource)?;
        entry.epoch = self.next_epoch();
        entry.timer = None;
        entry.grace = None;
        entry.acquiring = false;
        entry.state = LockState::Unheld;
        Some((entry.epoch, entry.token.take()))
    }

    /// Clears what is left of the entry once the release call was attempted.
    /// An acquisition started in between keeps the entry.
    fn finish_release(&self, resource: &ResourceId, epoch: u64) -> Option<Notification> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(resource)?;
        if !entry.is_current(epoch) || entry.acquiring || entry.state != LockState::Unheld {
            return None;
        }
        entry.holder = None;
        entry.held_since = None;
        entry.last_error = None;
        if entry.observers.is_empty() {
            entries.remove(resource);
            None
        } else {
            Some(entry.notification(resource))
        }
    }

    async fn send_release(&self, resource: &ResourceId, token: LeaseToken, mode: ReleaseMode) {
        info!(resource = %resource, ?mode, "releasing lease");
        match mode {
            ReleaseMode::BestEffort => self.spawn_release_call(resource.clone(), token),
            ReleaseMode::Confirmed => {
                if let Err(e) = self.client.release_lock(resource, &token).await {
                    warn!(resource = %resource, "release failed, lease will expire on the server: {}", e);
                }
            }
        }
    }

    fn spawn_release_call(&self, resource: ResourceId, token: LeaseToken) {
        let client = self.client.clone();
        self.runtime.spawn(async move {
            if let Err(e) = client.release_lock(&resource, &token).await {
                warn!(resource = %resource, "best-effort release failed: {}", e);
            }
        });
    }

    fn spawn_grace_release(self: &Arc<Self>, resource: ResourceId) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let grace = self.config.release_grace;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = weak.upgrade() {
                shared.release_if_idle(&resource).await;
            }
        });
        TimerHandle::new(task.abort_handle())
    }

    async fn release_if_idle(&self, resource: &ResourceId) {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(resource) else {
                return;
            };
            if !entry.observers.is_empty() {
                return;
            }
            let Some(grace) = entry.grace.take() else {
                return;
            };
            grace.disarm();
        }
        let Some((epoch, token)) = self.begin_release(resource) else {
            return;
        };
        if let Some(token) = token {
            self.send_release(resource, token, ReleaseMode::Confirmed).await;
        }
        if let Some(notification) = self.finish_release(resource, epoch) {
            notification.deliver();
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, resource: ResourceId, epoch: u64) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.heartbeat(&resource, epoch).await {
                    break;
                }
            }
        });
        TimerHandle::new(task.abort_handle())
    }

    /// Extends the lease once. Returns false when the heartbeat loop should
    /// stop.
    async fn heartbeat(&self, resource: &ResourceId, epoch: u64) -> bool {
        let token = {
            let entries = self.entries.lock();
            match entries.get(resource) {
                Some(entry) if entry.is_current(epoch) && entry.state == LockState::Held => {
                    entry.token.clone()
                }
                _ => None,
            }
        };
        let Some(token) = token else {
            return false;
        };

        debug!(resource = %resource, "heartbeat");
        let response = self.client.heartbeat(resource, &token).await;

        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(resource)
            .filter(|e| e.is_current(epoch) && e.state == LockState::Held)
        else {
            return false;
        };
        match response {
            Ok(HeartbeatResponse::Extended) => {
                entry.last_error = None;
                true
            }
            Ok(HeartbeatResponse::Gone) => {
                warn!(resource = %resource, "lease lost");
                entry.state = LockState::Lost;
                entry.token = None;
                entry.holder = None;
                entry.held_since = None;
                entry.last_error = Some(CollaborationError::LockLost.to_string());
                if let Some(timer) = entry.timer.take() {
                    timer.disarm();
                }
                let notification = entry.notification(resource);
                drop(entries);
                notification.deliver();
                false
            }
            Err(e) => {
                // The server expires the lease if this keeps failing
                warn!(resource = %resource, "heartbeat failed: {}", e);
                entry.last_error = Some(e.to_string());
                true
            }
        }
    }

    fn spawn_availability_poll(self: &Arc<Self>, resource: ResourceId, epoch: u64) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let interval = self.config.availability_poll_interval;
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.check_availability(&resource, epoch).await {
                    break;
                }
            }
        });
        TimerHandle::new(task.abort_handle())
    }

    /// One availability check for a contested lock. Returns false when the
    /// poll loop should stop.
    async fn check_availability(self: &Arc<Self>, resource: &ResourceId, epoch: u64) -> bool {
        {
            let entries = self.entries.lock();
            match entries.get(resource) {
                Some(entry) if entry.is_current(epoch) && entry.state == LockState::Contested => {
                    if entry.acquiring {
                        return true;
                    }
                }
                _ => return false,
            }
        }

        let status = match self.client.lock_status(resource).await {
            Ok(status) => status,
            Err(e) => {
                debug!(resource = %resource, "availability check failed: {}", e);
                return true;
            }
        };

        if !status.locked {
            debug!(resource = %resource, "lease free, acquiring");
            // Spawned separately: acquiring replaces this poll's handle
            let shared = self.clone();
            let resource = resource.clone();
            self.runtime.spawn(async move {
                let _ = shared.acquire(&resource).await;
            });
            return true;
        }

        let notification = {
            let mut entries = self.entries.lock();
            match entries.get_mut(resource) {
                Some(entry) if entry.is_current(epoch) && entry.state == LockState::Contested => {
                    let holder = status.holder.or_else(|| entry.holder.clone());
                    let since = status.since.or(entry.held_since);
                    if holder != entry.holder || since != entry.held_since {
                        entry.holder = holder;
                        entry.held_since = since;
                        Some(entry.notification(resource))
                    } else {
                        None
                    }
                }
                _ => return false,
            }
        };
        if let Some(notification) = notification {
            notification.deliver();
        }
        true
    }
}

/// Interest of one observer in one resource. Unsubscribes when dropped.
pub struct LockSubscription {
    shared: Weak<Shared>,
    resource: ResourceId,
    id: Option<ObserverId>,
}

impl LockSubscription {
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.unsubscribe(&self.resource, id);
            }
        }
    }
}

impl Drop for LockSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for LockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSubscription")
            .field("resource", &self.resource)
            .field("active", &self.id.is_some())
            .finish()
    }
}
