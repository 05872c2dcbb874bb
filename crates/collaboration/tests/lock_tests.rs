//! Lease coordination between simulated clients, in virtual time.
mod common;

use std::sync::Arc;
use std::time::Duration;

use collaboration::*;
use common::*;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

fn held(coordinator: &LockCoordinator, resource: &ResourceId) -> bool {
    coordinator
        .snapshot(resource)
        .map_or(false, |lock| lock.state == LockState::Held)
}

#[tokio::test(start_paused = true)]
async fn test_contested_lock_is_handed_over() {
    let server = FakeServer::new();
    let a = LockCoordinator::new(server.client("alice"), lock_config());
    let b = LockCoordinator::new(server.client("bob"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer_a) = recorder();
    let sub_a = a.subscribe(id.clone(), observer_a);
    settle().await;
    assert!(held(&a, &id));

    let (seen_b, observer_b) = recorder();
    let _sub_b = b.subscribe(id.clone(), observer_b);
    settle().await;

    let lock_b = b.snapshot(&id).unwrap();
    assert_eq!(lock_b.state, LockState::Contested);
    assert_eq!(lock_b.holder.as_deref(), Some("alice"));
    assert!(lock_b.held_since.is_some());
    assert!(!lock_b.can_edit());
    assert!(!(held(&a, &id) && held(&b, &id)));

    // Still held by alice at the first availability check
    sleep(Duration::from_secs(30)).await;
    assert_eq!(b.snapshot(&id).unwrap().state, LockState::Contested);

    sub_a.unsubscribe();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.holder("tm-1"), None);
    assert!(a.snapshot(&id).is_none());

    sleep(Duration::from_secs(30)).await;
    assert!(held(&b, &id));
    assert_eq!(server.holder("tm-1").as_deref(), Some("bob"));

    let states = states(&seen_b);
    assert_eq!(states.first(), Some(&LockState::Unheld));
    assert_eq!(states.last(), Some(&LockState::Held));
    assert!(states.contains(&LockState::Contested));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_within_grace_keeps_lease() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, first) = recorder();
    let sub = locks.subscribe(id.clone(), first);
    settle().await;
    assert!(held(&locks, &id));

    drop(sub);
    sleep(Duration::from_millis(10)).await;

    let (seen, second) = recorder();
    let _sub = locks.subscribe(id.clone(), second);
    let initial = seen.lock()[0].clone();
    assert_eq!(initial.state, LockState::Held);
    assert_eq!(initial.subscriber_count, 1);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(count(&server.releases), 0);
    assert_eq!(count(&server.acquires), 1);
    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Held);
    assert_eq!(lock.subscriber_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_stop_once_lost() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (seen, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    settle().await;

    sleep(Duration::from_secs(30)).await;
    assert_eq!(count(&server.heartbeats), 1);
    assert!(held(&locks, &id));

    server.expire("tm-1");
    sleep(Duration::from_secs(30)).await;
    assert_eq!(count(&server.heartbeats), 2);

    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Lost);
    assert!(!lock.can_edit());
    assert!(lock.last_error.is_some());
    assert_eq!(states(&seen).last(), Some(&LockState::Lost));

    sleep(Duration::from_secs(300)).await;
    assert_eq!(count(&server.heartbeats), 2);
    assert_eq!(count(&server.acquires), 1);

    // A fresh acquisition restarts the heartbeat
    assert_eq!(assert_ok!(locks.acquire(&id).await), AcquireOutcome::Held);
    sleep(Duration::from_secs(31)).await;
    assert_eq!(count(&server.heartbeats), 3);
}

#[tokio::test(start_paused = true)]
async fn test_new_subscriber_does_not_reacquire_lost_lease() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, first) = recorder();
    let _sub = locks.subscribe(id.clone(), first);
    settle().await;
    server.expire("tm-1");
    sleep(Duration::from_secs(30)).await;
    assert_eq!(locks.snapshot(&id).unwrap().state, LockState::Lost);

    let (seen, second) = recorder();
    let _late = locks.subscribe(id.clone(), second);
    assert_eq!(states(&seen), vec![LockState::Lost]);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(count(&server.acquires), 1);
    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Lost);
    assert_eq!(lock.subscriber_count, 2);
    assert_eq!(server.holder("tm-1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_survives_network_failure() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (seen, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    settle().await;

    server.set_offline(true);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(count(&server.heartbeats), 1);
    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Held);
    assert!(lock.can_edit());
    assert!(lock.last_error.unwrap().contains("connection refused"));

    server.set_offline(false);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(count(&server.heartbeats), 2);
    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Held);
    assert!(lock.last_error.is_none());
    assert!(!states(&seen).contains(&LockState::Lost));
    assert_eq!(server.holder("tm-1").as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_observers_see_release_after_server_call() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let releases_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = releases_seen.clone();
    let counter = server.clone();
    let _sub = locks.subscribe(id.clone(), move |lock: &LockSnapshot| {
        if lock.state == LockState::Unheld {
            sink.lock().push(count(&counter.releases));
        }
    });
    settle().await;
    assert!(held(&locks, &id));
    releases_seen.lock().clear();

    locks.release(&id, ReleaseMode::Confirmed).await;
    assert_eq!(*releases_seen.lock(), vec![1]);
    assert_eq!(server.holder("tm-1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_contested_lock_keeps_holder_since() {
    let server = FakeServer::new();
    let a = LockCoordinator::new(server.client("alice"), lock_config());
    let b = LockCoordinator::new(server.client("bob"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer_a) = recorder();
    let _sub_a = a.subscribe(id.clone(), observer_a);
    settle().await;
    let (_, observer_b) = recorder();
    let _sub_b = b.subscribe(id.clone(), observer_b);
    settle().await;
    let since = b.snapshot(&id).unwrap().held_since;
    assert!(since.is_some());

    server.hide_lease_since(true);
    sleep(Duration::from_secs(30)).await;
    assert!(count(&server.status_checks) >= 1);
    let lock = b.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Contested);
    assert_eq!(lock.holder.as_deref(), Some("alice"));
    assert_eq!(lock.held_since, since);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_extends_held_lease() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    sleep(Duration::from_secs(95)).await;

    assert_eq!(count(&server.heartbeats), 3);
    assert!(held(&locks, &id));
    assert_eq!(server.holder("tm-1").as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_release_during_acquire_is_honored() {
    let server = FakeServer::new();
    server.set_acquire_latency(Duration::from_secs(1));
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(locks.snapshot(&id).unwrap().state, LockState::Acquiring);

    locks.release(&id, ReleaseMode::Confirmed).await;
    assert_eq!(locks.snapshot(&id).unwrap().state, LockState::Unheld);
    assert_eq!(count(&server.releases), 0);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(locks.snapshot(&id).unwrap().state, LockState::Unheld);
    assert_eq!(count(&server.releases), 1);
    assert_eq!(server.holder("tm-1"), None);
    assert_eq!(count(&server.heartbeats), 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_leaves_lock_unheld() {
    let server = FakeServer::new();
    server.set_offline(true);
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    settle().await;

    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Unheld);
    assert!(lock.last_error.unwrap().contains("connection refused"));

    let err = assert_err!(locks.acquire(&id).await);
    assert!(matches!(err, CollaborationError::NetworkFailure(_)));
    assert!(err.is_retryable());

    server.set_offline(false);
    assert_eq!(assert_ok!(locks.acquire(&id).await), AcquireOutcome::Held);
}

#[tokio::test(start_paused = true)]
async fn test_best_effort_release_clears_state_immediately() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (seen, observer) = recorder();
    let _sub = locks.subscribe(id.clone(), observer);
    settle().await;
    assert!(held(&locks, &id));

    locks.release(&id, ReleaseMode::BestEffort).await;
    assert_eq!(locks.snapshot(&id).unwrap().state, LockState::Unheld);
    assert_eq!(states(&seen).last(), Some(&LockState::Unheld));

    settle().await;
    assert_eq!(count(&server.releases), 1);
    assert_eq!(server.holder("tm-1"), None);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(count(&server.heartbeats), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_share_one_lease() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, first) = recorder();
    let (seen, second) = recorder();
    let sub1 = locks.subscribe(id.clone(), first);
    let sub2 = locks.subscribe(id.clone(), second);
    settle().await;

    assert_eq!(count(&server.acquires), 1);
    assert_eq!(locks.snapshot(&id).unwrap().subscriber_count, 2);
    assert_eq!(seen.lock().last().unwrap().subscriber_count, 2);

    drop(sub1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(count(&server.releases), 0);
    let lock = locks.snapshot(&id).unwrap();
    assert_eq!(lock.state, LockState::Held);
    assert_eq!(lock.subscriber_count, 1);

    drop(sub2);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(count(&server.releases), 1);
    assert_eq!(server.holder("tm-1"), None);
    assert!(locks.snapshot(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let server = FakeServer::new();
    let locks = LockCoordinator::new(server.client("alice"), lock_config());
    let (seen, observer) = recorder();
    let (_, other) = recorder();
    let sub1 = locks.subscribe(ResourceId::from("tm-1"), observer);
    let _sub2 = locks.subscribe(ResourceId::from("tm-2"), other);
    settle().await;
    assert_eq!(server.holder("tm-2").as_deref(), Some("alice"));

    locks.shutdown();
    settle().await;

    assert_eq!(server.holder("tm-1"), None);
    assert_eq!(server.holder("tm-2"), None);
    assert!(locks.snapshot(&ResourceId::from("tm-1")).is_none());
    assert_eq!(states(&seen).last(), Some(&LockState::Unheld));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(count(&server.heartbeats), 0);
    drop(sub1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(count(&server.releases), 2);
}

#[tokio::test(start_paused = true)]
async fn test_status_query_does_not_touch_local_state() {
    let server = FakeServer::new();
    let a = LockCoordinator::new(server.client("alice"), lock_config());
    let b = LockCoordinator::new(server.client("bob"), lock_config());
    let id = ResourceId::from("tm-1");

    let (_, observer) = recorder();
    let _sub = a.subscribe(id.clone(), observer);
    settle().await;

    let status = assert_ok!(b.status(&id).await);
    assert!(status.locked);
    assert_eq!(status.holder.as_deref(), Some("alice"));
    assert!(b.snapshot(&id).is_none());
    assert_eq!(count(&server.acquires), 1);
}
