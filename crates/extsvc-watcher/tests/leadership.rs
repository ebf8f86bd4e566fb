//! Leadership tests: one watcher per node, failover on lease loss, and the
//! driver state machine.

#[macro_use]
mod common;

use std::sync::Arc;

use extsvc_backend::CheckStatus;
use extsvc_watcher::{DriverState, LeadershipDriver, TargetState, WatcherState};
use tokio::sync::watch;

use common::*;

#[tokio::test]
async fn second_watcher_on_same_node_is_refused() {
    let (_, backend) = test_backend();
    let first = watcher(&backend, "n1").await;
    let second = watcher(&backend, "n1").await;

    first.run().await.unwrap();
    assert!(first.is_leader().await);

    let err = second.run().await.unwrap_err();
    assert!(err.is_contention());
    assert!(!second.is_leader().await);
    assert_eq!(second.state(), WatcherState::Stopped);

    first.destroy().await.unwrap();
    second.run().await.unwrap();
    assert!(second.is_leader().await);
    assert!(!first.is_leader().await);
    second.destroy().await.unwrap();
}

#[tokio::test]
async fn watchers_of_different_nodes_do_not_contend() {
    let (_, backend) = test_backend();
    let n1 = watcher(&backend, "n1").await;
    let n2 = watcher(&backend, "n2").await;
    n1.run().await.unwrap();
    n2.run().await.unwrap();
    assert!(n1.is_leader().await);
    assert!(n2.is_leader().await);
    n1.destroy().await.unwrap();
    n2.destroy().await.unwrap();
}

#[tokio::test]
async fn lost_lease_stops_loops_and_frees_lock() {
    let (memory, backend) = test_backend();
    let first = watcher(&backend, "n1").await;
    let second = watcher(&backend, "n1").await;
    first.run().await.unwrap();
    let mut states = first.subscribe();

    // The first watcher's lease check fails, as if its process had stalled.
    let session = first.lock().session().unwrap();
    memory
        .set_check_status(session.check_id(), CheckStatus::Critical)
        .unwrap();

    // Loops notice on their next pass and report it.
    states
        .wait_for(|s| *s == WatcherState::Stopped)
        .await
        .unwrap();
    assert!(!first.is_leader().await);

    second.run().await.unwrap();
    assert!(second.is_leader().await);

    // The new leader reconciles.
    let es = define(&backend, "svc", "n1", TargetState::Running).await;
    eventually!("check registered by new leader", check_exists(&es).await);
    pass_check(&memory, &es);
    eventually!("service registered by new leader", is_active(&es).await);

    first.destroy().await.unwrap();
    second.destroy().await.unwrap();
}

#[tokio::test]
async fn expired_own_session_is_replaced_on_next_run() {
    let (memory, backend) = test_backend();
    let w = watcher(&backend, "n1").await;
    w.run().await.unwrap();
    let old = w.lock().session().unwrap();
    memory
        .set_check_status(old.check_id(), CheckStatus::Critical)
        .unwrap();
    eventually!("watcher stopped", w.state() == WatcherState::Stopped);

    w.run().await.unwrap();
    assert!(w.is_leader().await);
    assert_ne!(w.lock().session().unwrap().id(), old.id());
    w.destroy().await.unwrap();
}

#[tokio::test]
async fn backend_outage_surfaces_as_stopped() {
    let (memory, backend) = test_backend();
    let w = watcher(&backend, "n1").await;
    w.run().await.unwrap();

    memory.set_offline(true);
    eventually!("watcher stopped", w.state() == WatcherState::Stopped);
    assert!(!w.is_leader().await);

    memory.set_offline(false);
    w.run().await.unwrap();
    assert_eq!(w.state(), WatcherState::Running);
    assert!(w.is_leader().await);
    w.destroy().await.unwrap();
}

// ── Driver ─────────────────────────────────────────────────────

#[tokio::test]
async fn driver_steps_between_states() {
    let (_, backend) = test_backend();
    let other = watcher(&backend, "n1").await;
    other.run().await.unwrap();

    let poll = fast_config().leadership_poll;
    let mut driver = LeadershipDriver::new(watcher(&backend, "n1").await, poll);
    assert_eq!(driver.step().await, DriverState::SeekingLeadership);

    other.destroy().await.unwrap();
    assert_eq!(driver.step().await, DriverState::Leading);
    assert_eq!(driver.step().await, DriverState::Leading);

    driver.watcher().stop().await.unwrap();
    assert_eq!(driver.step().await, DriverState::SeekingLeadership);
    driver.watcher().destroy().await.unwrap();
}

#[tokio::test]
async fn driver_leads_until_shutdown_then_destroys() {
    let (memory, backend) = test_backend();
    let w = watcher(&backend, "n1").await;
    let driver = LeadershipDriver::new(Arc::clone(&w), fast_config().leadership_poll);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(driver.run(shutdown_rx));

    eventually!("driver leading", w.is_leader().await);
    let es = define(&backend, "svc", "n1", TargetState::Running).await;
    eventually!("check registered", check_exists(&es).await);
    pass_check(&memory, &es);
    eventually!("service registered", is_active(&es).await);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert!(!w.is_leader().await);
    assert!(w.lock().is_unlocked().await);
    assert!(w.lock().session().is_none());
}

#[tokio::test]
async fn standby_driver_takes_over() {
    let (_, backend) = test_backend();
    let a = watcher(&backend, "n1").await;
    let b = watcher(&backend, "n1").await;
    let poll = fast_config().leadership_poll;
    let (stop_a, rx_a) = watch::channel(false);
    let (stop_b, rx_b) = watch::channel(false);
    let task_a = tokio::spawn(LeadershipDriver::new(Arc::clone(&a), poll).run(rx_a));
    eventually!("a leading", a.is_leader().await);
    let task_b = tokio::spawn(LeadershipDriver::new(Arc::clone(&b), poll).run(rx_b));

    // b keeps seeking while a leads.
    tokio::time::sleep(poll * 3).await;
    assert!(a.is_leader().await);
    assert!(!b.is_leader().await);

    stop_a.send(true).unwrap();
    task_a.await.unwrap().unwrap();
    eventually!("b leading", b.is_leader().await);

    stop_b.send(true).unwrap();
    task_b.await.unwrap().unwrap();
}
