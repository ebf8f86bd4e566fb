//! Shared fixtures for the watcher integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use extsvc_backend::{Backend, CheckStatus, InMemoryBackend};
use extsvc_watcher::{ExternalService, ExternalServiceWatcher, SessionConfig, TargetState, WatcherConfig};

/// Poll an async condition until it holds, failing the test after 10s.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}

pub fn test_backend() -> (Arc<InMemoryBackend>, Arc<dyn Backend>) {
    let memory = Arc::new(InMemoryBackend::new("agent-1"));
    let shared: Arc<dyn Backend> = memory.clone();
    (memory, shared)
}

/// Short blocking waits so loops notice changes quickly.
pub fn fast_config() -> WatcherConfig {
    WatcherConfig {
        wait_time: Duration::from_millis(200),
        leadership_poll: Duration::from_millis(100),
        session: SessionConfig::default(),
    }
}

pub async fn watcher(backend: &Arc<dyn Backend>, node: &str) -> Arc<ExternalServiceWatcher> {
    Arc::new(
        ExternalServiceWatcher::new(Arc::clone(backend), node, fast_config())
            .await
            .unwrap(),
    )
}

pub async fn define(
    backend: &Arc<dyn Backend>,
    service: &str,
    node: &str,
    target: TargetState,
) -> ExternalService {
    let mut es = ExternalService::create(
        Arc::clone(backend),
        service,
        node,
        "10.1.0.7",
        8080,
        "curl -sf http://10.1.0.7:8080/health",
        "10s",
    )
    .await
    .unwrap();
    if target != TargetState::Stopped {
        es.set_target_state(target).await.unwrap();
    }
    es
}

pub async fn is_active(es: &ExternalService) -> bool {
    es.is_active().await.unwrap()
}

pub async fn check_exists(es: &ExternalService) -> bool {
    es.check_exists().await.unwrap()
}

/// Report the service's check as passing, as the agent would after a
/// successful run of its command.
pub fn pass_check(memory: &InMemoryBackend, es: &ExternalService) {
    memory
        .set_check_status(&es.check_id(), CheckStatus::Passing)
        .unwrap();
}
