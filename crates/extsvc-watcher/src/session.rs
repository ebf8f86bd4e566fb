//! Session: a lease kept alive by a TTL check.
//!
//! The session is bound to its own TTL check and to the agent's node
//! liveness check. A background task passes the TTL check every
//! `refresh_interval`; if the process stalls or dies the check expires,
//! the backend invalidates the session and every lock it holds is freed.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use extsvc_backend::{
    Backend, BackendError, CheckRegistration, CheckStatus, NODE_LIVENESS_CHECK, SessionRequest,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;

/// TTL check id for a session name.
pub fn session_check_id(name: &str) -> String {
    format!("session:{name}")
}

/// Background task passing the TTL check.
struct Refresher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Session {
    id: String,
    name: String,
    check_id: String,
    backend: Arc<dyn Backend>,
    refresher: Mutex<Option<Refresher>>,
    destroyed: AtomicBool,
}

impl Session {
    /// Create a session named `name` (a random UUID if `None`).
    ///
    /// Registers the TTL check, passes it once, starts the refresh task and
    /// creates the lease. If any step fails, whatever was already set up is
    /// torn down again and the error is returned.
    pub async fn create(
        backend: Arc<dyn Backend>,
        name: Option<&str>,
        config: &SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let check_id = session_check_id(&name);

        backend
            .agent_check_register(&CheckRegistration::ttl(&check_id, config.ttl))
            .await?;
        if let Err(e) = backend.agent_pass_ttl(&check_id, "").await {
            remove_check(backend.as_ref(), &check_id).await;
            return Err(e.into());
        }

        let refresher = spawn_refresher(
            Arc::clone(&backend),
            check_id.clone(),
            config.refresh_interval,
        );

        let created = async {
            let node = backend.agent_node_name().await?;
            backend
                .session_create(&SessionRequest {
                    name: name.clone(),
                    node,
                    checks: vec![check_id.clone(), NODE_LIVENESS_CHECK.to_string()],
                    lock_delay: config.lock_delay,
                })
                .await
        }
        .await;

        match created {
            Ok(id) => {
                info!(session = %id, %name, ttl = ?config.ttl, "session created");
                Ok(Self {
                    id,
                    name,
                    check_id,
                    backend,
                    refresher: Mutex::new(Some(refresher)),
                    destroyed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                refresher.stop().await;
                remove_check(backend.as_ref(), &check_id).await;
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check_id(&self) -> &str {
        &self.check_id
    }

    /// Whether the lease exists and every check bound to it that the local
    /// agent reports is passing. Any lookup error counts as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let entry = match self.backend.session_info(&self.id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                debug!(session = %self.id, error = %e, "session lookup failed");
                return false;
            }
        };
        let checks = match self.backend.agent_checks().await {
            Ok(checks) => checks,
            Err(e) => {
                debug!(session = %self.id, error = %e, "check lookup failed");
                return false;
            }
        };
        entry.checks.iter().all(|id| {
            checks
                .get(id)
                .is_none_or(|check| check.status == CheckStatus::Passing)
        })
    }

    /// Whether the backend no longer knows the lease.
    pub async fn is_destroyed(&self) -> bool {
        matches!(self.backend.session_info(&self.id).await, Ok(None))
    }

    /// Stop refreshing, deregister the check and destroy the lease.
    ///
    /// Later calls return `Ok(())` without touching the backend.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_refresh().await;

        let result = async {
            match self.backend.agent_check_deregister(&self.check_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.backend.session_destroy(&self.id).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(session = %self.id, name = %self.name, "session destroyed");
                Ok(())
            }
            Err(e) => {
                // Allow a retry; the refresh task stays stopped.
                self.destroyed.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }
}

impl Session {
    /// Stop passing the TTL check. The lease lapses one TTL later.
    pub(crate) async fn stop_refresh(&self) {
        let refresher = self.refresher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(refresher) = refresher {
            refresher.stop().await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Refresher {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "session refresh task panicked");
        }
    }
}

fn spawn_refresher(backend: Arc<dyn Backend>, check_id: String, period: Duration) -> Refresher {
    let (shutdown_tx, mut shutdown) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The check was passed just before the task started.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = backend.agent_pass_ttl(&check_id, "").await {
                        warn!(check = %check_id, error = %e, "failed to refresh session check");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(check = %check_id, "session refresh stopping");
                    break;
                }
            }
        }
    });

    Refresher {
        shutdown_tx,
        handle,
    }
}

async fn remove_check(backend: &dyn Backend, check_id: &str) {
    match backend.agent_check_deregister(check_id).await {
        Ok(()) => {}
        Err(BackendError::NotFound(_)) => {}
        Err(e) => warn!(check = %check_id, error = %e, "failed to remove session check"),
    }
}
