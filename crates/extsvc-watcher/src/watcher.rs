//! ExternalServiceWatcher: per-node leader that reconciles definitions and
//! health into catalog registrations.
//!
//! While leader, two background loops long-poll the backend:
//!
//! - the definition loop lists `ExternalServices/{node}/` and applies each
//!   definition's target state,
//! - the health loop reads every check and reacts to `check:{service}:{node}`
//!   turning passing or critical.
//!
//! Both wake on index changes but re-derive the desired state from scratch
//! every time, so a missed intermediate state never matters. When either
//! loop ends for a reason other than [`stop`](ExternalServiceWatcher::stop)
//! it takes its sibling down with it and flips the watcher to `Stopped`, so
//! whoever drives the watcher notices through [`subscribe`](ExternalServiceWatcher::subscribe).

use std::sync::Arc;
use std::time::Duration;

use extsvc_backend::{Backend, CheckStatus, HealthStateFilter, QueryOptions};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::lock::Lock;
use crate::service::{
    ExternalService, ServiceDefinition, TargetState, node_prefix, parse_check_id,
    parse_definition_key, watcher_lock_key,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Running,
}

/// Handles of the two reconciliation loops.
struct LoopHandles {
    shutdown_tx: Arc<watch::Sender<bool>>,
    definitions: JoinHandle<()>,
    health: JoinHandle<()>,
}

/// Why a reconciliation loop ended.
#[derive(Debug)]
enum LoopExit {
    Stopped,
    LostLeadership,
    Failed(Error),
}

/// Everything a loop task needs, cloned into each.
#[derive(Clone)]
struct LoopContext {
    node: String,
    backend: Arc<dyn Backend>,
    lock: Arc<Lock>,
    wait_time: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<WatcherState>>,
}

pub struct ExternalServiceWatcher {
    node: String,
    backend: Arc<dyn Backend>,
    config: WatcherConfig,
    lock: Arc<Lock>,
    state: Arc<watch::Sender<WatcherState>>,
    loops: Mutex<Option<LoopHandles>>,
}

impl ExternalServiceWatcher {
    /// Create a stopped watcher for `node`. Creates the node's lock key if
    /// needed.
    pub async fn new(backend: Arc<dyn Backend>, node: &str, config: WatcherConfig) -> Result<Self> {
        if config.wait_time.is_zero() {
            return Err(Error::InvalidConfig("wait time must be positive".to_string()));
        }
        config.session.validate()?;
        let lock = Lock::new(Arc::clone(&backend), watcher_lock_key(node), config.session).await?;
        let (state, _) = watch::channel(WatcherState::Stopped);
        Ok(Self {
            node: node.to_string(),
            backend,
            config,
            lock: Arc::new(lock),
            state: Arc::new(state),
            loops: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Receiver that sees every state change, including loops failing.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Take the node's lock and start both loops.
    ///
    /// Does nothing if already running. Fails with a contention error
    /// (`AlreadyHeld`) if another watcher leads this node.
    pub async fn run(&self) -> Result<()> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() && self.state() == WatcherState::Running {
            return Ok(());
        }
        // Loops that ended on their own are still around; reap them.
        if let Some(stale) = loops.take() {
            stale.join().await;
        }

        self.lock.acquire(None).await?;

        let (shutdown_tx, _) = watch::channel(false);
        let ctx = LoopContext {
            node: self.node.clone(),
            backend: Arc::clone(&self.backend),
            lock: Arc::clone(&self.lock),
            wait_time: self.config.wait_time,
            shutdown_tx: Arc::new(shutdown_tx),
            state: Arc::clone(&self.state),
        };
        self.state.send_replace(WatcherState::Running);

        let definitions = tokio::spawn(run_definition_loop(ctx.clone()));
        let health = tokio::spawn(run_health_loop(ctx.clone()));
        *loops = Some(LoopHandles {
            shutdown_tx: ctx.shutdown_tx,
            definitions,
            health,
        });

        info!(node = %self.node, wait_time = ?self.config.wait_time, "watcher running");
        Ok(())
    }

    /// Stop both loops, wait for them, and release the lock if held.
    pub async fn stop(&self) -> Result<()> {
        let handles = self.loops.lock().await.take();
        if let Some(handles) = handles {
            handles.join().await;
        }
        self.state.send_replace(WatcherState::Stopped);

        if self.lock.is_leader().await {
            self.lock.release().await?;
        }
        info!(node = %self.node, "watcher stopped");
        Ok(())
    }

    /// Stop, then destroy the lock and its session.
    pub async fn destroy(&self) -> Result<()> {
        self.stop().await?;
        self.lock.destroy().await?;
        info!(node = %self.node, "watcher destroyed");
        Ok(())
    }

    /// Whether the loops are running and the lock is still ours.
    pub async fn is_leader(&self) -> bool {
        self.state() == WatcherState::Running && self.lock.is_leader().await
    }

    /// One immediate definition pass followed by one health pass.
    ///
    /// Does not require leadership.
    pub async fn reconcile_once(&self) -> Result<()> {
        let opts = QueryOptions::consistent();
        definition_pass(&self.backend, &self.node, &opts).await?;
        health_pass(&self.backend, &self.node, &opts).await?;
        Ok(())
    }
}

impl LoopHandles {
    async fn join(self) {
        self.shutdown_tx.send_replace(true);
        for (name, handle) in [("definitions", self.definitions), ("health", self.health)] {
            if let Err(e) = handle.await {
                error!(loop_name = name, error = %e, "reconciliation loop panicked");
            }
        }
    }
}

impl LoopContext {
    /// Log why a loop ended; anything but a requested stop stops the
    /// sibling loop and marks the watcher stopped.
    fn finish(&self, loop_name: &'static str, exit: LoopExit) {
        match &exit {
            LoopExit::Stopped => {
                debug!(node = %self.node, loop_name, "reconciliation loop stopped");
                return;
            }
            LoopExit::LostLeadership => {
                warn!(node = %self.node, loop_name, "leadership lost, reconciliation loop ending");
            }
            LoopExit::Failed(e) => {
                error!(node = %self.node, loop_name, error = %e, "reconciliation loop failed");
            }
        }
        self.shutdown_tx.send_replace(true);
        self.state.send_replace(WatcherState::Stopped);
    }

    /// After a pass: keep going only if not stopped and still leader.
    async fn should_continue(&self, shutdown: &watch::Receiver<bool>) -> Option<LoopExit> {
        if *shutdown.borrow() {
            return Some(LoopExit::Stopped);
        }
        if !self.lock.is_leader().await {
            return Some(LoopExit::LostLeadership);
        }
        None
    }
}

/// Next blocking-query index: start over if the backend went backwards,
/// never wait on 0.
fn next_index(last: u64, returned: u64) -> u64 {
    if returned < last { 0 } else { returned.max(1) }
}

async fn run_definition_loop(ctx: LoopContext) {
    let mut shutdown = ctx.shutdown_tx.subscribe();
    let mut index = 0;
    debug!(node = %ctx.node, "definition loop starting");

    let exit = loop {
        if *shutdown.borrow() {
            break LoopExit::Stopped;
        }
        let opts = QueryOptions::blocking(index, ctx.wait_time);
        let pass = tokio::select! {
            pass = definition_pass(&ctx.backend, &ctx.node, &opts) => pass,
            _ = shutdown.changed() => break LoopExit::Stopped,
        };
        match pass {
            Ok(returned) => index = next_index(index, returned),
            Err(e) => break LoopExit::Failed(e),
        }
        if let Some(exit) = ctx.should_continue(&shutdown).await {
            break exit;
        }
    };
    ctx.finish("definitions", exit);
}

async fn run_health_loop(ctx: LoopContext) {
    let mut shutdown = ctx.shutdown_tx.subscribe();
    let mut index = 0;
    debug!(node = %ctx.node, "health loop starting");

    let exit = loop {
        if *shutdown.borrow() {
            break LoopExit::Stopped;
        }
        let opts = QueryOptions::blocking(index, ctx.wait_time);
        let pass = tokio::select! {
            pass = health_pass(&ctx.backend, &ctx.node, &opts) => pass,
            _ = shutdown.changed() => break LoopExit::Stopped,
        };
        match pass {
            Ok(returned) => index = next_index(index, returned),
            Err(e) => break LoopExit::Failed(e),
        }
        if let Some(exit) = ctx.should_continue(&shutdown).await {
            break exit;
        }
    };
    ctx.finish("health", exit);
}

/// Errors that end a pass; anything else is logged against the one
/// service and the pass moves on.
fn is_fatal(e: &Error) -> bool {
    e.kind() == ErrorKind::BackendUnavailable
}

/// List this node's definitions and apply each target state.
/// Returns the index the listing was produced at.
async fn definition_pass(backend: &Arc<dyn Backend>, node: &str, opts: &QueryOptions) -> Result<u64> {
    let (pairs, meta) = backend.kv_list(&node_prefix(node), opts).await?;
    debug!(%node, definitions = pairs.len(), index = meta.last_index, "definition pass");

    for pair in pairs {
        let Some((key_node, service)) = parse_definition_key(&pair.key) else {
            continue;
        };
        if key_node != node {
            continue;
        }
        let definition = match ServiceDefinition::decode(&pair.key, &pair.value) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(key = %pair.key, error = %e, "skipping undecodable definition");
                continue;
            }
        };
        let es = ExternalService::from_definition(Arc::clone(backend), service, node, definition);
        if let Err(e) = apply_target_state(&es).await {
            if is_fatal(&e) {
                return Err(e);
            }
            warn!(%service, %node, error = %e, "failed to apply target state");
        }
    }
    Ok(meta.last_index)
}

async fn apply_target_state(es: &ExternalService) -> Result<()> {
    match es.target_state() {
        // The catalog entry only follows a passing check; a missing check
        // is created and left for the health loop to act on.
        TargetState::Running => match es.check_status().await? {
            CheckStatus::Unknown => {
                es.register_check().await?;
            }
            CheckStatus::Passing => es.register().await?,
            _ => {}
        },
        TargetState::Stopped => es.unregister().await?,
        TargetState::Deleted => {
            es.unregister().await?;
            es.destroy().await?;
        }
    }
    Ok(())
}

/// Read every check and react to this node's external service checks.
/// Returns the index the health state was produced at.
async fn health_pass(backend: &Arc<dyn Backend>, node: &str, opts: &QueryOptions) -> Result<u64> {
    let (checks, meta) = backend.health_state(HealthStateFilter::Any, opts).await?;
    debug!(%node, checks = checks.len(), index = meta.last_index, "health pass");

    for check in checks {
        let Some((service, check_node)) = parse_check_id(&check.check_id) else {
            continue;
        };
        if check_node != node {
            continue;
        }
        let outcome = match ExternalService::load(Arc::clone(backend), service, node).await {
            Ok(Some(es)) => apply_health(&es, check.status).await,
            Ok(None) => remove_orphan_check(backend, &check.check_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            if is_fatal(&e) {
                return Err(e);
            }
            warn!(%service, %node, error = %e, "failed to apply health change");
        }
    }
    Ok(meta.last_index)
}

async fn apply_health(es: &ExternalService, status: CheckStatus) -> Result<()> {
    match (status, es.target_state()) {
        (CheckStatus::Passing, TargetState::Running) => es.register().await,
        (CheckStatus::Critical, TargetState::Running) => {
            info!(service = %es.service(), node = %es.node(), "health check critical, unregistering");
            es.unregister().await
        }
        (CheckStatus::Critical, _) => es.unregister_service().await,
        _ => Ok(()),
    }
}

async fn remove_orphan_check(backend: &Arc<dyn Backend>, check_id: &str) -> Result<()> {
    match backend.agent_check_deregister(check_id).await {
        Ok(()) => {
            info!(check = %check_id, "removed check without definition");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
