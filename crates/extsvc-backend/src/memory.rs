//! In-process emulation of a Consul-like coordination backend.
//!
//! `InMemoryBackend` keeps the same observable semantics extsvc depends on:
//! monotonically increasing indices, blocking queries that return when the
//! relevant table index moves past the caller's index, TTL checks that turn
//! critical when their deadline passes, and sessions that are invalidated
//! (releasing their locks) when a bound check turns critical or disappears.
//!
//! Time is read from `tokio::time::Instant`, so tests can drive TTL expiry
//! with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;

/// Wait applied to blocking queries that do not specify one.
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Upper bound on any blocking query.
const MAX_WAIT: Duration = Duration::from_secs(600);

struct KvRecord {
    value: Vec<u8>,
    session: Option<String>,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    /// Set when the holding session was invalidated.
    lock_delay_until: Option<Instant>,
}

struct CheckRecord {
    check: HealthCheck,
    ttl: Option<Duration>,
    deadline: Option<Instant>,
}

struct CatalogRecord {
    address: String,
    service: ServiceRegistration,
}

/// Everything the emulated backend knows, guarded by one mutex.
struct Registry {
    index: u64,
    kv_index: u64,
    checks_index: u64,
    kv: BTreeMap<String, KvRecord>,
    sessions: HashMap<String, SessionEntry>,
    checks: BTreeMap<String, CheckRecord>,
    /// Keyed by `(node, service_id)`.
    catalog: BTreeMap<(String, String), CatalogRecord>,
    offline: bool,
}

impl Registry {
    fn new(node_name: &str) -> Self {
        let mut checks = BTreeMap::new();
        checks.insert(
            NODE_LIVENESS_CHECK.to_string(),
            CheckRecord {
                check: HealthCheck {
                    node: node_name.to_string(),
                    check_id: NODE_LIVENESS_CHECK.to_string(),
                    name: "Serf Health Status".to_string(),
                    status: CheckStatus::Passing,
                    output: "Agent alive and reachable".to_string(),
                    service_id: String::new(),
                },
                ttl: None,
                deadline: None,
            },
        );
        // Indices start at 1: a blocking query with index 0 must never
        // see 0 come back, or callers would spin.
        Self {
            index: 1,
            kv_index: 1,
            checks_index: 1,
            kv: BTreeMap::new(),
            sessions: HashMap::new(),
            checks,
            catalog: BTreeMap::new(),
            offline: false,
        }
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn touch_kv(&mut self) -> u64 {
        let index = self.next_index();
        self.kv_index = index;
        index
    }

    fn touch_checks(&mut self) -> u64 {
        let index = self.next_index();
        self.checks_index = index;
        index
    }

    fn kv_pair(key: &str, record: &KvRecord) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: record.value.clone(),
            session: record.session.clone(),
            create_index: record.create_index,
            modify_index: record.modify_index,
            lock_index: record.lock_index,
        }
    }

    /// Earliest pending TTL deadline, if any.
    fn next_expiry(&self) -> Option<Instant> {
        self.checks.values().filter_map(|c| c.deadline).min()
    }

    /// Turn overdue TTL checks critical and invalidate affected sessions.
    fn expire(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (id, record) in self.checks.iter_mut() {
            if record.deadline.is_some_and(|d| d <= now) {
                record.deadline = None;
                if record.check.status != CheckStatus::Critical {
                    record.check.status = CheckStatus::Critical;
                    record.check.output = "TTL expired".to_string();
                    expired.push(id.clone());
                }
            }
        }
        if !expired.is_empty() {
            debug!(checks = ?expired, "ttl checks expired");
            self.touch_checks();
        }
        self.invalidate_sessions(now);
    }

    /// Destroy every session bound to a check that is critical or gone.
    fn invalidate_sessions(&mut self, now: Instant) {
        let invalid: Vec<SessionEntry> = self
            .sessions
            .values()
            .filter(|s| {
                s.checks.iter().any(|c| match self.checks.get(c) {
                    Some(record) => record.check.status == CheckStatus::Critical,
                    None => true,
                })
            })
            .cloned()
            .collect();

        for session in invalid {
            self.sessions.remove(&session.id);
            debug!(session = %session.id, name = %session.name, "session invalidated");
            let delay_until = (!session.lock_delay.is_zero()).then(|| now + session.lock_delay);
            self.release_held_keys(&session.id, delay_until);
        }
    }

    /// Release every key held by `session_id`.
    fn release_held_keys(&mut self, session_id: &str, delay_until: Option<Instant>) {
        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, r)| r.session.as_deref() == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();
        if held.is_empty() {
            return;
        }
        let index = self.touch_kv();
        for key in held {
            if let Some(record) = self.kv.get_mut(&key) {
                record.session = None;
                record.modify_index = index;
                record.lock_delay_until = delay_until;
            }
        }
    }
}

/// Coordination backend emulated in process.
pub struct InMemoryBackend {
    node_name: String,
    registry: Mutex<Registry>,
    /// Broadcasts the global index after every mutation.
    changes: watch::Sender<u64>,
}

impl InMemoryBackend {
    /// Create an empty backend whose local agent runs on `node_name`.
    pub fn new(node_name: impl Into<String>) -> Self {
        let node_name = node_name.into();
        let registry = Registry::new(&node_name);
        let (changes, _) = watch::channel(registry.index);
        Self {
            node_name,
            registry: Mutex::new(registry),
            changes,
        }
    }

    /// Name of the emulated agent's node.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Simulate the agent evaluating a check.
    ///
    /// Setting a check critical invalidates every session bound to it.
    pub fn set_check_status(&self, id: &str, status: CheckStatus) -> BackendResult<()> {
        self.with_registry(|registry| {
            let record = registry
                .checks
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(format!("check {id}")))?;
            if record.check.status != status {
                record.check.status = status;
                registry.touch_checks();
            }
            registry.invalidate_sessions(Instant::now());
            Ok(())
        })
    }

    /// Make every subsequent call fail with `Unavailable` (or recover).
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.offline = offline;
        }
        // Wake blocked queries so they observe the outage.
        self.changes.send_modify(|_| {});
    }

    /// Run `f` against the registry after applying TTL expiry, and notify
    /// blocked queries if anything changed.
    fn with_registry<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| BackendError::Unavailable("registry lock poisoned".to_string()))?;
        if registry.offline {
            return Err(BackendError::Unavailable(format!(
                "agent {} is offline",
                self.node_name
            )));
        }
        let before = registry.index;
        registry.expire(Instant::now());
        let result = f(&mut registry);
        let after = registry.index;
        drop(registry);
        if after != before {
            self.changes.send_replace(after);
        }
        result
    }

    /// Hold a blocking query until `index_of` moves past `opts.wait_index`,
    /// the wait time elapses, or a TTL deadline needs evaluating.
    async fn block(&self, opts: &QueryOptions, index_of: fn(&Registry) -> u64) -> BackendResult<()> {
        if opts.wait_index == 0 {
            return Ok(());
        }
        let wait = opts.wait_time.unwrap_or(DEFAULT_WAIT).min(MAX_WAIT);
        let deadline = Instant::now() + wait;
        let mut changes = self.changes.subscribe();

        loop {
            let (current, next_expiry) =
                self.with_registry(|r| Ok((index_of(r), r.next_expiry())))?;
            if current > opts.wait_index || Instant::now() >= deadline {
                return Ok(());
            }
            let wake = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

impl KvApi for InMemoryBackend {
    fn kv_get<'a>(
        &'a self,
        key: &'a str,
        _opts: &'a QueryOptions,
    ) -> BackendFuture<'a, Option<KvPair>> {
        Box::pin(async move {
            self.with_registry(|r| Ok(r.kv.get(key).map(|rec| Registry::kv_pair(key, rec))))
        })
    }

    fn kv_put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let index = r.touch_kv();
                match r.kv.get_mut(key) {
                    Some(record) => {
                        record.value = value.to_vec();
                        record.modify_index = index;
                    }
                    None => {
                        r.kv.insert(
                            key.to_string(),
                            KvRecord {
                                value: value.to_vec(),
                                session: None,
                                create_index: index,
                                modify_index: index,
                                lock_index: 0,
                                lock_delay_until: None,
                            },
                        );
                    }
                }
                Ok(())
            })
        })
    }

    fn kv_acquire<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        session: &'a str,
    ) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            self.with_registry(|r| {
                if !r.sessions.contains_key(session) {
                    return Err(BackendError::Rejected(format!("invalid session {session}")));
                }
                let now = Instant::now();
                if let Some(record) = r.kv.get(key) {
                    match record.session.as_deref() {
                        Some(holder) if holder != session => return Ok(false),
                        None if record.lock_delay_until.is_some_and(|t| t > now) => {
                            return Ok(false);
                        }
                        _ => {}
                    }
                }

                let index = r.touch_kv();
                let record = r.kv.entry(key.to_string()).or_insert_with(|| KvRecord {
                    value: Vec::new(),
                    session: None,
                    create_index: index,
                    modify_index: index,
                    lock_index: 0,
                    lock_delay_until: None,
                });
                if record.session.is_none() {
                    record.lock_index += 1;
                }
                record.session = Some(session.to_string());
                record.value = value.to_vec();
                record.modify_index = index;
                record.lock_delay_until = None;
                Ok(true)
            })
        })
    }

    fn kv_release<'a>(&'a self, key: &'a str, session: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            self.with_registry(|r| {
                let holder = match r.kv.get(key) {
                    Some(record) => record.session.clone(),
                    None => return Ok(false),
                };
                match holder.as_deref() {
                    None => Ok(true),
                    Some(h) if h == session => {
                        let index = r.touch_kv();
                        if let Some(record) = r.kv.get_mut(key) {
                            record.session = None;
                            record.modify_index = index;
                        }
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                }
            })
        })
    }

    fn kv_delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                if r.kv.remove(key).is_some() {
                    r.touch_kv();
                }
                Ok(())
            })
        })
    }

    fn kv_delete_tree<'a>(&'a self, prefix: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let before = r.kv.len();
                r.kv.retain(|k, _| !k.starts_with(prefix));
                if r.kv.len() != before {
                    r.touch_kv();
                }
                Ok(())
            })
        })
    }

    fn kv_list<'a>(
        &'a self,
        prefix: &'a str,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<KvPair>, QueryMeta)> {
        Box::pin(async move {
            self.block(opts, |r| r.kv_index).await?;
            self.with_registry(|r| {
                let pairs = r
                    .kv
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, rec)| Registry::kv_pair(k, rec))
                    .collect();
                Ok((pairs, QueryMeta { last_index: r.kv_index }))
            })
        })
    }
}

impl SessionApi for InMemoryBackend {
    fn session_create<'a>(&'a self, request: &'a SessionRequest) -> BackendFuture<'a, String> {
        Box::pin(async move {
            self.with_registry(|r| {
                for check in &request.checks {
                    match r.checks.get(check) {
                        None => {
                            return Err(BackendError::Rejected(format!(
                                "missing check '{check}' registration"
                            )));
                        }
                        Some(record) if record.check.status == CheckStatus::Critical => {
                            return Err(BackendError::Rejected(format!(
                                "check '{check}' is in critical state"
                            )));
                        }
                        Some(_) => {}
                    }
                }
                let id = uuid::Uuid::new_v4().to_string();
                let create_index = r.next_index();
                r.sessions.insert(
                    id.clone(),
                    SessionEntry {
                        id: id.clone(),
                        name: request.name.clone(),
                        node: request.node.clone(),
                        checks: request.checks.clone(),
                        lock_delay: request.lock_delay,
                        create_index,
                    },
                );
                Ok(id)
            })
        })
    }

    fn session_destroy<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                if r.sessions.remove(id).is_some() {
                    r.next_index();
                    r.release_held_keys(id, None);
                }
                Ok(())
            })
        })
    }

    fn session_info<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Option<SessionEntry>> {
        Box::pin(async move { self.with_registry(|r| Ok(r.sessions.get(id).cloned())) })
    }
}

impl AgentApi for InMemoryBackend {
    fn agent_node_name(&self) -> BackendFuture<'_, String> {
        Box::pin(async move { self.with_registry(|_| Ok(self.node_name.clone())) })
    }

    fn agent_check_register<'a>(&'a self, check: &'a CheckRegistration) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let now = Instant::now();
                let status = check.status.unwrap_or(CheckStatus::Critical);
                let ttl = match &check.kind {
                    CheckKind::Ttl(ttl) => Some(*ttl),
                    CheckKind::Script { .. } => None,
                };
                let deadline = match ttl {
                    Some(ttl) if status != CheckStatus::Critical => Some(now + ttl),
                    _ => None,
                };
                r.checks.insert(
                    check.id.clone(),
                    CheckRecord {
                        check: HealthCheck {
                            node: self.node_name.clone(),
                            check_id: check.id.clone(),
                            name: check.name.clone(),
                            status,
                            output: String::new(),
                            service_id: String::new(),
                        },
                        ttl,
                        deadline,
                    },
                );
                r.touch_checks();
                r.invalidate_sessions(now);
                Ok(())
            })
        })
    }

    fn agent_check_deregister<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                if r.checks.remove(id).is_none() {
                    return Err(BackendError::NotFound(format!("unknown check {id}")));
                }
                r.touch_checks();
                r.invalidate_sessions(Instant::now());
                Ok(())
            })
        })
    }

    fn agent_checks(&self) -> BackendFuture<'_, HashMap<String, HealthCheck>> {
        Box::pin(async move {
            self.with_registry(|r| {
                Ok(r
                    .checks
                    .iter()
                    .map(|(id, rec)| (id.clone(), rec.check.clone()))
                    .collect())
            })
        })
    }

    fn agent_pass_ttl<'a>(&'a self, id: &'a str, note: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let record = r
                    .checks
                    .get_mut(id)
                    .ok_or_else(|| BackendError::NotFound(format!("unknown check {id}")))?;
                let ttl = record
                    .ttl
                    .ok_or_else(|| BackendError::Rejected(format!("check {id} is not a TTL check")))?;
                record.deadline = Some(Instant::now() + ttl);
                let changed =
                    record.check.status != CheckStatus::Passing || record.check.output != note;
                record.check.status = CheckStatus::Passing;
                record.check.output = note.to_string();
                if changed {
                    r.touch_checks();
                }
                Ok(())
            })
        })
    }
}

impl CatalogApi for InMemoryBackend {
    fn catalog_register<'a>(
        &'a self,
        registration: &'a CatalogRegistration,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let Some(service) = &registration.service else {
                    return Ok(());
                };
                let key = (registration.node.clone(), service.id.clone());
                let unchanged = r.catalog.get(&key).is_some_and(|existing| {
                    existing.address == registration.address && existing.service == *service
                });
                if !unchanged {
                    r.catalog.insert(
                        key,
                        CatalogRecord {
                            address: registration.address.clone(),
                            service: service.clone(),
                        },
                    );
                    r.next_index();
                }
                Ok(())
            })
        })
    }

    fn catalog_deregister<'a>(
        &'a self,
        deregistration: &'a CatalogDeregistration,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_registry(|r| {
                let before = r.catalog.len();
                match &deregistration.service_id {
                    Some(service_id) => {
                        r.catalog
                            .remove(&(deregistration.node.clone(), service_id.clone()));
                    }
                    None => r.catalog.retain(|(node, _), _| *node != deregistration.node),
                }
                if r.catalog.len() != before {
                    r.next_index();
                }
                Ok(())
            })
        })
    }

    fn catalog_service<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<CatalogService>> {
        Box::pin(async move {
            self.with_registry(|r| {
                Ok(r
                    .catalog
                    .iter()
                    .filter(|(_, rec)| rec.service.name == name)
                    .map(|((node, _), rec)| CatalogService {
                        node: node.clone(),
                        address: rec.address.clone(),
                        service_id: rec.service.id.clone(),
                        service_name: rec.service.name.clone(),
                        service_port: rec.service.port,
                    })
                    .collect())
            })
        })
    }
}

impl HealthApi for InMemoryBackend {
    fn health_state<'a>(
        &'a self,
        filter: HealthStateFilter,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<HealthCheck>, QueryMeta)> {
        Box::pin(async move {
            self.block(opts, |r| r.checks_index).await?;
            self.with_registry(|r| {
                let checks = r
                    .checks
                    .values()
                    .filter(|rec| filter.matches(rec.check.status))
                    .map(|rec| rec.check.clone())
                    .collect();
                Ok((checks, QueryMeta { last_index: r.checks_index }))
            })
        })
    }
}
