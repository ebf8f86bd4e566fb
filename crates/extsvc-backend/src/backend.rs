//! Backend capability traits.
//!
//! Each trait covers one area of the coordination service. Methods return
//! boxed futures so the traits stay object safe and callers can hold an
//! `Arc<dyn Backend>` without knowing which implementation is behind it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::BackendResult;
use crate::types::*;

/// Boxed future returned by every backend call.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Consistent key-value store with session-based locking.
pub trait KvApi: Send + Sync {
    /// Read a single key. `Ok(None)` if it does not exist.
    fn kv_get<'a>(&'a self, key: &'a str, opts: &'a QueryOptions)
    -> BackendFuture<'a, Option<KvPair>>;

    /// Write a key unconditionally.
    fn kv_put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BackendFuture<'a, ()>;

    /// Compare-and-swap acquire: succeeds iff the key is unheld (or already
    /// held by `session`). Returns whether the lock was obtained.
    fn kv_acquire<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        session: &'a str,
    ) -> BackendFuture<'a, bool>;

    /// Compare-and-swap release: succeeds iff the key is unheld or held by
    /// `session`. Returns whether the release was accepted.
    fn kv_release<'a>(&'a self, key: &'a str, session: &'a str) -> BackendFuture<'a, bool>;

    /// Delete a single key. Deleting a missing key succeeds.
    fn kv_delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()>;

    /// Delete every key starting with `prefix`.
    fn kv_delete_tree<'a>(&'a self, prefix: &'a str) -> BackendFuture<'a, ()>;

    /// List every key starting with `prefix`, optionally blocking.
    fn kv_list<'a>(
        &'a self,
        prefix: &'a str,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<KvPair>, QueryMeta)>;
}

/// Ephemeral sessions (leases) bound to health checks.
pub trait SessionApi: Send + Sync {
    /// Create a session and return its id.
    fn session_create<'a>(&'a self, request: &'a SessionRequest) -> BackendFuture<'a, String>;

    /// Destroy a session, releasing every key it holds.
    fn session_destroy<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Look a session up. `Ok(None)` if it no longer exists.
    fn session_info<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Option<SessionEntry>>;
}

/// The local agent: node identity and agent-local checks.
pub trait AgentApi: Send + Sync {
    /// Name of the node the agent runs on.
    fn agent_node_name(&self) -> BackendFuture<'_, String>;

    fn agent_check_register<'a>(&'a self, check: &'a CheckRegistration) -> BackendFuture<'a, ()>;

    /// Remove a check. Fails with `NotFound` if the agent does not know it.
    fn agent_check_deregister<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// All checks registered on the agent, keyed by check id.
    fn agent_checks(&self) -> BackendFuture<'_, HashMap<String, HealthCheck>>;

    /// Mark a TTL check as passing and reset its deadline.
    fn agent_pass_ttl<'a>(&'a self, id: &'a str, note: &'a str) -> BackendFuture<'a, ()>;
}

/// The node/service catalog.
pub trait CatalogApi: Send + Sync {
    fn catalog_register<'a>(&'a self, registration: &'a CatalogRegistration)
    -> BackendFuture<'a, ()>;

    fn catalog_deregister<'a>(
        &'a self,
        deregistration: &'a CatalogDeregistration,
    ) -> BackendFuture<'a, ()>;

    /// Every instance of the named service across all nodes.
    fn catalog_service<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<CatalogService>>;
}

/// Cluster-wide health state.
pub trait HealthApi: Send + Sync {
    /// Every check whose status matches `filter`, optionally blocking.
    fn health_state<'a>(
        &'a self,
        filter: HealthStateFilter,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<HealthCheck>, QueryMeta)>;
}

/// The full capability set extsvc needs from a coordination service.
pub trait Backend: KvApi + SessionApi + AgentApi + CatalogApi + HealthApi {}

impl<T> Backend for T where T: KvApi + SessionApi + AgentApi + CatalogApi + HealthApi {}
