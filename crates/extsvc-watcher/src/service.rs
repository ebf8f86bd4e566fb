//! External service definitions and their registration state machine.
//!
//! A definition lives at `ExternalServices/{node}/{service}` as JSON. While
//! the service is registered it has a catalog entry on `node` and an agent
//! check `check:{service}:{node}` running the definition's command.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use extsvc_backend::{
    Backend, CatalogDeregistration, CatalogRegistration, CheckRegistration, CheckStatus,
    QueryOptions, ServiceRegistration,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Root of the definition namespace.
pub const DEFINITIONS_PREFIX: &str = "ExternalServices";

/// Root of the per-node watcher lock keys.
pub const WATCHERS_PREFIX: &str = "ExternalServicesWatchers";

// ── Naming ─────────────────────────────────────────────────────

pub fn definition_key(node: &str, service: &str) -> String {
    format!("{DEFINITIONS_PREFIX}/{node}/{service}")
}

/// Prefix holding every definition of `node`, with trailing slash.
pub fn node_prefix(node: &str) -> String {
    format!("{DEFINITIONS_PREFIX}/{node}/")
}

pub fn watcher_lock_key(node: &str) -> String {
    format!("{WATCHERS_PREFIX}/{node}")
}

pub fn check_id(service: &str, node: &str) -> String {
    format!("check:{service}:{node}")
}

/// Split `check:{service}:{node}` into `(service, node)`.
pub fn parse_check_id(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix("check:")?;
    let (service, node) = rest.split_once(':')?;
    if service.is_empty() || node.is_empty() || node.contains(':') {
        return None;
    }
    Some((service, node))
}

/// Split `ExternalServices/{node}/{service}` into `(node, service)`.
pub fn parse_definition_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(DEFINITIONS_PREFIX), Some(node), Some(service), None)
            if !node.is_empty() && !service.is_empty() =>
        {
            Some((node, service))
        }
        _ => None,
    }
}

// ── Definition ─────────────────────────────────────────────────

/// What the operator wants for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Running,
    #[default]
    Stopped,
    Deleted,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Running => "running",
            TargetState::Stopped => "stopped",
            TargetState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(TargetState::Running),
            "stopped" => Ok(TargetState::Stopped),
            "deleted" => Ok(TargetState::Deleted),
            other => Err(format!("unknown target state: {other}")),
        }
    }
}

/// Persisted definition of one external service on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceDefinition {
    pub address: String,
    pub port: u16,
    /// Health-check command, run by the agent through `/bin/sh -c`.
    pub command: String,
    /// Reserved.
    pub state: String,
    pub interval: String,
    pub target_state: TargetState,
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            command: String::new(),
            state: String::new(),
            interval: "10s".to_string(),
            target_state: TargetState::Stopped,
        }
    }
}

impl ServiceDefinition {
    pub fn decode(key: &str, value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(|source| Error::Definition {
            key: key.to_string(),
            source,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encode(e.to_string()))
    }
}

// ── ExternalService ────────────────────────────────────────────

/// One (node, service) pair bound to a backend.
pub struct ExternalService {
    service: String,
    node: String,
    definition: ServiceDefinition,
    backend: Arc<dyn Backend>,
}

impl ExternalService {
    /// Persist a new definition with target state `stopped`.
    pub async fn create(
        backend: Arc<dyn Backend>,
        service: &str,
        node: &str,
        address: &str,
        port: u16,
        command: &str,
        interval: &str,
    ) -> Result<Self> {
        let es = Self::from_definition(
            backend,
            service,
            node,
            ServiceDefinition {
                address: address.to_string(),
                port,
                command: command.to_string(),
                interval: interval.to_string(),
                ..Default::default()
            },
        );
        es.save().await?;
        info!(%service, %node, "external service defined");
        Ok(es)
    }

    /// Wrap an already decoded definition.
    pub fn from_definition(
        backend: Arc<dyn Backend>,
        service: &str,
        node: &str,
        definition: ServiceDefinition,
    ) -> Self {
        Self {
            service: service.to_string(),
            node: node.to_string(),
            definition,
            backend,
        }
    }

    /// Load the stored definition. `Ok(None)` if there is none.
    pub async fn load(backend: Arc<dyn Backend>, service: &str, node: &str) -> Result<Option<Self>> {
        let key = definition_key(node, service);
        let Some(pair) = backend.kv_get(&key, &QueryOptions::consistent()).await? else {
            return Ok(None);
        };
        let definition = ServiceDefinition::decode(&key, &pair.value)?;
        Ok(Some(Self::from_definition(backend, service, node, definition)))
    }

    /// Every service defined for `node`, sorted by name. Undecodable
    /// definitions are skipped.
    pub async fn list(backend: Arc<dyn Backend>, node: &str) -> Result<Vec<Self>> {
        let (pairs, _) = backend
            .kv_list(&node_prefix(node), &QueryOptions::consistent())
            .await?;
        let mut services = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let Some((_, service)) = parse_definition_key(&pair.key) else {
                continue;
            };
            match ServiceDefinition::decode(&pair.key, &pair.value) {
                Ok(definition) => services.push(Self::from_definition(
                    Arc::clone(&backend),
                    service,
                    node,
                    definition,
                )),
                Err(e) => debug!(key = %pair.key, error = %e, "skipping definition"),
            }
        }
        Ok(services)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn target_state(&self) -> TargetState {
        self.definition.target_state
    }

    pub fn key(&self) -> String {
        definition_key(&self.node, &self.service)
    }

    pub fn check_id(&self) -> String {
        check_id(&self.service, &self.node)
    }

    pub async fn save(&self) -> Result<()> {
        let value = self.definition.encode()?;
        self.backend.kv_put(&self.key(), &value).await?;
        Ok(())
    }

    /// Change the check interval in memory. Call [`save`](Self::save) to persist.
    pub fn set_check_interval(&mut self, interval: &str) {
        self.definition.interval = interval.to_string();
    }

    /// Change the target state and persist it.
    pub async fn set_target_state(&mut self, state: TargetState) -> Result<()> {
        self.definition.target_state = state;
        self.save().await?;
        info!(service = %self.service, node = %self.node, target = %state, "target state set");
        Ok(())
    }

    /// Upsert the catalog entry and, if missing, the health check.
    pub async fn register(&self) -> Result<()> {
        self.backend
            .catalog_register(&CatalogRegistration {
                node: self.node.clone(),
                address: self.definition.address.clone(),
                service: Some(ServiceRegistration {
                    id: self.service.clone(),
                    name: self.service.clone(),
                    port: self.definition.port,
                }),
            })
            .await?;
        if self.register_check().await? {
            info!(service = %self.service, node = %self.node, "external service registered");
        }
        Ok(())
    }

    /// Register the health check unless it exists. Returns whether it was
    /// created. A new check starts as `warning` until the agent first runs it.
    pub async fn register_check(&self) -> Result<bool> {
        if self.check_exists().await? {
            return Ok(false);
        }
        let check = CheckRegistration::script(
            self.check_id(),
            &self.definition.command,
            &self.definition.interval,
        )
        .with_status(CheckStatus::Warning);
        self.backend.agent_check_register(&check).await?;
        debug!(service = %self.service, node = %self.node, "health check registered");
        Ok(true)
    }

    /// Remove the health check (if present) and the catalog entry.
    pub async fn unregister(&self) -> Result<()> {
        match self.backend.agent_check_deregister(&self.check_id()).await {
            Ok(()) => {
                info!(service = %self.service, node = %self.node, "external service unregistered");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.unregister_service().await
    }

    /// Remove only the catalog entry, leaving the check running.
    pub async fn unregister_service(&self) -> Result<()> {
        self.backend
            .catalog_deregister(&CatalogDeregistration {
                node: self.node.clone(),
                address: Some(self.definition.address.clone()),
                service_id: Some(self.service.clone()),
            })
            .await?;
        Ok(())
    }

    /// Delete the stored definition.
    pub async fn destroy(&self) -> Result<()> {
        self.backend.kv_delete(&self.key()).await?;
        info!(service = %self.service, node = %self.node, "external service definition deleted");
        Ok(())
    }

    /// Delete every definition of every node.
    pub async fn destroy_all(backend: &dyn Backend) -> Result<()> {
        backend.kv_delete_tree(&format!("{DEFINITIONS_PREFIX}/")).await?;
        Ok(())
    }

    /// Whether the catalog lists this service on this node.
    pub async fn is_active(&self) -> Result<bool> {
        let instances = self.backend.catalog_service(&self.service).await?;
        Ok(instances
            .iter()
            .any(|s| s.service_name == self.service && s.node == self.node))
    }

    pub async fn check_exists(&self) -> Result<bool> {
        Ok(self.backend.agent_checks().await?.contains_key(&self.check_id()))
    }

    pub async fn is_healthy(&self) -> Result<bool> {
        Ok(self.check_status().await? == CheckStatus::Passing)
    }

    /// Status of the health check, `Unknown` if it is not registered.
    pub async fn check_status(&self) -> Result<CheckStatus> {
        let checks = self.backend.agent_checks().await?;
        Ok(checks
            .get(&self.check_id())
            .map_or(CheckStatus::Unknown, |c| c.status))
    }
}

impl fmt::Debug for ExternalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalService")
            .field("service", &self.service)
            .field("node", &self.node)
            .field("definition", &self.definition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extsvc_backend::InMemoryBackend;

    fn backends() -> (Arc<InMemoryBackend>, Arc<dyn Backend>) {
        let memory = Arc::new(InMemoryBackend::new("agent-1"));
        let shared: Arc<dyn Backend> = memory.clone();
        (memory, shared)
    }

    async fn web(backend: &Arc<dyn Backend>) -> ExternalService {
        ExternalService::create(
            Arc::clone(backend),
            "web",
            "n1",
            "10.0.0.5",
            8080,
            "curl -sf http://10.0.0.5:8080/health",
            "10s",
        )
        .await
        .unwrap()
    }

    #[test]
    fn naming_helpers() {
        assert_eq!(definition_key("n1", "web"), "ExternalServices/n1/web");
        assert_eq!(node_prefix("n1"), "ExternalServices/n1/");
        assert_eq!(watcher_lock_key("n1"), "ExternalServicesWatchers/n1");
        assert_eq!(check_id("web", "n1"), "check:web:n1");
        assert_eq!(parse_check_id("check:web:n1"), Some(("web", "n1")));
        assert_eq!(parse_check_id("session:abc"), None);
        assert_eq!(parse_check_id("check:web"), None);
        assert_eq!(parse_check_id("check:a:b:c"), None);
        assert_eq!(
            parse_definition_key("ExternalServices/n1/web"),
            Some(("n1", "web"))
        );
        assert_eq!(parse_definition_key("ExternalServices/n1/"), None);
        assert_eq!(parse_definition_key("ExternalServices/n1/a/b"), None);
        assert_eq!(parse_definition_key("ExternalServicesWatchers/n1"), None);
    }

    #[test]
    fn definition_json_uses_pascal_case() {
        let definition = ServiceDefinition {
            address: "10.0.0.5".to_string(),
            port: 80,
            target_state: TargetState::Running,
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_slice(&definition.encode().unwrap()).unwrap();
        assert_eq!(json["Address"], "10.0.0.5");
        assert_eq!(json["Port"], 80);
        assert_eq!(json["Interval"], "10s");
        assert_eq!(json["TargetState"], "running");
    }

    #[test]
    fn hand_written_definition_takes_defaults() {
        let definition =
            ServiceDefinition::decode("k", br#"{"Address":"db.local","Port":5432}"#).unwrap();
        assert_eq!(definition.interval, "10s");
        assert_eq!(definition.target_state, TargetState::Stopped);
        assert!(definition.command.is_empty());
    }

    #[test]
    fn unknown_target_state_is_a_decode_error() {
        let err = ServiceDefinition::decode("k", br#"{"TargetState":"paused"}"#).unwrap_err();
        assert!(matches!(err, Error::Definition { .. }));
        assert!("paused".parse::<TargetState>().is_err());
        assert_eq!("deleted".parse::<TargetState>(), Ok(TargetState::Deleted));
    }

    #[tokio::test]
    async fn create_persists_stopped_definition() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        assert_eq!(es.target_state(), TargetState::Stopped);

        let loaded = ExternalService::load(backend.clone(), "web", "n1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.definition(), es.definition());
        assert!(
            ExternalService::load(backend, "db", "n1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        es.register().await.unwrap();
        es.register().await.unwrap();

        assert!(es.is_active().await.unwrap());
        assert_eq!(backend.catalog_service("web").await.unwrap().len(), 1);
        let checks = backend.agent_checks().await.unwrap();
        assert_eq!(
            checks.keys().filter(|id| id.starts_with("check:")).count(),
            1
        );
        assert_eq!(es.check_status().await.unwrap(), CheckStatus::Warning);
        assert!(!es.is_healthy().await.unwrap());
    }

    #[tokio::test]
    async fn register_keeps_existing_check_status() {
        let (memory, backend) = backends();
        let es = web(&backend).await;
        es.register().await.unwrap();
        memory
            .set_check_status("check:web:n1", CheckStatus::Passing)
            .unwrap();
        es.register().await.unwrap();
        assert!(es.is_healthy().await.unwrap());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        es.unregister().await.unwrap();

        es.register().await.unwrap();
        es.unregister().await.unwrap();
        es.unregister().await.unwrap();
        assert!(!es.is_active().await.unwrap());
        assert!(!es.check_exists().await.unwrap());
        assert_eq!(es.check_status().await.unwrap(), CheckStatus::Unknown);
    }

    #[tokio::test]
    async fn unregister_service_leaves_check() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        es.register().await.unwrap();
        es.unregister_service().await.unwrap();
        assert!(!es.is_active().await.unwrap());
        assert!(es.check_exists().await.unwrap());
    }

    #[tokio::test]
    async fn register_check_leaves_catalog_alone() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        assert!(es.register_check().await.unwrap());
        assert!(!es.register_check().await.unwrap());
        assert!(!es.is_active().await.unwrap());
        assert_eq!(es.check_status().await.unwrap(), CheckStatus::Warning);
    }

    #[tokio::test]
    async fn set_target_state_persists() {
        let (_, backend) = backends();
        let mut es = web(&backend).await;
        es.set_check_interval("30s");
        es.set_target_state(TargetState::Running).await.unwrap();

        let loaded = ExternalService::load(backend, "web", "n1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.target_state(), TargetState::Running);
        assert_eq!(loaded.definition().interval, "30s");
    }

    #[tokio::test]
    async fn destroy_and_destroy_all() {
        let (_, backend) = backends();
        let es = web(&backend).await;
        es.destroy().await.unwrap();
        assert!(
            ExternalService::load(backend.clone(), "web", "n1")
                .await
                .unwrap()
                .is_none()
        );

        web(&backend).await;
        ExternalService::create(backend.clone(), "db", "n2", "10.0.0.6", 5432, "true", "5s")
            .await
            .unwrap();
        backend
            .kv_put(&watcher_lock_key("n1"), b"")
            .await
            .unwrap();
        ExternalService::destroy_all(backend.as_ref()).await.unwrap();

        assert!(ExternalService::list(backend.clone(), "n1").await.unwrap().is_empty());
        assert!(ExternalService::list(backend.clone(), "n2").await.unwrap().is_empty());
        // Watcher locks live outside the definition tree.
        assert!(
            backend
                .kv_get(&watcher_lock_key("n1"), &QueryOptions::default())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn list_skips_bad_definitions() {
        let (_, backend) = backends();
        web(&backend).await;
        backend
            .kv_put("ExternalServices/n1/broken", b"{not json")
            .await
            .unwrap();
        let services = ExternalService::list(backend, "n1").await.unwrap();
        let names: Vec<_> = services.iter().map(|s| s.service()).collect();
        assert_eq!(names, vec!["web"]);
    }
}
