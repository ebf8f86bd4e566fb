//! Domain types exchanged with the coordination backend.
//!
//! These mirror the subset of the Consul data model extsvc relies on:
//! KV pairs with a lock holder, sessions bound to checks, agent checks,
//! catalog entries, and the index metadata returned by blocking queries.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the node-liveness check every agent maintains.
pub const NODE_LIVENESS_CHECK: &str = "serfHealth";

// ── KV ────────────────────────────────────────────────────────────

/// A key-value entry as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Session currently holding the key, if it is locked.
    pub session: Option<String>,
    pub create_index: u64,
    pub modify_index: u64,
    /// Number of times the key has been successfully acquired.
    pub lock_index: u64,
}

impl KvPair {
    /// Build a pair for a plain write.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

// ── Queries ───────────────────────────────────────────────────────

/// Read options shared by every query.
///
/// A non-zero `wait_index` turns the read into a blocking query: the
/// backend holds the request until its index moves past `wait_index` or
/// `wait_time` elapses, whichever comes first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Require a linearizable read from the leader.
    pub consistent: bool,
    pub wait_index: u64,
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    /// A strongly consistent, non-blocking read.
    pub fn consistent() -> Self {
        Self {
            consistent: true,
            ..Default::default()
        }
    }

    /// A strongly consistent blocking read.
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            consistent: true,
            wait_index,
            wait_time: Some(wait_time),
        }
    }
}

/// Metadata returned alongside a query result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Backend index at which the result was produced.
    pub last_index: u64,
}

// ── Sessions ──────────────────────────────────────────────────────

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub name: String,
    pub node: String,
    /// Checks the session is bound to; the session is invalidated as soon
    /// as any of them turns critical.
    pub checks: Vec<String>,
    /// How long a key released by an invalidated session stays unacquirable.
    pub lock_delay: Duration,
}

/// A live session as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: String,
    pub name: String,
    pub node: String,
    pub checks: Vec<String>,
    pub lock_delay: Duration,
    pub create_index: u64,
}

// ── Checks ────────────────────────────────────────────────────────

/// Status of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
    /// Not reported by the backend (e.g. the check does not exist).
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Maintenance => "maintenance",
            CheckStatus::Unknown => "unknown",
        }
    }

    /// Parse a wire status, mapping anything unrecognised to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "passing" => CheckStatus::Passing,
            "warning" => CheckStatus::Warning,
            "critical" => CheckStatus::Critical,
            "maintenance" => CheckStatus::Maintenance,
            _ => CheckStatus::Unknown,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the agent evaluates a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    /// Passive check that must be refreshed within `ttl`.
    Ttl(Duration),
    /// Shell command run by the agent every `interval`.
    Script { command: String, interval: String },
}

/// An agent-local check registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRegistration {
    pub id: String,
    pub name: String,
    pub notes: Option<String>,
    pub kind: CheckKind,
    /// Initial status; the backend's default (critical) when `None`.
    pub status: Option<CheckStatus>,
}

impl CheckRegistration {
    /// A TTL check whose id and name are both `id`.
    pub fn ttl(id: impl Into<String>, ttl: Duration) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            notes: None,
            kind: CheckKind::Ttl(ttl),
            status: None,
        }
    }

    /// A script check whose id and name are both `id`.
    pub fn script(
        id: impl Into<String>,
        command: impl Into<String>,
        interval: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            notes: None,
            kind: CheckKind::Script {
                command: command.into(),
                interval: interval.into(),
            },
            status: None,
        }
    }

    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A check as reported by the agent or the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub output: String,
    pub service_id: String,
}

/// Filter for the health state endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStateFilter {
    Any,
    Passing,
    Warning,
    Critical,
}

impl HealthStateFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStateFilter::Any => "any",
            HealthStateFilter::Passing => "passing",
            HealthStateFilter::Warning => "warning",
            HealthStateFilter::Critical => "critical",
        }
    }

    pub fn matches(&self, status: CheckStatus) -> bool {
        match self {
            HealthStateFilter::Any => true,
            HealthStateFilter::Passing => status == CheckStatus::Passing,
            HealthStateFilter::Warning => status == CheckStatus::Warning,
            HealthStateFilter::Critical => status == CheckStatus::Critical,
        }
    }
}

// ── Catalog ───────────────────────────────────────────────────────

/// Service part of a catalog registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub port: u16,
}

/// Register (or update) a node and optionally one of its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRegistration {
    pub node: String,
    pub address: String,
    pub service: Option<ServiceRegistration>,
}

/// Remove a service (or, without `service_id`, a whole node) from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDeregistration {
    pub node: String,
    pub address: Option<String>,
    pub service_id: Option<String>,
}

/// One instance of a service in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogService {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    pub service_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_parse_and_display() {
        for status in [
            CheckStatus::Passing,
            CheckStatus::Warning,
            CheckStatus::Critical,
            CheckStatus::Maintenance,
        ] {
            assert_eq!(CheckStatus::parse(status.as_str()), status);
        }
        assert_eq!(CheckStatus::parse("bogus"), CheckStatus::Unknown);
        assert_eq!(CheckStatus::Critical.to_string(), "critical");
    }

    #[test]
    fn check_status_serde_is_lowercase() {
        let json = serde_json::to_string(&CheckStatus::Passing).unwrap();
        assert_eq!(json, "\"passing\"");
        let back: CheckStatus = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(back, CheckStatus::Critical);
    }

    #[test]
    fn health_filter_matching() {
        assert!(HealthStateFilter::Any.matches(CheckStatus::Warning));
        assert!(HealthStateFilter::Critical.matches(CheckStatus::Critical));
        assert!(!HealthStateFilter::Passing.matches(CheckStatus::Critical));
    }

    #[test]
    fn blocking_options_are_consistent() {
        let opts = QueryOptions::blocking(42, Duration::from_secs(3));
        assert!(opts.consistent);
        assert_eq!(opts.wait_index, 42);
        assert_eq!(opts.wait_time, Some(Duration::from_secs(3)));
    }
}
