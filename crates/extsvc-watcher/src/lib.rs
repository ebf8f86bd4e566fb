//! extsvc-watcher — keeps services that live outside the coordination
//! cluster registered only while they are healthy and wanted.
//!
//! Operators declare a service per node under
//! `ExternalServices/{node}/{service}` with a target state. One watcher per
//! node, elected through a session-backed lock, reconciles those
//! declarations against the catalog and the service's health check.
//!
//! # Architecture
//!
//! ```text
//! LeadershipDriver (SeekingLeadership ⇄ Leading)
//!   └── ExternalServiceWatcher
//!         ├── Lock  ExternalServicesWatchers/{node}
//!         │     └── Session (TTL check + refresh task)
//!         ├── definition loop  blocking list of ExternalServices/{node}/
//!         └── health loop      blocking health state, check:{service}:{node}
//!                 └── ExternalService register / unregister / destroy
//! ```
//!
//! Every component takes an `Arc<dyn Backend>`, so the same code runs
//! against Consul or the in-memory backend used by the tests.

pub mod backup;
pub mod config;
pub mod driver;
pub mod error;
pub mod lock;
pub mod service;
pub mod session;
pub mod watcher;

pub use backup::{BackupEntry, export_definitions, import_definitions};
pub use config::{ExtsvcConfig, SessionConfig, WatcherConfig, parse_duration};
pub use driver::{DriverState, LeadershipDriver};
pub use error::{Error, ErrorKind, Result};
pub use lock::Lock;
pub use service::{ExternalService, ServiceDefinition, TargetState};
pub use session::Session;
pub use watcher::{ExternalServiceWatcher, WatcherState};
