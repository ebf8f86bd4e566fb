//! extsvc-backend — coordination backend capabilities for extsvc.
//!
//! The watcher, lock and session logic never talk to a concrete service.
//! They take an `Arc<dyn Backend>`, where [`Backend`] is the union of five
//! capability traits mirroring the Consul agent API surface:
//!
//! ```text
//! Backend
//!   ├── KvApi       get / put / acquire / release / delete / list (blocking)
//!   ├── SessionApi  create / destroy / info
//!   ├── AgentApi    node name, check register / deregister / list / pass TTL
//!   ├── CatalogApi  register / deregister / service lookup
//!   └── HealthApi   health state (blocking)
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`ConsulBackend`] speaks the Consul HTTP API over hyper.
//! - [`InMemoryBackend`] emulates the same semantics in process (indices,
//!   blocking queries, TTL expiry, session invalidation) for tests and
//!   local development.

pub mod backend;
pub mod consul;
pub mod error;
pub mod memory;
pub mod types;

pub use backend::{AgentApi, Backend, BackendFuture, CatalogApi, HealthApi, KvApi, SessionApi};
pub use consul::{ConsulBackend, ConsulConfig};
pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;
pub use types::*;
