//! YAML export and import of the definition namespace.
//!
//! The document is a sequence of `{key, value}` pairs with values stored as
//! text. Import writes every pair back verbatim without validating it.

use std::path::Path;

use extsvc_backend::{Backend, QueryOptions};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::service::DEFINITIONS_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub key: String,
    pub value: String,
}

/// Every key under the definition namespace. Values that are not UTF-8
/// text cannot be stored verbatim in the document and are skipped.
pub async fn collect_definitions(backend: &dyn Backend) -> Result<Vec<BackupEntry>> {
    let prefix = format!("{DEFINITIONS_PREFIX}/");
    let (pairs, _) = backend.kv_list(&prefix, &QueryOptions::consistent()).await?;
    let mut entries = Vec::with_capacity(pairs.len());
    for pair in pairs {
        match String::from_utf8(pair.value) {
            Ok(value) => entries.push(BackupEntry {
                key: pair.key,
                value,
            }),
            Err(_) => warn!(key = %pair.key, "skipping definition with non-UTF-8 value"),
        }
    }
    Ok(entries)
}

/// Write each entry to the backend as is.
pub async fn restore_definitions(backend: &dyn Backend, entries: &[BackupEntry]) -> Result<()> {
    for entry in entries {
        backend.kv_put(&entry.key, entry.value.as_bytes()).await?;
    }
    Ok(())
}

/// Export the definition namespace to a YAML file. Returns the entry count.
pub async fn export_definitions(backend: &dyn Backend, path: &Path) -> Result<usize> {
    let entries = collect_definitions(backend).await?;
    let yaml = serde_yaml::to_string(&entries)?;
    tokio::fs::write(path, yaml).await?;
    info!(path = %path.display(), entries = entries.len(), "definitions exported");
    Ok(entries.len())
}

/// Import a YAML file written by [`export_definitions`]. Returns the entry count.
pub async fn import_definitions(backend: &dyn Backend, path: &Path) -> Result<usize> {
    let content = tokio::fs::read_to_string(path).await?;
    let entries: Vec<BackupEntry> = serde_yaml::from_str(&content)?;
    restore_definitions(backend, &entries).await?;
    info!(path = %path.display(), entries = entries.len(), "definitions imported");
    Ok(entries.len())
}
