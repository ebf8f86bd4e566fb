//! `extsvcd status`: one line per defined service of a node.

use std::fmt::Write;
use std::sync::Arc;

use extsvc_backend::{Backend, CheckStatus};
use extsvc_watcher::{ExternalService, TargetState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub service: String,
    pub address: String,
    pub port: u16,
    pub target: TargetState,
    pub check: CheckStatus,
    /// Listed in the catalog.
    pub active: bool,
}

pub async fn collect(backend: Arc<dyn Backend>, node: &str) -> extsvc_watcher::Result<Vec<StatusRow>> {
    let services = ExternalService::list(backend, node).await?;
    let mut rows = Vec::with_capacity(services.len());
    for es in services {
        rows.push(StatusRow {
            service: es.service().to_string(),
            address: es.definition().address.clone(),
            port: es.definition().port,
            target: es.target_state(),
            check: es.check_status().await?,
            active: es.is_active().await?,
        });
    }
    Ok(rows)
}

pub fn render(node: &str, rows: &[StatusRow]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        let _ = writeln!(out, "no external services defined for node {node}");
        return out;
    }
    let width = rows
        .iter()
        .map(|r| r.service.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    let _ = writeln!(
        out,
        "{:<width$}  {:<21}  {:<8}  {:<11}  CATALOG",
        "SERVICE", "ADDRESS", "TARGET", "CHECK"
    );
    for row in rows {
        let endpoint = format!("{}:{}", row.address, row.port);
        let _ = writeln!(
            out,
            "{:<width$}  {:<21}  {:<8}  {:<11}  {}",
            row.service,
            endpoint,
            row.target.to_string(),
            row.check.as_str(),
            if row.active { "registered" } else { "-" },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use extsvc_backend::InMemoryBackend;

    #[tokio::test]
    async fn rows_reflect_definition_check_and_catalog() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new("agent-1"));
        let mut web = ExternalService::create(
            Arc::clone(&backend),
            "web",
            "n1",
            "10.0.0.5",
            80,
            "curl -sf http://10.0.0.5/",
            "10s",
        )
        .await
        .unwrap();
        web.set_target_state(TargetState::Running).await.unwrap();
        web.register().await.unwrap();
        ExternalService::create(Arc::clone(&backend), "db", "n1", "10.0.0.6", 5432, "true", "10s")
            .await
            .unwrap();

        let rows = collect(backend, "n1").await.unwrap();
        assert_eq!(rows.len(), 2);
        let db = rows.iter().find(|r| r.service == "db").unwrap();
        assert_eq!(db.target, TargetState::Stopped);
        assert_eq!(db.check, CheckStatus::Unknown);
        assert!(!db.active);
        let web = rows.iter().find(|r| r.service == "web").unwrap();
        assert_eq!(web.target, TargetState::Running);
        assert_eq!(web.check, CheckStatus::Warning);
        assert!(web.active);
    }

    #[test]
    fn render_table() {
        let rows = vec![StatusRow {
            service: "web".to_string(),
            address: "10.0.0.5".to_string(),
            port: 80,
            target: TargetState::Running,
            check: CheckStatus::Passing,
            active: true,
        }];
        let text = render("n1", &rows);
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("SERVICE"));
        let line = lines.next().unwrap();
        assert!(line.contains("10.0.0.5:80"));
        assert!(line.contains("running"));
        assert!(line.contains("passing"));
        assert!(line.ends_with("registered"));
    }

    #[test]
    fn render_empty() {
        assert_eq!(render("n1", &[]), "no external services defined for node n1\n");
    }
}
