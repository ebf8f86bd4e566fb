//! Consul HTTP API backend.
//!
//! Every call opens an HTTP/1 connection to the agent, sends one request
//! and reads the whole response. Blocking queries are plain long-polls:
//! the request timeout is extended by the requested wait time so the agent
//! gets to answer before we give up.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::backend::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;

/// Header carrying the ACL token.
const TOKEN_HEADER: &str = "x-consul-token";

/// Header carrying the index of a query result.
const INDEX_HEADER: &str = "x-consul-index";

/// Connection settings for a Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    /// Agent address as `host:port`; an `http://` prefix is accepted.
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    /// Timeout for non-blocking requests.
    pub request_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Backend speaking the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulBackend {
    config: ConsulConfig,
    /// `host:port` with any scheme stripped.
    authority: String,
    /// `http://{authority}/`, the root every request URL is built from.
    base: Url,
}

/// Raw outcome of one HTTP exchange.
struct Reply {
    status: StatusCode,
    index: u64,
    body: Bytes,
}

impl ConsulBackend {
    /// Build a backend for the given agent. Only plain HTTP is supported.
    pub fn new(config: ConsulConfig) -> BackendResult<Self> {
        let address = config.address.trim();
        if address.starts_with("https://") {
            return Err(BackendError::InvalidRequest(format!(
                "https is not supported: {address}"
            )));
        }
        let authority = address
            .strip_prefix("http://")
            .unwrap_or(address)
            .trim_end_matches('/')
            .to_string();
        if authority.is_empty() {
            return Err(BackendError::InvalidRequest("empty agent address".to_string()));
        }
        let base = Url::parse(&format!("http://{authority}/")).map_err(|e| {
            BackendError::InvalidRequest(format!("invalid agent address {authority}: {e}"))
        })?;
        Ok(Self {
            config,
            authority,
            base,
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    /// Send one request and return status, index header and body.
    async fn send(
        &self,
        method: Method,
        uri: Url,
        body: Option<Bytes>,
        wait: Option<Duration>,
    ) -> BackendResult<Reply> {
        let timeout = self.config.request_timeout + wait.unwrap_or_default();
        trace!(%method, %uri, "consul request");

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.authority)
                .await
                .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.authority)))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| BackendError::Unavailable(format!("handshake failed: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method)
                .uri(uri.as_str())
                .header("host", &self.authority)
                .header("user-agent", "extsvc/0.1");
            if let Some(token) = &self.config.token {
                builder = builder.header(TOKEN_HEADER, token);
            }
            if body.is_some() {
                builder = builder.header("content-type", "application/json");
            }
            let request = builder
                .body(Full::new(body.unwrap_or_default()))
                .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| BackendError::Unavailable(format!("request failed: {e}")))?;
            let status = response.status();
            let index = response
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| BackendError::Unavailable(format!("reading body failed: {e}")))?
                .to_bytes();
            Ok::<_, BackendError>(Reply {
                status,
                index,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                debug!(%uri, ?timeout, "consul request timed out");
                Err(BackendError::Unavailable(format!("request to {uri} timed out")))
            }
        }
    }

    /// Send a request and fail on any non-success status.
    async fn send_ok(
        &self,
        method: Method,
        uri: Url,
        body: Option<Bytes>,
        wait: Option<Duration>,
    ) -> BackendResult<Reply> {
        let reply = self.send(method, uri, body, wait).await?;
        if reply.status.is_success() {
            Ok(reply)
        } else {
            Err(status_error(&reply))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        uri: Url,
        wait: Option<Duration>,
    ) -> BackendResult<(T, u64)> {
        let reply = self.send_ok(Method::GET, uri, None, wait).await?;
        Ok((decode(&reply.body)?, reply.index))
    }

    async fn put_json<B: Serialize>(&self, uri: Url, body: &B) -> BackendResult<Reply> {
        let body = serde_json::to_vec(body).map_err(|e| BackendError::Encode(e.to_string()))?;
        self.send_ok(Method::PUT, uri, Some(Bytes::from(body)), None)
            .await
    }

    /// Send a PUT whose response body is a JSON boolean.
    async fn put_bool(&self, uri: Url, body: Option<Bytes>) -> BackendResult<bool> {
        let reply = self.send_ok(Method::PUT, uri, body, None).await?;
        decode(&reply.body)
    }

    /// Request URL: each of `segments` becomes one percent-encoded path
    /// segment; empty query values are sent as bare flags (`?recurse`).
    fn url<'s>(
        &self,
        segments: impl IntoIterator<Item = &'s str>,
        query: &[(&str, String)],
    ) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }
        let dc = self.config.datacenter.as_deref().map(|dc| ("dc", dc));
        let params: Vec<(&str, &str)> = query
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .chain(dc)
            .collect();
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                if v.is_empty() {
                    pairs.append_key_only(k);
                } else {
                    pairs.append_pair(k, v);
                }
            }
        }
        url
    }

    /// URL of a KV key; `/` in the key separates path segments.
    fn kv_url(&self, key: &str, query: &[(&str, String)]) -> Url {
        self.url(["v1", "kv"].into_iter().chain(key.split('/')), query)
    }
}

/// Query parameters for a read.
fn read_params(opts: &QueryOptions) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if opts.consistent {
        params.push(("consistent", String::new()));
    }
    if opts.wait_index > 0 {
        params.push(("index", opts.wait_index.to_string()));
        if let Some(wait) = opts.wait_time {
            params.push(("wait", format_duration(wait)));
        }
    }
    params
}

/// Extra time to allow for a blocking read.
fn read_wait(opts: &QueryOptions) -> Option<Duration> {
    (opts.wait_index > 0).then(|| opts.wait_time.unwrap_or(Duration::from_secs(300)))
}

/// Go-style duration in milliseconds, e.g. `1500ms`.
fn format_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

fn status_error(reply: &Reply) -> BackendError {
    let body = String::from_utf8_lossy(&reply.body).trim().to_string();
    // Older agents answer 500 instead of 404 for unknown checks.
    if reply.status == StatusCode::NOT_FOUND || body.contains("Unknown check") {
        return BackendError::NotFound(body);
    }
    if body.contains("invalid session") || body.contains("critical state") {
        return BackendError::Rejected(body);
    }
    BackendError::Status {
        status: reply.status.as_u16(),
        body,
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> BackendResult<T> {
    serde_json::from_slice(body).map_err(|e| BackendError::Decode(e.to_string()))
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    create_index: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
}

impl WireKvPair {
    fn into_pair(self) -> BackendResult<KvPair> {
        let value = match self.value {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| BackendError::Decode(format!("value of {}: {e}", self.key)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()),
            create_index: self.create_index,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireSessionCreate<'a> {
    name: &'a str,
    node: &'a str,
    checks: &'a [String],
    lock_delay: String,
}

#[derive(Debug, Deserialize)]
struct WireSessionId {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireServiceCheck {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireSession {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    checks: Option<Vec<String>>,
    /// Newer agents split `Checks` into node and service checks.
    #[serde(default)]
    node_checks: Option<Vec<String>>,
    #[serde(default)]
    service_checks: Option<Vec<WireServiceCheck>>,
    /// Nanoseconds.
    #[serde(default)]
    lock_delay: u64,
    #[serde(default)]
    create_index: u64,
}

impl From<WireSession> for SessionEntry {
    fn from(w: WireSession) -> Self {
        let mut checks = w.checks.unwrap_or_default();
        for id in w.node_checks.unwrap_or_default() {
            if !checks.contains(&id) {
                checks.push(id);
            }
        }
        for check in w.service_checks.unwrap_or_default() {
            if !checks.contains(&check.id) {
                checks.push(check.id);
            }
        }
        SessionEntry {
            id: w.id,
            name: w.name,
            node: w.node,
            checks,
            lock_delay: Duration::from_nanos(w.lock_delay),
            create_index: w.create_index,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAgentSelf {
    config: WireAgentConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAgentConfig {
    node_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireCheckRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Vec<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
}

impl<'a> From<&'a CheckRegistration> for WireCheckRegistration<'a> {
    fn from(check: &'a CheckRegistration) -> Self {
        let (ttl, interval, args) = match &check.kind {
            CheckKind::Ttl(ttl) => (Some(format_duration(*ttl)), None, None),
            CheckKind::Script { command, interval } => (
                None,
                Some(interval.as_str()),
                Some(vec!["/bin/sh", "-c", command.as_str()]),
            ),
        };
        Self {
            id: &check.id,
            name: &check.name,
            notes: check.notes.as_deref(),
            ttl,
            interval,
            args,
            status: check.status.map(|s| s.as_str()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireHealthCheck {
    #[serde(default)]
    node: String,
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(default)]
    name: String,
    status: String,
    #[serde(default)]
    output: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
}

impl From<WireHealthCheck> for HealthCheck {
    fn from(w: WireHealthCheck) -> Self {
        HealthCheck {
            node: w.node,
            check_id: w.check_id,
            name: w.name,
            status: CheckStatus::parse(&w.status),
            output: w.output,
            service_id: w.service_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireCatalogService<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    service: &'a str,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireCatalogRegister<'a> {
    node: &'a str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<WireCatalogService<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireCatalogDeregister<'a> {
    node: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a str>,
    #[serde(rename = "ServiceID", skip_serializing_if = "Option::is_none")]
    service_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireCatalogEntry {
    node: String,
    #[serde(default)]
    address: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    #[serde(default)]
    service_port: u16,
}

impl From<WireCatalogEntry> for CatalogService {
    fn from(w: WireCatalogEntry) -> Self {
        CatalogService {
            node: w.node,
            address: w.address,
            service_id: w.service_id,
            service_name: w.service_name,
            service_port: w.service_port,
        }
    }
}

// ── Trait implementations ────────────────────────────────────────

impl KvApi for ConsulBackend {
    fn kv_get<'a>(
        &'a self,
        key: &'a str,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, Option<KvPair>> {
        Box::pin(async move {
            let uri = self.kv_url(key, &read_params(opts));
            let reply = self
                .send(Method::GET, uri, None, read_wait(opts))
                .await?;
            if reply.status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !reply.status.is_success() {
                return Err(status_error(&reply));
            }
            let pairs: Vec<WireKvPair> = decode(&reply.body)?;
            pairs.into_iter().next().map(WireKvPair::into_pair).transpose()
        })
    }

    fn kv_put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let body = Some(Bytes::copy_from_slice(value));
            if self.put_bool(self.kv_url(key, &[]), body).await? {
                Ok(())
            } else {
                Err(BackendError::Rejected(format!("write to {key} refused")))
            }
        })
    }

    fn kv_acquire<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        session: &'a str,
    ) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let uri = self.kv_url(key, &[("acquire", session.to_string())]);
            self.put_bool(uri, Some(Bytes::copy_from_slice(value)))
                .await
        })
    }

    fn kv_release<'a>(&'a self, key: &'a str, session: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let uri = self.kv_url(key, &[("release", session.to_string())]);
            self.put_bool(uri, None).await
        })
    }

    fn kv_delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.send_ok(Method::DELETE, self.kv_url(key, &[]), None, None)
                .await?;
            Ok(())
        })
    }

    fn kv_delete_tree<'a>(&'a self, prefix: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let uri = self.kv_url(prefix, &[("recurse", String::new())]);
            self.send_ok(Method::DELETE, uri, None, None).await?;
            Ok(())
        })
    }

    fn kv_list<'a>(
        &'a self,
        prefix: &'a str,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<KvPair>, QueryMeta)> {
        Box::pin(async move {
            let mut query = read_params(opts);
            query.push(("recurse", String::new()));
            let reply = self
                .send(Method::GET, self.kv_url(prefix, &query), None, read_wait(opts))
                .await?;
            let meta = QueryMeta {
                last_index: reply.index,
            };
            // An empty prefix is a 404 that still carries an index.
            if reply.status == StatusCode::NOT_FOUND {
                return Ok((Vec::new(), meta));
            }
            if !reply.status.is_success() {
                return Err(status_error(&reply));
            }
            let pairs: Vec<WireKvPair> = decode(&reply.body)?;
            let pairs = pairs
                .into_iter()
                .map(WireKvPair::into_pair)
                .collect::<BackendResult<Vec<_>>>()?;
            Ok((pairs, meta))
        })
    }
}

impl SessionApi for ConsulBackend {
    fn session_create<'a>(&'a self, request: &'a SessionRequest) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let body = WireSessionCreate {
                name: &request.name,
                node: &request.node,
                checks: &request.checks,
                lock_delay: format_duration(request.lock_delay),
            };
            let uri = self.url(["v1", "session", "create"], &[]);
            let reply = self.put_json(uri, &body).await?;
            let created: WireSessionId = decode(&reply.body)?;
            debug!(session = %created.id, name = %request.name, "consul session created");
            Ok(created.id)
        })
    }

    fn session_destroy<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let uri = self.url(["v1", "session", "destroy", id], &[]);
            self.send_ok(Method::PUT, uri, None, None).await?;
            Ok(())
        })
    }

    fn session_info<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Option<SessionEntry>> {
        Box::pin(async move {
            let uri = self.url(
                ["v1", "session", "info", id],
                &[("consistent", String::new())],
            );
            let (sessions, _): (Option<Vec<WireSession>>, u64) = self.get_json(uri, None).await?;
            Ok(sessions
                .unwrap_or_default()
                .into_iter()
                .next()
                .map(SessionEntry::from))
        })
    }
}

impl AgentApi for ConsulBackend {
    fn agent_node_name(&self) -> BackendFuture<'_, String> {
        Box::pin(async move {
            let uri = self.url(["v1", "agent", "self"], &[]);
            let (agent, _): (WireAgentSelf, u64) = self.get_json(uri, None).await?;
            Ok(agent.config.node_name)
        })
    }

    fn agent_check_register<'a>(&'a self, check: &'a CheckRegistration) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let uri = self.url(["v1", "agent", "check", "register"], &[]);
            self.put_json(uri, &WireCheckRegistration::from(check))
                .await?;
            Ok(())
        })
    }

    fn agent_check_deregister<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let uri = self.url(["v1", "agent", "check", "deregister", id], &[]);
            self.send_ok(Method::PUT, uri, None, None).await?;
            Ok(())
        })
    }

    fn agent_checks(&self) -> BackendFuture<'_, HashMap<String, HealthCheck>> {
        Box::pin(async move {
            let uri = self.url(["v1", "agent", "checks"], &[]);
            let (checks, _): (HashMap<String, WireHealthCheck>, u64) =
                self.get_json(uri, None).await?;
            Ok(checks
                .into_iter()
                .map(|(id, check)| (id, HealthCheck::from(check)))
                .collect())
        })
    }

    fn agent_pass_ttl<'a>(&'a self, id: &'a str, note: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let query: Vec<(&str, String)> = if note.is_empty() {
                Vec::new()
            } else {
                vec![("note", note.to_string())]
            };
            let uri = self.url(["v1", "agent", "check", "pass", id], &query);
            self.send_ok(Method::PUT, uri, None, None).await?;
            Ok(())
        })
    }
}

impl CatalogApi for ConsulBackend {
    fn catalog_register<'a>(
        &'a self,
        registration: &'a CatalogRegistration,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let body = WireCatalogRegister {
                node: &registration.node,
                address: &registration.address,
                service: registration.service.as_ref().map(|s| WireCatalogService {
                    id: &s.id,
                    service: &s.name,
                    port: s.port,
                }),
            };
            self.put_json(self.url(["v1", "catalog", "register"], &[]), &body)
                .await?;
            Ok(())
        })
    }

    fn catalog_deregister<'a>(
        &'a self,
        deregistration: &'a CatalogDeregistration,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let body = WireCatalogDeregister {
                node: &deregistration.node,
                address: deregistration.address.as_deref(),
                service_id: deregistration.service_id.as_deref(),
            };
            self.put_json(self.url(["v1", "catalog", "deregister"], &[]), &body)
                .await?;
            Ok(())
        })
    }

    fn catalog_service<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Vec<CatalogService>> {
        Box::pin(async move {
            let uri = self.url(["v1", "catalog", "service", name], &[]);
            let (entries, _): (Vec<WireCatalogEntry>, u64) = self.get_json(uri, None).await?;
            Ok(entries.into_iter().map(CatalogService::from).collect())
        })
    }
}

impl HealthApi for ConsulBackend {
    fn health_state<'a>(
        &'a self,
        filter: HealthStateFilter,
        opts: &'a QueryOptions,
    ) -> BackendFuture<'a, (Vec<HealthCheck>, QueryMeta)> {
        Box::pin(async move {
            let uri = self.url(["v1", "health", "state", filter.as_str()], &read_params(opts));
            let (checks, index): (Vec<WireHealthCheck>, u64) =
                self.get_json(uri, read_wait(opts)).await?;
            Ok((
                checks.into_iter().map(HealthCheck::from).collect(),
                QueryMeta { last_index: index },
            ))
        })
    }
}
