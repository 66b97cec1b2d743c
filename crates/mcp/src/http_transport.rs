//! Streamable HTTP transport: every JSON-RPC request is POSTed to one fixed
//! endpoint; the reply is either an immediate JSON body or an SSE-framed
//! body on the same request/response cycle.
//!
//! Servers may issue an `Mcp-Session-Id` header; it is captured and replayed
//! on subsequent requests, and the session is closed with a DELETE.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{
    config::{ServerConfig, Timeouts},
    error::{Error, Result},
    metrics::SharedMetrics,
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION},
};

const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";

/// Streamable-HTTP wire to a remote MCP server.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeouts: Timeouts,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
    metrics: SharedMetrics,
}

impl HttpStreamTransport {
    /// Create a transport pointing at the server's single MCP endpoint.
    pub fn new(config: &ServerConfig, metrics: SharedMetrics) -> Result<Arc<Self>> {
        let url = config.url.as_deref().ok_or_else(|| {
            Error::Connection(format!(
                "streamable HTTP transport for '{}' requires a url",
                config.name
            ))
        })?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect_timeout())
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            headers: config.request_headers(),
            timeouts: config.timeouts,
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(config.session_id.clone()),
            metrics,
        }))
    }

    async fn build_post(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", STREAMABLE_ACCEPT_HEADER)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }
        req
    }

    async fn store_session_id_from_response(&self, response: &reqwest::Response) {
        let Some(raw) = response.headers().get(MCP_SESSION_ID_HEADER) else {
            return;
        };
        let Ok(session_id) = raw.to_str() else {
            return;
        };
        if session_id.trim().is_empty() {
            return;
        }

        let mut slot = self.session_id.write().await;
        let session_id = session_id.to_string();
        if slot.as_ref() != Some(&session_id) {
            debug!(url = %self.url, session_id = %session_id, "streamable HTTP session id updated");
            self.metrics.lock().session_discoveries += 1;
            *slot = Some(session_id);
        }
    }

    fn response_is_event_stream(resp: &reqwest::Response) -> bool {
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                ct.split(';')
                    .next()
                    .is_some_and(|base| base.trim() == "text/event-stream")
            })
            .unwrap_or(false)
    }

    fn parse_event_stream_response(body: &str, method: &str) -> Result<JsonRpcResponse> {
        let mut data = String::new();

        for line in body.lines() {
            let trimmed = line.trim_end();
            if let Some(rest) = trimmed.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
                continue;
            }

            if trimmed.is_empty() && !data.is_empty() {
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&data) {
                    return Ok(resp);
                }
                data.clear();
            }
        }

        if !data.is_empty()
            && let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&data)
        {
            return Ok(resp);
        }

        Err(Error::Protocol(format!(
            "no JSON-RPC response in event stream reply for '{method}'"
        )))
    }

    async fn send(
        &self,
        method: &str,
        body: &impl serde::Serialize,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let req = self.build_post().await;
        let http_resp = req.timeout(timeout).json(body).send().await?;

        if http_resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = http_resp
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            return Err(Error::Auth(format!(
                "server returned 401 for '{method}' ({www_auth})"
            )));
        }

        self.store_session_id_from_response(&http_resp).await;
        Ok(http_resp)
    }
}

#[async_trait::async_trait]
impl McpTransport for HttpStreamTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        debug!(method = %method, id = %id, url = %self.url, "HTTP client -> server");

        let http_resp = self.send(method, &req, timeout).await?;
        let status = http_resp.status();
        if !status.is_success() {
            let body = http_resp.text().await.unwrap_or_default();
            return Err(Error::Unexpected(format!(
                "server returned HTTP {status} for '{method}': {body}"
            )));
        }

        if Self::response_is_event_stream(&http_resp) {
            let body = http_resp.text().await.map_err(|e| {
                Error::Protocol(format!("failed to read event stream reply for '{method}': {e}"))
            })?;
            Self::parse_event_stream_response(&body, method)
        } else {
            http_resp.json().await.map_err(|e| {
                Error::Protocol(format!("failed to parse JSON-RPC reply for '{method}': {e}"))
            })
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        debug!(method = %method, url = %self.url, "HTTP client -> server (notification)");

        let http_resp = self
            .send(method, &notif, self.timeouts.request_timeout())
            .await?;
        if !http_resp.status().is_success() {
            warn!(
                method = %method,
                status = %http_resp.status(),
                "notification returned non-success"
            );
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let mut req = self
            .client
            .get(&self.url)
            .timeout(self.timeouts.quick_timeout())
            .header("Accept", STREAMABLE_ACCEPT_HEADER)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }

        match req.send().await {
            Ok(resp) => {
                self.store_session_id_from_response(&resp).await;
                true
            },
            Err(_) => false,
        }
    }

    async fn close(&self) {
        let session_id = {
            let mut slot = self.session_id.write().await;
            slot.take()
        };
        let Some(session_id) = session_id else {
            return;
        };

        let mut req = self
            .client
            .delete(&self.url)
            .timeout(self.timeouts.shutdown_timeout())
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .header(MCP_SESSION_ID_HEADER, session_id);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }

        if let Err(e) = req.send().await {
            warn!(url = %self.url, error = %e, "failed to close streamable HTTP session");
        }
    }
}
