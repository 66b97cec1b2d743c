//! SSE transport: a long-lived `text/event-stream` GET carries responses,
//! requests are POSTed to an endpoint the server announces on that stream.
//!
//! Handshake: the first `event: endpoint` frame carries the POST URL
//! (absolute or relative to the stream URL). After that, every JSON-RPC
//! request goes to the discovered endpoint while the matching responses
//! arrive asynchronously as `message` frames and are routed by request id.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    tokio::sync::{Mutex, oneshot},
    tracing::{debug, warn},
    url::Url,
};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    metrics::SharedMetrics,
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// One server-sent event, reassembled from stream lines.
#[derive(Debug, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE frame parser. Feed raw chunks, get completed events.
///
/// Multi-line `data:` fields are joined with newlines; comment lines and
/// fields we don't use (`id:`, `retry:`) are skipped.
#[derive(Default)]
pub(crate) struct EventStreamParser {
    buf: Vec<u8>,
    event: String,
    data: String,
}

impl EventStreamParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    let event = if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    };
                    events.push(SseEvent {
                        event,
                        data: std::mem::take(&mut self.data),
                    });
                }
                self.event.clear();
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim_start().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.trim_start());
            }
        }
        events
    }
}

/// Resolve the announced endpoint against the stream URL.
fn resolve_endpoint(base: &Url, data: &str) -> Result<Url> {
    base.join(data.trim()).map_err(Into::into)
}

/// SSE-based wire to a remote MCP server.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    headers: Vec<(String, String)>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream, wait for endpoint discovery, start the reader.
    pub async fn connect(config: &ServerConfig, metrics: SharedMetrics) -> Result<Arc<Self>> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| {
                Error::Connection(format!("SSE transport for '{}' requires a url", config.name))
            })?;
        let base = Url::parse(url)?;
        let connect_timeout = config.timeouts.connect_timeout();

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;

        let headers = config.request_headers();
        let mut req = client
            .get(base.clone())
            .header("Accept", "text/event-stream");
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        debug!(server = %config.name, url = %base, "opening SSE stream");
        let resp = tokio::time::timeout(connect_timeout, req.send())
            .await
            .map_err(|_| Error::timed_out("SSE stream open", connect_timeout))??;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Auth(format!("SSE server at '{base}' returned 401")));
        }
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "SSE server at '{base}' returned HTTP {status}"
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let server = config.name.clone();
        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut parser = EventStreamParser::default();
            let mut stream = resp.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(server = %server, error = %e, "SSE stream read failed");
                        metrics.lock().stream_errors += 1;
                        break;
                    },
                };
                for event in parser.push(&bytes) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                metrics.lock().session_discoveries += 1;
                                let _ = tx.send(event.data);
                            }
                        },
                        _ => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                            Ok(resp) => {
                                let key = resp.id.to_string();
                                let mut map = reader_pending.lock().await;
                                if let Some(tx) = map.remove(&key) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!(
                                        server = %server,
                                        id = %key,
                                        "SSE response for unknown request id"
                                    );
                                }
                            },
                            Err(e) => {
                                debug!(
                                    server = %server,
                                    error = %e,
                                    "SSE frame is not a JSON-RPC response"
                                );
                            },
                        },
                    }
                }
            }

            debug!(server = %server, "SSE stream ended");
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending.lock().await.clear();
        });

        let endpoint = match tokio::time::timeout(connect_timeout, endpoint_rx).await {
            Ok(Ok(data)) => resolve_endpoint(&base, &data)?,
            Ok(Err(_)) => {
                handle.abort();
                return Err(Error::Connection(
                    "SSE stream closed before endpoint discovery".into(),
                ));
            },
            Err(_) => {
                handle.abort();
                return Err(Error::timed_out("SSE endpoint discovery", connect_timeout));
            },
        };

        debug!(endpoint = %endpoint, "SSE endpoint discovered");
        Ok(Arc::new(Self {
            client,
            endpoint,
            headers,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            closed: AtomicBool::new(false),
            reader_handle: Mutex::new(Some(handle)),
        }))
    }

    fn build_post(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Connection("SSE stream is not connected".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let id_key = req.id.to_string();

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(id_key.clone(), tx);
        }

        debug!(method = %method, id = %id, endpoint = %self.endpoint, "SSE client -> server");

        let sent = self.build_post().timeout(timeout).json(&req).send().await;
        let http_resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                self.pending.lock().await.remove(&id_key);
                return Err(e.into());
            },
        };

        let status = http_resp.status();
        if !status.is_success() {
            self.pending.lock().await.remove(&id_key);
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Auth(format!(
                    "SSE endpoint returned 401 for '{method}'"
                )));
            }
            return Err(Error::Unexpected(format!(
                "SSE endpoint returned HTTP {status} for '{method}'"
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::Connection(format!(
                "SSE stream closed while '{method}' was in flight"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id_key);
                Err(Error::timed_out(method, timeout))
            },
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Connection("SSE stream is not connected".into()));
        }

        let notif = JsonRpcNotification::new(method, params);
        let http_resp = self.build_post().json(&notif).send().await?;
        if !http_resp.status().is_success() {
            warn!(
                method = %method,
                status = %http_resp.status(),
                "SSE notification returned non-success"
            );
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
    }
}
