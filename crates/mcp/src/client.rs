//! Per-server MCP client: performs the protocol handshake and owns the
//! connection lifecycle (state machine, metrics, crash recovery) over one
//! wire transport.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    config::{ServerConfig, TransportKind},
    error::{Error, Result},
    http_transport::HttpStreamTransport,
    metrics::{SharedMetrics, TransportMetrics},
    normalize::normalize,
    sse_transport::SseTransport,
    traits::McpTransport,
    transport::StdioTransport,
    types::{
        CallResult, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
        JsonRpcResponse, PROTOCOL_VERSION, ToolDescriptor, ToolsCallParams, ToolsListResult,
    },
};

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, handshake not yet completed. Retryable.
    Uninitialized,
    /// Handshake done; calls are allowed.
    Ready,
    /// Torn down; an explicit `initialize` is required to come back.
    Closed,
}

/// Constructor table: build the wire matching the config's transport kind.
async fn connect_wire(
    config: &ServerConfig,
    metrics: SharedMetrics,
) -> Result<Arc<dyn McpTransport>> {
    let wire: Arc<dyn McpTransport> = match config.transport {
        TransportKind::Stdio => StdioTransport::spawn(config, metrics).await?,
        TransportKind::Sse => SseTransport::connect(config, metrics).await?,
        TransportKind::StreamableHttp => HttpStreamTransport::new(config, metrics)?,
    };
    Ok(wire)
}

fn expect_result(resp: JsonRpcResponse, method: &str) -> Result<serde_json::Value> {
    if let Some(err) = resp.error {
        return Err(Error::Unexpected(format!(
            "'{method}' failed: code={} message={}",
            err.code, err.message
        )));
    }
    resp.result
        .ok_or_else(|| Error::Protocol(format!("'{method}' returned no result")))
}

/// An MCP client connected to a single server.
pub struct McpClient {
    name: String,
    config: ServerConfig,
    state: RwLock<ClientState>,
    transport: RwLock<Option<Arc<dyn McpTransport>>>,
    server_info: RwLock<Option<InitializeResult>>,
    metrics: SharedMetrics,
    recovering: AtomicBool,
}

impl McpClient {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            state: RwLock::new(ClientState::Uninitialized),
            transport: RwLock::new(None),
            server_info: RwLock::new(None),
            metrics: SharedMetrics::default(),
            recovering: AtomicBool::new(false),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// The config this client was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Reflects current state; no probe is sent.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Ready
    }

    /// Connect the wire and perform the `initialize`/`initialized` handshake.
    ///
    /// Succeeds or returns the classified failure; there is no partial
    /// outcome. On failure the client stays retryable (`Uninitialized`).
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == ClientState::Ready {
            return Ok(());
        }

        let started = Instant::now();
        match self.do_initialize().await {
            Ok((wire, server_info)) => {
                *self.transport.write().await = Some(wire);
                *self.server_info.write().await = Some(server_info);
                self.metrics.lock().initialization_time = Some(started.elapsed().as_secs_f64());
                *state = ClientState::Ready;
                Ok(())
            },
            Err(e) => {
                self.metrics.lock().connection_errors += 1;
                warn!(server = %self.name, error = %e, "MCP initialize handshake failed");
                *state = ClientState::Uninitialized;
                Err(e)
            },
        }
    }

    async fn do_initialize(&self) -> Result<(Arc<dyn McpTransport>, InitializeResult)> {
        let wire = connect_wire(&self.config, self.metrics.clone()).await?;
        let connect_timeout = self.config.timeouts.connect_timeout();

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "manifold".into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            },
        };

        let handshake = async {
            let resp = wire
                .request(
                    "initialize",
                    Some(serde_json::to_value(&params)?),
                    connect_timeout,
                )
                .await?;
            let result = expect_result(resp, "initialize")?;
            let server_info: InitializeResult = serde_json::from_value(result)
                .map_err(|e| Error::Protocol(format!("bad initialize result: {e}")))?;

            if server_info.protocol_version != PROTOCOL_VERSION {
                debug!(
                    server = %self.name,
                    ours = PROTOCOL_VERSION,
                    theirs = %server_info.protocol_version,
                    "protocol version differs"
                );
            }

            wire.notify("notifications/initialized", None).await?;
            Ok::<_, Error>(server_info)
        };

        match handshake.await {
            Ok(server_info) => {
                info!(
                    server = %self.name,
                    protocol = %server_info.protocol_version,
                    peer = %server_info.server_info.name,
                    "MCP server initialized"
                );
                Ok((wire, server_info))
            },
            Err(e) => {
                wire.close().await;
                Err(e)
            },
        }
    }

    /// Tear down the connection. Idempotent, safe before `initialize`.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        let wire = self.transport.write().await.take();
        *self.server_info.write().await = None;
        *state = ClientState::Closed;
        drop(state);

        if let Some(wire) = wire {
            let shutdown = self.config.timeouts.shutdown_timeout();
            if tokio::time::timeout(shutdown, wire.close()).await.is_err() {
                warn!(server = %self.name, "transport close exceeded shutdown timeout");
            }
        }
    }

    /// Liveness probe bounded by the quick timeout.
    pub async fn send_ping(&self) -> bool {
        let Ok(wire) = self.wire().await else {
            return false;
        };
        let quick = self.config.timeouts.quick_timeout();
        let started = Instant::now();
        match wire.request("ping", None, quick).await {
            Ok(resp) if resp.error.is_none() => {
                self.metrics.lock().last_ping_time = Some(started.elapsed().as_secs_f64());
                true
            },
            Ok(_) => false,
            Err(e) => {
                debug!(server = %self.name, error = %e, "ping failed");
                false
            },
        }
    }

    /// Fetch the tools this server advertises, stamped with its name.
    pub async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_ready().await?;
        let wire = self.wire().await?;
        let resp = wire
            .request("tools/list", None, self.config.timeouts.request_timeout())
            .await?;
        let result = expect_result(resp, "tools/list")?;
        let list: ToolsListResult = serde_json::from_value(result)?;

        let mut tools = list.tools;
        for tool in &mut tools {
            tool.server = self.name.clone();
        }
        debug!(server = %self.name, count = tools.len(), "fetched MCP tools");
        Ok(tools)
    }

    /// Invoke one tool. Always returns a normalized [`CallResult`]; transport
    /// failures become `{isError: true, error}` after at most one transparent
    /// recovery attempt.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> CallResult {
        if let Err(e) = self.ensure_ready().await {
            return CallResult::err(e.to_string());
        }
        let timeout = timeout.unwrap_or_else(|| self.config.timeouts.request_timeout());
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        let params = match serde_json::to_value(&params) {
            Ok(v) => v,
            Err(e) => return CallResult::err(format!("failed to encode arguments: {e}")),
        };

        match self.dispatch(params.clone(), timeout).await {
            Ok(result) => result,
            Err(e) => {
                if self.crash_detected(&e).await {
                    info!(server = %self.name, error = %e, "transport crash detected, recovering");
                    if self.recover().await {
                        return match self.dispatch(params, timeout).await {
                            Ok(result) => result,
                            Err(replay) => CallResult::err(replay.to_string()),
                        };
                    }
                }
                CallResult::err(e.to_string())
            },
        }
    }

    /// One `tools/call` wire attempt, with metrics bookkeeping.
    async fn dispatch(
        &self,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<CallResult> {
        let wire = self.wire().await?;
        let started = Instant::now();
        match wire.request("tools/call", Some(params), timeout).await {
            Ok(resp) => {
                self.metrics
                    .lock()
                    .record_call(started.elapsed(), resp.error.is_none());
                let raw = serde_json::to_value(&resp)?;
                Ok(normalize(&raw))
            },
            Err(e) => {
                self.metrics.lock().record_call(started.elapsed(), false);
                Err(e)
            },
        }
    }

    async fn crash_detected(&self, e: &Error) -> bool {
        if !e.is_connection() {
            return false;
        }
        let Ok(wire) = self.wire().await else {
            return false;
        };
        !wire.is_alive().await
    }

    /// Default recovery: tear the connection down and redo the handshake.
    ///
    /// Returns whether the client is `Ready` again. Nothing escapes the
    /// attempt; a failure leaves the client `Closed` until an explicit
    /// `initialize`. Only one recovery runs at a time.
    pub async fn recover(&self) -> bool {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut m = self.metrics.lock();
            m.recovery_attempts += 1;
            m.connection_resets += 1;
        }

        self.close().await;
        *self.state.write().await = ClientState::Uninitialized;

        let recovered = match self.initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!(server = %self.name, error = %e, "recovery failed");
                *self.state.write().await = ClientState::Closed;
                false
            },
        };
        self.recovering.store(false, Ordering::SeqCst);
        recovered
    }

    /// Whether the server advertised the optional resources capability.
    pub async fn supports_resources(&self) -> bool {
        self.server_info
            .read()
            .await
            .as_ref()
            .is_some_and(|i| i.capabilities.resources.is_some())
    }

    /// Whether the server advertised the optional prompts capability.
    pub async fn supports_prompts(&self) -> bool {
        self.server_info
            .read()
            .await
            .as_ref()
            .is_some_and(|i| i.capabilities.prompts.is_some())
    }

    pub async fn list_resources(&self) -> Result<Vec<serde_json::Value>> {
        self.list_collection("resources/list", "resources").await
    }

    pub async fn list_prompts(&self) -> Result<Vec<serde_json::Value>> {
        self.list_collection("prompts/list", "prompts").await
    }

    async fn list_collection(&self, method: &str, key: &str) -> Result<Vec<serde_json::Value>> {
        self.ensure_ready().await?;
        let wire = self.wire().await?;
        let resp = wire
            .request(method, None, self.config.timeouts.request_timeout())
            .await?;
        let result = expect_result(resp, method)?;
        Ok(result
            .get(key)
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Copy of the metrics record.
    pub fn get_metrics(&self) -> TransportMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub(crate) async fn transport_handle(&self) -> Option<Arc<dyn McpTransport>> {
        self.transport.read().await.clone()
    }

    async fn ensure_ready(&self) -> Result<()> {
        let state = *self.state.read().await;
        if state != ClientState::Ready {
            return Err(Error::Connection(format!(
                "MCP client for '{}' is not ready (state: {state:?})",
                self.name
            )));
        }
        Ok(())
    }

    async fn wire(&self) -> Result<Arc<dyn McpTransport>> {
        self.transport.read().await.clone().ok_or_else(|| {
            Error::Connection(format!("MCP client for '{}' has no transport", self.name))
        })
    }
}

#[cfg(test)]
impl McpClient {
    /// Install a wire and mark the client `Ready`, bypassing the handshake.
    pub(crate) async fn force_ready(&self, wire: Arc<dyn McpTransport>) {
        *self.transport.write().await = Some(wire);
        *self.state.write().await = ClientState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use serde_json::json;

    use super::*;
    use crate::types::JsonRpcError;

    enum Mode {
        Ok(serde_json::Value),
        RpcError(String),
        ConnError,
    }

    struct MockWire {
        mode: Mode,
        alive: AtomicBool,
        requests: AtomicU64,
    }

    impl MockWire {
        fn new(mode: Mode, alive: bool) -> Arc<Self> {
            Arc::new(Self {
                mode,
                alive: AtomicBool::new(alive),
                requests: AtomicU64::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl McpTransport for MockWire {
        async fn request(
            &self,
            _method: &str,
            _params: Option<serde_json::Value>,
            _timeout: Duration,
        ) -> Result<JsonRpcResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                Mode::Ok(v) => Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1u64.into(),
                    result: Some(v.clone()),
                    error: None,
                }),
                Mode::RpcError(message) => Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1u64.into(),
                    result: None,
                    error: Some(JsonRpcError {
                        code: -32000,
                        message: message.clone(),
                        data: None,
                    }),
                }),
                Mode::ConnError => Err(Error::Connection("mock wire down".into())),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<serde_json::Value>) -> Result<()> {
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    async fn mount_handshake(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
        vec![
            server
                .mock("POST", "/")
                .match_body(mockito::Matcher::PartialJsonString(
                    r#"{"method":"initialize"}"#.into(),
                ))
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(
                    r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock"}}}"#,
                )
                .create_async()
                .await,
            server
                .mock("POST", "/")
                .match_body(mockito::Matcher::PartialJsonString(
                    r#"{"method":"notifications/initialized"}"#.into(),
                ))
                .with_status(202)
                .create_async()
                .await,
        ]
    }

    #[tokio::test]
    async fn call_before_initialize_is_rejected() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://localhost/mcp"));
        let result = client.call_tool("anything", json!({}), None).await;
        assert!(result.is_error);
        assert!(result.error.unwrap().contains("not ready"));
        assert_eq!(client.get_metrics().total_calls, 0);
    }

    #[tokio::test]
    async fn call_tool_normalizes_and_tracks_metrics() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://localhost/mcp"));
        let wire = MockWire::new(
            Mode::Ok(json!({"content": [{"type": "text", "text": "5"}]})),
            true,
        );
        client.force_ready(wire).await;

        for _ in 0..3 {
            let result = client.call_tool("echo", json!({}), None).await;
            assert_eq!(result, CallResult::ok(Some(json!(5))));
        }

        let m = client.get_metrics();
        assert_eq!(m.total_calls, 3);
        assert_eq!(m.successful_calls, 3);
        assert!((m.avg_response_time - m.total_time / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rpc_error_reply_becomes_error_result() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://localhost/mcp"));
        client
            .force_ready(MockWire::new(Mode::RpcError("boom".into()), true))
            .await;

        let result = client.call_tool("bad", json!({}), None).await;
        assert_eq!(result, CallResult::err("boom"));
        assert_eq!(client.get_metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn dead_wire_triggers_recovery_and_replay() {
        let mut server = mockito::Server::new_async().await;
        let _handshake = mount_handshake(&mut server).await;
        let _call = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"tools/call"}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"recovered"}]}}"#,
            )
            .create_async()
            .await;

        let client = McpClient::new(ServerConfig::streamable_http("s", server.url()));
        client
            .force_ready(MockWire::new(Mode::ConnError, false))
            .await;

        let result = client.call_tool("echo", json!({}), None).await;
        assert_eq!(result, CallResult::ok(Some(json!("recovered"))));

        let m = client.get_metrics();
        assert_eq!(m.recovery_attempts, 1);
        assert_eq!(m.connection_resets, 1);
        assert_eq!(client.state().await, ClientState::Ready);
    }

    #[tokio::test]
    async fn failed_recovery_leaves_client_closed() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://127.0.0.1:1/mcp"));
        client
            .force_ready(MockWire::new(Mode::ConnError, false))
            .await;

        let result = client.call_tool("echo", json!({}), None).await;
        assert!(result.is_error);
        assert_eq!(client.state().await, ClientState::Closed);

        // Next call surfaces a clear connection error instead of retrying.
        let next = client.call_tool("echo", json!({}), None).await;
        assert!(next.error.unwrap().contains("not ready"));
        assert_eq!(client.get_metrics().recovery_attempts, 1);
    }

    #[tokio::test]
    async fn initialize_failure_stays_uninitialized() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://127.0.0.1:1/mcp"));
        assert!(client.initialize().await.is_err());
        assert_eq!(client.state().await, ClientState::Uninitialized);
        assert!(client.get_metrics().connection_errors >= 1);
    }

    #[tokio::test]
    async fn stdio_echo_peer_fails_handshake_cleanly() {
        // `cat` echoes the request back: a well-formed frame with no result.
        let client = McpClient::new(ServerConfig::stdio("cat", "cat", vec![]));
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(client.state().await, ClientState::Uninitialized);
    }

    #[tokio::test]
    async fn initialize_and_recover_over_http() {
        let mut server = mockito::Server::new_async().await;
        let _handshake = mount_handshake(&mut server).await;

        let client = McpClient::new(ServerConfig::streamable_http("s", server.url()));
        client.initialize().await.unwrap();
        assert!(client.is_connected().await);
        assert!(client.get_metrics().initialization_time.is_some());

        assert!(client.recover().await);
        assert_eq!(client.state().await, ClientState::Ready);
        assert_eq!(client.get_metrics().recovery_attempts, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_calls() {
        let client = McpClient::new(ServerConfig::streamable_http("s", "http://localhost/mcp"));
        client
            .force_ready(MockWire::new(Mode::Ok(json!({})), true))
            .await;

        client.close().await;
        client.close().await;
        assert_eq!(client.state().await, ClientState::Closed);
        assert!(!client.is_connected().await);

        let result = client.call_tool("echo", json!({}), None).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn second_initialize_is_a_no_op() {
        let mut server = mockito::Server::new_async().await;
        let _handshake = mount_handshake(&mut server).await;

        let client = McpClient::new(ServerConfig::streamable_http("s", server.url()));
        client.initialize().await.unwrap();
        client.initialize().await.unwrap();
        assert_eq!(client.state().await, ClientState::Ready);
    }
}
