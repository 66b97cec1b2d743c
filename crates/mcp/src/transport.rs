//! Stdio transport: spawn a child process and exchange newline-delimited
//! JSON-RPC over its stdin/stdout.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, Command},
        sync::{Mutex, oneshot},
    },
    tracing::{debug, trace, warn},
};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    metrics::SharedMetrics,
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Stdio-based wire to an MCP server process.
///
/// One request is in flight per id; the reader task routes each response line
/// to the waiting sender. The pipe carries one message per line.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process and start the reader loop.
    pub async fn spawn(config: &ServerConfig, metrics: SharedMetrics) -> Result<Arc<Self>> {
        let command = &config.command;
        debug!(
            server = %config.name,
            command = %command,
            args = ?config.args,
            "spawning MCP server process"
        );

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Connection(format!("failed to spawn MCP server '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        // Forward server stderr into our logs.
        if let Some(stderr) = stderr {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                warn!(server = %server, stderr = %trimmed, "MCP server stderr");
                            }
                        },
                    }
                }
            });
        }

        let pending_reader = Arc::clone(&pending);
        let server = config.name.clone();
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %server, "MCP server stdout closed");
                        break;
                    },
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(server = %server, raw = %trimmed, "MCP server -> client");

                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                let key = resp.id.to_string();
                                let mut map = pending_reader.lock().await;
                                if let Some(tx) = map.remove(&key) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!(
                                        server = %server,
                                        id = %key,
                                        "response for unknown request id"
                                    );
                                }
                            },
                            Err(e) => {
                                debug!(
                                    server = %server,
                                    error = %e,
                                    line = %trimmed,
                                    "MCP server sent non-response line"
                                );
                            },
                        }
                    },
                    Err(e) => {
                        warn!(server = %server, error = %e, "error reading MCP server stdout");
                        metrics.lock().stream_errors += 1;
                        break;
                    },
                }
            }
            // Fail any in-flight requests instead of letting them run out
            // their timeouts.
            pending_reader.lock().await.clear();
        });

        let transport = Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader_handle: Mutex::new(Some(handle)),
        });
        Ok(transport)
    }

    async fn write_line(&self, payload: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("stdio transport is closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let id_key = req.id.to_string();

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(id_key.clone(), tx);
        }

        let payload = serde_json::to_string(&req)?;
        debug!(method = %method, id = %id, "client -> MCP server");

        if let Err(e) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&id_key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                // Reader task dropped the sender: process exited mid-request.
                Err(Error::Connection(format!(
                    "MCP server closed its pipe while '{method}' was in flight"
                )))
            },
            Err(_) => {
                self.pending.lock().await.remove(&id_key);
                Err(Error::timed_out(method, timeout))
            },
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("stdio transport is closed".into()));
        }

        let notif = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_string(&notif)?;
        trace!(method = %method, "client -> MCP server (notification)");
        self.write_line(&payload).await
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_config() -> ServerConfig {
        ServerConfig::stdio("cat", "cat", vec![])
    }

    #[tokio::test]
    async fn spawn_and_close() {
        let transport = StdioTransport::spawn(&cat_config(), SharedMetrics::default())
            .await
            .unwrap();
        assert!(transport.is_alive().await);
        transport.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn close_twice_is_safe() {
        let transport = StdioTransport::spawn(&cat_config(), SharedMetrics::default())
            .await
            .unwrap();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_is_connection_error() {
        let config = ServerConfig::stdio("bad", "nonexistent_command_xyz_42", vec![]);
        let result = StdioTransport::spawn(&config, SharedMetrics::default()).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn request_after_close_is_rejected() {
        let transport = StdioTransport::spawn(&cat_config(), SharedMetrics::default())
            .await
            .unwrap();
        transport.close().await;
        let err = transport
            .request("ping", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn request_times_out_against_silent_peer() {
        // `cat` echoes our request back; the echo parses as a response with a
        // matching id but no result, so the request resolves. `sleep` never
        // writes, which exercises the timeout path.
        let config = ServerConfig::stdio("sleep", "sleep", vec!["5".into()]);
        let transport = StdioTransport::spawn(&config, SharedMetrics::default())
            .await
            .unwrap();
        let err = transport
            .request("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(transport.pending.lock().await.is_empty());
        transport.close().await;
    }

    #[tokio::test]
    async fn echoed_request_resolves_as_empty_response() {
        let transport = StdioTransport::spawn(&cat_config(), SharedMetrics::default())
            .await
            .unwrap();
        let resp = transport
            .request("ping", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(resp.result.is_none());
        assert!(resp.error.is_none());
        transport.close().await;
    }
}
