//! Trait abstraction over the wire encodings.
//!
//! One implementation exists per encoding ([`StdioTransport`],
//! [`SseTransport`], [`HttpStreamTransport`]), selected at construction time
//! from the config's transport kind. Call sites in `client.rs` and
//! `manager.rs` only see this trait.
//!
//! [`StdioTransport`]: crate::transport::StdioTransport
//! [`SseTransport`]: crate::sse_transport::SseTransport
//! [`HttpStreamTransport`]: crate::http_transport::HttpStreamTransport

use std::time::Duration;

use {async_trait::async_trait, serde_json::Value};

use crate::{error::Result, types::JsonRpcResponse};

/// One JSON-RPC connection to one MCP server over one wire encoding.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait up to `timeout` for the matching response.
    ///
    /// A JSON-RPC error reply is returned as a response, not as `Err`; `Err`
    /// is reserved for transport failures (unreachable peer, timeout,
    /// unparseable reply).
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the underlying connection/process is still usable.
    async fn is_alive(&self) -> bool;

    /// Release the underlying connection. Idempotent.
    async fn close(&self);
}
