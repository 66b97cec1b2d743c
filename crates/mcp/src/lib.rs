//! MCP (Model Context Protocol) multi-server client for manifold.
//!
//! This crate provides:
//! - JSON-RPC 2.0 framing over three wire encodings: child-process stdio
//!   (`transport`), SSE with endpoint discovery (`sse_transport`), and
//!   streamable HTTP (`http_transport`)
//! - Response normalization into one canonical call-result shape (`normalize`)
//! - Per-server client with handshake, metrics, and crash recovery (`client`)
//! - Multi-server aggregation, tool routing, and lifecycle (`manager`)
//! - Server configuration surface and file loader (`config`)

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod normalize;
pub mod traits;
pub mod transport;
pub mod types;

pub mod http_transport;
pub mod sse_transport;

pub use {
    client::{ClientState, McpClient},
    config::{McpConfig, ServerConfig, Timeouts, TransportKind},
    error::{Error, Result},
    manager::StreamManager,
    metrics::TransportMetrics,
    normalize::{extract_content, normalize},
    traits::McpTransport,
    types::{CallResult, PingStatus, ServerInfo, ServerStatus, ToolDescriptor},
};
