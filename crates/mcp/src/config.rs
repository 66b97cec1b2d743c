//! Server configuration: transport kind, connection parameters, timeouts.

use std::{collections::HashMap, path::Path, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::error::{Context, Result};

/// Wire encoding used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    StreamableHttp,
}

/// Operation bounds for one transport, in seconds.
///
/// Each bound is independently overridable per call where the API takes an
/// explicit timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Connect + handshake bound.
    pub connect: f64,
    /// General request bound.
    pub request: f64,
    /// Quick probe (ping, liveness) bound.
    pub quick: f64,
    /// Teardown bound.
    pub shutdown: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: 10.0,
            request: 30.0,
            quick: 5.0,
            shutdown: 5.0,
        }
    }
}

impl Timeouts {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.quick)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown)
    }
}

/// Configuration for one MCP server. Immutable once a transport is built
/// from it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,

    // stdio
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // http family
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
    /// Seed session id for streamable HTTP; servers may replace it.
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub timeouts: Timeouts,
}

impl ServerConfig {
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            api_key: None,
            session_id: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Sse,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            api_key: None,
            session_id: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::StreamableHttp,
            ..Self::sse(name, url)
        }
    }

    /// The explicit API key, or one recovered from an
    /// `Authorization: Bearer <token>` header.
    pub fn bearer_token(&self) -> Option<Secret<String>> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
            .and_then(|(_, v)| v.strip_prefix("Bearer "))
            .map(|token| Secret::new(token.to_string()))
    }

    /// Headers to send on every HTTP request for this server.
    ///
    /// Configured headers are passed through verbatim. The API key is added
    /// as `Authorization: Bearer <key>` only when no explicit `Authorization`
    /// header is configured; an explicit header always wins.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let has_explicit_auth = out
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("authorization"));
        if !has_explicit_auth && let Some(key) = &self.api_key {
            out.push((
                "Authorization".into(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        out
    }
}

/// A set of server entries, typically loaded from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl McpConfig {
    /// Load from a JSON file, or return empty if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "MCP config file not found, using empty");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read MCP config: {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse MCP config: {}", path.display()))
    }
}
