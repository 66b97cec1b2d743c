//! StreamManager: aggregation, routing, and lifecycle for a named set of
//! MCP server connections.

use std::{collections::HashMap, sync::Arc};

use {
    futures::future::join_all,
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    client::McpClient,
    config::ServerConfig,
    error::{Error, Result},
    traits::McpTransport,
    types::{CallResult, PingStatus, ServerInfo, ServerStatus, ToolDescriptor},
};

/// Aggregate state behind the single lock on [`StreamManager`].
struct Inner {
    clients: HashMap<String, Arc<McpClient>>,
    catalog: Vec<ToolDescriptor>,
    routing: HashMap<String, String>,
    servers: Vec<ServerInfo>,
    closed: bool,
}

/// Holds connections to N MCP servers, merges their tools into one catalog
/// and routing table, and dispatches calls to the owning server.
///
/// All operations are safe to call concurrently. Aggregate state is only
/// mutated during registration and `close`; network I/O to distinct peers
/// proceeds outside the lock.
pub struct StreamManager {
    inner: RwLock<Inner>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                catalog: Vec::new(),
                routing: HashMap::new(),
                servers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Connect and register every configured server.
    ///
    /// Servers are set up concurrently; a failing server is logged and
    /// skipped without affecting the rest. Returns the names that
    /// registered. Tool-name collisions resolve last-registration-wins in
    /// config order.
    pub async fn initialize(&self, configs: Vec<ServerConfig>) -> Result<Vec<String>> {
        if self.inner.read().await.closed {
            return Err(Error::Connection(
                "stream manager is closed; construct a new one to reconnect".into(),
            ));
        }

        let setups = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            let client = Arc::new(McpClient::new(config));

            if let Err(e) = client.initialize().await {
                warn!(server = %name, error = %e, "failed to initialize MCP server, skipping");
                return None;
            }

            let up = client.send_ping().await;
            match client.get_tools().await {
                Ok(tools) => Some((client, tools, up)),
                Err(e) => {
                    warn!(server = %name, error = %e, "failed to list tools, skipping server");
                    client.close().await;
                    None
                },
            }
        });
        let setups: Vec<_> = join_all(setups).await.into_iter().flatten().collect();

        // Registration happens under the lock, in config order.
        let mut started = Vec::new();
        let mut inner = self.inner.write().await;
        for (client, tools, up) in setups {
            let name = client.server_name().to_string();
            for tool in &tools {
                if let Some(prev) = inner.routing.insert(tool.name.clone(), name.clone())
                    && prev != name
                {
                    warn!(
                        tool = %tool.name,
                        previous = %prev,
                        new = %name,
                        "tool name collision, last registration wins"
                    );
                }
            }
            inner.catalog.extend(tools.iter().cloned());
            inner.servers.push(ServerInfo {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                tool_count: tools.len(),
                status: if up { ServerStatus::Up } else { ServerStatus::Down },
            });
            inner.clients.insert(name.clone(), client);

            info!(server = %name, tools = tools.len(), up, "registered MCP server");
            started.push(name);
        }
        Ok(started)
    }

    /// [`initialize`](Self::initialize) over `(name, command, args)` triples.
    pub async fn initialize_stdio(
        &self,
        servers: Vec<(String, String, Vec<String>)>,
    ) -> Result<Vec<String>> {
        self.initialize(
            servers
                .into_iter()
                .map(|(name, command, args)| ServerConfig::stdio(name, command, args))
                .collect(),
        )
        .await
    }

    /// [`initialize`](Self::initialize) over `(name, url)` pairs.
    pub async fn initialize_sse(&self, servers: Vec<(String, String)>) -> Result<Vec<String>> {
        self.initialize(
            servers
                .into_iter()
                .map(|(name, url)| ServerConfig::sse(name, url))
                .collect(),
        )
        .await
    }

    /// [`initialize`](Self::initialize) over `(name, url)` pairs.
    pub async fn initialize_http(&self, servers: Vec<(String, String)>) -> Result<Vec<String>> {
        self.initialize(
            servers
                .into_iter()
                .map(|(name, url)| ServerConfig::streamable_http(name, url))
                .collect(),
        )
        .await
    }

    /// Read-only view of the aggregate tool catalog.
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.read().await.catalog.clone()
    }

    /// The server owning `tool`, if any.
    pub async fn get_server_for_tool(&self, tool: &str) -> Option<String> {
        self.inner.read().await.routing.get(tool).cloned()
    }

    /// Registration-time snapshots for reporting.
    pub async fn server_infos(&self) -> Vec<ServerInfo> {
        self.inner.read().await.servers.clone()
    }

    /// Live tool listing from one server. Missing server or transport
    /// failure yields an empty list, never an error.
    pub async fn list_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        let client = self.inner.read().await.clients.get(server).cloned();
        let Some(client) = client else {
            warn!(server = %server, "list_tools for unknown server");
            return Vec::new();
        };
        match client.get_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server = %server, error = %e, "list_tools failed");
                Vec::new()
            },
        }
    }

    /// Invoke a tool, resolving the owning server via `server` or the
    /// routing table. Unresolved names yield an error result, not an error.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        server: Option<&str>,
    ) -> CallResult {
        let client = {
            let inner = self.inner.read().await;
            let owner = match server {
                Some(name) => Some(name.to_string()),
                None => inner.routing.get(tool).cloned(),
            };
            owner.and_then(|name| inner.clients.get(&name).cloned())
        };

        match client {
            Some(client) => client.call_tool(tool, arguments, None).await,
            None => CallResult::err(Error::Routing(tool.to_string()).to_string()),
        }
    }

    /// Ping every server concurrently. One peer's failure never affects the
    /// others' reported status.
    pub async fn ping_servers(&self) -> Vec<PingStatus> {
        let clients = self.clients_snapshot().await;
        let mut statuses = join_all(clients.into_iter().map(|(server, client)| async move {
            PingStatus {
                server,
                ok: client.send_ping().await,
            }
        }))
        .await;
        statuses.sort_by(|a, b| a.server.cmp(&b.server));
        statuses
    }

    /// Best-effort `resources/list` across servers advertising the
    /// capability; each item is stamped with its `server`.
    pub async fn list_resources(&self) -> Vec<serde_json::Value> {
        self.aggregate_optional("resources", |client| async move {
            if !client.supports_resources().await {
                return None;
            }
            Some(client.list_resources().await)
        })
        .await
    }

    /// Best-effort `prompts/list` across servers advertising the capability.
    pub async fn list_prompts(&self) -> Vec<serde_json::Value> {
        self.aggregate_optional("prompts", |client| async move {
            if !client.supports_prompts().await {
                return None;
            }
            Some(client.list_prompts().await)
        })
        .await
    }

    async fn aggregate_optional<F, Fut>(&self, what: &str, fetch: F) -> Vec<serde_json::Value>
    where
        F: Fn(Arc<McpClient>) -> Fut,
        Fut: Future<Output = Option<Result<Vec<serde_json::Value>>>>,
    {
        let clients = self.clients_snapshot().await;
        let results = join_all(clients.into_iter().map(|(server, client)| {
            let fut = fetch(client);
            async move { (server, fut.await) }
        }))
        .await;

        let mut items = Vec::new();
        for (server, result) in results {
            match result {
                None => debug!(server = %server, "server does not expose {what}"),
                Some(Err(e)) => {
                    warn!(server = %server, error = %e, "failed to list {what}");
                },
                Some(Ok(list)) => {
                    for mut item in list {
                        if let Some(map) = item.as_object_mut() {
                            map.insert("server".into(), serde_json::Value::String(server.clone()));
                        }
                        items.push(item);
                    }
                },
            }
        }
        items
    }

    /// Concurrently tear down every connection and clear all aggregate
    /// state. The manager is not reusable afterward.
    pub async fn close(&self) {
        let clients: Vec<Arc<McpClient>> = {
            let mut inner = self.inner.write().await;
            inner.closed = true;
            inner.catalog.clear();
            inner.routing.clear();
            inner.servers.clear();
            inner.clients.drain().map(|(_, c)| c).collect()
        };

        if clients.is_empty() {
            return;
        }
        info!(count = clients.len(), "closing MCP servers");
        join_all(clients.iter().map(|client| client.close())).await;
    }

    /// Back-compat accessor: the raw wire handles for every connected
    /// server. Not part of the steady-state contract.
    pub async fn get_streams(&self) -> Vec<(String, Arc<dyn McpTransport>)> {
        let clients = self.clients_snapshot().await;
        let mut streams = Vec::new();
        for (server, client) in clients {
            if let Some(wire) = client.transport_handle().await {
                streams.push((server, wire));
            }
        }
        streams
    }

    async fn clients_snapshot(&self) -> Vec<(String, Arc<McpClient>)> {
        self.inner
            .read()
            .await
            .clients
            .iter()
            .map(|(name, client)| (name.clone(), Arc::clone(client)))
            .collect()
    }
}
