//! MCP manager: orchestrates multiple named MCP server connections.
//!
//! Each connection's tools are bridged into one shared [`ToolRegistry`] under
//! `mcp__{server}__{tool}` identities. Connects and disconnects on the same
//! name are serialized; different names never wait on each other.

use capstan_tools::ToolRegistry;
use capstan_types::Tool;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::client::McpClient;
use crate::config::{McpConfig, McpServerConfig, ServerTarget};
use crate::error::McpError;
use crate::server::McpServer;
use crate::tool::McpTool;
use crate::transport::{StdioTransport, StreamableHttpTransport, Transport};

/// Default bound on handshake plus initial tool listing.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Emitted whenever a connection changes the registered tool set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsChanged {
    pub server: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Callback for [`ToolsChanged`] events.
pub type ChangeListener = Arc<dyn Fn(&ToolsChanged) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Snapshot of one named connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub name: String,
    pub status: ConnectionStatus,
    pub protocol_version: Option<String>,
    pub tool_count: usize,
    pub transport: &'static str,
    pub connected_at: DateTime<Utc>,
}

struct Connection {
    client: Arc<McpClient>,
    tools: Vec<String>,
    connected_at: DateTime<Utc>,
}

type Slot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    registry: Arc<ToolRegistry>,
    slots: Mutex<BTreeMap<String, Slot>>,
    listener: RwLock<Option<ChangeListener>>,
    connect_timeout: Duration,
}

impl McpManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            slots: Mutex::new(BTreeMap::new()),
            listener: RwLock::new(None),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound for connects that do not carry their own timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The shared registry bridged tools are published into.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Register the callback fired whenever the tool set changes.
    pub fn set_change_listener(&self, listener: impl Fn(&ToolsChanged) + Send + Sync + 'static) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Pair with an in-process server.
    pub async fn connect_local(&self, name: &str, server: Arc<McpServer>) -> Result<usize, McpError> {
        validate_name(name)?;
        let client = McpClient::new();
        client.connect(server)?;
        self.establish(name, Arc::new(client), false, self.connect_timeout)
            .await
    }

    /// Connect to a Streamable HTTP server at `url`.
    pub async fn connect_remote(&self, name: &str, url: &str) -> Result<usize, McpError> {
        validate_name(name)?;
        let transport = StreamableHttpTransport::new(url)?;
        self.connect_transport(name, Arc::new(transport), self.connect_timeout)
            .await
    }

    /// Spawn `command args…` and speak MCP over its stdio.
    pub async fn connect_stdio(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<usize, McpError> {
        validate_name(name)?;
        let transport = StdioTransport::new(command, args.to_vec());
        self.connect_transport(name, Arc::new(transport), self.connect_timeout)
            .await
    }

    /// Connect one configured server, honoring its timeout and environment.
    pub async fn connect_server(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<usize, McpError> {
        validate_name(name)?;
        let target = config
            .target(name)
            .map_err(|e| McpError::InvalidArguments {
                target: name.to_string(),
                message: e.to_string(),
            })?;
        let transport: Arc<dyn Transport> = match target {
            ServerTarget::Stdio { command, args, env } => {
                Arc::new(StdioTransport::new(command, args.to_vec()).with_env(env.clone()))
            }
            ServerTarget::Remote { url } => Arc::new(StreamableHttpTransport::new(url)?),
        };
        self.connect_transport(name, transport, config.timeout())
            .await
    }

    /// Connect every configured server.
    ///
    /// Servers that fail are logged and skipped; the rest stay connected.
    /// Returns the number of servers connected.
    pub async fn connect_configured(&self, config: &McpConfig) -> usize {
        let mut connected = 0;
        for (name, server_config) in &config.servers {
            match self.connect_server(name, server_config).await {
                Ok(_) => connected += 1,
                Err(e) => tracing::warn!("Failed to start MCP server '{name}': {e}"),
            }
        }
        connected
    }

    async fn connect_transport(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Result<usize, McpError> {
        let client = McpClient::with_transport(transport).with_request_timeout(timeout);
        self.establish(name, Arc::new(client), true, timeout).await
    }

    /// Replace whatever `name` held with `client` and publish its tools.
    async fn establish(
        &self,
        name: &str,
        client: Arc<McpClient>,
        handshake: bool,
        timeout: Duration,
    ) -> Result<usize, McpError> {
        let slot = self.slot(name);
        let mut current = slot.lock().await;

        let removed = match current.take() {
            Some(old) => {
                tracing::info!("Replacing MCP connection '{name}'");
                self.teardown(old).await
            }
            None => Vec::new(),
        };

        let listed = tokio::time::timeout(timeout, async {
            if handshake {
                client.connect_remote().await?;
            }
            client.list_tools().await
        })
        .await;

        let tools = match listed {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                client.disconnect().await;
                drop(current);
                self.notify_removed(name, removed);
                return Err(e);
            }
            Err(_) => {
                client.disconnect().await;
                drop(current);
                self.notify_removed(name, removed);
                return Err(McpError::Timeout {
                    operation: format!("connect to '{name}'"),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let mut added = Vec::with_capacity(tools.len());
        for info in tools {
            let bridge = McpTool::new(name, info, Arc::clone(&client));
            let identity = bridge.name().to_string();
            if added.contains(&identity) {
                tracing::warn!("MCP server '{name}' lists tool '{identity}' twice");
                continue;
            }
            if let Some(displaced) = self.registry.register(Arc::new(bridge)) {
                self.registry.register(displaced);
                for identity in &added {
                    self.registry.remove(identity);
                }
                client.disconnect().await;
                drop(current);
                self.notify_removed(name, removed);
                tracing::warn!("MCP server '{name}' tool '{identity}' collides with an existing tool");
                return Err(McpError::InvalidArguments {
                    target: name.to_string(),
                    message: format!("tool '{identity}' is already registered"),
                });
            }
            added.push(identity);
        }

        tracing::info!(
            "MCP server '{name}' connected with {} tools over {}",
            added.len(),
            client.transport_kind()
        );
        *current = Some(Connection {
            client,
            tools: added.clone(),
            connected_at: Utc::now(),
        });
        drop(current);

        let count = added.len();
        self.notify(ToolsChanged {
            server: name.to_string(),
            added,
            removed,
        });
        Ok(count)
    }

    /// Remove exactly the tools `name` registered and close its client.
    ///
    /// Unknown names are a no-op that returns `false`.
    pub async fn disconnect(&self, name: &str) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let Some(slot) = slot else {
            tracing::warn!("Cannot disconnect unknown MCP server '{name}'");
            return false;
        };

        let mut current = slot.lock().await;
        let Some(connection) = current.take() else {
            tracing::warn!("Cannot disconnect unknown MCP server '{name}'");
            return false;
        };
        let removed = self.teardown(connection).await;
        drop(current);

        tracing::info!("MCP server '{name}' disconnected");
        self.notify_removed(name, removed);
        true
    }

    /// Disconnect every known server.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in names {
            let slot = self.slot(&name);
            if slot.lock().await.is_some() {
                self.disconnect(&name).await;
            }
        }
    }

    /// Snapshot of current connections, sorted by name.
    ///
    /// A connection with a connect or disconnect in flight is left out.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();

        slots
            .into_iter()
            .filter_map(|(name, slot)| {
                let current = slot.try_lock().ok()?;
                let connection = current.as_ref()?;
                let status = if connection.client.is_initialized() {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Disconnected
                };
                Some(ConnectionInfo {
                    name,
                    status,
                    protocol_version: connection.client.protocol_version(),
                    tool_count: connection.tools.len(),
                    transport: connection.client.transport_kind(),
                    connected_at: connection.connected_at,
                })
            })
            .collect()
    }

    /// Bridged identities per connected server.
    pub fn server_tools(&self) -> HashMap<String, Vec<String>> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(name, slot)| {
                let current = slot.try_lock().ok()?;
                Some((name, current.as_ref()?.tools.clone()))
            })
            .collect()
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    async fn teardown(&self, connection: Connection) -> Vec<String> {
        for identity in &connection.tools {
            self.registry.remove(identity);
        }
        connection.client.disconnect().await;
        connection.tools
    }

    fn notify_removed(&self, name: &str, removed: Vec<String>) {
        if removed.is_empty() {
            return;
        }
        self.notify(ToolsChanged {
            server: name.to_string(),
            added: Vec::new(),
            removed,
        });
    }

    fn notify(&self, event: ToolsChanged) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(&event);
        }
    }
}

/// Server names become part of tool identities, so they may not contain the separator
/// or touch it from either side.
fn validate_name(name: &str) -> Result<(), McpError> {
    if name.is_empty() || name.contains("__") || name.starts_with('_') || name.ends_with('_') {
        return Err(McpError::InvalidArguments {
            target: name.to_string(),
            message: "server name must be non-empty, must not contain '__' and must not start or end with '_'"
                .to_string(),
        });
    }
    Ok(())
}
