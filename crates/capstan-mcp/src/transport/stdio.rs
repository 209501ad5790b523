//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and manages async communication over stdin/stdout
//! using newline-delimited JSON-RPC messages. The child lives exactly from
//! `start()` to `stop()` and is killed if the transport is dropped first.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BoxFuture, CloseHandler, Handlers, MessageHandler, Transport};
use crate::error::McpError;
use crate::jsonrpc::JsonRpcMessage;

/// How long a child may take to exit after its stdin is closed.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Running {
    write_tx: mpsc::Sender<String>,
    child: Child,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

/// Async stdio transport for communicating with an MCP server process.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    shutdown_grace: Duration,
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl StdioTransport {
    /// Describe the process to run. Nothing is spawned until `start()`.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            handlers: Arc::new(Handlers::default()),
            connected: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    /// Extra environment variables for the child process.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// How long `stop()` waits for a graceful exit before killing the child.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn spawn(&self) -> Result<Running, McpError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            command: self.command.clone(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout was not piped".to_string()))?;
        let stderr = child.stderr.take();

        // Mark connected before the reader exists so an immediate EOF wins.
        self.connected.store(true, Ordering::SeqCst);

        // Writer task: drains channel and writes to child stdin
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let connected = Arc::clone(&self.connected);
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = write_rx.recv().await {
                let written = async {
                    stdin.write_all(msg.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!("Failed to write to MCP server stdin: {e}");
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // Reader task: reads lines from stdout, parses JSON-RPC, dispatches in order
        let handlers = Arc::clone(&self.handlers);
        let connected = Arc::clone(&self.connected);
        let command = self.command.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => match std::str::from_utf8(&line) {
                        Ok(text) if text.trim().is_empty() => {}
                        Ok(text) => handlers.dispatch_text(text.trim_end()),
                        Err(e) => tracing::warn!(
                            "Skipping non-UTF-8 line from MCP server '{command}': {e}"
                        ),
                    },
                    Err(e) => {
                        tracing::warn!("Failed to read from MCP server '{command}': {e}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            handlers.closed(format!("MCP server '{command}' closed its output"));
        });

        let stderr_handle = stderr.map(|stderr| {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{command} stderr] {line}");
                }
            })
        });

        Ok(Running {
            write_tx,
            child,
            reader_handle,
            writer_handle,
            stderr_handle,
        })
    }

    fn writer(&self) -> Option<mpsc::Sender<String>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.write_tx.clone())
    }
}

impl Transport for StdioTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.is_some() {
                return Ok(());
            }
            let spawned = self.spawn()?;
            tracing::debug!(
                "Spawned MCP server '{}' (pid {:?})",
                self.command,
                spawned.child.id()
            );
            *running = Some(spawned);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let running = self
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(running) = running else {
                return Ok(());
            };
            self.connected.store(false, Ordering::SeqCst);

            let Running {
                write_tx,
                mut child,
                reader_handle,
                writer_handle,
                stderr_handle,
            } = running;

            // Drop write channel so the writer task closes the child's stdin
            drop(write_tx);

            let graceful = tokio::time::timeout(self.shutdown_grace, child.wait()).await;
            if graceful.is_err() {
                tracing::debug!("MCP server '{}' did not exit, killing it", self.command);
                let _ = child.kill().await;
            }

            reader_handle.abort();
            writer_handle.abort();
            if let Some(handle) = stderr_handle {
                handle.abort();
            }
            Ok(())
        })
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let write_tx = self.writer().ok_or(McpError::NotConnected)?;
            if !self.connected.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed {
                    reason: format!("MCP server '{}' is not running", self.command),
                });
            }
            let serialized = serde_json::to_string(&message)?;
            write_tx
                .send(serialized)
                .await
                .map_err(|_| McpError::ConnectionClosed {
                    reason: format!("MCP server '{}' stdin closed", self.command),
                })
        })
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.handlers.set_close(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
