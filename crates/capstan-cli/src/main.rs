mod demo;

use anyhow::{Context, Result};
use capstan_mcp::{McpConfig, McpManager};
use capstan_tools::ToolRegistry;
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "capstan", version, about = "Connect to MCP servers and call their tools")]
struct Cli {
    /// MCP server config file (default: ~/.capstan/mcp.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every configured server and show the connection table
    Servers,
    /// List the bridged tools of every configured server
    Tools,
    /// Call one bridged tool, e.g. `mcp__fs__read_file`
    Call {
        tool: String,
        /// JSON object with the tool's arguments
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Serve the built-in demo server over stdio
    ServeDemo {
        #[arg(long, default_value = "full")]
        mode: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stdout belongs to the protocol when serving
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    if let Command::ServeDemo { mode } = &cli.command {
        let server = demo::demo_server(mode).context("Failed to build the demo server")?;
        return server
            .serve_stdio()
            .await
            .context("Demo server stopped with an error");
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    if config.servers.is_empty() {
        eprintln!("No MCP servers configured in {}", config_path.display());
    }

    let manager = McpManager::new(Arc::new(ToolRegistry::new()));
    let connected = manager.connect_configured(&config).await;
    tracing::debug!("{connected} of {} MCP servers connected", config.servers.len());

    let result = run(&cli.command, &manager).await;
    manager.disconnect_all().await;
    result
}

async fn run(command: &Command, manager: &McpManager) -> Result<()> {
    match command {
        Command::Servers => {
            print_connections(manager);
            Ok(())
        }
        Command::Tools => {
            for def in manager.registry().definitions() {
                println!("{}\n  {}", def.name, def.description);
                for (param, spec) in &def.parameters {
                    let marker = if def.required.contains(param) { "*" } else { " " };
                    println!("  {marker} {param}: {}  {}", spec.param_type, spec.description);
                }
            }
            Ok(())
        }
        Command::Call { tool, input } => {
            let input: serde_json::Value =
                serde_json::from_str(input).context("--input is not valid JSON")?;
            let output = manager
                .registry()
                .execute(tool, input)
                .await
                .with_context(|| format!("Calling '{tool}' failed"))?;
            println!("{}", output.text);
            Ok(())
        }
        Command::ServeDemo { .. } => Ok(()),
    }
}

fn print_connections(manager: &McpManager) {
    let connections = manager.list_connections();
    if connections.is_empty() {
        println!("No MCP servers connected.");
        return;
    }
    println!(
        "{:<16} {:<13} {:<12} {:>5}  {:<11} CONNECTED",
        "NAME", "STATUS", "PROTOCOL", "TOOLS", "TRANSPORT"
    );
    for c in connections {
        println!(
            "{:<16} {:<13} {:<12} {:>5}  {:<11} {}",
            c.name,
            c.status.to_string(),
            c.protocol_version.as_deref().unwrap_or("-"),
            c.tool_count,
            c.transport,
            c.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// `$CAPSTAN_CONFIG_DIR/mcp.toml`, else `~/.capstan/mcp.toml`.
fn default_config_path() -> PathBuf {
    config_dir().join("mcp.toml")
}

fn load_config(path: &Path) -> Result<McpConfig> {
    McpConfig::load(path).with_context(|| format!("Failed to load MCP config {}", path.display()))
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CAPSTAN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".capstan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_input() {
        let cli = Cli::try_parse_from([
            "capstan",
            "call",
            "mcp__demo__echo",
            "--input",
            r#"{"text":"hi"}"#,
        ])
        .unwrap();
        match cli.command {
            Command::Call { tool, input } => {
                assert_eq!(tool, "mcp__demo__echo");
                assert_eq!(input, r#"{"text":"hi"}"#);
            }
            _ => panic!("Expected call"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["capstan", "servers", "--config", "/tmp/x.toml", "--verbose"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/x.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn serve_demo_mode_flag() {
        let cli = Cli::try_parse_from(["capstan", "serve-demo", "--mode=test"]).unwrap();
        assert!(matches!(cli.command, Command::ServeDemo { ref mode } if mode == "test"));
    }

    #[test]
    fn config_errors_keep_their_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.toml");
        std::fs::write(&path, "[servers.broken\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("mcp.toml"));
        let cause = err.downcast_ref::<capstan_types::ConfigError>().unwrap();
        assert!(matches!(cause, capstan_types::ConfigError::Parse { .. }));
        assert_eq!(err.chain().count(), 2);
    }

    #[test]
    fn default_config_path_ends_with_file_name() {
        assert!(default_config_path().ends_with("mcp.toml"));
    }
}
