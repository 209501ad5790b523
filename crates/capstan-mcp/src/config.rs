//! `mcp.toml`: which MCP servers to connect and how to reach them.

use capstan_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_timeout() -> u64 {
    30000
}

/// Server entries keyed by server name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Read a TOML config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No MCP config at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Parse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// One `[servers.<name>]` entry.
///
/// Exactly one of `command` (spawn a stdio child) or `url` (Streamable HTTP)
/// must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable spawned as a stdio server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command-line arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Base URL of a remote server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Timeout for the handshake and each request in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

/// Where a configured server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget<'a> {
    Stdio {
        command: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
    },
    Remote {
        url: &'a str,
    },
}

impl McpServerConfig {
    /// A stdio server entry.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            timeout_ms: default_timeout(),
        }
    }

    /// A remote server entry.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            timeout_ms: default_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the entry to a concrete target, rejecting ambiguous entries.
    pub fn target(&self, name: &str) -> Result<ServerTarget<'_>, ConfigError> {
        match (&self.command, &self.url) {
            (Some(command), None) => Ok(ServerTarget::Stdio {
                command,
                args: &self.args,
                env: &self.env,
            }),
            (None, Some(url)) => Ok(ServerTarget::Remote { url }),
            (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
                key: format!("servers.{name}"),
                message: "set either 'command' or 'url', not both".into(),
            }),
            (None, None) => Err(ConfigError::MissingKey {
                key: format!("servers.{name}.command or servers.{name}.url"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_entry_with_defaults() {
        let config: McpConfig = toml::from_str(
            r#"
[servers.notes]
command = "notes-server"
args = ["--root", "/srv/notes", "--read-only"]
env = { NOTES_TOKEN = "secret" }
"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 1);
        let notes = &config.servers["notes"];
        assert_eq!(notes.args, ["--root", "/srv/notes", "--read-only"]);
        assert_eq!(notes.env.get("NOTES_TOKEN").map(String::as_str), Some("secret"));
        assert_eq!(notes.timeout(), Duration::from_millis(30_000));
        assert!(matches!(
            notes.target("notes").unwrap(),
            ServerTarget::Stdio { command: "notes-server", .. }
        ));
    }

    #[test]
    fn remote_entry_with_timeout() {
        let config: McpConfig = toml::from_str(
            "[servers.search]\nurl = \"https://search.example.com\"\ntimeout_ms = 5000\n",
        )
        .unwrap();
        let search = &config.servers["search"];
        assert_eq!(search.timeout(), Duration::from_secs(5));
        assert_eq!(
            search.target("search").unwrap(),
            ServerTarget::Remote {
                url: "https://search.example.com"
            }
        );
    }

    #[test]
    fn ambiguous_and_empty_entries_rejected() {
        let mut both = McpServerConfig::stdio("cat", vec![]);
        both.url = Some("http://localhost".into());
        assert!(matches!(
            both.target("x"),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut neither = McpServerConfig::remote("http://localhost");
        neither.url = None;
        assert!(matches!(
            neither.target("x"),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = McpConfig::load(&dir.path().join("mcp.toml")).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.toml");
        std::fs::write(&path, "[servers.bad\ncommand = ").unwrap();
        match McpConfig::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert!(p.ends_with("mcp.toml")),
            other => panic!("Expected parse error, got: {other:?}"),
        }
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.toml");
        std::fs::write(&path, "[servers.a]\ncommand = \"cat\"\n").unwrap();
        let config = McpConfig::load(&path).unwrap();
        assert_eq!(config.servers["a"].command.as_deref(), Some("cat"));
    }
}
