//! Public types at the subsystem boundary.
//!
//! The caller hands us an [`LspConfig`] it loaded elsewhere; this crate never
//! reads config files. [`server_for_file`] is the extension → server routing
//! used by the pool, and [`LspError`] is the typed failure surface for
//! individual requests.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Configuration for the LSP client subsystem, keyed by server name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    /// Per-language server configurations, keyed by name (e.g. "rust").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Configuration for a single language server.
///
/// Treated as an immutable value; the pool never mutates it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Command array: executable followed by its arguments
    /// (e.g. `["rust-analyzer"]`, `["typescript-language-server", "--stdio"]`).
    pub command: Vec<String>,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Passed verbatim as `initializationOptions` in the `initialize` request.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
    /// LSP language identifier (e.g. "rust", "typescript").
    pub language_id: String,
}

impl ServerConfig {
    /// The executable, i.e. the first element of the command array.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Arguments following the executable.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

/// Server names in deterministic (sorted) order.
///
/// `HashMap` iteration order is arbitrary; everything that walks the config
/// (routing, cross-server resolution) goes through this so overlapping
/// extensions and fan-out order are stable across runs.
#[must_use]
pub fn sorted_server_names(config: &LspConfig) -> Vec<&str> {
    let mut names: Vec<&str> = config.servers.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

/// Map a file to the `(name, config)` of the server covering its extension.
///
/// Returns `None` when no configured server claims the extension. On overlap
/// the alphabetically-first server name wins.
#[must_use]
pub fn server_for_file<'a>(
    config: &'a LspConfig,
    path: &Path,
) -> Option<(&'a str, &'a ServerConfig)> {
    let ext = path.extension()?.to_str()?;
    for name in sorted_server_names(config) {
        let server = &config.servers[name];
        if server.file_extensions.iter().any(|e| e == ext) {
            return Some((name, server));
        }
    }
    None
}

/// Identity of the config source, used only to detect mid-session edits.
///
/// The pool remembers the stamp it first served under; a later query carrying
/// a different stamp gets a non-fatal "reload required" warning. Connections
/// are never restarted automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStamp {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

impl ConfigStamp {
    /// Stamp a config file by path and mtime. Missing files stamp with
    /// `modified: None`, which still compares usefully.
    #[must_use]
    pub fn of(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            modified: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        }
    }
}

/// Failure surface for a single request on a connection.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("request '{method}' timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("request '{method}' was cancelled")]
    Cancelled { method: String },

    #[error("language server connection closed")]
    ConnectionClosed,

    #[error("cannot convert path to file URI: {}", path.display())]
    InvalidPath { path: std::path::PathBuf },

    #[error("language server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LspConfig {
        serde_json::from_value(serde_json::json!({
            "servers": {
                "rust": {
                    "command": ["rust-analyzer"],
                    "language_id": "rust",
                    "file_extensions": ["rs"]
                },
                "python": {
                    "command": ["pyright-langserver", "--stdio"],
                    "language_id": "python",
                    "file_extensions": ["py", "pyi"],
                    "initialization_options": { "python": { "venv": ".venv" } }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_config_deserialization() {
        let config = test_config();
        assert_eq!(config.servers.len(), 2);
        let python = &config.servers["python"];
        assert_eq!(python.program(), Some("pyright-langserver"));
        assert_eq!(python.args(), ["--stdio"]);
        assert!(python.initialization_options.is_some());
        assert!(config.servers["rust"].initialization_options.is_none());
    }

    #[test]
    fn test_empty_config_deserializes() {
        let config: LspConfig = serde_json::from_str("{}").unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_server_for_file_routes_by_extension() {
        let config = test_config();
        let (name, server) = server_for_file(&config, Path::new("/p/src/main.rs")).unwrap();
        assert_eq!(name, "rust");
        assert_eq!(server.language_id, "rust");

        let (name, _) = server_for_file(&config, Path::new("a/b.pyi")).unwrap();
        assert_eq!(name, "python");
    }

    #[test]
    fn test_server_for_file_unknown_extension() {
        let config = test_config();
        assert!(server_for_file(&config, Path::new("main.js")).is_none());
        assert!(server_for_file(&config, Path::new("Makefile")).is_none());
    }

    #[test]
    fn test_server_for_file_overlap_is_deterministic() {
        let config: LspConfig = serde_json::from_value(serde_json::json!({
            "servers": {
                "b": { "command": ["b-ls"], "language_id": "b", "file_extensions": ["rs"] },
                "a": { "command": ["a-ls"], "language_id": "a", "file_extensions": ["rs"] }
            }
        }))
        .unwrap();
        let (name, _) = server_for_file(&config, Path::new("x.rs")).unwrap();
        assert_eq!(name, "a");
    }

    #[test]
    fn test_sorted_server_names() {
        let config = test_config();
        assert_eq!(sorted_server_names(&config), ["python", "rust"]);
    }

    #[test]
    fn test_config_stamp_missing_file() {
        let stamp = ConfigStamp::of(Path::new("/definitely/not/here.json"));
        assert!(stamp.modified.is_none());
        assert_eq!(stamp, ConfigStamp::of(Path::new("/definitely/not/here.json")));
    }

    #[test]
    fn test_error_messages() {
        let e = LspError::Timeout {
            method: "textDocument/hover".to_string(),
            secs: 30,
        };
        assert_eq!(e.to_string(), "request 'textDocument/hover' timed out after 30s");

        let e = LspError::Rpc {
            code: -32601,
            message: "method not found".to_string(),
        };
        assert!(e.to_string().contains("-32601"));
    }
}
