//! Query surface — the action dispatch the outer tool layer calls.
//!
//! Every query comes in as an [`QueryRequest`] naming an action plus either a
//! file position (1-indexed at this boundary) or a bare symbol name, and goes
//! out as plain text. Missing configuration is a guidance string pointing the
//! caller at grep/read, never an error.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use crate::pool::{ConnectionPool, RouteError};
use crate::protocol::{Location, WorkspaceSymbol, symbol_kind_name};
use crate::resolve;
use crate::server::ServerConnection;
use crate::types::{ConfigStamp, LspConfig, sorted_server_names};

/// Cap on rendered workspace symbols.
const WORKSPACE_SYMBOL_LIMIT: usize = 50;

/// Source lines shown beneath a definition location.
const DEFINITION_CONTEXT_LINES: usize = 3;

/// Code-navigation actions exposed to the tool layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hover,
    Definition,
    References,
    Symbols,
    WorkspaceSymbols,
}

/// One query from the tool layer. `line`/`col` are 1-indexed here and
/// converted to 0-indexed before touching the wire.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub col: Option<u32>,
    pub symbol: Option<String>,
    pub query: Option<String>,
}

/// Entry point for the subsystem: owns the pool, takes the externally-loaded
/// config per query, returns plain text.
pub struct QueryEngine {
    pool: ConnectionPool,
    project_root: PathBuf,
}

fn grep_guidance(detail: &str) -> String {
    format!("{detail} Use grep/read to navigate the code instead.")
}

/// Convert a 1-indexed boundary position to the 0-indexed wire position.
fn to_zero_indexed(line: u32, col: u32) -> (u32, u32) {
    (line.saturating_sub(1), col.saturating_sub(1))
}

impl QueryEngine {
    #[must_use]
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            pool: ConnectionPool::new(),
            project_root,
        }
    }

    /// Run one query. `config` is whatever the external loader produced for
    /// this query cycle; `None` means no config exists at all.
    pub async fn run(
        &self,
        action: Action,
        request: &QueryRequest,
        config: Option<&LspConfig>,
        stamp: Option<&ConfigStamp>,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let Some(config) = config else {
            return Ok(grep_guidance("No LSP configuration found for this project."));
        };

        let warning = self.pool.check_stamp(stamp).await;
        let result = self.dispatch(action, request, config, cancel).await?;

        Ok(match warning {
            Some(warning) => format!("{warning}\n\n{result}"),
            None => result,
        })
    }

    /// Gracefully shut down all running servers.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn dispatch(
        &self,
        action: Action,
        request: &QueryRequest,
        config: &LspConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        if action == Action::WorkspaceSymbols {
            let query = request
                .query
                .as_deref()
                .or(request.symbol.as_deref())
                .context("workspace_symbols requires a 'query'")?;
            return self.workspace_symbols(config, request.file.as_deref(), query, cancel).await;
        }

        // Position-based target, or symbol resolved to one.
        let (connection, path, line, col) = match (&request.file, &request.symbol) {
            (Some(file), _) => {
                let connection = match self
                    .pool
                    .client_for_file(config, file, &self.project_root)
                    .await
                {
                    Ok(conn) => conn,
                    Err(RouteError::NotConfigured { path }) => {
                        return Ok(grep_guidance(&format!(
                            "No language server configured for '{}'.",
                            path.display()
                        )));
                    }
                    Err(RouteError::Start(e)) => return Err(e.into()),
                };
                let (line, col) = if action == Action::Symbols {
                    (0, 0) // documentSymbol has no position
                } else {
                    let line = request.line.context("missing 'line' for position query")?;
                    let col = request.col.context("missing 'col' for position query")?;
                    to_zero_indexed(line, col)
                };
                (connection, file.clone(), line, col)
            }
            (None, Some(symbol)) => {
                let Some((connection, location)) = resolve::resolve_across_servers(
                    &self.pool,
                    config,
                    symbol,
                    &self.project_root,
                    cancel,
                )
                .await
                else {
                    return Ok(grep_guidance(&format!(
                        "Symbol '{symbol}' was not found by any configured language server."
                    )));
                };
                (connection, location.path, location.line, location.col)
            }
            (None, None) => bail!("query needs either a 'file' or a 'symbol'"),
        };

        self.open_from_disk(&connection, &path).await?;

        match action {
            Action::Hover => {
                let text = connection.hover(&path, line, col, cancel).await?;
                Ok(text.unwrap_or_else(|| String::from("No hover information available.")))
            }
            Action::Definition => {
                let locations = connection.definition(&path, line, col, cancel).await?;
                if locations.is_empty() {
                    return Ok(String::from("No definition found."));
                }
                Ok(render_definitions(&locations).await)
            }
            Action::References => {
                let locations = connection.references(&path, line, col, cancel).await?;
                if locations.is_empty() {
                    return Ok(String::from("No references found."));
                }
                Ok(locations
                    .iter()
                    .map(Location::display)
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            Action::Symbols => {
                let result = connection.document_symbols(&path, cancel).await?;
                let rendered = render_document_symbols(&result);
                if rendered.is_empty() {
                    return Ok(String::from("No symbols found."));
                }
                Ok(rendered)
            }
            Action::WorkspaceSymbols => unreachable!("handled above"),
        }
    }

    /// `workspace/symbol`: one server when a file pins the language, else a
    /// fan-out over every configured server with results merged in order.
    async fn workspace_symbols(
        &self,
        config: &LspConfig,
        file: Option<&Path>,
        query: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let mut symbols = Vec::new();
        if let Some(file) = file {
            match self.pool.client_for_file(config, file, &self.project_root).await {
                Ok(connection) => {
                    symbols = connection.workspace_symbols(query, cancel).await?;
                }
                Err(RouteError::NotConfigured { path }) => {
                    return Ok(grep_guidance(&format!(
                        "No language server configured for '{}'.",
                        path.display()
                    )));
                }
                Err(RouteError::Start(e)) => return Err(e.into()),
            }
        } else {
            for name in sorted_server_names(config) {
                let connection = match self
                    .pool
                    .client(name, &config.servers[name], &self.project_root)
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("skipping server '{name}' for workspace symbols: {e}");
                        continue;
                    }
                };
                match connection.workspace_symbols(query, cancel).await {
                    Ok(mut found) => symbols.append(&mut found),
                    Err(e) => tracing::warn!("workspace symbol query failed on '{name}': {e}"),
                }
                if symbols.len() >= WORKSPACE_SYMBOL_LIMIT {
                    break;
                }
            }
        }

        if symbols.is_empty() {
            return Ok(grep_guidance(&format!("No workspace symbols match '{query}'.")));
        }
        Ok(render_workspace_symbols(&symbols))
    }

    /// Read the file and make sure the server has the current content open:
    /// a file edited since it was opened is closed and reopened.
    async fn open_from_disk(&self, connection: &ServerConnection, path: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        connection.sync_document(path, &text).await
    }
}

/// `path:line:col` per definition, each followed by a few source lines of
/// context when the target file is readable.
async fn render_definitions(locations: &[Location]) -> String {
    let mut out = String::new();
    for location in locations {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&location.display());
        if let Ok(text) = tokio::fs::read_to_string(&location.path).await {
            for line in text
                .lines()
                .skip(location.line as usize)
                .take(DEFINITION_CONTEXT_LINES)
            {
                let _ = write!(out, "\n{line}");
            }
        }
    }
    out
}

/// Render a `documentSymbol` result as an indented `Kind Name (line N)` tree.
///
/// Handles both shapes the server may answer with: hierarchical
/// `DocumentSymbol[]` (with `children`) and flat `SymbolInformation[]`
/// (with `location`).
fn render_document_symbols(result: &serde_json::Value) -> String {
    fn line_of(symbol: &serde_json::Value) -> u64 {
        let range = symbol
            .get("selectionRange")
            .or_else(|| symbol.get("range"))
            .or_else(|| symbol.get("location").and_then(|l| l.get("range")));
        range
            .and_then(|r| r.get("start"))
            .and_then(|s| s.get("line"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    fn walk(symbols: &[serde_json::Value], depth: usize, out: &mut String) {
        for symbol in symbols {
            let Some(name) = symbol.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let kind = symbol.get("kind").and_then(serde_json::Value::as_u64).unwrap_or(0);
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = write!(
                out,
                "{}{} {} (line {})",
                "  ".repeat(depth),
                symbol_kind_name(kind),
                name,
                line_of(symbol) + 1
            );
            if let Some(children) = symbol.get("children").and_then(|c| c.as_array()) {
                walk(children, depth + 1, out);
            }
        }
    }

    let mut out = String::new();
    if let Some(symbols) = result.as_array() {
        walk(symbols, 0, &mut out);
    }
    out
}

/// Flat workspace symbol listing, capped, with container annotations.
fn render_workspace_symbols(symbols: &[WorkspaceSymbol]) -> String {
    let total = symbols.len();
    let mut out = String::new();
    for symbol in symbols.iter().take(WORKSPACE_SYMBOL_LIMIT) {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = write!(
            out,
            "{} {} ({})",
            symbol_kind_name(symbol.kind),
            symbol.name,
            symbol.location.display()
        );
        if let Some(container) = &symbol.container {
            let _ = write!(out, " [{container}]");
        }
    }
    if total > WORKSPACE_SYMBOL_LIMIT {
        let _ = write!(out, "\n... and {} more", total - WORKSPACE_SYMBOL_LIMIT);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerConfig;
    use std::fmt::Write as _;
    use std::io::Write as _;

    #[test]
    fn test_to_zero_indexed() {
        assert_eq!(to_zero_indexed(10, 5), (9, 4));
        assert_eq!(to_zero_indexed(1, 1), (0, 0));
        // Already-zero input must not underflow.
        assert_eq!(to_zero_indexed(0, 0), (0, 0));
    }

    #[test]
    fn test_render_document_symbols_hierarchical() {
        let result = serde_json::json!([
            {
                "name": "Engine",
                "kind": 23,
                "selectionRange": { "start": { "line": 4, "character": 11 } },
                "children": [
                    {
                        "name": "run",
                        "kind": 6,
                        "selectionRange": { "start": { "line": 9, "character": 7 } },
                        "children": []
                    }
                ]
            },
            {
                "name": "main",
                "kind": 12,
                "range": { "start": { "line": 20, "character": 0 } }
            }
        ]);
        let rendered = render_document_symbols(&result);
        assert_eq!(
            rendered,
            "Struct Engine (line 5)\n  Method run (line 10)\nFunction main (line 21)"
        );
    }

    #[test]
    fn test_render_document_symbols_flat() {
        let result = serde_json::json!([{
            "name": "main",
            "kind": 12,
            "location": {
                "uri": "file:///src/main.rs",
                "range": { "start": { "line": 0, "character": 3 } }
            }
        }]);
        assert_eq!(render_document_symbols(&result), "Function main (line 1)");
    }

    #[test]
    fn test_render_document_symbols_null() {
        assert_eq!(render_document_symbols(&serde_json::Value::Null), "");
    }

    #[test]
    fn test_render_workspace_symbols_caps_at_fifty() {
        let symbols: Vec<WorkspaceSymbol> = (0..60)
            .map(|i| WorkspaceSymbol {
                name: format!("sym{i}"),
                kind: 12,
                container: Some("pkg".to_string()),
                location: Location {
                    path: PathBuf::from("/a.rs"),
                    line: i,
                    col: 0,
                },
            })
            .collect();
        let rendered = render_workspace_symbols(&symbols);
        assert_eq!(rendered.lines().count(), WORKSPACE_SYMBOL_LIMIT + 1);
        assert!(rendered.ends_with("... and 10 more"));
        assert!(rendered.starts_with("Function sym0 (/a.rs:1:1) [pkg]"));
    }

    #[tokio::test]
    async fn test_missing_config_returns_grep_guidance() {
        let engine = QueryEngine::new(std::env::temp_dir());
        let request = QueryRequest {
            file: Some(PathBuf::from("a.rs")),
            line: Some(1),
            col: Some(1),
            ..QueryRequest::default()
        };
        let result = engine
            .run(Action::Hover, &request, None, None, None)
            .await
            .unwrap();
        assert!(result.contains("grep"));
    }

    #[tokio::test]
    async fn test_unrouted_extension_returns_grep_guidance() {
        let engine = QueryEngine::new(std::env::temp_dir());
        let config = LspConfig {
            servers: [(
                "rust".to_string(),
                ServerConfig {
                    command: vec!["rust-analyzer".to_string()],
                    file_extensions: vec!["rs".to_string()],
                    initialization_options: None,
                    language_id: "rust".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        };
        let request = QueryRequest {
            file: Some(PathBuf::from("web/app.js")),
            line: Some(1),
            col: Some(1),
            ..QueryRequest::default()
        };
        let result = engine
            .run(Action::Definition, &request, Some(&config), None, None)
            .await
            .unwrap();
        assert!(result.contains("grep"));
        assert!(result.contains("app.js"));
    }

    #[tokio::test]
    async fn test_query_without_target_is_an_error() {
        let engine = QueryEngine::new(std::env::temp_dir());
        let config = LspConfig::default();
        let err = engine
            .run(Action::Hover, &QueryRequest::default(), Some(&config), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'file' or a 'symbol'"));
    }

    #[tokio::test]
    async fn test_unresolvable_symbol_returns_grep_guidance() {
        // Empty config: resolution has no servers to try.
        let engine = QueryEngine::new(std::env::temp_dir());
        let config = LspConfig::default();
        let request = QueryRequest {
            symbol: Some("missing_fn".to_string()),
            ..QueryRequest::default()
        };
        let result = engine
            .run(Action::Hover, &request, Some(&config), None, None)
            .await
            .unwrap();
        assert!(result.contains("missing_fn"));
        assert!(result.contains("grep"));
    }

    /// Scripted fake server: answers ids 1..=N in order with canned results,
    /// spaced out so each response lands after its request was sent.
    fn scripted_server(extension: &str, results: &[&str]) -> ServerConfig {
        scripted_server_inner(extension, results, None)
    }

    /// Like [`scripted_server`], but also tees everything the client sends
    /// into `capture` so tests can assert on the outgoing notifications.
    fn capturing_scripted_server(
        extension: &str,
        results: &[&str],
        capture: &Path,
    ) -> ServerConfig {
        scripted_server_inner(extension, results, Some(capture))
    }

    fn scripted_server_inner(
        extension: &str,
        results: &[&str],
        capture: Option<&Path>,
    ) -> ServerConfig {
        let mut script = String::new();
        if let Some(path) = capture {
            // POSIX sh gives backgrounded commands /dev/null as stdin, so
            // dup the real stdin to fd 3 for tee to read from.
            let _ = write!(script, "exec 3<&0; tee '{}' <&3 >/dev/null & ", path.display());
        }
        script.push_str("sleep 0.1; ");
        let mut frames = vec![r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#.to_string()];
        for (i, result) in results.iter().enumerate() {
            frames.push(format!(r#"{{"jsonrpc":"2.0","id":{},"result":{result}}}"#, i + 2));
        }
        for frame in frames {
            let _ = write!(
                script,
                "printf 'Content-Length: {}\\r\\n\\r\\n{}'; sleep 0.5; ",
                frame.len(),
                frame
            );
        }
        script.push_str("sleep 30");
        ServerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            file_extensions: vec![extension.to_string()],
            initialization_options: None,
            language_id: extension.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_definition_lookup_scenario() {
        // a.rs with a known definition site; the fake server points the
        // definition response at line 2 (0-indexed), col 3.
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rs");
        {
            let mut f = std::fs::File::create(&source).unwrap();
            writeln!(f, "mod demo;").unwrap();
            writeln!(f).unwrap();
            writeln!(f, "fn target() {{").unwrap();
            writeln!(f, "    42;").unwrap();
            writeln!(f, "}}").unwrap();
        }

        let uri = url::Url::from_file_path(&source).unwrap();
        let definition = format!(
            r#"[{{"uri":"{uri}","range":{{"start":{{"line":2,"character":3}},"end":{{"line":2,"character":9}}}}}}]"#
        );
        let config = LspConfig {
            servers: [("rust".to_string(), scripted_server("rs", &[&definition]))]
                .into_iter()
                .collect(),
        };

        let engine = QueryEngine::new(dir.path().to_path_buf());
        let request = QueryRequest {
            file: Some(source.clone()),
            line: Some(10),
            col: Some(5),
            ..QueryRequest::default()
        };
        let result = engine
            .run(Action::Definition, &request, Some(&config), None, None)
            .await
            .unwrap();

        // 1-indexed location line, then context lines from the file itself.
        assert!(result.starts_with(&format!("{}:3:4", source.display())), "got: {result}");
        assert!(result.contains("fn target() {"));
        assert!(result.contains("42;"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_edited_file_is_resynced_before_querying() {
        // Query, edit the file on disk, query again: the server must see a
        // didClose/didOpen pair carrying the new content, not the stale copy.
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rs");
        std::fs::write(&source, "fn one() {}\n").unwrap();
        let capture = dir.path().join("stdin.log");

        let hover = r#"{"contents":"fn one()"}"#;
        let config = LspConfig {
            servers: [(
                "rust".to_string(),
                capturing_scripted_server("rs", &[hover, hover], &capture),
            )]
            .into_iter()
            .collect(),
        };

        let engine = QueryEngine::new(dir.path().to_path_buf());
        let request = QueryRequest {
            file: Some(source.clone()),
            line: Some(1),
            col: Some(1),
            ..QueryRequest::default()
        };
        engine
            .run(Action::Hover, &request, Some(&config), None, None)
            .await
            .unwrap();

        std::fs::write(&source, "fn two() {}\n").unwrap();
        engine
            .run(Action::Hover, &request, Some(&config), None, None)
            .await
            .unwrap();

        // The capture trails the queries slightly; poll until the close
        // shows up.
        let mut sent = String::new();
        for _ in 0..100 {
            sent = std::fs::read_to_string(&capture).unwrap_or_default();
            if sent.contains("textDocument/didClose") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(
            sent.contains("textDocument/didClose"),
            "edited file must be closed and reopened, sent: {sent}"
        );
        assert!(
            sent.contains("fn two()"),
            "server must receive the edited content"
        );
        assert_eq!(
            sent.matches("textDocument/didOpen").count(),
            2,
            "exactly one reopen, no didOpen for the unchanged first query"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_symbol_hover_falls_through_failed_server() {
        // Server "a" can't start; server "b" resolves the symbol and answers
        // the follow-up hover. The failure must not abort resolution.
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("lib.rs");
        std::fs::write(&source, "pub fn foo() {}\n").unwrap();

        let uri = url::Url::from_file_path(&source).unwrap();
        let symbols = format!(
            r#"[{{"name":"foo","kind":12,"location":{{"uri":"{uri}","range":{{"start":{{"line":0,"character":7}}}}}}}}]"#
        );
        let hover = r#"{"contents":{"kind":"markdown","value":"pub fn foo()"}}"#;

        let config = LspConfig {
            servers: [
                (
                    "a".to_string(),
                    ServerConfig {
                        command: vec!["definitely-not-a-real-language-server".to_string()],
                        file_extensions: vec!["py".to_string()],
                        initialization_options: None,
                        language_id: "python".to_string(),
                    },
                ),
                ("b".to_string(), scripted_server("rs", &[&symbols, hover])),
            ]
            .into_iter()
            .collect(),
        };

        let engine = QueryEngine::new(dir.path().to_path_buf());
        let request = QueryRequest {
            symbol: Some("foo".to_string()),
            ..QueryRequest::default()
        };
        let result = engine
            .run(Action::Hover, &request, Some(&config), None, None)
            .await
            .unwrap();
        assert_eq!(result, "pub fn foo()");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_stamp_warning_prepended() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rs");
        std::fs::write(&source, "fn main() {}\n").unwrap();

        let hover = r#"{"contents":"fn main()"}"#;
        let config = LspConfig {
            servers: [("rust".to_string(), scripted_server("rs", &[hover, hover]))]
                .into_iter()
                .collect(),
        };
        let engine = QueryEngine::new(dir.path().to_path_buf());
        let request = QueryRequest {
            file: Some(source),
            line: Some(1),
            col: Some(1),
            ..QueryRequest::default()
        };

        let stamp_a = ConfigStamp {
            path: PathBuf::from("/cfg/lsp.json"),
            modified: Some(std::time::SystemTime::UNIX_EPOCH),
        };
        let first = engine
            .run(Action::Hover, &request, Some(&config), Some(&stamp_a), None)
            .await
            .unwrap();
        assert_eq!(first, "fn main()");

        let stamp_b = ConfigStamp {
            path: PathBuf::from("/cfg/lsp.json"),
            modified: Some(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(9)),
        };
        let second = engine
            .run(Action::Hover, &request, Some(&config), Some(&stamp_b), None)
            .await
            .unwrap();
        assert!(second.starts_with("Warning:"), "got: {second}");
        assert!(second.ends_with("fn main()"));
    }
}
