//! Symbol resolution — turning a bare name into a file position.
//!
//! Used when a query identifies its target as `{symbol}` instead of
//! file+line+col. A single server is asked via `workspace/symbol`; with no
//! server to pin it to, every configured server is tried in order and the
//! first match wins.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;
use crate::protocol::{Location, WorkspaceSymbol};
use crate::server::ServerConnection;
use crate::types::{LspConfig, LspError, sorted_server_names};

/// Pick the best `workspace/symbol` hit for `name`.
///
/// Exact name match preferred; otherwise the first result — servers sort by
/// relevance, so "first" is a reasonable tie-break, not an arbitrary one.
fn pick_symbol<'a>(symbols: &'a [WorkspaceSymbol], name: &str) -> Option<&'a WorkspaceSymbol> {
    symbols
        .iter()
        .find(|s| s.name == name)
        .or_else(|| symbols.first())
}

/// Resolve `symbol` to a location via one server's `workspace/symbol`.
///
/// `Ok(None)` means the server answered but had no match.
pub async fn resolve_symbol(
    connection: &ServerConnection,
    symbol: &str,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Location>, LspError> {
    let symbols = connection.workspace_symbols(symbol, cancel).await?;
    Ok(pick_symbol(&symbols, symbol).map(|s| s.location.clone()))
}

/// Resolve `symbol` by fanning out across every configured server in
/// deterministic order, starting each as needed.
///
/// A server that fails to start or errors on the query is skipped, not fatal.
/// Returns the matching connection alongside the location so the caller can
/// run its follow-up query against the same server.
pub async fn resolve_across_servers(
    pool: &ConnectionPool,
    config: &LspConfig,
    symbol: &str,
    project_root: &Path,
    cancel: Option<&CancellationToken>,
) -> Option<(Arc<ServerConnection>, Location)> {
    for name in sorted_server_names(config) {
        let connection = match pool.client(name, &config.servers[name], project_root).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("skipping server '{name}' during symbol resolution: {e}");
                continue;
            }
        };
        match resolve_symbol(&connection, symbol, cancel).await {
            Ok(Some(location)) => return Some((connection, location)),
            Ok(None) => {
                tracing::debug!("server '{name}' has no match for symbol '{symbol}'");
            }
            Err(e) => {
                tracing::warn!("symbol query failed on server '{name}': {e}");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn symbol(name: &str, path: &str, line: u32) -> WorkspaceSymbol {
        WorkspaceSymbol {
            name: name.to_string(),
            kind: 12,
            container: None,
            location: Location {
                path: PathBuf::from(path),
                line,
                col: 0,
            },
        }
    }

    #[test]
    fn test_pick_symbol_prefers_exact_match() {
        let symbols = vec![
            symbol("foobar", "/a.rs", 1),
            symbol("foo", "/b.rs", 2),
            symbol("foo_baz", "/c.rs", 3),
        ];
        let picked = pick_symbol(&symbols, "foo").unwrap();
        assert_eq!(picked.location.path, PathBuf::from("/b.rs"));
    }

    #[test]
    fn test_pick_symbol_falls_back_to_first() {
        let symbols = vec![symbol("foobar", "/a.rs", 1), symbol("foobaz", "/c.rs", 3)];
        let picked = pick_symbol(&symbols, "foo").unwrap();
        assert_eq!(picked.location.path, PathBuf::from("/a.rs"));
    }

    #[test]
    fn test_pick_symbol_empty() {
        assert!(pick_symbol(&[], "foo").is_none());
    }

    mod fan_out {
        use super::*;
        use crate::types::ServerConfig;

        /// Fake server answering initialize (id 1) and then one query (id 2)
        /// with a canned workspace/symbol result. Request ids are
        /// deterministic per connection, so canned responses line up.
        fn scripted_server(extension: &str, symbol_result: &str) -> ServerConfig {
            let init = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#;
            let query = format!(r#"{{"jsonrpc":"2.0","id":2,"result":{symbol_result}}}"#);
            let script = format!(
                "sleep 0.1; printf 'Content-Length: {}\\r\\n\\r\\n{}'; \
                 sleep 0.5; printf 'Content-Length: {}\\r\\n\\r\\n{}'; sleep 30",
                init.len(),
                init,
                query.len(),
                query
            );
            ServerConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script],
                file_extensions: vec![extension.to_string()],
                initialization_options: None,
                language_id: extension.to_string(),
            }
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_first_matching_server_wins_and_failures_are_skipped() {
            let match_json = r#"[{"name":"foo","kind":12,"location":{"uri":"file:///src/lib.rs","range":{"start":{"line":9,"character":4}}}}]"#;
            let config = LspConfig {
                servers: [
                    // "a" sorts first and never starts; resolution must move on.
                    (
                        "a".to_string(),
                        ServerConfig {
                            command: vec!["definitely-not-a-real-language-server".to_string()],
                            file_extensions: vec!["py".to_string()],
                            initialization_options: None,
                            language_id: "python".to_string(),
                        },
                    ),
                    // "b" answers with no match.
                    ("b".to_string(), scripted_server("go", "[]")),
                    // "c" has the symbol.
                    ("c".to_string(), scripted_server("rs", match_json)),
                ]
                .into_iter()
                .collect(),
            };

            let pool = ConnectionPool::new();
            let root = std::env::temp_dir();
            let (connection, location) =
                resolve_across_servers(&pool, &config, "foo", &root, None)
                    .await
                    .expect("server 'c' should resolve the symbol");

            assert_eq!(connection.name(), "c");
            assert_eq!(location.path, PathBuf::from("/src/lib.rs"));
            assert_eq!(location.line, 9);
            assert_eq!(location.col, 4);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_no_server_resolves() {
            let config = LspConfig {
                servers: [("only".to_string(), scripted_server("rs", "[]"))]
                    .into_iter()
                    .collect(),
            };
            let pool = ConnectionPool::new();
            let root = std::env::temp_dir();
            assert!(
                resolve_across_servers(&pool, &config, "nope", &root, None)
                    .await
                    .is_none()
            );
        }
    }
}
