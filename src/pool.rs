//! Connection pool — one lazily-started [`ServerConnection`] per server name.
//!
//! Concurrent callers racing to start the same server collapse onto one
//! in-flight start via a shared future; the `starting` entry is removed once
//! the start settles, success or failure. Dead connections are evicted on
//! next access so a later query re-spawns fresh.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

use crate::server::ServerConnection;
use crate::types::{ConfigStamp, LspConfig, ServerConfig, server_for_file};

/// Start failure, cloneable so every de-duplicated waiter sees it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to start language server '{name}': {message}")]
pub struct StartError {
    name: String,
    message: String,
}

/// Failure to obtain a connection for a file.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No configured server covers the file's extension. The query layer
    /// turns this into grep/read guidance, not an error message.
    #[error("no language server configured for {}", path.display())]
    NotConfigured { path: PathBuf },

    #[error(transparent)]
    Start(#[from] StartError),
}

type SharedStart = Shared<BoxFuture<'static, Result<Arc<ServerConnection>, StartError>>>;

#[derive(Default)]
struct PoolState {
    running: HashMap<String, Arc<ServerConnection>>,
    starting: HashMap<String, SharedStart>,
    /// Stamp of the config source the running servers were started under.
    stamp: Option<ConfigStamp>,
    /// Set once [`ConnectionPool::shutdown`] runs; no connection may be
    /// started or cached afterwards.
    shut_down: bool,
}

/// Maps server name → running connection; the subsystem's only mutable state.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Get the running connection for `name`, starting one if needed.
    ///
    /// Check-then-insert happens under one lock so two concurrent callers for
    /// an unstarted server spawn exactly one process and share the result.
    pub async fn client(
        &self,
        name: &str,
        config: &ServerConfig,
        project_root: &Path,
    ) -> Result<Arc<ServerConnection>, StartError> {
        let start = {
            let mut state = self.state.lock().await;

            if state.shut_down {
                return Err(StartError {
                    name: name.to_string(),
                    message: String::from("connection pool is shut down"),
                });
            }

            if let Some(conn) = state.running.get(name) {
                if conn.is_running() {
                    return Ok(conn.clone());
                }
                // Process died since last use; evict so we re-spawn below.
                tracing::info!("evicting dead LSP connection '{name}'");
                state.running.remove(name);
            }

            if let Some(in_flight) = state.starting.get(name) {
                in_flight.clone()
            } else {
                let start_name = name.to_string();
                let start_config = config.clone();
                let root = project_root.to_path_buf();
                let start: SharedStart = async move {
                    tracing::info!(
                        "starting LSP server '{start_name}' ({})...",
                        start_config.program().unwrap_or("<empty command>")
                    );
                    ServerConnection::start(&start_name, &start_config, &root)
                        .await
                        .map(Arc::new)
                        .map_err(|e| StartError {
                            name: start_name.clone(),
                            message: format!("{e:#}"),
                        })
                }
                .boxed()
                .shared();
                state.starting.insert(name.to_string(), start.clone());
                start
            }
        };

        let result = start.await;

        // Settle the maps whatever the outcome: failures must not linger in
        // `starting` or the server could never be retried.
        let mut state = self.state.lock().await;
        state.starting.remove(name);
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("{e}");
                return Err(e);
            }
        };
        if state.shut_down {
            // Shutdown ran while this start was in flight; the child must
            // not outlive the teardown it missed.
            drop(state);
            tracing::info!("pool shut down during start of '{name}'; stopping it");
            conn.shutdown().await;
            return Err(StartError {
                name: name.to_string(),
                message: String::from("connection pool is shut down"),
            });
        }
        state.running.insert(name.to_string(), conn.clone());
        Ok(conn)
    }

    /// Route a file to its server's connection via extension matching.
    pub async fn client_for_file(
        &self,
        config: &LspConfig,
        path: &Path,
        project_root: &Path,
    ) -> Result<Arc<ServerConnection>, RouteError> {
        let Some((name, server_config)) = server_for_file(config, path) else {
            return Err(RouteError::NotConfigured {
                path: path.to_path_buf(),
            });
        };
        Ok(self.client(name, server_config, project_root).await?)
    }

    /// Record the config stamp a query arrived with.
    ///
    /// Returns a warning when the config source changed while servers are
    /// running: they keep their old config, no automatic restarts.
    pub async fn check_stamp(&self, current: Option<&ConfigStamp>) -> Option<String> {
        let current = current?;
        let mut state = self.state.lock().await;
        if state.stamp.as_ref() == Some(current) {
            return None;
        }
        if state.stamp.is_none() || (state.running.is_empty() && state.starting.is_empty()) {
            // Nothing started under the old config; adopt the new one.
            state.stamp = Some(current.clone());
            return None;
        }
        Some(String::from(
            "Warning: LSP configuration changed since servers were started; \
             running servers still use the old configuration until restarted.",
        ))
    }

    /// Whether any connection is currently held (running or not yet evicted).
    pub async fn has_connections(&self) -> bool {
        !self.state.lock().await.running.is_empty()
    }

    /// Gracefully shut down every connection and clear the pool. Starts
    /// still in flight are refused the moment they settle; the pool accepts
    /// no new connections afterwards.
    pub async fn shutdown(&self) {
        let connections = {
            let mut state = self.state.lock().await;
            state.shut_down = true;
            state.starting.clear();
            std::mem::take(&mut state.running)
        };
        for (name, conn) in connections {
            tracing::info!("shutting down LSP server '{name}'...");
            conn.shutdown().await;
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
