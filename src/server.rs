//! Server connection — owns a child process and manages the LSP lifecycle.
//!
//! One [`ServerConnection`] per spawned language server: writer task feeding
//! stdin, reader task decoding stdout, stderr drained to logs, and a
//! correlation map matching responses back to in-flight requests by id.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{self, Location, Notification, Request, WorkspaceSymbol};
use crate::types::{LspError, ServerConfig};

/// Per-request timeout. Language servers that take longer than this have
/// effectively stopped answering.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// How long to wait for natural exit after `shutdown`/`exit` before killing.
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification { method }),
        _ => None,
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

/// Request/response correlation over one connection's writer channel.
///
/// Ids are allocated from a monotonic counter and never reused. Every losing
/// settlement path (timeout, cancellation, exit) removes the pending entry
/// before reporting the error, so exactly one path fires per id and a stray
/// late response finds nothing to resolve.
#[derive(Debug)]
pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    alive: Arc<AtomicBool>,
}

impl Correlator {
    fn new(pending: PendingMap, writer_tx: mpsc::Sender<WriterCommand>, alive: Arc<AtomicBool>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending,
            writer_tx,
            alive,
        }
    }

    /// Send a request and wait for its response, the timeout, cancellation,
    /// or connection exit — whichever settles first.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, LspError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        // An already-fired token fails before anything hits the wire.
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(LspError::Cancelled {
                method: method.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request).map_err(|e| {
            tracing::error!("unserializable request '{method}': {e}");
            LspError::ConnectionClosed
        })?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(LspError::ConnectionClosed);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let body = tokio::select! {
            received = rx => match received {
                Ok(body) => body,
                Err(_) => {
                    // Sender dropped: reader task drained the map on exit.
                    self.pending.lock().await.remove(&id);
                    return Err(LspError::ConnectionClosed);
                }
            },
            () = tokio::time::sleep(Duration::from_secs(REQUEST_TIMEOUT_SECS)) => {
                self.pending.lock().await.remove(&id);
                return Err(LspError::Timeout {
                    method: method.to_string(),
                    secs: REQUEST_TIMEOUT_SECS,
                });
            }
            () = cancelled => {
                self.pending.lock().await.remove(&id);
                return Err(LspError::Cancelled { method: method.to_string() });
            }
        };

        if let Some(error) = body.get("error") {
            return Err(LspError::Rpc {
                code: error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification).map_err(|_| LspError::ConnectionClosed)?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::ConnectionClosed)
    }
}

/// Open-document bookkeeping for one connection.
///
/// A URI is open at most once; versions only grow, including across a
/// close/reopen refresh cycle. Each open URI remembers the hash of the
/// content the server received so on-disk edits are detectable.
#[derive(Default)]
#[derive(Debug)]
struct DocumentSync {
    open: HashMap<String, u64>,
    versions: HashMap<String, i32>,
}

impl DocumentSync {
    /// Track an open, recording the content hash. `None` when the URI is
    /// already open, otherwise the version number to send with `didOpen`.
    fn begin_open(&mut self, uri: &str, hash: u64) -> Option<i32> {
        if self.open.contains_key(uri) {
            return None;
        }
        let version = self.versions.get(uri).copied().unwrap_or(0) + 1;
        self.versions.insert(uri.to_string(), version);
        self.open.insert(uri.to_string(), hash);
        Some(version)
    }

    /// Untrack an open URI. False when it was never open, in which case no
    /// `didClose` should be sent.
    fn begin_close(&mut self, uri: &str) -> bool {
        self.open.remove(uri).is_some()
    }

    /// Whether `uri` is open with content differing from `hash`.
    fn is_stale(&self, uri: &str, hash: u64) -> bool {
        self.open.get(uri).is_some_and(|open_hash| *open_hash != hash)
    }
}

fn content_hash(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// A connected, initialized language server.
#[derive(Debug)]
pub struct ServerConnection {
    name: String,
    language_id: String,
    child: Mutex<Child>,
    correlator: Correlator,
    documents: Mutex<DocumentSync>,
    alive: Arc<AtomicBool>,
    capabilities: std::sync::OnceLock<serde_json::Value>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl ServerConnection {
    /// Spawn the configured command and run the `initialize` handshake.
    ///
    /// Fails (and the value is dropped, killing the child) if the executable
    /// is missing, the process dies early, or `initialize` errors out.
    pub async fn start(name: &str, config: &ServerConfig, project_root: &Path) -> Result<Self> {
        let program = config
            .program()
            .with_context(|| format!("server '{name}' has an empty command array"))?;
        let resolved = which::which(program).with_context(|| format!("{program} not found in PATH"))?;

        let mut child = Command::new(&resolved)
            .args(config.args())
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {program}"))?;

        let stdin = child.stdin.take().context("no stdin from child")?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stderr = child.stderr.take().context("no stderr from child")?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        // Language servers are chatty on stderr; drain it to logs, never
        // treat it as fatal.
        let stderr_name = name.to_string();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("LSP '{stderr_name}' stderr: {line}");
            }
        });

        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_name = name.to_string();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(&frame, &reader_pending, &reader_writer_tx, &reader_name)
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!("LSP server '{reader_name}' closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("LSP reader error for '{reader_name}': {e}");
                        break;
                    }
                }
            }
            // Exit path: reject everything in flight now rather than letting
            // callers ride out their timeouts, then mark the connection dead
            // so the pool evicts it.
            reader_alive.store(false, Ordering::Release);
            reader_pending.lock().await.clear();
        });

        let connection = Self {
            name: name.to_string(),
            language_id: config.language_id.clone(),
            child: Mutex::new(child),
            correlator: Correlator::new(pending, writer_tx, alive.clone()),
            documents: Mutex::new(DocumentSync::default()),
            alive,
            capabilities: std::sync::OnceLock::new(),
            reader_handle,
            writer_handle,
            stderr_handle,
        };

        connection.initialize(config, project_root).await?;

        Ok(connection)
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        server_name: &str,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame from '{server_name}'");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                } else {
                    tracing::trace!("Late response for id {id} from '{server_name}', ignoring");
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                // A server request left unanswered risks a hung server, so
                // everything gets *some* reply.
                let response = if method == "workspace/configuration" {
                    // Answer with one null per requested item: "we have no
                    // settings for you".
                    let item_count = params
                        .as_ref()
                        .and_then(|p| p.get("items"))
                        .and_then(|i| i.as_array())
                        .map_or(0, Vec::len);
                    let nulls = vec![serde_json::Value::Null; item_count];
                    protocol::response_frame(&id, serde_json::Value::Array(nulls))
                } else {
                    tracing::debug!(
                        "LSP '{server_name}' sent request: {method} — replying method not found"
                    );
                    protocol::error_response_frame(&id, -32601, &format!("Method not found: {method}"))
                };
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method } => {
                tracing::trace!("Ignoring notification from '{server_name}': {method}");
            }
        }
    }

    async fn initialize(&self, config: &ServerConfig, project_root: &Path) -> Result<()> {
        let root_uri =
            protocol::path_to_file_uri(project_root).context("converting project root to URI")?;

        let params =
            protocol::initialize_params(root_uri.as_str(), config.initialization_options.as_ref());
        let result = self
            .correlator
            .request("initialize", Some(params), None)
            .await
            .with_context(|| format!("LSP initialize failed for '{}'", self.name))?;

        if let Some(capabilities) = result.get("capabilities") {
            let _ = self.capabilities.set(capabilities.clone());
        }

        self.correlator
            .notify("initialized", Some(serde_json::json!({})))
            .await?;

        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities the server reported during `initialize`.
    #[must_use]
    pub fn capabilities(&self) -> Option<&serde_json::Value> {
        self.capabilities.get()
    }

    /// Whether the underlying process is still serving requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Open a document if it isn't already, sending `didOpen` with full text.
    ///
    /// No-op for an already-open URI: one `didOpen` per open cycle.
    pub async fn ensure_open(&self, path: &Path, text: &str) -> Result<()> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let hash = content_hash(text);
        let Some(version) = self.documents.lock().await.begin_open(&uri, hash) else {
            return Ok(());
        };

        let params = protocol::did_open_params(&uri, &self.language_id, version, text);
        self.correlator
            .notify("textDocument/didOpen", Some(params))
            .await?;
        Ok(())
    }

    /// Close and reopen a document with fresh content after external edits.
    ///
    /// No-op for a URI that was never opened. The close/reopen pair trades
    /// efficiency for correctness: the server re-reads the whole document.
    pub async fn refresh_document(&self, path: &Path, text: &str) -> Result<()> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        if !self.documents.lock().await.begin_close(&uri) {
            return Ok(());
        }
        self.correlator
            .notify("textDocument/didClose", Some(protocol::did_close_params(&uri)))
            .await?;
        self.ensure_open(path, text).await
    }

    /// Bring the server's copy of a document in line with `text`: open it on
    /// first use, refresh it when the open copy has different content, no-op
    /// when nothing changed.
    pub async fn sync_document(&self, path: &Path, text: &str) -> Result<()> {
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let stale = self
            .documents
            .lock()
            .await
            .is_stale(&uri, content_hash(text));
        if stale {
            self.refresh_document(path, text).await
        } else {
            self.ensure_open(path, text).await
        }
    }

    /// Hover text at a 0-indexed position, flattened to plain text.
    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        col: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>, LspError> {
        let uri = self.uri_for(path)?;
        let result = self
            .correlator
            .request(
                "textDocument/hover",
                Some(protocol::position_params(&uri, line, col)),
                cancel,
            )
            .await?;
        let text = result
            .get("contents")
            .map(protocol::hover_contents_to_text)
            .filter(|t| !t.is_empty());
        Ok(text)
    }

    /// Definition locations for a 0-indexed position.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        col: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Location>, LspError> {
        let uri = self.uri_for(path)?;
        let result = self
            .correlator
            .request(
                "textDocument/definition",
                Some(protocol::position_params(&uri, line, col)),
                cancel,
            )
            .await?;
        Ok(protocol::parse_locations(&result))
    }

    /// Reference locations for a 0-indexed position, declaration included.
    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        col: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Location>, LspError> {
        let uri = self.uri_for(path)?;
        let result = self
            .correlator
            .request(
                "textDocument/references",
                Some(protocol::references_params(&uri, line, col, true)),
                cancel,
            )
            .await?;
        Ok(protocol::parse_locations(&result))
    }

    /// Raw `textDocument/documentSymbol` result (hierarchical or flat).
    pub async fn document_symbols(
        &self,
        path: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, LspError> {
        let uri = self.uri_for(path)?;
        self.correlator
            .request(
                "textDocument/documentSymbol",
                Some(protocol::document_symbol_params(&uri)),
                cancel,
            )
            .await
    }

    /// `workspace/symbol` search across the server's project.
    pub async fn workspace_symbols(
        &self,
        query: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<WorkspaceSymbol>, LspError> {
        let result = self
            .correlator
            .request(
                "workspace/symbol",
                Some(protocol::workspace_symbol_params(query)),
                cancel,
            )
            .await?;
        Ok(protocol::parse_workspace_symbols(&result))
    }

    /// Simulate unexpected process death without paying real shutdown latency.
    #[cfg(test)]
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn uri_for(&self, path: &Path) -> Result<String, LspError> {
        protocol::path_to_file_uri(path)
            .map(|u| u.to_string())
            .map_err(|_| LspError::InvalidPath {
                path: path.to_path_buf(),
            })
    }

    /// Gracefully shut down: `shutdown` request, `exit` notification, then up
    /// to 2s of patience before the kill. Best-effort at every step — a dead
    /// or unresponsive process just falls through to the kill.
    pub async fn shutdown(&self) {
        let graceful = async {
            if self.correlator.request("shutdown", None, None).await.is_ok() {
                let _ = self.correlator.notify("exit", None).await;
            }
        };
        // The 30s request timeout is far too patient here; a server that
        // ignores `shutdown` gets killed instead.
        let _ = tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), graceful).await;
        let _ = self
            .correlator
            .writer_tx
            .send(WriterCommand::Shutdown)
            .await;
        self.alive.store(false, Ordering::Release);

        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            child.wait(),
        )
        .await;
        if waited.is_err() {
            tracing::debug!("LSP '{}' didn't exit in time, killing", self.name);
            let _ = child.kill().await;
        }
    }
}
