//! Multiplexed LSP client for code-navigation queries.
//!
//! Talks JSON-RPC 2.0 over stdio to externally-configured language servers
//! and exposes hover, definition, references, document-symbol, and
//! workspace-symbol queries as plain text. One connection per server name,
//! started lazily, shared across queries.

pub mod codec;
pub mod types;

pub(crate) mod protocol;

pub mod pool;
pub mod query;
pub mod resolve;
pub mod server;

pub use pool::{ConnectionPool, RouteError, StartError};
pub use protocol::{Location, WorkspaceSymbol};
pub use query::{Action, QueryEngine, QueryRequest};
pub use server::ServerConnection;
pub use types::{ConfigStamp, LspConfig, LspError, ServerConfig, server_for_file};
