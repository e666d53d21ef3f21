//! JSON-RPC message shapes, LSP param builders, and response parsing.
//!
//! Payload bodies stay `serde_json::Value` at the framing layer; this module
//! is where they get structured after dispatch.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Response to a server-initiated request. The id is echoed verbatim — the
/// server chooses its own id type.
pub(crate) fn response_frame(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub(crate) fn error_response_frame(
    id: &serde_json::Value,
    code: i64,
    message: &str,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Client capabilities advertised in `initialize`: exactly the navigation
/// surface this crate queries, nothing more.
pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "didSave": false
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                },
                "definition": {},
                "references": {},
                "documentSymbol": {
                    "hierarchicalDocumentSymbolSupport": true
                }
            },
            "workspace": {
                "symbol": {}
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

/// Params for position-based queries (hover, definition). 0-indexed.
pub(crate) fn position_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub(crate) fn references_params(
    uri: &str,
    line: u32,
    character: u32,
    include_declaration: bool,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
        "context": { "includeDeclaration": include_declaration }
    })
}

pub(crate) fn document_symbol_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}

/// A resolved source location, 0-indexed internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: PathBuf,
    pub line: u32,
    pub col: u32,
}

impl Location {
    /// Format as `path:line:col`, 1-indexed for display.
    #[must_use]
    pub fn display(&self) -> String {
        format!("{}:{}:{}", self.path.display(), self.line + 1, self.col + 1)
    }
}

fn position_from(value: &serde_json::Value) -> Option<(u32, u32)> {
    Some((
        value.get("line")?.as_u64()? as u32,
        value.get("character")?.as_u64()? as u32,
    ))
}

/// Parse one LSP `Location` or `LocationLink` object.
fn location_from(value: &serde_json::Value) -> Option<Location> {
    // LocationLink carries targetUri/targetSelectionRange instead.
    let (uri, range) = if let Some(uri) = value.get("uri") {
        (uri, value.get("range")?)
    } else {
        (
            value.get("targetUri")?,
            value
                .get("targetSelectionRange")
                .or_else(|| value.get("targetRange"))?,
        )
    };
    let path = file_uri_to_path(uri.as_str()?)?;
    let (line, col) = position_from(range.get("start")?)?;
    Some(Location { path, line, col })
}

/// Parse a definition/references result: `Location | Location[] | LocationLink[] | null`.
#[must_use]
pub(crate) fn parse_locations(result: &serde_json::Value) -> Vec<Location> {
    match result {
        serde_json::Value::Array(items) => items.iter().filter_map(location_from).collect(),
        serde_json::Value::Object(_) => location_from(result).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// A `workspace/symbol` result entry.
#[derive(Debug, Clone)]
pub struct WorkspaceSymbol {
    pub name: String,
    pub kind: u64,
    pub container: Option<String>,
    pub location: Location,
}

/// Parse a `workspace/symbol` result (`SymbolInformation[] | null`).
#[must_use]
pub(crate) fn parse_workspace_symbols(result: &serde_json::Value) -> Vec<WorkspaceSymbol> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            Some(WorkspaceSymbol {
                name: item.get("name")?.as_str()?.to_string(),
                kind: item.get("kind").and_then(serde_json::Value::as_u64).unwrap_or(0),
                container: item
                    .get("containerName")
                    .and_then(|c| c.as_str())
                    .map(String::from),
                location: location_from(item.get("location")?)?,
            })
        })
        .collect()
}

/// Flatten an LSP hover `contents` field to plain text.
///
/// The field is badly polymorphic: a string, a `MarkedString` object with
/// `language`/`value`, a `MarkupContent` object with `value`, or an array of
/// any of those.
#[must_use]
pub(crate) fn hover_contents_to_text(contents: &serde_json::Value) -> String {
    fn flatten(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => out.push(s.clone()),
            serde_json::Value::Array(items) => {
                for item in items {
                    flatten(item, out);
                }
            }
            serde_json::Value::Object(obj) => {
                if let Some(s) = obj.get("value").and_then(|v| v.as_str()) {
                    out.push(s.to_string());
                }
            }
            _ => {}
        }
    }
    let mut parts = Vec::new();
    flatten(contents, &mut parts);
    parts.retain(|p| !p.trim().is_empty());
    parts.join("\n")
}

/// Human name for an LSP `SymbolKind` number.
#[must_use]
pub(crate) fn symbol_kind_name(kind: u64) -> &'static str {
    match kind {
        1 => "File",
        2 => "Module",
        3 => "Namespace",
        4 => "Package",
        5 => "Class",
        6 => "Method",
        7 => "Property",
        8 => "Field",
        9 => "Constructor",
        10 => "Enum",
        11 => "Interface",
        12 => "Function",
        13 => "Variable",
        14 => "Constant",
        15 => "String",
        16 => "Number",
        17 => "Boolean",
        18 => "Array",
        19 => "Object",
        20 => "Key",
        21 => "Null",
        22 => "EnumMember",
        23 => "Struct",
        24 => "Event",
        25 => "Operator",
        26 => "TypeParameter",
        _ => "Symbol",
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
