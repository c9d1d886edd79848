use crate::config::Config;
use crate::error::Result;
use crate::model::{ReferenceRecord, SourceLocation, SymbolKind, SymbolRecord};
use crate::scan;
use crate::session::{BackendSession, SessionConfig};
use crate::util::{from_file_uri, line_at, to_file_uri};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Seam between the aggregator and whatever answers symbol queries. The
/// production implementation is [`SessionRegistry`]; tests supply an
/// in-memory provider.
#[async_trait::async_trait]
pub trait SymbolProvider: Send + Sync {
    async fn symbols(&self, file: &Path) -> Result<Vec<SymbolRecord>>;
    async fn references(&self, file: &Path, line: u64, character: u64)
    -> Result<Vec<ReferenceRecord>>;
    async fn definition(&self, file: &Path, line: u64, character: u64)
    -> Result<Vec<SourceLocation>>;
}

/// Backend launch command per language tag.
pub fn server_command(language: &str) -> Option<(&'static str, &'static [&'static str])> {
    match language {
        "python" => Some(("pylsp", &[])),
        "typescript" | "javascript" => Some(("typescript-language-server", &["--stdio"])),
        "bash" => Some(("bash-language-server", &["start"])),
        "go" => Some(("gopls", &[])),
        _ => None,
    }
}

/// Lazily creates and caches one [`BackendSession`] per language. Files
/// whose extension maps to no language yield empty results, never errors.
pub struct SessionRegistry {
    workspace_root: PathBuf,
    sessions: Mutex<HashMap<String, Arc<BackendSession>>>,
    start_timeout: Duration,
    request_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(workspace_root: PathBuf) -> Self {
        let config = Config::get();
        Self {
            workspace_root,
            sessions: Mutex::new(HashMap::new()),
            start_timeout: config.start_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Idempotent: an existing session for the language is reused. Returns
    /// `None` for languages without a configured backend.
    pub async fn ensure_started(&self, language: &str) -> Result<Option<Arc<BackendSession>>> {
        let Some((command, args)) = server_command(language) else {
            return Ok(None);
        };
        // Held across start() so concurrent callers never race a second
        // session for the same language into existence.
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(language) {
            return Ok(Some(session.clone()));
        }
        let session = BackendSession::start(SessionConfig {
            language: language.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            workspace_root: self.workspace_root.clone(),
            start_timeout: self.start_timeout,
            request_timeout: self.request_timeout,
        })
        .await?;
        let session = Arc::new(session);
        sessions.insert(language.to_string(), session.clone());
        Ok(Some(session))
    }

    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.stop().await;
        }
    }

    async fn session_for(&self, file: &Path) -> Result<Option<Arc<BackendSession>>> {
        match scan::detect_language(file) {
            Some(language) => self.ensure_started(language).await,
            None => Ok(None),
        }
    }
}

fn text_document_params(file: &Path) -> Value {
    json!({ "textDocument": { "uri": to_file_uri(file) } })
}

fn position_params(file: &Path, line: u64, character: u64) -> Value {
    json!({
        "textDocument": { "uri": to_file_uri(file) },
        "position": { "line": line, "character": character },
    })
}

/// Translate a `textDocument/documentSymbol` reply. Backends answer with
/// either flat `SymbolInformation[]` (carrying a `location`) or nested
/// `DocumentSymbol[]`; both collapse into [`SymbolRecord`]s.
pub(crate) fn parse_document_symbols(file: &Path, reply: &Value) -> Vec<SymbolRecord> {
    let Some(items) = reply.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        collect_symbol(file, item, &mut out);
    }
    out
}

fn collect_symbol(file: &Path, item: &Value, out: &mut Vec<SymbolRecord>) {
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if name.is_empty() {
        return;
    }
    let kind = item
        .get("kind")
        .and_then(Value::as_u64)
        .map(SymbolKind::from_lsp)
        .unwrap_or(SymbolKind::Unknown);

    let (file_path, line) = if let Some(location) = item.get("location") {
        let path = location
            .get("uri")
            .and_then(Value::as_str)
            .map(from_file_uri)
            .unwrap_or_else(|| file.to_path_buf());
        let line = location
            .pointer("/range/start/line")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        (path, line)
    } else {
        let line = item
            .pointer("/selectionRange/start/line")
            .or_else(|| item.pointer("/range/start/line"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        (file.to_path_buf(), line)
    };

    let documentation = item
        .get("detail")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    out.push(SymbolRecord {
        name,
        kind,
        file_path: file_path.to_string_lossy().into_owned(),
        line,
        documentation,
    });

    if let Some(children) = item.get("children").and_then(Value::as_array) {
        for child in children {
            collect_symbol(file, child, out);
        }
    }
}

/// Translate a definition/references reply: a single `Location`, a
/// `Location[]`, or `LocationLink[]`.
pub(crate) fn parse_locations(reply: &Value) -> Vec<SourceLocation> {
    let items: Vec<&Value> = match reply {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![reply],
        _ => Vec::new(),
    };
    let mut out = Vec::new();
    for item in items {
        let uri = item
            .get("uri")
            .or_else(|| item.get("targetUri"))
            .and_then(Value::as_str);
        let line = item
            .pointer("/range/start/line")
            .or_else(|| item.pointer("/targetRange/start/line"))
            .and_then(Value::as_u64);
        if let (Some(uri), Some(line)) = (uri, line) {
            out.push(SourceLocation {
                file_path: from_file_uri(uri).to_string_lossy().into_owned(),
                line,
            });
        }
    }
    out
}

#[async_trait::async_trait]
impl SymbolProvider for SessionRegistry {
    async fn symbols(&self, file: &Path) -> Result<Vec<SymbolRecord>> {
        let Some(session) = self.session_for(file).await? else {
            return Ok(Vec::new());
        };
        let reply = session
            .request("textDocument/documentSymbol", text_document_params(file))
            .await?;
        Ok(parse_document_symbols(file, &reply))
    }

    async fn references(
        &self,
        file: &Path,
        line: u64,
        character: u64,
    ) -> Result<Vec<ReferenceRecord>> {
        let Some(session) = self.session_for(file).await? else {
            return Ok(Vec::new());
        };
        let mut params = position_params(file, line, character);
        params["context"] = json!({ "includeDeclaration": false });
        let reply = session.request("textDocument/references", params).await?;

        let mut out = Vec::new();
        for location in parse_locations(&reply) {
            let context = std::fs::read_to_string(&location.file_path)
                .ok()
                .and_then(|content| line_at(&content, location.line))
                .unwrap_or_default();
            out.push(ReferenceRecord {
                file_path: location.file_path,
                line: location.line,
                context,
            });
        }
        Ok(out)
    }

    async fn definition(
        &self,
        file: &Path,
        line: u64,
        character: u64,
    ) -> Result<Vec<SourceLocation>> {
        let Some(session) = self.session_for(file).await? else {
            return Ok(Vec::new());
        };
        let reply = session
            .request("textDocument/definition", position_params(file, line, character))
            .await?;
        Ok(parse_locations(&reply))
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Ok(sessions) = self.sessions.try_lock() {
            if !sessions.is_empty() {
                warn!("registry dropped with {} live session(s)", sessions.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_information_reply_is_flattened() {
        let reply = json!([
            {
                "name": "UserService",
                "kind": 5,
                "location": {
                    "uri": "file:///repo/src/auth.py",
                    "range": { "start": { "line": 10, "character": 0 },
                               "end": { "line": 40, "character": 0 } },
                }
            },
            {
                "name": "authenticate",
                "kind": 6,
                "location": {
                    "uri": "file:///repo/src/auth.py",
                    "range": { "start": { "line": 14, "character": 4 },
                               "end": { "line": 20, "character": 4 } },
                }
            }
        ]);
        let records = parse_document_symbols(Path::new("/repo/src/auth.py"), &reply);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, SymbolKind::Class);
        assert_eq!(records[0].line, 10);
        assert_eq!(records[1].name, "authenticate");
        assert_eq!(records[1].kind, SymbolKind::Method);
    }

    #[test]
    fn nested_document_symbols_include_children() {
        let reply = json!([
            {
                "name": "UserService",
                "kind": 5,
                "detail": "class UserService",
                "range": { "start": { "line": 3, "character": 0 },
                           "end": { "line": 30, "character": 0 } },
                "selectionRange": { "start": { "line": 3, "character": 6 },
                                    "end": { "line": 3, "character": 17 } },
                "children": [
                    {
                        "name": "authenticate",
                        "kind": 6,
                        "range": { "start": { "line": 8, "character": 4 },
                                   "end": { "line": 15, "character": 4 } },
                        "selectionRange": { "start": { "line": 8, "character": 8 },
                                            "end": { "line": 8, "character": 20 } },
                    }
                ]
            }
        ]);
        let records = parse_document_symbols(Path::new("/repo/src/auth.py"), &reply);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].documentation, "class UserService");
        assert_eq!(records[1].name, "authenticate");
        assert_eq!(records[1].line, 8);
        assert_eq!(records[1].file_path, "/repo/src/auth.py");
    }

    #[test]
    fn unknown_numeric_kind_maps_to_unknown() {
        let reply = json!([{
            "name": "weird",
            "kind": 99,
            "range": { "start": { "line": 0, "character": 0 },
                       "end": { "line": 1, "character": 0 } },
        }]);
        let records = parse_document_symbols(Path::new("/repo/x.py"), &reply);
        assert_eq!(records[0].kind, SymbolKind::Unknown);
    }

    #[test]
    fn locations_accept_single_and_link_shapes() {
        let single = json!({
            "uri": "file:///repo/a.py",
            "range": { "start": { "line": 2, "character": 0 },
                       "end": { "line": 2, "character": 5 } },
        });
        let parsed = parse_locations(&single);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].file_path, "/repo/a.py");
        assert_eq!(parsed[0].line, 2);

        let links = json!([{
            "targetUri": "file:///repo/b.py",
            "targetRange": { "start": { "line": 7, "character": 0 },
                             "end": { "line": 9, "character": 0 } },
        }]);
        let parsed = parse_locations(&links);
        assert_eq!(parsed[0].file_path, "/repo/b.py");
        assert_eq!(parsed[0].line, 7);

        assert!(parse_locations(&Value::Null).is_empty());
    }

    #[test]
    fn unmapped_language_has_no_server_command() {
        assert!(server_command("unknown").is_none());
        assert!(server_command("python").is_some());
        assert_eq!(server_command("typescript"), server_command("javascript"));
    }
}
