use crate::context::ContextEngine;
use crate::model::{ContextScope, Edit};
use crate::scan;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: String,
    message: String,
}

#[derive(Deserialize, schemars::JsonSchema)]
pub struct FindSymbolParams {
    #[serde(alias = "symbol", alias = "name", alias = "query")]
    pub symbol_name: String,
    pub language: Option<String>,
}

#[derive(Deserialize, schemars::JsonSchema)]
pub struct GetContextParams {
    pub query: String,
    pub scope: Option<ContextScope>,
    pub max_tokens: Option<usize>,
}

#[derive(Deserialize, schemars::JsonSchema)]
pub struct ApplyEditParams {
    #[serde(alias = "file")]
    pub file_path: String,
    pub edits: Vec<Edit>,
}

#[derive(Deserialize, schemars::JsonSchema)]
struct PositionParams {
    #[serde(alias = "file")]
    file_path: String,
    line: u64,
    character: Option<u64>,
}

#[derive(Deserialize, schemars::JsonSchema)]
struct FileParams {
    #[serde(alias = "file")]
    file_path: String,
}

/// Run the JSONL RPC server over stdin/stdout until end of input, then stop
/// every backend session.
pub async fn serve(workspace_root: PathBuf) -> Result<()> {
    let engine = ContextEngine::new(workspace_root);
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => handle_request(&engine, request).await,
            Err(err) => error_response(
                Value::Null,
                "invalid_request",
                &format!("invalid request: {err}"),
            ),
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
    }

    engine.shutdown().await;
    Ok(())
}

/// Run a single request against a fresh engine and return the serialized
/// response line.
pub async fn call(
    workspace_root: PathBuf,
    method: String,
    params_raw: &str,
    id_raw: &str,
) -> Result<String> {
    let params: Value = serde_json::from_str(params_raw).with_context(|| "parse params JSON")?;
    let id = parse_id(id_raw);
    let engine = ContextEngine::new(workspace_root);
    let response = handle_request(&engine, RpcRequest { id, method, params }).await;
    engine.shutdown().await;
    Ok(serde_json::to_string(&response)?)
}

fn parse_id(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn handle_request(engine: &ContextEngine, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match handle_method(engine, &request.method, request.params).await {
        Ok(value) => RpcResponse {
            id,
            result: Some(value),
            error: None,
        },
        Err(err) => error_response(id, error_code(&err), &err.to_string()),
    }
}

fn error_response(id: Value, code: &str, message: &str) -> RpcResponse {
    RpcResponse {
        id,
        result: None,
        error: Some(RpcError {
            code: code.to_string(),
            message: message.to_string(),
        }),
    }
}

/// Stable machine-readable code for a dispatch failure.
fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(typed) = err.downcast_ref::<crate::error::Error>() {
        return typed.code();
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return "invalid_params";
    }
    if err.to_string().starts_with("unknown method") {
        return "method_not_found";
    }
    "internal_error"
}

pub const METHODS: &[&str] = &[
    "help",
    "list_methods",
    "list_languages",
    "find_symbol",
    "get_context",
    "apply_edit",
    "definition",
    "references",
    "symbols",
    "cache_stats",
    "cache_clear",
];

pub async fn handle_method(
    engine: &ContextEngine,
    method: &str,
    params: Value,
) -> Result<Value> {
    let value = match method {
        "help" => method_help(),
        "list_methods" => json!({ "methods": METHODS }),
        "list_languages" => method_list_languages(),
        "find_symbol" => {
            let params: FindSymbolParams = serde_json::from_value(params)?;
            let result = engine
                .find_symbol(&params.symbol_name, params.language.as_deref())
                .await?;
            serde_json::to_value(result)?
        }
        "get_context" => {
            let params: GetContextParams = serde_json::from_value(params)?;
            let payload = engine
                .get_context(
                    &params.query,
                    params.scope.unwrap_or_default(),
                    params.max_tokens,
                )
                .await?;
            serde_json::to_value(payload)?
        }
        "apply_edit" => {
            let params: ApplyEditParams = serde_json::from_value(params)?;
            let result = engine.apply_edit(Path::new(&params.file_path), &params.edits)?;
            serde_json::to_value(result)?
        }
        "definition" => {
            let params: PositionParams = serde_json::from_value(params)?;
            let locations = engine
                .definition(
                    Path::new(&params.file_path),
                    params.line,
                    params.character.unwrap_or(0),
                )
                .await?;
            json!({ "locations": locations })
        }
        "references" => {
            let params: PositionParams = serde_json::from_value(params)?;
            let references = engine
                .references(
                    Path::new(&params.file_path),
                    params.line,
                    params.character.unwrap_or(0),
                )
                .await?;
            json!({ "references": references })
        }
        "symbols" => {
            let params: FileParams = serde_json::from_value(params)?;
            let symbols = engine.symbols(Path::new(&params.file_path)).await?;
            json!({ "symbols": symbols })
        }
        "cache_stats" => serde_json::to_value(engine.cache_stats())?,
        "cache_clear" => {
            engine.cache_clear();
            json!({ "cleared": true })
        }
        other => anyhow::bail!("unknown method: {other}"),
    };
    Ok(value)
}

fn method_help() -> Value {
    json!({
        "methods": {
            "find_symbol": "Locate a symbol: {symbol_name, language?}",
            "get_context": "Assemble a bounded context payload: {query, scope?, max_tokens?}",
            "apply_edit": "Apply line edits: {file_path, edits: [{type, line, text?}]}",
            "definition": "Backend definition lookup: {file_path, line, character?}",
            "references": "Backend reference lookup: {file_path, line, character?}",
            "symbols": "Backend document symbols: {file_path}",
            "cache_stats": "Result cache counters",
            "cache_clear": "Drop every cached payload",
        },
        "scopes": ["function", "class", "file"],
    })
}

fn method_list_languages() -> Value {
    let languages: Vec<Value> = scan::language_specs()
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "extensions": spec.extensions,
            })
        })
        .collect();
    json!({ "languages": languages })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ContextEngine {
        let dir = std::env::temp_dir().join("ctxls-rpc-tests");
        std::fs::create_dir_all(&dir).unwrap();
        ContextEngine::new(dir)
    }

    #[tokio::test]
    async fn unknown_method_gets_a_stable_code() {
        let engine = engine();
        let response = handle_request(
            &engine,
            RpcRequest {
                id: json!(1),
                method: "no_such_method".to_string(),
                params: json!({}),
            },
        )
        .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, "method_not_found");
    }

    #[tokio::test]
    async fn invalid_params_get_a_stable_code() {
        let engine = engine();
        let response = handle_request(
            &engine,
            RpcRequest {
                id: json!(2),
                method: "get_context".to_string(),
                params: json!({ "scope": "function" }),
            },
        )
        .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, "invalid_params");
    }

    #[tokio::test]
    async fn list_methods_and_languages_answer() {
        let engine = engine();
        let methods = handle_method(&engine, "list_methods", json!({})).await.unwrap();
        assert!(methods["methods"].as_array().unwrap().len() >= 8);

        let languages = handle_method(&engine, "list_languages", json!({})).await.unwrap();
        let names: Vec<&str> = languages["languages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"python"));
        assert!(names.contains(&"go"));
    }

    #[test]
    fn id_parsing_accepts_numbers_and_strings() {
        assert_eq!(parse_id("1"), json!(1));
        assert_eq!(parse_id("\"abc\""), json!("abc"));
        assert_eq!(parse_id("abc"), json!("abc"));
    }
}
