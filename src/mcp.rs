use crate::context::ContextEngine;
use crate::rpc::{self, ApplyEditParams, FindSymbolParams, GetContextParams};
use anyhow::Result;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const MAX_RESPONSE_BYTES: usize = 512_000; // 500KB hard cap

pub async fn serve(workspace_root: PathBuf) -> Result<()> {
    let engine = ContextEngine::new(workspace_root);
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(message) => handle_message(message, &engine).await,
            Err(err) => Some(jsonrpc_error(
                Value::Null,
                -32700,
                &format!("parse error: {err}"),
            )),
        };
        if let Some(payload) = response {
            let mut body = serde_json::to_vec(&payload)?;
            body.push(b'\n');
            stdout.write_all(&body).await?;
            stdout.flush().await?;
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn handle_message(message: Value, engine: &ContextEngine) -> Option<Value> {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(|value| value.as_str());

    let Some(method) = method else {
        return id.map(|id| jsonrpc_error(id, -32600, "invalid request"));
    };

    match method {
        "initialize" => {
            let id = id?;
            Some(jsonrpc_result(id, initialize_result(&message)))
        }
        "notifications/initialized" => None,
        "ping" => id.map(|id| jsonrpc_result(id, json!({}))),
        "tools/list" => {
            let id = id?;
            Some(jsonrpc_result(id, json!({ "tools": tool_specs() })))
        }
        "tools/call" => {
            let id = id?;
            Some(handle_tool_call(id, &message, engine).await)
        }
        "resources/list" => id.map(|id| jsonrpc_result(id, json!({ "resources": [] }))),
        "resources/templates/list" => {
            id.map(|id| jsonrpc_result(id, json!({ "resourceTemplates": [] })))
        }
        "prompts/list" => id.map(|id| jsonrpc_result(id, json!({ "prompts": [] }))),
        "roots/list" => id.map(|id| jsonrpc_result(id, json!({ "roots": [] }))),
        _ => id.map(|id| jsonrpc_error(id, -32601, "method not found")),
    }
}

fn initialize_result(message: &Value) -> Value {
    let protocol = message
        .get("params")
        .and_then(|params| params.get("protocolVersion"))
        .cloned()
        .unwrap_or_else(|| Value::String("2024-11-05".to_string()));
    json!({
        "protocolVersion": protocol,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "ctxls",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Use find_symbol to locate a symbol's definitions, get_context to \
assemble a token-bounded context payload for a query (forms: 'file:symbol', \
'Class.method', or a bare symbol; scope: function|class|file), and apply_edit \
to apply line-based replace/insert/delete edits to a file. Context payloads \
are cached; repeated queries are served from the cache until the entry expires.",
    })
}

fn input_schema<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }))
}

fn tool_specs() -> Vec<Value> {
    vec![
        json!({
            "name": "find_symbol",
            "description": "Locate every known definition site of a symbol by name.",
            "inputSchema": input_schema::<FindSymbolParams>(),
        }),
        json!({
            "name": "get_context",
            "description": "Assemble a cached, token-bounded context payload (symbols, \
dependencies, references) for a query.",
            "inputSchema": input_schema::<GetContextParams>(),
        }),
        json!({
            "name": "apply_edit",
            "description": "Apply line-addressed replace/insert/delete edits to a file; \
out-of-range edits are skipped and counted.",
            "inputSchema": input_schema::<ApplyEditParams>(),
        }),
    ]
}

async fn handle_tool_call(id: Value, message: &Value, engine: &ContextEngine) -> Value {
    let params = match message.get("params") {
        Some(value) => value,
        None => return jsonrpc_error(id, -32602, "missing params"),
    };
    let tool_name = params
        .get("name")
        .and_then(|value| value.as_str())
        .unwrap_or("");
    if !matches!(tool_name, "find_symbol" | "get_context" | "apply_edit") {
        return jsonrpc_error(id, -32601, "unknown tool");
    }

    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match rpc::handle_method(engine, tool_name, arguments).await {
        Ok(result) => jsonrpc_result(id, call_result_ok(result)),
        Err(err) => jsonrpc_result(id, call_result_error(&err.to_string())),
    }
}

fn call_result_ok(result: Value) -> Value {
    let text = serde_json::to_string_pretty(&result).unwrap_or_default();
    let content = if text.len() > MAX_RESPONSE_BYTES {
        vec![json!({
            "type": "text",
            "text": format!(
                "Response too large ({} bytes, {} est. tokens). Reduce max_tokens or use a narrower scope.",
                text.len(),
                text.len() / 4
            )
        })]
    } else {
        vec![json!({ "type": "text", "text": text })]
    };
    json!({
        "content": content,
        "structuredContent": ensure_object_response(result),
        "isError": false
    })
}

fn ensure_object_response(result: Value) -> Value {
    if result.is_array() {
        json!({ "items": result })
    } else {
        result
    }
}

fn call_result_error(message: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true
    })
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}
