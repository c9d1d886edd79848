use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ctxls",
    version,
    about = "Language-server-backed context aggregator for AI tooling",
    after_help = r#"Examples:
  ctxls serve --workspace .
  ctxls mcp-serve --workspace .
  ctxls request --method get_context --params '{"query":"user.py:UserService","scope":"class"}'
  ctxls request --method find_symbol --params '{"symbol_name":"authenticate"}'
  ctxls request --method apply_edit --params '{"file_path":"src/app.py","edits":[{"type":"replace","line":1,"text":"import os"}]}'
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run JSONL RPC server over stdin/stdout.
    Serve {
        /// Workspace root; falls back to CTXLS_WORKSPACE_ROOT, then cwd.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Run MCP server over stdio.
    McpServe {
        /// Workspace root; falls back to CTXLS_WORKSPACE_ROOT, then cwd.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Run a single JSONL request and exit.
    Request {
        /// Workspace root; falls back to CTXLS_WORKSPACE_ROOT, then cwd.
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        id: String,
    },
}
