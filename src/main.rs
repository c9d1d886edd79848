use anyhow::Result;
use clap::Parser;
use ctxls::config::Config;
use ctxls::{cli, mcp, rpc};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn workspace_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| Config::get().workspace_root.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Serve { workspace } => rpc::serve(workspace_root(workspace)).await,
        cli::Command::McpServe { workspace } => mcp::serve(workspace_root(workspace)).await,
        cli::Command::Request {
            workspace,
            method,
            params,
            params_file,
            id,
        } => {
            let params_raw = if let Some(path) = params_file {
                std::fs::read_to_string(&path)?
            } else {
                params
            };
            let response = rpc::call(workspace_root(workspace), method, &params_raw, &id).await?;
            println!("{response}");
            Ok(())
        }
    }
}
