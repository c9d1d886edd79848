pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod mcp;
pub mod model;
pub mod registry;
pub mod rpc;
pub mod scan;
pub mod session;
pub mod tokens;
pub mod util;
