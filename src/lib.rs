//! MCP bridge library
//!
//! A bridge between a chat UI speaking HTTP/JSON-RPC tool invocation and a
//! fleet of MCP servers: subprocesses speaking newline-delimited JSON-RPC
//! 2.0 over stdio. The bridge multiplexes concurrent chat sessions onto
//! those subprocesses, exposes generated files as download URLs, and
//! enforces per-session isolation, resource caps, idle expiry, and garbage
//! collection.
//!
//! # Architecture
//!
//! - `config`: server catalog and environment-resolved settings
//! - `rpc`: JSON-RPC 2.0 envelope types and protocol constants
//! - `adapter`: subprocess ownership, stdio framing, id correlation
//! - `workspace`: per-session job directories under the jobs root
//! - `paths`: inbound path rewriting and outbound download-URL injection
//! - `session`: session keys and the stateful session registry
//! - `enrich`: synthetic usage-guide tool injection
//! - `dispatch`: the top-level request dispatcher
//! - `gc`: idle-session reaping and workspace expiry
//! - `http`: the axum surface (`/mcp`, `/mcpo`, `/health`)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_bridge::config::{ServerCatalog, Settings};
//! use mcp_bridge::dispatch::Dispatcher;
//! use mcp_bridge::http::AppContext;
//! use mcp_bridge::session::SessionRegistry;
//! use mcp_bridge::workspace::WorkspaceManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     let catalog = ServerCatalog::load(&settings.config_file)?;
//!     let registry = SessionRegistry::new(&settings);
//!     let workspaces = WorkspaceManager::new(&settings.jobs_dir)?;
//!     let dispatcher = Dispatcher::new(settings, catalog, registry, workspaces);
//!     let _ctx = AppContext::new(dispatcher);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod gc;
pub mod http;
pub mod paths;
pub mod rpc;
pub mod session;
pub mod workspace;

// Re-export commonly used types
pub use config::{ServerCatalog, ServerSpec, Settings};
pub use dispatch::{DispatchOutcome, Dispatcher, Identity};
pub use error::{BridgeError, Result};
pub use session::{SessionKey, SessionRegistry};
