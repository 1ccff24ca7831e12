//! Command-line interface definition for the bridge
//!
//! This module defines the CLI structure using clap's derive API. Flags
//! mirror the recognised environment variables so either works.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// MCP bridge - multiplex chat sessions onto stdio MCP servers
///
/// Routes HTTP JSON-RPC tool invocations to MCP server subprocesses with
/// per-session isolation, resource caps, and file downloads.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the server catalog (JSON document with `mcpServers`)
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP surface to
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    pub listen: String,

    /// Workspace root directory
    #[arg(long, env = "JOBS_DIR")]
    pub jobs_dir: Option<PathBuf>,

    /// Log level filter (e.g. `debug`, `mcp_bridge=trace`)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Command to execute; defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the bridge
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the bridge (the default when no command is given)
    Serve,

    /// Load and validate the catalog, print the resolved server table
    Check,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["mcp-bridge"]);
        assert_eq!(cli.listen, "0.0.0.0:8000");
        assert!(cli.command.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_check_subcommand() {
        let cli = Cli::parse_from(["mcp-bridge", "--config", "servers.json", "check"]);
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("servers.json")));
    }

    #[test]
    fn test_listen_override() {
        let cli = Cli::parse_from(["mcp-bridge", "--listen", "127.0.0.1:9000", "serve"]);
        assert_eq!(cli.listen, "127.0.0.1:9000");
        assert!(matches!(cli.command, Some(Commands::Serve)));
    }
}
