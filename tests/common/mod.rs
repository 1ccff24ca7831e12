use std::path::PathBuf;

use tempfile::TempDir;

use mcp_bridge::config::{ServerCatalog, Settings};
use mcp_bridge::dispatch::{Dispatcher, Identity};
use mcp_bridge::session::SessionRegistry;
use mcp_bridge::workspace::WorkspaceManager;

/// Returns the path to the `bridge_test_server` binary.
///
/// Cargo sets `CARGO_BIN_EXE_bridge_test_server` automatically when running
/// integration tests in the same package. Falls back to searching in the
/// `target/debug` directory for convenience during manual testing.
#[allow(dead_code)]
pub fn test_server_exe() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_bridge_test_server") {
        return PathBuf::from(p);
    }

    if let Ok(manifest) = std::env::var("CARGO_MANIFEST_DIR") {
        let debug = PathBuf::from(manifest)
            .join("target")
            .join("debug")
            .join("bridge_test_server");
        if debug.exists() {
            return debug;
        }
    }

    PathBuf::from("bridge_test_server")
}

/// Build a dispatcher whose catalog holds one server `pp` described by
/// `server_fields` (the `command` is filled in with the test server binary).
#[allow(dead_code)]
pub fn build_dispatcher(
    mut server_fields: serde_json::Value,
    settings: Settings,
) -> (TempDir, Dispatcher) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    server_fields["command"] =
        serde_json::Value::String(test_server_exe().to_string_lossy().into_owned());
    let catalog: ServerCatalog =
        serde_json::from_value(serde_json::json!({ "mcpServers": { "pp": server_fields } }))
            .expect("catalog should parse");
    let registry = SessionRegistry::new(&settings);
    let workspaces = WorkspaceManager::new(tmp.path()).expect("workspace root");
    let dispatcher = Dispatcher::new(settings, catalog, registry, workspaces);
    (tmp, dispatcher)
}

/// An identity with both headers present: the session key is user+chat.
#[allow(dead_code)]
pub fn user_identity(user: &str, chat: &str) -> Identity {
    Identity {
        user_id: Some(user.to_string()),
        chat_id: Some(chat.to_string()),
        remote_addr: "127.0.0.1".to_string(),
    }
}
