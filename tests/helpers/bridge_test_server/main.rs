//! MCP test server binary for integration tests
//!
//! This binary implements a minimal MCP server that communicates over
//! stdin/stdout using newline-delimited JSON (the stdio framing the bridge
//! speaks). It is used exclusively by integration tests to exercise the
//! adapter, registry, and dispatcher without requiring a real external MCP
//! server.
//!
//! # Handled Methods
//!
//! - `initialize` -- responds with a protocol version and a `tools`
//!   capability.
//! - `notifications/initialized` -- acknowledged silently (no response).
//! - `tools/list` -- returns three tools: `echo`, `write_file`, and
//!   `slow_echo`.
//! - `tools/call` with `name: "echo"` -- echoes back the `message`
//!   argument.
//! - `tools/call` with `name: "write_file"` -- writes `content` to
//!   `file_path` (resolved against the working directory when relative) and
//!   announces `<basename> saved` in a text block alongside a `file_path`
//!   result field.
//! - `tools/call` with `name: "slow_echo"` -- sleeps 100 ms before
//!   responding, and reports whether another request arrived during the
//!   sleep (`overlapped`). A bridge that serializes a session's calls never
//!   produces an overlapped response.
//! - `ping` -- empty result.
//! - All other methods -- JSON-RPC `-32601 Method not found`.
//!
//! Requests are read on a dedicated thread so the handler loop can observe
//! queued-but-unhandled traffic; each response is written as a single line
//! of JSON followed by `\n`.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

fn main() {
    let (line_tx, line_rx) = mpsc::channel::<String>();

    // Reader thread: one JSON message per line.
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut queued: VecDeque<String> = VecDeque::new();

    loop {
        let raw = match queued.pop_front() {
            Some(l) => l,
            None => match line_rx.recv() {
                Ok(l) => l,
                Err(_) => break,
            },
        };

        let request: serde_json::Value = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(_) => {
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" }
                });
                if write_line(&mut out, &response).is_err() {
                    break;
                }
                continue;
            }
        };

        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = request
            .get("id")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        if method == "notifications/initialized" {
            continue;
        }

        let response = match method {
            "initialize" => handle_initialize(&id),
            "tools/list" => handle_tools_list(&id),
            "tools/call" => handle_tools_call(&id, &request, &line_rx, &mut queued),
            "ping" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            _ => make_error(&id, -32601, &format!("Method not found: {}", method)),
        };

        if write_line(&mut out, &response).is_err() {
            break;
        }
    }
}

fn write_line(out: &mut impl Write, response: &serde_json::Value) -> io::Result<()> {
    let serialized = serde_json::to_string(response).expect("response serializes");
    writeln!(out, "{}", serialized)?;
    out.flush()
}

fn handle_initialize(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2025-03-26",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "bridge-test-server", "version": "0.1.0" }
        }
    })
}

fn handle_tools_list(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "tools": [
                {
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } }
                    }
                },
                {
                    "name": "write_file",
                    "description": "Writes content to a file and announces it",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "file_path": { "type": "string" },
                            "content": { "type": "string" }
                        }
                    }
                },
                {
                    "name": "slow_echo",
                    "description": "Echoes input after a short delay",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } }
                    }
                }
            ]
        }
    })
}

fn handle_tools_call(
    id: &serde_json::Value,
    request: &serde_json::Value,
    line_rx: &mpsc::Receiver<String>,
    queued: &mut VecDeque<String>,
) -> serde_json::Value {
    let params = request.get("params").unwrap_or(&serde_json::Value::Null);
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = params.get("arguments").unwrap_or(&serde_json::Value::Null);

    match tool_name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": message }],
                    "isError": false
                }
            })
        }
        "write_file" => handle_write_file(id, arguments),
        "slow_echo" => {
            let message = arguments
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            std::thread::sleep(Duration::from_millis(100));
            // Any request already readable arrived while this one was still
            // being handled, i.e. the caller did not serialize.
            let mut overlapped = false;
            while let Ok(line) = line_rx.try_recv() {
                overlapped = true;
                queued.push_back(line);
            }
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": message }],
                    "overlapped": overlapped,
                    "isError": false
                }
            })
        }
        other => make_error(id, -32602, &format!("Unknown tool: {}", other)),
    }
}

fn handle_write_file(id: &serde_json::Value, arguments: &serde_json::Value) -> serde_json::Value {
    let file_path = arguments
        .get("file_path")
        .and_then(|p| p.as_str())
        .unwrap_or("");
    let content = arguments
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("");

    if file_path.is_empty() {
        return make_error(id, -32602, "write_file requires file_path");
    }

    let path = PathBuf::from(file_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    if let Err(e) = std::fs::write(&path, content) {
        return make_error(id, -32603, &format!("write failed: {}", e));
    }

    let basename = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());

    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{ "type": "text", "text": format!("{} saved", basename) }],
            "file_path": file_path,
            "isError": false
        }
    })
}

fn make_error(id: &serde_json::Value, code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
