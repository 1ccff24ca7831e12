//! Request dispatcher
//!
//! The dispatcher is the top-level entry point behind the HTTP surface. It
//! owns its collaborators explicitly (catalog, settings, session registry,
//! workspace manager, global concurrency semaphore) and implements the
//! contract: classify the request, select the ephemeral or stateful path,
//! rewrite paths in both directions, and emit a response that re-uses the
//! caller's JSON-RPC id. The adapter's internal ids never leak out.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::adapter::{CallReply, McpAdapter};
use crate::config::{ServerCatalog, ServerSpec, Settings};
use crate::enrich;
use crate::error::BridgeError;
use crate::paths::PathResolver;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, METHOD_TOOLS_LIST};
use crate::session::{SessionKey, SessionRegistry};
use crate::workspace::WorkspaceManager;

/// Caller identity extracted from HTTP headers, plus the fallback address.
#[derive(Debug, Clone)]
pub struct Identity {
    /// `X-OpenWebUI-User-Id`, when present.
    pub user_id: Option<String>,
    /// `X-OpenWebUI-Chat-Id`, when present.
    pub chat_id: Option<String>,
    /// Client address used when the identity headers are absent.
    pub remote_addr: String,
}

impl Identity {
    fn session_key(&self) -> SessionKey {
        SessionKey::derive(
            self.user_id.as_deref(),
            self.chat_id.as_deref(),
            &self.remote_addr,
        )
    }
}

/// What the HTTP surface writes back: a status code and an optional
/// JSON-RPC body (`None` for accepted notifications).
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: u16,
    pub body: Option<JsonRpcResponse>,
}

impl DispatchOutcome {
    fn ok(body: JsonRpcResponse) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    fn accepted() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }

    fn from_error(id: Option<serde_json::Value>, error: &BridgeError) -> Self {
        Self {
            status: error.http_status(),
            body: Some(JsonRpcResponse::error(
                id,
                error.jsonrpc_code(),
                error.to_string(),
            )),
        }
    }
}

/// Top-level request dispatcher. One per bridge process.
pub struct Dispatcher {
    settings: Settings,
    catalog: ServerCatalog,
    registry: Arc<SessionRegistry>,
    workspaces: WorkspaceManager,
    /// Caps in-flight subprocess calls process-wide (`MAX_CONCURRENT`).
    concurrency: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        settings: Settings,
        catalog: ServerCatalog,
        registry: Arc<SessionRegistry>,
        workspaces: WorkspaceManager,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(settings.max_concurrent));
        Self {
            settings,
            catalog,
            registry,
            workspaces,
            concurrency,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Dispatch one HTTP request body against a named server.
    ///
    /// `proto` is the routing tag (`mcp` or `mcpo`); both paths share this
    /// implementation.
    pub async fn dispatch(
        &self,
        proto: &str,
        server_name: &str,
        body: &[u8],
        identity: &Identity,
    ) -> DispatchOutcome {
        metrics::counter!("bridge_requests_total", 1, "proto" => proto.to_string());

        let Some(spec) = self.catalog.get(server_name) else {
            let err = BridgeError::ServerUnknown(server_name.to_string());
            return DispatchOutcome::from_error(None, &err);
        };

        let request = match JsonRpcRequest::from_slice(body) {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::from_error(None, &e),
        };
        let caller_id = request.id.clone();
        let key = identity.session_key();

        tracing::debug!(
            proto = %proto,
            server = %server_name,
            method = %request.method,
            session = %key,
            "dispatching request"
        );

        // The synthetic usage-guide tool is answered locally; the
        // subprocess is never contacted.
        if enrich::is_usage_tool_call(&request) {
            if let Some(guide) = &spec.usage_guide {
                return DispatchOutcome::ok(JsonRpcResponse::result(
                    caller_id,
                    enrich::usage_guide_result(guide),
                ));
            }
        }

        let outcome = if spec.is_stateful() && self.settings.stateful_enabled {
            self.dispatch_stateful(server_name, spec, request, key).await
        } else {
            self.dispatch_ephemeral(server_name, spec, request).await
        };

        match outcome {
            Ok(o) => o,
            Err(e) => {
                metrics::counter!("bridge_request_errors_total", 1, "proto" => proto.to_string());
                DispatchOutcome::from_error(caller_id, &e)
            }
        }
    }

    // -- ephemeral ----------------------------------------------------------

    /// Spawn-per-request: fresh workspace, fresh adapter, one exchange,
    /// teardown. The workspace stays on disk for the GC so download URLs
    /// remain valid within the expiry window.
    async fn dispatch_ephemeral(
        &self,
        server_name: &str,
        spec: &ServerSpec,
        mut request: JsonRpcRequest,
    ) -> Result<DispatchOutcome, BridgeError> {
        if request.is_notification() {
            // Nothing to deliver a notification to; accept and drop.
            return Ok(DispatchOutcome::accepted());
        }

        let workspace = self.workspaces.create().await.map_err(|e| {
            BridgeError::Internal(format!("workspace creation failed: {e}"))
        })?;
        let resolver = PathResolver::new(&workspace, spec, &self.settings.base_url);

        // Path escapes are rejected before the subprocess is even spawned.
        if let Some(params) = request.params.as_mut() {
            resolver.resolve_inbound(params)?;
        }

        let adapter = McpAdapter::spawn(
            server_name,
            &spec.command,
            &spec.resolved_args(&workspace.dir),
            &spec.resolved_env(&workspace.dir),
            &workspace.dir,
        )?;

        let reply = {
            let _permit = self.concurrency.acquire().await.map_err(|_| {
                BridgeError::Internal("concurrency semaphore closed".to_string())
            })?;
            adapter
                .call(
                    &request.method,
                    request.params.clone(),
                    self.settings.request_timeout,
                )
                .await
        };
        adapter.close().await;

        let reply = reply?;
        Ok(DispatchOutcome::ok(self.render_reply(
            request.id, &request.method, reply, &resolver, spec,
        )))
    }

    // -- stateful -----------------------------------------------------------

    async fn dispatch_stateful(
        &self,
        server_name: &str,
        spec: &ServerSpec,
        request: JsonRpcRequest,
        key: SessionKey,
    ) -> Result<DispatchOutcome, BridgeError> {
        let session = self
            .registry
            .acquire(server_name, spec, key, &self.settings, &self.workspaces)
            .await?;

        let outcome = self.exchange_stateful(spec, &session, request).await;
        self.registry.release(&session).await;
        outcome
    }

    /// One exchange against an acquired session. Split out so that
    /// `release` always runs.
    async fn exchange_stateful(
        &self,
        spec: &ServerSpec,
        session: &Arc<crate::session::Session>,
        mut request: JsonRpcRequest,
    ) -> Result<DispatchOutcome, BridgeError> {
        let resolver = PathResolver::new(&session.workspace, spec, &self.settings.base_url);
        if let Some(params) = request.params.as_mut() {
            resolver.resolve_inbound(params)?;
        }

        if request.is_notification() {
            session.adapter.notify(&request.method, request.params)?;
            return Ok(DispatchOutcome::accepted());
        }

        // Per-session FIFO lock: calls reach the subprocess in arrival
        // order. The global semaphore is taken inside the session lock so
        // a saturated bridge cannot reorder a session's queue.
        let reply = {
            let _guard = session.lock_for_call().await;
            let _permit = self.concurrency.acquire().await.map_err(|_| {
                BridgeError::Internal("concurrency semaphore closed".to_string())
            })?;
            session
                .adapter
                .call(
                    &request.method,
                    request.params.clone(),
                    self.settings.request_timeout,
                )
                .await?
        };

        Ok(DispatchOutcome::ok(self.render_reply(
            request.id, &request.method, reply, &resolver, spec,
        )))
    }

    // -- shared -------------------------------------------------------------

    /// Map a subprocess reply onto the caller's envelope: upstream errors
    /// forward verbatim; results get enriched (tools-shaped) or annotated
    /// with download URLs.
    fn render_reply(
        &self,
        caller_id: Option<serde_json::Value>,
        method: &str,
        reply: CallReply,
        resolver: &PathResolver<'_>,
        spec: &ServerSpec,
    ) -> JsonRpcResponse {
        match reply {
            CallReply::Error(upstream) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: caller_id,
                result: None,
                error: Some(upstream),
            },
            CallReply::Result(mut value) => {
                let enriched = match &spec.usage_guide {
                    Some(guide) => enrich::enrich_tools_result(&mut value, guide),
                    None => false,
                };
                if !enriched && method != METHOD_TOOLS_LIST {
                    resolver.annotate_outbound(&mut value);
                }
                JsonRpcResponse::result(caller_id, value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity {
            user_id: Some("u".to_string()),
            chat_id: Some("c".to_string()),
            remote_addr: "127.0.0.1".to_string(),
        }
    }

    /// Build a dispatcher around one catalog entry described by `server`.
    fn build(server: serde_json::Value, settings: Settings) -> (tempfile::TempDir, Dispatcher) {
        let tmp = tempfile::tempdir().unwrap();
        let catalog: ServerCatalog =
            serde_json::from_value(json!({ "mcpServers": { "pp": server } })).unwrap();
        let registry = SessionRegistry::new(&settings);
        let workspaces = WorkspaceManager::new(tmp.path()).unwrap();
        let dispatcher = Dispatcher::new(settings, catalog, registry, workspaces);
        (tmp, dispatcher)
    }

    /// Shell one-liner replying to request N with id N and a tools payload.
    fn tools_script() -> &'static str {
        r#"i=0; while read -r line; do i=$((i+1)); printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"echo"}]}}\n' "$i"; done"#
    }

    #[tokio::test]
    async fn test_unknown_server_is_404() {
        let (_tmp, dispatcher) = build(json!({ "command": "cat" }), Settings::default());
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "nope",
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 404);
        let body = outcome.body.unwrap();
        assert!(body.error.unwrap().message.contains("Unknown server"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (_tmp, dispatcher) = build(json!({ "command": "cat" }), Settings::default());
        let outcome = dispatcher
            .dispatch("mcp", "pp", b"{not json", &identity())
            .await;
        assert_eq!(outcome.status, 400);
        assert_eq!(
            outcome.body.unwrap().error.unwrap().code,
            crate::rpc::PARSE_ERROR
        );
    }

    #[tokio::test]
    async fn test_caller_id_is_remapped_onto_response() {
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", tools_script()] }),
            Settings::default(),
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 200);
        let body = outcome.body.unwrap();
        // The subprocess saw the adapter's id 1; the caller gets 7 back.
        assert_eq!(body.id, Some(json!(7)));
        assert!(body.result.is_some());
    }

    #[tokio::test]
    async fn test_tools_list_gets_enriched() {
        let (_tmp, dispatcher) = build(
            json!({
                "command": "sh",
                "args": ["-c", tools_script()],
                "usage_guide": "HELLO"
            }),
            Settings::default(),
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        let body = outcome.body.unwrap();
        let tools = body.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[1]["name"], enrich::USAGE_TOOL_NAME);
        assert_eq!(tools[1]["description"], "HELLO");
    }

    #[tokio::test]
    async fn test_usage_tool_short_circuits_without_spawning() {
        // The command does not exist: any spawn attempt would surface as an
        // error, so a successful response proves the short-circuit.
        let (_tmp, dispatcher) = build(
            json!({
                "command": "/nonexistent/mcp-server-binary",
                "usage_guide": "HELLO"
            }),
            Settings::default(),
        );
        let body = format!(
            r#"{{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{{"name":"{}","arguments":{{}}}}}}"#,
            enrich::USAGE_TOOL_NAME
        );
        let outcome = dispatcher
            .dispatch("mcp", "pp", body.as_bytes(), &identity())
            .await;
        assert_eq!(outcome.status, 200);
        let body = outcome.body.unwrap();
        assert_eq!(body.id, Some(json!(9)));
        assert_eq!(body.result.unwrap()["content"][0]["text"], "HELLO");
    }

    #[tokio::test]
    async fn test_path_escape_rejected_before_spawn() {
        // Again a missing binary: reaching the spawn would change the error
        // kind, so an invalid-params error proves the early rejection.
        let (_tmp, dispatcher) = build(
            json!({
                "command": "/nonexistent/mcp-server-binary",
                "resolve_path_fields": ["filepath"]
            }),
            Settings::default(),
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t","arguments":{"filepath":"../escape.txt"}}}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 200);
        let error = outcome.body.unwrap().error.unwrap();
        assert_eq!(error.code, crate::rpc::INVALID_PARAMS);
        assert!(error.message.contains("escape"));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_as_internal_error() {
        let (_tmp, dispatcher) = build(
            json!({ "command": "/nonexistent/mcp-server-binary" }),
            Settings::default(),
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 200);
        let error = outcome.body.unwrap().error.unwrap();
        assert_eq!(error.code, crate::rpc::INTERNAL_ERROR);
        assert!(error.message.contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_504() {
        let settings = Settings {
            request_timeout: std::time::Duration::from_millis(50),
            ..Settings::default()
        };
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", "while read -r line; do :; done"] }),
            settings,
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 504);
        assert_eq!(
            outcome.body.unwrap().error.unwrap().code,
            crate::rpc::REQUEST_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_capacity_exceeded_maps_to_503() {
        let settings = Settings {
            max_total_processes: 0,
            ..Settings::default()
        };
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", tools_script()], "mode": "stateful" }),
            settings,
        );
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 503);
    }

    #[tokio::test]
    async fn test_ephemeral_calls_get_distinct_workspaces() {
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", tools_script()] }),
            Settings::default(),
        );
        for _ in 0..2 {
            let outcome = dispatcher
                .dispatch(
                    "mcp",
                    "pp",
                    br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                    &identity(),
                )
                .await;
            assert_eq!(outcome.status, 200);
        }
        // Two requests, two workspace directories left for the GC.
        let dirs = std::fs::read_dir(dispatcher.workspaces().root())
            .unwrap()
            .count();
        assert_eq!(dirs, 2);
    }

    #[tokio::test]
    async fn test_stateful_requests_share_a_session() {
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", tools_script()], "mode": "stateful" }),
            Settings::default(),
        );
        for _ in 0..3 {
            let outcome = dispatcher
                .dispatch(
                    "mcp",
                    "pp",
                    br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                    &identity(),
                )
                .await;
            assert_eq!(outcome.status, 200);
        }
        assert_eq!(dispatcher.registry().live_count().await, 1);
        // One session, one workspace.
        let dirs = std::fs::read_dir(dispatcher.workspaces().root())
            .unwrap()
            .count();
        assert_eq!(dirs, 1);
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_body() {
        let (_tmp, dispatcher) = build(
            json!({ "command": "sh", "args": ["-c", tools_script()], "mode": "stateful" }),
            Settings::default(),
        );
        // Establish the session first.
        dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#,
                &identity(),
            )
            .await;
        let outcome = dispatcher
            .dispatch(
                "mcp",
                "pp",
                br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                &identity(),
            )
            .await;
        assert_eq!(outcome.status, 204);
        assert!(outcome.body.is_none());
    }
}
