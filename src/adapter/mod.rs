//! MCP process adapter
//!
//! An [`McpAdapter`] owns one MCP server subprocess and exposes one
//! operation: [`McpAdapter::call`], safe to invoke concurrently. Outbound
//! requests get a fresh monotonic id from a counter private to the adapter;
//! the caller's JSON-RPC id never reaches the subprocess (the dispatcher
//! remaps it back on the way out). A dedicated read loop resolves pending
//! waiters by id, so responses may arrive in any order.
//!
//! # Lifecycle
//!
//! States progress `Starting -> Ready -> Terminating -> Dead`; `Dead` is
//! absorbing. Teardown converges from every trigger (explicit close, stdout
//! EOF, subprocess exit, reader parse error, timeout circuit): stop writing,
//! fail every pending waiter, signal the child gracefully then forcefully,
//! then mark `Dead` and fire the death token.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::rpc::{JsonRpcError, JsonRpcRequest};

pub mod stdio;

use stdio::StdioProcess;

/// Sliding window over which call outcomes are tracked for the timeout
/// circuit.
const TIMEOUT_WINDOW: Duration = Duration::from_secs(60);

/// Minimum number of recent calls before the timeout circuit may trip.
const TIMEOUT_MIN_SAMPLE: usize = 4;

/// Adapter lifecycle states. Transitions are monotone; `Dead` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AdapterState {
    /// Spawned; no call has completed yet.
    Starting = 0,
    /// At least one call has completed successfully.
    Ready = 1,
    /// Teardown in progress; no new writes.
    Terminating = 2,
    /// Gone. Every pending waiter has been failed.
    Dead = 3,
}

impl AdapterState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AdapterState::Starting,
            1 => AdapterState::Ready,
            2 => AdapterState::Terminating,
            _ => AdapterState::Dead,
        }
    }
}

/// Outcome of one subprocess exchange: the JSON-RPC `result` member, or the
/// `error` member forwarded verbatim for the dispatcher to remap.
#[derive(Debug, Clone)]
pub enum CallReply {
    /// The response carried a `result`.
    Result(serde_json::Value),
    /// The response carried an `error`; forwarded to the caller untouched.
    Error(JsonRpcError),
}

type PendingMap = HashMap<u64, oneshot::Sender<CallReply>>;

/// Tracks recent call outcomes; trips when more than half of the calls in
/// the window timed out.
#[derive(Debug, Default)]
struct TimeoutTracker {
    outcomes: VecDeque<(Instant, bool)>,
}

impl TimeoutTracker {
    /// Record one call outcome. Returns true when the adapter should be
    /// torn down.
    fn record(&mut self, timed_out: bool) -> bool {
        let now = Instant::now();
        self.outcomes.push_back((now, timed_out));
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > TIMEOUT_WINDOW {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
        let total = self.outcomes.len();
        let timeouts = self.outcomes.iter().filter(|(_, t)| *t).count();
        total >= TIMEOUT_MIN_SAMPLE && timeouts * 2 > total
    }
}

/// In-process proxy owning one MCP server subprocess.
pub struct McpAdapter {
    server: String,
    state: AtomicU8,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingMap>>,
    process: StdioProcess,
    /// Cancels the read loop during explicit teardown.
    cancellation: CancellationToken,
    /// Fires once the adapter reaches `Dead`; registries subscribe to it.
    death: CancellationToken,
    timeouts: Mutex<TimeoutTracker>,
}

impl std::fmt::Debug for McpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpAdapter")
            .field("server", &self.server)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl McpAdapter {
    /// Spawn the subprocess and start the read loop.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SpawnFailed`] when the subprocess cannot be
    /// launched.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<Arc<Self>, BridgeError> {
        let (process, stdout_rx) = StdioProcess::spawn(server, command, args, env, workdir)?;

        let adapter = Arc::new(Self {
            server: server.to_string(),
            state: AtomicU8::new(AdapterState::Starting as u8),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            process,
            cancellation: CancellationToken::new(),
            death: CancellationToken::new(),
            timeouts: Mutex::new(TimeoutTracker::default()),
        });

        let reader = Arc::clone(&adapter);
        tokio::spawn(async move {
            reader.read_loop(stdout_rx).await;
        });

        tracing::debug!(server = %server, "adapter spawned");
        Ok(adapter)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True until teardown begins.
    pub fn is_alive(&self) -> bool {
        self.state() < AdapterState::Terminating
    }

    /// Token that fires when the adapter reaches `Dead`. Registries use it
    /// to drop their entry on spontaneous death.
    pub fn died(&self) -> CancellationToken {
        self.death.clone()
    }

    /// Monotone state advance; never goes backwards.
    fn advance(&self, to: AdapterState) {
        self.state.fetch_max(to as u8, Ordering::SeqCst);
    }

    /// Issue one JSON-RPC request and await the matching response.
    ///
    /// Safe to call concurrently; writes are serialized by the stdin writer
    /// task and responses are correlated by id.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::AdapterTerminated`] when the adapter is (or goes)
    ///   down before the response arrives.
    /// - [`BridgeError::Timeout`] when `deadline` expires first. The
    ///   subprocess is not killed for a single timeout, but a majority of
    ///   timeouts within the tracking window tears the adapter down.
    /// - [`BridgeError::Serialization`] when the request does not encode.
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<CallReply, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::AdapterTerminated(format!(
                "adapter for `{}` is {:?}",
                self.server,
                self.state()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register the waiter before sending so the response can never
        // arrive before we are ready to receive it.
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let message = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params,
        })?;

        if let Err(e) = self.process.send(message) {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        // Teardown may have cleared the pending table between our insert
        // and the write; re-check so the waiter is not stranded.
        if !self.is_alive() {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::AdapterTerminated(format!(
                "adapter for `{}` terminated before the call was issued",
                self.server
            )));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => {
                self.record_outcome(false).await;
                self.advance_ready();
                Ok(reply)
            }
            Ok(Err(_)) => Err(BridgeError::AdapterTerminated(format!(
                "adapter for `{}` terminated with the call pending",
                self.server
            ))),
            Err(_) => {
                // Deadline expired: forget the waiter; a late response is
                // dropped by the read loop as unknown.
                self.pending.lock().await.remove(&id);
                self.record_outcome(true).await;
                Err(BridgeError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    /// Forward a JSON-RPC notification (no id, no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdapterTerminated`] when the adapter is down,
    /// or [`BridgeError::Transport`] when the writer has exited.
    pub fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::AdapterTerminated(format!(
                "adapter for `{}` is {:?}",
                self.server,
                self.state()
            )));
        }
        let message = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        })?;
        self.process.send(message)
    }

    /// Explicit teardown. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        self.teardown("closed").await;
    }

    /// Starting -> Ready on the first completed call.
    fn advance_ready(&self) {
        let _ = self.state.compare_exchange(
            AdapterState::Starting as u8,
            AdapterState::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    async fn record_outcome(self: &Arc<Self>, timed_out: bool) {
        let trip = self.timeouts.lock().await.record(timed_out);
        if trip {
            tracing::warn!(
                server = %self.server,
                "over half of recent calls timed out; tearing adapter down"
            );
            self.teardown("timeout circuit").await;
        }
    }

    /// All teardown triggers converge here: mark `Terminating`, stop the
    /// read loop, fail every pending waiter, signal the child, mark `Dead`.
    async fn teardown(self: &Arc<Self>, reason: &str) {
        let prev = self.state.swap(AdapterState::Terminating as u8, Ordering::SeqCst);
        if prev >= AdapterState::Terminating as u8 {
            // Another path is already tearing down; keep Dead absorbing.
            self.state.fetch_max(prev, Ordering::SeqCst);
            return;
        }

        tracing::debug!(server = %self.server, reason = %reason, "adapter teardown");
        self.cancellation.cancel();

        // Fail every pending waiter with a distinct terminated error: the
        // oneshot senders are dropped and callers observe RecvError.
        let drained: usize = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if drained > 0 {
            tracing::warn!(
                server = %self.server,
                pending = drained,
                "failed pending calls during teardown"
            );
        }

        self.process.terminate().await;
        self.advance(AdapterState::Dead);
        self.death.cancel();
    }

    /// Dedicated stdout reader: decodes one JSON object per line and
    /// resolves the matching pending waiter. Loop exit (EOF, cancellation,
    /// parse error) flows into teardown.
    async fn read_loop(self: Arc<Self>, mut stdout_rx: mpsc::UnboundedReceiver<String>) {
        let reason = loop {
            tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => break "cancelled",

                maybe_line = stdout_rx.recv() => {
                    let raw = match maybe_line {
                        Some(l) => l,
                        None => break "stdout EOF",
                    };
                    if self.dispatch_line(&raw).await.is_err() {
                        break "parse error";
                    }
                }
            }
        };
        self.teardown(reason).await;
    }

    /// Classify and dispatch one inbound line.
    ///
    /// Responses resolve their waiter; unmatched response ids are dropped
    /// with a warning; notifications are logged and discarded. A line that
    /// is not JSON is a framing failure and poisons the adapter.
    async fn dispatch_line(&self, raw: &str) -> Result<(), ()> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(server = %self.server, "unparseable line from subprocess: {e}");
                return Err(());
            }
        };

        let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);
        let has_method = value.get("method").is_some();
        let has_payload = value.get("result").is_some() || value.get("error").is_some();

        if has_id && has_payload && !has_method {
            self.resolve_response(value).await;
        } else if has_method && !has_id {
            let method = value.get("method").and_then(|m| m.as_str()).unwrap_or("");
            tracing::debug!(server = %self.server, method = %method, "server notification discarded");
        } else {
            tracing::debug!(server = %self.server, "unclassifiable message from subprocess; ignoring");
        }
        Ok(())
    }

    async fn resolve_response(&self, value: serde_json::Value) {
        let id = match value.get("id").and_then(|v| v.as_u64()) {
            Some(n) => n,
            None => {
                tracing::warn!(server = %self.server, "response with non-integer id; dropping");
                return;
            }
        };

        let tx = self.pending.lock().await.remove(&id);
        let Some(tx) = tx else {
            tracing::warn!(server = %self.server, id, "response for unknown id; dropping");
            return;
        };

        let reply = if let Some(error_val) = value.get("error") {
            match serde_json::from_value::<JsonRpcError>(error_val.clone()) {
                Ok(e) => CallReply::Error(e),
                Err(_) => CallReply::Error(JsonRpcError {
                    code: crate::rpc::INTERNAL_ERROR,
                    message: format!("malformed error object: {error_val}"),
                    data: None,
                }),
            }
        } else {
            CallReply::Result(
                value
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            )
        };

        // Ignore send errors: the caller may have already timed out.
        let _ = tx.send(reply);
    }
}
