//! Subprocess stdio plumbing for MCP servers
//!
//! This module owns the child process itself: spawning with piped stdio,
//! newline-delimited JSON framing in both directions, stderr draining, and
//! termination. The JSON-RPC layer above it lives in [`super::McpAdapter`].
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by a newline (`\n`).
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line (newline stripped before delivery). Partial lines are buffered by
//!   the reader until terminated.
//! - The child's stderr is drained and logged via `tracing::debug!`. Per the
//!   MCP specification, stderr output MUST NOT be treated as an error
//!   condition.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::BridgeError;

/// How long a graceful termination signal gets before the forceful kill.
pub const TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// A spawned MCP server subprocess with wired stdio pipes.
///
/// Created via [`StdioProcess::spawn`], which also hands back the stdout
/// line receiver; the caller (the adapter read loop) owns inbound traffic.
/// Three background Tokio tasks are started immediately: a stdin writer, a
/// stdout reader, and a stderr drain.
#[derive(Debug)]
pub struct StdioProcess {
    /// Sender side of the stdin channel; `send()` writes here.
    stdin_tx: mpsc::UnboundedSender<String>,
    /// Handle to the spawned child process; used for termination.
    child: Arc<Mutex<Child>>,
    /// Catalog name, for log context.
    label: String,
}

impl StdioProcess {
    /// Spawn a child process and wire up stdio pipes.
    ///
    /// The child inherits the bridge's environment with `env` overlaid on
    /// top, and runs with `workdir` as its working directory.
    ///
    /// # Returns
    ///
    /// The process handle and the receiver of stdout lines (one complete
    /// JSON message per item). The receiver yields `None` on stdout EOF,
    /// which the adapter treats as termination.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SpawnFailed`] if the process cannot be
    /// spawned or a stdio pipe is unavailable.
    pub fn spawn(
        label: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), BridgeError> {
        let spawn_err = |message: String| BridgeError::SpawnFailed {
            server: label.to_string(),
            message,
        };

        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        cmd.current_dir(workdir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_err(format!("failed to spawn `{command}`: {e}")))?;

        // Take ownership of all three stdio handles. Each is guaranteed to
        // be Some because we set Stdio::piped() above.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("child stderr unavailable after spawn".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();

        // Background task: forward stdin_rx -> child stdin. One writer task
        // means stdin writes are serialized and each line stays atomic.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stdout -> stdout_tx.
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stderr into the log.
        let stderr_label = label.to_string();
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %stderr_label, "mcp server stderr: {}", line);
            }
        });

        Ok((
            Self {
                stdin_tx,
                child: Arc::new(Mutex::new(child)),
                label: label.to_string(),
            },
            stdout_rx,
        ))
    }

    /// Enqueue a JSON-RPC message for the child's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the writer task has exited
    /// (the channel is closed).
    pub fn send(&self, message: String) -> Result<(), BridgeError> {
        self.stdin_tx
            .send(message)
            .map_err(|_| BridgeError::Transport("stdin channel closed".to_string()))
    }

    /// Terminate the child: graceful signal, a short grace period, then a
    /// forceful kill. Idempotent; a second call observes the exited child
    /// and returns.
    pub async fn terminate(&self) {
        let mut child = self.child.lock().await;

        // Already gone?
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(server = %self.label, "grace period expired; killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

impl Drop for StdioProcess {
    /// Best-effort termination of the child process on drop.
    ///
    /// On Unix, sends SIGTERM to the child PID via `libc::kill`. On
    /// non-Unix platforms, calls `start_kill()` on the child handle. This
    /// method MUST NOT block; it is fire-and-forget.
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
    }
}
