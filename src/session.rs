//! Session keys and the stateful session registry
//!
//! A stateful server keeps one subprocess per `(server_name, session_key)`
//! alive across requests. The registry owns that map: it locates or creates
//! sessions under global and per-key caps, tracks in-flight requests and
//! idle time, serializes calls within a session through a per-session lock,
//! and drops entries when their adapter dies or the GC reaps them.
//!
//! The registry map sits behind one lock; per-session state is behind the
//! session's own lock so one busy session never serializes the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::adapter::McpAdapter;
use crate::config::{ServerSpec, Settings};
use crate::error::BridgeError;
use crate::workspace::{Workspace, WorkspaceManager};

/// Routing key for stateful sessions, derived from identity headers.
///
/// Both identity headers present (and non-empty) bind the session to the
/// user+chat pair; otherwise the client IP is the key. Derivation is
/// deterministic: same headers, same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Both identity headers were present.
    User {
        /// Value of `X-OpenWebUI-User-Id`.
        user_id: String,
        /// Value of `X-OpenWebUI-Chat-Id`.
        chat_id: String,
    },
    /// Fallback: the client address.
    Ip(String),
}

impl SessionKey {
    /// Derive the key from optional identity headers with an IP fallback.
    /// Empty-string headers are treated as absent.
    pub fn derive(user_id: Option<&str>, chat_id: Option<&str>, remote_addr: &str) -> Self {
        fn clean(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|s| !s.is_empty())
        }
        match (clean(user_id), clean(chat_id)) {
            (Some(user), Some(chat)) => SessionKey::User {
                user_id: user.to_string(),
                chat_id: chat.to_string(),
            },
            _ => SessionKey::Ip(remote_addr.to_string()),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::User { user_id, chat_id } => {
                write!(f, "user:{user_id}:chat:{chat_id}")
            }
            SessionKey::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

type RegistryKey = (String, SessionKey);

/// One live stateful session: a subprocess bound to a session key.
#[derive(Debug)]
pub struct Session {
    /// Catalog name of the server this session runs.
    pub server: String,
    /// The routing key this session is bound to.
    pub key: SessionKey,
    /// The session's private job directory.
    pub workspace: Workspace,
    /// The subprocess proxy.
    pub adapter: Arc<McpAdapter>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Idle window after which the GC may reap this session.
    pub idle_timeout: Duration,
    last_active: std::sync::Mutex<Instant>,
    in_flight: AtomicUsize,
    call_lock: Mutex<()>,
}

impl Session {
    /// Update the activity timestamp (request enter and exit).
    pub fn touch(&self) {
        *self.last_active.lock().expect("last_active lock poisoned") = Instant::now();
    }

    /// Time since the last request entered or exited.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("last_active lock poisoned")
            .elapsed()
    }

    /// Requests currently inside the dispatcher for this session.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Acquire the per-session call lock. Tokio mutexes wake waiters in
    /// FIFO order, so calls reach the subprocess in arrival order.
    pub async fn lock_for_call(&self) -> MutexGuard<'_, ()> {
        self.call_lock.lock().await
    }
}

/// The stateful session registry.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<RegistryKey, Arc<Session>>>,
    max_total: usize,
}

impl SessionRegistry {
    pub fn new(settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            max_total: settings.max_total_processes,
        })
    }

    /// Number of live sessions (for `/health`).
    pub async fn live_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Workspace ids currently owned by live sessions. The GC must never
    /// unlink these.
    pub async fn live_workspace_ids(&self) -> Vec<Uuid> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|s| s.workspace.id)
            .collect()
    }

    /// Locate or create the session for `(server_name, key)`.
    ///
    /// An existing live session is reused: its activity timestamp is
    /// touched and its in-flight count incremented. A dead entry whose
    /// in-flight count has drained is replaced; one still draining keeps
    /// its process slot occupied and the acquire fails with
    /// `CapacityExceeded` until it empties.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::CapacityExceeded`] when the global or per-key cap
    ///   is reached.
    /// - [`BridgeError::SpawnFailed`] when a fresh subprocess cannot be
    ///   launched (never retried within one request).
    pub async fn acquire(
        self: &Arc<Self>,
        server_name: &str,
        spec: &ServerSpec,
        key: SessionKey,
        settings: &Settings,
        workspaces: &WorkspaceManager,
    ) -> Result<Arc<Session>, BridgeError> {
        let registry_key = (server_name.to_string(), key.clone());
        let mut sessions = self.sessions.lock().await;

        let mut occupied_by_draining = 0usize;
        if let Some(existing) = sessions.get(&registry_key) {
            if existing.adapter.is_alive() {
                existing.touch();
                existing.in_flight.fetch_add(1, Ordering::SeqCst);
                return Ok(Arc::clone(existing));
            }
            if existing.in_flight() > 0 {
                // The dead session still has requests draining; its process
                // slot stays occupied until they finish.
                occupied_by_draining = 1;
            } else {
                sessions.remove(&registry_key);
            }
        }

        if occupied_by_draining >= spec.effective_max_per_session(settings) {
            return Err(BridgeError::CapacityExceeded(format!(
                "session {key} already holds {occupied_by_draining} process(es) for `{server_name}`"
            )));
        }
        if sessions.len() >= self.max_total {
            return Err(BridgeError::CapacityExceeded(format!(
                "global stateful process cap ({}) reached",
                self.max_total
            )));
        }

        let workspace = workspaces
            .create()
            .await
            .map_err(|e| BridgeError::Internal(format!("workspace creation failed: {e}")))?;
        let adapter = McpAdapter::spawn(
            server_name,
            &spec.command,
            &spec.resolved_args(&workspace.dir),
            &spec.resolved_env(&workspace.dir),
            &workspace.dir,
        )?;

        let session = Arc::new(Session {
            server: server_name.to_string(),
            key: key.clone(),
            workspace,
            adapter,
            created_at: Utc::now(),
            idle_timeout: spec.effective_idle_timeout(settings),
            last_active: std::sync::Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(1),
            call_lock: Mutex::new(()),
        });
        sessions.insert(registry_key.clone(), Arc::clone(&session));
        metrics::gauge!("bridge_sessions_active", sessions.len() as f64);
        drop(sessions);

        tracing::info!(
            server = %server_name,
            session = %key,
            workspace = %session.workspace.id,
            "spawned stateful session"
        );

        // Drop the entry when the adapter dies spontaneously so the next
        // acquire respawns.
        let registry = Arc::clone(self);
        let died = session.adapter.died();
        let entry = Arc::clone(&session);
        tokio::spawn(async move {
            died.cancelled().await;
            registry.remove_if_current(&registry_key, &entry).await;
        });

        Ok(session)
    }

    /// Mark a request as finished with this session.
    pub async fn release(self: &Arc<Self>, session: &Arc<Session>) {
        session.in_flight.fetch_sub(1, Ordering::SeqCst);
        session.touch();
        if !session.adapter.is_alive() && session.in_flight() == 0 {
            let key = (session.server.clone(), session.key.clone());
            self.remove_if_current(&key, session).await;
        }
    }

    /// Reap sessions idle past their timeout with no in-flight requests.
    /// Returns the workspace ids of reaped sessions; their directories age
    /// out of the jobs root separately, within the file-expiry window.
    pub async fn reap(&self) -> Vec<Uuid> {
        let mut reaped = Vec::new();
        let mut to_close = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|(server, key), session| {
                let expired =
                    session.in_flight() == 0 && session.idle_for() > session.idle_timeout;
                if expired {
                    tracing::info!(
                        server = %server,
                        session = %key,
                        workspace = %session.workspace.id,
                        "reaping idle session"
                    );
                    reaped.push(session.workspace.id);
                    to_close.push(Arc::clone(session));
                }
                !expired
            });
            metrics::gauge!("bridge_sessions_active", sessions.len() as f64);
        }
        for session in to_close {
            session.adapter.close().await;
        }
        reaped
    }

    /// Close every session. Used during bridge shutdown; workspaces are
    /// left on disk for external cleanup.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let all = sessions.drain().map(|(_, v)| v).collect();
            metrics::gauge!("bridge_sessions_active", 0.0);
            all
        };
        for session in drained {
            session.adapter.close().await;
        }
    }

    /// Remove the entry for `key` if it is still `entry` and has drained.
    async fn remove_if_current(&self, key: &RegistryKey, entry: &Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(current) = sessions.get(key) {
            if Arc::ptr_eq(current, entry) && current.in_flight() == 0 {
                sessions.remove(key);
                metrics::gauge!("bridge_sessions_active", sessions.len() as f64);
                tracing::debug!(server = %key.0, session = %key.1, "removed dead session entry");
            }
        }
    }
}
