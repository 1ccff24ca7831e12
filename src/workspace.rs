//! Per-session job workspaces
//!
//! Every session (and every ephemeral request) gets a private directory
//! under the configured jobs root, named by a fresh UUIDv4. Subprocesses
//! run with the workspace as their working directory and emit files into
//! it; download URLs point back into it. The manager owns creation,
//! containment checks, expiry scanning, and guarded deletion.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// A single job workspace: `{root}/{uuid}`.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// The job identifier; also the directory basename.
    pub id: Uuid,
    /// Absolute path of the workspace directory.
    pub dir: PathBuf,
}

impl Workspace {
    /// Lexical containment: true when `path` is this workspace or a
    /// descendant of it, without consulting the filesystem. Rejects any
    /// path containing a `..` component outright.
    pub fn contains_lexically(&self, path: &Path) -> bool {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        path.starts_with(&self.dir)
    }

    /// Filesystem containment: true when `path` names an existing file or
    /// directory whose canonical form lives inside the workspace. Symlinks
    /// pointing out of the workspace fail this check.
    pub fn contains_existing(&self, path: &Path) -> bool {
        let canonical_ws = match self.dir.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match path.canonicalize() {
            Ok(p) => p.starts_with(&canonical_ws),
            Err(_) => false,
        }
    }
}

/// Allocates and lifecycle-manages workspaces under a root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager over `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// The workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh workspace with a new UUIDv4.
    pub async fn create(&self) -> Result<Workspace> {
        let id = Uuid::new_v4();
        let dir = self.root.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        // Keep job directories private between sessions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = tokio::fs::set_permissions(&dir, perms).await;
        }

        tracing::debug!(workspace = %id, dir = %dir.display(), "created workspace");
        Ok(Workspace { id, dir })
    }

    /// Remove a workspace directory by id. Missing directories are not an
    /// error; a second removal is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Internal`] when the computed path would fall
    /// outside the root (never expected for a UUID-derived name).
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let dir = self.root.join(id.to_string());
        if !dir.starts_with(&self.root) {
            return Err(BridgeError::Internal(format!(
                "refusing to remove {} outside jobs root",
                dir.display()
            ))
            .into());
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(workspace = %id, "removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scan the root for workspace directories whose last modification is
    /// older than `ttl`. Entries that are not UUID-named directories are
    /// skipped.
    pub fn scan_expired(&self, ttl: Duration) -> Vec<Uuid> {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), "cannot scan jobs root: {e}");
                return expired;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(id) = Uuid::parse_str(name) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            let modified = meta.modified().unwrap_or(now);
            if now.duration_since(modified).unwrap_or_default() > ttl {
                expired.push(id);
            }
        }
        expired
    }
}
