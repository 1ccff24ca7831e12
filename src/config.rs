//! Configuration management for the bridge
//!
//! This module handles loading, parsing, and validating the server catalog
//! (a JSON document with a top-level `mcpServers` object) and resolving the
//! runtime settings from environment variables with CLI overrides.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Template token substituted with the workspace absolute path at spawn time.
pub const WORKDIR_TOKEN: &str = "{WORKDIR}";

/// Execution mode of a catalog server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Spawn-per-request; the subprocess is terminated after one exchange.
    #[default]
    Ephemeral,
    /// Retained across requests for a session key until idle-reaped.
    Stateful,
}

/// One named server in the catalog.
///
/// Unrecognized fields are rejected so that a typo in a catalog key fails
/// loudly at load time instead of silently changing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSpec {
    /// Executable to launch.
    pub command: String,

    /// Command-line arguments; values may contain [`WORKDIR_TOKEN`].
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay for the subprocess; values may contain
    /// [`WORKDIR_TOKEN`].
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Ephemeral (default) or stateful execution.
    #[serde(default)]
    pub mode: ServerMode,

    /// Seconds of inactivity before a stateful session is reaped. Falls back
    /// to `STATEFUL_DEFAULT_IDLE_TIMEOUT` when absent.
    #[serde(default)]
    pub idle_timeout: Option<u64>,

    /// Hard cap on concurrent processes per session key for this server.
    /// Falls back to `STATEFUL_MAX_PROCESSES_PER_CHAT` when absent.
    #[serde(default)]
    pub max_processes_per_chat: Option<usize>,

    /// Whether stateful sessions survive between requests. Defaults to true;
    /// a stateful server with persistence disabled behaves ephemerally.
    #[serde(default = "default_session_persistence")]
    pub session_persistence: bool,

    /// JSON field names whose outbound string values name files to expose
    /// as downloads.
    #[serde(default)]
    pub file_path_fields: Vec<String>,

    /// JSON field names whose inbound string values are rewritten to
    /// workspace-absolute paths.
    #[serde(default)]
    pub resolve_path_fields: Vec<String>,

    /// Optional usage-guide text injected as a synthetic tool.
    #[serde(default)]
    pub usage_guide: Option<String>,
}

fn default_session_persistence() -> bool {
    true
}

impl ServerSpec {
    /// True when this server retains sessions across requests.
    pub fn is_stateful(&self) -> bool {
        self.mode == ServerMode::Stateful && self.session_persistence
    }

    /// Effective idle timeout for this server's sessions.
    pub fn effective_idle_timeout(&self, settings: &Settings) -> Duration {
        self.idle_timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.default_idle_timeout)
    }

    /// Effective per-session process cap for this server.
    pub fn effective_max_per_session(&self, settings: &Settings) -> usize {
        self.max_processes_per_chat
            .unwrap_or(settings.max_processes_per_chat)
    }

    /// Arguments with [`WORKDIR_TOKEN`] substituted.
    pub fn resolved_args(&self, workdir: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|a| substitute_workdir(a, workdir))
            .collect()
    }

    /// Environment overlay with [`WORKDIR_TOKEN`] substituted.
    pub fn resolved_env(&self, workdir: &Path) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), substitute_workdir(v, workdir)))
            .collect()
    }
}

/// Replace every occurrence of [`WORKDIR_TOKEN`] in `input` with the
/// workspace absolute path.
pub fn substitute_workdir(input: &str, workdir: &Path) -> String {
    input.replace(WORKDIR_TOKEN, &workdir.to_string_lossy())
}

/// The server catalog: a JSON document with a top-level `mcpServers` object.
///
/// # Examples
///
/// ```
/// use mcp_bridge::config::ServerCatalog;
///
/// let catalog: ServerCatalog = serde_json::from_str(
///     r#"{ "mcpServers": { "echo": { "command": "cat" } } }"#,
/// ).unwrap();
/// assert!(catalog.get("echo").is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCatalog {
    /// Servers keyed by name. A `BTreeMap` keeps listings stable.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerSpec>,
}

impl ServerCatalog {
    /// Load the catalog from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] when the file cannot be read or the
    /// document does not deserialize.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let catalog: ServerCatalog = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Look up a server by name.
    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.mcp_servers.get(name)
    }

    /// Validate structural constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.mcp_servers {
            if spec.command.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "server `{name}` has an empty command"
                ))
                .into());
            }
            if spec.max_processes_per_chat == Some(0) {
                return Err(BridgeError::Config(format!(
                    "server `{name}` has max_processes_per_chat = 0"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Apply the `STATEFUL_ENABLED` master switch: demote stateful servers
    /// to ephemeral when the switch is off.
    pub fn apply_master_switch(&mut self, stateful_enabled: bool) {
        if stateful_enabled {
            return;
        }
        for (name, spec) in self.mcp_servers.iter_mut() {
            if spec.mode == ServerMode::Stateful {
                tracing::warn!(
                    server = %name,
                    "stateful mode disabled by STATEFUL_ENABLED; demoting to ephemeral"
                );
                spec.mode = ServerMode::Ephemeral;
            }
        }
    }
}

/// Runtime settings resolved from the environment.
///
/// Each field corresponds to a recognised environment variable; every value
/// has a default so the bridge starts with no environment at all.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Prefix for download URLs (`BASE_URL`).
    pub base_url: Url,
    /// Path to the server catalog (`CONFIG_FILE`).
    pub config_file: PathBuf,
    /// Workspace root directory (`JOBS_DIR`).
    pub jobs_dir: PathBuf,
    /// Global cap on in-flight subprocess calls (`MAX_CONCURRENT`).
    pub max_concurrent: usize,
    /// Per-call timeout (`TIMEOUT`, seconds).
    pub request_timeout: Duration,
    /// Master switch for stateful sessions (`STATEFUL_ENABLED`).
    pub stateful_enabled: bool,
    /// Idle timeout for stateful sessions lacking a per-server value
    /// (`STATEFUL_DEFAULT_IDLE_TIMEOUT`, seconds).
    pub default_idle_timeout: Duration,
    /// Default per-key process cap (`STATEFUL_MAX_PROCESSES_PER_CHAT`).
    pub max_processes_per_chat: usize,
    /// Global cap on stateful sessions (`STATEFUL_MAX_TOTAL_PROCESSES`).
    pub max_total_processes: usize,
    /// GC sweep interval (`STATEFUL_CLEANUP_INTERVAL`, seconds).
    pub cleanup_interval: Duration,
    /// How long workspaces (and the download URLs into them) stay valid
    /// after their session ends.
    pub file_expiry: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            jobs_dir: PathBuf::from(DEFAULT_JOBS_DIR),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stateful_enabled: true,
            default_idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_processes_per_chat: 1,
            max_total_processes: DEFAULT_MAX_TOTAL_PROCESSES,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            file_expiry: Duration::from_secs(DEFAULT_FILE_EXPIRY_SECS),
        }
    }
}

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_CONFIG_FILE: &str = "config/servers.json";
const DEFAULT_JOBS_DIR: &str = "/tmp/mcp-bridge-jobs";
const DEFAULT_MAX_CONCURRENT: usize = 16;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_TOTAL_PROCESSES: usize = 32;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_FILE_EXPIRY_SECS: u64 = 3600;

impl Settings {
    /// Resolve settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] when a variable is present but does
    /// not parse (a malformed `BASE_URL`, a non-numeric `TIMEOUT`, ...).
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();
        Ok(Self {
            base_url: match std::env::var("BASE_URL") {
                Ok(raw) => Url::parse(&raw)
                    .map_err(|e| BridgeError::Config(format!("bad BASE_URL: {e}")))?,
                Err(_) => defaults.base_url,
            },
            config_file: env_path("CONFIG_FILE", defaults.config_file),
            jobs_dir: env_path("JOBS_DIR", defaults.jobs_dir),
            max_concurrent: env_parse("MAX_CONCURRENT", defaults.max_concurrent)?,
            request_timeout: Duration::from_secs(env_parse(
                "TIMEOUT",
                defaults.request_timeout.as_secs(),
            )?),
            stateful_enabled: env_bool("STATEFUL_ENABLED", defaults.stateful_enabled)?,
            default_idle_timeout: Duration::from_secs(env_parse(
                "STATEFUL_DEFAULT_IDLE_TIMEOUT",
                defaults.default_idle_timeout.as_secs(),
            )?),
            max_processes_per_chat: env_parse(
                "STATEFUL_MAX_PROCESSES_PER_CHAT",
                defaults.max_processes_per_chat,
            )?,
            max_total_processes: env_parse(
                "STATEFUL_MAX_TOTAL_PROCESSES",
                defaults.max_total_processes,
            )?,
            cleanup_interval: Duration::from_secs(env_parse(
                "STATEFUL_CLEANUP_INTERVAL",
                defaults.cleanup_interval.as_secs(),
            )?),
            file_expiry: defaults.file_expiry,
        })
    }
}

/// Read an env var and parse it, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| BridgeError::Config(format!("bad {key}: {e}")).into()),
        Err(_) => Ok(default),
    }
}

/// Read a boolean env var; accepts `true/false/1/0` (case-insensitive).
fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(BridgeError::Config(format!("bad {key}: {other}")).into()),
        },
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}
