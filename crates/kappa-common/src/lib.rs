//! Shared types for the Kappa runtime: the invocation envelope crossing the
//! supervisor/container boundary, the sandbox traits implemented by the
//! container adapter, the common error taxonomy, and the bounded log ring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod logs;

pub use logs::LogBuffer;

// --- Error taxonomy ---

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Function startup failed: {0}")]
    Startup(String),

    #[error("Invocation transport failed: {0}")]
    InvocationTransport(String),

    #[error("Invocation timed out after {0:?}")]
    InvocationTimeout(Duration),

    #[error("Handler response invalid: {0}")]
    HandlerFailure(String),

    #[error("Dependency install timed out after {0:?}")]
    DependencyInstallTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// --- Invocation envelope ---

/// Event delivered to the in-container handler. The whole inbound HTTP body
/// becomes `body`; the remaining fields are filled by the gateway from the
/// request line, headers and query string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationEvent {
    pub body: serde_json::Value,
    pub path: String,
    pub http_method: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub request_id: String,
}

/// Response returned by the in-container handler. `status_code` is the
/// business status; the invocation transport itself reports 200 whenever the
/// handler completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
    pub request_id: String,
}

impl Default for InvocationResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            body: serde_json::Value::Null,
            request_id: String::new(),
        }
    }
}

// --- Sandbox seam ---

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Configuration for one container sandbox. `name` doubles as the engine-side
/// container name, so it must be unique per live container.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<BindMount>,
    /// Kill and remove a leftover container of the same name before starting.
    pub remove_if_exists: bool,
    /// Remove a leftover `<name>-snapshot` layer before starting.
    pub remove_snapshot_if_exists: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub timeout: Duration,
    pub force_kill: bool,
    pub remove_on_stop: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            force_kill: false,
            remove_on_stop: false,
        }
    }
}

pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One live (or startable) container. Implementations own the engine-side
/// resources and must release all of them — container, snapshot layer,
/// registered temp directories — on `stop` with `remove_on_stop`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Bring the container up. Idempotence is not required; callers start a
    /// sandbox exactly once.
    async fn start(&self) -> Result<()>;

    /// Signal, await exit up to `opts.timeout`, escalate to a hard kill on
    /// expiry. Engine "not found" responses on this path are benign.
    async fn stop(&self, opts: StopOptions) -> Result<()>;

    /// Block until the container process exits; returns its exit code.
    async fn wait(&self) -> Result<i64>;

    /// Replay buffered lines to `callback`, then keep invoking it for every
    /// future line.
    fn stream_logs(&self, callback: LogCallback);

    /// Stable copy of the buffered log lines.
    fn logs(&self) -> Vec<String>;

    /// Queue a host directory for deletion when the sandbox is removed.
    fn register_tmp_dir(&self, path: PathBuf);
}

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Validate `config` and build a sandbox handle. Engine resources are not
    /// allocated until `start`.
    async fn create(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>>;
}
