//! Docker-backed container adapter for the Kappa runtime.
//!
//! `DockerSandbox` hides the engine behind the small [`Sandbox`] surface:
//! create, start (leftover removal, image pull, bind mounts, log pumps),
//! stop with signal escalation, and best-effort removal that also deletes
//! any registered temp directories. One shared [`Docker`] client serves the
//! whole process.

use std::sync::Arc;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::Docker;
use thiserror::Error;

use kappa_common::{Sandbox, SandboxConfig, SandboxFactory};

pub mod container;
pub mod runtime;

pub use bollard;
pub use container::DockerSandbox;
pub use runtime::{Language, RuntimeSpec, RuntimeTemplate};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox config: {0}")]
    InvalidConfig(String),
    #[error("Image pull failed: {0}")]
    PullFailed(#[source] BollardError),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container stop failed: {0}")]
    StopFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("Internal sandbox error: {0}")]
    Internal(String),
}

impl From<SandboxError> for kappa_common::Error {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::InvalidConfig(msg) => kappa_common::Error::Config(msg),
            other => kappa_common::Error::Engine(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Engine 404s are benign on the stop/remove paths: the process (or the
/// whole container) is already gone.
pub(crate) fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Builds [`DockerSandbox`] handles over one shared engine connection.
#[derive(Clone)]
pub struct DockerSandboxFactory {
    docker: Arc<Docker>,
}

impl DockerSandboxFactory {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl SandboxFactory for DockerSandboxFactory {
    async fn create(&self, config: SandboxConfig) -> kappa_common::Result<Arc<dyn Sandbox>> {
        let sandbox = DockerSandbox::create(self.docker.clone(), config)?;
        Ok(Arc::new(sandbox))
    }
}
