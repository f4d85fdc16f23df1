//! Language runtime templates.
//!
//! A template maps `language` + `version` to the image, entry file, command
//! and shared cache mounts of an invocation container. The nodejs template
//! carries a real setup step: a throwaway container runs `npm install`
//! against the caller's `package.json`, filling a host cache directory that
//! invocation containers then mount read-only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kappa_common::{BindMount, Error, SandboxConfig, SandboxFactory, StopOptions};

/// Shared language caches live here unless `KAPPA_RUNTIME_DIR` says otherwise.
pub const DEFAULT_CACHE_ROOT: &str = "/var/kappa/runtimes";

/// Hard budget for the dependency-install container.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const SETUP_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn cache_root() -> PathBuf {
    std::env::var_os("KAPPA_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Nodejs,
    Golang,
    Python,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Language::Nodejs => "nodejs",
            Language::Golang => "golang",
            Language::Python => "python",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeTemplate {
    pub language: Language,
    pub version: String,
    /// Dependency manifest consumed by the nodejs setup step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_json: Option<String>,
}

/// A resolved template: everything the instance needs to build its container.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub image: String,
    /// File name the user artifact is staged as under `/app`.
    pub entry: String,
    pub command: Vec<String>,
    pub mounts: Vec<BindMount>,
    pub env: Vec<String>,
}

impl RuntimeTemplate {
    pub fn resolve(&self, cache_root: &Path) -> RuntimeSpec {
        match self.language {
            Language::Nodejs => RuntimeSpec {
                image: format!("docker.io/library/node:{}", self.version),
                entry: "index.js".to_string(),
                command: vec!["node".to_string(), "index.js".to_string()],
                mounts: vec![BindMount::read_only(
                    cache_root.join("nodejs/node_modules"),
                    "/app/node_modules",
                )],
                env: Vec::new(),
            },
            Language::Golang => RuntimeSpec {
                image: format!("docker.io/library/golang:{}", self.version),
                entry: "main.go".to_string(),
                command: vec![
                    "go".to_string(),
                    "run".to_string(),
                    "/app/main.go".to_string(),
                ],
                mounts: vec![BindMount::read_only(
                    cache_root.join("golang/pkg"),
                    "/go/pkg",
                )],
                env: Vec::new(),
            },
            Language::Python => RuntimeSpec {
                image: format!("docker.io/library/python:{}", self.version),
                entry: "main.py".to_string(),
                command: vec!["python".to_string(), "/app/main.py".to_string()],
                mounts: Vec::new(),
                env: Vec::new(),
            },
        }
    }

    /// One-time preparation of the shared cache for this language.
    pub async fn setup(
        &self,
        factory: &Arc<dyn SandboxFactory>,
        cache_root: &Path,
    ) -> kappa_common::Result<()> {
        match self.language {
            Language::Nodejs => self.install_node_modules(factory, cache_root).await,
            Language::Golang => {
                tokio::fs::create_dir_all(cache_root.join("golang/pkg")).await?;
                Ok(())
            }
            Language::Python => Ok(()),
        }
    }

    async fn install_node_modules(
        &self,
        factory: &Arc<dyn SandboxFactory>,
        cache_root: &Path,
    ) -> kappa_common::Result<()> {
        let package_json = self
            .package_json
            .as_deref()
            .ok_or_else(|| Error::Config("nodejs runtime requires packageJson".to_string()))?;

        let modules_dir = cache_root.join("nodejs/node_modules");
        tokio::fs::create_dir_all(&modules_dir).await?;

        let scratch = std::env::temp_dir().join(format!("kappa-setup-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;
        tokio::fs::write(scratch.join("package.json"), package_json).await?;

        info!(version = %self.version, "Installing node modules");
        let config = SandboxConfig {
            name: format!("kappa-setup-{}", Uuid::new_v4()),
            image: format!("docker.io/library/node:{}", self.version),
            command: vec![
                "npm".to_string(),
                "install".to_string(),
                "--verbose".to_string(),
            ],
            env: Vec::new(),
            mounts: vec![
                BindMount::read_write(&scratch, "/app"),
                BindMount::read_write(&modules_dir, "/app/node_modules"),
            ],
            remove_if_exists: true,
            remove_snapshot_if_exists: true,
        };

        let sandbox = factory.create(config).await?;
        sandbox.register_tmp_dir(scratch);
        sandbox.start().await?;
        sandbox.stream_logs(Arc::new(|line| debug!(target: "kappa::setup", "{line}")));

        let exit_code = match tokio::time::timeout(SETUP_TIMEOUT, sandbox.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("npm install exceeded its budget, stopping container");
                let stop = StopOptions {
                    timeout: SETUP_STOP_TIMEOUT,
                    force_kill: true,
                    remove_on_stop: true,
                };
                if let Err(e) = sandbox.stop(stop).await {
                    warn!(error = %e, "Failed to stop setup container after timeout");
                }
                return Err(Error::DependencyInstallTimeout(SETUP_TIMEOUT));
            }
        };

        if exit_code != 0 {
            let stop = StopOptions {
                timeout: SETUP_STOP_TIMEOUT,
                force_kill: true,
                remove_on_stop: true,
            };
            let _ = sandbox.stop(stop).await;
            return Err(Error::Engine(format!(
                "npm install failed with exit code {exit_code}"
            )));
        }

        let stop = StopOptions {
            timeout: SETUP_STOP_TIMEOUT,
            force_kill: false,
            remove_on_stop: true,
        };
        if let Err(e) = sandbox.stop(stop).await {
            warn!(error = %e, "Failed to clean up setup container");
        }

        let mut entries = tokio::fs::read_dir(&modules_dir).await?;
        if entries.next_entry().await?.is_none() {
            return Err(Error::Engine(
                "npm install did not produce any modules".to_string(),
            ));
        }

        info!("Node modules ready");
        Ok(())
    }
}
