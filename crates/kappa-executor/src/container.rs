//! The `DockerSandbox` container handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kappa_common::{LogBuffer, LogCallback, Sandbox, SandboxConfig, StopOptions};

use crate::{is_not_found, Result, SandboxError};

/// Memory ceiling per function container. The envelope traffic is tiny; this
/// mostly bounds user code.
const MEMORY_LIMIT_BYTES: i64 = 128 * 1024 * 1024;
const NANO_CPUS: i64 = 1_000_000_000; // 1 CPU

/// Bounded wait for a leftover container to die before it is replaced.
const EXISTING_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const SNAPSHOT_SUFFIX: &str = "-snapshot";

/// One container, addressed by its configured name. Engine resources are
/// allocated in `start`, not `create`. Registered temp directories are
/// deleted on removal; `Drop` is only a safety net for leaked handles.
pub struct DockerSandbox {
    id: String,
    config: SandboxConfig,
    docker: Arc<Docker>,
    container_id: Mutex<Option<String>>,
    logs: Arc<LogBuffer>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    tmp_dirs: Mutex<Vec<PathBuf>>,
    cleaned: AtomicBool,
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox").field("id", &self.id).finish()
    }
}

impl DockerSandbox {
    /// Validates the config and builds a handle. No engine calls happen here.
    pub fn create(docker: Arc<Docker>, config: SandboxConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(SandboxError::InvalidConfig("name is required".into()));
        }
        if config.image.is_empty() {
            return Err(SandboxError::InvalidConfig("image is required".into()));
        }
        if config.command.is_empty() {
            return Err(SandboxError::InvalidConfig("command is required".into()));
        }

        Ok(Self {
            id: config.name.clone(),
            config,
            docker,
            container_id: Mutex::new(None),
            logs: Arc::new(LogBuffer::default()),
            pumps: Mutex::new(Vec::new()),
            tmp_dirs: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn snapshot_tag(&self) -> String {
        format!("{}{}", self.id, SNAPSHOT_SUFFIX)
    }

    /// Kill and delete a leftover container carrying our name.
    async fn remove_existing(&self) -> Result<()> {
        let existing = match self.docker.inspect_container(&self.id, None).await {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(SandboxError::DockerApi(e)),
        };

        warn!(id = %self.id, "Found existing container, removing it");
        let running = existing
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);

        if running {
            let term = KillContainerOptions { signal: "SIGTERM" };
            if let Err(e) = self.docker.kill_container(&self.id, Some(term)).await {
                if !is_not_found(&e) {
                    warn!(id = %self.id, error = %e, "SIGTERM failed, trying SIGKILL");
                    let kill = KillContainerOptions { signal: "SIGKILL" };
                    match self.docker.kill_container(&self.id, Some(kill)).await {
                        Err(e) if !is_not_found(&e) => return Err(SandboxError::StopFailed(e)),
                        _ => {}
                    }
                }
            }

            let wait_opts = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&self.id, Some(wait_opts));
            if tokio::time::timeout(EXISTING_STOP_TIMEOUT, wait.next())
                .await
                .is_err()
            {
                warn!(id = %self.id, "Existing container ignored SIGTERM, escalating");
                let kill = KillContainerOptions { signal: "SIGKILL" };
                let _ = self.docker.kill_container(&self.id, Some(kill)).await;
            }
        }

        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&self.id, Some(remove_opts)).await {
            Err(e) if !is_not_found(&e) => Err(SandboxError::RemovalFailed(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Delete a leftover `<id>-snapshot` layer from an earlier run.
    async fn remove_stale_snapshot(&self) -> Result<()> {
        let tag = self.snapshot_tag();
        match self.docker.inspect_image(&tag).await {
            Ok(_) => {
                warn!(id = %self.id, snapshot = %tag, "Found existing snapshot, removing it");
                let opts = RemoveImageOptions {
                    force: true,
                    ..Default::default()
                };
                match self.docker.remove_image(&tag, Some(opts), None).await {
                    Err(e) if !is_not_found(&e) => Err(SandboxError::DockerApi(e)),
                    _ => Ok(()),
                }
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::DockerApi(e)),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            debug!(image = %self.config.image, "Image already present, skipping pull");
            return Ok(());
        }

        info!(image = %self.config.image, "Pulling image");
        let opts = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(SandboxError::PullFailed)?;
        }
        info!(image = %self.config.image, "Image pulled");
        Ok(())
    }

    fn build_mounts(&self) -> Vec<Mount> {
        let mut mounts: Vec<Mount> = self
            .config
            .mounts
            .iter()
            .map(|bind| Mount {
                target: Some(bind.target.clone()),
                source: Some(bind.source.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(bind.read_only),
                ..Default::default()
            })
            .collect();

        // Host name resolution inside the container.
        for path in ["/etc/hosts", "/etc/resolv.conf"] {
            mounts.push(Mount {
                target: Some(path.to_string()),
                source: Some(path.to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }
        mounts
    }

    async fn start_impl(&self) -> Result<()> {
        info!(id = %self.id, image = %self.config.image, "Starting container");

        if self.config.remove_if_exists {
            self.remove_existing().await?;
        }
        if self.config.remove_snapshot_if_exists {
            self.remove_stale_snapshot().await?;
        }
        self.ensure_image().await?;

        let host_config = HostConfig {
            mounts: Some(self.build_mounts()),
            memory: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            network_mode: Some("host".to_string()),
            ..Default::default()
        };
        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(self.config.command.clone()),
            env: Some(self.config.env.clone()),
            working_dir: Some("/app".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let create_opts = CreateContainerOptions {
            name: self.id.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(SandboxError::CreationFailed)?;
        *self.container_id.lock().unwrap() = Some(created.id.clone());

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove_err) = self.remove_impl().await {
                warn!(id = %self.id, error = %remove_err, "Cleanup after failed start");
            }
            return Err(SandboxError::StartFailed(e));
        }

        self.spawn_log_pump(created.id.clone(), true);
        self.spawn_log_pump(created.id, false);

        info!(id = %self.id, "Container started");
        Ok(())
    }

    /// One pump per pipe: follows the engine log stream for a single stream,
    /// reassembles lines, prefixes them, and appends to the buffer (which
    /// fans out to callbacks). The task ends when the stream reaches EOF.
    fn spawn_log_pump(&self, container_id: String, stdout: bool) {
        let docker = self.docker.clone();
        let buffer = self.logs.clone();
        let prefix = if stdout { "[stdout]" } else { "[stderr]" };

        let handle = tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout,
                stderr: !stdout,
                tail: "all".to_string(),
                ..Default::default()
            };
            let mut stream = docker.logs(&container_id, Some(options));
            let mut pending = LineBuffer::default();

            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(output) => {
                        for line in pending.push(&output.into_bytes()) {
                            buffer.append(&format!("{prefix} {line}"));
                        }
                    }
                    Err(e) => {
                        debug!(source = prefix, error = %e, "Log stream closed");
                        break;
                    }
                }
            }
            if let Some(rest) = pending.finish() {
                buffer.append(&format!("{prefix} {rest}"));
            }
            debug!(source = prefix, "Log pump finished");
        });

        self.pumps.lock().unwrap().push(handle);
    }

    async fn stop_impl(&self, opts: StopOptions) -> Result<()> {
        info!(id = %self.id, ?opts, "Stopping container");

        let container_id = self.container_id.lock().unwrap().clone();
        let Some(container_id) = container_id else {
            // Never started, nothing to signal.
            if opts.remove_on_stop {
                return self.remove_impl().await;
            }
            return Ok(());
        };

        let running = match self.docker.inspect_container(&container_id, None).await {
            Ok(info) => info.state.and_then(|state| state.running).unwrap_or(false),
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                warn!(id = %self.id, error = %e, "Container state check failed");
                false
            }
        };
        if !running {
            debug!(id = %self.id, "Container not running, proceeding to cleanup");
            if opts.remove_on_stop {
                return self.remove_impl().await;
            }
            return Ok(());
        }

        let signal = if opts.force_kill { "SIGKILL" } else { "SIGTERM" };
        match self
            .docker
            .kill_container(&container_id, Some(KillContainerOptions { signal }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                debug!(id = %self.id, "Process already gone");
                if opts.remove_on_stop {
                    return self.remove_impl().await;
                }
                return Ok(());
            }
            Err(e) => return Err(SandboxError::StopFailed(e)),
        }

        let wait_opts = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(&container_id, Some(wait_opts));
        match tokio::time::timeout(opts.timeout, wait.next()).await {
            Ok(Some(Ok(status))) => {
                info!(id = %self.id, exit_code = status.status_code, "Container stopped")
            }
            Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
                info!(id = %self.id, exit_code = code, "Container stopped")
            }
            Ok(Some(Err(e))) if !is_not_found(&e) => {
                warn!(id = %self.id, error = %e, "Wait for container failed")
            }
            Ok(_) => {}
            Err(_) => {
                warn!(id = %self.id, "Container stop timed out, forcing kill");
                let kill = KillContainerOptions { signal: "SIGKILL" };
                match self.docker.kill_container(&container_id, Some(kill)).await {
                    Err(e) if !is_not_found(&e) => return Err(SandboxError::StopFailed(e)),
                    _ => {}
                }
            }
        }

        if opts.remove_on_stop {
            return self.remove_impl().await;
        }
        Ok(())
    }

    /// Best-effort teardown: container, its snapshot layer, registered temp
    /// directories. Individual failures are collected and returned joined.
    async fn remove_impl(&self) -> Result<()> {
        info!(id = %self.id, "Removing container");
        let mut failures: Vec<String> = Vec::new();

        let container_id = self.container_id.lock().unwrap().take();
        if let Some(container_id) = container_id {
            let opts = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self.docker.remove_container(&container_id, Some(opts)).await {
                if !is_not_found(&e) {
                    failures.push(format!("delete container: {e}"));
                }
            }

            let tag = self.snapshot_tag();
            if let Err(e) = self.docker.remove_image(&tag, None, None).await {
                if !is_not_found(&e) {
                    failures.push(format!("delete snapshot {tag}: {e}"));
                }
            }
        }

        let dirs: Vec<PathBuf> = self.tmp_dirs.lock().unwrap().drain(..).collect();
        for dir in dirs {
            debug!(path = %dir.display(), "Removing temp directory");
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failures.push(format!("remove temp dir {}: {e}", dir.display()));
                }
            }
        }

        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        self.cleaned.store(true, Ordering::SeqCst);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::RemovalFailed(failures.join("; ")))
        }
    }

    /// Final bookkeeping for a handle being discarded: drops the buffered
    /// log lines and removes whatever the sandbox still owns.
    pub async fn close(&self) -> Result<()> {
        self.logs.clear();
        self.remove_impl().await
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn start(&self) -> kappa_common::Result<()> {
        self.start_impl().await.map_err(Into::into)
    }

    async fn stop(&self, opts: StopOptions) -> kappa_common::Result<()> {
        self.stop_impl(opts).await.map_err(Into::into)
    }

    async fn wait(&self) -> kappa_common::Result<i64> {
        let container_id = self
            .container_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SandboxError::Internal("no running container".into()))
            .map_err(kappa_common::Error::from)?;

        let wait_opts = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(&container_id, Some(wait_opts));
        match wait.next().await {
            Some(Ok(status)) => Ok(status.status_code),
            // bollard surfaces a non-zero exit as an error item.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::DockerApi(e).into()),
            None => Err(SandboxError::Internal("wait stream ended unexpectedly".into()).into()),
        }
    }

    fn stream_logs(&self, callback: LogCallback) {
        self.logs.replay_and_subscribe(callback);
    }

    fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    fn register_tmp_dir(&self, path: PathBuf) {
        self.tmp_dirs.lock().unwrap().push(path);
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.cleaned.load(Ordering::SeqCst) {
            return;
        }
        // Safety net for leaked handles; the stop/remove paths own cleanup.
        let dirs: Vec<PathBuf> = self.tmp_dirs.get_mut().unwrap().drain(..).collect();
        for dir in dirs {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "Failed to remove leaked temp dir");
                }
            }
        }
        for pump in self.pumps.get_mut().unwrap().drain(..) {
            pump.abort();
        }
    }
}

/// Reassembles whole lines out of arbitrarily-chunked engine log frames.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned())
        }
    }
}
