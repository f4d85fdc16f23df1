//! Per-function lifecycle: cold -> warm on demand, warm -> cold on idle,
//! one automatic restart on transport failure.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use kappa_common::{
    BindMount, Error, InvocationEvent, InvocationResponse, LogBuffer, Sandbox, SandboxConfig,
    SandboxFactory, StopOptions,
};
use kappa_executor::runtime::{self, RuntimeTemplate};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Breathing room for the handler's HTTP server after a restart.
const RESTART_GRACE: Duration = Duration::from_secs(1);

const REQUEST_ID_HEADER: &str = "Kappa-Runtime-Aws-Request-Id";
const INVOCATION_PATH: &str = "/2015-03-31/functions/function/invocations";

/// Immutable after registration.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    pub name: String,
    pub binary_path: PathBuf,
    pub image: String,
    pub env: Vec<String>,
    pub port: u16,
    pub idle_interval: Duration,
    pub runtime: Option<RuntimeTemplate>,
}

impl FunctionConfig {
    pub fn new(
        name: impl Into<String>,
        binary_path: impl Into<PathBuf>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            binary_path: binary_path.into(),
            image: image.into(),
            env: Vec::new(),
            port: DEFAULT_PORT,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            runtime: None,
        }
    }
}

/// Guarded by the running-lock. `running`, the sandbox handle and the URL
/// move together; no observer can see them disagree.
#[derive(Default)]
struct InstanceState {
    running: bool,
    sandbox: Option<Arc<dyn Sandbox>>,
    container_url: Option<String>,
}

struct IdleTimer {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    /// Bumped on every re-arm/cancel so a fired timer can tell whether it
    /// has been superseded.
    generation: u64,
}

pub struct FunctionInstance {
    config: FunctionConfig,
    factory: Arc<dyn SandboxFactory>,
    http: reqwest::Client,
    state: Mutex<InstanceState>,
    idle_timer: StdMutex<IdleTimer>,
    logs: Arc<LogBuffer>,
    requests_processed: AtomicU64,
    template_ready: AtomicBool,
    /// Handed to idle-timer tasks so a fired timer can reach back without
    /// keeping a deleted instance alive.
    weak_self: Weak<FunctionInstance>,
}

impl FunctionInstance {
    pub fn new(config: FunctionConfig, factory: Arc<dyn SandboxFactory>) -> Arc<Self> {
        let interval = config.idle_interval;
        Arc::new_cyclic(|weak| Self {
            config,
            factory,
            http: reqwest::Client::new(),
            state: Mutex::new(InstanceState::default()),
            idle_timer: StdMutex::new(IdleTimer {
                interval,
                handle: None,
                generation: 0,
            }),
            logs: Arc::new(LogBuffer::default()),
            requests_processed: AtomicU64::new(0),
            template_ready: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::Relaxed)
    }

    /// Cold -> warm. A no-op when already warm; concurrent callers serialize
    /// on the running-lock, so exactly one container comes up.
    pub async fn start(&self) -> kappa_common::Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }
        self.start_locked(&mut state).await?;
        drop(state);

        self.reset_idle_timer();
        info!(name = %self.config.name, port = self.config.port, "Function started");
        Ok(())
    }

    async fn start_locked(&self, state: &mut InstanceState) -> kappa_common::Result<()> {
        info!(
            name = %self.config.name,
            binary = %self.config.binary_path.display(),
            "Starting function container"
        );

        let (image, command, extra_mounts, extra_env, entry) = match &self.config.runtime {
            Some(template) => {
                let root = runtime::cache_root();
                if !self.template_ready.swap(true, Ordering::SeqCst) {
                    if let Err(e) = template.setup(&self.factory, &root).await {
                        self.template_ready.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                }
                let spec = template.resolve(&root);
                (spec.image, spec.command, spec.mounts, spec.env, spec.entry)
            }
            None => (
                self.config.image.clone(),
                vec!["/app/main".to_string()],
                Vec::new(),
                Vec::new(),
                "main".to_string(),
            ),
        };

        let scratch = std::env::temp_dir().join(format!(
            "kappa-fn-{}-{}",
            self.config.name,
            Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&scratch).await?;
        stage_binary(&self.config.binary_path, &scratch.join(&entry)).await?;

        let mut env = vec![
            format!("PORT={}", self.config.port),
            "LAMBDA_TASK_ROOT=/app".to_string(),
            format!("LAMBDA_FUNCTION_NAME={}", self.config.name),
            "AWS_LAMBDA_RUNTIME_API=localhost:8080".to_string(),
        ];
        env.extend(extra_env);
        // Caller env goes last so its duplicates win.
        env.extend(self.config.env.iter().cloned());

        let mut mounts = vec![BindMount::read_write(&scratch, "/app")];
        mounts.extend(extra_mounts);

        let sandbox_config = SandboxConfig {
            name: format!("kappa-{}-{}", self.config.name, Uuid::new_v4()),
            image,
            command,
            env,
            mounts,
            remove_if_exists: true,
            remove_snapshot_if_exists: true,
        };

        let sandbox = match self.factory.create(sandbox_config).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                return Err(Error::Startup(e.to_string()));
            }
        };
        sandbox.register_tmp_dir(scratch);

        if let Err(e) = sandbox.start().await {
            // Reclaims the scratch dir whether or not the adapter got far
            // enough to clean up engine-side state.
            let teardown = StopOptions {
                timeout: Duration::from_secs(1),
                force_kill: true,
                remove_on_stop: true,
            };
            if let Err(stop_err) = sandbox.stop(teardown).await {
                warn!(name = %self.config.name, error = %stop_err, "Cleanup after failed start");
            }
            return Err(Error::Startup(e.to_string()));
        }

        let sink = self.logs.clone();
        sandbox.stream_logs(Arc::new(move |line| sink.append(line)));

        state.sandbox = Some(sandbox);
        state.container_url = Some(format!("http://localhost:{}", self.config.port));
        state.running = true;
        Ok(())
    }

    /// Warm -> cold. Cancels the idle timer and tears the container down
    /// with a hard 10 s budget.
    pub async fn stop(&self) -> kappa_common::Result<()> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }

        self.cancel_idle_timer();

        if let Some(sandbox) = state.sandbox.clone() {
            sandbox
                .stop(StopOptions {
                    timeout: STOP_TIMEOUT,
                    force_kill: true,
                    remove_on_stop: true,
                })
                .await?;
        }

        state.sandbox = None;
        state.container_url = None;
        state.running = false;
        info!(name = %self.config.name, "Function stopped");
        Ok(())
    }

    pub async fn invoke(
        &self,
        mut event: InvocationEvent,
    ) -> kappa_common::Result<InvocationResponse> {
        {
            let state = self.state.lock().await;
            if !state.running {
                drop(state);
                self.start().await?;
            }
        }
        self.reset_idle_timer();

        if event.request_id.is_empty() {
            event.request_id = Uuid::new_v4().to_string();
        }

        let url = self.invocation_url().await?;
        let response = match self.post_event(&url, &event).await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(Error::InvocationTimeout(INVOKE_TIMEOUT))
            }
            Err(err) if err.is_connect() => {
                if !self.is_running().await {
                    return Err(Error::InvocationTransport(err.to_string()));
                }
                // One in-place restart per invoke, then surface the failure.
                warn!(
                    name = %self.config.name,
                    error = %err,
                    "Failed to connect to function, attempting restart"
                );
                self.stop().await?;
                self.start().await?;
                tokio::time::sleep(RESTART_GRACE).await;

                match self.post_event(&url, &event).await {
                    Ok(response) => response,
                    Err(err) if err.is_timeout() => {
                        return Err(Error::InvocationTimeout(INVOKE_TIMEOUT))
                    }
                    Err(err) => {
                        return Err(Error::InvocationTransport(format!(
                            "invoke after restart: {err}"
                        )))
                    }
                }
            }
            Err(err) => return Err(Error::InvocationTransport(err.to_string())),
        };

        let mut envelope: InvocationResponse = response
            .json()
            .await
            .map_err(|e| Error::HandlerFailure(e.to_string()))?;
        if envelope.request_id.is_empty() {
            envelope.request_id = event.request_id.clone();
        }

        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        Ok(envelope)
    }

    async fn invocation_url(&self) -> kappa_common::Result<String> {
        let state = self.state.lock().await;
        match &state.container_url {
            Some(url) => Ok(format!("{url}{INVOCATION_PATH}")),
            None => Err(Error::Startup(format!(
                "function {} has no live container",
                self.config.name
            ))),
        }
    }

    async fn post_event(
        &self,
        url: &str,
        event: &InvocationEvent,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.http
            .post(url)
            .timeout(INVOKE_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, &event.request_id)
            .json(event)
            .send()
            .await
    }

    /// Re-arms the one-shot idle timer. Each invoke lands here, pushing the
    /// warm -> cold transition out by `idle_interval`.
    pub fn reset_idle_timer(&self) {
        let mut timer = self.idle_timer.lock().unwrap();
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.generation += 1;
        let armed_generation = timer.generation;
        let interval = timer.interval;

        let weak = self.weak_self.clone();
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(instance) = weak.upgrade() else {
                return;
            };
            {
                // A reset that raced our wake-up wins; only the newest timer
                // may stop the function.
                let mut timer = instance.idle_timer.lock().unwrap();
                if timer.generation != armed_generation {
                    return;
                }
                timer.handle = None;
            }
            info!(name = %instance.config.name, "Stopping idle function");
            if let Err(e) = instance.stop().await {
                warn!(name = %instance.config.name, error = %e, "Idle stop failed");
            }
        }));
    }

    fn cancel_idle_timer(&self) {
        let mut timer = self.idle_timer.lock().unwrap();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    /// Takes effect immediately: a currently armed timer is re-armed with
    /// the new interval.
    pub fn set_idle_interval(&self, interval: Duration) {
        let armed = {
            let mut timer = self.idle_timer.lock().unwrap();
            timer.interval = interval;
            timer.handle.is_some()
        };
        if armed {
            self.reset_idle_timer();
        }
    }
}

/// Hard-link the function binary into the scratch dir, fall back to a copy
/// across filesystems, and mark it executable.
async fn stage_binary(source: &Path, dest: &Path) -> kappa_common::Result<()> {
    if tokio::fs::hard_link(source, dest).await.is_err() {
        tokio::fs::copy(source, dest).await?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}
