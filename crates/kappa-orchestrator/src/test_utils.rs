//! In-memory sandbox doubles for exercising the supervisor without a
//! container engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kappa_common::{
    Error, LogBuffer, LogCallback, Result, Sandbox, SandboxConfig, SandboxFactory, StopOptions,
};

/// Sandbox that flips a flag instead of talking to an engine. Tests inject
/// log lines with [`MockSandbox::push_log`] and inspect recorded stops.
pub struct MockSandbox {
    pub config: SandboxConfig,
    running: AtomicBool,
    logs: Arc<LogBuffer>,
    stops: Mutex<Vec<StopOptions>>,
    tmp_dirs: Mutex<Vec<PathBuf>>,
    fail_start: bool,
}

impl MockSandbox {
    pub fn push_log(&self, line: &str) {
        self.logs.append(line);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> Vec<StopOptions> {
        self.stops.lock().unwrap().clone()
    }

    pub fn tmp_dirs(&self) -> Vec<PathBuf> {
        self.tmp_dirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(Error::Engine("mock start failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, opts: StopOptions) -> Result<()> {
        self.stops.lock().unwrap().push(opts);
        self.running.store(false, Ordering::SeqCst);
        if opts.remove_on_stop {
            for dir in self.tmp_dirs.lock().unwrap().drain(..) {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
        Ok(())
    }

    async fn wait(&self) -> Result<i64> {
        Ok(0)
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

/// Factory recording every sandbox it hands out.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockSandbox>>>,
    fail_start: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequently created sandbox fail its `start`.
    pub fn fail_next_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockSandbox>> {
        self.created.lock().unwrap().clone()
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<MockSandbox> {
        self.created
            .lock()
            .unwrap()
            .last()
            .expect("no sandbox created yet")
            .clone()
    }
}

#[async_trait]
impl SandboxFactory for MockFactory {
    async fn create(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let sandbox = Arc::new(MockSandbox {
            config,
            running: AtomicBool::new(false),
            logs: Arc::new(LogBuffer::default()),
            stops: Mutex::new(Vec::new()),
            tmp_dirs: Mutex::new(Vec::new()),
            fail_start: self.fail_start.load(Ordering::SeqCst),
        });
        self.created.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}
