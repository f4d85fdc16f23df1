//! Function registry and supervisor.
//!
//! The [`Registry`] owns one [`FunctionInstance`] per registered name and
//! routes invocations to it. It spawns no tasks of its own; all work is
//! driven by callers and by the per-instance idle timers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use kappa_common::{InvocationEvent, InvocationResponse, SandboxFactory};

pub mod function;
pub mod test_utils;

pub use function::{FunctionConfig, FunctionInstance, DEFAULT_IDLE_INTERVAL, DEFAULT_PORT};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Function not found in registry: {0}")]
    FunctionNotFound(String),
    #[error("Function already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Invalid function config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Instance(#[from] kappa_common::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSummary {
    pub name: String,
    pub is_running: bool,
}

pub struct Registry {
    functions: DashMap<String, Arc<FunctionInstance>>,
    factory: Arc<dyn SandboxFactory>,
}

impl Registry {
    pub fn new(factory: Arc<dyn SandboxFactory>) -> Self {
        Self {
            functions: DashMap::new(),
            factory,
        }
    }

    /// Validates the config and creates the instance eagerly, container
    /// field empty. Fails with 409-class [`Error::AlreadyRegistered`] on a
    /// duplicate name.
    pub async fn register(&self, mut config: FunctionConfig) -> Result<()> {
        if config.name.is_empty()
            || config.image.is_empty()
            || config.binary_path.as_os_str().is_empty()
        {
            return Err(Error::InvalidConfig(
                "Missing required fields: name, binaryPath, image".to_string(),
            ));
        }
        if tokio::fs::metadata(&config.binary_path).await.is_err() {
            return Err(Error::InvalidConfig(format!(
                "Binary not found: {}",
                config.binary_path.display()
            )));
        }
        if config.port == 0 {
            config.port = DEFAULT_PORT;
        }

        match self.functions.entry(config.name.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(config.name)),
            Entry::Vacant(slot) => {
                info!(name = %config.name, "Function registered");
                slot.insert(FunctionInstance::new(config, self.factory.clone()));
                Ok(())
            }
        }
    }

    pub async fn invoke(&self, name: &str, event: InvocationEvent) -> Result<InvocationResponse> {
        let instance = self.get(name)?;
        Ok(instance.invoke(event).await?)
    }

    /// Stops the function if warm, then drops it from the registry.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let instance = self.get(name)?;
        instance.stop().await.map_err(Error::from)?;
        self.functions.remove(name);
        info!(name, "Function deleted");
        Ok(())
    }

    pub fn logs(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get(name)?.logs())
    }

    pub async fn list(&self) -> Vec<FunctionSummary> {
        let instances: Vec<Arc<FunctionInstance>> =
            self.functions.iter().map(|e| e.value().clone()).collect();
        let mut summaries = Vec::with_capacity(instances.len());
        for instance in instances {
            summaries.push(FunctionSummary {
                name: instance.name().to_string(),
                is_running: instance.is_running().await,
            });
        }
        summaries
    }

    /// Stops every instance, bounded by `grace`. Instance stops already
    /// force-kill, so anything still alive when the window closes is left to
    /// the engine.
    pub async fn shutdown(&self, grace: Duration) {
        let instances: Vec<Arc<FunctionInstance>> =
            self.functions.iter().map(|e| e.value().clone()).collect();
        info!(count = instances.len(), "Stopping all functions");

        let drain = futures::future::join_all(instances.iter().map(|instance| async move {
            if let Err(e) = instance.stop().await {
                warn!(name = %instance.name(), error = %e, "Failed to stop function");
            }
        }));
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Shutdown grace expired with functions still stopping");
        }
    }

    fn get(&self, name: &str) -> Result<Arc<FunctionInstance>> {
        self.functions
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))
    }
}
