use serde::{Deserialize, Serialize};

use kappa_executor::RuntimeTemplate;
use kappa_orchestrator::FunctionSummary;

/// Body of `POST /functions`. The required fields are validated by the
/// registry so that a missing field answers 400 rather than a serde reject.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFunctionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub binary_path: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    pub port: Option<u16>,
    pub idle_interval_secs: Option<u64>,
    pub runtime: Option<RuntimeTemplate>,
}

#[derive(Debug, Serialize)]
pub struct RegisterFunctionResponse {
    pub name: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct FunctionList {
    pub functions: Vec<FunctionSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeleteFunctionResponse {
    pub name: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct FunctionLogsResponse {
    pub name: String,
    pub logs: Vec<String>,
}
