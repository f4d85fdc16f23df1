//! REST surface of the Kappa runtime: register, list, invoke, delete,
//! fetch logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info, instrument};

use kappa_common::InvocationEvent;
use kappa_orchestrator::{Error as RegistryError, FunctionConfig, Registry};

pub mod types;


use types::{
    DeleteFunctionResponse, FunctionList, FunctionLogsResponse, RegisterFunctionRequest,
    RegisterFunctionResponse,
};

/// Deadline for one invocation as seen from the gateway, cold start included.
const INVOKE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/functions", get(list_functions).post(register_function))
        .route(
            "/functions/:name",
            post(invoke_function).delete(delete_function),
        )
        .route("/functions/:name/logs", get(function_logs))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- API error handling ---

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Function invocation timed out")]
    GatewayTimeout,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::GatewayTimeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        error!(source = %err, "Registry error");
        match err {
            RegistryError::FunctionNotFound(name) => {
                ApiError::NotFound(format!("Function not found: {name}"))
            }
            RegistryError::AlreadyRegistered(name) => {
                ApiError::Conflict(format!("Function already registered: {name}"))
            }
            RegistryError::InvalidConfig(msg) => ApiError::BadRequest(msg),
            RegistryError::Instance(source) => match source {
                kappa_common::Error::Config(msg) => ApiError::BadRequest(msg),
                kappa_common::Error::InvocationTimeout(_) => ApiError::GatewayTimeout,
                other => ApiError::Internal(other.to_string()),
            },
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Handlers ---

#[instrument(skip(state, req), fields(name = %req.name))]
async fn register_function(
    State(state): State<AppState>,
    Json(req): Json<RegisterFunctionRequest>,
) -> ApiResult<(StatusCode, Json<RegisterFunctionResponse>)> {
    let mut config = FunctionConfig::new(req.name.clone(), req.binary_path, req.image);
    config.env = req.env;
    config.port = req.port.unwrap_or(0);
    if let Some(secs) = req.idle_interval_secs {
        config.idle_interval = Duration::from_secs(secs);
    }
    config.runtime = req.runtime;

    state.registry.register(config).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterFunctionResponse {
            name: req.name,
            status: "registered",
        }),
    ))
}

async fn list_functions(State(state): State<AppState>) -> Json<FunctionList> {
    Json(FunctionList {
        functions: state.registry.list().await,
    })
}

/// Turns the inbound request into an event envelope and the handler's
/// response envelope back into an HTTP response. The whole JSON body lands in
/// `event.body`; one representative value is kept per header and query key.
#[instrument(skip(state, headers, query_params, body), fields(name = %name))]
async fn invoke_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    uri: Uri,
    Query(query_params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let event = InvocationEvent {
        body,
        path: uri.path().to_string(),
        http_method: method.to_string(),
        headers: headers
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_string(), v.to_string()))
            })
            .collect(),
        query_params,
        request_id: String::new(),
    };

    let envelope = tokio::time::timeout(INVOKE_DEADLINE, state.registry.invoke(&name, event))
        .await
        .map_err(|_| ApiError::GatewayTimeout)??;

    let status = StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::OK);
    let mut response_headers = HeaderMap::new();
    for (key, value) in &envelope.headers {
        if let (Ok(key), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response_headers.insert(key, value);
        }
    }

    Ok((status, response_headers, Json(envelope.body)).into_response())
}

#[instrument(skip(state), fields(name = %name))]
async fn delete_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<DeleteFunctionResponse>> {
    state.registry.delete(&name).await?;
    Ok(Json(DeleteFunctionResponse {
        name,
        status: "deleted",
    }))
}

async fn function_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<FunctionLogsResponse>> {
    let logs = state.registry.logs(&name)?;
    Ok(Json(FunctionLogsResponse { name, logs }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Installs the process-wide subscriber. `APP_ENV=development` selects
/// human-readable output; `LOG_LEVEL` picks the default level, falling back
/// to `info` on unknown values.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let configured = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let level = match configured.as_str() {
        "debug" | "info" | "warn" | "error" => configured.clone(),
        _ => "info".to_string(),
    };
    let filter =
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("APP_ENV").as_deref() == Ok("development") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if level != configured {
        tracing::warn!(value = %configured, "Unknown LOG_LEVEL, falling back to info");
    }
    info!(%level, "Logger initialized");
}
