//! Lifecycle tests against a mock engine and a local HTTP server standing in
//! for the in-container handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Json;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tempfile::NamedTempFile;
use uuid::Uuid;

use kappa_common::{InvocationEvent, InvocationResponse};
use kappa_orchestrator::test_utils::MockFactory;
use kappa_orchestrator::{Error, FunctionConfig, FunctionInstance, Registry};

const REQUEST_ID_HEADER: &str = "Kappa-Runtime-Aws-Request-Id";

/// Stands in for the handler SDK running inside the container: greets, echoes
/// the event body, and reflects the request id header.
async fn handle_invocation(
    headers: HeaderMap,
    Json(event): Json<InvocationEvent>,
) -> Json<InvocationResponse> {
    let name = event
        .body
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("world");
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    Json(InvocationResponse {
        status_code: 200,
        headers: HashMap::from([("X-Handler".to_string(), "kappa".to_string())]),
        body: json!({
            "message": format!("Hello, {name}! Welcome to your Kappa function!"),
            "input": event.body,
        }),
        request_id,
    })
}

fn handler_app() -> Router {
    Router::new()
        .route(
            "/2015-03-31/functions/function/invocations",
            post(handle_invocation),
        )
        .route("/health", get(|| async { "OK" }))
}

async fn spawn_handler() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, handler_app()).await.unwrap();
    });
    port
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config(name: &str, binary: &NamedTempFile, port: u16) -> FunctionConfig {
    let mut config = FunctionConfig::new(name, binary.path(), "alpine:latest");
    config.port = port;
    config
}

fn event_with_body(body: serde_json::Value) -> InvocationEvent {
    InvocationEvent {
        body,
        path: "/functions/test".to_string(),
        http_method: "POST".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn cold_start_invoke_greets_and_warms() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    registry
        .register(test_config("greet", &binary, port))
        .await
        .unwrap();
    assert!(!registry.list().await[0].is_running, "cold after register");

    let response = registry
        .invoke("greet", event_with_body(json!({"name": "TestUser"})))
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(
        response.body["message"],
        "Hello, TestUser! Welcome to your Kappa function!"
    );
    assert_eq!(response.body["input"]["name"], "TestUser");
    assert!(!response.request_id.is_empty());
    assert!(registry.list().await[0].is_running, "warm after invoke");
    assert_eq!(factory.create_count(), 1);
}

#[tokio::test]
async fn container_spec_follows_the_filesystem_contract() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    let mut config = test_config("spec", &binary, port);
    config.env = vec!["PORT=9999".to_string(), "EXTRA=1".to_string()];
    registry.register(config).await.unwrap();
    registry
        .invoke("spec", event_with_body(json!({})))
        .await
        .unwrap();

    let sandbox = factory.last();
    let spec = &sandbox.config;
    assert!(spec.name.starts_with("kappa-spec-"));
    assert_eq!(spec.command, ["/app/main"]);
    assert!(spec.remove_if_exists);
    assert!(spec.remove_snapshot_if_exists);

    // Injected env first, caller env last so caller duplicates win.
    let injected = spec
        .env
        .iter()
        .position(|e| e == &format!("PORT={port}"))
        .expect("injected PORT");
    let caller = spec
        .env
        .iter()
        .position(|e| e == "PORT=9999")
        .expect("caller PORT");
    assert!(caller > injected);
    assert!(spec.env.contains(&"LAMBDA_TASK_ROOT=/app".to_string()));
    assert!(spec.env.contains(&"LAMBDA_FUNCTION_NAME=spec".to_string()));
    assert!(spec
        .env
        .contains(&"AWS_LAMBDA_RUNTIME_API=localhost:8080".to_string()));

    // The scratch dir is bind-mounted read-write at /app and registered for
    // cleanup.
    let app_mount = spec
        .mounts
        .iter()
        .find(|m| m.target == "/app")
        .expect("app mount");
    assert!(!app_mount.read_only);
    assert_eq!(sandbox.tmp_dirs(), vec![app_mount.source.clone()]);
}

#[tokio::test]
async fn request_id_round_trips_through_the_handler() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let registry = Registry::new(MockFactory::new());
    registry
        .register(test_config("rid", &binary, port))
        .await
        .unwrap();

    let mut event = event_with_body(json!({}));
    event.request_id = "req-42".to_string();
    let response = registry.invoke("rid", event).await.unwrap();
    assert_eq!(response.request_id, "req-42");
}

#[tokio::test]
async fn request_id_is_generated_when_missing() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let registry = Registry::new(MockFactory::new());
    registry
        .register(test_config("rid2", &binary, port))
        .await
        .unwrap();

    let response = registry
        .invoke("rid2", event_with_body(json!({})))
        .await
        .unwrap();
    Uuid::parse_str(&response.request_id).expect("generated request id is a uuid");
}

#[tokio::test]
async fn idle_function_shuts_down_and_restarts_on_demand() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    let mut config = test_config("idle", &binary, port);
    config.idle_interval = Duration::from_millis(250);
    registry.register(config).await.unwrap();

    registry
        .invoke("idle", event_with_body(json!({})))
        .await
        .unwrap();
    assert!(registry.list().await[0].is_running);

    // No invocations past the idle interval: warm -> cold.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!registry.list().await[0].is_running);
    let first = factory.last();
    assert!(first
        .stops()
        .iter()
        .any(|s| s.force_kill && s.remove_on_stop));

    // Next invoke warms a fresh container.
    registry
        .invoke("idle", event_with_body(json!({})))
        .await
        .unwrap();
    assert!(registry.list().await[0].is_running);
    assert_eq!(factory.create_count(), 2);
}

#[tokio::test]
async fn steady_invocations_keep_the_function_warm() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    let mut config = test_config("busy", &binary, port);
    config.idle_interval = Duration::from_millis(400);
    registry.register(config).await.unwrap();

    // Six invocations 150 ms apart: each one resets the idle timer.
    for _ in 0..6 {
        registry
            .invoke("busy", event_with_body(json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert!(registry.list().await[0].is_running);
    assert_eq!(factory.create_count(), 1);
}

#[tokio::test]
async fn transport_failure_triggers_exactly_one_restart() {
    // Nothing ever listens on this port: the first attempt and the
    // post-restart retry both fail.
    let port = free_port();
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("dead", &binary, port))
        .await
        .unwrap();

    let err = registry
        .invoke("dead", event_with_body(json!({})))
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            Error::Instance(kappa_common::Error::InvocationTransport(_))
        ),
        "got {err:?}"
    );
    assert_eq!(factory.create_count(), 2, "one restart, no more");

    let sandboxes = factory.created();
    assert!(sandboxes[0].stops().iter().any(|s| s.remove_on_stop));
}

#[tokio::test]
async fn restart_recovers_when_the_handler_comes_back() {
    let port = free_port();
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("flaky", &binary, port))
        .await
        .unwrap();

    // The handler starts listening only after the first connect has failed.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        axum::serve(listener, handler_app()).await.unwrap();
    });

    let response = registry
        .invoke("flaky", event_with_body(json!({"name": "Retry"})))
        .await
        .unwrap();
    assert_eq!(response.body["input"]["name"], "Retry");
    assert_eq!(factory.create_count(), 2);
    assert!(registry.list().await[0].is_running);
}

#[tokio::test]
async fn delete_stops_the_container_and_forgets_the_function() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("gone", &binary, port))
        .await
        .unwrap();
    registry
        .invoke("gone", event_with_body(json!({})))
        .await
        .unwrap();

    registry.delete("gone").await.unwrap();

    assert!(registry.list().await.is_empty());
    let err = registry
        .invoke("gone", event_with_body(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FunctionNotFound(_)));

    let sandbox = factory.last();
    assert!(!sandbox.is_running());
    assert!(sandbox
        .stops()
        .iter()
        .any(|s| s.force_kill && s.remove_on_stop));
}

#[tokio::test]
async fn delete_of_a_cold_function_skips_the_engine() {
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("cold", &binary, free_port()))
        .await
        .unwrap();

    registry.delete("cold").await.unwrap();
    assert_eq!(factory.create_count(), 0);
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let binary = NamedTempFile::new().unwrap();
    let registry = Registry::new(MockFactory::new());
    registry
        .register(test_config("dup", &binary, free_port()))
        .await
        .unwrap();

    let err = registry
        .register(test_config("dup", &binary, free_port()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered(name) if name == "dup"));
}

#[tokio::test]
async fn registration_requires_an_existing_binary() {
    let registry = Registry::new(MockFactory::new());
    let config = FunctionConfig::new("ghost", "/no/such/file", "alpine:latest");

    let err = registry.register(config).await.unwrap_err();
    assert!(matches!(&err, Error::InvalidConfig(msg) if msg.contains("/no/such/file")));
}

#[tokio::test]
async fn registration_requires_name_binary_and_image() {
    let binary = NamedTempFile::new().unwrap();
    let registry = Registry::new(MockFactory::new());

    let err = registry
        .register(FunctionConfig::new("", binary.path(), "alpine:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let err = registry
        .register(FunctionConfig::new("x", binary.path(), ""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn container_logs_flow_into_the_bounded_function_buffer() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("logs", &binary, port))
        .await
        .unwrap();
    registry
        .invoke("logs", event_with_body(json!({})))
        .await
        .unwrap();

    let sandbox = factory.last();
    for i in 0..1500 {
        sandbox.push_log(&format!("[stdout] line {i}"));
    }

    let logs = registry.logs("logs").unwrap();
    assert_eq!(logs.len(), 1000);
    assert_eq!(logs[0], "[stdout] line 500");
    assert_eq!(logs[999], "[stdout] line 1499");
}

#[tokio::test]
async fn logs_survive_idle_shutdown() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    let mut config = test_config("keep", &binary, port);
    config.idle_interval = Duration::from_millis(200);
    registry.register(config).await.unwrap();
    registry
        .invoke("keep", event_with_body(json!({})))
        .await
        .unwrap();
    factory.last().push_log("[stdout] before idle");

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!registry.list().await[0].is_running);
    assert_eq!(registry.logs("keep").unwrap(), ["[stdout] before idle"]);
}

#[tokio::test]
async fn failed_start_surfaces_and_leaves_the_function_cold() {
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());
    registry
        .register(test_config("broken", &binary, free_port()))
        .await
        .unwrap();

    factory.fail_next_starts(true);
    let err = registry
        .invoke("broken", event_with_body(json!({})))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Instance(kappa_common::Error::Startup(_))),
        "got {err:?}"
    );
    assert!(!registry.list().await[0].is_running);

    // The engine recovers; the next invoke warms normally.
    factory.fail_next_starts(false);
    let port = spawn_handler().await;
    registry.delete("broken").await.unwrap();
    registry
        .register(test_config("broken", &binary, port))
        .await
        .unwrap();
    registry
        .invoke("broken", event_with_body(json!({})))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_invokes_produce_exactly_one_container() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Arc::new(Registry::new(factory.clone()));
    registry
        .register(test_config("racy", &binary, port))
        .await
        .unwrap();

    let invokes = (0..8).map(|i| {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .invoke("racy", event_with_body(json!({"n": i})))
                .await
        })
    });
    for handle in invokes {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(factory.create_count(), 1);
    assert!(registry.list().await[0].is_running);
}

#[tokio::test]
async fn instance_counts_requests_and_honors_interval_changes() {
    let port = spawn_handler().await;
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let instance = FunctionInstance::new(test_config("direct", &binary, port), factory.clone());

    instance.invoke(event_with_body(json!({}))).await.unwrap();
    instance.invoke(event_with_body(json!({}))).await.unwrap();
    assert_eq!(instance.requests_processed(), 2);
    assert!(instance.is_running().await);

    // Shrinking the interval re-arms the already-running timer.
    instance.set_idle_interval(Duration::from_millis(150));
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!instance.is_running().await);
}

#[tokio::test]
async fn shutdown_drains_every_instance() {
    let binary = NamedTempFile::new().unwrap();
    let factory = MockFactory::new();
    let registry = Registry::new(factory.clone());

    for name in ["one", "two"] {
        let port = spawn_handler().await;
        registry
            .register(test_config(name, &binary, port))
            .await
            .unwrap();
        registry
            .invoke(name, event_with_body(json!({})))
            .await
            .unwrap();
    }

    registry.shutdown(Duration::from_secs(5)).await;

    for summary in registry.list().await {
        assert!(!summary.is_running, "{} still running", summary.name);
    }
    for sandbox in factory.created() {
        assert!(!sandbox.is_running());
    }
}
