//! End-to-end tests against a live Docker daemon: real containers behind the
//! real gateway. The in-container handler SDK is out of scope here, so the
//! invoke path is exercised up to the transport boundary.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use kappa_executor::bollard::Docker;
use kappa_executor::DockerSandboxFactory;
use kappa_gateway_server::{create_app, AppState};
use kappa_orchestrator::Registry;
use serde_json::{json, Value};

async fn spawn_gateway() -> String {
    let docker = Arc::new(Docker::connect_with_local_defaults().expect("docker client"));
    let factory = Arc::new(DockerSandboxFactory::new(docker));
    let registry = Arc::new(Registry::new(factory));
    let app = create_app(AppState { registry });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url
}

/// A "function binary" that only logs and idles; it never speaks the handler
/// protocol, so invocations fail at the transport after one restart.
fn script_binary() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"#!/bin/sh\necho booted\nsleep 120\n")
        .unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
#[ignore] // Requires Docker
async fn register_invoke_logs_delete_against_real_containers() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let binary = script_binary();

    // Register.
    let response = client
        .post(format!("{base}/functions"))
        .json(&json!({
            "name": "boot",
            "binaryPath": binary.path(),
            "image": "alpine:latest",
            "port": 18230,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Invoke: the container comes up, but nothing serves the handler
    // protocol, so the gateway reports a server-side failure after the one
    // automatic restart.
    let response = client
        .post(format!("{base}/functions/boot"))
        .json(&json!({"name": "TestUser"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    // The cold start still happened: the instance is warm and the container
    // stdout reached the log ring.
    let list: Value = client
        .get(format!("{base}/functions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["functions"][0]["name"], "boot");
    assert_eq!(list["functions"][0]["isRunning"], true);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let logs: Value = client
        .get(format!("{base}/functions/boot/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let lines: Vec<String> = logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(
        lines.contains(&"[stdout] booted".to_string()),
        "expected boot line in {lines:?}"
    );

    // Delete stops and removes the container.
    let response = client
        .delete(format!("{base}/functions/boot"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let list: Value = client
        .get(format!("{base}/functions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["functions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn idle_interval_reaps_real_containers() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let binary = script_binary();

    let response = client
        .post(format!("{base}/functions"))
        .json(&json!({
            "name": "sleepy",
            "binaryPath": binary.path(),
            "image": "alpine:latest",
            "port": 18231,
            "idleIntervalSecs": 2,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let _ = client
        .post(format!("{base}/functions/sleepy"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    let list: Value = client
        .get(format!("{base}/functions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["functions"][0]["isRunning"], true);

    // Past the idle interval the instance goes cold again.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let list: Value = client
        .get(format!("{base}/functions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["functions"][0]["isRunning"], false);

    let response = client
        .delete(format!("{base}/functions/sleepy"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
