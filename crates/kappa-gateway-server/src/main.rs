use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kappa_executor::bollard::Docker;
use kappa_executor::DockerSandboxFactory;
use kappa_gateway_server::{create_app, init_tracing, AppState};
use kappa_orchestrator::Registry;
use tracing::info;

const LISTEN_PORT: u16 = 8000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let docker = Arc::new(Docker::connect_with_local_defaults()?);
    let factory = Arc::new(DockerSandboxFactory::new(docker));
    let registry = Arc::new(Registry::new(factory));

    let app = create_app(AppState {
        registry: registry.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Kappa gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down");
            registry.shutdown(SHUTDOWN_GRACE).await;
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
