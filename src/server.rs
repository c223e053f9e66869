use crate::api::{Api, ClassRef};
use crate::app::AppContext;
use crate::error::Result;
use crate::handlers::{HealthController, PingController};
use axum::Router;
use std::net::SocketAddr;
use tokio::signal;

/// The api with every built-in controller registered.
pub fn create_api(app: &AppContext) -> Result<Api> {
    let mut api = Api::new(app.clone(), "ninja-throttle", env!("CARGO_PKG_VERSION"));
    api.register_controllers(&[
        ClassRef::controller::<HealthController>(),
        ClassRef::controller::<PingController>(),
    ])?;
    Ok(api)
}

pub struct Server {
    app: AppContext,
    router: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(api: Api, bind_addr: SocketAddr) -> Self {
        for route in api.routes() {
            tracing::debug!(
                method = %route.method,
                path = %route.path,
                throttled = route.throttled,
                "route registered"
            );
        }

        Self {
            app: api.app().clone(),
            router: api.into_router(),
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let cleanup = self.app.spawn_store_cleanup();

        tracing::info!("ninja-throttle server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        // Run server with graceful shutdown
        let result = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        if let Some(cleanup) = cleanup {
            cleanup.abort();
        }
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
