use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::Result;
use crate::handlers::{health_check, index, AppState};
use crate::middleware::{logging_middleware, rate_limit, Admission};
use crate::store::{MemoryStore, RedisStore, Store};
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the router: `/` is gated by the admission middleware, the
/// operational routes are not.
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(index))
        .route_layer(middleware::from_fn_with_state(
            state.admission.clone(),
            rate_limit,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    /// Connects the store and builds the configured limiter.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn Store> = if config.uses_memory_store() {
            tracing::warn!("Using in-process store; limits are not shared between instances");
            Arc::new(MemoryStore::default())
        } else {
            Arc::new(RedisStore::connect(&config.redis_url).await?)
        };

        let limiter = config
            .limiter_config()
            .build(store.clone(), Arc::new(SystemClock), &config.app_prefix)?;
        tracing::info!(limiter = %limiter.kind(), "Rate limiter configured");

        let admission = Admission::new(limiter)
            .with_debug(config.debug)
            .with_failure_policy(config.failure_policy);

        Ok(Self {
            app: create_app(AppState::new(store, admission)),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("limitgate server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        // Peer addresses feed the client IP fallback.
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
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
