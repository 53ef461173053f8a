//! HTTP surface and process bootstrap for the orchestrator.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::integrations::IntegrationStore;
use crate::lock::InstanceLock;
use crate::pipeline::{PipelineRunner, PipelineSettings};
use crate::store::StoreHandle;
use crate::worker::{WorkerManager, WorkerSettings};

pub use api::{AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the orchestrator and serve until Ctrl-C or SIGTERM.
///
/// Startup order matters: records are sanitized and orphaned workers are
/// swept before the listener accepts its first request.
pub async fn start_server(config: Config, dev_mode: bool) -> Result<()> {
    config.ensure_directories()?;
    let _lock = InstanceLock::acquire(&config.storage.data_dir)?;

    let (store, store_task, _report) = StoreHandle::open(&config.records_dir(), config.flush_debounce())
        .await
        .context("Failed to open record store")?;
    let integrations = IntegrationStore::new(config.integrations_file());
    let workers = WorkerManager::new(
        store.clone(),
        integrations.clone(),
        WorkerSettings::from_config(&config),
    );

    match workers.sweep_orphans().await {
        Ok(swept) if !swept.is_empty() => {
            let terminated = swept.iter().filter(|o| o.terminated).count();
            warn!(breadcrumbs = swept.len(), terminated, "Swept workers left by a previous run");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Orphan sweep failed"),
    }
    let monitor = workers.spawn_monitor();

    let pipeline = PipelineRunner::new(store.clone(), PipelineSettings::from_config(&config));
    let state = Arc::new(AppState {
        store: store.clone(),
        integrations,
        pipeline,
        workers: workers.clone(),
    });
    let app = build_router(state, dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, data_dir = %config.storage.data_dir.display(), "clonesmith listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Shutting down");
    monitor.abort();
    workers.shutdown_all().await;
    if let Err(e) = store.shutdown().await {
        error!(error = %e, "Final record flush failed");
    }
    if let Err(e) = store_task.await {
        error!(error = %e, "Record store task panicked");
    }
    info!("Server shut down gracefully");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Records;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(dir: &TempDir) -> SharedState {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let (store, _task) = StoreHandle::spawn(
            Records::default(),
            config.records_dir(),
            Duration::from_millis(20),
        );
        let integrations = IntegrationStore::new(config.integrations_file());
        let workers = WorkerManager::new(
            store.clone(),
            integrations.clone(),
            WorkerSettings::from_config(&config),
        );
        let pipeline = PipelineRunner::new(store.clone(), PipelineSettings::from_config(&config));
        Arc::new(AppState {
            store,
            integrations,
            pipeline,
            workers,
        })
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir), true);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_default_mode_has_no_cors() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir), false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir), false);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
