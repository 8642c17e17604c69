use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod core;
mod middleware;
mod models;
mod state;
mod utils;

use crate::core::config::Settings;
use crate::core::runner::Runner;
use crate::core::session_store::{self, SessionStore};
use crate::core::task_store::{self, TaskStore};
use crate::core::worker_pool::WorkerPool;
use crate::middleware::{auth, error_handler, request_id};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new()?;

    info!("starting gateway on {}:{}", settings.server.host, settings.server.port);

    let (app, pool) = create_app(settings.clone()).await?;

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("server listening on http://{addr}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(pool)).await?;

    Ok(())
}

/// Waits for Ctrl-C (or SIGTERM, under unix) and drains the pool before
/// axum stops accepting connections (spec §4.2).
async fn shutdown_signal(pool: Arc<WorkerPool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
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

    info!("shutdown signal received, draining worker pool");
    pool.shutdown().await;
}

async fn create_app(settings: Settings) -> Result<(Router, Arc<WorkerPool>)> {
    let dispatch = settings.dispatch.clone();
    for path in [&dispatch.session_db_path, &dispatch.task_db_path] {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let runner = Arc::new(Runner::new(settings.claude.command.clone()));
    let pool = Arc::new(WorkerPool::new(
        runner,
        dispatch.worker_concurrency,
        dispatch.max_queue_size,
        Duration::from_millis(dispatch.request_timeout_millis),
        Duration::from_millis(dispatch.queue_timeout_millis),
    ));

    let sessions = Arc::new(SessionStore::open(
        std::path::Path::new(&dispatch.session_db_path),
        Duration::from_millis(dispatch.session_ttl_millis),
        dispatch.max_sessions_per_key,
    )?);
    session_store::spawn_sweeper(sessions.clone(), Duration::from_millis(dispatch.session_cleanup_interval_millis));

    let tasks = Arc::new(TaskStore::open(
        std::path::Path::new(&dispatch.task_db_path),
        Duration::from_millis(dispatch.task_retention_millis),
    )?);
    let orphaned = tasks.mark_orphaned_failed().await?;
    if orphaned > 0 {
        info!(count = orphaned, "recovered orphaned tasks from a prior run");
    }
    task_store::spawn_sweeper(tasks.clone(), Duration::from_millis(dispatch.task_cleanup_interval_millis));

    let state = AppState {
        pool: pool.clone(),
        sessions,
        tasks,
        settings: Arc::new(settings),
    };

    let app = Router::new()
        .route("/health", get(api::health::health))
        .route("/stats", get(api::health::stats))
        .route("/v1/query", post(api::direct::query))
        .route("/v1/chat/completions", post(api::openai::chat_completions))
        .route("/v1/models", get(api::models::list_models))
        .route("/v1/messages", post(api::anthropic::messages))
        .route("/v1/sessions", get(api::sessions::list_sessions).post(api::sessions::create_session))
        .route(
            "/v1/sessions/:id",
            get(api::sessions::get_session).delete(api::sessions::delete_session),
        )
        .route("/v1/tasks", get(api::tasks::list_tasks).post(api::tasks::create_task))
        .route("/v1/tasks/:id", get(api::tasks::get_task))
        .route("/v1/tasks/:id/cancel", post(api::tasks::cancel_task))
        .layer(from_fn_with_state(state.clone(), auth::extract_credential))
        .layer(from_fn(request_id::add_request_id))
        .layer(from_fn(error_handler::handle_errors))
        .layer(CorsLayer::permissive())
        .with_state(state);

    Ok((app, pool))
}
