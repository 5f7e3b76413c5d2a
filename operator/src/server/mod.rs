//! Intake HTTP server: catalog queries and restore-task creation. Runs the
//! catalog indexer alongside.

pub mod handlers;

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use deadpool_postgres::Pool;
use kube::Client;
use owo_colors::OwoColorize;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::args::ServerArgs;
use crate::elastic::EsClient;
use crate::{indexer, store};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub kube: Client,
    pub namespace: String,
    pub restore_key: String,
    pub es_name: String,
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pool = snaprestore_common::postgres::create_pool(args.postgres.clone()).await;
    store::init_schema(&pool).await?;
    let es = EsClient::new(&args.elastic)?;
    let kube = Client::try_default().await?;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        snaprestore_common::shutdown::shutdown_signal().await;
        cancel_on_signal.cancel();
    });

    let indexer_task = tokio::spawn(indexer::run(
        es.clone(),
        pool.clone(),
        Duration::from_secs(args.restore.catalog_sync_interval.max(1)),
        cancel.clone(),
    ));

    let state = AppState {
        pool,
        kube,
        namespace: args.namespace.clone(),
        restore_key: args.restore.restore_key.clone(),
        es_name: args.restore.es_name.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/indices", get(handlers::query_indices))
        .route("/restore", post(handlers::restore_snapshot))
        .route("/tasks/{task_id}", get(handlers::get_task))
        .layer(axum::middleware::from_fn(
            snaprestore_common::access_log::public,
        ))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    snaprestore_common::signal_ready();
    println!(
        "{}{}",
        "🌐 Intake server listening • addr=".green(),
        addr.green().dimmed(),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(snaprestore_common::shutdown::shutdown_signal())
        .await?;

    cancel.cancel();
    indexer_task.await.ok();
    Ok(())
}
