//! Read-only debug and status HTTP interface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::controller::Controller;
use crate::controller::status::StatusError;

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, self.to_string()).into_response()
    }
}

async fn clusters(State(controller): State<Arc<Controller>>) -> Response {
    Json(controller.list_clusters()).into_response()
}

async fn team_clusters(
    State(controller): State<Arc<Controller>>,
    Path(team): Path<String>,
) -> Response {
    match controller.team_clusters_status(&team) {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cluster(
    State(controller): State<Arc<Controller>>,
    Path((team, name)): Path<(String, String)>,
) -> Response {
    match controller.cluster_status(&team, &name) {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cluster_logs(
    State(controller): State<Arc<Controller>>,
    Path((team, name)): Path<(String, String)>,
) -> Response {
    match controller.cluster_log_entries(&team, &name) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cluster_history(
    State(controller): State<Arc<Controller>>,
    Path((team, name)): Path<(String, String)>,
) -> Response {
    match controller.cluster_history_entries(&team, &name) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn worker_queue(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<u32>,
) -> Response {
    match controller.worker_queue_dump(id) {
        Ok(dump) => Json(dump).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn worker_logs(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<u32>,
) -> Response {
    match controller.worker_log_entries(id) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn databases(State(controller): State<Arc<Controller>>) -> Response {
    Json(controller.databases()).into_response()
}

async fn operator_status(State(controller): State<Arc<Controller>>) -> Response {
    Json(serde_json::json!({
        "workers": controller.workers(),
        "clusters": controller.list_clusters().len(),
    }))
    .into_response()
}

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/clusters", get(clusters))
        .route("/clusters/{team}", get(team_clusters))
        .route("/clusters/{team}/{name}", get(cluster))
        .route("/clusters/{team}/{name}/logs", get(cluster_logs))
        .route("/clusters/{team}/{name}/history", get(cluster_history))
        .route("/workers/{id}/queue", get(worker_queue))
        .route("/workers/{id}/logs", get(worker_logs))
        .route("/databases", get(databases))
        .route("/status", get(operator_status))
        .with_state(controller)
}

/// Serve the debug interface until the stop signal fires.
pub async fn run_api_server(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let addr = format!("0.0.0.0:{}", controller.config.api_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind the debug API on {addr}: {e}");
            return;
        }
    };
    info!("debug API listening on {addr}");

    let shutdown = async move {
        let _ = stop.changed().await;
    };
    if let Err(e) = axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("debug API server error: {e}");
    }
}
