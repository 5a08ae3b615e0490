//! Admin HTTP surface of a running driver.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::LoadBalancerConfig;
use crate::driver::{DriverHandle, StatisticsSnapshot};
use crate::error::{DispatchError, Result};

#[derive(Serialize)]
struct StatsResponse {
    driver_uuid: String,
    queue_depth: usize,
    #[serde(flatten)]
    statistics: StatisticsSnapshot,
}

#[derive(Serialize, Deserialize)]
struct LoadBalancerBody {
    algorithm: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
}

impl From<LoadBalancerConfig> for LoadBalancerBody {
    fn from(config: LoadBalancerConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            parameters: config
                .parameters
                .into_iter()
                .map(|(name, value)| (name, serde_json::Value::String(value)))
                .collect(),
        }
    }
}

impl From<LoadBalancerBody> for LoadBalancerConfig {
    fn from(body: LoadBalancerBody) -> Self {
        let mut config = LoadBalancerConfig::new(body.algorithm);
        for (name, value) in body.parameters {
            // numbers and booleans are accepted as their JSON text
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            config = config.with_parameter(name, value);
        }
        config
    }
}

#[derive(Serialize)]
struct LoadBalancerUpdated {
    generation: u64,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn error_response(error: DispatchError) -> (StatusCode, Json<ActionResponse>) {
    let status = match error {
        DispatchError::JobNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::UnknownAlgorithm(_) | DispatchError::InvalidParameter { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ActionResponse {
            success: false,
            error: Some(error.to_string()),
        }),
    )
}

fn ok_response() -> (StatusCode, Json<ActionResponse>) {
    (
        StatusCode::OK,
        Json(ActionResponse {
            success: true,
            error: None,
        }),
    )
}

pub fn router(handle: DriverHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/nodes", get(nodes_handler))
        .route("/api/jobs", get(jobs_handler))
        .route(
            "/api/load-balancer",
            get(get_load_balancer_handler).put(set_load_balancer_handler),
        )
        .route("/api/jobs/{id}/suspend", post(suspend_handler))
        .route("/api/jobs/{id}/resume", post(resume_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_handler))
        .layer(cors)
        .with_state(handle)
}

/// Serve the admin router on `addr` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, handle: DriverHandle, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting dashboard server");
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn stats_handler(State(handle): State<DriverHandle>) -> impl IntoResponse {
    match handle.queue_depth() {
        Ok(queue_depth) => Json(StatsResponse {
            driver_uuid: handle.driver_uuid().to_string(),
            queue_depth,
            statistics: handle.statistics(),
        })
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn queue_handler(State(handle): State<DriverHandle>) -> impl IntoResponse {
    match handle.queue_snapshot() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn nodes_handler(State(handle): State<DriverHandle>) -> impl IntoResponse {
    match handle.nodes() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn jobs_handler(State(handle): State<DriverHandle>) -> impl IntoResponse {
    match handle.jobs() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_load_balancer_handler(State(handle): State<DriverHandle>) -> impl IntoResponse {
    match handle.load_balancer() {
        Ok(config) => Json(LoadBalancerBody::from(config)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn set_load_balancer_handler(
    State(handle): State<DriverHandle>,
    Json(body): Json<LoadBalancerBody>,
) -> impl IntoResponse {
    match handle.set_load_balancer(body.into()) {
        Ok(generation) => Json(LoadBalancerUpdated { generation }).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected load-balancer change");
            error_response(e).into_response()
        }
    }
}

async fn suspend_handler(
    State(handle): State<DriverHandle>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match handle.suspend_job(&id) {
        Ok(()) => ok_response(),
        Err(e) => error_response(e),
    }
}

async fn resume_handler(
    State(handle): State<DriverHandle>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match handle.resume_job(&id) {
        Ok(()) => ok_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_handler(
    State(handle): State<DriverHandle>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match handle.cancel_job(&id) {
        Ok(()) => ok_response(),
        Err(e) => error_response(e),
    }
}
