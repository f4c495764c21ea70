use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::config::ConfigCell;
use crate::dispatcher::Dispatcher;
use crate::error::{ClusterError, Result};
use crate::supervisor::Supervisor;
use crate::worker::WorkerSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: ConfigCell,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/instances", get(list_instances))
        .route("/instances/:port/disable", post(disable_instance))
        .route("/instances/:port/enable", post(enable_instance))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/scale", post(cluster_scale))
        .route("/route", post(route_request))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/users/reset", post(reset_users))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Redirect {
    Redirect::permanent("/docs")
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<WorkerSnapshot>> {
    let snapshots = state.supervisor.enumerate().iter().map(|w| w.snapshot()).collect();
    Json(snapshots)
}

async fn disable_instance(State(state): State<AppState>, Path(port): Path<u16>) -> Result<String> {
    let worker = state.supervisor.get(port).ok_or(ClusterError::UnknownPort(port))?;
    worker.set_disabled(true);
    Ok(format!("worker {port} disabled"))
}

async fn enable_instance(State(state): State<AppState>, Path(port): Path<u16>) -> Result<String> {
    let worker = state.supervisor.get(port).ok_or(ClusterError::UnknownPort(port))?;
    worker.set_disabled(false);
    Ok(format!("worker {port} enabled"))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterStatus {
    total: usize,
    alive: usize,
    disabled: usize,
    average_composite_load: f64,
    cluster_rps: f64,
}

async fn cluster_status(State(state): State<AppState>) -> Result<Json<ClusterStatus>> {
    let workers = state.supervisor.enumerate();
    if workers.is_empty() {
        return Err(ClusterError::NoEligibleWorker);
    }
    let alive = workers.iter().filter(|w| w.is_alive()).count();
    let disabled = workers.iter().filter(|w| w.is_disabled()).count();
    let average_composite_load =
        workers.iter().map(|w| w.composite_load()).sum::<f64>() / workers.len() as f64;

    Ok(Json(ClusterStatus {
        total: workers.len(),
        alive,
        disabled,
        average_composite_load,
        cluster_rps: state.supervisor.cluster_rps(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleRequest {
    action: String,
    #[serde(default = "default_scale_count")]
    count: usize,
}

fn default_scale_count() -> usize {
    1
}

async fn cluster_scale(State(state): State<AppState>, Json(request): Json<ScaleRequest>) -> Result<String> {
    let config = state.config.current();
    match request.action.as_str() {
        "up" => {
            for _ in 0..request.count {
                state.supervisor.start_instance(&config).await;
            }
        }
        "down" => {
            let candidates = state.supervisor.enumerate();
            for worker in candidates.into_iter().take(request.count) {
                state.supervisor.kill_instance(worker.port).await;
            }
        }
        other => return Err(ClusterError::BadRequest(format!("unknown scale action '{other}'"))),
    }
    Ok(format!("scaled {} by {}", request.action, request.count))
}

async fn route_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let user = headers.get("X-User").and_then(|v| v.to_str().ok());
    let response = state.dispatcher.route(user, body).await?;
    Ok(Json(response))
}

async fn health(State(state): State<AppState>) -> Response {
    let any_alive = state.supervisor.enumerate().iter().any(|w| w.is_alive());
    if any_alive {
        (StatusCode::OK, "Cluster healthy").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Cluster unhealthy").into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    let workers = state.supervisor.enumerate();
    let mut out = String::new();
    for worker in &workers {
        let port = worker.port;
        let up = if worker.is_alive() { 1 } else { 0 };
        let memory_mb = worker.memory_bytes() as f64 / (1024.0 * 1024.0);
        out.push_str(&format!("ollama_instance_up{{port=\"{port}\"}} {up}\n"));
        out.push_str(&format!(
            "ollama_instance_requests_inflight{{port=\"{port}\"}} {}\n",
            worker.inflight()
        ));
        out.push_str(&format!("ollama_instance_cpu{{port=\"{port}\"}} {}\n", worker.cpu_percent()));
        out.push_str(&format!("ollama_instance_memory_mb{{port=\"{port}\"}} {memory_mb}\n"));
        out.push_str(&format!(
            "ollama_instance_load{{port=\"{port}\"}} {}\n",
            worker.moving_average_load()
        ));
        out.push_str(&format!(
            "ollama_instance_composite_load{{port=\"{port}\"}} {}\n",
            worker.composite_load()
        ));
        out.push_str(&format!("ollama_instance_rps{{port=\"{port}\"}} {}\n", worker.rps()));
    }
    for (user, count) in state.supervisor.user_requests_snapshot() {
        out.push_str(&format!("ollama_user_requests{{user=\"{user}\"}} {count}\n"));
    }
    out
}

async fn reset_users(State(state): State<AppState>) -> &'static str {
    state.supervisor.reset_users();
    "user counters reset"
}
