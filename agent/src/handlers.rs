use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::protocol::{
    AbortRequest, AbortResponse, AgentPingResponse, AgentTask, PurgeRequest, PurgeResponse,
    RunTaskResponse,
};
use tower_http::trace::TraceLayer;

use crate::executor::Executor;

pub fn build_router(executor: Executor) -> Router {
    Router::new()
        .route("/health", get(ping))
        .route("/api/v1/tasks/run", post(run_task))
        .route("/api/v1/tasks/abort", post(abort_task))
        .route("/api/v1/computations/purge", post(purge_computation))
        .layer(TraceLayer::new_for_http())
        .with_state(executor)
}

/* ---------------- handlers HTTP ---------------- */

async fn ping(State(executor): State<Executor>) -> Json<AgentPingResponse> {
    Json(executor.ping())
}

async fn run_task(
    State(executor): State<Executor>,
    Json(task): Json<AgentTask>,
) -> Json<RunTaskResponse> {
    Json(executor.try_run(task))
}

async fn abort_task(
    State(executor): State<Executor>,
    Json(req): Json<AbortRequest>,
) -> Json<AbortResponse> {
    executor.abort(&req.task_id);
    Json(AbortResponse { ok: true })
}

async fn purge_computation(
    State(executor): State<Executor>,
    Json(req): Json<PurgeRequest>,
) -> Json<PurgeResponse> {
    executor.purge(&req.computation_id, &req.task_ids);
    Json(PurgeResponse { ok: true })
}
