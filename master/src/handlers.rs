use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::protocol::{
    AgentMetrics, ComputationStatus, PushResultRequest, PushResultResponse, RegisterRequest,
    RegisterResponse,
};
use common::store::MemoryResultStore;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::remote::RemoteAgentWorker;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/agents/register", post(register_agent))
        .route("/api/v1/results/push", post(push_result))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Alta de un agente: entra al pool como un worker más y arranca su pinger
async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let agent_id = uuid::Uuid::new_v4().to_string();
    let base_url = format!("http://{}:{}", req.ip, req.port);

    let worker = RemoteAgentWorker::new(
        agent_id.clone(),
        base_url.clone(),
        req.hostname,
        &state.pool,
        state.collector.clone(),
        state.factory.clone(),
        Arc::new(MemoryResultStore::new()),
        &state.cfg,
    );

    {
        let mut agents = state.agents.lock().unwrap();
        agents.insert(agent_id.clone(), worker.clone());
    }
    state.pool.donate_worker(worker.clone());
    tokio::spawn(worker.run_pinger());

    info!("agente registrado: {} en {}", agent_id, base_url);
    Json(RegisterResponse {
        agent_id,
        acknowledged: true,
    })
}

// Un agente empuja el resultado de una tarea que terminó
async fn push_result(
    State(state): State<AppState>,
    Json(req): Json<PushResultRequest>,
) -> Json<PushResultResponse> {
    state.collector.push_result(&req.task_id, req.result);
    Json(PushResultResponse { ok: true })
}

async fn status(State(state): State<AppState>) -> Json<ComputationStatus> {
    Json(state.master.status())
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<AgentMetrics>> {
    let agents = state.agents.lock().unwrap();
    Json(agents.values().map(|w| w.metrics()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Registration, ResultCollector};
    use crate::config::MasterConfig;
    use crate::master::Master;
    use crate::pool::Pool;
    use common::protocol::TaskResult;
    use common::registry::InstructionRegistry;
    use common::shipping::AgentTaskFactory;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn estado_de_prueba() -> AppState {
        let cfg = MasterConfig::default();
        let pool = Pool::new();
        let collector = ResultCollector::new(cfg.available_result_ttl, cfg.requested_result_ttl);
        let factory = Arc::new(AgentTaskFactory::new(
            Arc::new(InstructionRegistry::with_builtins()),
            cfg.shipping_cache_capacity,
        ));
        let master = Master::new(pool.clone(), cfg.clone());
        AppState {
            cfg,
            pool,
            collector,
            factory,
            master,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn servir(state: AppState) -> String {
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn registrar_un_agente_lo_mete_al_pool() {
        let state = estado_de_prueba();
        let base = servir(state.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/agents/register", base))
            .json(&RegisterRequest {
                ip: "127.0.0.1".to_string(),
                port: 9999,
                hostname: "maquina-de-prueba".to_string(),
            })
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let ack: RegisterResponse = resp.json().await.unwrap();
        assert!(ack.acknowledged);
        assert!(!ack.agent_id.is_empty());
        assert_eq!(state.pool.worker_count(), 1);
        assert_eq!(state.agents.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn el_push_de_un_agente_llega_al_collector() {
        let state = estado_de_prueba();
        let base = servir(state.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/results/push", base))
            .json(&PushResultRequest {
                task_id: "t-1".to_string(),
                result: TaskResult::reduce_ok("5".to_string()),
            })
            .send()
            .await
            .unwrap();
        let body: PushResultResponse = resp.json().await.unwrap();
        assert!(body.ok);

        match state.collector.register_observer(&"t-1".to_string()) {
            Registration::Ready(result) => assert_eq!(result.output.as_deref(), Some("5")),
            Registration::Pending(_) => panic!("el resultado ya tenía que estar"),
        }
    }

    #[tokio::test]
    async fn el_status_arranca_ocioso() {
        let state = estado_de_prueba();
        let base = servir(state).await;

        let status: ComputationStatus = reqwest::get(format!("{}/api/v1/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.phase, "NONE");
        assert!(status.computation_id.is_none());
        assert_eq!(status.total_inputs, 0);
    }
}
