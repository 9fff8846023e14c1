use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ComputationId, TaskId, WorkerId};

/// Descriptor de una instrucción lista para viajar: nombre estable en el
/// registro + su configuración serializada. El agente reconstruye la
/// instrucción desde su propio registro; lógica no registrada se rechaza.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedInstruction {
    pub name: String,
    pub config: Value,
}

/// Una tarea tal como se la mandamos a un agente remoto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub computation_id: ComputationId,
    pub task_id: TaskId,
    pub payload: AgentTaskPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentTaskPayload {
    Map {
        instruction: ShippedInstruction,
        combiner: Option<ShippedInstruction>,
        input: String,
    },
    Reduce {
        instruction: ShippedInstruction,
        key: String,
        values: Vec<String>,
    },
}

/// Respuesta inmediata del agente a POST /api/v1/tasks/run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTaskState {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub state: RunTaskState,
    /// Motivo del rechazo, si lo hubo.
    pub message: Option<String>,
}

/// Resultado final de una tarea, tal como lo reporta quien la ejecutó.
/// Map exitoso lleva `pairs`; Reduce exitoso lleva `output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub pairs: Option<Vec<(String, String)>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn map_ok(pairs: Vec<(String, String)>) -> Self {
        Self {
            success: true,
            pairs: Some(pairs),
            output: None,
            error: None,
        }
    }

    pub fn reduce_ok(output: String) -> Self {
        Self {
            success: true,
            pairs: None,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pairs: None,
            output: None,
            error: Some(error.into()),
        }
    }
}

/* --------- push de resultados (agente → master) --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResultRequest {
    pub task_id: TaskId,
    pub result: TaskResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResultResponse {
    pub ok: bool,
}

/* --------- registro de agentes --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// IP/host donde el master puede llamar de vuelta al agente.
    pub ip: String,
    pub port: u16,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: WorkerId,
    /// El master confirma que el agente quedó en su pool.
    pub acknowledged: bool,
}

/* --------- limpieza (master → agente) --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub computation_id: ComputationId,
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub ok: bool,
}

/* --------- observabilidad --------- */

/// Respuesta del ping de vida del agente (GET /health).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPingResponse {
    pub busy: bool,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

/// Métricas por agente que expone el master en GET /api/v1/workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: WorkerId,
    pub hostname: String,
    pub base_url: String,
    pub state: String,
    pub current_task: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_ping_secs_ago: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Estado de la computación en curso (GET /api/v1/status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationStatus {
    pub computation_id: Option<ComputationId>,
    pub phase: String,
    pub total_inputs: usize,
    pub completed_inputs: usize,
}
