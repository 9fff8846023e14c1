use std::sync::Arc;

use crate::instruction::{MapInstruction, ReduceInstruction};

/// El trabajo concreto de una tarea, con las instrucciones ya construidas.
/// La forma serializable que viaja al agente es `protocol::AgentTaskPayload`.
#[derive(Clone)]
pub enum TaskPayload {
    Map {
        instruction: Arc<dyn MapInstruction>,
        /// Reduce local opcional que colapsa los pares antes de reportarlos.
        combiner: Option<Arc<dyn ReduceInstruction>>,
        input: String,
    },
    Reduce {
        instruction: Arc<dyn ReduceInstruction>,
        key: String,
        values: Vec<String>,
    },
}

impl TaskPayload {
    /// Etiqueta corta para logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Map { .. } => "MAP",
            TaskPayload::Reduce { .. } => "REDUCE",
        }
    }
}
