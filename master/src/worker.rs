use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use common::engine;
use common::store::{ResultStore, StoreError};
use common::{ComputationId, TaskId, WorkerId};
use tracing::{info, warn};

use crate::pool::Pool;
use crate::task::{TaskState, WorkerTask};

/// Lo que el pool y el master necesitan de cualquier worker, sea un hilo
/// local o un agente remoto detrás de HTTP.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;

    /// Ejecuta la tarea asignada. El worker es dueño de devolverse al pool
    /// con `worker_is_finished` cuando termina, gane o pierda.
    async fn execute(self: Arc<Self>, task: Arc<WorkerTask>);

    /// La tarea perdió la carrera: tirar su resultado si existe y, si sigue
    /// corriendo, descartarla al terminar.
    async fn abort(&self, task_id: &TaskId);

    /// Limpieza final de una computación entera.
    async fn purge(&self, computation_id: &ComputationId, task_ids: &[TaskId]);

    /// Pares intermedios de una tarea Map completada.
    async fn map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError>;

    /// Valores de salida de una tarea Reduce completada.
    async fn reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError>;
}

/// Worker en el mismo proceso: corre la instrucción en un hilo blocking y
/// guarda los resultados en su propio store.
pub struct LocalWorker {
    id: WorkerId,
    pool: Weak<Pool>,
    store: Arc<dyn ResultStore>,
    /// Tareas abortadas mientras corrían: al terminar se tiran, no se publican.
    aborted: Mutex<HashSet<TaskId>>,
}

impl LocalWorker {
    pub fn new(id: &str, pool: &Arc<Pool>, store: Arc<dyn ResultStore>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            pool: Arc::downgrade(pool),
            store,
            aborted: Mutex::new(HashSet::new()),
        })
    }

    fn hand_back(&self) {
        if let Some(pool) = self.pool.upgrade() {
            if !pool.worker_is_finished(&self.id) {
                warn!("el pool ya no conoce al worker local {}", self.id);
            }
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn execute(self: Arc<Self>, task: Arc<WorkerTask>) {
        tokio::spawn(async move {
            if !task.set_state(TaskState::InProgress) {
                // la tarea murió entre el despacho y acá
                self.hand_back();
                return;
            }

            let store = self.store.clone();
            let task_id = task.id.clone();
            let payload = task.payload.clone();
            let result = tokio::task::spawn_blocking(move || {
                engine::execute_payload(store.as_ref(), &task_id, &payload)
            })
            .await;

            let result = match result {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    warn!("el store del worker {} falló: {}", self.id, err);
                    common::protocol::TaskResult::failed(err.to_string())
                }
                Err(_) => {
                    warn!("la tarea {} entró en pánico en el worker {}", task.id, self.id);
                    common::protocol::TaskResult::failed("la instrucción entró en pánico")
                }
            };

            // la marca puede haberse purgado mientras corríamos; el estado
            // de la tarea también delata a un perdedor
            let was_aborted = self.aborted.lock().unwrap().remove(&task.id)
                || task.state() == TaskState::Aborted;
            if was_aborted {
                info!("la tarea {} perdió la carrera, tiramos su resultado", task.id);
                let _ = self.store.destroy(&task.id);
            } else if result.success {
                task.complete();
            } else {
                info!(
                    "la tarea {} falló en el worker {}: {}",
                    task.id,
                    self.id,
                    result.error.as_deref().unwrap_or("sin detalle")
                );
                task.fail();
            }

            self.hand_back();
        });
    }

    async fn abort(&self, task_id: &TaskId) {
        self.aborted.lock().unwrap().insert(task_id.clone());
        let _ = self.store.destroy(task_id);
    }

    async fn purge(&self, _computation_id: &ComputationId, task_ids: &[TaskId]) {
        let mut aborted = self.aborted.lock().unwrap();
        for task_id in task_ids {
            aborted.remove(task_id);
            let _ = self.store.destroy(task_id);
        }
    }

    async fn map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError> {
        self.store.get_map_results(task_id)
    }

    async fn reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        self.store.get_reduce_results(task_id)
    }
}
