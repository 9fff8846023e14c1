use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use common::engine;
use common::protocol::{
    AgentPingResponse, AgentTask, AgentTaskPayload, PushResultRequest, RunTaskResponse,
    RunTaskState, TaskResult,
};
use common::shipping::{InstructionLoader, ShippingError};
use common::store::ResultStore;
use common::task::TaskPayload;
use common::{ComputationId, TaskId};
use reqwest::Client;
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{info, warn};

struct ExecutorInner {
    loader: Arc<InstructionLoader>,
    store: Arc<dyn ResultStore>,
    master_url: String,
    client: Client,
    /// La tarea en curso; una sola a la vez.
    current: Mutex<Option<TaskId>>,
    /// Tareas abortadas mientras corrían: su resultado se tira, no se empuja.
    discarded: Mutex<HashSet<TaskId>>,
    sys: Mutex<System>,
}

/// El corazón del agente: acepta a lo sumo una tarea a la vez, la corre en
/// un hilo blocking y le empuja el resultado al master.
///
/// Nada de lo que venga en una tarea puede tirar el proceso abajo: una
/// instrucción desconocida o con config rota se rechaza, y un pánico en la
/// lógica del usuario sale como resultado fallido.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(
        loader: Arc<InstructionLoader>,
        store: Arc<dyn ResultStore>,
        master_url: String,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                loader,
                store,
                master_url,
                client: Client::new(),
                current: Mutex::new(None),
                discarded: Mutex::new(HashSet::new()),
                sys: Mutex::new(System::new_all()),
            }),
        }
    }

    /// Decide en el acto: ACCEPTED y la tarea corre de fondo, o REJECTED con
    /// el motivo. El que llama no espera nada más de este request.
    pub fn try_run(&self, task: AgentTask) -> RunTaskResponse {
        // reconstruir las instrucciones primero: una tarea inválida se
        // rechaza siempre, estemos libres u ocupados
        let payload = match self.prepare(&task) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("rechazamos la tarea {}: {}", task.task_id, err);
                return RunTaskResponse {
                    state: RunTaskState::Rejected,
                    message: Some(err.to_string()),
                };
            }
        };

        {
            let mut current = self.inner.current.lock().unwrap();
            if let Some(running) = current.as_ref() {
                info!(
                    "rechazamos la tarea {}: ocupados con la tarea {}",
                    task.task_id, running
                );
                return RunTaskResponse {
                    state: RunTaskState::Rejected,
                    message: Some(format!("ocupado con la tarea {}", running)),
                };
            }
            *current = Some(task.task_id.clone());
        }

        let executor = self.clone();
        let task_id = task.task_id;
        tokio::spawn(async move {
            executor.run_and_push(task_id, payload).await;
        });

        RunTaskResponse {
            state: RunTaskState::Accepted,
            message: None,
        }
    }

    /// Descriptores → instrucciones vivas, vía el loader (cacheado).
    fn prepare(&self, task: &AgentTask) -> Result<TaskPayload, ShippingError> {
        match &task.payload {
            AgentTaskPayload::Map {
                instruction,
                combiner,
                input,
            } => {
                let map = self.inner.loader.load_map(instruction)?;
                let combiner = match combiner {
                    Some(descriptor) => Some(self.inner.loader.load_reduce(descriptor)?),
                    None => None,
                };
                Ok(TaskPayload::Map {
                    instruction: map,
                    combiner,
                    input: input.clone(),
                })
            }
            AgentTaskPayload::Reduce {
                instruction,
                key,
                values,
            } => {
                let reduce = self.inner.loader.load_reduce(instruction)?;
                Ok(TaskPayload::Reduce {
                    instruction: reduce,
                    key: key.clone(),
                    values: values.clone(),
                })
            }
        }
    }

    async fn run_and_push(self, task_id: TaskId, payload: TaskPayload) {
        info!("arranca la tarea {}", task_id);

        let store = self.inner.store.clone();
        let tid = task_id.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            engine::execute_payload(store.as_ref(), &tid, &payload)
        })
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!("el store falló en la tarea {}: {}", task_id, err);
                TaskResult::failed(err.to_string())
            }
            Err(_) => {
                warn!("la instrucción entró en pánico en la tarea {}", task_id);
                TaskResult::failed("la instrucción entró en pánico")
            }
        };

        // ¿nos la abortaron mientras corría?
        let discarded = self.inner.discarded.lock().unwrap().remove(&task_id);
        // liberamos el slot antes del push: el master puede mandarnos la
        // siguiente apenas procese el resultado
        self.release(&task_id);

        if discarded {
            info!("la tarea {} fue abortada, tiramos su resultado", task_id);
            let _ = self.inner.store.destroy(&task_id);
            return;
        }

        // push al master, una sola vez; si se pierde, su TTL limpia la espera
        let url = format!("{}/api/v1/results/push", self.inner.master_url);
        let push = PushResultRequest {
            task_id: task_id.clone(),
            result,
        };
        match self.inner.client.post(&url).json(&push).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("resultado de la tarea {} empujado al master", task_id);
            }
            Ok(resp) => warn!(
                "el master respondió {} al push de la tarea {}",
                resp.status(),
                task_id
            ),
            Err(err) => warn!("no pudimos empujar el resultado de {}: {}", task_id, err),
        }
    }

    fn release(&self, task_id: &TaskId) {
        let mut current = self.inner.current.lock().unwrap();
        if current.as_deref() == Some(task_id.as_str()) {
            *current = None;
        }
    }

    /// La tarea perdió su carrera: si corre, marcarla para tirar el
    /// resultado al terminar; lo ya guardado se borra ya.
    pub fn abort(&self, task_id: &TaskId) {
        let corriendo =
            self.inner.current.lock().unwrap().as_deref() == Some(task_id.as_str());
        if corriendo {
            self.inner.discarded.lock().unwrap().insert(task_id.clone());
        }
        let _ = self.inner.store.destroy(task_id);
        info!("abort de la tarea {} (corriendo: {})", task_id, corriendo);
    }

    /// La computación terminó: no queda nada que guardar de estas tareas.
    pub fn purge(&self, computation_id: &ComputationId, task_ids: &[TaskId]) {
        let current = self.inner.current.lock().unwrap().clone();
        let mut discarded = self.inner.discarded.lock().unwrap();
        for task_id in task_ids {
            if current.as_deref() == Some(task_id.as_str()) {
                // sigue corriendo: que el final la tire solo
                discarded.insert(task_id.clone());
            } else {
                discarded.remove(task_id);
            }
            let _ = self.inner.store.destroy(task_id);
        }
        info!(
            "purga de la computación {}: {} tareas",
            computation_id,
            task_ids.len()
        );
    }

    pub fn ping(&self) -> AgentPingResponse {
        let (cpu_percent, mem_bytes) = {
            let mut sys = self.inner.sys.lock().unwrap();
            sys.refresh_cpu();
            sys.refresh_memory();
            (sys.global_cpu_info().cpu_usage(), sys.used_memory())
        };
        AgentPingResponse {
            busy: self.inner.current.lock().unwrap().is_some(),
            cpu_percent,
            mem_bytes,
        }
    }
}
