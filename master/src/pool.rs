use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use common::{ComputationId, TaskId, WorkerId};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::task::WorkerTask;
use crate::worker::Worker;

/* ---------------- estado interno ---------------- */

struct PoolInner {
    /// Tareas esperando worker, en orden FIFO.
    pending: VecDeque<Arc<WorkerTask>>,
    /// Workers libres, en orden FIFO.
    available: VecDeque<Arc<dyn Worker>>,
    /// Workers con una tarea asignada, por id.
    working: HashMap<WorkerId, Arc<dyn Worker>>,
}

/// Pool compartido de workers y cola de tareas.
///
/// Todo el emparejamiento pasa por `run_dispatch_loop`: un único loop que
/// saca de ambas colas bajo el mismo lock, así un worker nunca recibe dos
/// tareas a la vez y una tarea nunca sale dos veces.
pub struct Pool {
    inner: Mutex<PoolInner>,
    /// Despierta al dispatch loop cuando entra un worker o una tarea.
    wakeup: Notify,
}

impl Pool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                pending: VecDeque::new(),
                available: VecDeque::new(),
                working: HashMap::new(),
            }),
            wakeup: Notify::new(),
        })
    }

    /// Suma un worker nuevo (o uno que vuelve) a la cola de disponibles.
    pub fn donate_worker(&self, worker: Arc<dyn Worker>) {
        {
            let mut inner = self.inner.lock().unwrap();
            info!("worker {} disponible en el pool", worker.id());
            inner.available.push_back(worker);
        }
        self.wakeup.notify_one();
    }

    /// Encola una tarea para despacharla cuando haya worker libre.
    pub fn enqueue_task(&self, task: Arc<WorkerTask>) {
        if !task.set_state(crate::task::TaskState::Enqueued) {
            warn!("la tarea {} no se pudo encolar, la salteamos", task.id);
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.push_back(task);
        }
        self.wakeup.notify_one();
    }

    /// Un worker terminó su tarea y quiere volver a la cola de disponibles.
    ///
    /// Devuelve `false` si el pool ya no lo conoce (lo dieron por muerto
    /// mientras trabajaba): en ese caso el worker NO debe volver a usarse.
    pub fn worker_is_finished(&self, worker_id: &WorkerId) -> bool {
        let worker = {
            let mut inner = self.inner.lock().unwrap();
            match inner.working.remove(worker_id) {
                Some(worker) => {
                    inner.available.push_back(worker.clone());
                    Some(worker)
                }
                None => None,
            }
        };

        match worker {
            Some(_) => {
                self.wakeup.notify_one();
                true
            }
            None => {
                warn!("worker {} reportó fin pero el pool no lo conoce", worker_id);
                false
            }
        }
    }

    /// Saca un worker del pool para siempre, esté trabajando o libre.
    ///
    /// Idempotente: avisar dos veces la misma muerte no rompe nada.
    pub fn worker_died(&self, worker_id: &WorkerId) {
        let mut inner = self.inner.lock().unwrap();
        let was_working = inner.working.remove(worker_id).is_some();
        let before = inner.available.len();
        inner.available.retain(|w| w.id() != worker_id);
        if was_working || inner.available.len() < before {
            info!("worker {} murió, lo sacamos del pool", worker_id);
        }
    }

    pub fn worker_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.available.len() + inner.working.len()
    }

    /// Loop único de despacho: empareja tareas pendientes con workers libres.
    ///
    /// Corre para siempre; se duerme en `wakeup` cuando alguna de las dos
    /// colas está vacía.
    pub async fn run_dispatch_loop(self: Arc<Self>) {
        loop {
            let pair = {
                let mut inner = self.inner.lock().unwrap();
                if inner.pending.is_empty() || inner.available.is_empty() {
                    None
                } else {
                    let task = inner.pending.pop_front().unwrap();
                    let worker = inner.available.pop_front().unwrap();
                    inner.working.insert(worker.id().clone(), worker.clone());
                    Some((task, worker))
                }
            };

            match pair {
                Some((task, worker)) => {
                    if task.state().is_terminal() {
                        // la abortaron mientras esperaba en la cola
                        debug!("la tarea {} ya terminó, devolvemos el worker", task.id);
                        self.worker_is_finished(worker.id());
                        continue;
                    }
                    debug!("despachamos la tarea {} al worker {}", task.id, worker.id());
                    task.assign_worker(worker.clone());
                    worker.execute(task).await;
                }
                None => self.wakeup.notified().await,
            }
        }
    }

    /// Les pide a todos los workers que tiren los restos de una computación.
    pub async fn purge_computation(&self, computation_id: &ComputationId, task_ids: &[TaskId]) {
        let workers: Vec<Arc<dyn Worker>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .available
                .iter()
                .cloned()
                .chain(inner.working.values().cloned())
                .collect()
        };
        for worker in workers {
            worker.purge(computation_id, task_ids).await;
        }
    }
}
