use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::protocol::TaskResult;
use common::TaskId;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/* ---------------- estados de un resultado ---------------- */

/// Un resultado puede llegar antes de que alguien lo espere, o al revés.
/// La entrada guarda al que llegó primero; el segundo resuelve la carrera.
enum ResultState {
    /// El resultado llegó y nadie lo pidió todavía.
    Available {
        result: TaskResult,
        created_at: Instant,
    },
    /// Alguien espera un resultado que todavía no llegó.
    Requested {
        observer: oneshot::Sender<TaskResult>,
        created_at: Instant,
    },
}

/// Lo que recibe quien registra un observador.
pub enum Registration {
    /// El resultado ya estaba: se consume en el acto.
    Ready(TaskResult),
    /// Todavía no llegó: esperar por el canal.
    Pending(oneshot::Receiver<TaskResult>),
}

/// Punto de encuentro entre los pushes de los agentes y los workers remotos
/// que esperan. Cada entrada vive a lo sumo un TTL; el barrido corre aparte.
pub struct ResultCollector {
    entries: Mutex<HashMap<TaskId, ResultState>>,
    available_ttl: Duration,
    requested_ttl: Duration,
}

impl ResultCollector {
    pub fn new(available_ttl: Duration, requested_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            available_ttl,
            requested_ttl,
        })
    }

    /// Entrega un resultado. Si ya había un observador esperando, se lo
    /// mandamos y la entrada desaparece; si no, queda disponible hasta que
    /// alguien lo pida o lo barra el TTL.
    pub fn push_result(&self, task_id: &TaskId, result: TaskResult) {
        let observer = {
            let mut entries = self.entries.lock().unwrap();
            match entries.remove(task_id) {
                Some(ResultState::Requested { observer, .. }) => Some((observer, result)),
                Some(ResultState::Available { result, created_at }) => {
                    // un duplicado tardío; el primero ya ganó
                    warn!("resultado duplicado para la tarea {}, descartamos el nuevo", task_id);
                    entries.insert(task_id.clone(), ResultState::Available { result, created_at });
                    None
                }
                None => {
                    debug!("resultado de la tarea {} guardado, nadie lo espera aún", task_id);
                    entries.insert(
                        task_id.clone(),
                        ResultState::Available {
                            result,
                            created_at: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        if let Some((observer, result)) = observer {
            if observer.send(result).is_err() {
                warn!("el observador de la tarea {} ya no escucha", task_id);
            }
        }
    }

    /// Registra interés por el resultado de una tarea.
    ///
    /// Si ya llegó, se consume acá mismo. Si había otro observador, lo
    /// pisamos: su canal se corta y el interesado nuevo se queda con la
    /// espera (la antigüedad de la entrada no cambia).
    pub fn register_observer(&self, task_id: &TaskId) -> Registration {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(task_id) {
            Some(ResultState::Available { result, .. }) => Registration::Ready(result),
            Some(ResultState::Requested { created_at, .. }) => {
                warn!("ya había un observador para la tarea {}, lo pisamos", task_id);
                let (tx, rx) = oneshot::channel();
                entries.insert(
                    task_id.clone(),
                    ResultState::Requested {
                        observer: tx,
                        created_at,
                    },
                );
                Registration::Pending(rx)
            }
            None => {
                let (tx, rx) = oneshot::channel();
                entries.insert(
                    task_id.clone(),
                    ResultState::Requested {
                        observer: tx,
                        created_at: Instant::now(),
                    },
                );
                Registration::Pending(rx)
            }
        }
    }

    /// Tira la entrada de una tarea, llegue lo que llegue después.
    pub fn remove(&self, task_id: &TaskId) {
        self.entries.lock().unwrap().remove(task_id);
    }

    /// Un barrido: borra las entradas que superaron su TTL y devuelve cuántas.
    pub fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|task_id, state| match state {
            ResultState::Available { created_at, .. } => {
                let vive = now.duration_since(*created_at) < self.available_ttl;
                if !vive {
                    info!("el resultado de la tarea {} venció sin que nadie lo pidiera", task_id);
                }
                vive
            }
            ResultState::Requested { created_at, .. } => {
                let vive = now.duration_since(*created_at) < self.requested_ttl;
                if !vive {
                    // al soltar el sender, el observador recibe el corte
                    warn!("la espera del resultado de la tarea {} venció", task_id);
                }
                vive
            }
        });
        before - entries.len()
    }

    /// Loop de limpieza periódica; corre hasta que el proceso muera.
    pub async fn run_cleanup_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = self.sweep_once();
            if evicted > 0 {
                debug!("barrido del collector: {} entradas vencidas", evicted);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
