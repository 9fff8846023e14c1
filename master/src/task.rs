use std::sync::{Arc, Mutex};

use common::task::TaskPayload;
use common::{ComputationId, TaskId};
use tokio::sync::Notify;
use tracing::warn;

use crate::worker::Worker;

/// Ciclo de vida de una tarea dentro del master.
///
/// INITIATED → ENQUEUED → INPROGRESS → {COMPLETED | FAILED | ABORTED}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initiated,
    Enqueued,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted
        )
    }
}

/// Una tarea concreta (Map o Reduce) de una computación.
///
/// Una tarea fallida no se resucita: el master crea una tarea nueva con el
/// mismo input lógico. El estado solo cambia vía `set_state`, que garantiza
/// que cada instancia ve a lo sumo un estado terminal.
pub struct WorkerTask {
    pub computation_id: ComputationId,
    pub id: TaskId,
    pub payload: TaskPayload,
    state: Mutex<TaskState>,
    /// El worker al que se le asignó la tarea (None hasta el despacho).
    worker: Mutex<Option<Arc<dyn Worker>>>,
    /// Compartido con el wait loop del master: toda transición terminal avisa.
    events: Arc<Notify>,
}

impl WorkerTask {
    pub fn new(
        computation_id: ComputationId,
        payload: TaskPayload,
        events: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            computation_id,
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            state: Mutex::new(TaskState::Initiated),
            worker: Mutex::new(None),
            events,
        })
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    /// Intenta la transición al estado nuevo y devuelve si se aplicó.
    ///
    /// Se rechazan la transición al mismo estado (caza dobles finales en
    /// carrera) y cualquier salida de un estado terminal. Un rechazo queda
    /// logueado y descartado; al que llega tarde no le toca nada.
    pub fn set_state(&self, new: TaskState) -> bool {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if *state == new || state.is_terminal() {
                warn!(
                    "transición inválida {:?} -> {:?} en la tarea {} (descartada)",
                    *state, new, self.id
                );
                return false;
            }
            *state = new;
            new.is_terminal()
        };

        if notify {
            self.events.notify_one();
        }
        true
    }

    pub fn assign_worker(&self, worker: Arc<dyn Worker>) {
        *self.worker.lock().unwrap() = Some(worker);
    }

    pub fn worker(&self) -> Option<Arc<dyn Worker>> {
        self.worker.lock().unwrap().clone()
    }

    pub fn complete(&self) -> bool {
        self.set_state(TaskState::Completed)
    }

    pub fn fail(&self) -> bool {
        self.set_state(TaskState::Failed)
    }

    pub fn abort(&self) -> bool {
        self.set_state(TaskState::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::wordcount::FirstChar;
    use std::time::Duration;

    fn task_de_prueba(events: Arc<Notify>) -> Arc<WorkerTask> {
        WorkerTask::new(
            "comp-1".to_string(),
            TaskPayload::Map {
                instruction: Arc::new(FirstChar),
                combiner: None,
                input: "a".to_string(),
            },
            events,
        )
    }

    #[test]
    fn la_transicion_al_mismo_estado_se_rechaza() {
        let task = task_de_prueba(Arc::new(Notify::new()));

        assert!(task.set_state(TaskState::Enqueued));
        assert!(!task.set_state(TaskState::Enqueued));
        assert_eq!(task.state(), TaskState::Enqueued);
    }

    #[test]
    fn no_se_sale_de_un_estado_terminal() {
        let task = task_de_prueba(Arc::new(Notify::new()));

        task.set_state(TaskState::Enqueued);
        task.set_state(TaskState::InProgress);
        assert!(task.complete());

        // llegó tarde: la tarea ya terminó
        assert!(!task.fail());
        assert!(!task.abort());
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn el_ciclo_normal_avanza_estado_por_estado() {
        let task = task_de_prueba(Arc::new(Notify::new()));

        assert_eq!(task.state(), TaskState::Initiated);
        assert!(task.set_state(TaskState::Enqueued));
        assert!(task.set_state(TaskState::InProgress));
        assert!(task.fail());
        assert_eq!(task.state(), TaskState::Failed);
    }

    /// Las transiciones terminales dejan un aviso en el Notify compartido.
    #[tokio::test]
    async fn una_transicion_terminal_notifica_al_wait_loop() {
        let events = Arc::new(Notify::new());
        let task = task_de_prueba(events.clone());

        task.set_state(TaskState::Enqueued);
        task.set_state(TaskState::InProgress);
        task.complete();

        // notify_one dejó el permiso guardado: esto vuelve enseguida
        tokio::time::timeout(Duration::from_secs(1), events.notified())
            .await
            .expect("no llegó la notificación de la transición terminal");
    }
}
