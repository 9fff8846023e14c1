use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::protocol::{
    AbortRequest, AgentMetrics, AgentPingResponse, PurgeRequest, RunTaskResponse, RunTaskState,
    TaskResult,
};
use common::shipping::AgentTaskFactory;
use common::store::{ResultStore, StoreError};
use common::task::TaskPayload;
use common::{ComputationId, TaskId, WorkerId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collector::{Registration, ResultCollector};
use crate::config::MasterConfig;
use crate::pool::Pool;
use crate::task::{TaskState, WorkerTask};
use crate::worker::Worker;

/* ---------------- protocolo de vida del agente ---------------- */

/// AVAILABLE → NEW_TASK → RUNNING → AVAILABLE, o DEAD desde cualquier lado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentWorkerState {
    Available,
    NewTask,
    Running,
    Dead,
}

impl AgentWorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentWorkerState::Available => "AVAILABLE",
            AgentWorkerState::NewTask => "NEW_TASK",
            AgentWorkerState::Running => "RUNNING",
            AgentWorkerState::Dead => "DEAD",
        }
    }
}

/// La cara local de un agente remoto: traduce `execute` en el protocolo
/// HTTP contra el agente y espeja sus resultados para que el master los lea
/// igual que los de un worker local.
///
/// DEAD es definitivo: un agente muerto se re-registra y entra como un
/// worker nuevo, con otro id.
pub struct RemoteAgentWorker {
    id: WorkerId,
    base_url: String,
    hostname: String,
    registered_at: DateTime<Utc>,
    state: Mutex<AgentWorkerState>,
    /// La tarea que el agente tiene entre manos, si hay una.
    current: Mutex<Option<Arc<WorkerTask>>>,
    pool: Weak<Pool>,
    collector: Arc<ResultCollector>,
    factory: Arc<AgentTaskFactory>,
    /// Copia local de los resultados del agente; SHUFFLE y collect leen de acá.
    mirror: Arc<dyn ResultStore>,
    client: reqwest::Client,
    triggering_timeout: Duration,
    pinger_delay: Duration,
    last_load: Mutex<Option<(f32, u64)>>,
    last_ping_at: Mutex<Option<Instant>>,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl RemoteAgentWorker {
    pub fn new(
        id: WorkerId,
        base_url: String,
        hostname: String,
        pool: &Arc<Pool>,
        collector: Arc<ResultCollector>,
        factory: Arc<AgentTaskFactory>,
        mirror: Arc<dyn ResultStore>,
        cfg: &MasterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            base_url,
            hostname,
            registered_at: Utc::now(),
            state: Mutex::new(AgentWorkerState::Available),
            current: Mutex::new(None),
            pool: Arc::downgrade(pool),
            collector,
            factory,
            mirror,
            client: reqwest::Client::new(),
            triggering_timeout: cfg.agent_task_triggering_timeout,
            pinger_delay: cfg.agent_pinger_delay,
            last_load: Mutex::new(None),
            last_ping_at: Mutex::new(None),
            tasks_dispatched: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> AgentWorkerState {
        *self.state.lock().unwrap()
    }

    /// Avanza el protocolo solo si estamos exactamente en `from`.
    fn transition(&self, from: AgentWorkerState, to: AgentWorkerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            warn!(
                "el agente {} no puede pasar de {:?} a {:?}: está {:?}",
                self.id, from, to, *state
            );
            return false;
        }
        *state = to;
        true
    }

    fn current_task(&self) -> Option<Arc<WorkerTask>> {
        self.current.lock().unwrap().clone()
    }

    fn clear_current(&self, task_id: &TaskId) {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().map(|t| &t.id) == Some(task_id) {
            *current = None;
        }
    }

    fn hand_back(&self) {
        if let Some(pool) = self.pool.upgrade() {
            if !pool.worker_is_finished(&self.id) {
                warn!("el pool ya no conoce al agente {}, lo damos por muerto", self.id);
                *self.state.lock().unwrap() = AgentWorkerState::Dead;
            }
        }
    }

    /// Muerte del agente: estado DEAD, su tarea en vuelo falla (el master la
    /// reencola en otro worker) y el pool lo olvida. Idempotente.
    fn die(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == AgentWorkerState::Dead {
                return;
            }
            *state = AgentWorkerState::Dead;
        }
        warn!("damos por muerto al agente {}: {}", self.id, reason);

        if let Some(task) = self.current.lock().unwrap().take() {
            self.collector.remove(&task.id);
            if task.fail() {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.worker_died(&self.id);
        }
    }

    /// El despacho completo de una tarea, de NEW_TASK a AVAILABLE (o DEAD).
    async fn run_dispatch(self: Arc<Self>, task: Arc<WorkerTask>) {
        // 1) embarcar la instrucción; un payload inembarcable no toca al agente
        let agent_task = match self.factory.build(&task.computation_id, &task.id, &task.payload) {
            Ok(agent_task) => agent_task,
            Err(err) => {
                warn!("no pudimos embarcar la tarea {}: {}", task.id, err);
                if task.fail() {
                    self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                }
                self.clear_current(&task.id);
                if self.transition(AgentWorkerState::NewTask, AgentWorkerState::Available) {
                    self.hand_back();
                }
                return;
            }
        };

        // 2) runTask contra el agente
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/api/v1/tasks/run", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.triggering_timeout)
            .json(&agent_task)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                self.die(&format!("no pudimos despachar la tarea {}: {}", task.id, err));
                return;
            }
        };
        if !resp.status().is_success() {
            self.die(&format!("el agente respondió {} al despacho", resp.status()));
            return;
        }
        let decision: RunTaskResponse = match resp.json().await {
            Ok(decision) => decision,
            Err(err) => {
                self.die(&format!("respuesta de despacho ilegible: {}", err));
                return;
            }
        };

        // 3) según la decisión del agente
        match decision.state {
            RunTaskState::Rejected => {
                info!(
                    "el agente {} rechazó la tarea {}: {}",
                    self.id,
                    task.id,
                    decision.message.as_deref().unwrap_or("sin motivo")
                );
                if task.fail() {
                    self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                }
                self.clear_current(&task.id);
                if self.transition(AgentWorkerState::NewTask, AgentWorkerState::Available) {
                    self.hand_back();
                }
            }
            RunTaskState::Accepted => {
                if !self.transition(AgentWorkerState::NewTask, AgentWorkerState::Running) {
                    // murió mientras despachábamos
                    return;
                }
                task.set_state(TaskState::InProgress);
                match self.collector.register_observer(&task.id) {
                    Registration::Ready(result) => self.apply_result(&task.id, result),
                    Registration::Pending(rx) => match rx.await {
                        Ok(result) => self.apply_result(&task.id, result),
                        Err(_) => {
                            // el collector tiró la espera (abort o TTL)
                            warn!("la espera del resultado de la tarea {} se cortó", task.id);
                            if task.fail() {
                                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                            }
                            self.clear_current(&task.id);
                            if self
                                .transition(AgentWorkerState::Running, AgentWorkerState::Available)
                            {
                                self.hand_back();
                            }
                        }
                    },
                }
            }
        }
    }

    /// Cierra la tarea en vuelo con el resultado que empujó el agente.
    fn apply_result(&self, task_id: &TaskId, result: TaskResult) {
        let task = match self.current_task() {
            Some(task) if task.id == *task_id => task,
            _ => {
                warn!("notificación vieja para la tarea {}, la ignoramos", task_id);
                return;
            }
        };

        let mut ok = result.success;
        if ok {
            if let Err(err) = self.mirror_result(&task, &result) {
                warn!("no pudimos espejar el resultado de {}: {}", task_id, err);
                ok = false;
            }
        }

        if ok {
            if task.complete() {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            info!(
                "la tarea {} falló en el agente {}: {}",
                task_id,
                self.id,
                result.error.as_deref().unwrap_or("sin detalle")
            );
            if task.fail() {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.clear_current(task_id);
        if self.transition(AgentWorkerState::Running, AgentWorkerState::Available) {
            self.hand_back();
        }
    }

    fn mirror_result(&self, task: &WorkerTask, result: &TaskResult) -> Result<(), StoreError> {
        match &task.payload {
            TaskPayload::Map { .. } => {
                if let Some(pairs) = &result.pairs {
                    for (k, v) in pairs {
                        self.mirror.store_map_result(&task.id, k, v)?;
                    }
                }
            }
            TaskPayload::Reduce { .. } => {
                if let Some(output) = &result.output {
                    self.mirror.store_reduce_result(&task.id, output)?;
                }
            }
        }
        Ok(())
    }

    /// Ping de vida periódico. El primer ping que falla mata al agente y
    /// corta el loop; el que quiera volver tiene que re-registrarse.
    pub async fn run_pinger(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.pinger_delay).await;
            if self.state() == AgentWorkerState::Dead {
                return;
            }

            let url = format!("{}/health", self.base_url);
            let resp = self
                .client
                .get(&url)
                .timeout(self.pinger_delay)
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<AgentPingResponse>().await {
                        Ok(ping) => {
                            *self.last_load.lock().unwrap() =
                                Some((ping.cpu_percent, ping.mem_bytes));
                            *self.last_ping_at.lock().unwrap() = Some(Instant::now());
                            debug!(
                                "ping del agente {}: cpu {:.1}%, mem {} bytes",
                                self.id, ping.cpu_percent, ping.mem_bytes
                            );
                        }
                        Err(err) => {
                            self.die(&format!("ping ilegible: {}", err));
                            return;
                        }
                    }
                }
                Ok(resp) => {
                    self.die(&format!("el ping respondió {}", resp.status()));
                    return;
                }
                Err(err) => {
                    self.die(&format!("el agente no contesta el ping: {}", err));
                    return;
                }
            }
        }
    }

    pub fn metrics(&self) -> AgentMetrics {
        let (cpu_percent, mem_bytes) = match *self.last_load.lock().unwrap() {
            Some((cpu, mem)) => (Some(cpu), Some(mem)),
            None => (None, None),
        };
        AgentMetrics {
            agent_id: self.id.clone(),
            hostname: self.hostname.clone(),
            base_url: self.base_url.clone(),
            state: self.state().as_str().to_string(),
            current_task: self.current.lock().unwrap().as_ref().map(|t| t.id.clone()),
            registered_at: self.registered_at,
            last_ping_secs_ago: self.last_ping_at.lock().unwrap().map(|at| at.elapsed().as_secs()),
            cpu_percent,
            mem_bytes,
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Worker for RemoteAgentWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn execute(self: Arc<Self>, task: Arc<WorkerTask>) {
        // la tarea entra a current antes del cambio de estado: si la muerte
        // se cruza en el medio, die() la encuentra ahí y la falla
        *self.current.lock().unwrap() = Some(task.clone());
        if !self.transition(AgentWorkerState::Available, AgentWorkerState::NewTask) {
            // nos despacharon estando muertos; que la tarea vuelva a la cola
            self.clear_current(&task.id);
            if task.fail() {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        tokio::spawn(self.clone().run_dispatch(task));
    }

    async fn abort(&self, task_id: &TaskId) {
        // cortar la espera local primero; el aviso al agente es best effort
        self.collector.remove(task_id);
        let _ = self.mirror.destroy(task_id);

        let url = format!("{}/api/v1/tasks/abort", self.base_url);
        let req = AbortRequest {
            task_id: task_id.clone(),
        };
        if let Err(err) = self
            .client
            .post(&url)
            .timeout(self.triggering_timeout)
            .json(&req)
            .send()
            .await
        {
            debug!("no llegó el abort de {} al agente {}: {}", task_id, self.id, err);
        }
    }

    async fn purge(&self, computation_id: &ComputationId, task_ids: &[TaskId]) {
        for task_id in task_ids {
            self.collector.remove(task_id);
            let _ = self.mirror.destroy(task_id);
        }

        let url = format!("{}/api/v1/computations/purge", self.base_url);
        let req = PurgeRequest {
            computation_id: computation_id.clone(),
            task_ids: task_ids.to_vec(),
        };
        if let Err(err) = self
            .client
            .post(&url)
            .timeout(self.triggering_timeout)
            .json(&req)
            .send()
            .await
        {
            debug!(
                "no llegó la purga de {} al agente {}: {}",
                computation_id, self.id, err
            );
        }
    }

    async fn map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError> {
        self.mirror.get_map_results(task_id)
    }

    async fn reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        self.mirror.get_reduce_results(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use common::protocol::{AbortResponse, AgentTask, AgentTaskPayload, PurgeResponse};
    use common::registry::InstructionRegistry;
    use common::store::MemoryResultStore;
    use common::wordcount::FirstChar;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /* ========= agente falso ========= */

    #[derive(Clone, Copy)]
    enum Mode {
        /// Acepta y empuja el resultado al collector un ratito después.
        AcceptAndPush,
        /// Acepta y no empuja nunca (agente colgado).
        AcceptSilent,
        Reject,
    }

    #[derive(Clone)]
    struct FakeAgent {
        collector: Arc<ResultCollector>,
        mode: Arc<Mutex<Mode>>,
        health_ok: Arc<AtomicBool>,
    }

    impl FakeAgent {
        fn new(mode: Mode, collector: Arc<ResultCollector>) -> Self {
            Self {
                collector,
                mode: Arc::new(Mutex::new(mode)),
                health_ok: Arc::new(AtomicBool::new(true)),
            }
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }
    }

    async fn fake_run(
        State(agent): State<FakeAgent>,
        Json(task): Json<AgentTask>,
    ) -> Json<RunTaskResponse> {
        let mode = *agent.mode.lock().unwrap();
        match mode {
            Mode::Reject => Json(RunTaskResponse {
                state: RunTaskState::Rejected,
                message: Some("ocupado".to_string()),
            }),
            Mode::AcceptSilent => Json(RunTaskResponse {
                state: RunTaskState::Accepted,
                message: None,
            }),
            Mode::AcceptAndPush => {
                let collector = agent.collector.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let result = match task.payload {
                        AgentTaskPayload::Map { input, .. } => TaskResult::map_ok(vec![(
                            input.chars().next().map(String::from).unwrap_or_default(),
                            "1".to_string(),
                        )]),
                        AgentTaskPayload::Reduce { values, .. } => {
                            TaskResult::reduce_ok(values.len().to_string())
                        }
                    };
                    collector.push_result(&task.task_id, result);
                });
                Json(RunTaskResponse {
                    state: RunTaskState::Accepted,
                    message: None,
                })
            }
        }
    }

    async fn fake_health(State(agent): State<FakeAgent>) -> axum::response::Response {
        if agent.health_ok.load(Ordering::SeqCst) {
            Json(AgentPingResponse {
                busy: false,
                cpu_percent: 12.5,
                mem_bytes: 1024,
            })
            .into_response()
        } else {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }

    async fn fake_abort(Json(_req): Json<AbortRequest>) -> Json<AbortResponse> {
        Json(AbortResponse { ok: true })
    }

    async fn fake_purge(Json(_req): Json<PurgeRequest>) -> Json<PurgeResponse> {
        Json(PurgeResponse { ok: true })
    }

    async fn start_fake_agent(agent: FakeAgent) -> String {
        let app = Router::new()
            .route("/api/v1/tasks/run", post(fake_run))
            .route("/api/v1/tasks/abort", post(fake_abort))
            .route("/api/v1/computations/purge", post(fake_purge))
            .route("/health", get(fake_health))
            .with_state(agent);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    /* ========= armado común ========= */

    fn collector_de_prueba() -> Arc<ResultCollector> {
        ResultCollector::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    fn factory_de_prueba() -> Arc<AgentTaskFactory> {
        Arc::new(AgentTaskFactory::new(
            Arc::new(InstructionRegistry::with_builtins()),
            8,
        ))
    }

    fn cfg_de_prueba() -> MasterConfig {
        MasterConfig {
            agent_pinger_delay: Duration::from_millis(50),
            ..MasterConfig::default()
        }
    }

    fn tarea_map(events: &Arc<Notify>, input: &str) -> Arc<WorkerTask> {
        WorkerTask::new(
            "comp-1".to_string(),
            TaskPayload::Map {
                instruction: Arc::new(FirstChar),
                combiner: None,
                input: input.to_string(),
            },
            events.clone(),
        )
    }

    async fn esperar<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("la condición nunca se cumplió");
    }

    #[tokio::test]
    async fn despacha_una_tarea_y_espeja_el_resultado() {
        let collector = collector_de_prueba();
        let fake = FakeAgent::new(Mode::AcceptAndPush, collector.clone());
        let base_url = start_fake_agent(fake).await;

        let pool = Pool::new();
        let mirror = Arc::new(MemoryResultStore::new());
        let worker = RemoteAgentWorker::new(
            "agente-1".to_string(),
            base_url,
            "host-de-prueba".to_string(),
            &pool,
            collector,
            factory_de_prueba(),
            mirror.clone(),
            &cfg_de_prueba(),
        );
        pool.donate_worker(worker.clone());
        tokio::spawn(pool.clone().run_dispatch_loop());

        let events = Arc::new(Notify::new());
        let task = tarea_map(&events, "hola");
        pool.enqueue_task(task.clone());
        esperar(|| task.state().is_terminal()).await;

        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(
            mirror.get_map_results(&task.id).unwrap(),
            vec![("h".to_string(), "1".to_string())]
        );

        // el agente volvió a AVAILABLE y sirve para la siguiente
        let otra = tarea_map(&events, "mundo");
        pool.enqueue_task(otra.clone());
        esperar(|| otra.state().is_terminal()).await;
        assert_eq!(otra.state(), TaskState::Completed);
        assert_eq!(worker.metrics().tasks_completed, 2);
    }

    #[tokio::test]
    async fn un_rechazo_falla_la_tarea_pero_no_mata_al_worker() {
        let collector = collector_de_prueba();
        let fake = FakeAgent::new(Mode::Reject, collector.clone());
        let base_url = start_fake_agent(fake.clone()).await;

        let pool = Pool::new();
        let worker = RemoteAgentWorker::new(
            "agente-1".to_string(),
            base_url,
            "host-de-prueba".to_string(),
            &pool,
            collector,
            factory_de_prueba(),
            Arc::new(MemoryResultStore::new()),
            &cfg_de_prueba(),
        );
        pool.donate_worker(worker.clone());
        tokio::spawn(pool.clone().run_dispatch_loop());

        let events = Arc::new(Notify::new());
        let task = tarea_map(&events, "x");
        pool.enqueue_task(task.clone());
        esperar(|| task.state().is_terminal()).await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(pool.worker_count(), 1);

        // cuando el agente se desocupa, el worker sigue sirviendo
        fake.set_mode(Mode::AcceptAndPush);
        let otra = tarea_map(&events, "z");
        pool.enqueue_task(otra.clone());
        esperar(|| otra.state().is_terminal()).await;
        assert_eq!(otra.state(), TaskState::Completed);
        assert_eq!(worker.metrics().tasks_failed, 1);
    }

    #[tokio::test]
    async fn un_ping_fallido_mata_al_worker_y_falla_su_tarea() {
        let collector = collector_de_prueba();
        let fake = FakeAgent::new(Mode::AcceptSilent, collector.clone());
        fake.health_ok.store(false, Ordering::SeqCst);
        let base_url = start_fake_agent(fake).await;

        let pool = Pool::new();
        let worker = RemoteAgentWorker::new(
            "agente-1".to_string(),
            base_url,
            "host-de-prueba".to_string(),
            &pool,
            collector,
            factory_de_prueba(),
            Arc::new(MemoryResultStore::new()),
            &cfg_de_prueba(),
        );
        pool.donate_worker(worker.clone());
        tokio::spawn(pool.clone().run_dispatch_loop());
        tokio::spawn(worker.clone().run_pinger());

        let events = Arc::new(Notify::new());
        let task = tarea_map(&events, "x");
        pool.enqueue_task(task.clone());

        // el agente aceptó pero nunca empuja; el pinger lo da por muerto
        esperar(|| task.state() == TaskState::Failed).await;
        assert_eq!(worker.state(), AgentWorkerState::Dead);
        assert_eq!(worker.metrics().state, "DEAD");
        assert_eq!(pool.worker_count(), 0);
    }

    /// La muerte y el despacho pueden cruzarse: gane quien gane, la tarea
    /// tiene que salir FAILED, nunca quedar ENQUEUED para siempre.
    #[tokio::test]
    async fn un_despacho_que_pierde_la_carrera_con_la_muerte_sale_failed() {
        let collector = collector_de_prueba();
        let pool = Pool::new();
        let worker = RemoteAgentWorker::new(
            "agente-1".to_string(),
            // nadie escucha acá: un worker muerto no tiene que llegar a despachar
            "http://127.0.0.1:9".to_string(),
            "host-de-prueba".to_string(),
            &pool,
            collector,
            factory_de_prueba(),
            Arc::new(MemoryResultStore::new()),
            &cfg_de_prueba(),
        );
        pool.donate_worker(worker.clone());

        // el pinger lo dio por muerto justo antes de que el pool lo empareje
        worker.die("el agente no contesta el ping");

        let events = Arc::new(Notify::new());
        let task = tarea_map(&events, "x");
        worker.clone().execute(task.clone()).await;
        esperar(|| task.state().is_terminal()).await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(worker.metrics().tasks_failed, 1);
        assert_eq!(worker.metrics().tasks_dispatched, 0);
        assert!(worker.metrics().current_task.is_none());
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn una_instruccion_no_registrada_no_viaja() {
        let collector = collector_de_prueba();
        let fake = FakeAgent::new(Mode::AcceptAndPush, collector.clone());
        let base_url = start_fake_agent(fake).await;

        let pool = Pool::new();
        // registro vacío: ni first_char está
        let factory = Arc::new(AgentTaskFactory::new(
            Arc::new(InstructionRegistry::new()),
            8,
        ));
        let worker = RemoteAgentWorker::new(
            "agente-1".to_string(),
            base_url,
            "host-de-prueba".to_string(),
            &pool,
            collector,
            factory,
            Arc::new(MemoryResultStore::new()),
            &cfg_de_prueba(),
        );
        pool.donate_worker(worker.clone());
        tokio::spawn(pool.clone().run_dispatch_loop());

        let events = Arc::new(Notify::new());
        let task = tarea_map(&events, "x");
        pool.enqueue_task(task.clone());
        esperar(|| task.state().is_terminal()).await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(worker.metrics().tasks_dispatched, 0);
        // el worker queda vivo y disponible
        assert_eq!(worker.state(), AgentWorkerState::Available);
        assert_eq!(pool.worker_count(), 1);
    }
}
