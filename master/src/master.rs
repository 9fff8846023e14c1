use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use common::engine;
use common::instruction::{MapInstruction, ReduceInstruction};
use common::protocol::ComputationStatus;
use common::task::TaskPayload;
use common::{ComputationId, TaskId};
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::MasterConfig;
use crate::pool::Pool;
use crate::task::{TaskState, WorkerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    None,
    Map,
    Shuffle,
    Reduce,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::None => "NONE",
            Phase::Map => "MAP",
            Phase::Shuffle => "SHUFFLE",
            Phase::Reduce => "REDUCE",
        }
    }
}

struct Progress {
    computation_id: Option<ComputationId>,
    phase: Phase,
    total_inputs: usize,
    completed_inputs: usize,
}

/// El orquestador: corre una computación Map/Reduce completa contra el pool.
///
/// Cada fase corre con duplicación especulativa: cuando la mayoría terminó
/// (`reschedule_start_percentage`), cada `reschedule_every` ciclos de espera
/// los inputs rezagados se duplican en otro worker. Gana el primero que
/// termina; al perdedor lo ignoramos y tiramos su resultado.
pub struct Master {
    pool: Arc<Pool>,
    cfg: MasterConfig,
    /// Toda transición terminal de una tarea avisa acá; el wait loop escucha.
    events: Arc<Notify>,
    progress: Mutex<Progress>,
}

impl Master {
    pub fn new(pool: Arc<Pool>, cfg: MasterConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cfg,
            events: Arc::new(Notify::new()),
            progress: Mutex::new(Progress {
                computation_id: None,
                phase: Phase::None,
                total_inputs: 0,
                completed_inputs: 0,
            }),
        })
    }

    pub fn status(&self) -> ComputationStatus {
        let progress = self.progress.lock().unwrap();
        ComputationStatus {
            computation_id: progress.computation_id.clone(),
            phase: progress.phase.as_str().to_string(),
            total_inputs: progress.total_inputs,
            completed_inputs: progress.completed_inputs,
        }
    }

    /// Corre la computación entera: MAP, SHUFFLE, REDUCE y la recolección
    /// final. Devuelve clave → resultado del reduce.
    pub async fn run_computation(
        &self,
        map_instruction: Arc<dyn MapInstruction>,
        combiner: Option<Arc<dyn ReduceInstruction>>,
        reduce_instruction: Arc<dyn ReduceInstruction>,
        inputs: Vec<String>,
    ) -> anyhow::Result<HashMap<String, String>> {
        let computation_id = uuid::Uuid::new_v4().to_string();
        info!(
            "computación {} arranca con {} inputs",
            computation_id,
            inputs.len()
        );
        if inputs.is_empty() {
            return Ok(HashMap::new());
        }

        // los ids de TODAS las instancias, también duplicados y perdedores,
        // para la purga final
        let mut all_task_ids: Vec<TaskId> = Vec::new();

        // 1) MAP: una tarea por input
        self.set_phase(&computation_id, Phase::Map, inputs.len());
        let payloads: Vec<TaskPayload> = inputs
            .iter()
            .map(|input| TaskPayload::Map {
                instruction: map_instruction.clone(),
                combiner: combiner.clone(),
                input: input.clone(),
            })
            .collect();
        let map_winners = self
            .run_phase(&computation_id, payloads, &mut all_task_ids)
            .await;

        // 2) SHUFFLE: juntar los pares de los ganadores y agrupar por clave
        self.set_phase(&computation_id, Phase::Shuffle, inputs.len());
        let mut batches = Vec::with_capacity(map_winners.len());
        for task in &map_winners {
            let worker = task
                .worker()
                .ok_or_else(|| anyhow!("la tarea {} terminó sin worker asignado", task.id))?;
            batches.push(worker.map_results(&task.id).await?);
        }
        let groups = engine::shuffle_pairs(batches);
        info!(
            "computación {}: el shuffle dejó {} claves",
            computation_id,
            groups.len()
        );

        // 3) REDUCE: una tarea por clave
        self.set_phase(&computation_id, Phase::Reduce, groups.len());
        let payloads: Vec<TaskPayload> = groups
            .into_iter()
            .map(|(key, values)| TaskPayload::Reduce {
                instruction: reduce_instruction.clone(),
                key,
                values,
            })
            .collect();
        let reduce_winners = self
            .run_phase(&computation_id, payloads, &mut all_task_ids)
            .await;

        // 4) recolección: leerle a cada ganador su valor final
        let mut output = HashMap::new();
        for task in &reduce_winners {
            let key = match &task.payload {
                TaskPayload::Reduce { key, .. } => key.clone(),
                TaskPayload::Map { .. } => continue,
            };
            let worker = task
                .worker()
                .ok_or_else(|| anyhow!("la tarea {} terminó sin worker asignado", task.id))?;
            let value = worker
                .reduce_results(&task.id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("la tarea {} no dejó resultado de reduce", task.id))?;
            output.insert(key, value);
        }

        // 5) limpieza: que ningún worker se quede con restos
        self.pool
            .purge_computation(&computation_id, &all_task_ids)
            .await;
        self.set_idle();
        info!(
            "computación {} terminó con {} claves",
            computation_id,
            output.len()
        );
        Ok(output)
    }

    /// Corre una fase hasta que cada input tenga un ganador.
    ///
    /// El loop duerme en un select: o pasa un ciclo de espera completo
    /// (tick) o una tarea llega a estado terminal y nos despierta antes.
    /// El contador de la cadencia avanza SOLO con ciclos completos.
    async fn run_phase(
        &self,
        computation_id: &ComputationId,
        payloads: Vec<TaskPayload>,
        all_task_ids: &mut Vec<TaskId>,
    ) -> Vec<Arc<WorkerTask>> {
        let total = payloads.len();
        let mut active: Vec<(usize, Arc<WorkerTask>)> = Vec::with_capacity(total);
        for (idx, payload) in payloads.iter().enumerate() {
            let task = self.spawn_task(computation_id, payload.clone(), all_task_ids);
            active.push((idx, task));
        }

        // done[idx] = ese input ya tiene ganador
        let mut done = vec![false; total];
        let mut finished: Vec<(usize, Arc<WorkerTask>)> = Vec::with_capacity(total);
        let mut counter: u64 = 0;

        let mut ticker = interval_at(Instant::now() + self.cfg.wait_time, self.cfg.wait_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !active.is_empty() {
            let full_cycle = tokio::select! {
                _ = ticker.tick() => true,
                _ = self.events.notified() => false,
            };

            let mut aborts: Vec<Arc<WorkerTask>> = Vec::new();
            let mut failed_idxs: Vec<usize> = Vec::new();

            // clasificar las instancias que llegaron a un estado terminal
            active.retain(|(idx, task)| match task.state() {
                TaskState::Completed => {
                    if done[*idx] {
                        // también terminó, pero otro ya había ganado
                        aborts.push(task.clone());
                    } else {
                        done[*idx] = true;
                        finished.push((*idx, task.clone()));
                    }
                    false
                }
                TaskState::Failed | TaskState::Aborted => {
                    failed_idxs.push(*idx);
                    false
                }
                _ => true,
            });

            // los duplicados que siguen corriendo con el input ya ganado
            active.retain(|(idx, task)| {
                if done[*idx] {
                    aborts.push(task.clone());
                    false
                } else {
                    true
                }
            });

            // un fallo sin ganador ni corredor se reencola al instante
            for idx in failed_idxs {
                if done[idx] || active.iter().any(|(i, _)| *i == idx) {
                    continue;
                }
                info!("reencolamos el input {} después de un fallo", idx);
                let task = self.spawn_task(computation_id, payloads[idx].clone(), all_task_ids);
                active.push((idx, task));
            }

            // ignorar al perdedor: estado abortado y su resultado a la basura
            for task in aborts {
                task.abort();
                if let Some(worker) = task.worker() {
                    let task_id = task.id.clone();
                    tokio::spawn(async move {
                        worker.abort(&task_id).await;
                    });
                }
            }

            let completed = done.iter().filter(|d| **d).count();
            self.note_progress(completed);

            if full_cycle {
                let pct = (completed * 100 / total) as u64;
                if pct >= self.cfg.reschedule_start_percentage {
                    counter += 1;
                    debug!("fase al {}%, ciclo de espera {}", pct, counter);
                    if counter >= self.cfg.reschedule_every {
                        counter = 0;
                        for idx in 0..total {
                            if !done[idx] {
                                info!(
                                    "duplicado especulativo para el input {} (fase al {}%)",
                                    idx, pct
                                );
                                let task = self.spawn_task(
                                    computation_id,
                                    payloads[idx].clone(),
                                    all_task_ids,
                                );
                                active.push((idx, task));
                            }
                        }
                    }
                }
            }
        }

        self.note_progress(total);
        finished.sort_by_key(|(idx, _)| *idx);
        finished.into_iter().map(|(_, task)| task).collect()
    }

    fn spawn_task(
        &self,
        computation_id: &ComputationId,
        payload: TaskPayload,
        all_task_ids: &mut Vec<TaskId>,
    ) -> Arc<WorkerTask> {
        let task = WorkerTask::new(computation_id.clone(), payload, self.events.clone());
        all_task_ids.push(task.id.clone());
        self.pool.enqueue_task(task.clone());
        task
    }

    fn set_phase(&self, computation_id: &ComputationId, phase: Phase, total: usize) {
        let mut progress = self.progress.lock().unwrap();
        progress.computation_id = Some(computation_id.clone());
        progress.phase = phase;
        progress.total_inputs = total;
        progress.completed_inputs = 0;
        info!("computación {} entra en fase {}", computation_id, phase.as_str());
    }

    fn note_progress(&self, completed: usize) {
        self.progress.lock().unwrap().completed_inputs = completed;
    }

    fn set_idle(&self) {
        let mut progress = self.progress.lock().unwrap();
        progress.computation_id = None;
        progress.phase = Phase::None;
        progress.total_inputs = 0;
        progress.completed_inputs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::LocalWorker;
    use common::instruction::{InstructionError, KeyValue};
    use common::store::MemoryResultStore;
    use common::wordcount::{FirstChar, SumValues, WordSplit};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Condvar;
    use std::time::Duration;

    fn armar_master(cfg: MasterConfig, workers: usize) -> Arc<Master> {
        let pool = Pool::new();
        for i in 0..workers {
            let store = Arc::new(MemoryResultStore::new());
            let worker = LocalWorker::new(&format!("local-{}", i), &pool, store);
            pool.donate_worker(worker);
        }
        tokio::spawn(pool.clone().run_dispatch_loop());
        Master::new(pool, cfg)
    }

    fn esperado(pares: &[(&str, &str)]) -> HashMap<String, String> {
        pares
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn cuenta_la_primera_letra_de_cada_input() {
        let master = armar_master(MasterConfig::default(), 2);

        let result = master
            .run_computation(
                Arc::new(FirstChar),
                None,
                Arc::new(SumValues),
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(result, esperado(&[("a", "1"), ("b", "1"), ("c", "1")]));
        // al terminar el master queda ocioso
        let status = master.status();
        assert_eq!(status.phase, "NONE");
        assert!(status.computation_id.is_none());
    }

    #[tokio::test]
    async fn wordcount_con_combiner_da_los_totales_correctos() {
        let master = armar_master(MasterConfig::default(), 2);

        let result = master
            .run_computation(
                Arc::new(WordSplit::new(1)),
                Some(Arc::new(SumValues)),
                Arc::new(SumValues),
                vec!["hola hola mundo".to_string(), "mundo a".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(result, esperado(&[("hola", "2"), ("mundo", "2"), ("a", "1")]));
    }

    #[tokio::test]
    async fn sin_inputs_devuelve_vacio_sin_tocar_el_pool() {
        let master = armar_master(MasterConfig::default(), 1);

        let result = master
            .run_computation(
                Arc::new(FirstChar),
                None,
                Arc::new(SumValues),
                Vec::new(),
            )
            .await
            .unwrap();

        assert!(result.is_empty());
    }

    /// Map que falla la primera vez y después anda.
    struct FallaUnaVez {
        calls: AtomicU64,
    }

    impl common::instruction::MapInstruction for FallaUnaVez {
        fn name(&self) -> &'static str {
            "falla_una_vez"
        }

        fn map(&self, input: &str) -> Result<Vec<KeyValue>, InstructionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(InstructionError::Logic("la primera siempre falla".to_string()));
            }
            Ok(vec![(input.to_string(), "1".to_string())])
        }
    }

    #[tokio::test]
    async fn un_fallo_se_reencola_al_instante_sin_esperar_el_tick() {
        // wait_time enorme: si el reencolado dependiera del tick, esto tardaría
        let cfg = MasterConfig {
            wait_time: Duration::from_secs(5),
            ..MasterConfig::default()
        };
        let master = armar_master(cfg, 1);

        let inicio = std::time::Instant::now();
        let result = master
            .run_computation(
                Arc::new(FallaUnaVez {
                    calls: AtomicU64::new(0),
                }),
                None,
                Arc::new(SumValues),
                vec!["x".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(result, esperado(&[("x", "1")]));
        assert!(inicio.elapsed() < Duration::from_secs(4));
    }

    type Gate = Arc<(Mutex<bool>, Condvar)>;

    /// Map instantáneo salvo la primera llamada, que espera la compuerta.
    struct LentaLaPrimera {
        calls: Arc<AtomicU64>,
        gate: Gate,
    }

    impl common::instruction::MapInstruction for LentaLaPrimera {
        fn name(&self) -> &'static str {
            "lenta_la_primera"
        }

        fn map(&self, input: &str) -> Result<Vec<KeyValue>, InstructionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let (lock, cv) = &*self.gate;
                let mut abierta = lock.lock().unwrap();
                while !*abierta {
                    abierta = cv.wait(abierta).unwrap();
                }
            }
            Ok(vec![(input.to_string(), "1".to_string())])
        }
    }

    fn abrir(gate: &Gate) {
        let (lock, cv) = &**gate;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    /// La propiedad de la cadencia: con el 90% listo y reschedule_every = 2,
    /// el rezagado se duplica recién después de DOS ciclos completos, la
    /// computación termina con el original todavía colgado, y hubo
    /// exactamente un duplicado.
    #[tokio::test]
    async fn un_rezagado_se_duplica_tras_la_cadencia_y_gana_el_duplicado() {
        let cfg = MasterConfig {
            reschedule_start_percentage: 90,
            reschedule_every: 2,
            wait_time: Duration::from_millis(100),
            ..MasterConfig::default()
        };
        let master = armar_master(cfg, 2);

        let calls = Arc::new(AtomicU64::new(0));
        let gate: Gate = Arc::new((Mutex::new(false), Condvar::new()));
        let inputs: Vec<String> = (0..10).map(|i| format!("i{}", i)).collect();

        let inicio = std::time::Instant::now();
        let result = master
            .run_computation(
                Arc::new(LentaLaPrimera {
                    calls: calls.clone(),
                    gate: gate.clone(),
                }),
                None,
                Arc::new(SumValues),
                inputs.clone(),
            )
            .await
            .unwrap();
        let duracion = inicio.elapsed();

        // terminó con el original todavía atascado en la compuerta
        let esperados: HashMap<String, String> = inputs
            .iter()
            .map(|i| (i.clone(), "1".to_string()))
            .collect();
        assert_eq!(result, esperados);

        // 10 originales + exactamente 1 duplicado especulativo
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        // y ese duplicado esperó los dos ciclos de la cadencia
        assert!(duracion >= Duration::from_millis(200));

        abrir(&gate);
    }
}
