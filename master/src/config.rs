use std::env;
use std::time::Duration;

const DEFAULT_RESCHEDULE_START_PERCENTAGE: u64 = 75;
const DEFAULT_RESCHEDULE_EVERY: u64 = 3;
const DEFAULT_WAIT_TIME_MS: u64 = 2_000;
const DEFAULT_AGENT_TASK_TRIGGERING_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_AGENT_PINGER_DELAY_MS: u64 = 3_000;
const DEFAULT_AVAILABLE_RESULT_TTL_MS: u64 = 30_000;
const DEFAULT_REQUESTED_RESULT_TTL_MS: u64 = 120_000;
const DEFAULT_RESULT_CLEANUP_INTERVAL_MS: u64 = 10_000;
const DEFAULT_SHIPPING_CACHE_CAPACITY: u64 = 64;

/// Parámetros del master. Todos se pueden sobreescribir por env var; los
/// defaults sirven para correr local.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Porcentaje de inputs completados (0-100) a partir del cual el wait
    /// loop empieza a contar ciclos para la re-ejecución especulativa.
    pub reschedule_start_percentage: u64,
    /// Cada cuántos ciclos completos se duplican los inputs pendientes.
    pub reschedule_every: u64,
    /// Duración de un ciclo del wait loop.
    pub wait_time: Duration,
    /// Timeout del POST run_task contra un agente.
    pub agent_task_triggering_timeout: Duration,
    /// Cadencia del pinger de vida de cada agente.
    pub agent_pinger_delay: Duration,
    /// TTL de un resultado que llegó antes de que alguien lo pidiera.
    pub available_result_ttl: Duration,
    /// TTL de un observador que espera un resultado que no llega.
    pub requested_result_ttl: Duration,
    /// Cadencia del sweep de limpieza de resultados.
    pub result_cleanup_interval: Duration,
    /// Capacidad del cache LRU de descriptores embarcados.
    pub shipping_cache_capacity: usize,
    /// Dónde escucha el HTTP del master.
    pub bind_addr: String,
    /// Backend de resultados de los workers locales: "memory" o "file".
    pub store_kind: String,
    pub store_dir: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            reschedule_start_percentage: DEFAULT_RESCHEDULE_START_PERCENTAGE,
            reschedule_every: DEFAULT_RESCHEDULE_EVERY,
            wait_time: Duration::from_millis(DEFAULT_WAIT_TIME_MS),
            agent_task_triggering_timeout: Duration::from_millis(
                DEFAULT_AGENT_TASK_TRIGGERING_TIMEOUT_MS,
            ),
            agent_pinger_delay: Duration::from_millis(DEFAULT_AGENT_PINGER_DELAY_MS),
            available_result_ttl: Duration::from_millis(DEFAULT_AVAILABLE_RESULT_TTL_MS),
            requested_result_ttl: Duration::from_millis(DEFAULT_REQUESTED_RESULT_TTL_MS),
            result_cleanup_interval: Duration::from_millis(DEFAULT_RESULT_CLEANUP_INTERVAL_MS),
            shipping_cache_capacity: DEFAULT_SHIPPING_CACHE_CAPACITY as usize,
            bind_addr: "0.0.0.0:8080".to_string(),
            store_kind: "memory".to_string(),
            store_dir: "/data/results".to_string(),
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Self {
        Self {
            reschedule_start_percentage: env_u64(
                "RESCHEDULE_START_PERCENTAGE",
                DEFAULT_RESCHEDULE_START_PERCENTAGE,
            ),
            reschedule_every: env_u64("RESCHEDULE_EVERY", DEFAULT_RESCHEDULE_EVERY),
            wait_time: env_millis("WAIT_TIME_MS", DEFAULT_WAIT_TIME_MS),
            agent_task_triggering_timeout: env_millis(
                "AGENT_TASK_TRIGGERING_TIMEOUT_MS",
                DEFAULT_AGENT_TASK_TRIGGERING_TIMEOUT_MS,
            ),
            agent_pinger_delay: env_millis("AGENT_PINGER_DELAY_MS", DEFAULT_AGENT_PINGER_DELAY_MS),
            available_result_ttl: env_millis(
                "AVAILABLE_RESULT_TTL_MS",
                DEFAULT_AVAILABLE_RESULT_TTL_MS,
            ),
            requested_result_ttl: env_millis(
                "REQUESTED_RESULT_TTL_MS",
                DEFAULT_REQUESTED_RESULT_TTL_MS,
            ),
            result_cleanup_interval: env_millis(
                "RESULT_CLEANUP_INTERVAL_MS",
                DEFAULT_RESULT_CLEANUP_INTERVAL_MS,
            ),
            shipping_cache_capacity: env_u64(
                "SHIPPING_CACHE_CAPACITY",
                DEFAULT_SHIPPING_CACHE_CAPACITY,
            ) as usize,
            bind_addr: env::var("MASTER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            store_kind: env::var("STORE_KIND").unwrap_or_else(|_| "memory".to_string()),
            store_dir: env::var("STORE_DIR").unwrap_or_else(|_| "/data/results".to_string()),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(name, default))
}
