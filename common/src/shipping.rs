use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;
use thiserror::Error;

use crate::instruction::{MapInstruction, ReduceInstruction};
use crate::protocol::{AgentTask, AgentTaskPayload, ShippedInstruction};
use crate::registry::InstructionRegistry;
use crate::task::TaskPayload;
use crate::{ComputationId, TaskId};

#[derive(Debug, Error)]
pub enum ShippingError {
    /// La instrucción no está en el registro: no se puede embarcar ni cargar.
    #[error("instrucción no registrada: {0}")]
    Unregistered(String),
    #[error("configuración inválida para {name}: {reason}")]
    BadConfig { name: String, reason: String },
    #[error("el constructor de {0} entró en pánico")]
    ConstructorPanic(String),
}

/// Arma el AgentTask que viaja a un agente remoto.
///
/// Los descriptores embarcados se cachean por (computación, nombre): todas
/// las tareas de una computación llevan la misma lógica, así que codificarla
/// una sola vez alcanza. El cache es LRU acotado para que computaciones
/// viejas no acumulen memoria.
pub struct AgentTaskFactory {
    registry: Arc<InstructionRegistry>,
    cache: Mutex<LruCache<(ComputationId, String), ShippedInstruction>>,
    /// Cuántas codificaciones reales hicimos (las que no salieron del cache).
    encodes: AtomicU64,
}

impl AgentTaskFactory {
    pub fn new(registry: Arc<InstructionRegistry>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
            encodes: AtomicU64::new(0),
        }
    }

    pub fn encode_count(&self) -> u64 {
        self.encodes.load(Ordering::Relaxed)
    }

    /// Convierte el payload del master en su forma de red.
    /// Lógica no registrada se rechaza acá, antes de tocar el agente.
    pub fn build(
        &self,
        computation_id: &ComputationId,
        task_id: &TaskId,
        payload: &TaskPayload,
    ) -> Result<AgentTask, ShippingError> {
        let wire = match payload {
            TaskPayload::Map {
                instruction,
                combiner,
                input,
            } => AgentTaskPayload::Map {
                instruction: self.ship_map(computation_id, instruction.as_ref())?,
                combiner: match combiner {
                    Some(c) => Some(self.ship_reduce(computation_id, c.as_ref())?),
                    None => None,
                },
                input: input.clone(),
            },
            TaskPayload::Reduce {
                instruction,
                key,
                values,
            } => AgentTaskPayload::Reduce {
                instruction: self.ship_reduce(computation_id, instruction.as_ref())?,
                key: key.clone(),
                values: values.clone(),
            },
        };

        Ok(AgentTask {
            computation_id: computation_id.clone(),
            task_id: task_id.clone(),
            payload: wire,
        })
    }

    pub fn ship_map(
        &self,
        computation_id: &ComputationId,
        instruction: &dyn MapInstruction,
    ) -> Result<ShippedInstruction, ShippingError> {
        if !self.registry.knows_map(instruction.name()) {
            return Err(ShippingError::Unregistered(instruction.name().to_string()));
        }
        Ok(self.descriptor(computation_id, instruction.name(), || instruction.config()))
    }

    pub fn ship_reduce(
        &self,
        computation_id: &ComputationId,
        instruction: &dyn ReduceInstruction,
    ) -> Result<ShippedInstruction, ShippingError> {
        if !self.registry.knows_reduce(instruction.name()) {
            return Err(ShippingError::Unregistered(instruction.name().to_string()));
        }
        Ok(self.descriptor(computation_id, instruction.name(), || instruction.config()))
    }

    fn descriptor(
        &self,
        computation_id: &ComputationId,
        name: &str,
        encode: impl FnOnce() -> Value,
    ) -> ShippedInstruction {
        let key = (computation_id.clone(), name.to_string());
        let mut cache = self.cache.lock().unwrap();
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }

        self.encodes.fetch_add(1, Ordering::Relaxed);
        let descriptor = ShippedInstruction {
            name: name.to_string(),
            config: encode(),
        };
        cache.put(key, descriptor.clone());
        descriptor
    }
}

/// Reconstruye instrucciones desde descriptores, del lado del agente.
///
/// Las instancias construidas se cachean por (nombre, config): cargar la
/// misma lógica dos veces es barato e idempotente. Cualquier fallo (nombre
/// desconocido, config rota, constructor en pánico) sale como error; nunca
/// tira el proceso abajo.
pub struct InstructionLoader {
    registry: Arc<InstructionRegistry>,
    maps: Mutex<HashMap<(String, String), Arc<dyn MapInstruction>>>,
    reduces: Mutex<HashMap<(String, String), Arc<dyn ReduceInstruction>>>,
}

impl InstructionLoader {
    pub fn new(registry: Arc<InstructionRegistry>) -> Self {
        Self {
            registry,
            maps: Mutex::new(HashMap::new()),
            reduces: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_map(
        &self,
        descriptor: &ShippedInstruction,
    ) -> Result<Arc<dyn MapInstruction>, ShippingError> {
        let key = cache_key(descriptor);
        if let Some(hit) = self.maps.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let factory = self
            .registry
            .map_factory(&descriptor.name)
            .ok_or_else(|| ShippingError::Unregistered(descriptor.name.clone()))?;

        let built = catch_unwind(AssertUnwindSafe(|| factory(&descriptor.config)))
            .map_err(|_| ShippingError::ConstructorPanic(descriptor.name.clone()))?
            .map_err(|e| ShippingError::BadConfig {
                name: descriptor.name.clone(),
                reason: e.to_string(),
            })?;

        self.maps.lock().unwrap().insert(key, built.clone());
        Ok(built)
    }

    pub fn load_reduce(
        &self,
        descriptor: &ShippedInstruction,
    ) -> Result<Arc<dyn ReduceInstruction>, ShippingError> {
        let key = cache_key(descriptor);
        if let Some(hit) = self.reduces.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let factory = self
            .registry
            .reduce_factory(&descriptor.name)
            .ok_or_else(|| ShippingError::Unregistered(descriptor.name.clone()))?;

        let built = catch_unwind(AssertUnwindSafe(|| factory(&descriptor.config)))
            .map_err(|_| ShippingError::ConstructorPanic(descriptor.name.clone()))?
            .map_err(|e| ShippingError::BadConfig {
                name: descriptor.name.clone(),
                reason: e.to_string(),
            })?;

        self.reduces.lock().unwrap().insert(key, built.clone());
        Ok(built)
    }
}

/// La config entra en la clave: la misma instrucción con otra config es otra
/// instancia (serde_json ordena las claves de los objetos, así que el texto
/// es estable).
fn cache_key(descriptor: &ShippedInstruction) -> (String, String) {
    (descriptor.name.clone(), descriptor.config.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wordcount::{SumValues, WordSplit};
    use serde_json::json;

    fn factory_with_builtins(capacity: usize) -> AgentTaskFactory {
        AgentTaskFactory::new(Arc::new(InstructionRegistry::with_builtins()), capacity)
    }

    #[test]
    fn el_factory_cachea_descriptores_por_computacion() {
        let factory = factory_with_builtins(8);
        let ws = WordSplit::new(1);

        let first = factory.ship_map(&"comp-1".to_string(), &ws).unwrap();
        let second = factory.ship_map(&"comp-1".to_string(), &ws).unwrap();

        // mismos bytes, una única codificación real
        assert_eq!(first, second);
        assert_eq!(factory.encode_count(), 1);

        // otra computación codifica de nuevo
        let other = factory.ship_map(&"comp-2".to_string(), &ws).unwrap();
        assert_eq!(other, first);
        assert_eq!(factory.encode_count(), 2);
    }

    #[test]
    fn el_factory_rechaza_instrucciones_no_registradas() {
        struct Anonima;
        impl crate::instruction::MapInstruction for Anonima {
            fn name(&self) -> &'static str {
                "anonima"
            }
            fn map(
                &self,
                _input: &str,
            ) -> Result<Vec<crate::instruction::KeyValue>, crate::instruction::InstructionError>
            {
                Ok(Vec::new())
            }
        }

        let factory = factory_with_builtins(8);
        let res = factory.ship_map(&"comp-1".to_string(), &Anonima);

        assert!(matches!(res, Err(ShippingError::Unregistered(_))));
    }

    #[test]
    fn build_arma_el_agent_task_completo() {
        let factory = factory_with_builtins(8);
        let payload = TaskPayload::Map {
            instruction: Arc::new(WordSplit::new(1)),
            combiner: Some(Arc::new(SumValues)),
            input: "hola mundo".to_string(),
        };

        let task = factory
            .build(&"comp-1".to_string(), &"t-1".to_string(), &payload)
            .unwrap();

        assert_eq!(task.task_id, "t-1");
        match task.payload {
            AgentTaskPayload::Map {
                instruction,
                combiner,
                input,
            } => {
                assert_eq!(instruction.name, "word_split");
                assert_eq!(combiner.unwrap().name, "sum");
                assert_eq!(input, "hola mundo");
            }
            AgentTaskPayload::Reduce { .. } => panic!("esperaba un payload MAP"),
        }
    }

    #[test]
    fn el_loader_rechaza_nombres_desconocidos() {
        let loader = InstructionLoader::new(Arc::new(InstructionRegistry::with_builtins()));
        let descriptor = ShippedInstruction {
            name: "fantasma".to_string(),
            config: Value::Null,
        };

        let res = loader.load_map(&descriptor);
        assert!(matches!(res, Err(ShippingError::Unregistered(_))));
    }

    /// Cargar dos veces el mismo descriptor devuelve la MISMA instancia.
    #[test]
    fn el_loader_cachea_instancias_construidas() {
        let loader = InstructionLoader::new(Arc::new(InstructionRegistry::with_builtins()));
        let descriptor = ShippedInstruction {
            name: "word_split".to_string(),
            config: json!({ "min_len": 2 }),
        };

        let a = loader.load_map(&descriptor).unwrap();
        let b = loader.load_map(&descriptor).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn la_misma_instruccion_con_otra_config_es_otra_instancia() {
        let loader = InstructionLoader::new(Arc::new(InstructionRegistry::with_builtins()));

        let a = loader
            .load_map(&ShippedInstruction {
                name: "word_split".to_string(),
                config: json!({ "min_len": 1 }),
            })
            .unwrap();
        let b = loader
            .load_map(&ShippedInstruction {
                name: "word_split".to_string(),
                config: json!({ "min_len": 3 }),
            })
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn el_loader_convierte_configs_rotas_en_error() {
        let loader = InstructionLoader::new(Arc::new(InstructionRegistry::with_builtins()));
        let descriptor = ShippedInstruction {
            name: "word_split".to_string(),
            config: json!({ "min_len": "cuatro" }),
        };

        let res = loader.load_map(&descriptor);
        assert!(matches!(res, Err(ShippingError::BadConfig { .. })));
    }

    /// Un constructor que entra en pánico no tira el proceso: sale como error.
    #[test]
    fn el_loader_aisla_panicos_del_constructor() {
        let mut registry = InstructionRegistry::new();
        registry.register_map("explosiva", |_config| panic!("boom"));

        let loader = InstructionLoader::new(Arc::new(registry));
        let descriptor = ShippedInstruction {
            name: "explosiva".to_string(),
            config: Value::Null,
        };

        let res = loader.load_map(&descriptor);
        assert!(matches!(res, Err(ShippingError::ConstructorPanic(_))));
    }
}
