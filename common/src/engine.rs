use std::collections::HashMap;

use crate::instruction::{InstructionError, KeyValue, MapInstruction, ReduceInstruction};
use crate::protocol::TaskResult;
use crate::store::{ResultStore, StoreError};
use crate::task::TaskPayload;
use crate::TaskId;

/// Ejecuta la parte Map de una tarea sobre un input lógico completo.
///
/// Si hay combiner, los pares se agrupan por clave y se colapsan localmente
/// antes de devolverlos; las claves salen ordenadas para que el resultado sea
/// determinista.
pub fn run_map_task(
    instruction: &dyn MapInstruction,
    combiner: Option<&dyn ReduceInstruction>,
    input: &str,
) -> Result<Vec<KeyValue>, InstructionError> {
    let pairs = instruction.map(input)?;

    let combiner = match combiner {
        Some(c) => c,
        None => return Ok(pairs),
    };

    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in pairs {
        grouped.entry(k).or_default().push(v);
    }

    let mut entries: Vec<(String, Vec<String>)> = grouped.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(entries.len());
    for (key, values) in entries {
        let combined = combiner.reduce(&key, &values)?;
        out.push((key, combined));
    }
    Ok(out)
}

/// Shuffle: agrupa los pares intermedios de todas las tareas Map por clave.
///
/// El orden de los valores respeta el orden en que entran los lotes y,
/// dentro de un lote, el orden de emisión. Las claves salen ordenadas.
pub fn shuffle_pairs(batches: Vec<Vec<KeyValue>>) -> Vec<(String, Vec<String>)> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for batch in batches {
        for (k, v) in batch {
            grouped.entry(k).or_default().push(v);
        }
    }

    let mut entries: Vec<(String, Vec<String>)> = grouped.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Ejecuta un payload completo dejando el resultado en el store bajo task_id.
///
/// Un fallo de la instrucción devuelve un TaskResult con success=false (la
/// tarea "terminó mal", pero terminó); un fallo del store sí es un error
/// nuestro y se propaga.
pub fn execute_payload(
    store: &dyn ResultStore,
    task_id: &TaskId,
    payload: &TaskPayload,
) -> Result<TaskResult, StoreError> {
    match payload {
        TaskPayload::Map {
            instruction,
            combiner,
            input,
        } => match run_map_task(instruction.as_ref(), combiner.as_deref(), input) {
            Ok(pairs) => {
                for (k, v) in &pairs {
                    store.store_map_result(task_id, k, v)?;
                }
                Ok(TaskResult::map_ok(pairs))
            }
            Err(e) => Ok(TaskResult::failed(e.to_string())),
        },
        TaskPayload::Reduce {
            instruction,
            key,
            values,
        } => match instruction.reduce(key, values) {
            Ok(output) => {
                store.store_reduce_result(task_id, &output)?;
                Ok(TaskResult::reduce_ok(output))
            }
            Err(e) => Ok(TaskResult::failed(e.to_string())),
        },
    }
}
