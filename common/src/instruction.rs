use serde_json::Value;
use thiserror::Error;

/// Par clave/valor intermedio que emite la fase Map.
pub type KeyValue = (String, String);

#[derive(Debug, Error)]
pub enum InstructionError {
    /// La entrada no tiene la forma que la instrucción espera.
    #[error("entrada inválida: {0}")]
    BadInput(String),
    /// La lógica de usuario falló por sus propios motivos.
    #[error("la instrucción falló: {0}")]
    Logic(String),
}

/// Lógica Map aportada por el usuario.
///
/// Cada instrucción se identifica por un nombre estable: ese nombre es lo que
/// viaja al agente remoto (junto con `config`), así que la misma instrucción
/// tiene que estar registrada en los dos procesos.
pub trait MapInstruction: Send + Sync {
    /// Nombre con el que la instrucción está registrada.
    fn name(&self) -> &'static str;

    /// Configuración serializable que viaja con la instrucción.
    /// `Null` si la instrucción no tiene parámetros.
    fn config(&self) -> Value {
        Value::Null
    }

    /// Procesa un input lógico completo y emite pares clave/valor.
    fn map(&self, input: &str) -> Result<Vec<KeyValue>, InstructionError>;
}

/// Lógica Reduce aportada por el usuario.
/// También sirve como combiner local de una tarea Map.
pub trait ReduceInstruction: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> Value {
        Value::Null
    }

    /// Colapsa todos los valores de una clave en un único resultado.
    fn reduce(&self, key: &str, values: &[String]) -> Result<String, InstructionError>;
}
