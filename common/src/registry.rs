use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::instruction::{InstructionError, MapInstruction, ReduceInstruction};
use crate::wordcount::{CountValues, FirstChar, SumValues, WordSplit};

pub type MapFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn MapInstruction>, InstructionError> + Send + Sync>;
pub type ReduceFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn ReduceInstruction>, InstructionError> + Send + Sync>;

/// Registro nombre → constructor de instrucciones.
///
/// Es lo que reemplaza al envío de código: el master solo embarca el nombre y
/// la config, y el agente reconstruye la instrucción desde SU registro. Los
/// dos procesos tienen que registrar el mismo conjunto al componer el binario.
pub struct InstructionRegistry {
    maps: HashMap<String, MapFactory>,
    reduces: HashMap<String, ReduceFactory>,
}

impl InstructionRegistry {
    pub fn new() -> Self {
        Self {
            maps: HashMap::new(),
            reduces: HashMap::new(),
        }
    }

    /// Registro con las instrucciones integradas (wordcount y compañía).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_map("word_split", |config| {
            Ok(Arc::new(WordSplit::from_config(config)?) as Arc<dyn MapInstruction>)
        });
        registry.register_map("first_char", |_config| {
            Ok(Arc::new(FirstChar) as Arc<dyn MapInstruction>)
        });
        registry.register_reduce("sum", |_config| {
            Ok(Arc::new(SumValues) as Arc<dyn ReduceInstruction>)
        });
        registry.register_reduce("count", |_config| {
            Ok(Arc::new(CountValues) as Arc<dyn ReduceInstruction>)
        });

        registry
    }

    pub fn register_map<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn MapInstruction>, InstructionError> + Send + Sync + 'static,
    {
        self.maps.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_reduce<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn ReduceInstruction>, InstructionError>
            + Send
            + Sync
            + 'static,
    {
        self.reduces.insert(name.to_string(), Box::new(factory));
    }

    pub fn knows_map(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    pub fn knows_reduce(&self, name: &str) -> bool {
        self.reduces.contains_key(name)
    }

    pub fn map_factory(&self, name: &str) -> Option<&MapFactory> {
        self.maps.get(name)
    }

    pub fn reduce_factory(&self, name: &str) -> Option<&ReduceFactory> {
        self.reduces.get(name)
    }
}

impl Default for InstructionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_builtins_conoce_las_instrucciones_integradas() {
        let registry = InstructionRegistry::with_builtins();

        assert!(registry.knows_map("word_split"));
        assert!(registry.knows_map("first_char"));
        assert!(registry.knows_reduce("sum"));
        assert!(registry.knows_reduce("count"));
        assert!(!registry.knows_map("no_existe"));
    }

    #[test]
    fn los_factories_construyen_desde_la_config() {
        let registry = InstructionRegistry::with_builtins();

        let factory = registry.map_factory("word_split").unwrap();
        let built = factory(&json!({ "min_len": 2 })).unwrap();
        assert_eq!(built.name(), "word_split");

        // min_len=2 filtra tokens de un solo carácter
        let pairs = built.map("a bc").unwrap();
        assert_eq!(pairs, vec![("bc".to_string(), "1".to_string())]);
    }

    #[test]
    fn un_nombre_no_registrado_devuelve_none() {
        let registry = InstructionRegistry::with_builtins();
        assert!(registry.map_factory("misteriosa").is_none());
        assert!(registry.reduce_factory("misteriosa").is_none());
    }
}
