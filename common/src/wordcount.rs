use serde_json::{json, Value};

use crate::instruction::{InstructionError, KeyValue, MapInstruction, ReduceInstruction};

/// Limpia un token: solo alfanumérico y '_', en minúscula.
fn clean_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/* =========================
   Instrucciones Map
   ========================= */

/// Parte el input en palabras y emite ("palabra", "1") por cada aparición.
/// `min_len` permite filtrar tokens demasiado cortos.
pub struct WordSplit {
    min_len: usize,
}

impl WordSplit {
    pub fn new(min_len: usize) -> Self {
        Self { min_len }
    }

    /// Construye desde la config embarcada; `Null` usa el default.
    pub fn from_config(config: &Value) -> Result<Self, InstructionError> {
        let min_len = match config.get("min_len") {
            None => 1,
            Some(v) => v.as_u64().ok_or_else(|| {
                InstructionError::BadInput(format!("min_len no numérico: {}", v))
            })? as usize,
        };
        Ok(Self { min_len })
    }
}

impl MapInstruction for WordSplit {
    fn name(&self) -> &'static str {
        "word_split"
    }

    fn config(&self) -> Value {
        json!({ "min_len": self.min_len })
    }

    fn map(&self, input: &str) -> Result<Vec<KeyValue>, InstructionError> {
        let mut pairs = Vec::new();
        for raw in input.split_whitespace() {
            let cleaned = clean_token(raw);
            if !cleaned.is_empty() && cleaned.chars().count() >= self.min_len {
                pairs.push((cleaned, "1".to_string()));
            }
        }
        Ok(pairs)
    }
}

/// Emite el primer carácter del input con valor "1".
/// Input vacío no emite nada.
pub struct FirstChar;

impl MapInstruction for FirstChar {
    fn name(&self) -> &'static str {
        "first_char"
    }

    fn map(&self, input: &str) -> Result<Vec<KeyValue>, InstructionError> {
        match input.chars().next() {
            Some(c) => Ok(vec![(c.to_string(), "1".to_string())]),
            None => Ok(Vec::new()),
        }
    }
}

/* =========================
   Instrucciones Reduce
   ========================= */

/// Suma los valores de una clave interpretándolos como enteros.
pub struct SumValues;

impl ReduceInstruction for SumValues {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn reduce(&self, _key: &str, values: &[String]) -> Result<String, InstructionError> {
        let mut total: u64 = 0;
        for v in values {
            let parsed = v.parse::<u64>().map_err(|_| {
                InstructionError::BadInput(format!("valor no numérico: {:?}", v))
            })?;
            total = total.checked_add(parsed).ok_or_else(|| {
                InstructionError::BadInput(format!("la suma desborda en {:?}", v))
            })?;
        }
        Ok(total.to_string())
    }
}

/// Cuenta cuántos valores llegaron para la clave.
pub struct CountValues;

impl ReduceInstruction for CountValues {
    fn name(&self) -> &'static str {
        "count"
    }

    fn reduce(&self, _key: &str, values: &[String]) -> Result<String, InstructionError> {
        Ok(values.len().to_string())
    }
}
