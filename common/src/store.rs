use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::TaskId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Almacenamiento de resultados por tarea: pares intermedios de Map y salidas
/// de Reduce. El que ejecuta escribe; el master lee en el shuffle y al
/// recolectar. La implementación concreta es intercambiable.
pub trait ResultStore: Send + Sync {
    fn store_map_result(&self, task_id: &TaskId, key: &str, value: &str)
        -> Result<(), StoreError>;

    fn store_reduce_result(&self, task_id: &TaskId, result: &str) -> Result<(), StoreError>;

    /// Pares de una tarea Map, en orden de escritura. Tarea desconocida: vacío.
    fn get_map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError>;

    fn get_reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError>;

    /// Borra todo lo de la tarea. Idempotente.
    fn destroy(&self, task_id: &TaskId) -> Result<(), StoreError>;
}

/* =========================
   Implementación en memoria
   ========================= */

#[derive(Default)]
pub struct MemoryResultStore {
    maps: Mutex<HashMap<TaskId, Vec<(String, String)>>>,
    reduces: Mutex<HashMap<TaskId, Vec<String>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryResultStore {
    fn store_map_result(
        &self,
        task_id: &TaskId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut maps = self.maps.lock().unwrap();
        maps.entry(task_id.clone())
            .or_default()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn store_reduce_result(&self, task_id: &TaskId, result: &str) -> Result<(), StoreError> {
        let mut reduces = self.reduces.lock().unwrap();
        reduces
            .entry(task_id.clone())
            .or_default()
            .push(result.to_string());
        Ok(())
    }

    fn get_map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError> {
        let maps = self.maps.lock().unwrap();
        Ok(maps.get(task_id).cloned().unwrap_or_default())
    }

    fn get_reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        let reduces = self.reduces.lock().unwrap();
        Ok(reduces.get(task_id).cloned().unwrap_or_default())
    }

    fn destroy(&self, task_id: &TaskId) -> Result<(), StoreError> {
        self.maps.lock().unwrap().remove(task_id);
        self.reduces.lock().unwrap().remove(task_id);
        Ok(())
    }
}

/* =========================
   Implementación en archivos (CSV)
   ========================= */

/// Un archivo CSV por tarea y tipo: `<dir>/<task_id>.map.csv` con filas
/// clave,valor y `<dir>/<task_id>.reduce.csv` con una columna. CSV se encarga
/// de las comillas, así los valores pueden llevar comas y saltos de línea.
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn map_path(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.map.csv", task_id))
    }

    fn reduce_path(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.reduce.csv", task_id))
    }

    fn append_record(&self, path: &Path, fields: &[&str]) -> Result<(), StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(fields)?;
        writer.flush()?;
        Ok(())
    }
}

impl ResultStore for FileResultStore {
    fn store_map_result(
        &self,
        task_id: &TaskId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.append_record(&self.map_path(task_id), &[key, value])
    }

    fn store_reduce_result(&self, task_id: &TaskId, result: &str) -> Result<(), StoreError> {
        self.append_record(&self.reduce_path(task_id), &[result])
    }

    fn get_map_results(&self, task_id: &TaskId) -> Result<Vec<(String, String)>, StoreError> {
        let path = self.map_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;

        let mut out = Vec::new();
        for record in reader.records() {
            let record = record?;
            let key = record.get(0).unwrap_or("").to_string();
            let value = record.get(1).unwrap_or("").to_string();
            out.push((key, value));
        }
        Ok(out)
    }

    fn get_reduce_results(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        let path = self.reduce_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;

        let mut out = Vec::new();
        for record in reader.records() {
            let record = record?;
            out.push(record.get(0).unwrap_or("").to_string());
        }
        Ok(out)
    }

    fn destroy(&self, task_id: &TaskId) -> Result<(), StoreError> {
        for path in [self.map_path(task_id), self.reduce_path(task_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
