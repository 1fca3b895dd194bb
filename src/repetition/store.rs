use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use fd_lock::RwLock;
use indexmap::IndexMap;
use log::{debug, info};

use crate::config::io::project_dirs;
use crate::error::StoreError;
use crate::repetition::record::RepetitionRecord;

pub const STORE_FILE_NAME: &str = "repetitions.json";

/// Keyed persistence of repetition records.
pub trait RepetitionStore: Send {
    /// Fails with [`StoreError::DuplicateKey`] when the capture time is taken.
    fn insert(&mut self, record: RepetitionRecord) -> Result<(), StoreError>;

    /// Inserts or overwrites.
    fn replace(&mut self, record: RepetitionRecord) -> Result<(), StoreError>;

    fn delete(&mut self, capture_time_ms: i64) -> Result<Option<RepetitionRecord>, StoreError>;

    fn contains(&self, capture_time_ms: i64) -> bool;

    /// Records of one day, ordered by capture time.
    fn query_date(&self, date_label: &str) -> Vec<RepetitionRecord>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRepetitionStore {
    records: IndexMap<i64, RepetitionRecord>,
}

impl MemoryRepetitionStore {
    pub fn new() -> Self {
        MemoryRepetitionStore::default()
    }

    fn from_records(records: Vec<RepetitionRecord>) -> Self {
        MemoryRepetitionStore {
            records: records.into_iter().map(|record| (record.capture_time_ms, record)).collect(),
        }
    }

    fn sorted_records(&self) -> Vec<&RepetitionRecord> {
        let mut records: Vec<&RepetitionRecord> = self.records.values().collect();
        records.sort_by_key(|record| record.capture_time_ms);
        records
    }
}

impl RepetitionStore for MemoryRepetitionStore {
    fn insert(&mut self, record: RepetitionRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.capture_time_ms) {
            return Err(StoreError::DuplicateKey { capture_time_ms: record.capture_time_ms });
        }
        self.records.insert(record.capture_time_ms, record);
        Ok(())
    }

    fn replace(&mut self, record: RepetitionRecord) -> Result<(), StoreError> {
        self.records.insert(record.capture_time_ms, record);
        Ok(())
    }

    fn delete(&mut self, capture_time_ms: i64) -> Result<Option<RepetitionRecord>, StoreError> {
        Ok(self.records.shift_remove(&capture_time_ms))
    }

    fn contains(&self, capture_time_ms: i64) -> bool {
        self.records.contains_key(&capture_time_ms)
    }

    fn query_date(&self, date_label: &str) -> Vec<RepetitionRecord> {
        self.sorted_records().into_iter()
            .filter(|record| record.date_label == date_label)
            .cloned()
            .collect()
    }
}

pub fn default_store_path() -> Result<PathBuf, StoreError> {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(STORE_FILE_NAME))
        .ok_or(StoreError::NoStorePath)
}

/// Store kept in memory and written through to a JSON array on every change.
pub struct JsonFileRepetitionStore {
    memory: MemoryRepetitionStore,
    file: RwLock<std::fs::File>,
}

impl JsonFileRepetitionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Using repetition store {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .create(true)
            .open(path)?;
        let mut file = RwLock::new(file);

        let mut content = String::new();
        {
            let mut guard = file.try_write().map_err(|source| StoreError::CanNotLock { source })?;
            guard.read_to_string(&mut content)?;
        }

        let records: Vec<RepetitionRecord> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };
        debug!("Loaded {} repetitions", records.len());

        Ok(JsonFileRepetitionStore {
            memory: MemoryRepetitionStore::from_records(records),
            file,
        })
    }

    fn write(&mut self, records: &MemoryRepetitionStore) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&records.sorted_records())?;

        let mut guard = self.file.try_write().map_err(|source| StoreError::CanNotLock { source })?;
        guard.rewind()?;
        guard.set_len(0)?;
        guard.write_all(content.as_bytes())?;
        guard.flush()?;
        Ok(())
    }

    /// Applies `change` to a copy of the records, which replaces them only once it is on disk.
    fn commit<T>(
        &mut self,
        change: impl FnOnce(&mut MemoryRepetitionStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut candidate = self.memory.clone();
        let result = change(&mut candidate)?;
        self.write(&candidate)?;
        self.memory = candidate;
        Ok(result)
    }
}

impl RepetitionStore for JsonFileRepetitionStore {
    fn insert(&mut self, record: RepetitionRecord) -> Result<(), StoreError> {
        self.commit(|records| records.insert(record))
    }

    fn replace(&mut self, record: RepetitionRecord) -> Result<(), StoreError> {
        self.commit(|records| records.replace(record))
    }

    fn delete(&mut self, capture_time_ms: i64) -> Result<Option<RepetitionRecord>, StoreError> {
        if !self.memory.contains(capture_time_ms) {
            return Ok(None);
        }
        self.commit(|records| records.delete(capture_time_ms))
    }

    fn contains(&self, capture_time_ms: i64) -> bool {
        self.memory.contains(capture_time_ms)
    }

    fn query_date(&self, date_label: &str) -> Vec<RepetitionRecord> {
        self.memory.query_date(date_label)
    }
}
