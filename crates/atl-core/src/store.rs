//! Task store
//!
//! Durable task records keyed by id. Two implementations:
//! - [`InMemoryTaskStore`] for tests and embedded use
//! - [`FileTaskStore`], one pretty-printed JSON document per task, replaced
//!   atomically (write to a temp file, then rename) so a crash never leaves
//!   a half-written record

use crate::error::StoreError;
use crate::record::TaskRecord;
use crate::types::TaskId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Persistence for task records
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Store a new record
    ///
    /// # Errors
    /// `Duplicate` when the id already exists
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Replace an existing record
    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Load one record
    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Load every record (unordered)
    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Volatile store
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: DashMap<TaskId, TaskRecord>,
}

impl InMemoryTaskStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(record.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

/// Directory-backed store surviving restarts
#[derive(Debug)]
pub struct FileTaskStore {
    root: PathBuf,
    known: Mutex<HashSet<TaskId>>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// # Errors
    /// `Io` when the directory cannot be created or scanned
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let mut known = HashSet::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = record_id(&entry.path()) {
                known.insert(id);
            }
        }
        tracing::debug!(root = %root.display(), records = known.len(), "task store opened");
        Ok(Self {
            root,
            known: Mutex::new(known),
        })
    }

    /// Store directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &TaskId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn write_atomic(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        let target = self.path_for(&record.id);
        let staging = self.root.join(format!(".{}.json.tmp", record.id));
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }
}

// `<id>.json` with a valid id; temp files start with a dot and never parse.
fn record_id(path: &Path) -> Option<TaskId> {
    if path.extension()? != "json" {
        return None;
    }
    TaskId::parse(path.file_stem()?.to_str()?).ok()
}

#[async_trait::async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let fresh = self.known.lock().insert(record.id.clone());
        if !fresh {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        if let Err(e) = self.write_atomic(record).await {
            self.known.lock().remove(&record.id);
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.write_atomic(record).await?;
        self.known.lock().insert(record.id.clone());
        Ok(())
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let ids: Vec<TaskId> = self.known.lock().iter().cloned().collect();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Agent, TaskStatus};
    use pretty_assertions::assert_eq;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(TaskId::parse(id).unwrap(), "store me", None, 3)
    }

    #[tokio::test]
    async fn in_memory_rejects_duplicates() {
        let store = InMemoryTaskStore::new();
        store.insert(&record("a")).await.unwrap();
        assert!(matches!(
            store.insert(&record("a")).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn file_store_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = record("persist-1");
        {
            let store = FileTaskStore::open(dir.path()).await.unwrap();
            store.insert(&rec).await.unwrap();
            rec.transition(TaskStatus::PmProcessing).unwrap();
            rec.append_message(Agent::Pm, "spec drafted");
            store.save(&rec).await.unwrap();
        }

        let reopened = FileTaskStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
        assert!(matches!(
            reopened.insert(&rec).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn file_store_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join(".x.json.tmp"), "{").unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(&TaskId::parse("missing").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load(&TaskId::parse("bad").unwrap()).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
