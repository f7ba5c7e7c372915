//! Execution record persistence.
//!
//! Terminal status is write-once: once a record is passed, failed or cancelled,
//! `finalize` leaves it alone. This is how a user stop wins over a case result
//! that lands a moment later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{ReplayError, Result};
use crate::models::{Execution, ExecutionKind, ExecutionStatus};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record, assigning its id
    async fn create(&self, execution: Execution) -> Result<Execution>;

    /// Overwrite an existing record
    async fn save(&self, execution: &Execution) -> Result<()>;

    async fn get(&self, id: u64) -> Result<Execution>;

    /// All records, ordered by id
    async fn list(&self) -> Result<Vec<Execution>>;

    /// Write `execution` unless the stored record already reached a terminal status.
    /// Returns whether the write happened.
    async fn finalize(&self, execution: &Execution) -> Result<bool> {
        let stored = self.get(execution.id).await?;
        if stored.status.is_terminal() {
            tracing::debug!(
                "Execution {} already {}, keeping it",
                execution.id,
                stored.status
            );
            return Ok(false);
        }
        self.save(execution).await?;
        Ok(true)
    }

    async fn children(&self, parent_id: u64) -> Result<Vec<Execution>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.parent_execution_id == Some(parent_id))
            .collect())
    }

    /// Most recent case run for `case_id`, within `parent` when given
    async fn latest_for_case(&self, case_id: u64, parent: Option<u64>) -> Result<Option<Execution>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.test_case_id == Some(case_id))
            .filter(|e| match parent {
                Some(parent) => e.parent_execution_id == Some(parent),
                None => e.execution_type != ExecutionKind::TestSuite,
            })
            .max_by_key(|e| (e.start_time, e.id)))
    }

    async fn with_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<u64, Execution>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, mut execution: Execution) -> Result<Execution> {
        execution.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.records
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(ReplayError::ExecutionNotFound(execution.id)),
        }
    }

    async fn get(&self, id: u64) -> Result<Execution> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ReplayError::ExecutionNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Execution>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// One `<id>.json` document per execution. Safe to share between processes:
/// ids are claimed with exclusive file creation and writes go through a rename.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ReplayError::Store(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn highest_id(&self) -> Result<u64> {
        let mut highest = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = id_of(&entry.path()) {
                highest = highest.max(id);
            }
        }
        Ok(highest)
    }

    async fn write(&self, execution: &Execution) -> Result<()> {
        let body = serde_json::to_vec_pretty(execution)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", execution.id));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.path_for(execution.id)).await?;
        Ok(())
    }
}

fn id_of(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[async_trait]
impl ExecutionStore for JsonStore {
    async fn create(&self, mut execution: Execution) -> Result<Execution> {
        let mut candidate = self.highest_id().await? + 1;
        loop {
            let claimed = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path_for(candidate))
                .await;
            match claimed {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => return Err(e.into()),
            }
        }
        execution.id = candidate;
        self.write(&execution).await?;
        Ok(execution)
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        if !tokio::fs::try_exists(self.path_for(execution.id)).await? {
            return Err(ReplayError::ExecutionNotFound(execution.id));
        }
        self.write(execution).await
    }

    async fn get(&self, id: u64) -> Result<Execution> {
        let body = match tokio::fs::read(self.path_for(id)).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReplayError::ExecutionNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map_err(|e| ReplayError::Store(format!("execution {} is unreadable: {}", id, e)))
    }

    async fn list(&self) -> Result<Vec<Execution>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = id_of(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(id).await {
                Ok(record) => records.push(record),
                // A freshly claimed id is empty until its first write lands
                Err(e) => tracing::debug!("Skipping execution {}: {}", id, e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_assigns_ids_and_finalizes_once() {
        let store = MemoryStore::new();
        let mut first = store.create(Execution::for_case(10)).await.unwrap();
        let second = store.create(Execution::for_case(11)).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        first.finish(ExecutionStatus::Cancelled, "Cancelled by user");
        assert!(store.finalize(&first).await.unwrap());

        first.finish(ExecutionStatus::Failed, "late failure");
        assert!(!store.finalize(&first).await.unwrap());
        assert_eq!(
            store.get(first.id).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn latest_for_case_respects_parent_scope() {
        let store = MemoryStore::new();
        let mut a = Execution::for_suite_case(5, 1, 100);
        a.finish(ExecutionStatus::Passed, "");
        store.create(a).await.unwrap();
        let mut b = Execution::for_suite_case(5, 1, 200);
        b.finish(ExecutionStatus::Failed, "boom");
        store.create(b).await.unwrap();

        let scoped = store.latest_for_case(5, Some(100)).await.unwrap().unwrap();
        assert_eq!(scoped.status, ExecutionStatus::Passed);
        let global = store.latest_for_case(5, None).await.unwrap().unwrap();
        assert_eq!(global.status, ExecutionStatus::Failed);
        assert!(store.latest_for_case(6, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        let mut record = store.create(Execution::for_case(3)).await.unwrap();
        record.mark_running();
        store.save(&record).await.unwrap();

        let reopened = JsonStore::open(dir.path()).await.unwrap();
        let next = reopened.create(Execution::for_case(4)).await.unwrap();
        assert_eq!(next.id, record.id + 1);

        let loaded = reopened.get(record.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(reopened.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn json_store_reports_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get(42).await,
            Err(ReplayError::ExecutionNotFound(42))
        ));
        let mut ghost = Execution::for_case(1);
        ghost.id = 42;
        assert!(store.save(&ghost).await.is_err());
    }
}
