//! Run state persistence.
//!
//! A [`RunStateStore`] holds one record per run. Writes for the same run are
//! serialized, saving identical content is a no-op, and a terminal record can
//! never be replaced by different content. Cancellation requests from other
//! processes travel through the store as markers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_types::{ConveyorError, Result, Run, RunId};
use tokio::sync::Mutex;

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Allocate the next monotonic run id.
    async fn next_run_id(&self) -> Result<RunId>;

    async fn save(&self, run: &Run) -> Result<()>;

    async fn load(&self, id: RunId) -> Result<Run>;

    /// All runs, ordered by id.
    async fn list(&self) -> Result<Vec<Run>>;

    async fn list_incomplete(&self) -> Result<Vec<Run>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    /// Remove the record and any cancel marker.
    async fn delete(&self, id: RunId) -> Result<()>;

    async fn request_cancel(&self, id: RunId) -> Result<()>;

    async fn cancel_requested(&self, id: RunId) -> Result<bool>;

    /// Drop a cancel marker, e.g. before resuming the run. Missing markers are fine.
    async fn clear_cancel(&self, id: RunId) -> Result<()>;
}

/// Decide whether `incoming` may replace `existing`. `Ok(false)` means the
/// content is identical and nothing needs to be written.
fn check_overwrite(existing: Option<&Run>, incoming: &Run) -> Result<bool> {
    match existing {
        Some(current) if current == incoming => Ok(false),
        Some(current) if current.is_terminal() => Err(ConveyorError::Persistence(format!(
            "run {} is {} and cannot be overwritten",
            current.id, current.status
        ))),
        _ => Ok(true),
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    runs: BTreeMap<RunId, Run>,
    cancels: BTreeSet<RunId>,
    writes: usize,
}

/// In-process store, used by tests and embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves that actually changed stored content.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStore {
    async fn next_run_id(&self) -> Result<RunId> {
        let mut state = self.state.lock().await;
        let floor = state.runs.keys().next_back().map(|id| id.0).unwrap_or(0);
        state.next_id = state.next_id.max(floor) + 1;
        Ok(RunId(state.next_id))
    }

    async fn save(&self, run: &Run) -> Result<()> {
        let mut state = self.state.lock().await;
        if check_overwrite(state.runs.get(&run.id), run)? {
            state.runs.insert(run.id, run.clone());
            state.writes += 1;
        }
        Ok(())
    }

    async fn load(&self, id: RunId) -> Result<Run> {
        self.state
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or(ConveyorError::RunNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Run>> {
        Ok(self.state.lock().await.runs.values().cloned().collect())
    }

    async fn delete(&self, id: RunId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cancels.remove(&id);
        state
            .runs
            .remove(&id)
            .map(|_| ())
            .ok_or(ConveyorError::RunNotFound(id))
    }

    async fn request_cancel(&self, id: RunId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&id) {
            return Err(ConveyorError::RunNotFound(id));
        }
        state.cancels.insert(id);
        Ok(())
    }

    async fn cancel_requested(&self, id: RunId) -> Result<bool> {
        Ok(self.state.lock().await.cancels.contains(&id))
    }

    async fn clear_cancel(&self, id: RunId) -> Result<()> {
        self.state.lock().await.cancels.remove(&id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsRunStore
// ---------------------------------------------------------------------------

/// One JSON record per run under `<root>/runs/<id>.json`, cancel markers at
/// `<root>/runs/<id>.cancel`, and the id counter in `<root>/next_id`.
#[derive(Debug)]
pub struct FsRunStore {
    root: PathBuf,
    counter: Mutex<()>,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl FsRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: Mutex::new(()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn record_path(&self, id: RunId) -> PathBuf {
        self.runs_dir().join(format!("{}.json", id))
    }

    fn cancel_path(&self, id: RunId) -> PathBuf {
        self.runs_dir().join(format!("{}.cancel", id))
    }

    async fn lock_for(&self, id: RunId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Terminal records never change again, so their lock entry can go.
    async fn forget_lock(&self, id: RunId) {
        self.locks.lock().await.remove(&id);
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn read_record(&self, id: RunId) -> Result<Option<Run>> {
        let path = self.record_path(id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persist_err(&path, e)),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| ConveyorError::Persistence(format!("corrupt record {}: {}", path.display(), e)))
    }

    /// Caller holds the run's lock.
    async fn write_record(&self, run: &Run) -> Result<()> {
        let existing = self.read_record(run.id).await?;
        if !check_overwrite(existing.as_ref(), run)? {
            tracing::trace!(run = %run.id, "run record unchanged");
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(run)?;
        let path = self.record_path(run.id);
        write_atomic(&path, &json).await?;
        tracing::debug!(run = %run.id, status = %run.status, path = %path.display(), "run record saved");
        Ok(())
    }

    async fn record_ids(&self) -> Result<Vec<RunId>> {
        let dir = self.runs_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persist_err(&dir, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| persist_err(&dir, e))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(RunId(id));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl RunStateStore for FsRunStore {
    async fn next_run_id(&self) -> Result<RunId> {
        let _guard = self.counter.lock().await;
        let path = self.root.join("next_id");
        let stored = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                ConveyorError::Persistence(format!("corrupt counter {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(persist_err(&path, e)),
        };
        let floor = self.record_ids().await?.last().map(|id| id.0 + 1).unwrap_or(1);
        let id = stored.max(floor);
        write_atomic(&path, (id + 1).to_string().as_bytes()).await?;
        Ok(RunId(id))
    }

    async fn save(&self, run: &Run) -> Result<()> {
        let lock = self.lock_for(run.id).await;
        let _guard = lock.lock().await;

        let saved = self.write_record(run).await;
        if run.is_terminal() {
            self.forget_lock(run.id).await;
        }
        saved
    }

    async fn load(&self, id: RunId) -> Result<Run> {
        self.read_record(id)
            .await?
            .ok_or(ConveyorError::RunNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for id in self.record_ids().await? {
            // deleted between listing and reading
            if let Some(run) = self.read_record(id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn delete(&self, id: RunId) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConveyorError::RunNotFound(id))
            }
            Err(e) => return Err(persist_err(&path, e)),
        }
        let _ = tokio::fs::remove_file(self.cancel_path(id)).await;
        self.forget_lock(id).await;
        Ok(())
    }

    async fn request_cancel(&self, id: RunId) -> Result<()> {
        if self.read_record(id).await?.is_none() {
            return Err(ConveyorError::RunNotFound(id));
        }
        let path = self.cancel_path(id);
        write_atomic(&path, chrono::Utc::now().to_rfc3339().as_bytes()).await
    }

    async fn cancel_requested(&self, id: RunId) -> Result<bool> {
        let path = self.cancel_path(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| persist_err(&path, e))
    }

    async fn clear_cancel(&self, id: RunId) -> Result<()> {
        let path = self.cancel_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persist_err(&path, e)),
        }
    }
}

fn persist_err(path: &Path, e: std::io::Error) -> ConveyorError {
    ConveyorError::Persistence(format!("{}: {}", path.display(), e))
}

/// Write through a temporary sibling and rename, so readers never observe a
/// half-written file.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| persist_err(parent, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| persist_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persist_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::RunStatus;

    fn sample(id: u64) -> Run {
        Run::new(
            RunId(id),
            "web",
            serde_json::json!({"name": "web"}),
            ["Checkout", "Build"],
        )
    }

    // -----------------------------------------------------------------------
    // Shared behaviour
    // -----------------------------------------------------------------------

    async fn exercise_store(store: &dyn RunStateStore) {
        let id = store.next_run_id().await.unwrap();
        assert_eq!(id, RunId(1));
        let mut run = sample(id.0);
        store.save(&run).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), run);

        // identical save is accepted
        store.save(&run).await.unwrap();

        run.start().unwrap();
        store.save(&run).await.unwrap();
        assert_eq!(store.list_incomplete().await.unwrap().len(), 1);

        run.finish(RunStatus::Succeeded).unwrap();
        store.save(&run).await.unwrap();
        assert!(store.list_incomplete().await.unwrap().is_empty());
        store.save(&run).await.unwrap();

        // a terminal record refuses different content
        let mut tampered = run.clone();
        tampered.pipeline = "other".into();
        let err = store.save(&tampered).await.unwrap_err();
        assert!(matches!(err, ConveyorError::Persistence(_)));

        assert_eq!(store.next_run_id().await.unwrap(), RunId(2));
        assert!(matches!(
            store.load(RunId(99)).await.unwrap_err(),
            ConveyorError::RunNotFound(RunId(99))
        ));

        assert!(!store.cancel_requested(id).await.unwrap());
        store.request_cancel(id).await.unwrap();
        assert!(store.cancel_requested(id).await.unwrap());
        assert!(store.request_cancel(RunId(99)).await.is_err());
        store.clear_cancel(id).await.unwrap();
        assert!(!store.cancel_requested(id).await.unwrap());
        store.clear_cancel(id).await.unwrap();
        store.request_cancel(id).await.unwrap();

        store.delete(id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.cancel_requested(id).await.unwrap());
        assert!(store.delete(id).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise_store(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FsRunStore::new(dir.path())).await;
    }

    // -----------------------------------------------------------------------
    // Store specifics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn memory_identical_save_does_not_write() {
        let store = MemoryRunStore::new();
        let run = sample(1);
        store.save(&run).await.unwrap();
        store.save(&run).await.unwrap();
        assert_eq!(store.write_count().await, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fs_identical_save_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let run = sample(1);
        store.save(&run).await.unwrap();
        let path = dir.path().join("runs/1.json");
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.save(&run).await.unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn fs_lock_entries_dropped_once_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let mut done = sample(1);
        let mut active = sample(2);
        done.start().unwrap();
        active.start().unwrap();
        store.save(&done).await.unwrap();
        store.save(&active).await.unwrap();
        assert_eq!(store.tracked_locks().await, 2);

        done.finish(RunStatus::Failed).unwrap();
        store.save(&done).await.unwrap();
        assert_eq!(store.tracked_locks().await, 1);

        // re-saving the terminal record is still a no-op and tracks nothing
        store.save(&done).await.unwrap();
        assert_eq!(store.tracked_locks().await, 1);
        assert_eq!(store.load(RunId(1)).await.unwrap(), done);

        let mut tampered = done.clone();
        tampered.pipeline = "other".into();
        assert!(store.save(&tampered).await.is_err());
        assert_eq!(store.tracked_locks().await, 1);
    }

    #[tokio::test]
    async fn fs_ids_survive_restart_and_deletion() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsRunStore::new(dir.path());
            for _ in 0..3 {
                let id = store.next_run_id().await.unwrap();
                store.save(&sample(id.0)).await.unwrap();
            }
            store.delete(RunId(3)).await.unwrap();
        }
        let store = FsRunStore::new(dir.path());
        assert_eq!(store.next_run_id().await.unwrap(), RunId(4));
        let ids: Vec<_> = store.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RunId(1), RunId(2)]);
    }

    #[tokio::test]
    async fn fs_corrupt_record_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("runs")).unwrap();
        std::fs::write(dir.path().join("runs/5.json"), "{not json").unwrap();
        let store = FsRunStore::new(dir.path());
        assert!(matches!(
            store.load(RunId(5)).await.unwrap_err(),
            ConveyorError::Persistence(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_saves_of_one_run_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsRunStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut run = sample(1);
                run.record_receipt(format!("step-{}", i)).unwrap();
                store.save(&run).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let loaded = store.load(RunId(1)).await.unwrap();
        assert_eq!(loaded.receipts.len(), 1);
    }
}
