//! Content-addressed artifact storage.
//!
//! Blobs are addressed by the SHA-256 of their content. A key index maps each
//! artifact key to its latest reference, and an ownership table records which
//! runs hold which blobs so that blobs no run holds can be deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use conveyor_types::{ArtifactRef, ConveyorError, Result, RunId};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::state::write_atomic;

pub fn digest_of(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// The ownership name a run holds its blobs under.
pub fn run_owner(run_id: RunId) -> String {
    format!("run-{}", run_id)
}

/// Store key for a run-scoped artifact, e.g. `run-12/dist` or `run-12/logs/Build`.
pub fn run_key(run_id: RunId, name: &str) -> String {
    format!("{}/{}", run_owner(run_id), name)
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` under `key`. Identical content under the same key yields
    /// the same reference.
    async fn put(&self, key: &str, content: &[u8]) -> Result<ArtifactRef>;

    /// [`put`](Self::put) and [`retain`](Self::retain) as one step, so a
    /// concurrent `release_owner` cannot delete the blob in between.
    async fn put_retained(&self, key: &str, content: &[u8], owner: &str) -> Result<ArtifactRef>;

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    /// Latest reference stored under `key`.
    async fn lookup(&self, key: &str) -> Result<Option<ArtifactRef>>;

    /// Record that `owner` holds the blob behind `artifact`.
    async fn retain(&self, artifact: &ArtifactRef, owner: &str) -> Result<()>;

    /// Drop every hold of `owner` and delete blobs nobody holds any more.
    /// Returns the number of blobs deleted.
    async fn release_owner(&self, owner: &str) -> Result<usize>;
}

/// Index and ownership bookkeeping shared by both stores.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Ledger {
    index: BTreeMap<String, ArtifactRef>,
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl Ledger {
    /// Returns whether the hold is new.
    fn retain(&mut self, digest: &str, owner: &str) -> bool {
        self.owners
            .entry(digest.to_string())
            .or_default()
            .insert(owner.to_string())
    }

    /// Returns the digests left without owners; they are removed from the ledger.
    fn release(&mut self, owner: &str) -> Vec<String> {
        let mut orphaned = Vec::new();
        self.owners.retain(|digest, holders| {
            if holders.remove(owner) && holders.is_empty() {
                orphaned.push(digest.clone());
                false
            } else {
                true
            }
        });
        self.index.retain(|_, r| !orphaned.contains(&r.digest));
        orphaned
    }
}

fn make_ref(key: &str, content: &[u8]) -> ArtifactRef {
    ArtifactRef {
        key: key.to_string(),
        digest: digest_of(content),
        size: content.len() as u64,
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    ledger: Ledger,
}

impl MemoryInner {
    fn store(&mut self, key: &str, content: &[u8]) -> ArtifactRef {
        let artifact = make_ref(key, content);
        self.blobs
            .entry(artifact.digest.clone())
            .or_insert_with(|| content.to_vec());
        self.ledger.index.insert(key.to_string(), artifact.clone());
        artifact
    }
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blob_count(&self) -> usize {
        self.inner.lock().await.blobs.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<ArtifactRef> {
        Ok(self.inner.lock().await.store(key, content))
    }

    async fn put_retained(&self, key: &str, content: &[u8], owner: &str) -> Result<ArtifactRef> {
        let mut inner = self.inner.lock().await;
        let artifact = inner.store(key, content);
        inner.ledger.retain(&artifact.digest, owner);
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .await
            .blobs
            .get(&artifact.digest)
            .cloned()
            .ok_or_else(|| ConveyorError::ArtifactNotFound {
                key: artifact.key.clone(),
            })
    }

    async fn lookup(&self, key: &str) -> Result<Option<ArtifactRef>> {
        Ok(self.inner.lock().await.ledger.index.get(key).cloned())
    }

    async fn retain(&self, artifact: &ArtifactRef, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.blobs.contains_key(&artifact.digest) {
            return Err(ConveyorError::ArtifactNotFound {
                key: artifact.key.clone(),
            });
        }
        inner.ledger.retain(&artifact.digest, owner);
        Ok(())
    }

    async fn release_owner(&self, owner: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let orphaned = inner.ledger.release(owner);
        for digest in &orphaned {
            inner.blobs.remove(digest);
        }
        Ok(orphaned.len())
    }
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// Blobs under `<root>/blobs/<digest>`, with `index.json` and `owners.json`
/// beside them.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    ledger_lock: Mutex<()>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ledger_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(digest)
    }

    async fn load_ledger(&self) -> Result<Ledger> {
        let mut ledger = Ledger::default();
        for (file, slot) in [("index.json", 0), ("owners.json", 1)] {
            let path = self.root.join(file);
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ConveyorError::Persistence(format!("{}: {}", path.display(), e))),
            };
            let corrupt =
                |e: serde_json::Error| ConveyorError::Persistence(format!("corrupt {}: {}", path.display(), e));
            if slot == 0 {
                ledger.index = serde_json::from_str(&text).map_err(corrupt)?;
            } else {
                ledger.owners = serde_json::from_str(&text).map_err(corrupt)?;
            }
        }
        Ok(ledger)
    }

    /// Write the blob and index `key`, holding it for `owner` if given.
    /// Caller holds `ledger_lock`.
    async fn store_locked(&self, key: &str, content: &[u8], owner: Option<&str>) -> Result<ArtifactRef> {
        let artifact = make_ref(key, content);
        let path = self.blob_path(&artifact.digest);
        if !tokio::fs::try_exists(&path).await? {
            write_atomic(&path, content).await?;
        }

        let mut ledger = self.load_ledger().await?;
        let mut changed = false;
        if ledger.index.get(key) != Some(&artifact) {
            ledger.index.insert(key.to_string(), artifact.clone());
            changed = true;
        }
        if let Some(owner) = owner {
            changed |= ledger.retain(&artifact.digest, owner);
        }
        if changed {
            self.store_ledger(&ledger).await?;
        }
        tracing::debug!(key, digest = %artifact.digest, size = artifact.size, owner, "artifact stored");
        Ok(artifact)
    }

    async fn store_ledger(&self, ledger: &Ledger) -> Result<()> {
        write_atomic(
            &self.root.join("index.json"),
            &serde_json::to_vec_pretty(&ledger.index)?,
        )
        .await?;
        write_atomic(
            &self.root.join("owners.json"),
            &serde_json::to_vec_pretty(&ledger.owners)?,
        )
        .await
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<ArtifactRef> {
        let _guard = self.ledger_lock.lock().await;
        self.store_locked(key, content, None).await
    }

    async fn put_retained(&self, key: &str, content: &[u8], owner: &str) -> Result<ArtifactRef> {
        let _guard = self.ledger_lock.lock().await;
        self.store_locked(key, content, Some(owner)).await
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.blob_path(&artifact.digest);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConveyorError::ArtifactNotFound {
                    key: artifact.key.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if digest_of(&content) != artifact.digest {
            return Err(ConveyorError::Persistence(format!(
                "blob {} does not match its digest",
                path.display()
            )));
        }
        Ok(content)
    }

    async fn lookup(&self, key: &str) -> Result<Option<ArtifactRef>> {
        let _guard = self.ledger_lock.lock().await;
        Ok(self.load_ledger().await?.index.get(key).cloned())
    }

    async fn retain(&self, artifact: &ArtifactRef, owner: &str) -> Result<()> {
        let _guard = self.ledger_lock.lock().await;
        if !tokio::fs::try_exists(self.blob_path(&artifact.digest)).await? {
            return Err(ConveyorError::ArtifactNotFound {
                key: artifact.key.clone(),
            });
        }
        let mut ledger = self.load_ledger().await?;
        if ledger.retain(&artifact.digest, owner) {
            self.store_ledger(&ledger).await?;
        }
        Ok(())
    }

    async fn release_owner(&self, owner: &str) -> Result<usize> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = self.load_ledger().await?;
        let orphaned = ledger.release(owner);
        self.store_ledger(&ledger).await?;
        for digest in &orphaned {
            match tokio::fs::remove_file(self.blob_path(digest)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !orphaned.is_empty() {
            tracing::debug!(owner, deleted = orphaned.len(), "released artifacts");
        }
        Ok(orphaned.len())
    }
}
