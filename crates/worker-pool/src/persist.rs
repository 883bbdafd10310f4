//! Durable mirror of the worker set
//!
//! `RecordStore` is the persistence contract the pool writes through to on
//! every mutation. `JsonRecordStore` keeps all records in one JSON file keyed
//! by worker id. Writes go to a temp file and are renamed over the target so a
//! crash mid-write never leaves a truncated file, and the file is 0600 since it
//! holds credentials. The in-memory mirror only takes a change once the file
//! holding it is in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};
use upstream::BoxFuture;

use crate::error::{Error, Result};
use crate::worker::{WorkerId, WorkerRecord};

/// Persistence contract for worker records.
pub trait RecordStore: Send + Sync {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<WorkerRecord>>>;

    fn save<'a>(&'a self, record: &'a WorkerRecord) -> BoxFuture<'a, Result<()>>;

    fn delete(&self, id: WorkerId) -> BoxFuture<'_, Result<()>>;
}

/// Single-file JSON record store.
pub struct JsonRecordStore {
    path: PathBuf,
    state: Mutex<BTreeMap<WorkerId, WorkerRecord>>,
}

impl JsonRecordStore {
    /// Open the store at `path`.
    ///
    /// A missing file is created as `{}` so a fresh deployment starts with an
    /// empty pool.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading {}: {e}", path.display())))?;
            let records: BTreeMap<WorkerId, WorkerRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing {}: {e}", path.display())))?;
            info!(path = %path.display(), workers = records.len(), "loaded worker records");
            records
        } else {
            info!(path = %path.display(), "worker store not found, starting empty");
            let records = BTreeMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl RecordStore for JsonRecordStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<WorkerRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.values().cloned().collect())
        })
    }

    fn save<'a>(&'a self, record: &'a WorkerRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.insert(record.id, record.clone());
            write_atomic(&self.path, &next).await?;
            *state = next;
            Ok(())
        })
    }

    fn delete(&self, id: WorkerId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.contains_key(&id) {
                return Ok(());
            }
            let mut next = state.clone();
            next.remove(&id);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(worker_id = id, "deleted worker record");
            Ok(())
        })
    }
}

async fn write_atomic(path: &Path, data: &BTreeMap<WorkerId, WorkerRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Storage(format!("serializing worker records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("store path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".workers.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), workers = data.len(), "persisted worker records");
    Ok(())
}
