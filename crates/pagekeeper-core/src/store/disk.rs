//! File-backed cache storage.
//!
//! Each cache is a single `<name>.json` file under the storage root holding
//! every entry of that cache. Writes rewrite the whole file through a
//! temporary file and a rename, and are serialised per cache name.
//!
//! Deleting a cache detaches every handle opened before the delete, as with
//! the in-memory backend: their writes are dropped and their reads come back
//! empty, so a late background refresh never recreates a deleted file.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Cache, CacheStorage, StoredResponse};
use crate::error::StoreError;
use crate::http::{RequestKey, Response};

/// Application name used for the default storage directory
const APP_NAME: &str = "pagekeeper";

const CACHE_FILE_EXT: &str = "json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    entries: BTreeMap<RequestKey, StoredResponse>,
}

/// Shared by every handle on one cache name; the mutex serialises file access
#[derive(Debug, Default)]
struct Slot {
    detached: bool,
}

pub struct DiskStorage {
    root: PathBuf,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl DiskStorage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Storage under the platform cache directory
    pub fn default_location() -> anyhow::Result<Self> {
        let cache_dir = dirs::cache_dir().context("Could not find cache directory")?;
        Ok(Self::new(cache_dir.join(APP_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.contains("..")
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(format!("{}.{}", name, CACHE_FILE_EXT)))
    }

    async fn slot_for(&self, name: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(name.to_string()).or_default())
    }
}

pub struct DiskCache {
    name: String,
    path: PathBuf,
    slot: Arc<Mutex<Slot>>,
}

impl DiskCache {
    async fn read(&self) -> Result<CacheFile, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                name: self.name.clone(),
                source,
            }),
            // Deleted underneath us: behaves as empty until the next write
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &CacheFile) -> Result<(), StoreError> {
        write_atomic(&self.path, file).await
    }
}

async fn write_atomic(path: &Path, file: &CacheFile) -> Result<(), StoreError> {
    let contents = serde_json::to_string(file).map_err(|source| StoreError::Corrupt {
        name: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Cache for DiskCache {
    async fn lookup(&self, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
        let slot = self.slot.lock().await;
        if slot.detached {
            return Ok(None);
        }
        Ok(self.read().await?.entries.remove(key))
    }

    async fn put(&self, key: RequestKey, response: Response) -> Result<(), StoreError> {
        self.put_all(vec![(key, response)]).await
    }

    async fn put_all(&self, entries: Vec<(RequestKey, Response)>) -> Result<(), StoreError> {
        let slot = self.slot.lock().await;
        if slot.detached {
            debug!(cache = %self.name, entries = entries.len(), "Cache was deleted, write dropped");
            return Ok(());
        }
        let mut file = self.read().await?;
        for (key, response) in entries {
            file.entries.insert(key, StoredResponse::new(response));
        }
        self.write(&file).await?;
        debug!(cache = %self.name, entries = file.entries.len(), "Cache file written");
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, StoreError> {
        let slot = self.slot.lock().await;
        if slot.detached {
            return Ok(false);
        }
        let mut file = self.read().await?;
        if file.entries.remove(key).is_none() {
            return Ok(false);
        }
        self.write(&file).await?;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, StoreError> {
        let slot = self.slot.lock().await;
        if slot.detached {
            return Ok(Vec::new());
        }
        Ok(self.read().await?.entries.into_keys().collect())
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, StoreError> {
        let path = self.cache_path(name)?;
        let mut slot = self.slot_for(name).await;
        loop {
            let guard = slot.lock().await;
            // Raced with a delete of this name; start over on the new slot
            if guard.detached {
                drop(guard);
                slot = self.slot_for(name).await;
                continue;
            }
            if !tokio::fs::try_exists(&path).await? {
                tokio::fs::create_dir_all(&self.root).await?;
                write_atomic(&path, &CacheFile::default()).await?;
                debug!(cache = name, path = %path.display(), "Created cache file");
            }
            break;
        }
        Ok(Arc::new(DiskCache {
            name: name.to_string(),
            path,
            slot,
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.cache_path(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.cache_path(name)?;
        // Held until the file is gone so no open can pick up the old slot
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.remove(name) {
            slot.lock().await.detached = true;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CACHE_FILE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
