use async_trait::async_trait;
use jockey_proto::track::SpaceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Durable per-space preferences, read once at session creation. Writes are
/// best-effort and asynchronous; playback never waits on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpacePrefs {
    pub volume: Option<u16>,
}

#[async_trait]
pub trait PrefStore: Send + Sync {
    async fn load(&self, space: SpaceId) -> anyhow::Result<Option<SpacePrefs>>;
    async fn store(&self, space: SpaceId, prefs: SpacePrefs) -> anyhow::Result<()>;
}

/// For embedders that keep preferences in their own store.
pub struct NullPrefStore;

#[async_trait]
impl PrefStore for NullPrefStore {
    async fn load(&self, _space: SpaceId) -> anyhow::Result<Option<SpacePrefs>> {
        Ok(None)
    }

    async fn store(&self, _space: SpaceId, _prefs: SpacePrefs) -> anyhow::Result<()> {
        Ok(())
    }
}

/// JSON-file store under the data dir: one map keyed by space id.
pub struct FilePrefStore {
    path: PathBuf,
    cache: Mutex<HashMap<u64, SpacePrefs>>,
}

impl FilePrefStore {
    pub fn open(path: PathBuf) -> Self {
        let cache = Self::load_file(&path);
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn load_file(path: &PathBuf) -> HashMap<u64, SpacePrefs> {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(map) = serde_json::from_str(&content) {
                return map;
            }
        }
        HashMap::new()
    }
}

#[async_trait]
impl PrefStore for FilePrefStore {
    async fn load(&self, space: SpaceId) -> anyhow::Result<Option<SpacePrefs>> {
        let cache = self.cache.lock().await;
        Ok(cache.get(&space.0).cloned())
    }

    async fn store(&self, space: SpaceId, prefs: SpacePrefs) -> anyhow::Result<()> {
        let json = {
            let mut cache = self.cache.lock().await;
            let entry = cache.entry(space.0).or_default();
            if prefs.volume.is_some() {
                entry.volume = prefs.volume;
            }
            serde_json::to_string_pretty(&*cache)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
