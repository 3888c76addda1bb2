use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

/// Minimal key/value contract for persisted measurement state and reports.
///
/// Writes are last-writer-wins per key; there are no cross-key transactions.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Redis backed store: every key holds one blob as a plain string value.
#[derive(Clone)]
pub struct RedisBlobStore {
    client: redis::Client,
}

impl RedisBlobStore {
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("unable to open redis client for {url}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut con = self.client.get_async_connection().await?;
        let value: Option<Vec<u8>> = con.get(key).await?;
        trace!("GET {key} -> {:?} bytes", value.as_ref().map(Vec::len));
        Ok(value)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut con = self.client.get_async_connection().await?;
        trace!("SET {key} ({} bytes)", bytes.len());
        con.set::<_, _, ()>(key, bytes).await?;
        Ok(())
    }
}

/// Directory backed store. Keys are relative paths below `root`.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.is_empty() || escapes {
            anyhow::bail!("invalid blob key: {key:?}");
        }
        Ok(self.root.join(relative))
    }
}

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `<file name>.<pid>-<n>.partial` next to `path`, unique per write.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{n}.partial", std::process::id()));
    path.with_file_name(name)
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("unable to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write to a sibling file first so readers never observe a torn blob
        let staging = staging_path(&path);
        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("unable to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

/// In-process store; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.put("a", b"one".to_vec()).await.unwrap();
        store.put("a", b"two".to_vec()).await.unwrap();
        let shared = store.clone();
        assert_eq!(shared.get("a").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(shared.keys().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn dir_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        assert_eq!(store.get("Build/1/state.json").await.unwrap(), None);
        store
            .put("Build/1/state.json", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get("Build/1/state.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
        let names: Vec<_> = std::fs::read_dir(dir.path().join("Build/1"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["state.json"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dir_store_keys_sharing_a_stem_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let spawn_put = |key: &'static str, value: String| {
            let store = store.clone();
            tokio::spawn(async move { store.put(key, value.into_bytes()).await })
        };
        for round in 0..50u32 {
            let (a, b) = tokio::join!(
                spawn_put("measurements:proj-1.1", format!("one {round}")),
                spawn_put("measurements:proj-1.2", format!("two {round}")),
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();
            assert_eq!(
                store.get("measurements:proj-1.1").await.unwrap(),
                Some(format!("one {round}").into_bytes())
            );
            assert_eq!(
                store.get("measurements:proj-1.2").await.unwrap(),
                Some(format!("two {round}").into_bytes())
            );
        }
    }

    #[test]
    fn staging_names_are_unique_siblings() {
        let path = Path::new("root/measurements:proj-1.1");
        let first = staging_path(path);
        let second = staging_path(path);
        assert_ne!(first, second);
        assert_eq!(first.parent(), path.parent());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("measurements:proj-1.1."));
        assert!(name.ends_with(".partial"));
    }

    #[tokio::test]
    async fn dir_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        assert!(store.get("../outside").await.is_err());
        assert!(store.put("/etc/passwd", Vec::new()).await.is_err());
        assert!(store.get("").await.is_err());
    }
}
