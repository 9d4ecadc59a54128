//! Filesystem storage backend

use crate::storage::KeyValueStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

const EXTENSION: &str = "json";

/// Filesystem storage backend
///
/// One file per key. Keys are percent-encoded into file names so `keys()`
/// can recover them. Writes land in a temp file that is renamed over the
/// target, so a crash leaves either the old or the new record.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create storage directory: {:?}", root))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", urlencoding::encode(key), EXTENSION))
    }

    fn path_to_key(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        urlencoding::decode(stem).ok().map(|k| k.into_owned())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_to_path(key);

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, value)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {:?}", path)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {:?}", self.root))?;

        while let Some(entry) = dir.next_entry().await? {
            if let Some(key) = Self::path_to_key(&entry.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        store
            .set("cache:student:42", r#"{"name":"Ada"}"#.to_string())
            .await
            .unwrap();

        let value = store.get("cache:student:42").await.unwrap();
        assert_eq!(value.as_deref(), Some(r#"{"name":"Ada"}"#));
        assert!(store.get("cache:student:43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_keys_survive_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        store.set("queue:item:a/b", "1".into()).await.unwrap();
        store.set("queue:item:c", "2".into()).await.unwrap();
        store.set("actions:entry:d", "3".into()).await.unwrap();

        let mut keys = store.keys("queue:item:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["queue:item:a/b", "queue:item:c"]);
    }

    #[tokio::test]
    async fn test_file_store_replace_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        store.set("k", "old".into()).await.unwrap();
        store.set("k", "new".into()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.keys("").await.unwrap().is_empty());
    }
}
