//! Blob store for generated assets (thumbnails, previews, fetched files).
//!
//! Keys are `<prefix>/<sha256 of content>[.<ext>]`, so storing the same
//! bytes twice is a no-op and task reruns stay idempotent.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `prefix` and return the key.
    async fn put(&self, prefix: &str, extension: Option<&str>, bytes: &[u8]) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every stored key under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn content_key(prefix: &str, extension: Option<&str>, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    let prefix = prefix.trim_matches('/');
    let name = match extension.map(|e| e.trim_start_matches('.')) {
        Some(ext) if !ext.is_empty() => format!("{}.{}", digest, ext),
        _ => digest,
    };
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid blob key: '{}'", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, prefix: &str, extension: Option<&str>, bytes: &[u8]) -> Result<String> {
        let key = content_key(prefix, extension, bytes);
        let path = self.path_for(&key)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(key);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory {}", parent.display()))?;
        }
        // Write then rename so readers never see a partial blob.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read blob {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("Failed to delete blob {}", path.display())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(prefix.trim_matches('/'));
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&dir) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root)?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.ends_with(".partial") {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_content_addressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        let a = store.put("thumbnails/", Some(".png"), b"image").await.unwrap();
        let b = store.put("thumbnails", Some("png"), b"image").await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("thumbnails/") && a.ends_with(".png"));
        assert_eq!(store.get(&a).await.unwrap().as_deref(), Some(&b"image"[..]));

        store.put("previews", None, b"other").await.unwrap();
        assert_eq!(store.list("thumbnails").await.unwrap(), vec![a.clone()]);
        assert_eq!(store.list("").await.unwrap().len(), 2);

        assert!(store.delete(&a).await.unwrap());
        assert!(!store.delete(&a).await.unwrap());
        assert_eq!(store.get(&a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("/abs").await.is_err());
    }
}
