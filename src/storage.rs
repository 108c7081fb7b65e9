use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::{fs, task};

/// Keyed file storage for uploads, stamped outputs and the signature image.
///
/// Keys are relative, slash-separated paths such as `uploads/ab12/report.pdf`.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Writes the whole object or nothing; a failed write never leaves a partial file.
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    async fn object_exists(&self, key: &str) -> Result<bool>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directories that must exist before the first request.
    pub async fn ensure_dirs(&self, prefixes: &[&str]) -> Result<()> {
        for prefix in prefixes {
            let dir = self.resolve(prefix)?;
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() {
            bail!("storage key must not be empty");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("storage key {key:?} escapes the storage root"),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("storage key {key:?} has no parent directory"))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;

        task::spawn_blocking(move || -> Result<()> {
            let mut staged = tempfile::NamedTempFile::new_in(&parent)
                .context("failed to create staging file")?;
            staged
                .write_all(&bytes)
                .context("failed to write staging file")?;
            staged
                .as_file()
                .sync_all()
                .context("failed to flush staging file")?;
            staged
                .persist(&path)
                .map_err(|err| anyhow!("failed to move object into place: {}", err.error))?;
            Ok(())
        })
        .await
        .context("storage write task panicked")?
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read object {key}"))
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to inspect object {key}")),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete object {key}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .put_object("uploads/abc/doc.pdf", b"%PDF-1.4".to_vec())
            .await
            .unwrap();
        assert!(storage.object_exists("uploads/abc/doc.pdf").await.unwrap());
        assert_eq!(
            storage.get_object("uploads/abc/doc.pdf").await.unwrap(),
            b"%PDF-1.4"
        );

        storage
            .put_object("uploads/abc/doc.pdf", b"replaced".to_vec())
            .await
            .unwrap();
        assert_eq!(
            storage.get_object("uploads/abc/doc.pdf").await.unwrap(),
            b"replaced"
        );

        storage.delete_object("uploads/abc/doc.pdf").await.unwrap();
        assert!(!storage.object_exists("uploads/abc/doc.pdf").await.unwrap());
        storage.delete_object("uploads/abc/doc.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn refuses_keys_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(storage.get_object("../etc/passwd").await.is_err());
        assert!(storage.put_object("/abs/file.pdf", vec![1]).await.is_err());
        assert!(storage.object_exists("").await.is_err());
    }

    #[tokio::test]
    async fn ensure_dirs_creates_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.ensure_dirs(&["uploads", "signed", "static"]).await.unwrap();
        assert!(dir.path().join("signed").is_dir());
        assert!(dir.path().join("static").is_dir());
    }
}
