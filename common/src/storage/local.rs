use super::{ObjectStorage, dir_prefix};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

/// Filesystem-backed storage rooted at a directory.
pub struct LocalStorage {
    root: PathBuf,
    label: String,
}

impl LocalStorage {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).await?;
        let root = fs::canonicalize(root).await?;
        let label = root.to_string_lossy().into_owned();
        Ok(Self { root, label })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_matches('/');
        if key.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidInput(format!(
                "Key '{}' escapes the storage root",
                key
            )));
        }
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::Storage(format!("Object {} not found in {}", key, self.label))
            }
            _ => Error::Io(e),
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn check_file_exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)?).await?)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn bucket(&self) -> &str {
        &self.label
    }

    fn table_url(&self, prefix: &str) -> Result<String> {
        let dir = self.path_for(prefix)?;
        Url::from_directory_path(&dir)
            .map(|url| url.to_string())
            .map_err(|_| Error::InvalidInput(format!("Not an absolute path: {}", dir.display())))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let path = self.path_for(prefix)?;
        let is_dir = fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);

        // Whole directories go at once so no empty partitions are left behind
        if is_dir && path != self.root {
            let removed = self.list_objects(&dir_prefix(prefix)).await?.len();
            fs::remove_dir_all(&path).await?;
            return Ok(removed);
        }

        let keys = self.list_objects(&dir_prefix(prefix)).await?;
        for key in &keys {
            self.delete_object(key).await?;
        }
        Ok(keys.len())
    }
}
