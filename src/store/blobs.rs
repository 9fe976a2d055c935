//! File storage for attachments passed between the gateway and engines.

use std::path::{Component, Path, PathBuf};

use tracing::info;

use super::StoreError;

/// Stores blobs under a root directory. Keys are relative paths such as
/// `att/photo.jpg`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        info!("Stored blob '{}' ({} bytes)", key, data.len());
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::read(&path).await?)
    }
}
