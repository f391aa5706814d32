//! Content-addressed storage for receipt photos

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the bytes and return their reference; storing the same content
    /// twice yields the same reference.
    async fn put(&self, content_hash: &str, extension: &str, bytes: &[u8]) -> AppResult<String>;

    async fn get(&self, image_ref: &str) -> AppResult<Vec<u8>>;
}

/// Files laid out as `<root>/<hash[..2]>/<hash>.<ext>`
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, image_ref: &str) -> AppResult<PathBuf> {
        let relative = Path::new(image_ref);
        let safe = relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !safe {
            return Err(AppError::BadRequest(format!("Invalid image reference: {}", image_ref)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, content_hash: &str, extension: &str, bytes: &[u8]) -> AppResult<String> {
        if content_hash.len() < 2 || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::Internal(format!("Bad content hash: {}", content_hash)));
        }
        let image_ref = format!("{}/{}.{}", &content_hash[..2], content_hash, extension);
        let path = self.resolve(&image_ref)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(image_ref);
        }

        let dir = path
            .parent()
            .ok_or_else(|| AppError::Internal("Blob path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create blob directory: {}", e)))?;

        // Write then rename so readers never see a partial file
        let staging = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write blob: {}", e)))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to store blob: {}", e)))?;

        Ok(image_ref)
    }

    async fn get(&self, image_ref: &str) -> AppResult<Vec<u8>> {
        let path = self.resolve(image_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Image {} not found", image_ref)))
            }
            Err(e) => Err(AppError::Internal(format!("Failed to read blob: {}", e))),
        }
    }
}
