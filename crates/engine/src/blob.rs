//! Document blob storage.
//!
//! Source PDFs are uploaded by the surrounding product and referenced by key;
//! sealed documents are written content-addressed under `sealed/`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::BlobError;

/// Where a content-addressed blob landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentAddress {
    pub key: String,
    /// Lower-case hex SHA-256 of the stored bytes.
    pub sha256: String,
    pub size: u64,
}

/// Lower-case hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    /// Store `bytes` at `sealed/<sha256>.pdf`. Writing identical content
    /// twice lands on the same key.
    async fn put_content_addressed(&self, bytes: Vec<u8>) -> Result<ContentAddress, BlobError> {
        let sha256 = sha256_hex(&bytes);
        let key = format!("sealed/{sha256}.pdf");
        let size = bytes.len() as u64;
        self.put(&key, bytes).await?;
        Ok(ContentAddress { key, sha256, size })
    }
}

fn check_key(key: &str) -> Result<(), BlobError> {
    let path = Path::new(key);
    let clean = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(BlobError::InvalidKey {
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob, typically a source document.
    pub fn with_blob(self, key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(key.to_string(), bytes.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobError::Backend("blob store lock poisoned".to_string()))?;
        blobs.get(key).cloned().ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        check_key(key)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| BlobError::Backend("blob store lock poisoned".to_string()))?;
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Blobs as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
