//! Storage buckets for input assets and rendered artifacts.
//!
//! The driver reads input files out of a bucket and the session uploads
//! artifacts into one. The disk implementation lays buckets out as
//! sub-directories of a root; remote object stores plug in behind the same
//! traits.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::Result;

/// One named bucket.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Open an object for reading.
    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Store an object from a stream. `content_type` is advisory; backends
    /// without metadata support ignore it.
    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
        content_type: &str,
    ) -> Result<()>;
}

/// Hands out buckets by name. The empty name addresses the root bucket.
pub trait Storage: Send + Sync {
    fn bucket(&self, name: &str) -> Arc<dyn Bucket>;
}

/// Local-filesystem storage rooted at a directory.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for DiskStorage {
    fn bucket(&self, name: &str) -> Arc<dyn Bucket> {
        let dir = if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(name)
        };
        Arc::new(DiskBucket { dir })
    }
}

/// A directory acting as a bucket.
pub struct DiskBucket {
    dir: PathBuf,
}

#[async_trait]
impl Bucket for DiskBucket {
    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(self.dir.join(name)).await?;
        Ok(Box::new(file))
    }

    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
        _content_type: &str,
    ) -> Result<()> {
        let target = self.dir.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target).await?;
        tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
}
