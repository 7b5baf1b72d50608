//! Backend-set coordinator: applies each structural mutation to every
//! backend in order and compensates earlier backends when a later one fails.

mod file;

pub use file::MirrorFile;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::error::{FsError, Result};
use crate::fs::{Context, File, FileMetadata, FileSystem, OpenFlags};
use crate::operation::Operation;

pub struct MirrorFs {
    backends: Vec<Arc<dyn FileSystem>>,
    /// Serializes structural mutations and opens across the whole backend set.
    lock: Mutex<()>,
}

impl std::fmt::Debug for MirrorFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorFs")
            .field("backends", &self.backends.len())
            .finish()
    }
}

impl MirrorFs {
    /// The first backend is the primary.
    pub fn new(backends: Vec<Arc<dyn FileSystem>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(FsError::InvalidOperation(
                "a mirror set needs at least one backend".to_string(),
            ));
        }
        Ok(Self {
            backends,
            lock: Mutex::new(()),
        })
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn primary(&self) -> &Arc<dyn FileSystem> {
        &self.backends[0]
    }

    pub async fn create_directory(&self, ctx: &Context, path: &Path, permissions: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut op = Operation::create_directory(path, permissions);
        self.execute_with_rollback(ctx, &mut op).await
    }

    pub async fn remove_all(&self, ctx: &Context, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        let target = match self.stat(ctx, path).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!("remove_all: stat {:?} on primary failed, treating as file: {}", path, e);
                None
            }
        };
        let mut op = Operation::remove(path, target.as_ref());
        self.execute_with_rollback(ctx, &mut op).await
    }

    pub async fn rename(&self, ctx: &Context, from: &Path, to: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut op = Operation::rename(from, to);
        self.execute_with_rollback(ctx, &mut op).await
    }

    /// Opens the path on every backend. A failed open closes the handles
    /// already obtained; files created by them are left in place.
    pub async fn open_file(
        &self,
        ctx: &Context,
        path: &Path,
        flags: OpenFlags,
        permissions: u32,
    ) -> Result<MirrorFile> {
        let _guard = self.lock.lock().await;
        let mut files: Vec<Box<dyn File>> = Vec::with_capacity(self.backends.len());

        for (index, backend) in self.backends.iter().enumerate() {
            match backend.open_file(ctx, path, flags, permissions).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    for (opened, mut file) in files.into_iter().enumerate() {
                        if let Err(close_err) = file.close().await {
                            debug!("open_file: closing {:?} on backend {} failed: {}", path, opened, close_err);
                        }
                    }
                    return Err(FsError::Open {
                        index,
                        source: Box::new(e),
                    });
                }
            }
        }

        debug!("open_file: opened {:?} on {} backends", path, files.len());
        Ok(MirrorFile::new(path, files))
    }

    /// Metadata comes from the primary only.
    pub async fn stat(&self, ctx: &Context, path: &Path) -> Result<FileMetadata> {
        self.primary().get_metadata(ctx, path).await
    }

    /// Runs `op` on backends in order. On the first failure every backend
    /// that already succeeded is compensated, in success order; compensation
    /// errors are logged and never returned. Compensations ignore
    /// cancellation of `ctx`.
    async fn execute_with_rollback(&self, ctx: &Context, op: &mut Operation) -> Result<()> {
        let mut succeeded = Vec::with_capacity(self.backends.len());

        for (index, backend) in self.backends.iter().enumerate() {
            if let Err(e) = op.execute(ctx, index, backend.as_ref()).await {
                warn!("{} failed on backend {}: {}", op, index, e);
                let rollback_ctx = ctx.without_cancel();
                for &done in &succeeded {
                    let backend: &Arc<dyn FileSystem> = &self.backends[done];
                    if let Err(rollback_err) = op.rollback(&rollback_ctx, done, backend.as_ref()).await {
                        warn!("Rollback of {} failed for backend {}: {}", op, done, rollback_err);
                    }
                }
                return Err(FsError::Backend {
                    index,
                    source: Box::new(e),
                });
            }
            succeeded.push(index);
        }

        debug!("{} applied to {} backends", op, succeeded.len());
        Ok(())
    }
}

#[async_trait]
impl FileSystem for MirrorFs {
    async fn create_directory<'a>(&'a self, ctx: &'a Context, path: &'a Path, permissions: u32) -> Result<()> {
        MirrorFs::create_directory(self, ctx, path, permissions).await
    }

    async fn remove_all<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<()> {
        MirrorFs::remove_all(self, ctx, path).await
    }

    async fn rename<'a>(&'a self, ctx: &'a Context, from: &'a Path, to: &'a Path) -> Result<()> {
        MirrorFs::rename(self, ctx, from, to).await
    }

    async fn open_file<'a>(
        &'a self,
        ctx: &'a Context,
        path: &'a Path,
        flags: OpenFlags,
        permissions: u32,
    ) -> Result<Box<dyn File>> {
        let file = MirrorFs::open_file(self, ctx, path, flags, permissions).await?;
        Ok(Box::new(file))
    }

    async fn get_metadata<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<FileMetadata> {
        self.stat(ctx, path).await
    }
}
