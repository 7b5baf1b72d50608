use std::io::SeekFrom;
use std::path::Path;
use std::time::SystemTime;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::error::{FsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Low 12 mode bits.
    pub permissions: u32,
    pub modified: SystemTime,
}

/// How a file is opened, shaped after `std::fs::OpenOptions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self { read: true, ..Self::default() }
    }

    pub fn write_only() -> Self {
        Self { write: true, ..Self::default() }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, ..Self::default() }
    }

    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn create_new(mut self) -> Self {
        self.create_new = true;
        self
    }

    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn append(mut self) -> Self {
        self.append = true;
        self
    }

    /// True when opening with these flags can change the backend.
    pub fn mutates(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }
}

/// Cancellable request context passed to every backend call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A context that ignores this request's cancellation. Compensations
    /// run under it so a cancelled request can still undo its partial work.
    pub fn without_cancel(&self) -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with `FsError::Cancelled` once the request has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Capability set every backend filesystem provides.
#[async_trait]
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    async fn create_directory<'a>(&'a self, ctx: &'a Context, path: &'a Path, permissions: u32) -> Result<()>;
    async fn remove_all<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<()>;
    async fn rename<'a>(&'a self, ctx: &'a Context, from: &'a Path, to: &'a Path) -> Result<()>;
    async fn open_file<'a>(
        &'a self,
        ctx: &'a Context,
        path: &'a Path,
        flags: OpenFlags,
        permissions: u32,
    ) -> Result<Box<dyn File>>;
    async fn get_metadata<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<FileMetadata>;
}

/// An open file on a single backend.
#[async_trait]
pub trait File: Send + Sync + std::fmt::Debug {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Returning fewer bytes than `buf.len()` is a short write.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Up to `count` further directory entries; `0` returns all remaining ones.
    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileMetadata>>;

    async fn stat(&mut self) -> Result<FileMetadata>;

    async fn close(&mut self) -> Result<()>;

    /// Handles that cannot truncate keep this default.
    async fn truncate(&mut self, _len: u64) -> Result<()> {
        Err(FsError::Unsupported("truncate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_builders() {
        let flags = OpenFlags::write_only().create().truncate();
        assert!(flags.write && flags.create && flags.truncate);
        assert!(!flags.read);
        assert!(flags.mutates());
        assert!(!OpenFlags::read_only().mutates());

        let flags = OpenFlags::write_only().create_new().append();
        assert!(flags.create_new && flags.append && !flags.truncate);
    }

    #[test]
    fn test_context_cancel() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());

        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(FsError::Cancelled)));
        assert!(ctx.without_cancel().check().is_ok());

        let token = CancellationToken::new();
        let shared = Context::with_token(token.clone());
        token.cancel();
        assert!(shared.is_cancelled());
    }
}
