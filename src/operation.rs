//! Structural mutations that can be applied to one backend and compensated.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use crate::error::Result;
use crate::fs::{Context, FileMetadata, FileSystem, OpenFlags};

/// Permission bits used when a removed directory is recreated without captured bits.
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;
/// Permission bits used when a removed file is recreated without captured bits.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

/// One structural mutation plus the state needed to undo it.
///
/// Compensations are independent per backend, which is what lets the
/// coordinator run them in success order. A variant whose undo depends on
/// another backend's state would need reverse-order rollback.
#[derive(Debug)]
pub enum Operation {
    CreateDirectory {
        path: PathBuf,
        permissions: u32,
    },
    Remove {
        path: PathBuf,
        is_dir: bool,
        permissions: Option<u32>,
        /// Bytes read from each backend before deletion, keyed by backend index.
        captured: HashMap<usize, Vec<u8>>,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
}

impl Operation {
    pub fn create_directory(path: &Path, permissions: u32) -> Self {
        Operation::CreateDirectory {
            path: path.to_path_buf(),
            permissions,
        }
    }

    /// `target` is the primary's view of the path; `None` means stat failed
    /// and the target is treated as a file.
    pub fn remove(path: &Path, target: Option<&FileMetadata>) -> Self {
        Operation::Remove {
            path: path.to_path_buf(),
            is_dir: target.map(|m| m.is_dir).unwrap_or(false),
            permissions: target.map(|m| m.permissions),
            captured: HashMap::new(),
        }
    }

    pub fn rename(from: &Path, to: &Path) -> Self {
        Operation::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }
    }

    pub async fn execute(&mut self, ctx: &Context, index: usize, fs: &dyn FileSystem) -> Result<()> {
        match self {
            Operation::CreateDirectory { path, permissions } => {
                fs.create_directory(ctx, path, *permissions).await
            }
            Operation::Remove { path, is_dir, captured, .. } => {
                if !*is_dir {
                    let content = capture_content(ctx, fs, path).await;
                    captured.insert(index, content);
                }
                fs.remove_all(ctx, path).await
            }
            Operation::Rename { from, to } => fs.rename(ctx, from, to).await,
        }
    }

    pub async fn rollback(&mut self, ctx: &Context, index: usize, fs: &dyn FileSystem) -> Result<()> {
        match self {
            Operation::CreateDirectory { path, .. } => fs.remove_all(ctx, path).await,
            Operation::Remove { path, is_dir: true, permissions, .. } => {
                let mode = permissions.unwrap_or(DEFAULT_DIR_PERMISSIONS);
                fs.create_directory(ctx, path, mode).await
            }
            Operation::Remove { path, is_dir: false, permissions, captured } => {
                let mode = permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS);
                let flags = OpenFlags::write_only().create().truncate();
                let mut file = fs.open_file(ctx, path, flags, mode).await?;
                let content = captured.get(&index).map(Vec::as_slice).unwrap_or_default();
                let written = write_fully(file.as_mut(), content).await;
                let closed = file.close().await;
                written.and(closed)
            }
            Operation::Rename { from, to } => fs.rename(ctx, to, from).await,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateDirectory { path, permissions } => {
                write!(f, "mkdir {:?} (mode {:o})", path, permissions)
            }
            Operation::Remove { path, is_dir, .. } => {
                let kind = if *is_dir { "directory" } else { "file" };
                write!(f, "remove {} {:?}", kind, path)
            }
            Operation::Rename { from, to } => write!(f, "rename {:?} -> {:?}", from, to),
        }
    }
}

/// Reads the whole file; any failure yields empty content.
async fn capture_content(ctx: &Context, fs: &dyn FileSystem, path: &Path) -> Vec<u8> {
    let mut file = match fs.open_file(ctx, path, OpenFlags::read_only(), 0).await {
        Ok(file) => file,
        Err(e) => {
            debug!("capture {:?}: open failed, restoring empty content: {}", path, e);
            return Vec::new();
        }
    };

    let mut content = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => content.extend_from_slice(&buf[..n]),
            Err(e) => {
                debug!("capture {:?}: read failed after {} bytes: {}", path, content.len(), e);
                break;
            }
        }
    }
    if let Err(e) = file.close().await {
        debug!("capture {:?}: close failed: {}", path, e);
    }
    content
}

async fn write_fully(file: &mut dyn crate::fs::File, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = file.write(data).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn test_create_directory_rollback_removes_tree() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        let mut op = Operation::create_directory(Path::new("/a"), 0o750);

        op.execute(&ctx, 0, &fs).await.unwrap();
        let meta = fs.get_metadata(&ctx, Path::new("/a")).await.unwrap();
        assert!(meta.is_dir);
        assert_eq!(meta.permissions, 0o750);

        fs.put_file("/a/child", b"x");
        op.rollback(&ctx, 0, &fs).await.unwrap();
        assert!(!fs.exists("/a"));
        assert!(!fs.exists("/a/child"));
    }

    #[tokio::test]
    async fn test_remove_file_restores_captured_content() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        fs.put_file("/notes.txt", b"keep me");
        let meta = fs.get_metadata(&ctx, Path::new("/notes.txt")).await.unwrap();

        let mut op = Operation::remove(Path::new("/notes.txt"), Some(&meta));
        op.execute(&ctx, 0, &fs).await.unwrap();
        assert!(!fs.exists("/notes.txt"));

        op.rollback(&ctx, 0, &fs).await.unwrap();
        assert_eq!(fs.contents("/notes.txt").unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_remove_restores_each_backend_with_its_own_content() {
        let ctx = Context::new();
        let primary = MemoryStorage::new();
        let mirror = MemoryStorage::new();
        primary.put_file("/f", b"primary");
        mirror.put_file("/f", b"mirror");

        let mut op = Operation::remove(Path::new("/f"), None);
        op.execute(&ctx, 0, &primary).await.unwrap();
        op.execute(&ctx, 1, &mirror).await.unwrap();
        op.rollback(&ctx, 0, &primary).await.unwrap();
        op.rollback(&ctx, 1, &mirror).await.unwrap();

        assert_eq!(primary.contents("/f").unwrap(), b"primary");
        assert_eq!(mirror.contents("/f").unwrap(), b"mirror");
    }

    #[tokio::test]
    async fn test_remove_missing_file_restores_empty_file() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();

        let mut op = Operation::remove(Path::new("/ghost"), None);
        op.execute(&ctx, 0, &fs).await.unwrap();
        op.rollback(&ctx, 0, &fs).await.unwrap();
        assert_eq!(fs.contents("/ghost").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_remove_directory_recreates_with_captured_permissions() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        fs.create_directory(&ctx, Path::new("/d"), 0o700).await.unwrap();
        let meta = fs.get_metadata(&ctx, Path::new("/d")).await.unwrap();

        let mut op = Operation::remove(Path::new("/d"), Some(&meta));
        op.execute(&ctx, 0, &fs).await.unwrap();
        op.rollback(&ctx, 0, &fs).await.unwrap();

        let restored = fs.get_metadata(&ctx, Path::new("/d")).await.unwrap();
        assert!(restored.is_dir);
        assert_eq!(restored.permissions, 0o700);
    }

    #[tokio::test]
    async fn test_rename_rollback_and_repeat() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        fs.put_file("/old", b"data");

        let mut op = Operation::rename(Path::new("/old"), Path::new("/new"));
        op.execute(&ctx, 0, &fs).await.unwrap();
        assert!(fs.exists("/new"));

        op.rollback(&ctx, 0, &fs).await.unwrap();
        assert_eq!(fs.contents("/old").unwrap(), b"data");
        assert!(!fs.exists("/new"));

        // Already rolled back: a second attempt fails cleanly and changes nothing.
        assert!(op.rollback(&ctx, 0, &fs).await.is_err());
        assert_eq!(fs.contents("/old").unwrap(), b"data");
    }
}
