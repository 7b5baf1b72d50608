pub mod memory;

use async_trait::async_trait;
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};
use crate::error::{FsError, Result};
use crate::fs::{Context, File, FileMetadata, FileSystem, OpenFlags};
use crate::lock::LOCK_FILE_NAME;

pub use memory::{Faults, MemoryStorage};

/// 以宿主机目录为根的存储后端
#[derive(Debug, Clone)]
pub struct DirStorage {
    base_path: PathBuf,
    read_only: bool,
}

impl DirStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { base_path: root, read_only: false }
    }

    pub fn read_only(root: PathBuf) -> Self {
        Self { base_path: root, read_only: true }
    }

    /// 将请求路径映射到根目录下，拒绝越出根目录的 `..`
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(s) => relative.push(s),
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(FsError::PermissionDenied(format!("{:?} escapes the backend root", path)));
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(self.base_path.join(relative))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

fn to_metadata(name: String, metadata: &std::fs::Metadata) -> Result<FileMetadata> {
    Ok(FileMetadata {
        name,
        size: metadata.len(),
        is_dir: metadata.is_dir(),
        permissions: metadata.mode() & 0o7777,
        modified: metadata.modified()?,
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

fn map_io(e: std::io::Error, path: &Path) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::not_found(path),
        std::io::ErrorKind::AlreadyExists => FsError::already_exists(path),
        std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(format!("{:?}", path)),
        _ => FsError::Io(e),
    }
}

#[async_trait]
impl FileSystem for DirStorage {
    async fn create_directory<'a>(&'a self, ctx: &'a Context, path: &'a Path, permissions: u32) -> Result<()> {
        ctx.check()?;
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        debug!("create_directory: 创建目录 {:?}", full_path);
        tokio::fs::DirBuilder::new()
            .mode(permissions & 0o7777)
            .create(&full_path)
            .await
            .map_err(|e| {
                error!("create_directory 失败: path={:?}, error={:?}", full_path, e);
                map_io(e, path)
            })?;
        // mkdir 受 umask 影响，显式设置权限位
        tokio::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(permissions & 0o7777))
            .await
            .map_err(|e| map_io(e, path))
    }

    async fn remove_all<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<()> {
        ctx.check()?;
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        if full_path == self.base_path {
            return Err(FsError::InvalidOperation("cannot remove the backend root".to_string()));
        }
        let metadata = match tokio::fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(e, path)),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full_path).await
        } else {
            tokio::fs::remove_file(&full_path).await
        }
        .map_err(|e| map_io(e, path))
    }

    async fn rename<'a>(&'a self, ctx: &'a Context, from: &'a Path, to: &'a Path) -> Result<()> {
        ctx.check()?;
        self.check_writable()?;
        let (from_path, to_path) = (self.resolve(from)?, self.resolve(to)?);
        debug!("rename: 重命名 {:?} -> {:?}", from_path, to_path);
        tokio::fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| map_io(e, from))
    }

    async fn open_file<'a>(
        &'a self,
        ctx: &'a Context,
        path: &'a Path,
        flags: OpenFlags,
        permissions: u32,
    ) -> Result<Box<dyn File>> {
        ctx.check()?;
        if flags.mutates() {
            self.check_writable()?;
        }
        let full_path = self.resolve(path)?;
        let file = tokio::fs::OpenOptions::new()
            .read(flags.read || !(flags.write || flags.append))
            .write(flags.write)
            .append(flags.append)
            .create(flags.create)
            .create_new(flags.create_new)
            .truncate(flags.truncate)
            .mode(permissions & 0o7777)
            .open(&full_path)
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(Box::new(DirFile {
            path: full_path,
            file: Some(file),
            listed: None,
        }))
    }

    async fn get_metadata<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<FileMetadata> {
        ctx.check()?;
        let full_path = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(e, path))?;
        to_metadata(display_name(&full_path), &metadata)
    }
}

/// 已打开的宿主机文件，写入后立即 flush，其他句柄可见
#[derive(Debug)]
pub struct DirFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    listed: Option<Vec<FileMetadata>>,
}

impl DirFile {
    fn handle(&mut self) -> Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| FsError::InvalidOperation("file already closed".to_string()))
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOCK_FILE_NAME {
                debug!("Ignoring lock file in read_dir: {:?}", entry.path());
                continue;
            }
            let metadata = entry.metadata().await?;
            entries.push(to_metadata(name, &metadata)?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[async_trait]
impl File for DirFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        // tokio 单次 write 最多拷贝 2 MiB，必须写满整个缓冲区
        let file = self.handle()?;
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.handle()?.seek(pos).await?)
    }

    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileMetadata>> {
        self.handle()?;
        if self.listed.is_none() {
            self.listed = Some(self.list().await?);
        }
        let remaining = self.listed.get_or_insert_with(Vec::new);
        let take = if count == 0 { remaining.len() } else { count.min(remaining.len()) };
        Ok(remaining.drain(..take).collect())
    }

    async fn stat(&mut self) -> Result<FileMetadata> {
        let name = display_name(&self.path);
        let metadata = self.handle()?.metadata().await?;
        to_metadata(name, &metadata)
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| FsError::InvalidOperation("file already closed".to_string()))?;
        file.flush().await?;
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<()> {
        Ok(self.handle()?.set_len(len).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorFs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_roundtrip_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let fs = DirStorage::new(temp_dir.path().to_path_buf());
        let ctx = Context::new();

        let mut file = fs
            .open_file(&ctx, Path::new("/a.txt"), OpenFlags::read_write().create(), 0o644)
            .await
            .unwrap();
        assert_eq!(file.write(b"hello world").await.unwrap(), 11);
        file.seek(SeekFrom::Start(6)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        file.truncate(5).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size, 5);
        file.close().await.unwrap();
        assert!(file.close().await.is_err());

        assert_eq!(std::fs::read(temp_dir.path().join("a.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_mkdir_is_not_recursive_and_keeps_mode() {
        let temp_dir = TempDir::new().unwrap();
        let fs = DirStorage::new(temp_dir.path().to_path_buf());
        let ctx = Context::new();

        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/x/y"), 0o755).await,
            Err(FsError::NotFound(_))
        ));
        fs.create_directory(&ctx, Path::new("/x"), 0o750).await.unwrap();
        let meta = fs.get_metadata(&ctx, Path::new("/x")).await.unwrap();
        assert!(meta.is_dir);
        assert_eq!(meta.permissions, 0o750);
        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/x"), 0o755).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_all_and_rename() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("d/e")).unwrap();
        std::fs::write(temp_dir.path().join("d/e/f"), b"1").unwrap();
        let fs = DirStorage::new(temp_dir.path().to_path_buf());
        let ctx = Context::new();

        fs.rename(&ctx, Path::new("/d"), Path::new("/moved")).await.unwrap();
        assert!(temp_dir.path().join("moved/e/f").exists());

        fs.remove_all(&ctx, Path::new("/moved")).await.unwrap();
        assert!(!temp_dir.path().join("moved").exists());
        fs.remove_all(&ctx, Path::new("/moved")).await.unwrap();
    }

    #[tokio::test]
    async fn test_escape_and_read_only_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = Context::new();
        let fs = DirStorage::new(temp_dir.path().join("root"));
        assert!(matches!(
            fs.get_metadata(&ctx, Path::new("../etc/passwd")).await,
            Err(FsError::PermissionDenied(_))
        ));

        let ro = DirStorage::read_only(temp_dir.path().to_path_buf());
        assert!(matches!(
            ro.create_directory(&ctx, Path::new("/b"), 0o755).await,
            Err(FsError::ReadOnly)
        ));
        assert!(ro.open_file(&ctx, Path::new("/b"), OpenFlags::write_only().create(), 0o644).await.is_err());
    }

    #[tokio::test]
    async fn test_read_dir_hides_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOCK_FILE_NAME), b"{}").unwrap();
        std::fs::write(temp_dir.path().join("b"), b"").unwrap();
        std::fs::write(temp_dir.path().join("a"), b"").unwrap();
        let fs = DirStorage::new(temp_dir.path().to_path_buf());
        let ctx = Context::new();

        let mut root = fs.open_file(&ctx, Path::new("/"), OpenFlags::read_only(), 0).await.unwrap();
        let names: Vec<String> = root.read_dir(0).await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_large_write_through_mirror_set() {
        let temp_dir = TempDir::new().unwrap();
        let roots = vec![temp_dir.path().join("m0"), temp_dir.path().join("m1")];
        let backends: Vec<Arc<dyn FileSystem>> = roots
            .iter()
            .map(|root| {
                std::fs::create_dir_all(root).unwrap();
                Arc::new(DirStorage::new(root.clone())) as Arc<dyn FileSystem>
            })
            .collect();
        let fs = MirrorFs::new(backends).unwrap();
        let ctx = Context::new();

        // 超过 tokio 单次 write 的 2 MiB 上限
        let data = vec![7u8; 3 * 1024 * 1024];
        let file = fs
            .open_file(&ctx, Path::new("/big"), OpenFlags::write_only().create(), 0o644)
            .await
            .unwrap();
        assert_eq!(file.write(&data).await.unwrap(), data.len());
        file.close().await.unwrap();

        for root in &roots {
            assert_eq!(std::fs::read(root.join("big")).unwrap().len(), data.len());
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_is_honored() {
        let temp_dir = TempDir::new().unwrap();
        let fs = DirStorage::new(temp_dir.path().to_path_buf());
        let ctx = Context::new();
        ctx.cancel();
        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/c"), 0o755).await,
            Err(FsError::Cancelled)
        ));
        assert!(!temp_dir.path().join("c").exists());
    }
}
