//! In-memory backend with injectable faults.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use crate::error::{FsError, Result};
use crate::fs::{Context, File, FileMetadata, FileSystem, OpenFlags};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, permissions: u32, modified: SystemTime },
    Directory { permissions: u32, modified: SystemTime },
}

/// Failures a `MemoryStorage` injects into otherwise normal behaviour.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub read_only: bool,
    pub fail_rename: bool,
    pub fail_remove: bool,
    pub fail_open: bool,
    pub fail_seek: bool,
    pub fail_close: bool,
    pub no_truncate: bool,
    /// Bytes handles may still write; once spent, writes come back short.
    pub write_budget: Option<usize>,
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<PathBuf, Entry>,
    faults: Faults,
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            PathBuf::new(),
            Entry::Directory { permissions: 0o755, modified: SystemTime::now() },
        );
        Self {
            state: Arc::new(Mutex::new(State { entries, faults: Faults::default() })),
        }
    }

    pub fn with_faults(faults: Faults) -> Self {
        let storage = Self::new();
        storage.set_faults(faults);
        storage
    }

    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.lock().faults);
    }

    /// Writes a file directly, creating missing parents.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = normalize(Path::new(path));
        let mut state = self.lock();
        let mut parent = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            parent.push(component);
            state.entries.entry(parent.clone()).or_insert(Entry::Directory {
                permissions: 0o755,
                modified: SystemTime::now(),
            });
        }
        state.entries.insert(
            path,
            Entry::File { data: data.to_vec(), permissions: 0o644, modified: SystemTime::now() },
        );
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().entries.contains_key(&normalize(Path::new(path)))
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().entries.get(&normalize(Path::new(path))) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(state: &State) -> Result<()> {
        if state.faults.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => result.push(s),
            Component::ParentDir => {
                result.pop();
            }
            _ => {}
        }
    }
    result
}

fn metadata_for(path: &Path, entry: &Entry) -> FileMetadata {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    match entry {
        Entry::File { data, permissions, modified } => FileMetadata {
            name,
            size: data.len() as u64,
            is_dir: false,
            permissions: *permissions,
            modified: *modified,
        },
        Entry::Directory { permissions, modified } => FileMetadata {
            name,
            size: 0,
            is_dir: true,
            permissions: *permissions,
            modified: *modified,
        },
    }
}

fn parent_is_dir(entries: &BTreeMap<PathBuf, Entry>, path: &Path) -> bool {
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    matches!(entries.get(&parent), Some(Entry::Directory { .. }))
}

#[async_trait]
impl FileSystem for MemoryStorage {
    async fn create_directory<'a>(&'a self, ctx: &'a Context, path: &'a Path, permissions: u32) -> Result<()> {
        ctx.check()?;
        let path = normalize(path);
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if state.entries.contains_key(&path) {
            return Err(FsError::already_exists(&path));
        }
        if !parent_is_dir(&state.entries, &path) {
            return Err(FsError::not_found(path.parent().unwrap_or(&path)));
        }
        state.entries.insert(
            path,
            Entry::Directory { permissions: permissions & 0o7777, modified: SystemTime::now() },
        );
        Ok(())
    }

    async fn remove_all<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<()> {
        ctx.check()?;
        let path = normalize(path);
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if state.faults.fail_remove {
            return Err(FsError::PermissionDenied(format!("remove {:?}", path)));
        }
        if path.as_os_str().is_empty() {
            return Err(FsError::InvalidOperation("cannot remove the root".to_string()));
        }
        state.entries.retain(|p, _| !p.starts_with(&path));
        Ok(())
    }

    async fn rename<'a>(&'a self, ctx: &'a Context, from: &'a Path, to: &'a Path) -> Result<()> {
        ctx.check()?;
        let (from, to) = (normalize(from), normalize(to));
        let mut state = self.lock();
        Self::check_writable(&state)?;
        if state.faults.fail_rename {
            return Err(FsError::PermissionDenied(format!("rename {:?}", from)));
        }
        if !state.entries.contains_key(&from) {
            return Err(FsError::not_found(&from));
        }
        if from == to {
            return Ok(());
        }
        if !parent_is_dir(&state.entries, &to) {
            return Err(FsError::not_found(to.parent().unwrap_or(&to)));
        }
        if to.starts_with(&from) && to != from {
            return Err(FsError::InvalidOperation(format!("cannot move {:?} into itself", from)));
        }
        let moved: Vec<PathBuf> = state
            .entries
            .keys()
            .filter(|p| p.starts_with(&from))
            .cloned()
            .collect();
        state.entries.retain(|p, _| !p.starts_with(&to));
        for old in moved {
            if let Some(entry) = state.entries.remove(&old) {
                let target = match old.strip_prefix(&from) {
                    Ok(suffix) if !suffix.as_os_str().is_empty() => to.join(suffix),
                    _ => to.clone(),
                };
                state.entries.insert(target, entry);
            }
        }
        Ok(())
    }

    async fn open_file<'a>(
        &'a self,
        ctx: &'a Context,
        path: &'a Path,
        flags: OpenFlags,
        permissions: u32,
    ) -> Result<Box<dyn File>> {
        ctx.check()?;
        let path = normalize(path);
        let mut state = self.lock();
        if state.faults.fail_open {
            return Err(FsError::PermissionDenied(format!("open {:?}", path)));
        }
        if flags.mutates() {
            Self::check_writable(&state)?;
        }
        let existing_dir = state.entries.get(&path).map(|e| matches!(e, Entry::Directory { .. }));
        match existing_dir {
            Some(_) if flags.create_new => return Err(FsError::already_exists(&path)),
            Some(true) if flags.mutates() => {
                return Err(FsError::InvalidOperation(format!("{:?} is a directory", path)));
            }
            Some(_) => {
                if flags.truncate {
                    if let Some(Entry::File { data, modified, .. }) = state.entries.get_mut(&path) {
                        data.clear();
                        *modified = SystemTime::now();
                    }
                }
            }
            None if flags.create || flags.create_new => {
                if !parent_is_dir(&state.entries, &path) {
                    return Err(FsError::not_found(path.parent().unwrap_or(&path)));
                }
                state.entries.insert(
                    path.clone(),
                    Entry::File {
                        data: Vec::new(),
                        permissions: permissions & 0o7777,
                        modified: SystemTime::now(),
                    },
                );
            }
            None => return Err(FsError::not_found(&path)),
        }
        Ok(Box::new(MemoryFile {
            storage: self.clone(),
            path,
            flags,
            offset: 0,
            listed: None,
            closed: false,
        }))
    }

    async fn get_metadata<'a>(&'a self, ctx: &'a Context, path: &'a Path) -> Result<FileMetadata> {
        ctx.check()?;
        let path = normalize(path);
        let state = self.lock();
        state
            .entries
            .get(&path)
            .map(|entry| metadata_for(&path, entry))
            .ok_or_else(|| FsError::not_found(&path))
    }
}

/// Handle onto a `MemoryStorage` entry; data is shared with the storage.
#[derive(Debug)]
pub struct MemoryFile {
    storage: MemoryStorage,
    path: PathBuf,
    flags: OpenFlags,
    offset: u64,
    listed: Option<Vec<FileMetadata>>,
    closed: bool,
}

impl MemoryFile {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(FsError::InvalidOperation("file already closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl File for MemoryFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let state = self.storage.lock();
        match state.entries.get(&self.path) {
            Some(Entry::File { data, .. }) => {
                let start = (self.offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                self.offset += n as u64;
                Ok(n)
            }
            Some(Entry::Directory { .. }) => {
                Err(FsError::InvalidOperation(format!("{:?} is a directory", self.path)))
            }
            None => Err(FsError::not_found(&self.path)),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !(self.flags.write || self.flags.append) {
            return Err(FsError::PermissionDenied(format!("{:?} not opened for writing", self.path)));
        }
        let mut guard = self.storage.lock();
        let state = &mut *guard;
        MemoryStorage::check_writable(state)?;
        let accepted = match state.faults.write_budget.as_mut() {
            Some(budget) => {
                let n = buf.len().min(*budget);
                *budget -= n;
                n
            }
            None => buf.len(),
        };
        match state.entries.get_mut(&self.path) {
            Some(Entry::File { data, modified, .. }) => {
                if self.flags.append {
                    self.offset = data.len() as u64;
                }
                let start = self.offset as usize;
                let end = start + accepted;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(&buf[..accepted]);
                *modified = SystemTime::now();
                self.offset = end as u64;
                Ok(accepted)
            }
            Some(Entry::Directory { .. }) => {
                Err(FsError::InvalidOperation(format!("{:?} is a directory", self.path)))
            }
            None => Err(FsError::not_found(&self.path)),
        }
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let state = self.storage.lock();
        if state.faults.fail_seek {
            return Err(FsError::InvalidOperation(format!("seek on {:?}", self.path)));
        }
        let len = match state.entries.get(&self.path) {
            Some(Entry::File { data, .. }) => data.len() as i64,
            Some(Entry::Directory { .. }) => 0,
            None => return Err(FsError::not_found(&self.path)),
        };
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.offset as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if target < 0 {
            return Err(FsError::InvalidOperation("seek before start of file".to_string()));
        }
        self.offset = target as u64;
        Ok(self.offset)
    }

    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileMetadata>> {
        self.check_open()?;
        if self.listed.is_none() {
            let state = self.storage.lock();
            if !matches!(state.entries.get(&self.path), Some(Entry::Directory { .. })) {
                return Err(FsError::InvalidOperation(format!("{:?} is not a directory", self.path)));
            }
            let children = state
                .entries
                .iter()
                .filter(|(p, _)| p.parent() == Some(self.path.as_path()) && !p.as_os_str().is_empty())
                .map(|(p, entry)| metadata_for(p, entry))
                .collect();
            self.listed = Some(children);
        }
        let remaining = self.listed.get_or_insert_with(Vec::new);
        let take = if count == 0 { remaining.len() } else { count.min(remaining.len()) };
        Ok(remaining.drain(..take).collect())
    }

    async fn stat(&mut self) -> Result<FileMetadata> {
        self.check_open()?;
        let state = self.storage.lock();
        state
            .entries
            .get(&self.path)
            .map(|entry| metadata_for(&self.path, entry))
            .ok_or_else(|| FsError::not_found(&self.path))
    }

    async fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        if self.storage.lock().faults.fail_close {
            return Err(FsError::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.storage.lock();
        if state.faults.no_truncate {
            return Err(FsError::Unsupported("truncate"));
        }
        MemoryStorage::check_writable(&state)?;
        match state.entries.get_mut(&self.path) {
            Some(Entry::File { data, modified, .. }) => {
                data.resize(len as usize, 0);
                *modified = SystemTime::now();
                Ok(())
            }
            _ => Err(FsError::InvalidOperation(format!("cannot truncate {:?}", self.path))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_share_storage() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        let mut writer = fs
            .open_file(&ctx, Path::new("/f"), OpenFlags::write_only().create(), 0o644)
            .await
            .unwrap();
        assert_eq!(writer.write(b"hello").await.unwrap(), 5);

        let mut reader = fs.open_file(&ctx, Path::new("/f"), OpenFlags::read_only(), 0).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_write_budget_gives_short_write() {
        let ctx = Context::new();
        let fs = MemoryStorage::with_faults(Faults { write_budget: Some(3), ..Faults::default() });
        let mut file = fs
            .open_file(&ctx, Path::new("/f"), OpenFlags::write_only().create(), 0o644)
            .await
            .unwrap();
        assert_eq!(file.write(b"hello").await.unwrap(), 3);
        assert_eq!(file.write(b"!").await.unwrap(), 0);
        assert_eq!(fs.contents("/f").unwrap(), b"hel");
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/a/b"), 0o755).await,
            Err(FsError::NotFound(_))
        ));
        fs.create_directory(&ctx, Path::new("/a"), 0o755).await.unwrap();
        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/a"), 0o755).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_children() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        fs.put_file("/dir/inner/file", b"1");
        fs.rename(&ctx, Path::new("/dir"), Path::new("/moved")).await.unwrap();
        assert!(!fs.exists("/dir"));
        assert_eq!(fs.contents("/moved/inner/file").unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_read_dir_pages() {
        let ctx = Context::new();
        let fs = MemoryStorage::new();
        fs.put_file("/a", b"");
        fs.put_file("/b", b"");
        fs.put_file("/c/d", b"");

        let mut root = fs.open_file(&ctx, Path::new("/"), OpenFlags::read_only(), 0).await.unwrap();
        let first = root.read_dir(2).await.unwrap();
        assert_eq!(first.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        let rest = root.read_dir(0).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].is_dir);
        assert!(root.read_dir(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let ctx = Context::new();
        let fs = MemoryStorage::with_faults(Faults { read_only: true, ..Faults::default() });
        assert!(matches!(
            fs.create_directory(&ctx, Path::new("/a"), 0o755).await,
            Err(FsError::ReadOnly)
        ));
        assert!(fs
            .open_file(&ctx, Path::new("/a"), OpenFlags::write_only().create(), 0o644)
            .await
            .is_err());
    }
}
