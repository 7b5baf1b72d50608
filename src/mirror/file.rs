use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::error::{Failures, FsError, Result};
use crate::fs::{File, FileMetadata};

/// One logical open file backed by a handle per backend, in backend order.
///
/// Reads and metadata come from the primary handle. Writes and seeks go to
/// every handle. Every operation takes the handle lock, since the backend
/// handles need exclusive access even for reads.
#[derive(Debug)]
pub struct MirrorFile {
    name: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    files: Vec<Box<dyn File>>,
    /// Offsets captured just before the latest write, used only to undo it.
    positions: Vec<u64>,
    /// Payloads of completed writes, kept for the life of the handle.
    history: Vec<Vec<u8>>,
}

impl MirrorFile {
    pub(crate) fn new(name: &Path, files: Vec<Box<dyn File>>) -> Self {
        let positions = vec![0; files.len()];
        Self {
            name: name.to_path_buf(),
            inner: Mutex::new(Inner {
                files,
                positions,
                history: Vec::new(),
            }),
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        inner.files[0].read(buf).await
    }

    pub async fn read_dir(&self, count: usize) -> Result<Vec<FileMetadata>> {
        let mut inner = self.inner.lock().await;
        inner.files[0].read_dir(count).await
    }

    pub async fn stat(&self) -> Result<FileMetadata> {
        let mut inner = self.inner.lock().await;
        inner.files[0].stat().await
    }

    /// Seeks every handle. On failure the error carries the position reported
    /// by the last handle, which is only advisory.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut last = 0;
        let mut failures = Failures::new();

        for (index, file) in inner.files.iter_mut().enumerate() {
            match file.seek(pos).await {
                Ok(p) => last = p,
                Err(e) => {
                    last = 0;
                    failures.push(index, e);
                }
            }
        }

        if failures.is_empty() {
            Ok(last)
        } else {
            warn!("seek on {:?} failed on {} backends: {}", self.name, failures.len(), failures);
            Err(FsError::Seek { failures, position: last })
        }
    }

    /// Writes `buf` to every handle in order and returns the last handle's
    /// count. If a handle fails or writes short, the handles that already took
    /// the write are seeked back and truncated to where they were.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        for (index, file) in inner.files.iter_mut().enumerate() {
            inner.positions[index] = match file.seek(SeekFrom::Current(0)).await {
                Ok(p) => p,
                Err(e) => {
                    debug!("write: offset probe on backend {} failed, assuming 0: {}", index, e);
                    0
                }
            };
        }

        let mut written = 0;
        for index in 0..inner.files.len() {
            let failure: Option<(usize, FsError)> = match inner.files[index].write(buf).await {
                Ok(n) if n == buf.len() => {
                    written = n;
                    None
                }
                Ok(n) => Some((n, FsError::Io(std::io::ErrorKind::WriteZero.into()))),
                Err(e) => Some((0, e)),
            };

            if let Some((n, e)) = failure {
                warn!("write to {:?} failed on backend {}: {}", self.name, index, e);
                inner.undo_write(index).await;
                return Err(FsError::Write {
                    index,
                    written: n,
                    source: Box::new(e),
                });
            }
        }

        inner.history.push(buf.to_vec());
        Ok(written)
    }

    /// Closes every handle, even after failures, and reports all of them together.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut failures = Failures::new();

        for (index, file) in inner.files.iter_mut().enumerate() {
            if let Err(e) = file.close().await {
                failures.push(index, e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!("close of {:?} failed on {} backends: {}", self.name, failures.len(), failures);
            Err(FsError::Close(failures))
        }
    }

    /// Truncates every handle. Reports `Unsupported` only when no handle can
    /// truncate, so an enclosing set treats this file like any other backend.
    pub async fn truncate(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut failures = Failures::new();

        for (index, file) in inner.files.iter_mut().enumerate() {
            if let Err(e) = file.truncate(len).await {
                failures.push(index, e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else if failures.len() == inner.files.len()
            && failures.iter().all(|f| matches!(f.error, FsError::Unsupported(_)))
        {
            Err(FsError::Unsupported("truncate"))
        } else {
            warn!("truncate of {:?} failed on {} backends: {}", self.name, failures.len(), failures);
            Err(FsError::Truncate(failures))
        }
    }

    #[cfg(test)]
    async fn history(&self) -> Vec<Vec<u8>> {
        self.inner.lock().await.history.clone()
    }
}

impl Inner {
    /// Best effort: returns the first `failed` handles to their captured offsets.
    async fn undo_write(&mut self, failed: usize) {
        for index in 0..failed {
            let pos = self.positions[index];
            let file = &mut self.files[index];
            if let Err(e) = file.seek(SeekFrom::Start(pos)).await {
                debug!("write undo: seek on backend {} to {} failed: {}", index, pos, e);
            }
            match file.truncate(pos).await {
                Ok(()) => {}
                Err(FsError::Unsupported(_)) => {
                    debug!("write undo: backend {} cannot truncate, left at offset {}", index, pos);
                }
                Err(e) => debug!("write undo: truncate on backend {} to {} failed: {}", index, pos, e),
            }
        }
    }
}

#[async_trait]
impl File for MirrorFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        MirrorFile::read(self, buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        MirrorFile::write(self, buf).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        MirrorFile::seek(self, pos).await
    }

    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileMetadata>> {
        MirrorFile::read_dir(self, count).await
    }

    async fn stat(&mut self) -> Result<FileMetadata> {
        MirrorFile::stat(self).await
    }

    async fn close(&mut self) -> Result<()> {
        MirrorFile::close(self).await
    }

    async fn truncate(&mut self, len: u64) -> Result<()> {
        MirrorFile::truncate(self, len).await
    }
}
