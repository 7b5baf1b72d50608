use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, error};

/// 每个后端根目录下的锁文件名
pub const LOCK_FILE_NAME: &str = ".mirrorfs.lock";

/// 超过该时长（秒）的锁视为过期
const STALE_LOCK_SECS: u64 = 86400;

/// 锁文件信息
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    /// 进程 ID
    pid: u32,
    /// 主机名
    hostname: String,
    /// 锁创建时间
    created_at: u64,
    /// 程序版本
    version: String,
}

/// 后端目录集合的跨进程锁
pub struct BackendLock {
    lock_files: Vec<PathBuf>,
    /// 当前进程创建并持有的锁文件
    held: Vec<PathBuf>,
}

impl BackendLock {
    pub fn new(roots: &[PathBuf]) -> Self {
        Self {
            lock_files: roots.iter().map(|root| root.join(LOCK_FILE_NAME)).collect(),
            held: Vec::new(),
        }
    }

    /// 在所有根目录上加锁；任一目录被存活进程占用时，释放已获取的锁
    pub fn try_lock(&mut self) -> Result<()> {
        if self.is_locked() {
            return Ok(());
        }

        for lock_file in self.lock_files.clone() {
            if let Err(e) = self.acquire(&lock_file) {
                if let Err(release_err) = self.unlock() {
                    error!("释放部分后端锁失败: {}", release_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// 强制获取锁（先清理现有锁文件）
    pub fn force_lock(&mut self) -> Result<()> {
        if self.is_locked() {
            return Ok(());
        }

        for lock_file in &self.lock_files {
            if lock_file.exists() {
                warn!("强制删除现有锁文件: {:?}", lock_file);
                std::fs::remove_file(lock_file)?;
            }
        }

        self.try_lock()
    }

    /// 检查是否已经获取锁
    pub fn is_locked(&self) -> bool {
        !self.held.is_empty() && self.held.len() == self.lock_files.len()
    }

    /// 释放锁，只删除属于当前进程的锁文件
    pub fn unlock(&mut self) -> Result<()> {
        for lock_file in std::mem::take(&mut self.held) {
            if !lock_file.exists() {
                continue;
            }
            match read_lock_info(&lock_file) {
                Ok(info) if info.pid == process::id() => {
                    std::fs::remove_file(&lock_file)?;
                    info!("已释放后端锁: {:?}", lock_file);
                }
                Ok(info) => warn!("锁文件属于进程 {}，跳过: {:?}", info.pid, lock_file),
                Err(e) => warn!("无法读取锁文件，保留: {:?}: {}", lock_file, e),
            }
        }
        Ok(())
    }

    fn acquire(&mut self, lock_file: &Path) -> Result<()> {
        check_and_clean_stale_lock(lock_file)?;

        match OpenOptions::new().write(true).create_new(true).open(lock_file) {
            Ok(mut file) => {
                let lock_info = LockInfo {
                    pid: process::id(),
                    hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
                    created_at: now_secs(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                let json = serde_json::to_string_pretty(&lock_info)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                self.held.push(lock_file.to_path_buf());
                info!("成功获取后端锁: {:?}", lock_file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match read_lock_info(lock_file) {
                Ok(info) => Err(anyhow!(
                    "backend root is locked by pid {} on {} ({} seconds ago): {:?}\n\
                     remove the lock file or pass --force if that process is gone",
                    info.pid,
                    info.hostname,
                    now_secs().saturating_sub(info.created_at),
                    lock_file
                )),
                Err(_) => Err(anyhow!("backend root is locked, lock info unreadable: {:?}", lock_file)),
            },
            Err(e) => Err(anyhow!("failed to create lock file {:?}: {}", lock_file, e)),
        }
    }
}

impl Drop for BackendLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            error!("释放后端锁失败: {}", e);
        }
    }
}

/// 检查并清理过期的锁
fn check_and_clean_stale_lock(lock_file: &Path) -> Result<()> {
    if !lock_file.exists() {
        return Ok(());
    }

    match read_lock_info(lock_file) {
        Ok(info) => {
            if !is_process_running(info.pid) {
                warn!("检测到过期锁文件（进程 {} 已退出），正在清理: {:?}", info.pid, lock_file);
                std::fs::remove_file(lock_file)?;
            } else if now_secs().saturating_sub(info.created_at) > STALE_LOCK_SECS {
                warn!("检测到超过24小时的锁文件，正在清理: {:?}", lock_file);
                std::fs::remove_file(lock_file)?;
            }
        }
        Err(e) => {
            warn!("无法读取锁文件信息，可能已损坏: {:?}: {:?}", lock_file, e);
            std::fs::remove_file(lock_file)?;
        }
    }

    Ok(())
}

fn read_lock_info(lock_file: &Path) -> Result<LockInfo> {
    let mut file = File::open(lock_file)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // 发送信号 0 来检查进程是否存在
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roots(temp_dir: &TempDir) -> Vec<PathBuf> {
        let roots: Vec<PathBuf> = (0..3).map(|i| temp_dir.path().join(format!("m{}", i))).collect();
        for root in &roots {
            std::fs::create_dir_all(root).unwrap();
        }
        roots
    }

    #[test]
    fn test_lock_unlock() {
        let temp_dir = TempDir::new().unwrap();
        let roots = roots(&temp_dir);
        let mut lock = BackendLock::new(&roots);

        assert!(lock.try_lock().is_ok());
        assert!(lock.is_locked());
        assert!(roots.iter().all(|r| r.join(LOCK_FILE_NAME).exists()));

        // 已经持有锁，再次加锁应该成功
        assert!(lock.try_lock().is_ok());

        assert!(lock.unlock().is_ok());
        assert!(!lock.is_locked());
        assert!(roots.iter().all(|r| !r.join(LOCK_FILE_NAME).exists()));

        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_lock_conflict_releases_partial_locks() {
        let temp_dir = TempDir::new().unwrap();
        let roots = roots(&temp_dir);

        let mut other = BackendLock::new(&roots[2..]);
        assert!(other.try_lock().is_ok());

        let mut lock = BackendLock::new(&roots);
        assert!(lock.try_lock().is_err());
        assert!(!lock.is_locked());
        assert!(!roots[0].join(LOCK_FILE_NAME).exists());
        assert!(!roots[1].join(LOCK_FILE_NAME).exists());

        assert!(other.unlock().is_ok());
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_stale_and_corrupt_locks_are_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let roots = roots(&temp_dir);
        let stale = LockInfo {
            pid: process::id(),
            hostname: "elsewhere".to_string(),
            created_at: now_secs() - STALE_LOCK_SECS - 10,
            version: "0.0.0".to_string(),
        };
        std::fs::write(roots[0].join(LOCK_FILE_NAME), serde_json::to_string(&stale).unwrap()).unwrap();
        std::fs::write(roots[1].join(LOCK_FILE_NAME), b"not json").unwrap();

        let mut lock = BackendLock::new(&roots);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_force_lock_and_drop() {
        let temp_dir = TempDir::new().unwrap();
        let roots = roots(&temp_dir);
        let mut first = BackendLock::new(&roots);
        first.try_lock().unwrap();

        {
            let mut second = BackendLock::new(&roots);
            assert!(second.try_lock().is_err());
            second.force_lock().unwrap();
            assert!(second.is_locked());
        }
        assert!(roots.iter().all(|r| !r.join(LOCK_FILE_NAME).exists()));
        assert!(first.unlock().is_ok());
    }
}
