use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::info;
use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::mirror::MirrorFs;
use crate::storage::DirStorage;

pub const DEFAULT_DIRS: &str = "./mirror1,./mirror2,./mirror3";

/// 镜像集合的后端根目录，第一个为主目录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub backends: Vec<PathBuf>,
    /// 除主目录外的镜像以只读方式打开
    #[serde(default)]
    pub read_only_mirrors: bool,
}

impl MirrorConfig {
    pub fn new(backends: Vec<PathBuf>) -> Result<Self> {
        let config = Self { backends, read_only_mirrors: false };
        config.validate()?;
        Ok(config)
    }

    /// 解析逗号分隔的目录列表
    pub fn from_dirs(dirs: &str) -> Result<Self> {
        let backends = dirs
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::new(backends)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| FsError::InvalidOperation(format!("invalid config {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(FsError::InvalidOperation(
                "at least one backend directory must be specified".to_string(),
            ));
        }
        Ok(())
    }

    /// 创建缺失的后端根目录并构建镜像集合
    pub fn open(&self) -> Result<MirrorFs> {
        self.validate()?;
        let mut backends: Vec<Arc<dyn FileSystem>> = Vec::with_capacity(self.backends.len());
        for (index, dir) in self.backends.iter().enumerate() {
            std::fs::create_dir_all(dir)?;
            let storage = if index > 0 && self.read_only_mirrors {
                DirStorage::read_only(dir.clone())
            } else {
                DirStorage::new(dir.clone())
            };
            info!("添加后端 {}: {:?}", index, dir);
            backends.push(Arc::new(storage));
        }
        MirrorFs::new(backends)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            backends: DEFAULT_DIRS.split(',').map(PathBuf::from).collect(),
            read_only_mirrors: false,
        }
    }
}
