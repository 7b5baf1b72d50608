use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Filesystem is read-only")]
    ReadOnly,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Request cancelled")]
    Cancelled,

    #[error("operation failed on backend {index}: {source}")]
    Backend {
        index: usize,
        #[source]
        source: Box<FsError>,
    },

    #[error("failed to open file on backend {index}: {source}")]
    Open {
        index: usize,
        #[source]
        source: Box<FsError>,
    },

    /// `written` is the byte count reported by the failing backend.
    #[error("write failed on backend {index} after {written} bytes: {source}")]
    Write {
        index: usize,
        written: usize,
        #[source]
        source: Box<FsError>,
    },

    /// `position` comes from the last backend processed and is advisory.
    #[error("{failures}")]
    Seek { failures: Failures, position: u64 },

    #[error("{0}")]
    Close(Failures),

    #[error("{0}")]
    Truncate(Failures),
}

impl FsError {
    pub fn not_found(path: impl fmt::Debug) -> Self {
        FsError::NotFound(format!("{:?}", path))
    }

    pub fn already_exists(path: impl fmt::Debug) -> Self {
        FsError::AlreadyExists(format!("{:?}", path))
    }

    /// Index of the single backend a mutation, open or write failed on.
    pub fn backend_index(&self) -> Option<usize> {
        match self {
            FsError::Backend { index, .. }
            | FsError::Open { index, .. }
            | FsError::Write { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Every backend index named by this error, in the order they failed.
    pub fn failed_backends(&self) -> Vec<usize> {
        match self {
            FsError::Seek { failures, .. }
            | FsError::Close(failures)
            | FsError::Truncate(failures) => failures.indices(),
            other => other.backend_index().into_iter().collect(),
        }
    }
}

/// One backend's share of a failed fan-out call.
#[derive(Debug)]
pub struct BackendFailure {
    pub index: usize,
    pub error: FsError,
}

/// Per-backend failures of a single logical call, joined with "; " for display.
#[derive(Debug, Default)]
pub struct Failures(Vec<BackendFailure>);

impl Failures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, error: FsError) {
        self.0.push(BackendFailure { index, error });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.0.iter().map(|f| f.index).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendFailure> {
        self.0.iter()
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend {}: {}", self.index, self.error)
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
