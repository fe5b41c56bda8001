use std::path::Path;

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

/// Error taxonomy of the index engine.
///
/// `NotFound` is recoverable and expected on lookups. `Corruption` marks a
/// file that failed validation; the file is quarantined, never half-read.
/// `Conflict` is an invariant violation and fatal to the operation that
/// observed it. `Io` wraps everything the operating system throws at us.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("not found")]
    NotFound,

    #[error("corrupt file {path}: {reason}")]
    Corruption { path: String, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub fn corruption(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        IndexError::Corruption {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        IndexError::Conflict(reason.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound)
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Corruption { .. })
    }
}

impl<T> From<std::sync::PoisonError<T>> for IndexError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        IndexError::LockPoisoned(e.to_string())
    }
}
