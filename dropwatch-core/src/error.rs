use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watch subscription error: {0}")]
    Watch(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Archive {} is {size} bytes, above the {limit} byte ceiling", path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Unsupported archive type: {0}")]
    UnsupportedType(String),

    #[error("Destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Category reported through `ExtractionStatus::Failed`.
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Io(_) | IngestError::Watch(_) | IngestError::DestinationExists(_) => {
                FailureKind::Io
            }
            IngestError::ExtractionFailed(_) | IngestError::Internal(_) => {
                FailureKind::ExtractionFailed
            }
            IngestError::FileTooLarge { .. } => FailureKind::FileTooLarge,
            IngestError::Cancelled(_) => FailureKind::Cancelled,
            IngestError::UnsupportedType(_) => FailureKind::UnsupportedType,
        }
    }
}

impl From<notify::Error> for IngestError {
    fn from(err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::Io(io) => IngestError::Io(io),
            _ => IngestError::Watch(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            IngestError::Cancelled("task aborted".into())
        } else {
            IngestError::Internal(format!("task panicked: {err}"))
        }
    }
}

/// Cloneable failure category carried by status events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Io,
    ExtractionFailed,
    FileTooLarge,
    Cancelled,
    UnsupportedType,
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let io = IngestError::from(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), FailureKind::Io);
        assert_eq!(
            IngestError::DestinationExists(PathBuf::from("/tmp/a")).kind(),
            FailureKind::Io
        );
        assert_eq!(
            IngestError::Cancelled("stop".into()).kind(),
            FailureKind::Cancelled
        );
        let too_large = IngestError::FileTooLarge {
            path: PathBuf::from("big.7z"),
            size: 10,
            limit: 5,
        };
        assert_eq!(too_large.kind(), FailureKind::FileTooLarge);
        assert!(too_large.to_string().contains("big.7z"));
    }
}
