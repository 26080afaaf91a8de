//! Error types for checkpoint, branching and resume operations.

use thiserror::Error;

use crate::ids::{BranchName, CheckpointId, ThreadId};

/// Errors surfaced by stores and engines.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("checkpoint not found: {checkpoint_id} (thread {thread_id})")]
    CheckpointNotFound {
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
    },
    #[error("snapshot not found: {checkpoint_id} (thread {thread_id}); only snapshots fork")]
    SnapshotNotFound {
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
    },
    #[error("branch not found: {branch} (thread {thread_id})")]
    BranchNotFound {
        thread_id: ThreadId,
        branch: BranchName,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupted record {checkpoint_id} (thread {thread_id}): {reason}")]
    Corrupted {
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        reason: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl CheckpointError {
    /// True for every "absent" variant; callers usually fall back rather than fail.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ThreadNotFound(_)
                | Self::CheckpointNotFound { .. }
                | Self::SnapshotNotFound { .. }
                | Self::BranchNotFound { .. }
        )
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;
