//! The storage boundary shared by every backend.
//!
//! Traits use `async-trait` so engines can hold `Arc<dyn CheckpointStore>`.

use async_trait::async_trait;

use crate::error::CheckpointResult;
use crate::ids::{BranchName, CheckpointId, ThreadId};
use crate::manifest::{CheckpointMetadata, ManifestQuery};
use crate::thread::{
    ConversationThread, ExecutionCheckpoint, PendingWrite, StoredSnapshot, ThreadSnapshot,
};

/// Persistence contract for threads, checkpoints, snapshots and pending writes.
///
/// Every save is atomic from the caller's perspective: on failure the prior
/// state is untouched and readers never observe a partial record. Absent
/// threads or records fail with a not-found variant of
/// [`CheckpointError`](crate::CheckpointError).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Overwrites the thread's latest state.
    async fn save_thread(&self, thread: &ConversationThread) -> CheckpointResult<()>;

    async fn load_thread(&self, thread_id: &ThreadId) -> CheckpointResult<ConversationThread>;

    /// Writes a full checkpoint and appends its manifest entry. The store
    /// fills in size, hash, record kind and the (clamped) timestamp and
    /// returns the entry as appended.
    async fn save_checkpoint(
        &self,
        thread: &ConversationThread,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata>;

    async fn load_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<ExecutionCheckpoint>;

    async fn save_snapshot(
        &self,
        snapshot: &ThreadSnapshot,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata>;

    async fn load_snapshot(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<StoredSnapshot>;

    /// Manifest entries, newest-first.
    async fn get_manifest(
        &self,
        thread_id: &ThreadId,
        query: ManifestQuery,
    ) -> CheckpointResult<Vec<CheckpointMetadata>>;

    /// Keeps the newest `keep_count` snapshots plus protected ones. Returns
    /// the ids removed.
    async fn prune_snapshots(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> CheckpointResult<Vec<CheckpointId>>;

    async fn delete_snapshots(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>>;

    async fn delete_checkpoints(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>>;

    /// Relabels every manifest entry on `from`. Returns the count relabeled.
    async fn rename_branch(
        &self,
        thread_id: &ThreadId,
        from: &BranchName,
        to: &BranchName,
    ) -> CheckpointResult<usize>;

    /// Removes every record on `branch`, ignoring protection. Callers
    /// validate first.
    async fn remove_branch(
        &self,
        thread_id: &ThreadId,
        branch: &BranchName,
    ) -> CheckpointResult<Vec<CheckpointMetadata>>;

    async fn save_pending_write(&self, write: &PendingWrite) -> CheckpointResult<()>;

    /// Pending writes ordered by record time. Empty when none exist.
    async fn load_pending_writes(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<PendingWrite>>;

    /// Returns whether a write was removed.
    async fn delete_pending_write(
        &self,
        thread_id: &ThreadId,
        call_id: &str,
    ) -> CheckpointResult<bool>;

    /// Returns the number of writes removed.
    async fn delete_pending_writes(&self, thread_id: &ThreadId) -> CheckpointResult<usize>;
}
