//! # chronicle-branching: explicit branch operations on conversation threads
//!
//! Forking adds a branch under the same thread id; copying starts a new
//! thread seeded from a snapshot. Both require a snapshot at the source
//! point: a checkpoint alone is not forkable until a snapshot is saved under
//! its id.
//!
//! Every mutating operation holds a per-thread advisory lock for its
//! duration, so concurrent branch operations on one thread fail fast with
//! [`CheckpointError::ConcurrentModification`].

mod lock;

use std::sync::Arc;

use chrono::Utc;
use chronicle_protocol::{
    BranchName, BranchSummary, BranchTree, CheckpointError, CheckpointId, CheckpointMetadata,
    CheckpointResult, CheckpointSource, CheckpointStore, ConversationThread, Manifest,
    ManifestQuery, RecordKind, ThreadId, ThreadSnapshot,
};
use tracing::{debug, info, instrument, warn};

use lock::ThreadLocks;

#[derive(Clone)]
pub struct BranchingEngine {
    store: Arc<dyn CheckpointStore>,
    locks: Arc<ThreadLocks>,
}

impl BranchingEngine {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            locks: Arc::new(ThreadLocks::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Saves a snapshot of `thread`. Passing `at` reuses an existing
    /// checkpoint id, which is what makes that checkpoint forkable.
    #[instrument(
        skip(self, thread),
        fields(thread_id = %thread.thread_id, branch = %thread.active_branch)
    )]
    pub async fn snapshot(
        &self,
        thread: &ConversationThread,
        source: CheckpointSource,
        at: Option<CheckpointId>,
    ) -> CheckpointResult<CheckpointMetadata> {
        let _guard = self.locks.try_acquire(&thread.thread_id, "snapshot")?;
        let snapshot = ThreadSnapshot::capture(thread);
        let step = thread
            .execution_state
            .as_ref()
            .map_or(0, |state| state.iteration);
        let metadata = CheckpointMetadata::for_snapshot(
            &snapshot,
            at.unwrap_or_else(CheckpointId::new_uuid),
            source,
            step,
        );
        let entry = self.store.save_snapshot(&snapshot, metadata).await?;
        debug!(checkpoint_id = %entry.checkpoint_id, "snapshot saved");
        Ok(entry)
    }

    /// Snapshots a stored checkpoint under its own id.
    #[instrument(skip(self), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub async fn snapshot_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<CheckpointMetadata> {
        let _guard = self.locks.try_acquire(thread_id, "snapshot")?;
        let checkpoint = self.store.load_checkpoint(thread_id, checkpoint_id).await?;
        let snapshot = ThreadSnapshot::capture(&checkpoint.thread);
        let metadata = CheckpointMetadata::for_snapshot(
            &snapshot,
            checkpoint_id.clone(),
            checkpoint.metadata.source,
            checkpoint.metadata.step,
        );
        self.store.save_snapshot(&snapshot, metadata).await
    }

    /// Starts `branch_name` from the snapshot at `checkpoint_id`.
    ///
    /// Appends one `Fork` snapshot entry whose parent is `checkpoint_id` and
    /// returns the forked thread without execution state. Existing manifest
    /// entries and the thread's latest state are left alone; call
    /// [`switch_branch`](Self::switch_branch) to make the fork active.
    #[instrument(
        skip(self),
        fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id, branch = %branch_name)
    )]
    pub async fn fork_from_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        branch_name: BranchName,
    ) -> CheckpointResult<ConversationThread> {
        validate_branch_name(&branch_name)?;
        let _guard = self.locks.try_acquire(thread_id, "fork")?;

        let manifest = self.manifest(thread_id).await?;
        if manifest.contains_branch(&branch_name) {
            return Err(CheckpointError::Validation(format!(
                "branch {branch_name} already exists on thread {thread_id}"
            )));
        }
        let source = self.store.load_snapshot(thread_id, checkpoint_id).await?;

        let mut forked = source.snapshot;
        forked.branch = branch_name.clone();
        let fork_id = CheckpointId::new_uuid();
        let metadata = CheckpointMetadata::for_snapshot(
            &forked,
            fork_id,
            CheckpointSource::Fork,
            source.metadata.step,
        )
        .with_parent(checkpoint_id.clone());
        let entry = self.store.save_snapshot(&forked, metadata).await?;

        info!(
            fork_id = %entry.checkpoint_id,
            message_index = entry.message_index,
            "branch forked"
        );
        Ok(forked.into_thread())
    }

    /// Creates a new thread on `main` from the snapshot at `checkpoint_id`.
    /// The copy's manifest starts with a single seed snapshot.
    #[instrument(
        skip(self, display_name),
        fields(thread_id = %source_thread_id, checkpoint_id = %checkpoint_id)
    )]
    pub async fn copy_from_checkpoint(
        &self,
        source_thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        display_name: impl Into<String>,
    ) -> CheckpointResult<ConversationThread> {
        let _guard = self.locks.try_acquire(source_thread_id, "copy")?;
        let source = self.store.load_snapshot(source_thread_id, checkpoint_id).await?;

        let seed = ThreadSnapshot {
            thread_id: ThreadId::new_uuid(),
            display_name: display_name.into(),
            messages: source.snapshot.messages,
            branch: BranchName::main(),
            thread_created_at: Utc::now(),
        };
        let metadata = CheckpointMetadata::for_snapshot(
            &seed,
            CheckpointId::new_uuid(),
            CheckpointSource::Fork,
            source.metadata.step,
        );
        self.store.save_snapshot(&seed, metadata).await?;

        let copy = seed.into_thread();
        self.store.save_thread(&copy).await?;
        info!(new_thread_id = %copy.thread_id, messages = copy.message_count(), "thread copied");
        Ok(copy)
    }

    /// Makes `target` the active branch, restoring its newest record as the
    /// thread's latest state. Pending writes of the branch being left are
    /// discarded.
    #[instrument(skip(self), fields(thread_id = %thread_id, target = %target))]
    pub async fn switch_branch(
        &self,
        thread_id: &ThreadId,
        target: &BranchName,
    ) -> CheckpointResult<ConversationThread> {
        let _guard = self.locks.try_acquire(thread_id, "switch")?;

        let manifest = self.manifest(thread_id).await?;
        let head = manifest
            .branch_head(target)
            .cloned()
            .ok_or_else(|| CheckpointError::BranchNotFound {
                thread_id: thread_id.clone(),
                branch: target.clone(),
            })?;
        let previous_state = self.latest_state(thread_id).await?;
        let previous = previous_state
            .as_ref()
            .map_or_else(BranchName::main, |state| state.active_branch.clone());

        let mut thread = match head.kind() {
            RecordKind::Checkpoint => {
                self.store
                    .load_checkpoint(thread_id, &head.checkpoint_id)
                    .await?
                    .thread
            }
            RecordKind::Snapshot => self
                .store
                .load_snapshot(thread_id, &head.checkpoint_id)
                .await?
                .snapshot
                .into_thread(),
        };
        thread.active_branch = target.clone();

        self.store.save_thread(&thread).await?;
        if previous != *target {
            match self.store.delete_pending_writes(thread_id).await {
                Ok(0) => {}
                Ok(discarded) => debug!(discarded, "pending writes of previous branch discarded"),
                Err(error) => {
                    warn!(
                        error = %error,
                        branch = %previous,
                        "failed discarding pending writes; restoring previous branch"
                    );
                    if let Some(state) = &previous_state
                        && let Err(restore) = self.store.save_thread(state).await
                    {
                        warn!(error = %restore, "failed restoring previous latest state");
                    }
                    return Err(error);
                }
            }
        }
        info!(
            from = %previous,
            head = %head.checkpoint_id,
            "branch switched"
        );
        Ok(thread)
    }

    pub async fn get_branch_tree(&self, thread_id: &ThreadId) -> CheckpointResult<BranchTree> {
        let manifest = self.manifest(thread_id).await?;
        let active_branch = self.active_branch(thread_id).await?;
        Ok(BranchTree::from_manifest(thread_id.clone(), active_branch, &manifest))
    }

    /// Branches that already exist at `message_index`: those whose
    /// divergence point is at or before it.
    pub async fn get_variants_at_message(
        &self,
        thread_id: &ThreadId,
        message_index: usize,
    ) -> CheckpointResult<Vec<BranchSummary>> {
        Ok(self.get_branch_tree(thread_id).await?.variants_at(message_index))
    }

    /// Removes every record on `branch`. The active branch and branches that
    /// others were forked from cannot be deleted.
    #[instrument(skip(self), fields(thread_id = %thread_id, branch = %branch))]
    pub async fn delete_branch(
        &self,
        thread_id: &ThreadId,
        branch: &BranchName,
    ) -> CheckpointResult<Vec<CheckpointMetadata>> {
        let _guard = self.locks.try_acquire(thread_id, "delete branch on")?;

        let manifest = self.manifest(thread_id).await?;
        if !manifest.contains_branch(branch) {
            return Err(CheckpointError::BranchNotFound {
                thread_id: thread_id.clone(),
                branch: branch.clone(),
            });
        }
        if self.active_branch(thread_id).await? == *branch {
            return Err(CheckpointError::Validation(format!(
                "branch {branch} is active; switch away before deleting it"
            )));
        }
        let dependents = manifest.dependent_branches(branch);
        if !dependents.is_empty() {
            let names: Vec<&str> = dependents.iter().map(BranchName::as_str).collect();
            return Err(CheckpointError::Validation(format!(
                "branch {branch} is the fork source of {}",
                names.join(", ")
            )));
        }

        let removed = self.store.remove_branch(thread_id, branch).await?;
        info!(removed = removed.len(), "branch deleted");
        Ok(removed)
    }

    /// Relabels `from` as `to`, carrying the active pointer along.
    #[instrument(skip(self), fields(thread_id = %thread_id, from = %from, to = %to))]
    pub async fn rename_branch(
        &self,
        thread_id: &ThreadId,
        from: &BranchName,
        to: &BranchName,
    ) -> CheckpointResult<usize> {
        validate_branch_name(to)?;
        let _guard = self.locks.try_acquire(thread_id, "rename branch on")?;

        let manifest = self.manifest(thread_id).await?;
        if !manifest.contains_branch(from) {
            return Err(CheckpointError::BranchNotFound {
                thread_id: thread_id.clone(),
                branch: from.clone(),
            });
        }
        if manifest.contains_branch(to) {
            return Err(CheckpointError::Validation(format!(
                "branch {to} already exists on thread {thread_id}"
            )));
        }

        let renamed = self.store.rename_branch(thread_id, from, to).await?;
        match self.store.load_thread(thread_id).await {
            Ok(mut latest) if latest.active_branch == *from => {
                latest.active_branch = to.clone();
                self.store.save_thread(&latest).await?;
            }
            Ok(_) | Err(CheckpointError::ThreadNotFound(_)) => {}
            Err(error) => return Err(error),
        }
        info!(renamed, "branch renamed");
        Ok(renamed)
    }

    async fn manifest(&self, thread_id: &ThreadId) -> CheckpointResult<Manifest> {
        let entries = self.store.get_manifest(thread_id, ManifestQuery::all()).await?;
        Ok(Manifest::from_entries(entries))
    }

    /// Latest state's active branch; `main` when no latest state was saved.
    async fn latest_state(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Option<ConversationThread>> {
        match self.store.load_thread(thread_id).await {
            Ok(thread) => Ok(Some(thread)),
            Err(CheckpointError::ThreadNotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn active_branch(&self, thread_id: &ThreadId) -> CheckpointResult<BranchName> {
        Ok(self
            .latest_state(thread_id)
            .await?
            .map_or_else(BranchName::main, |thread| thread.active_branch))
    }
}

fn validate_branch_name(name: &BranchName) -> CheckpointResult<()> {
    let value = name.as_str();
    if value.trim().is_empty() || value.chars().any(char::is_control) {
        return Err(CheckpointError::Validation(format!(
            "invalid branch name {value:?}"
        )));
    }
    Ok(())
}
