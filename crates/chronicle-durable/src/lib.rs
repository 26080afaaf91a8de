//! # chronicle-durable: automatic checkpointing for agent sessions
//!
//! Decides when a thread is checkpointed, which checkpoints are kept, and how
//! an interrupted session resumes. Writes go through an ordered per-thread
//! background queue so the execution loop never waits on storage.
//!
//! ## Module Overview
//!
//! - [`config`]: CheckpointFrequency, RetentionPolicy, DurableConfig
//! - [`events`]: DurabilityEvent broadcast
//! - [`resume`]: ResumePoint and the continue / new-turn decision

pub mod config;
pub mod events;
pub mod resume;
mod retention;
mod writer;

use std::sync::Arc;

use chronicle_protocol::{
    CheckpointError, CheckpointId, CheckpointMetadata, CheckpointResult, CheckpointSource,
    CheckpointStore, ConversationThread, ManifestQuery, PendingWrite, RecordKind, ThreadId,
};
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use config::{CheckpointFrequency, DurableConfig, RetentionPolicy};
pub use events::{DurabilityEvent, DurabilityHub};
pub use resume::ResumePoint;

use writer::{CheckpointJob, WriteContext, WriteJob, WriterPool};

#[derive(Clone)]
pub struct DurableExecution {
    config: DurableConfig,
    store: Arc<dyn CheckpointStore>,
    writer: Arc<WriterPool>,
    hub: DurabilityHub,
}

impl DurableExecution {
    pub fn new(store: Arc<dyn CheckpointStore>, config: DurableConfig) -> Self {
        Self::with_hub(store, config, DurabilityHub::default())
    }

    pub fn with_hub(
        store: Arc<dyn CheckpointStore>,
        config: DurableConfig,
        hub: DurabilityHub,
    ) -> Self {
        let writer = WriterPool::new(
            WriteContext {
                store: store.clone(),
                retention: config.retention,
                hub: hub.clone(),
            },
            config.writer_idle(),
        );
        Self {
            config,
            store,
            writer: Arc::new(writer),
            hub,
        }
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn should_checkpoint(&self, _iteration: u64, turn_complete: bool) -> bool {
        match self.config.frequency {
            CheckpointFrequency::PerIteration => true,
            CheckpointFrequency::PerTurn => turn_complete,
            CheckpointFrequency::Manual => false,
        }
    }

    /// Captures the thread now and queues the write. Returns immediately with
    /// the id the checkpoint will be stored under; failures surface only as
    /// logs and [`DurabilityEvent`]s.
    #[instrument(skip(self, thread), fields(thread_id = %thread.thread_id))]
    pub fn save_checkpoint(
        &self,
        thread: &ConversationThread,
        source: CheckpointSource,
        step: u64,
    ) -> CheckpointId {
        let checkpoint_id = CheckpointId::new_uuid();
        let metadata =
            CheckpointMetadata::for_checkpoint(thread, checkpoint_id.clone(), source, step);
        let job = WriteJob::Checkpoint(Box::new(CheckpointJob {
            thread: thread.clone(),
            metadata,
        }));
        if self.writer.dispatch(&thread.thread_id, job).is_err() {
            warn!(checkpoint_id = %checkpoint_id, "engine shut down; checkpoint dropped");
            self.hub.publish(DurabilityEvent::CheckpointDropped {
                thread_id: thread.thread_id.clone(),
                checkpoint_id: checkpoint_id.clone(),
                error: "durable engine is shut down".to_owned(),
            });
        } else {
            debug!(checkpoint_id = %checkpoint_id, "checkpoint queued");
        }
        checkpoint_id
    }

    /// Checkpoints only when the configured frequency says so.
    pub fn checkpoint_if_due(
        &self,
        thread: &ConversationThread,
        source: CheckpointSource,
        step: u64,
        turn_complete: bool,
    ) -> Option<CheckpointId> {
        self.should_checkpoint(step, turn_complete)
            .then(|| self.save_checkpoint(thread, source, step))
    }

    /// Queued behind any checkpoint already dispatched for the thread.
    #[instrument(skip(self, call_id, result), fields(thread_id = %thread_id))]
    pub fn save_pending_write(
        &self,
        thread_id: &ThreadId,
        call_id: impl Into<String>,
        result: serde_json::Value,
    ) {
        let write = PendingWrite::new(thread_id.clone(), call_id, result);
        let job = WriteJob::PendingWrite(write);
        if let Err(WriteJob::PendingWrite(write)) = self.writer.dispatch(thread_id, job) {
            warn!(call_id = %write.call_id, "engine shut down; pending write dropped");
            self.hub.publish(DurabilityEvent::PendingWriteFailed {
                thread_id: write.thread_id,
                call_id: write.call_id,
                error: "durable engine is shut down".to_owned(),
            });
        }
    }

    pub async fn load_pending_writes(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<PendingWrite>> {
        self.writer.flush(thread_id).await;
        self.store.load_pending_writes(thread_id).await
    }

    /// Call once a later checkpoint has durably captured the same results.
    pub async fn delete_pending_writes(&self, thread_id: &ThreadId) -> CheckpointResult<usize> {
        self.writer.flush(thread_id).await;
        self.store.delete_pending_writes(thread_id).await
    }

    /// Newest checkpoint on the thread's active branch plus its pending
    /// writes, or `None` when there is nothing to resume. Drains queued writes
    /// for the thread first.
    #[instrument(skip(self, cancel), fields(thread_id = %thread_id))]
    pub async fn resume_from_latest(
        &self,
        thread_id: &ThreadId,
        cancel: &CancellationToken,
    ) -> CheckpointResult<Option<ResumePoint>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("resume cancelled");
                Err(CheckpointError::Cancelled)
            }
            resumed = self.load_resume_point(thread_id) => resumed,
        }
    }

    async fn load_resume_point(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Option<ResumePoint>> {
        self.writer.flush(thread_id).await;

        let active_branch = match self.store.load_thread(thread_id).await {
            Ok(thread) => Some(thread.active_branch),
            Err(CheckpointError::ThreadNotFound(_)) => None,
            Err(error) => return Err(error),
        };
        let checkpoints = match self
            .store
            .get_manifest(thread_id, ManifestQuery::all().kind(RecordKind::Checkpoint))
            .await
        {
            Ok(entries) => entries,
            Err(CheckpointError::ThreadNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };

        let newest = checkpoints.into_iter().find(|entry| {
            active_branch
                .as_ref()
                .is_none_or(|branch| entry.branch == *branch)
        });
        let Some(newest) = newest else {
            debug!(branch = ?active_branch, "no checkpoint to resume from");
            return Ok(None);
        };

        let checkpoint = self.store.load_checkpoint(thread_id, &newest.checkpoint_id).await?;
        let pending_writes = self.store.load_pending_writes(thread_id).await?;
        info!(
            checkpoint_id = %newest.checkpoint_id,
            incomplete = checkpoint.is_incomplete(),
            pending = pending_writes.len(),
            "resuming from checkpoint"
        );
        Ok(Some(ResumePoint {
            checkpoint,
            pending_writes,
        }))
    }

    /// Keeps the newest `keep_count` checkpoints. Branch heads and fork points
    /// are skipped, so the result may retain more.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub async fn prune_checkpoints(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.writer.flush(thread_id).await;
        self.writer.context().prune(thread_id, keep_count).await
    }

    /// Applies the configured retention policy now. The same pass runs
    /// automatically after every successful checkpoint.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub async fn apply_retention(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.writer.flush(thread_id).await;
        self.writer.context().apply_retention(thread_id).await
    }

    pub async fn flush(&self, thread_id: &ThreadId) {
        self.writer.flush(thread_id).await;
    }

    pub async fn flush_all(&self) {
        self.writer.flush_all().await;
    }

    /// Drains every queue and stops the workers. Later saves are dropped.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
        info!("durable engine stopped");
    }

    pub fn active_writers(&self) -> usize {
        self.writer.active_threads()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DurabilityEvent> {
        self.hub.subscribe()
    }

    pub fn subscribe_stream(&self) -> BoxStream<'static, DurabilityEvent> {
        self.hub.subscribe_stream()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use async_trait::async_trait;
    use chronicle_protocol::{
        BranchName, ExecutionCheckpoint, ExecutionState, Message, StoredSnapshot, ThreadSnapshot,
    };
    use chronicle_store::{FileCheckpointStore, MemoryCheckpointStore};
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::fs;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn engine(retention: RetentionPolicy) -> (DurableExecution, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = DurableConfig::new(CheckpointFrequency::PerTurn, retention);
        (DurableExecution::new(store.clone(), config), store)
    }

    fn checkpoint_ids(entries: &[CheckpointMetadata]) -> Vec<CheckpointId> {
        entries.iter().map(|entry| entry.checkpoint_id.clone()).collect()
    }

    /// Fails the first `failures` checkpoint writes, delegating everything else.
    struct FlakyStore {
        inner: MemoryCheckpointStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(failures: usize) -> Self {
            Self {
                inner: MemoryCheckpointStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn save_thread(&self, thread: &ConversationThread) -> CheckpointResult<()> {
            self.inner.save_thread(thread).await
        }

        async fn load_thread(&self, thread_id: &ThreadId) -> CheckpointResult<ConversationThread> {
            self.inner.load_thread(thread_id).await
        }

        async fn save_checkpoint(
            &self,
            thread: &ConversationThread,
            metadata: CheckpointMetadata,
        ) -> CheckpointResult<CheckpointMetadata> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CheckpointError::Storage("disk full".to_owned()));
            }
            self.inner.save_checkpoint(thread, metadata).await
        }

        async fn load_checkpoint(
            &self,
            thread_id: &ThreadId,
            checkpoint_id: &CheckpointId,
        ) -> CheckpointResult<ExecutionCheckpoint> {
            self.inner.load_checkpoint(thread_id, checkpoint_id).await
        }

        async fn save_snapshot(
            &self,
            snapshot: &ThreadSnapshot,
            metadata: CheckpointMetadata,
        ) -> CheckpointResult<CheckpointMetadata> {
            self.inner.save_snapshot(snapshot, metadata).await
        }

        async fn load_snapshot(
            &self,
            thread_id: &ThreadId,
            checkpoint_id: &CheckpointId,
        ) -> CheckpointResult<StoredSnapshot> {
            self.inner.load_snapshot(thread_id, checkpoint_id).await
        }

        async fn get_manifest(
            &self,
            thread_id: &ThreadId,
            query: ManifestQuery,
        ) -> CheckpointResult<Vec<CheckpointMetadata>> {
            self.inner.get_manifest(thread_id, query).await
        }

        async fn prune_snapshots(
            &self,
            thread_id: &ThreadId,
            keep_count: usize,
        ) -> CheckpointResult<Vec<CheckpointId>> {
            self.inner.prune_snapshots(thread_id, keep_count).await
        }

        async fn delete_snapshots(
            &self,
            thread_id: &ThreadId,
            ids: &[CheckpointId],
        ) -> CheckpointResult<Vec<CheckpointId>> {
            self.inner.delete_snapshots(thread_id, ids).await
        }

        async fn delete_checkpoints(
            &self,
            thread_id: &ThreadId,
            ids: &[CheckpointId],
        ) -> CheckpointResult<Vec<CheckpointId>> {
            self.inner.delete_checkpoints(thread_id, ids).await
        }

        async fn rename_branch(
            &self,
            thread_id: &ThreadId,
            from: &BranchName,
            to: &BranchName,
        ) -> CheckpointResult<usize> {
            self.inner.rename_branch(thread_id, from, to).await
        }

        async fn remove_branch(
            &self,
            thread_id: &ThreadId,
            branch: &BranchName,
        ) -> CheckpointResult<Vec<CheckpointMetadata>> {
            self.inner.remove_branch(thread_id, branch).await
        }

        async fn save_pending_write(&self, write: &PendingWrite) -> CheckpointResult<()> {
            self.inner.save_pending_write(write).await
        }

        async fn load_pending_writes(
            &self,
            thread_id: &ThreadId,
        ) -> CheckpointResult<Vec<PendingWrite>> {
            self.inner.load_pending_writes(thread_id).await
        }

        async fn delete_pending_write(
            &self,
            thread_id: &ThreadId,
            call_id: &str,
        ) -> CheckpointResult<bool> {
            self.inner.delete_pending_write(thread_id, call_id).await
        }

        async fn delete_pending_writes(&self, thread_id: &ThreadId) -> CheckpointResult<usize> {
            self.inner.delete_pending_writes(thread_id).await
        }
    }

    #[test]
    fn frequency_drives_should_checkpoint() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let per_iteration = DurableExecution::new(
            store.clone(),
            DurableConfig::new(CheckpointFrequency::PerIteration, RetentionPolicy::FullHistory),
        );
        let per_turn = DurableExecution::new(store.clone(), DurableConfig::default());
        let manual = DurableExecution::new(
            store,
            DurableConfig::new(CheckpointFrequency::Manual, RetentionPolicy::FullHistory),
        );

        assert!(per_iteration.should_checkpoint(3, false));
        assert!(per_turn.should_checkpoint(3, true));
        assert!(!per_turn.should_checkpoint(3, false));
        assert!(!manual.should_checkpoint(3, true));
    }

    #[tokio::test]
    async fn checkpoint_if_due_respects_frequency() -> Result<()> {
        let (engine, store) = engine(RetentionPolicy::FullHistory);
        let mut thread = ConversationThread::new("due");
        thread.push_message(Message::user("hi"));

        assert!(engine.checkpoint_if_due(&thread, CheckpointSource::Loop, 1, false).is_none());
        let id = engine
            .checkpoint_if_due(&thread, CheckpointSource::Loop, 1, true)
            .expect("turn boundary checkpoints");
        engine.flush(&thread.thread_id).await;

        let manifest = store.get_manifest(&thread.thread_id, ManifestQuery::all()).await?;
        assert_eq!(checkpoint_ids(&manifest), vec![id]);
        Ok(())
    }

    #[tokio::test]
    async fn resume_picks_newest_checkpoint_and_round_trips_state() -> Result<()> {
        let root = unique_test_root("chronicle-durable-resume");
        let store = Arc::new(FileCheckpointStore::new(&root));
        let engine = DurableExecution::new(store.clone(), DurableConfig::default());

        let mut thread = ConversationThread::new("resume");
        thread.push_message(Message::user("build it"));
        engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);

        thread.push_message(Message::assistant("calling cargo"));
        thread.execution_state = Some(
            ExecutionState::at_iteration(2)
                .with_tool_result("cargo-1", json!({"status": "running"})),
        );
        let newest = engine.save_checkpoint(&thread, CheckpointSource::Loop, 2);

        let resumed = engine
            .resume_from_latest(&thread.thread_id, &CancellationToken::new())
            .await?
            .expect("checkpoint exists");
        assert_eq!(resumed.checkpoint.metadata.checkpoint_id, newest);
        assert!(resumed.is_incomplete());
        assert_eq!(resumed.thread(), &thread);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn resume_without_checkpoints_starts_fresh() -> Result<()> {
        let (engine, _) = engine(RetentionPolicy::FullHistory);
        let resumed = engine
            .resume_from_latest(&ThreadId::from("never-saved"), &CancellationToken::new())
            .await?;
        assert!(resumed.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn resume_honours_cancellation() {
        let (engine, _) = engine(RetentionPolicy::FullHistory);
        let thread = ConversationThread::new("cancel");
        engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = engine
            .resume_from_latest(&thread.thread_id, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, CheckpointError::Cancelled));
    }

    #[tokio::test]
    async fn resume_follows_the_active_branch() -> Result<()> {
        let (engine, store) = engine(RetentionPolicy::FullHistory);
        let mut thread = ConversationThread::new("branches");
        thread.push_message(Message::user("a"));
        let on_main = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);

        let mut alt = thread.clone();
        alt.active_branch = BranchName::from("alt");
        alt.push_message(Message::user("b"));
        engine.save_checkpoint(&alt, CheckpointSource::Loop, 2);
        engine.flush(&thread.thread_id).await;

        store.save_thread(&thread).await?;
        let resumed = engine
            .resume_from_latest(&thread.thread_id, &CancellationToken::new())
            .await?
            .expect("main has a checkpoint");
        assert_eq!(resumed.checkpoint.metadata.checkpoint_id, on_main);
        Ok(())
    }

    #[tokio::test]
    async fn crash_recovery_with_pending_write() -> Result<()> {
        let root = unique_test_root("chronicle-durable-crash");
        let store = Arc::new(FileCheckpointStore::new(&root));
        let mut thread = ConversationThread::new("crash");
        thread.push_message(Message::user("run the migration"));
        thread.execution_state = Some(ExecutionState::at_iteration(1));

        let c1 = {
            let engine = DurableExecution::new(store.clone(), DurableConfig::default());
            let c1 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);
            engine.save_pending_write(&thread.thread_id, "tool-A", json!({"rows": 42}));
            engine.shutdown().await;
            c1
        };

        let engine = DurableExecution::new(store.clone(), DurableConfig::default());
        let resumed = engine
            .resume_from_latest(&thread.thread_id, &CancellationToken::new())
            .await?
            .expect("C1 was written");
        assert_eq!(resumed.checkpoint.metadata.checkpoint_id, c1);
        assert_eq!(resumed.pending_writes.len(), 1);
        assert_eq!(resumed.pending_writes[0].call_id, "tool-A");

        let mut continued = resumed.begin(None)?;
        assert!(continued.captures_call("tool-A"));
        continued.push_message(Message::tool_result("tool-A", "42 rows migrated"));
        continued.execution_state = None;
        engine.save_checkpoint(&continued, CheckpointSource::Loop, 2);

        assert!(engine.load_pending_writes(&thread.thread_id).await?.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn pending_writes_not_captured_survive_a_checkpoint() -> Result<()> {
        let (engine, _) = engine(RetentionPolicy::FullHistory);
        let mut thread = ConversationThread::new("partial");
        thread.execution_state = Some(ExecutionState::at_iteration(1));

        engine.save_pending_write(&thread.thread_id, "tool-A", json!(1));
        engine.save_pending_write(&thread.thread_id, "tool-B", json!(2));
        thread.push_message(Message::tool_result("tool-A", "1"));
        engine.save_checkpoint(&thread, CheckpointSource::Loop, 2);

        let remaining = engine.load_pending_writes(&thread.thread_id).await?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].call_id, "tool-B");

        assert_eq!(engine.delete_pending_writes(&thread.thread_id).await?, 1);
        assert!(engine.load_pending_writes(&thread.thread_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn latest_only_keeps_one_checkpoint() -> Result<()> {
        let (engine, store) = engine(RetentionPolicy::LatestOnly);
        let mut thread = ConversationThread::new("latest-only");
        let mut last = None;
        for step in 0..4 {
            thread.push_message(Message::user(format!("turn {step}")));
            last = Some(engine.save_checkpoint(&thread, CheckpointSource::Loop, step));
        }
        engine.flush(&thread.thread_id).await;

        let manifest = store
            .get_manifest(&thread.thread_id, ManifestQuery::all().kind(RecordKind::Checkpoint))
            .await?;
        assert_eq!(checkpoint_ids(&manifest), vec![last.expect("saved")]);
        Ok(())
    }

    #[tokio::test]
    async fn latest_only_keeps_fork_points() -> Result<()> {
        let (engine, store) = engine(RetentionPolicy::LatestOnly);
        let mut thread = ConversationThread::new("fork-point");
        thread.push_message(Message::user("first"));
        let c1 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);
        engine.flush(&thread.thread_id).await;

        let snapshot = ThreadSnapshot::capture(&thread);
        let mut forked = snapshot.clone();
        forked.branch = BranchName::from("alt");
        store
            .save_snapshot(
                &forked,
                CheckpointMetadata::for_snapshot(
                    &forked,
                    CheckpointId::from("f1"),
                    CheckpointSource::Fork,
                    1,
                )
                .with_parent(c1.clone()),
            )
            .await?;

        thread.push_message(Message::user("second"));
        let c2 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 2);
        thread.push_message(Message::user("third"));
        let c3 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 3);
        engine.flush(&thread.thread_id).await;

        let manifest = store
            .get_manifest(&thread.thread_id, ManifestQuery::all().kind(RecordKind::Checkpoint))
            .await?;
        let kept = checkpoint_ids(&manifest);
        assert_eq!(kept, vec![c3, c1]);
        assert!(!kept.contains(&c2));
        Ok(())
    }

    #[tokio::test]
    async fn prune_checkpoints_is_idempotent() -> Result<()> {
        let (engine, _) = engine(RetentionPolicy::FullHistory);
        let mut thread = ConversationThread::new("prune");
        for step in 0..5 {
            thread.push_message(Message::user(format!("turn {step}")));
            engine.save_checkpoint(&thread, CheckpointSource::Loop, step);
        }

        let first = engine.prune_checkpoints(&thread.thread_id, 2).await?;
        assert_eq!(first.len(), 3);
        let second = engine.prune_checkpoints(&thread.thread_id, 2).await?;
        assert!(second.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn last_n_and_time_based_retention() -> Result<()> {
        let (last_n, last_n_store) = engine(RetentionPolicy::LastN(2));
        let (windowed, windowed_store) = engine(RetentionPolicy::TimeBased { window_secs: 3600 });
        let mut thread = ConversationThread::new("retention");
        for step in 0..4 {
            thread.push_message(Message::user(format!("turn {step}")));
            last_n.save_checkpoint(&thread, CheckpointSource::Loop, step);
            windowed.save_checkpoint(&thread, CheckpointSource::Loop, step);
        }
        last_n.flush(&thread.thread_id).await;
        windowed.flush(&thread.thread_id).await;

        let query = || ManifestQuery::all().kind(RecordKind::Checkpoint);
        assert_eq!(last_n_store.get_manifest(&thread.thread_id, query()).await?.len(), 2);
        assert_eq!(windowed_store.get_manifest(&thread.thread_id, query()).await?.len(), 4);
        assert!(windowed.apply_retention(&thread.thread_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_checkpoint_is_retried_once_on_next_dispatch() -> Result<()> {
        let store = Arc::new(FlakyStore::failing(1));
        let engine = DurableExecution::new(store.clone(), DurableConfig::default());
        let mut events = engine.subscribe();

        let mut thread = ConversationThread::new("retry");
        thread.push_message(Message::user("one"));
        let c1 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);
        engine.flush(&thread.thread_id).await;
        assert!(store.get_manifest(&thread.thread_id, ManifestQuery::all()).await.is_err());

        thread.push_message(Message::user("two"));
        let c2 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 2);
        engine.flush(&thread.thread_id).await;

        let manifest = store.get_manifest(&thread.thread_id, ManifestQuery::all()).await?;
        assert_eq!(checkpoint_ids(&manifest), vec![c2, c1.clone()]);

        let first = events.recv().await?;
        assert!(matches!(
            first,
            DurabilityEvent::CheckpointFailed {
                ref checkpoint_id,
                will_retry: true,
                ..
            } if *checkpoint_id == c1
        ));
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_is_dropped_after_failed_retry() -> Result<()> {
        let store = Arc::new(FlakyStore::failing(2));
        let engine = DurableExecution::new(store.clone(), DurableConfig::default());
        let mut events = engine.subscribe_stream();

        let thread = ConversationThread::new("drop");
        let c1 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);
        let c2 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 2);
        engine.flush(&thread.thread_id).await;

        let manifest = store.get_manifest(&thread.thread_id, ManifestQuery::all()).await?;
        assert_eq!(checkpoint_ids(&manifest), vec![c2]);

        let mut dropped = None;
        while let Some(event) = events.next().await {
            if let DurabilityEvent::CheckpointDropped { checkpoint_id, .. } = event {
                dropped = Some(checkpoint_id);
                break;
            }
        }
        assert_eq!(dropped, Some(c1));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_drains_queues_and_rejects_later_saves() -> Result<()> {
        let (engine, store) = engine(RetentionPolicy::FullHistory);
        let threads: Vec<ConversationThread> = (0..3)
            .map(|n| ConversationThread::new(format!("thread-{n}")))
            .collect();
        for thread in &threads {
            engine.save_checkpoint(thread, CheckpointSource::Loop, 1);
        }
        assert_eq!(engine.active_writers(), 3);

        engine.shutdown().await;
        assert_eq!(engine.active_writers(), 0);
        for thread in &threads {
            let manifest = store.get_manifest(&thread.thread_id, ManifestQuery::all()).await?;
            assert_eq!(manifest.len(), 1);
        }

        let late = engine.save_checkpoint(&threads[0], CheckpointSource::Manual, 2);
        let manifest = store.get_manifest(&threads[0].thread_id, ManifestQuery::all()).await?;
        assert!(!checkpoint_ids(&manifest).contains(&late));
        Ok(())
    }

    async fn wait_for_idle_writers(engine: &DurableExecution) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.active_writers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn idle_writers_exit_and_respawn_on_demand() -> Result<()> {
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = DurableConfig::default().with_writer_idle(Duration::from_millis(20));
        let engine = DurableExecution::new(store.clone(), config);

        let threads: Vec<ConversationThread> = (0..200)
            .map(|n| ConversationThread::new(format!("idle-{n}")))
            .collect();
        for thread in &threads {
            engine.save_checkpoint(thread, CheckpointSource::Loop, 1);
            engine.save_pending_write(&thread.thread_id, "tool-A", json!({"ok": true}));
        }
        engine.flush_all().await;
        wait_for_idle_writers(&engine).await?;
        assert_eq!(engine.active_writers(), 0);

        let again = engine.save_checkpoint(&threads[0], CheckpointSource::Loop, 2);
        engine.flush(&threads[0].thread_id).await;
        let manifest = store.get_manifest(&threads[0].thread_id, ManifestQuery::all()).await?;
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].checkpoint_id, again);
        assert_eq!(engine.load_pending_writes(&threads[0].thread_id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn parked_checkpoint_is_retried_before_an_idle_writer_exits() -> Result<()> {
        let store = Arc::new(FlakyStore::failing(1));
        let config = DurableConfig::default().with_writer_idle(Duration::from_millis(20));
        let engine = DurableExecution::new(store.clone(), config);

        let thread = ConversationThread::new("idle-retry");
        let c1 = engine.save_checkpoint(&thread, CheckpointSource::Loop, 1);
        wait_for_idle_writers(&engine).await?;

        let manifest = store.get_manifest(&thread.thread_id, ManifestQuery::all()).await?;
        assert_eq!(checkpoint_ids(&manifest), vec![c1]);
        Ok(())
    }
}
