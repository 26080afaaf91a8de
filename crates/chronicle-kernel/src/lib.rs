use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chronicle_branching::BranchingEngine;
use chronicle_durable::{DurabilityEvent, DurableConfig, DurableExecution, ResumePoint};
use chronicle_protocol::{
    BranchName, BranchTree, CheckpointId, CheckpointMetadata, CheckpointResult, CheckpointSource,
    CheckpointStore, ConversationThread, ThreadId,
};
use chronicle_store::{FileCheckpointStore, MemoryCheckpointStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
enum StoreBackend {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    backend: StoreBackend,
    config: DurableConfig,
}

impl KernelBuilder {
    /// File-backed kernel rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::File(root.into()),
            config: DurableConfig::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            config: DurableConfig::default(),
        }
    }

    pub fn config(mut self, config: DurableConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn config_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = DurableConfig::load(path)
            .await
            .with_context(|| format!("failed loading durable config from {}", path.display()))?;
        Ok(self.config(config))
    }

    pub fn build(self) -> ChronicleKernel {
        let store: Arc<dyn CheckpointStore> = match self.backend {
            StoreBackend::File(root) => Arc::new(FileCheckpointStore::new(root)),
            StoreBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        };
        let durable = DurableExecution::new(store.clone(), self.config);
        let branching = BranchingEngine::new(store.clone());
        ChronicleKernel {
            store,
            durable,
            branching,
        }
    }
}

#[derive(Clone)]
pub struct ChronicleKernel {
    store: Arc<dyn CheckpointStore>,
    durable: DurableExecution,
    branching: BranchingEngine,
}

impl ChronicleKernel {
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn durable(&self) -> &DurableExecution {
        &self.durable
    }

    pub fn branching(&self) -> &BranchingEngine {
        &self.branching
    }

    /// Creates a thread and persists its initial latest state.
    #[instrument(skip(self, display_name))]
    pub async fn create_thread(
        &self,
        display_name: impl Into<String>,
    ) -> CheckpointResult<ConversationThread> {
        let thread = ConversationThread::new(display_name);
        self.store.save_thread(&thread).await?;
        info!(thread_id = %thread.thread_id, "thread created");
        Ok(thread)
    }

    pub async fn load_thread(&self, thread_id: &ThreadId) -> CheckpointResult<ConversationThread> {
        self.store.load_thread(thread_id).await
    }

    /// Loop hook: checkpoints when the configured frequency asks for it.
    pub fn on_iteration(
        &self,
        thread: &ConversationThread,
        step: u64,
        turn_complete: bool,
    ) -> Option<CheckpointId> {
        self.durable
            .checkpoint_if_due(thread, CheckpointSource::Loop, step, turn_complete)
    }

    #[instrument(skip(self, cancel), fields(thread_id = %thread_id))]
    pub async fn resume(
        &self,
        thread_id: &ThreadId,
        cancel: &CancellationToken,
    ) -> CheckpointResult<Option<ResumePoint>> {
        self.durable.resume_from_latest(thread_id, cancel).await
    }

    /// Snapshots the thread as it is now so the point can be forked later.
    #[instrument(skip(self, thread), fields(thread_id = %thread.thread_id))]
    pub async fn mark_forkable(
        &self,
        thread: &ConversationThread,
    ) -> CheckpointResult<CheckpointMetadata> {
        self.durable.flush(&thread.thread_id).await;
        self.branching
            .snapshot(thread, CheckpointSource::Application, None)
            .await
    }

    /// Flushes queued checkpoints, then forks.
    #[instrument(
        skip(self),
        fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id, branch = %branch)
    )]
    pub async fn fork(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        branch: BranchName,
    ) -> CheckpointResult<ConversationThread> {
        self.durable.flush(thread_id).await;
        self.branching
            .fork_from_checkpoint(thread_id, checkpoint_id, branch)
            .await
    }

    /// Flushes queued checkpoints, then switches.
    #[instrument(skip(self), fields(thread_id = %thread_id, branch = %branch))]
    pub async fn switch_branch(
        &self,
        thread_id: &ThreadId,
        branch: &BranchName,
    ) -> CheckpointResult<ConversationThread> {
        self.durable.flush(thread_id).await;
        self.branching.switch_branch(thread_id, branch).await
    }

    pub async fn branch_tree(&self, thread_id: &ThreadId) -> CheckpointResult<BranchTree> {
        self.durable.flush(thread_id).await;
        self.branching.get_branch_tree(thread_id).await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<DurabilityEvent> {
        self.durable.subscribe()
    }

    pub async fn shutdown(&self) {
        self.durable.shutdown().await;
    }
}
