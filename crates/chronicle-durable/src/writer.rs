//! Ordered background persistence.
//!
//! One worker task per thread drains an unbounded queue, so writes for the
//! same thread never interleave while different threads proceed in parallel.
//! A checkpoint whose write fails is parked and retried once, right before the
//! next checkpoint for the same thread (or at shutdown), then dropped.
//!
//! A worker that sees no job for the idle window retries anything parked and
//! exits; the next job for its thread spawns a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use chronicle_protocol::{
    CheckpointId, CheckpointMetadata, CheckpointResult, CheckpointStore, ConversationThread,
    ManifestQuery, PendingWrite, RecordKind, ThreadId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::RetentionPolicy;
use crate::events::{DurabilityEvent, DurabilityHub};
use crate::retention;

#[derive(Debug)]
pub(crate) struct CheckpointJob {
    pub thread: ConversationThread,
    pub metadata: CheckpointMetadata,
}

#[derive(Debug)]
pub(crate) enum WriteJob {
    Checkpoint(Box<CheckpointJob>),
    PendingWrite(PendingWrite),
    Barrier(oneshot::Sender<()>),
}

struct WorkerHandle {
    sender: mpsc::UnboundedSender<WriteJob>,
    task: JoinHandle<()>,
    generation: u64,
}

/// Jobs are only sent while this map is locked, so a worker that finds its
/// queue empty under the same lock can leave without losing anything.
type Workers = Arc<Mutex<HashMap<ThreadId, WorkerHandle>>>;

struct WorkerSlot {
    thread_id: ThreadId,
    generation: u64,
    workers: Workers,
    idle: Duration,
}

impl WorkerSlot {
    /// Removes this worker's entry when nothing is queued. `false` means a job
    /// arrived and the worker must keep going.
    fn release_if_idle(&self, jobs: &mpsc::UnboundedReceiver<WriteJob>) -> bool {
        let mut workers = self.workers.lock();
        if !jobs.is_empty() {
            return false;
        }
        if workers
            .get(&self.thread_id)
            .is_some_and(|handle| handle.generation == self.generation)
        {
            workers.remove(&self.thread_id);
        }
        true
    }
}

/// Store access shared by every worker.
pub(crate) struct WriteContext {
    pub store: Arc<dyn CheckpointStore>,
    pub retention: RetentionPolicy,
    pub hub: DurabilityHub,
}

impl WriteContext {
    async fn run(self: Arc<Self>, slot: WorkerSlot, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
        let thread_id = slot.thread_id.clone();
        let mut parked: Option<Box<CheckpointJob>> = None;
        loop {
            let job = match tokio::time::timeout(slot.idle, jobs.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    if let Some(previous) = parked.take() {
                        self.retry(previous).await;
                    }
                    if slot.release_if_idle(&jobs) {
                        debug!("writer idle; exiting");
                        return;
                    }
                    continue;
                }
            };
            match job {
                WriteJob::Checkpoint(job) => {
                    if let Some(previous) = parked.take() {
                        self.retry(previous).await;
                    }
                    if let Err(error) = self.write_checkpoint(&job).await {
                        warn!(
                            checkpoint_id = %job.metadata.checkpoint_id,
                            error = %error,
                            "checkpoint write failed; parked for one retry"
                        );
                        self.hub.publish(DurabilityEvent::CheckpointFailed {
                            thread_id: thread_id.clone(),
                            checkpoint_id: job.metadata.checkpoint_id.clone(),
                            error: error.to_string(),
                            will_retry: true,
                        });
                        parked = Some(job);
                    }
                }
                WriteJob::PendingWrite(write) => self.write_pending(write).await,
                WriteJob::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        if let Some(previous) = parked.take() {
            self.retry(previous).await;
        }
        debug!("writer stopped");
    }

    async fn retry(&self, job: Box<CheckpointJob>) {
        let checkpoint_id = job.metadata.checkpoint_id.clone();
        match self.write_checkpoint(&job).await {
            Ok(()) => {
                info!(checkpoint_id = %checkpoint_id, "parked checkpoint written on retry");
            }
            Err(error) => {
                warn!(
                    checkpoint_id = %checkpoint_id,
                    error = %error,
                    "checkpoint retry failed; dropping"
                );
                self.hub.publish(DurabilityEvent::CheckpointDropped {
                    thread_id: job.thread.thread_id.clone(),
                    checkpoint_id,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Only the record write itself is retryable. Follow-up work after the
    /// record landed logs its failures and moves on.
    async fn write_checkpoint(&self, job: &CheckpointJob) -> CheckpointResult<()> {
        let thread_id = &job.thread.thread_id;
        let entry = self
            .store
            .save_checkpoint(&job.thread, job.metadata.clone())
            .await?;
        info!(
            checkpoint_id = %entry.checkpoint_id,
            step = entry.step,
            incomplete = entry.is_incomplete,
            "checkpoint saved"
        );
        self.hub.publish(DurabilityEvent::CheckpointSaved {
            thread_id: thread_id.clone(),
            metadata: entry,
        });

        if let Err(error) = self.store.save_thread(&job.thread).await {
            warn!(error = %error, "failed updating latest thread state after checkpoint");
        }
        if let Err(error) = self.clear_captured_writes(&job.thread).await {
            warn!(error = %error, "failed clearing captured pending writes");
        }
        if let Err(error) = self.apply_retention(thread_id).await {
            warn!(error = %error, "retention pass failed");
        }
        Ok(())
    }

    async fn clear_captured_writes(
        &self,
        thread: &ConversationThread,
    ) -> CheckpointResult<usize> {
        let mut cleared = 0;
        for write in self.store.load_pending_writes(&thread.thread_id).await? {
            if thread.captures_call(&write.call_id)
                && self
                    .store
                    .delete_pending_write(&thread.thread_id, &write.call_id)
                    .await?
            {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "pending writes captured by checkpoint removed");
        }
        Ok(cleared)
    }

    async fn write_pending(&self, write: PendingWrite) {
        match self.store.save_pending_write(&write).await {
            Ok(()) => {
                debug!(call_id = %write.call_id, "pending write saved");
                self.hub.publish(DurabilityEvent::PendingWriteSaved {
                    thread_id: write.thread_id,
                    call_id: write.call_id,
                });
            }
            Err(error) => {
                warn!(
                    call_id = %write.call_id,
                    error = %error,
                    "pending write failed; dropping"
                );
                self.hub.publish(DurabilityEvent::PendingWriteFailed {
                    thread_id: write.thread_id,
                    call_id: write.call_id,
                    error: error.to_string(),
                });
            }
        }
    }

    pub async fn apply_retention(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        if self.retention == RetentionPolicy::FullHistory {
            return Ok(Vec::new());
        }
        let checkpoints = self
            .store
            .get_manifest(thread_id, ManifestQuery::all().kind(RecordKind::Checkpoint))
            .await?;
        let candidates = retention::plan(self.retention, &checkpoints, Utc::now());
        self.delete_checkpoints(thread_id, candidates).await
    }

    pub async fn prune(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        let checkpoints = self
            .store
            .get_manifest(thread_id, ManifestQuery::all().kind(RecordKind::Checkpoint))
            .await?;
        let candidates = retention::keep_newest(&checkpoints, keep_count);
        self.delete_checkpoints(thread_id, candidates).await
    }

    async fn delete_checkpoints(
        &self,
        thread_id: &ThreadId,
        candidates: Vec<CheckpointId>,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let removed = self.store.delete_checkpoints(thread_id, &candidates).await?;
        if removed.len() < candidates.len() {
            debug!(
                skipped = candidates.len() - removed.len(),
                "protected checkpoints kept"
            );
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "checkpoints pruned");
            self.hub.publish(DurabilityEvent::Pruned {
                thread_id: thread_id.clone(),
                kind: RecordKind::Checkpoint,
                removed: removed.clone(),
            });
        }
        Ok(removed)
    }
}

/// Owns the per-thread workers.
pub(crate) struct WriterPool {
    context: Arc<WriteContext>,
    workers: Workers,
    closed: AtomicBool,
    next_generation: AtomicU64,
    idle: Duration,
}

impl WriterPool {
    pub fn new(context: WriteContext, idle: Duration) -> Self {
        Self {
            context: Arc::new(context),
            workers: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            idle,
        }
    }

    pub fn context(&self) -> &WriteContext {
        &self.context
    }

    /// Queues a job without waiting. Hands the job back once the pool is shut
    /// down.
    pub fn dispatch(&self, thread_id: &ThreadId, job: WriteJob) -> Result<(), WriteJob> {
        if self.closed.load(Ordering::Acquire) {
            return Err(job);
        }
        let mut workers = self.workers.lock();
        let job = match workers.get(thread_id) {
            Some(handle) => match handle.sender.send(job) {
                Ok(()) => return Ok(()),
                Err(SendError(job)) => job,
            },
            None => job,
        };

        let handle = self.spawn_worker(thread_id.clone());
        let sent = handle.sender.send(job).map_err(|SendError(job)| job);
        workers.insert(thread_id.clone(), handle);
        sent
    }

    fn spawn_worker(&self, thread_id: ThreadId) -> WorkerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("checkpoint_writer", thread_id = %thread_id, generation);
        let slot = WorkerSlot {
            thread_id,
            generation,
            workers: self.workers.clone(),
            idle: self.idle,
        };
        let task = tokio::spawn(self.context.clone().run(slot, receiver).instrument(span));
        WorkerHandle {
            sender,
            task,
            generation,
        }
    }

    /// Resolves once every job queued for `thread_id` before this call has run.
    pub async fn flush(&self, thread_id: &ThreadId) {
        let barrier = {
            let workers = self.workers.lock();
            workers.get(thread_id).and_then(|handle| {
                let (done, wait) = oneshot::channel();
                handle.sender.send(WriteJob::Barrier(done)).ok().map(|()| wait)
            })
        };
        if let Some(wait) = barrier {
            let _ = wait.await;
        }
    }

    pub async fn flush_all(&self) {
        let barriers: Vec<_> = {
            let workers = self.workers.lock();
            workers
                .values()
                .filter_map(|handle| {
                    let (done, wait) = oneshot::channel();
                    handle.sender.send(WriteJob::Barrier(done)).ok().map(|()| wait)
                })
                .collect()
        };
        for wait in barriers {
            let _ = wait.await;
        }
    }

    /// Stops accepting jobs, drains every queue and waits for the workers.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let handles: Vec<WorkerHandle> =
            self.workers.lock().drain().map(|(_, handle)| handle).collect();
        for WorkerHandle { sender, task, .. } in handles {
            drop(sender);
            if let Err(error) = task.await {
                warn!(error = %error, "checkpoint writer task ended abnormally");
            }
        }
    }

    pub fn active_threads(&self) -> usize {
        self.workers.lock().len()
    }
}
