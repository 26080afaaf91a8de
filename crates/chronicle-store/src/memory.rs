//! In-memory checkpoint store, used by tests and the `--in-memory` daemon mode.
//!
//! Records are kept as encoded bytes so payload sizes, hashes and the
//! isolation between saved and loaded values match the file backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chronicle_protocol::{
    BranchName, CheckpointError, CheckpointId, CheckpointMetadata, CheckpointResult,
    CheckpointStore, ConversationThread, ExecutionCheckpoint, Manifest, ManifestQuery,
    PendingWrite, RecordKind, StoredSnapshot, ThreadId, ThreadSnapshot, validate_path_segment,
};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::codec::{self, EncodedRecord};

#[derive(Debug, Default)]
struct ThreadRecords {
    latest: Option<ConversationThread>,
    manifest: Manifest,
    records: HashMap<(CheckpointId, RecordKind), Vec<u8>>,
    pending: IndexMap<String, PendingWrite>,
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<ThreadId, ThreadRecords>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    fn save_record(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        record: EncodedRecord,
        mut metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        validate_path_segment("thread id", thread_id.as_str())?;
        validate_path_segment("checkpoint id", metadata.checkpoint_id.as_str())?;

        let mut threads = self.threads.write();
        let records = threads.entry(thread_id.clone()).or_default();
        if records.manifest.find(&metadata.checkpoint_id, kind).is_some() {
            return Err(codec::duplicate_record(kind, &metadata.checkpoint_id));
        }
        codec::stamp(&mut metadata, &record, kind);
        let entry = records.manifest.append(metadata)?;
        records
            .records
            .insert((entry.checkpoint_id.clone(), kind), record.bytes);
        Ok(entry)
    }

    fn read_record(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<(CheckpointMetadata, Vec<u8>)> {
        let threads = self.threads.read();
        let records = threads
            .get(thread_id)
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.clone()))?;
        let metadata = records
            .manifest
            .find(checkpoint_id, kind)
            .cloned()
            .ok_or_else(|| codec::not_found(kind, thread_id, checkpoint_id))?;
        let bytes = records
            .records
            .get(&(checkpoint_id.clone(), kind))
            .cloned()
            .ok_or_else(|| CheckpointError::Corrupted {
                thread_id: thread_id.clone(),
                checkpoint_id: checkpoint_id.clone(),
                reason: "record missing for manifest entry".to_owned(),
            })?;
        codec::verify(thread_id, &metadata, &bytes)?;
        Ok((metadata, bytes))
    }

    fn with_thread<T>(
        &self,
        thread_id: &ThreadId,
        apply: impl FnOnce(&mut ThreadRecords) -> T,
    ) -> CheckpointResult<T> {
        let mut threads = self.threads.write();
        let records = threads
            .get_mut(thread_id)
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.clone()))?;
        Ok(apply(records))
    }

    fn remove_records(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        select: impl FnOnce(&Manifest) -> Vec<CheckpointId>,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.with_thread(thread_id, |records| {
            let requested = select(&records.manifest);
            let removed = records.manifest.remove(kind, &requested);
            for checkpoint_id in &removed {
                records.records.remove(&(checkpoint_id.clone(), kind));
            }
            removed
        })
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_thread(&self, thread: &ConversationThread) -> CheckpointResult<()> {
        validate_path_segment("thread id", thread.thread_id.as_str())?;
        let mut threads = self.threads.write();
        threads.entry(thread.thread_id.clone()).or_default().latest = Some(thread.clone());
        Ok(())
    }

    async fn load_thread(&self, thread_id: &ThreadId) -> CheckpointResult<ConversationThread> {
        self.threads
            .read()
            .get(thread_id)
            .and_then(|records| records.latest.clone())
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.clone()))
    }

    async fn save_checkpoint(
        &self,
        thread: &ConversationThread,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        let record = codec::encode(thread)?;
        let entry = self.save_record(&thread.thread_id, RecordKind::Checkpoint, record, metadata)?;
        debug!(
            thread_id = %thread.thread_id,
            checkpoint_id = %entry.checkpoint_id,
            "checkpoint stored in memory"
        );
        Ok(entry)
    }

    async fn load_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<ExecutionCheckpoint> {
        let (metadata, bytes) = self.read_record(thread_id, RecordKind::Checkpoint, checkpoint_id)?;
        let mut thread: ConversationThread = serde_json::from_slice(&bytes)?;
        thread.active_branch = metadata.branch.clone();
        Ok(ExecutionCheckpoint { metadata, thread })
    }

    async fn save_snapshot(
        &self,
        snapshot: &ThreadSnapshot,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        let record = codec::encode(snapshot)?;
        self.save_record(&snapshot.thread_id, RecordKind::Snapshot, record, metadata)
    }

    async fn load_snapshot(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<StoredSnapshot> {
        let (metadata, bytes) = self.read_record(thread_id, RecordKind::Snapshot, checkpoint_id)?;
        let mut snapshot: ThreadSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.branch = metadata.branch.clone();
        Ok(StoredSnapshot { metadata, snapshot })
    }

    async fn get_manifest(
        &self,
        thread_id: &ThreadId,
        query: ManifestQuery,
    ) -> CheckpointResult<Vec<CheckpointMetadata>> {
        self.threads
            .read()
            .get(thread_id)
            .map(|records| records.manifest.query(&query))
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.clone()))
    }

    async fn prune_snapshots(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.remove_records(thread_id, RecordKind::Snapshot, |manifest| {
            manifest.prune_plan(RecordKind::Snapshot, keep_count)
        })
    }

    async fn delete_snapshots(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.remove_records(thread_id, RecordKind::Snapshot, |_| ids.to_vec())
    }

    async fn delete_checkpoints(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.remove_records(thread_id, RecordKind::Checkpoint, |_| ids.to_vec())
    }

    async fn rename_branch(
        &self,
        thread_id: &ThreadId,
        from: &BranchName,
        to: &BranchName,
    ) -> CheckpointResult<usize> {
        self.with_thread(thread_id, |records| records.manifest.rename_branch(from, to))
    }

    async fn remove_branch(
        &self,
        thread_id: &ThreadId,
        branch: &BranchName,
    ) -> CheckpointResult<Vec<CheckpointMetadata>> {
        self.with_thread(thread_id, |records| {
            let removed = records.manifest.remove_branch(branch);
            for entry in &removed {
                records
                    .records
                    .remove(&(entry.checkpoint_id.clone(), entry.kind()));
            }
            removed
        })
    }

    async fn save_pending_write(&self, write: &PendingWrite) -> CheckpointResult<()> {
        validate_path_segment("thread id", write.thread_id.as_str())?;
        validate_path_segment("call id", &write.call_id)?;
        let mut threads = self.threads.write();
        threads
            .entry(write.thread_id.clone())
            .or_default()
            .pending
            .insert(write.call_id.clone(), write.clone());
        Ok(())
    }

    async fn load_pending_writes(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<PendingWrite>> {
        let mut writes: Vec<PendingWrite> = self
            .threads
            .read()
            .get(thread_id)
            .map(|records| records.pending.values().cloned().collect())
            .unwrap_or_default();
        writes.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        Ok(writes)
    }

    async fn delete_pending_write(
        &self,
        thread_id: &ThreadId,
        call_id: &str,
    ) -> CheckpointResult<bool> {
        let mut threads = self.threads.write();
        Ok(threads
            .get_mut(thread_id)
            .is_some_and(|records| records.pending.shift_remove(call_id).is_some()))
    }

    async fn delete_pending_writes(&self, thread_id: &ThreadId) -> CheckpointResult<usize> {
        let mut threads = self.threads.write();
        Ok(threads
            .get_mut(thread_id)
            .map(|records| records.pending.drain(..).count())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_protocol::{CheckpointSource, ExecutionState, Message};
    use serde_json::json;

    fn thread_with(messages: usize) -> ConversationThread {
        let mut thread = ConversationThread::new("memory");
        for n in 0..messages {
            thread.push_message(Message::user(format!("m{n}")));
        }
        thread
    }

    #[tokio::test]
    async fn load_thread_before_save_is_not_found() {
        let store = MemoryCheckpointStore::new();
        let error = store.load_thread(&ThreadId::from("ghost")).await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn saved_and_loaded_threads_are_isolated() -> anyhow::Result<()> {
        let store = MemoryCheckpointStore::new();
        let mut thread = thread_with(1);
        thread.execution_state = Some(ExecutionState::at_iteration(1));
        let entry = store
            .save_checkpoint(
                &thread,
                CheckpointMetadata::for_checkpoint(
                    &thread,
                    CheckpointId::from("c1"),
                    CheckpointSource::Loop,
                    1,
                ),
            )
            .await?;
        assert!(entry.payload_hash.is_some());

        thread.push_message(Message::user("after save"));
        let loaded = store.load_checkpoint(&thread.thread_id, &CheckpointId::from("c1")).await?;
        assert_eq!(loaded.thread.message_count(), 1);
        assert!(loaded.is_incomplete());
        Ok(())
    }

    #[tokio::test]
    async fn fork_point_snapshot_survives_prune_and_delete() -> anyhow::Result<()> {
        let store = MemoryCheckpointStore::new();
        let thread = thread_with(2);
        let snapshot = ThreadSnapshot::capture(&thread);
        for id in ["s1", "s2"] {
            let meta = CheckpointMetadata::for_snapshot(
                &snapshot,
                CheckpointId::from(id),
                CheckpointSource::User,
                0,
            );
            store.save_snapshot(&snapshot, meta).await?;
        }
        let mut forked = snapshot.clone();
        forked.branch = BranchName::from("alt");
        let meta = CheckpointMetadata::for_snapshot(
            &forked,
            CheckpointId::from("f1"),
            CheckpointSource::Fork,
            0,
        )
        .with_parent(CheckpointId::from("s1"));
        store.save_snapshot(&forked, meta).await?;

        assert!(store.prune_snapshots(&thread.thread_id, 0).await?.is_empty());
        let removed = store
            .delete_snapshots(&thread.thread_id, &[CheckpointId::from("s1")])
            .await?;
        assert!(removed.is_empty());
        assert!(store.load_snapshot(&thread.thread_id, &CheckpointId::from("s1")).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn pending_writes_replace_by_call_id() -> anyhow::Result<()> {
        let store = MemoryCheckpointStore::new();
        let thread_id = ThreadId::from("t1");
        store
            .save_pending_write(&PendingWrite::new(thread_id.clone(), "call-1", json!(1)))
            .await?;
        store
            .save_pending_write(&PendingWrite::new(thread_id.clone(), "call-1", json!(2)))
            .await?;

        let writes = store.load_pending_writes(&thread_id).await?;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].result, json!(2));
        assert_eq!(store.delete_pending_writes(&thread_id).await?, 1);
        assert!(store.load_pending_writes(&ThreadId::from("other")).await?.is_empty());
        Ok(())
    }
}
