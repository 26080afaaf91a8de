//! Checkpoint store backends.
//!
//! [`FileCheckpointStore`] is the durable backend; [`MemoryCheckpointStore`]
//! keeps the same contract without touching disk.

mod codec;
mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use chronicle_protocol::{
        BranchName, CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointStore,
        ConversationThread, Message, PendingWrite, ThreadId, ThreadSnapshot,
    };
    use serde_json::json;
    use tokio::fs;

    use crate::{FileCheckpointStore, MemoryCheckpointStore};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn pending_write_calls(store: &dyn CheckpointStore) -> Result<Vec<String>> {
        let thread_id = ThreadId::from("contract-pending");
        for (call_id, value) in [(".tool-A", 1), ("tool-B", 2), ("tool.C", 3), (".tool-A", 4)] {
            store
                .save_pending_write(&PendingWrite::new(thread_id.clone(), call_id, json!(value)))
                .await?;
        }

        let writes = store.load_pending_writes(&thread_id).await?;
        let mut calls: Vec<String> = writes.iter().map(|w| w.call_id.clone()).collect();
        calls.sort();
        let dotted = writes.iter().find(|w| w.call_id == ".tool-A");
        assert_eq!(dotted.map(|w| &w.result), Some(&json!(4)));

        assert!(store.delete_pending_write(&thread_id, ".tool-A").await?);
        assert!(!store.delete_pending_write(&thread_id, ".tool-A").await?);
        assert_eq!(store.delete_pending_writes(&thread_id).await?, 2);
        assert!(store.load_pending_writes(&thread_id).await?.is_empty());
        Ok(calls)
    }

    async fn pruned_snapshots(store: &dyn CheckpointStore) -> Result<Vec<CheckpointId>> {
        let mut thread = ConversationThread::with_id(ThreadId::from("contract-prune"), "prune");
        for id in ["s1", "s2", "s3", "s4"] {
            thread.push_message(Message::user(id));
            let snapshot = ThreadSnapshot::capture(&thread);
            let meta = CheckpointMetadata::for_snapshot(
                &snapshot,
                CheckpointId::from(id),
                CheckpointSource::Application,
                0,
            );
            store.save_snapshot(&snapshot, meta).await?;
        }
        let mut forked = ThreadSnapshot::capture(&thread);
        forked.branch = BranchName::from("alt");
        let meta = CheckpointMetadata::for_snapshot(
            &forked,
            CheckpointId::from("f1"),
            CheckpointSource::Fork,
            0,
        )
        .with_parent(CheckpointId::from("s1"));
        store.save_snapshot(&forked, meta).await?;

        let mut removed = store.prune_snapshots(&thread.thread_id, 1).await?;
        removed.sort();
        assert!(store.prune_snapshots(&thread.thread_id, 1).await?.is_empty());
        assert!(store.load_snapshot(&thread.thread_id, &CheckpointId::from("s1")).await.is_ok());
        assert!(store.load_snapshot(&thread.thread_id, &CheckpointId::from("s4")).await.is_ok());
        assert!(store.load_snapshot(&thread.thread_id, &CheckpointId::from("f1")).await.is_ok());
        Ok(removed)
    }

    #[tokio::test]
    async fn backends_agree_on_pending_writes_and_pruning() -> Result<()> {
        let root = unique_test_root("chronicle-store-contract");
        let file = FileCheckpointStore::new(&root);
        let memory = MemoryCheckpointStore::new();

        let from_file = pending_write_calls(&file).await?;
        let from_memory = pending_write_calls(&memory).await?;
        assert_eq!(from_file, vec![".tool-A", "tool-B", "tool.C"]);
        assert_eq!(from_file, from_memory);

        let pruned_file = pruned_snapshots(&file).await?;
        let pruned_memory = pruned_snapshots(&memory).await?;
        assert_eq!(pruned_file, vec![CheckpointId::from("s2"), CheckpointId::from("s3")]);
        assert_eq!(pruned_file, pruned_memory);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
