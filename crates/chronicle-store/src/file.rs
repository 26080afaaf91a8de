use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chronicle_protocol::{
    BranchName, CheckpointError, CheckpointId, CheckpointMetadata, CheckpointResult,
    CheckpointStore, ConversationThread, ExecutionCheckpoint, Manifest, ManifestQuery,
    PendingWrite, RecordKind, StoredSnapshot, ThreadId, ThreadSnapshot, validate_path_segment,
};
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::codec::{self, EncodedRecord};

const MANIFEST_FILE: &str = "manifest.json";
const THREAD_FILE: &str = "thread.json";
const PENDING_DIR: &str = "pending";
const PENDING_PREFIX: &str = "pw-";

/// Durable store laid out as one directory per thread:
///
/// ```text
/// <root>/threads/<thread_id>/manifest.json
///                            thread.json
///                            ckpt-<id>.json
///                            snap-<id>.json
///                            pending/pw-<call_id>.json
/// ```
///
/// Every file is written to a temp sibling, fsynced, then renamed into place.
/// Record files land before the manifest entry that references them; on
/// deletion the manifest is rewritten before files are removed.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.write_locks.lock().len()
    }

    fn thread_dir(&self, thread_id: &ThreadId) -> CheckpointResult<PathBuf> {
        validate_path_segment("thread id", thread_id.as_str())?;
        Ok(self.root.join("threads").join(thread_id.as_str()))
    }

    fn record_path(
        dir: &Path,
        kind: RecordKind,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<PathBuf> {
        validate_path_segment("checkpoint id", checkpoint_id.as_str())?;
        Ok(dir.join(format!("{}-{}.json", kind.file_prefix(), checkpoint_id.as_str())))
    }

    fn pending_path(dir: &Path, call_id: &str) -> CheckpointResult<PathBuf> {
        validate_path_segment("call id", call_id)?;
        Ok(dir
            .join(PENDING_DIR)
            .join(format!("{PENDING_PREFIX}{call_id}.json")))
    }

    /// Entries nobody holds or waits on are dropped on the way in, so the map
    /// only tracks threads with writes in flight.
    fn lock_for(&self, thread_id: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard.retain(|_, lock| Arc::strong_count(lock) > 1);
        guard
            .entry(thread_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn require_thread(&self, thread_id: &ThreadId) -> CheckpointResult<PathBuf> {
        let dir = self.thread_dir(thread_id)?;
        if !exists(&dir).await {
            return Err(CheckpointError::ThreadNotFound(thread_id.clone()));
        }
        Ok(dir)
    }

    async fn read_manifest(dir: &Path) -> CheckpointResult<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        if !exists(&path).await {
            return Ok(Manifest::new());
        }
        let raw = fs::read(&path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_manifest(dir: &Path, manifest: &Manifest) -> CheckpointResult<()> {
        let payload = serde_json::to_vec_pretty(manifest)?;
        atomic_write(&dir.join(MANIFEST_FILE), &payload).await?;
        Ok(())
    }

    async fn save_record(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        record: EncodedRecord,
        mut metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        let dir = self.thread_dir(thread_id)?;
        let path = Self::record_path(&dir, kind, &metadata.checkpoint_id)?;

        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        fs::create_dir_all(&dir).await?;
        let mut manifest = Self::read_manifest(&dir).await?;
        if manifest.find(&metadata.checkpoint_id, kind).is_some() {
            return Err(codec::duplicate_record(kind, &metadata.checkpoint_id));
        }

        codec::stamp(&mut metadata, &record, kind);
        atomic_write(&path, &record.bytes).await?;
        let entry = manifest.append(metadata)?;
        Self::write_manifest(&dir, &manifest).await?;
        debug!(payload_size = entry.payload_size, "record written");
        Ok(entry)
    }

    async fn read_record(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<(CheckpointMetadata, Vec<u8>)> {
        let dir = self.require_thread(thread_id).await?;
        let path = Self::record_path(&dir, kind, checkpoint_id)?;
        let manifest = Self::read_manifest(&dir).await?;
        let metadata = manifest
            .find(checkpoint_id, kind)
            .cloned()
            .ok_or_else(|| codec::not_found(kind, thread_id, checkpoint_id))?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::Corrupted {
                    thread_id: thread_id.clone(),
                    checkpoint_id: checkpoint_id.clone(),
                    reason: format!("record file missing: {path:?}"),
                });
            }
            Err(error) => return Err(error.into()),
        };
        codec::verify(thread_id, &metadata, &bytes)?;
        Ok((metadata, bytes))
    }

    async fn remove_records(
        &self,
        thread_id: &ThreadId,
        kind: RecordKind,
        select: impl FnOnce(&Manifest) -> Vec<CheckpointId> + Send,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        let dir = self.require_thread(thread_id).await?;
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut manifest = Self::read_manifest(&dir).await?;
        let requested = select(&manifest);
        let removed = manifest.remove(kind, &requested);
        if removed.len() < requested.len() {
            warn!(
                requested = requested.len(),
                removed = removed.len(),
                "protected or unknown records skipped"
            );
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        Self::write_manifest(&dir, &manifest).await?;
        for checkpoint_id in &removed {
            remove_file_quietly(&Self::record_path(&dir, kind, checkpoint_id)?).await;
        }
        info!(count = removed.len(), ?kind, "records removed");
        Ok(removed)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    #[instrument(
        skip(self, thread),
        fields(thread_id = %thread.thread_id, branch = %thread.active_branch)
    )]
    async fn save_thread(&self, thread: &ConversationThread) -> CheckpointResult<()> {
        let dir = self.thread_dir(&thread.thread_id)?;
        let payload = serde_json::to_vec_pretty(thread)?;

        let lock = self.lock_for(&thread.thread_id);
        let _guard = lock.lock().await;

        fs::create_dir_all(&dir).await?;
        atomic_write(&dir.join(THREAD_FILE), &payload).await?;
        debug!("thread state written");
        Ok(())
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn load_thread(&self, thread_id: &ThreadId) -> CheckpointResult<ConversationThread> {
        let dir = self.require_thread(thread_id).await?;
        let path = dir.join(THREAD_FILE);
        if !exists(&path).await {
            return Err(CheckpointError::ThreadNotFound(thread_id.clone()));
        }
        let raw = fs::read(&path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    #[instrument(
        skip(self, thread, metadata),
        fields(
            thread_id = %thread.thread_id,
            checkpoint_id = %metadata.checkpoint_id,
            step = metadata.step
        )
    )]
    async fn save_checkpoint(
        &self,
        thread: &ConversationThread,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        let record = codec::encode(thread)?;
        self.save_record(&thread.thread_id, RecordKind::Checkpoint, record, metadata)
            .await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    async fn load_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<ExecutionCheckpoint> {
        let (metadata, bytes) = self
            .read_record(thread_id, RecordKind::Checkpoint, checkpoint_id)
            .await?;
        let mut thread: ConversationThread = serde_json::from_slice(&bytes)?;
        thread.active_branch = metadata.branch.clone();
        Ok(ExecutionCheckpoint { metadata, thread })
    }

    #[instrument(
        skip(self, snapshot, metadata),
        fields(thread_id = %snapshot.thread_id, checkpoint_id = %metadata.checkpoint_id)
    )]
    async fn save_snapshot(
        &self,
        snapshot: &ThreadSnapshot,
        metadata: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        let record = codec::encode(snapshot)?;
        self.save_record(&snapshot.thread_id, RecordKind::Snapshot, record, metadata)
            .await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    async fn load_snapshot(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> CheckpointResult<StoredSnapshot> {
        let (metadata, bytes) = self
            .read_record(thread_id, RecordKind::Snapshot, checkpoint_id)
            .await?;
        let mut snapshot: ThreadSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.branch = metadata.branch.clone();
        Ok(StoredSnapshot { metadata, snapshot })
    }

    #[instrument(skip(self, query), fields(thread_id = %thread_id, limit = ?query.limit))]
    async fn get_manifest(
        &self,
        thread_id: &ThreadId,
        query: ManifestQuery,
    ) -> CheckpointResult<Vec<CheckpointMetadata>> {
        let dir = self.require_thread(thread_id).await?;
        let manifest = Self::read_manifest(&dir).await?;
        let entries = manifest.query(&query);
        debug!(count = entries.len(), "manifest loaded");
        Ok(entries)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn prune_snapshots(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> CheckpointResult<Vec<CheckpointId>> {
        self.remove_records(thread_id, RecordKind::Snapshot, |manifest| {
            manifest.prune_plan(RecordKind::Snapshot, keep_count)
        })
        .await
    }

    #[instrument(skip(self, ids), fields(thread_id = %thread_id, requested = ids.len()))]
    async fn delete_snapshots(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>> {
        let ids = ids.to_vec();
        self.remove_records(thread_id, RecordKind::Snapshot, move |_| ids)
            .await
    }

    #[instrument(skip(self, ids), fields(thread_id = %thread_id, requested = ids.len()))]
    async fn delete_checkpoints(
        &self,
        thread_id: &ThreadId,
        ids: &[CheckpointId],
    ) -> CheckpointResult<Vec<CheckpointId>> {
        let ids = ids.to_vec();
        self.remove_records(thread_id, RecordKind::Checkpoint, move |_| ids)
            .await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, from = %from, to = %to))]
    async fn rename_branch(
        &self,
        thread_id: &ThreadId,
        from: &BranchName,
        to: &BranchName,
    ) -> CheckpointResult<usize> {
        let dir = self.require_thread(thread_id).await?;
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut manifest = Self::read_manifest(&dir).await?;
        let renamed = manifest.rename_branch(from, to);
        if renamed > 0 {
            Self::write_manifest(&dir, &manifest).await?;
        }
        Ok(renamed)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, branch = %branch))]
    async fn remove_branch(
        &self,
        thread_id: &ThreadId,
        branch: &BranchName,
    ) -> CheckpointResult<Vec<CheckpointMetadata>> {
        let dir = self.require_thread(thread_id).await?;
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut manifest = Self::read_manifest(&dir).await?;
        let removed = manifest.remove_branch(branch);
        if removed.is_empty() {
            return Ok(removed);
        }
        Self::write_manifest(&dir, &manifest).await?;
        for entry in &removed {
            let path = Self::record_path(&dir, entry.kind(), &entry.checkpoint_id)?;
            remove_file_quietly(&path).await;
        }
        Ok(removed)
    }

    #[instrument(skip(self, write), fields(thread_id = %write.thread_id, call_id = %write.call_id))]
    async fn save_pending_write(&self, write: &PendingWrite) -> CheckpointResult<()> {
        let dir = self.thread_dir(&write.thread_id)?;
        let path = Self::pending_path(&dir, &write.call_id)?;
        let payload = serde_json::to_vec(write)?;

        let lock = self.lock_for(&write.thread_id);
        let _guard = lock.lock().await;

        fs::create_dir_all(dir.join(PENDING_DIR)).await?;
        atomic_write(&path, &payload).await?;
        debug!("pending write recorded");
        Ok(())
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn load_pending_writes(
        &self,
        thread_id: &ThreadId,
    ) -> CheckpointResult<Vec<PendingWrite>> {
        let pending_dir = self.thread_dir(thread_id)?.join(PENDING_DIR);
        if !exists(&pending_dir).await {
            return Ok(Vec::new());
        }

        let mut writes = Vec::new();
        let mut entries = fs::read_dir(&pending_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_pending_file(&name) {
                continue;
            }
            let raw = fs::read(entry.path()).await?;
            let write: PendingWrite = serde_json::from_slice(&raw)?;
            writes.push(write);
        }
        writes.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        debug!(count = writes.len(), "pending writes loaded");
        Ok(writes)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn delete_pending_write(
        &self,
        thread_id: &ThreadId,
        call_id: &str,
    ) -> CheckpointResult<bool> {
        let dir = self.thread_dir(thread_id)?;
        let path = Self::pending_path(&dir, call_id)?;
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn delete_pending_writes(&self, thread_id: &ThreadId) -> CheckpointResult<usize> {
        let pending_dir = self.thread_dir(thread_id)?.join(PENDING_DIR);
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        if !exists(&pending_dir).await {
            return Ok(0);
        }
        let mut removed = 0;
        let mut entries = fs::read_dir(&pending_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if is_pending_file(&entry.file_name().to_string_lossy()) {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        debug!(removed, "pending writes cleared");
        Ok(removed)
    }
}

/// Temp files start with `.` and end in `.tmp`, so they never match.
fn is_pending_file(name: &str) -> bool {
    name.starts_with(PENDING_PREFIX) && name.ends_with(".json")
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Temp file in the same directory, fsync, then rename over the target.
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);

    let mut file = fs::File::create(&temp_path).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(error) = written {
        drop(file);
        remove_file_quietly(&temp_path).await;
        return Err(error);
    }
    drop(file);

    if let Err(error) = fs::rename(&temp_path, path).await {
        remove_file_quietly(&temp_path).await;
        return Err(error);
    }

    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent).await
    {
        let _ = dir.sync_all().await;
    }
    Ok(())
}

async fn remove_file_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = ?path, error = %error, "failed removing file");
    }
}
