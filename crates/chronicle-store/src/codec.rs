use chronicle_protocol::{
    CheckpointError, CheckpointId, CheckpointMetadata, CheckpointResult, RecordKind, ThreadId,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialized record payload plus its integrity hash.
pub(crate) struct EncodedRecord {
    pub bytes: Vec<u8>,
    pub hash: String,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> CheckpointResult<EncodedRecord> {
    let bytes = serde_json::to_vec(value)?;
    let hash = sha256_hex(&bytes);
    Ok(EncodedRecord { bytes, hash })
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fills in the fields the store owns.
pub(crate) fn stamp(metadata: &mut CheckpointMetadata, record: &EncodedRecord, kind: RecordKind) {
    metadata.payload_size = record.bytes.len() as u64;
    metadata.payload_hash = Some(record.hash.clone());
    metadata.is_snapshot = kind == RecordKind::Snapshot;
    if metadata.is_snapshot {
        metadata.is_incomplete = false;
    }
}

pub(crate) fn verify(
    thread_id: &ThreadId,
    metadata: &CheckpointMetadata,
    bytes: &[u8],
) -> CheckpointResult<()> {
    let Some(expected) = metadata.payload_hash.as_deref() else {
        return Ok(());
    };
    let actual = sha256_hex(bytes);
    if actual != expected {
        return Err(CheckpointError::Corrupted {
            thread_id: thread_id.clone(),
            checkpoint_id: metadata.checkpoint_id.clone(),
            reason: format!("payload hash mismatch: expected {expected}, found {actual}"),
        });
    }
    Ok(())
}

pub(crate) fn duplicate_record(kind: RecordKind, checkpoint_id: &CheckpointId) -> CheckpointError {
    CheckpointError::Validation(format!(
        "{} {checkpoint_id} already exists; record ids are write-once",
        kind.file_prefix()
    ))
}

pub(crate) fn not_found(
    kind: RecordKind,
    thread_id: &ThreadId,
    checkpoint_id: &CheckpointId,
) -> CheckpointError {
    match kind {
        RecordKind::Checkpoint => CheckpointError::CheckpointNotFound {
            thread_id: thread_id.clone(),
            checkpoint_id: checkpoint_id.clone(),
        },
        RecordKind::Snapshot => CheckpointError::SnapshotNotFound {
            thread_id: thread_id.clone(),
            checkpoint_id: checkpoint_id.clone(),
        },
    }
}
