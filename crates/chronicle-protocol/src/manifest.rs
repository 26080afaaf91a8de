//! Per-thread manifest: the ordered index of every checkpoint and snapshot.
//!
//! The manifest is the only structure scanned to answer "what exists"; record
//! payloads are never loaded for it. Entries are kept oldest-first in memory
//! and on disk, and returned newest-first from [`Manifest::query`].
//!
//! A record is identified by `(checkpoint_id, kind)`: saving a snapshot under
//! the id of an existing checkpoint is how a checkpoint is made forkable.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, CheckpointResult};
use crate::ids::{BranchName, CheckpointId};
use crate::thread::{ConversationThread, ThreadSnapshot};

/// Who asked for a record to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Automatic checkpoint from the execution loop.
    Loop,
    /// Direct user action.
    User,
    /// Created by a fork or copy.
    Fork,
    /// Requested by the application layer.
    Application,
    /// Explicit caller request outside the frequency policy.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Checkpoint,
    Snapshot,
}

impl RecordKind {
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Checkpoint => "ckpt",
            Self::Snapshot => "snap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub source: CheckpointSource,
    pub step: u64,
    /// Number of messages captured; the next message appended would get this index.
    pub message_index: usize,
    pub branch: BranchName,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload_size: u64,
    pub is_snapshot: bool,
    pub is_incomplete: bool,
    /// Record this entry was forked from. Only set on fork entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<CheckpointId>,
    /// Hex SHA-256 of the stored record bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
}

impl CheckpointMetadata {
    pub fn for_checkpoint(
        thread: &ConversationThread,
        checkpoint_id: CheckpointId,
        source: CheckpointSource,
        step: u64,
    ) -> Self {
        Self {
            checkpoint_id,
            source,
            step,
            message_index: thread.message_count(),
            branch: thread.active_branch.clone(),
            created_at: Utc::now(),
            payload_size: 0,
            is_snapshot: false,
            is_incomplete: thread.is_mid_execution(),
            parent_checkpoint_id: None,
            payload_hash: None,
        }
    }

    pub fn for_snapshot(
        snapshot: &ThreadSnapshot,
        checkpoint_id: CheckpointId,
        source: CheckpointSource,
        step: u64,
    ) -> Self {
        Self {
            checkpoint_id,
            source,
            step,
            message_index: snapshot.messages.len(),
            branch: snapshot.branch.clone(),
            created_at: Utc::now(),
            payload_size: 0,
            is_snapshot: true,
            is_incomplete: false,
            parent_checkpoint_id: None,
            payload_hash: None,
        }
    }

    pub fn with_parent(mut self, parent: CheckpointId) -> Self {
        self.parent_checkpoint_id = Some(parent);
        self
    }

    pub fn kind(&self) -> RecordKind {
        if self.is_snapshot {
            RecordKind::Snapshot
        } else {
            RecordKind::Checkpoint
        }
    }
}

/// Filter for [`Manifest::query`]. Results are always newest-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only entries created strictly before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordKind>,
}

impl ManifestQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<CheckpointMetadata>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a manifest from entries in any order, e.g. a newest-first
    /// query result.
    pub fn from_entries(mut entries: Vec<CheckpointMetadata>) -> Self {
        entries.sort_by_key(|entry| entry.created_at);
        Self { entries }
    }

    /// Oldest-first.
    pub fn entries(&self) -> &[CheckpointMetadata] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry, clamping its timestamp so the manifest stays strictly
    /// ordered by creation time. Returns the entry as stored.
    pub fn append(
        &mut self,
        mut entry: CheckpointMetadata,
    ) -> CheckpointResult<CheckpointMetadata> {
        if self.find(&entry.checkpoint_id, entry.kind()).is_some() {
            return Err(CheckpointError::Validation(format!(
                "{:?} {} already exists in manifest",
                entry.kind(),
                entry.checkpoint_id
            )));
        }
        if let Some(last) = self.entries.last()
            && entry.created_at <= last.created_at
        {
            entry.created_at = last.created_at + Duration::microseconds(1);
        }
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn find(
        &self,
        checkpoint_id: &CheckpointId,
        kind: RecordKind,
    ) -> Option<&CheckpointMetadata> {
        self.entries
            .iter()
            .find(|entry| entry.kind() == kind && entry.checkpoint_id == *checkpoint_id)
    }

    pub fn query(&self, query: &ManifestQuery) -> Vec<CheckpointMetadata> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| query.kind.is_none_or(|kind| entry.kind() == kind))
            .filter(|entry| query.before.is_none_or(|before| entry.created_at < before))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Newest entry of `kind`, optionally restricted to one branch.
    pub fn latest(
        &self,
        kind: RecordKind,
        branch: Option<&BranchName>,
    ) -> Option<&CheckpointMetadata> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.kind() == kind)
            .find(|entry| branch.is_none_or(|branch| entry.branch == *branch))
    }

    /// Branch labels in order of first appearance.
    pub fn branches(&self) -> Vec<BranchName> {
        self.entries
            .iter()
            .map(|entry| entry.branch.clone())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn contains_branch(&self, branch: &BranchName) -> bool {
        self.entries.iter().any(|entry| entry.branch == *branch)
    }

    /// Newest entry of any kind on `branch`.
    pub fn branch_head(&self, branch: &BranchName) -> Option<&CheckpointMetadata> {
        self.entries.iter().rev().find(|entry| entry.branch == *branch)
    }

    /// Oldest entry on `branch`: where the branch diverged.
    pub fn branch_origin(&self, branch: &BranchName) -> Option<&CheckpointMetadata> {
        self.entries.iter().find(|entry| entry.branch == *branch)
    }

    /// Ids referenced as a fork parent by some entry.
    pub fn fork_points(&self) -> HashSet<CheckpointId> {
        self.entries
            .iter()
            .filter_map(|entry| entry.parent_checkpoint_id.clone())
            .collect()
    }

    /// Entries of `kind` that pruning and deletion must skip: every branch
    /// head of that kind, and every fork point.
    pub fn protected_ids(&self, kind: RecordKind) -> HashSet<CheckpointId> {
        let mut protected = self.fork_points();
        let mut seen_branches = HashSet::new();
        for entry in self.entries.iter().rev().filter(|entry| entry.kind() == kind) {
            if seen_branches.insert(entry.branch.clone()) {
                protected.insert(entry.checkpoint_id.clone());
            }
        }
        protected
    }

    /// Ids of `kind` that fall outside the newest `keep_count`, minus protected ones.
    pub fn prune_plan(&self, kind: RecordKind, keep_count: usize) -> Vec<CheckpointId> {
        let protected = self.protected_ids(kind);
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.kind() == kind)
            .skip(keep_count)
            .filter(|entry| !protected.contains(&entry.checkpoint_id))
            .map(|entry| entry.checkpoint_id.clone())
            .collect()
    }

    /// Ids of `kind` created before `cutoff`. The newest entry of the kind and
    /// protected entries are always kept.
    pub fn expired_plan(&self, kind: RecordKind, cutoff: DateTime<Utc>) -> Vec<CheckpointId> {
        let protected = self.protected_ids(kind);
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.kind() == kind)
            .skip(1)
            .filter(|entry| entry.created_at < cutoff)
            .filter(|entry| !protected.contains(&entry.checkpoint_id))
            .map(|entry| entry.checkpoint_id.clone())
            .collect()
    }

    /// Removes the listed entries of `kind`, skipping protected ones.
    /// Returns the ids actually removed, oldest-first.
    pub fn remove(&mut self, kind: RecordKind, ids: &[CheckpointId]) -> Vec<CheckpointId> {
        let protected = self.protected_ids(kind);
        let requested: HashSet<&CheckpointId> = ids.iter().collect();
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let drop = entry.kind() == kind
                && requested.contains(&entry.checkpoint_id)
                && !protected.contains(&entry.checkpoint_id);
            if drop {
                removed.push(entry.checkpoint_id.clone());
            }
            !drop
        });
        removed
    }

    /// Relabels every entry on `from`. Returns the number of entries changed.
    pub fn rename_branch(&mut self, from: &BranchName, to: &BranchName) -> usize {
        let mut renamed = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.branch == *from) {
            entry.branch = to.clone();
            renamed += 1;
        }
        renamed
    }

    /// Removes every entry on `branch` regardless of protection.
    pub fn remove_branch(&mut self, branch: &BranchName) -> Vec<CheckpointMetadata> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.branch == *branch);
        self.entries = kept;
        removed
    }

    /// Other branches whose fork origin is a record on `branch`.
    pub fn dependent_branches(&self, branch: &BranchName) -> Vec<BranchName> {
        let own_ids: HashSet<&CheckpointId> = self
            .entries
            .iter()
            .filter(|entry| entry.branch == *branch)
            .map(|entry| &entry.checkpoint_id)
            .collect();
        self.entries
            .iter()
            .filter(|entry| entry.branch != *branch)
            .filter(|entry| {
                entry
                    .parent_checkpoint_id
                    .as_ref()
                    .is_some_and(|parent| own_ids.contains(parent))
            })
            .map(|entry| entry.branch.clone())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }
}
