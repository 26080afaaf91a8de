//! Read-only branch view derived from a manifest.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::{BranchName, CheckpointId, ThreadId};
use crate::manifest::{CheckpointMetadata, Manifest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    pub checkpoint_id: CheckpointId,
    pub branch: BranchName,
    /// Fork origin for fork entries, the previous record on the same branch
    /// otherwise, `None` for the root.
    pub parent: Option<CheckpointId>,
    pub message_index: usize,
    pub has_snapshot: bool,
    pub has_checkpoint: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub name: BranchName,
    pub head: CheckpointId,
    /// Record this branch was forked from; `None` for a root branch.
    pub fork_point: Option<CheckpointId>,
    /// Message index at which the branch's first record was taken.
    pub divergence_index: usize,
    pub entry_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchTree {
    pub thread_id: ThreadId,
    pub root_checkpoint_id: Option<CheckpointId>,
    pub active_branch: BranchName,
    /// Keyed by checkpoint id, in creation order. A checkpoint and a snapshot
    /// sharing an id collapse into one node.
    pub nodes: IndexMap<CheckpointId, BranchNode>,
    pub branches: Vec<BranchSummary>,
}

impl BranchTree {
    pub fn from_manifest(
        thread_id: ThreadId,
        active_branch: BranchName,
        manifest: &Manifest,
    ) -> Self {
        let mut nodes: IndexMap<CheckpointId, BranchNode> = IndexMap::new();
        let mut last_on_branch: IndexMap<BranchName, CheckpointId> = IndexMap::new();

        for entry in manifest.entries() {
            if let Some(node) = nodes.get_mut(&entry.checkpoint_id) {
                node.has_snapshot |= entry.is_snapshot;
                node.has_checkpoint |= !entry.is_snapshot;
                continue;
            }
            let parent = entry
                .parent_checkpoint_id
                .clone()
                .or_else(|| last_on_branch.get(&entry.branch).cloned());
            last_on_branch.insert(entry.branch.clone(), entry.checkpoint_id.clone());
            nodes.insert(entry.checkpoint_id.clone(), node_for(entry, parent));
        }

        let branches = manifest
            .branches()
            .into_iter()
            .filter_map(|name| summarize(manifest, name))
            .collect();

        Self {
            thread_id,
            root_checkpoint_id: manifest.entries().first().map(|entry| entry.checkpoint_id.clone()),
            active_branch,
            nodes,
            branches,
        }
    }

    pub fn branch(&self, name: &BranchName) -> Option<&BranchSummary> {
        self.branches.iter().find(|branch| branch.name == *name)
    }

    /// Branches whose divergence point is at or before `message_index`.
    pub fn variants_at(&self, message_index: usize) -> Vec<BranchSummary> {
        self.branches
            .iter()
            .filter(|branch| branch.divergence_index <= message_index)
            .cloned()
            .collect()
    }

    /// Walks parents from `checkpoint_id` back to the root.
    pub fn lineage(&self, checkpoint_id: &CheckpointId) -> Vec<CheckpointId> {
        let mut lineage = Vec::new();
        let mut cursor = Some(checkpoint_id.clone());
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            if lineage.contains(&id) {
                break;
            }
            lineage.push(id);
            cursor = node.parent.clone();
        }
        lineage
    }
}

fn node_for(entry: &CheckpointMetadata, parent: Option<CheckpointId>) -> BranchNode {
    BranchNode {
        checkpoint_id: entry.checkpoint_id.clone(),
        branch: entry.branch.clone(),
        parent,
        message_index: entry.message_index,
        has_snapshot: entry.is_snapshot,
        has_checkpoint: !entry.is_snapshot,
        created_at: entry.created_at,
    }
}

fn summarize(manifest: &Manifest, name: BranchName) -> Option<BranchSummary> {
    let origin = manifest.branch_origin(&name)?;
    let head = manifest.branch_head(&name)?;
    Some(BranchSummary {
        head: head.checkpoint_id.clone(),
        fork_point: origin.parent_checkpoint_id.clone(),
        divergence_index: if origin.parent_checkpoint_id.is_some() {
            origin.message_index
        } else {
            0
        },
        entry_count: manifest.entries().iter().filter(|entry| entry.branch == name).count(),
        name,
    })
}
