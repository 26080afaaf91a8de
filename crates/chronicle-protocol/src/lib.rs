//! # chronicle-protocol: shared contract for durable agent sessions
//!
//! Data model, manifest rules and the storage port used by the store
//! backends, the durable execution engine and the branching engine.
//!
//! No tokio runtime and no filesystem access: backends and engines live in
//! their own crates.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (ThreadId, CheckpointId, BranchName)
//! - [`thread`]: ConversationThread, ExecutionState, ThreadSnapshot, ExecutionCheckpoint,
//!   PendingWrite
//! - [`manifest`]: CheckpointMetadata, Manifest ordering and protection rules
//! - [`tree`]: BranchTree, the read-only branch view
//! - [`ports`]: CheckpointStore, the storage boundary
//! - [`error`]: CheckpointError, CheckpointResult

pub mod error;
pub mod ids;
pub mod manifest;
pub mod ports;
pub mod thread;
pub mod tree;

pub use error::{CheckpointError, CheckpointResult};
pub use ids::{BranchName, CheckpointId, ThreadId, validate_path_segment};
pub use manifest::{CheckpointMetadata, CheckpointSource, Manifest, ManifestQuery, RecordKind};
pub use ports::CheckpointStore;
pub use thread::{
    ConversationThread, ExecutionCheckpoint, ExecutionState, Message, MessageRole, PendingWrite,
    StoredSnapshot, ThreadSnapshot,
};
pub use tree::{BranchNode, BranchSummary, BranchTree};
