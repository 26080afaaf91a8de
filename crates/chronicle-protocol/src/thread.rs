//! Conversation threads and the records persisted from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BranchName, ThreadId};
use crate::manifest::CheckpointMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool call this message answers or issues, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

/// In-flight execution progress carried only by full checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub iteration: u64,
    /// Opaque to this crate; owned by the middleware pipeline.
    #[serde(default)]
    pub middleware_state: serde_json::Value,
    /// Completed tool-call results not yet folded into messages, by call id.
    #[serde(default)]
    pub pending_tool_results: BTreeMap<String, serde_json::Value>,
}

impl ExecutionState {
    pub fn at_iteration(iteration: u64) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }

    pub fn with_tool_result(
        mut self,
        call_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        self.pending_tool_results.insert(call_id.into(), result);
        self
    }
}

/// The aggregate root. Whoever holds it in memory owns it; persisted copies
/// are point-in-time records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub thread_id: ThreadId,
    pub display_name: String,
    messages: Vec<Message>,
    pub active_branch: BranchName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
    pub created_at: DateTime<Utc>,
}

impl ConversationThread {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(ThreadId::new_uuid(), display_name)
    }

    pub fn with_id(thread_id: ThreadId, display_name: impl Into<String>) -> Self {
        Self {
            thread_id,
            display_name: display_name.into(),
            messages: Vec::new(),
            active_branch: BranchName::main(),
            execution_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Appends and returns the index of the new message.
    pub fn push_message(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn is_mid_execution(&self) -> bool {
        self.execution_state.is_some()
    }

    /// True once the result of `call_id` is part of this thread, either as a
    /// tool message or as a pending result in the execution state.
    pub fn captures_call(&self, call_id: &str) -> bool {
        let in_messages = self
            .messages
            .iter()
            .any(|message| message.call_id.as_deref() == Some(call_id));
        let in_state = self
            .execution_state
            .as_ref()
            .is_some_and(|state| state.pending_tool_results.contains_key(call_id));
        in_messages || in_state
    }
}

/// Lightweight copy used as a fork/copy source. Has no execution state by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub display_name: String,
    pub messages: Vec<Message>,
    pub branch: BranchName,
    pub thread_created_at: DateTime<Utc>,
}

impl ThreadSnapshot {
    pub fn capture(thread: &ConversationThread) -> Self {
        Self {
            thread_id: thread.thread_id.clone(),
            display_name: thread.display_name.clone(),
            messages: thread.messages.clone(),
            branch: thread.active_branch.clone(),
            thread_created_at: thread.created_at,
        }
    }

    /// Rehydrate as a thread with a fresh execution (no state).
    pub fn into_thread(self) -> ConversationThread {
        ConversationThread {
            thread_id: self.thread_id,
            display_name: self.display_name,
            messages: self.messages,
            active_branch: self.branch,
            execution_state: None,
            created_at: self.thread_created_at,
        }
    }
}

/// A full, recoverable record: the thread (execution state included) plus the
/// manifest entry describing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub metadata: CheckpointMetadata,
    pub thread: ConversationThread,
}

impl ExecutionCheckpoint {
    pub fn is_incomplete(&self) -> bool {
        self.metadata.is_incomplete
    }
}

/// A snapshot together with its manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub metadata: CheckpointMetadata,
    pub snapshot: ThreadSnapshot,
}

/// One completed sub-result recorded between full checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub thread_id: ThreadId,
    pub call_id: String,
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn new(thread_id: ThreadId, call_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            thread_id,
            call_id: call_id.into(),
            result,
            recorded_at: Utc::now(),
        }
    }
}
