use chronicle_protocol::{CheckpointId, CheckpointMetadata, RecordKind, ThreadId};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Outcome of background persistence work. Emitted after the fact; nothing
/// waits on subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DurabilityEvent {
    CheckpointSaved {
        thread_id: ThreadId,
        metadata: CheckpointMetadata,
    },
    CheckpointFailed {
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        error: String,
        will_retry: bool,
    },
    CheckpointDropped {
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        error: String,
    },
    PendingWriteSaved {
        thread_id: ThreadId,
        call_id: String,
    },
    PendingWriteFailed {
        thread_id: ThreadId,
        call_id: String,
        error: String,
    },
    Pruned {
        thread_id: ThreadId,
        kind: RecordKind,
        removed: Vec<CheckpointId>,
    },
}

impl DurabilityEvent {
    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::CheckpointSaved { thread_id, .. }
            | Self::CheckpointFailed { thread_id, .. }
            | Self::CheckpointDropped { thread_id, .. }
            | Self::PendingWriteSaved { thread_id, .. }
            | Self::PendingWriteFailed { thread_id, .. }
            | Self::Pruned { thread_id, .. } => thread_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurabilityHub {
    sender: broadcast::Sender<DurabilityEvent>,
}

impl DurabilityHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: DurabilityEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DurabilityEvent> {
        self.sender.subscribe()
    }

    /// Lagged subscribers silently skip the events they missed.
    pub fn subscribe_stream(&self) -> BoxStream<'static, DurabilityEvent> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}

impl Default for DurabilityHub {
    fn default() -> Self {
        Self::new(256)
    }
}
