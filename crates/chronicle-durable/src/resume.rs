use chronicle_protocol::{
    CheckpointError, CheckpointResult, ConversationThread, ExecutionCheckpoint, Message,
    PendingWrite,
};

/// What `resume_from_latest` found: the newest checkpoint on the active
/// branch plus any sub-results recorded after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub checkpoint: ExecutionCheckpoint,
    pub pending_writes: Vec<PendingWrite>,
}

impl ResumePoint {
    pub fn is_incomplete(&self) -> bool {
        self.checkpoint.is_incomplete()
    }

    pub fn thread(&self) -> &ConversationThread {
        &self.checkpoint.thread
    }

    /// Pending writes whose results the checkpoint has not captured yet.
    pub fn uncaptured_writes(&self) -> impl Iterator<Item = &PendingWrite> {
        self.pending_writes
            .iter()
            .filter(|write| !self.checkpoint.thread.captures_call(&write.call_id))
    }

    /// Turns the resume point into the thread the loop should run next.
    ///
    /// An incomplete checkpoint continues its interrupted iteration: new input
    /// is rejected, and uncaptured pending writes are folded into the
    /// execution state so completed tool calls are not re-run. A complete
    /// checkpoint starts a new turn with `input` appended, if given.
    pub fn begin(self, input: Option<Message>) -> CheckpointResult<ConversationThread> {
        let Self {
            checkpoint,
            pending_writes,
        } = self;
        let mut thread = checkpoint.thread;

        if checkpoint.metadata.is_incomplete {
            if input.is_some() {
                return Err(CheckpointError::Validation(format!(
                    "checkpoint {} is mid-execution; finish the interrupted iteration \
                     before adding input",
                    checkpoint.metadata.checkpoint_id
                )));
            }
            let uncaptured: Vec<PendingWrite> = pending_writes
                .into_iter()
                .filter(|write| !thread.captures_call(&write.call_id))
                .collect();
            let state = thread.execution_state.get_or_insert_with(Default::default);
            for write in uncaptured {
                state.pending_tool_results.insert(write.call_id, write.result);
            }
            return Ok(thread);
        }

        if let Some(message) = input {
            thread.push_message(message);
        }
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_protocol::{CheckpointId, CheckpointMetadata, CheckpointSource, ExecutionState};
    use serde_json::json;

    fn resume_point(incomplete: bool) -> ResumePoint {
        let mut thread = ConversationThread::new("resume");
        thread.push_message(Message::user("run the tests"));
        if incomplete {
            thread.execution_state = Some(ExecutionState::at_iteration(1));
        }
        let metadata = CheckpointMetadata::for_checkpoint(
            &thread,
            CheckpointId::from("c1"),
            CheckpointSource::Loop,
            1,
        );
        let pending = PendingWrite::new(thread.thread_id.clone(), "tool-A", json!({"exit": 0}));
        ResumePoint {
            checkpoint: ExecutionCheckpoint { metadata, thread },
            pending_writes: vec![pending],
        }
    }

    #[test]
    fn incomplete_rejects_new_input() {
        let error = resume_point(true)
            .begin(Some(Message::user("something else")))
            .unwrap_err();
        assert!(matches!(error, CheckpointError::Validation(_)));
    }

    #[test]
    fn incomplete_continues_with_pending_results_folded_in() {
        let point = resume_point(true);
        assert_eq!(point.uncaptured_writes().count(), 1);

        let thread = point.begin(None).unwrap();
        let state = thread.execution_state.unwrap();
        assert_eq!(state.iteration, 1);
        assert_eq!(state.pending_tool_results["tool-A"], json!({"exit": 0}));
    }

    #[test]
    fn complete_starts_a_new_turn() {
        let thread = resume_point(false)
            .begin(Some(Message::user("next question")))
            .unwrap();
        assert_eq!(thread.message_count(), 2);
        assert!(thread.execution_state.is_none());
    }
}
