use std::collections::HashMap;

use chronicle_protocol::{CheckpointError, CheckpointResult, ThreadId};
use parking_lot::Mutex;

/// Advisory per-thread lock. Acquisition never waits: a second branch
/// operation on a busy thread fails instead of queueing behind the first.
#[derive(Debug, Default)]
pub(crate) struct ThreadLocks {
    held: Mutex<HashMap<ThreadId, &'static str>>,
}

impl ThreadLocks {
    pub fn try_acquire(
        &self,
        thread_id: &ThreadId,
        operation: &'static str,
    ) -> CheckpointResult<ThreadLockGuard<'_>> {
        let mut held = self.held.lock();
        if let Some(running) = held.get(thread_id) {
            return Err(CheckpointError::ConcurrentModification(format!(
                "cannot {operation} thread {thread_id}: {running} in progress"
            )));
        }
        held.insert(thread_id.clone(), operation);
        Ok(ThreadLockGuard {
            locks: self,
            thread_id: thread_id.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, thread_id: &ThreadId) -> bool {
        self.held.lock().contains_key(thread_id)
    }
}

pub(crate) struct ThreadLockGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: ThreadId,
}

impl Drop for ThreadLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.thread_id);
    }
}
