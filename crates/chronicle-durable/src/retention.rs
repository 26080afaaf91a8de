use chrono::{DateTime, Duration, Utc};
use chronicle_protocol::{CheckpointId, CheckpointMetadata};

use crate::config::RetentionPolicy;

/// Checkpoint ids a policy would remove, given checkpoint entries newest-first.
/// The store still skips protected entries.
pub(crate) fn plan(
    policy: RetentionPolicy,
    newest_first: &[CheckpointMetadata],
    now: DateTime<Utc>,
) -> Vec<CheckpointId> {
    match policy {
        RetentionPolicy::FullHistory => Vec::new(),
        RetentionPolicy::LatestOnly => keep_newest(newest_first, 1),
        RetentionPolicy::LastN(keep) => keep_newest(newest_first, keep),
        RetentionPolicy::TimeBased { window_secs } => {
            let cutoff = i64::try_from(window_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            newest_first
                .iter()
                .skip(1)
                .filter(|entry| entry.created_at < cutoff)
                .map(|entry| entry.checkpoint_id.clone())
                .collect()
        }
    }
}

pub(crate) fn keep_newest(newest_first: &[CheckpointMetadata], keep: usize) -> Vec<CheckpointId> {
    newest_first
        .iter()
        .skip(keep)
        .map(|entry| entry.checkpoint_id.clone())
        .collect()
}
