use std::path::Path;
use std::time::Duration;

use chronicle_protocol::CheckpointResult;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// When the execution loop should ask for a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// After every loop iteration, including mid-turn ones.
    PerIteration,
    /// Only at clean turn boundaries.
    #[default]
    PerTurn,
    /// Never automatically; callers checkpoint explicitly.
    Manual,
}

/// Which checkpoints survive after a new one lands. Branch heads and fork
/// points are kept regardless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    LatestOnly,
    #[default]
    FullHistory,
    LastN(usize),
    TimeBased { window_secs: u64 },
}

impl RetentionPolicy {
    pub fn time_based(window: Duration) -> Self {
        Self::TimeBased {
            window_secs: window.as_secs(),
        }
    }
}

const DEFAULT_WRITER_IDLE_MS: u64 = 30_000;

fn default_writer_idle_ms() -> u64 {
    DEFAULT_WRITER_IDLE_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableConfig {
    #[serde(default)]
    pub frequency: CheckpointFrequency,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// How long a thread's background writer may sit idle before it exits.
    #[serde(default = "default_writer_idle_ms")]
    pub writer_idle_ms: u64,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self::new(CheckpointFrequency::default(), RetentionPolicy::default())
    }
}

impl DurableConfig {
    pub fn new(frequency: CheckpointFrequency, retention: RetentionPolicy) -> Self {
        Self {
            frequency,
            retention,
            writer_idle_ms: DEFAULT_WRITER_IDLE_MS,
        }
    }

    pub fn with_writer_idle(mut self, idle: Duration) -> Self {
        self.writer_idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn writer_idle(&self) -> Duration {
        Duration::from_millis(self.writer_idle_ms.max(1))
    }

    /// Reads a JSON config file. Missing fields fall back to defaults.
    pub async fn load(path: impl AsRef<Path>) -> CheckpointResult<Self> {
        let raw = fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
