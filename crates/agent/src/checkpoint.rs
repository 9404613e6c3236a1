//! Chunk accumulation and checkpoint scheduling for streamed AI output.
//!
//! Content is persisted every N chunks or every interval, whichever comes
//! first, so the stored copy stays fresh without a write per chunk.

use inkwell_config::StreamingConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub every_chunks: usize,
    pub interval: Duration,
}

impl CheckpointPolicy {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            every_chunks: config.checkpoint_every_chunks.max(1),
            interval: Duration::from_millis(config.checkpoint_interval_ms),
        }
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_chunks: 10,
            interval: Duration::from_secs(2),
        }
    }
}

/// In-memory buffer for one streaming step.
#[derive(Debug)]
pub struct StreamAccumulator {
    policy: CheckpointPolicy,
    content: String,
    chunks: usize,
    since_checkpoint: usize,
    last_checkpoint: Instant,
}

impl StreamAccumulator {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            content: String::new(),
            chunks: 0,
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        }
    }

    /// Append a chunk. Returns `true` when a checkpoint is due.
    pub fn push(&mut self, chunk: &str) -> bool {
        self.content.push_str(chunk);
        self.chunks += 1;
        self.since_checkpoint += 1;
        self.since_checkpoint >= self.policy.every_chunks || self.last_checkpoint.elapsed() >= self.policy.interval
    }

    pub fn mark_checkpointed(&mut self) {
        self.since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn into_content(self) -> String {
        self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn checkpoints_every_n_chunks() {
        let mut acc = StreamAccumulator::new(CheckpointPolicy {
            every_chunks: 3,
            interval: Duration::from_secs(60),
        });
        let due: Vec<bool> = (0..7)
            .map(|i| {
                let due = acc.push(&i.to_string());
                if due {
                    acc.mark_checkpointed();
                }
                due
            })
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
        assert_eq!(acc.content(), "0123456");
        assert_eq!(acc.chunk_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_after_interval() {
        let mut acc = StreamAccumulator::new(CheckpointPolicy::default());
        assert!(!acc.push("a"));
        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(acc.push("b"));
        acc.mark_checkpointed();
        assert!(!acc.push("c"));
        assert_eq!(acc.into_content(), "abc");
    }
}
