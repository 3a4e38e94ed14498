//! # Batch envelope
//!
//! A [`Batch`] is the unit of work the processor commits or rolls back as a whole.
//! It carries identity (batch, channel, nodes), phase timers and the flags the
//! processor consults before, during and after loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Phase timed on a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    /// Reading rows from the source
    Read,
    /// Writing rows to the target
    Write,
    /// Writer filters
    Filter,
    /// Column transforms
    Transform,
}

/// Accumulated time per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimers {
    read: Duration,
    write: Duration,
    filter: Duration,
    transform: Duration,
}

impl PhaseTimers {
    fn slot(&mut self, phase: BatchPhase) -> &mut Duration {
        match phase {
            BatchPhase::Read => &mut self.read,
            BatchPhase::Write => &mut self.write,
            BatchPhase::Filter => &mut self.filter,
            BatchPhase::Transform => &mut self.transform,
        }
    }

    /// Time spent in a phase
    pub fn get(&self, phase: BatchPhase) -> Duration {
        match phase {
            BatchPhase::Read => self.read,
            BatchPhase::Write => self.write,
            BatchPhase::Filter => self.filter,
            BatchPhase::Transform => self.transform,
        }
    }
}

/// Unit of work
#[derive(Debug, Clone)]
pub struct Batch {
    /// Batch identifier, unique per source node
    pub batch_id: i64,
    /// Channel the batch was captured on
    pub channel_id: String,
    /// Node the batch came from
    pub source_node_id: Option<String>,
    /// Node the batch is loaded into
    pub target_node_id: Option<String>,
    /// Lines read so far
    pub line_count: u64,
    /// The reader reached the batch terminator
    pub complete: bool,
    /// A listener or conflict rule skipped the batch
    pub ignored: bool,
    /// A previous attempt partially failed in a way that cannot be replayed
    pub invalid_for_retry: bool,
    /// Rows come from an extraction shared by several target nodes
    pub common_flag: bool,
    extract: bool,
    timers: PhaseTimers,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Batch {
    /// Create a batch for loading
    pub fn new(batch_id: i64, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            channel_id: channel_id.into(),
            source_node_id: None,
            target_node_id: None,
            line_count: 0,
            complete: false,
            ignored: false,
            invalid_for_retry: false,
            common_flag: false,
            extract: false,
            timers: PhaseTimers::default(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Create a batch produced by the extraction side
    pub fn from_extract(batch_id: i64, channel_id: impl Into<String>) -> Self {
        Self {
            extract: true,
            ..Self::new(batch_id, channel_id)
        }
    }

    /// Set source and target nodes
    pub fn with_nodes(
        mut self,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
    ) -> Self {
        self.source_node_id = Some(source_node_id.into());
        self.target_node_id = Some(target_node_id.into());
        self
    }

    /// Mark whether the reader reached the batch terminator
    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    /// Mark the batch as not safely replayable
    pub fn with_invalid_for_retry(mut self, invalid: bool) -> Self {
        self.invalid_for_retry = invalid;
        self
    }

    /// Produced by the extraction side
    pub fn is_extract(&self) -> bool {
        self.extract
    }

    /// `source-batch_id`, or the bare id when the source node is unknown
    pub fn node_batch_id(&self) -> String {
        match &self.source_node_id {
            Some(node) => format!("{}-{}", node, self.batch_id),
            None => self.batch_id.to_string(),
        }
    }

    /// Add elapsed time to a phase
    pub fn add_elapsed(&mut self, phase: BatchPhase, elapsed: Duration) {
        *self.timers.slot(phase) += elapsed;
    }

    /// Phase timers
    pub fn timers(&self) -> &PhaseTimers {
        &self.timers
    }

    /// Wall-clock start
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the batch was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Count one line read
    pub fn increment_line_count(&mut self) {
        self.line_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_defaults() {
        let batch = Batch::new(42, "default");
        assert_eq!(batch.batch_id, 42);
        assert!(!batch.complete);
        assert!(!batch.is_extract());
        assert_eq!(batch.node_batch_id(), "42");

        let batch = Batch::from_extract(7, "default").with_nodes("corp", "store-1");
        assert!(batch.is_extract());
        assert_eq!(batch.node_batch_id(), "corp-7");
    }

    #[test]
    fn test_phase_timers() {
        let mut batch = Batch::new(1, "default");
        batch.add_elapsed(BatchPhase::Read, Duration::from_millis(5));
        batch.add_elapsed(BatchPhase::Read, Duration::from_millis(7));
        batch.add_elapsed(BatchPhase::Write, Duration::from_millis(3));
        assert_eq!(batch.timers().get(BatchPhase::Read), Duration::from_millis(12));
        assert_eq!(batch.timers().get(BatchPhase::Write), Duration::from_millis(3));
        assert_eq!(batch.timers().get(BatchPhase::Filter), Duration::ZERO);
    }
}
