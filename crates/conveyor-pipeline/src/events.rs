//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI progress printer, tests) can follow a run without
//! coupling to the engine internals.

use conveyor_types::{RunId, RunStatus, StageStatus};
use serde::{Deserialize, Serialize};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        stage_count: usize,
        resumed: bool,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
    },
    StageStarted {
        run_id: RunId,
        stage: String,
        attempt: u32,
    },
    StageCompleted {
        run_id: RunId,
        stage: String,
        status: StageStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    StageSkipped {
        run_id: RunId,
        stage: String,
        reason: String,
    },
    StepCompleted {
        run_id: RunId,
        stage: String,
        step: String,
        exit_code: i32,
        duration_ms: u64,
    },
    /// A step with a recorded idempotency receipt was not run again.
    StepSkipped {
        run_id: RunId,
        stage: String,
        step: String,
        idempotency_key: String,
    },
    HookFailed {
        run_id: RunId,
        /// `None` for run-level hooks.
        stage: Option<String>,
        hook: String,
        error: String,
    },
    EnvironmentRetrying {
        run_id: RunId,
        stage: String,
        attempt: usize,
        delay_ms: u64,
        error: String,
    },
    CancellationRequested {
        run_id: RunId,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
