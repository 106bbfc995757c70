//! Pipeline definitions, DAG construction, and the execution engine.
//!
//! This crate implements the core Conveyor runner: definition loading and
//! validation, dependency graph ordering, the stage dispatch loop with bounded
//! concurrency, environment provisioning retries, idempotent resume from
//! persisted run state, and content-addressed artifact storage.

pub mod artifacts;
pub mod config;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod events;
pub mod retention;
pub mod retry;
mod stage;
pub mod state;
pub mod transforms;

pub use artifacts::{
    digest_of, run_key, run_owner, ArtifactStore, FsArtifactStore, MemoryArtifactStore,
};
pub use config::{EngineConfig, RetentionPolicy};
pub use dag::{PipelineGraph, StageNode};
pub use definition::{
    ArtifactBinding, CredentialBinding, PipelineDefinition, PostHooks, StageSpec, StepSpec,
};
pub use engine::{PipelineExecutor, RunContext, RunResult};
pub use events::{EventEmitter, PipelineEvent};
pub use retention::{prune, select_expired};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use state::{FsRunStore, MemoryRunStore, RunStateStore};
pub use transforms::{expand_command, expand_variables, template_vars};
