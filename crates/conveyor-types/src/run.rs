//! Persisted run and stage records.
//!
//! A [`Run`] owns exactly one [`StageResult`] per stage of its pipeline. Status
//! changes go through the `mark_*` methods so that illegal transitions (and any
//! mutation of a terminal run) are rejected instead of silently applied.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConveyorError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Monotonic run number, the build-number analog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('#');
        trimmed
            .parse::<u64>()
            .map(RunId)
            .map_err(|_| ConveyorError::Other(format!("invalid run id '{}'", s)))
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage ended without running its steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The stage is disabled in the definition. Dependents still run.
    Disabled,
    /// A (transitive) dependency failed or was itself skipped.
    DependencyFailed { dependency: String },
    /// A blocking stage failed and the run stopped dispatching.
    Halted { by: String },
    /// The run was cancelled before the stage was dispatched.
    Cancelled,
}

impl SkipReason {
    /// Skipped-by-policy stages count as satisfied for dependents and for the run outcome.
    pub fn is_policy(&self) -> bool {
        matches!(self, SkipReason::Disabled)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not succeed", dependency)
            }
            SkipReason::Halted { by } => write!(f, "run halted by blocking stage '{}'", by),
            SkipReason::Cancelled => f.write_str("run cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step exited non-zero.
    StepFailure,
    /// The stage exceeded its wall-clock timeout.
    Timeout,
    /// The step executor itself failed (spawn error, panic, unknown executor).
    Executor,
    /// The environment could not be provisioned.
    Provision,
    /// A consumed or produced artifact was missing.
    ArtifactMissing,
    /// A required credential could not be resolved.
    SecretMissing,
    /// The run was cancelled while the stage was in flight.
    Cancelled,
}

impl FailureKind {
    /// Failures caused by the engine's surroundings rather than the pipeline's own work.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            FailureKind::Executor
                | FailureKind::Provision
                | FailureKind::ArtifactMissing
                | FailureKind::SecretMissing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::StepFailure => "step_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Executor => "executor",
            FailureKind::Provision => "provision",
            FailureKind::ArtifactMissing => "artifact_missing",
            FailureKind::SecretMissing => "secret_missing",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

/// Content-addressed reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    /// Lowercase hex SHA-256 of the content.
    pub digest: String,
    pub size: u64,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{}@sha256:{}", self.key, short)
    }
}

// ---------------------------------------------------------------------------
// StageResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    /// Number of times the stage has been dispatched (re-dispatch after a crash increments it).
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Tail of the captured output, secrets masked.
    #[serde(default)]
    pub output_tail: String,
    /// Full captured log, stored in the artifact store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<String>,
}

impl StageResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            output_tail: String::new(),
            log: None,
            error: None,
            skip_reason: None,
            hook_failures: Vec::new(),
        }
    }

    fn reject(&self, to: StageStatus) -> ConveyorError {
        ConveyorError::InvalidTransition {
            subject: format!("stage '{}'", self.name),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Pending -> Running. Increments the attempt counter.
    pub fn mark_running(&mut self) -> Result<()> {
        if self.status != StageStatus::Pending {
            return Err(self.reject(StageStatus::Running));
        }
        self.status = StageStatus::Running;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.error = None;
        self.hook_failures.clear();
        Ok(())
    }

    /// Running -> Succeeded.
    pub fn mark_succeeded(&mut self) -> Result<()> {
        if self.status != StageStatus::Running {
            return Err(self.reject(StageStatus::Succeeded));
        }
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Failed.
    pub fn mark_failed(&mut self, error: StageError) -> Result<()> {
        if self.status != StageStatus::Running {
            return Err(self.reject(StageStatus::Failed));
        }
        self.status = StageStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending -> Skipped.
    pub fn mark_skipped(&mut self, reason: SkipReason) -> Result<()> {
        if self.status != StageStatus::Pending {
            return Err(self.reject(StageStatus::Skipped));
        }
        self.status = StageStatus::Skipped;
        self.skip_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Pending, used when resuming a run whose process died mid-stage.
    pub fn reset_interrupted(&mut self) -> Result<()> {
        if self.status != StageStatus::Running {
            return Err(self.reject(StageStatus::Pending));
        }
        self.status = StageStatus::Pending;
        self.finished_at = None;
        Ok(())
    }

    /// True when dependents may start: Succeeded, or Skipped by policy.
    pub fn is_satisfied(&self) -> bool {
        match self.status {
            StageStatus::Succeeded => true,
            StageStatus::Skipped => self.skip_reason.as_ref().is_some_and(SkipReason::is_policy),
            _ => false,
        }
    }

    /// True when dependents must be skipped: Failed, or Skipped for any non-policy reason.
    pub fn blocks_dependents(&self) -> bool {
        self.status.is_terminal() && !self.is_satisfied()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline: String,
    /// The definition this run executes, kept so the run can be resumed.
    pub definition: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageResult>,
    /// Artifacts produced so far, keyed by artifact name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    /// Idempotency keys of steps that have completed successfully.
    #[serde(default)]
    pub receipts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<String>,
}

impl Run {
    pub fn new<I, S>(
        id: RunId,
        pipeline: impl Into<String>,
        definition: serde_json::Value,
        stage_names: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut run = Self {
            id,
            pipeline: pipeline.into(),
            definition,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stages: Vec::new(),
            artifacts: BTreeMap::new(),
            receipts: BTreeSet::new(),
            hook_failures: Vec::new(),
        };
        for name in stage_names {
            run.ensure_stage(name.into());
        }
        run
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn guard_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                subject: format!("run {}", self.id),
                from: self.status.to_string(),
                to: "modified".into(),
            });
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Result<&mut StageResult> {
        self.guard_mutable()?;
        let run_id = self.id;
        self.stages
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ConveyorError::Other(format!("run {} has no stage '{}'", run_id, name)))
    }

    /// Add a Pending entry for `name` unless one already exists.
    pub fn ensure_stage(&mut self, name: String) {
        if self.stage(&name).is_none() {
            self.stages.push(StageResult::pending(name));
        }
    }

    /// Pending/Running -> Running.
    pub fn start(&mut self) -> Result<()> {
        self.guard_mutable()?;
        self.status = RunStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to a terminal status. After this the run can no longer change.
    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.guard_mutable()?;
        if !status.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                subject: format!("run {}", self.id),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_artifact(&mut self, name: impl Into<String>, artifact: ArtifactRef) -> Result<()> {
        self.guard_mutable()?;
        self.artifacts.insert(name.into(), artifact);
        Ok(())
    }

    pub fn record_receipt(&mut self, key: impl Into<String>) -> Result<()> {
        self.guard_mutable()?;
        self.receipts.insert(key.into());
        Ok(())
    }

    pub fn record_hook_failure(&mut self, message: impl Into<String>) -> Result<()> {
        self.guard_mutable()?;
        self.hook_failures.push(message.into());
        Ok(())
    }

    /// The first failed stage in declaration order.
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::new(
            RunId(7),
            "deploy",
            serde_json::json!({"name": "deploy"}),
            ["Checkout", "Build"],
        )
    }

    #[test]
    fn run_id_parses_with_or_without_hash() {
        assert_eq!("12".parse::<RunId>().unwrap(), RunId(12));
        assert_eq!("#12".parse::<RunId>().unwrap(), RunId(12));
        assert!("twelve".parse::<RunId>().is_err());
    }

    #[test]
    fn run_id_serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&RunId(3)).unwrap(), "3");
    }

    #[test]
    fn new_run_has_one_pending_entry_per_stage() {
        let mut run = sample_run();
        run.ensure_stage("Build".into());
        assert_eq!(run.stages.len(), 2);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[test]
    fn stage_lifecycle_success() {
        let mut stage = StageResult::pending("Build");
        stage.mark_running().unwrap();
        assert_eq!(stage.attempt, 1);
        assert!(stage.started_at.is_some());
        stage.mark_succeeded().unwrap();
        assert_eq!(stage.status, StageStatus::Succeeded);
        assert!(stage.is_satisfied());
        assert!(!stage.blocks_dependents());
    }

    #[test]
    fn stage_cannot_succeed_without_running() {
        let mut stage = StageResult::pending("Build");
        let err = stage.mark_succeeded().unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[test]
    fn skipped_by_policy_satisfies_dependents() {
        let mut stage = StageResult::pending("Lint");
        stage.mark_skipped(SkipReason::Disabled).unwrap();
        assert!(stage.is_satisfied());
        assert!(!stage.blocks_dependents());
    }

    #[test]
    fn skipped_by_failure_blocks_dependents() {
        let mut stage = StageResult::pending("Publish");
        stage
            .mark_skipped(SkipReason::DependencyFailed {
                dependency: "Build".into(),
            })
            .unwrap();
        assert!(!stage.is_satisfied());
        assert!(stage.blocks_dependents());
    }

    #[test]
    fn failed_stage_records_error() {
        let mut stage = StageResult::pending("Build");
        stage.mark_running().unwrap();
        stage
            .mark_failed(ConveyorError::step_failure("Build", "compile", 2).to_stage_error())
            .unwrap();
        let err = stage.error.as_ref().unwrap();
        assert_eq!(err.kind, FailureKind::StepFailure);
        assert_eq!(err.exit_code, Some(2));
        assert!(stage.blocks_dependents());
    }

    #[test]
    fn interrupted_stage_resets_and_increments_attempt_on_redispatch() {
        let mut stage = StageResult::pending("Build");
        stage.mark_running().unwrap();
        stage.reset_interrupted().unwrap();
        assert_eq!(stage.status, StageStatus::Pending);
        stage.mark_running().unwrap();
        assert_eq!(stage.attempt, 2);
    }

    #[test]
    fn terminal_run_is_immutable() {
        let mut run = sample_run();
        run.start().unwrap();
        run.finish(RunStatus::Succeeded).unwrap();

        assert!(run.start().is_err());
        assert!(run.finish(RunStatus::Failed).is_err());
        assert!(run.stage_mut("Build").is_err());
        assert!(run.record_receipt("push").is_err());
    }

    #[test]
    fn finish_requires_terminal_status() {
        let mut run = sample_run();
        assert!(run.finish(RunStatus::Running).is_err());
    }

    #[test]
    fn first_failure_follows_declaration_order() {
        let mut run = sample_run();
        run.start().unwrap();
        for name in ["Checkout", "Build"] {
            let stage = run.stage_mut(name).unwrap();
            stage.mark_running().unwrap();
            stage
                .mark_failed(ConveyorError::step_failure(name, "make", 1).to_stage_error())
                .unwrap();
        }
        assert_eq!(run.first_failure().unwrap().name, "Checkout");
    }

    #[test]
    fn artifact_ref_display_shortens_digest() {
        let artifact = ArtifactRef {
            key: "dist".into(),
            digest: "0123456789abcdef0123".into(),
            size: 10,
        };
        assert_eq!(artifact.to_string(), "dist@sha256:0123456789ab");
    }

    #[test]
    fn status_serialization_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Aborted).unwrap(),
            "\"aborted\""
        );
        assert_eq!(
            serde_json::to_string(&StageStatus::Skipped).unwrap(),
            "\"skipped\""
        );
        assert_eq!(
            serde_json::to_string(&FailureKind::ArtifactMissing).unwrap(),
            "\"artifact_missing\""
        );
    }

    #[test]
    fn skip_reason_serializes_with_tag() {
        let json = serde_json::to_value(SkipReason::DependencyFailed {
            dependency: "Build".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"reason": "dependency_failed", "dependency": "Build"})
        );
    }

    #[test]
    fn run_round_trips_through_json() {
        let mut run = sample_run();
        run.start().unwrap();
        run.record_receipt("push-manifest").unwrap();
        let json = serde_json::to_string(&run).unwrap();
        let restored: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, run);
    }

    #[test]
    fn infrastructure_kinds() {
        assert!(FailureKind::Provision.is_infrastructure());
        assert!(FailureKind::Executor.is_infrastructure());
        assert!(!FailureKind::StepFailure.is_infrastructure());
        assert!(!FailureKind::Timeout.is_infrastructure());
        assert!(!FailureKind::Cancelled.is_infrastructure());
    }
}
