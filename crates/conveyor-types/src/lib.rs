//! Shared types, errors, and run records for the Conveyor pipeline engine.
//!
//! This crate provides the foundational types used across all other Conveyor crates:
//! - `ConveyorError`: unified error taxonomy
//! - `Run` / `StageResult`: persisted execution records and their status machines
//! - `ArtifactRef`: content-addressed reference to a stored artifact
//! - `duration_serde`: human-readable duration strings for definitions and config

pub mod duration_serde;
pub mod run;

pub use run::{
    ArtifactRef, FailureKind, Run, RunId, RunStatus, SkipReason, StageError, StageResult,
    StageStatus,
};

/// Unified error type for all Conveyor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    // === Definition Errors ===
    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    // === Execution Errors ===
    #[error("Failed to provision environment for '{label}': {message}")]
    EnvironmentProvision {
        label: String,
        message: String,
        retryable: bool,
    },

    #[error("Stage '{stage}' failed ({kind}): {message}")]
    StageExecution {
        stage: String,
        kind: FailureKind,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Executor '{executor}' error: {message}")]
    Executor { executor: String, message: String },

    #[error("Cancellation requested")]
    Cancelled,

    // === Storage Errors ===
    #[error("Artifact '{key}' not found")]
    ArtifactNotFound { key: String },

    #[error("Secret '{credential}' could not be resolved")]
    SecretNotFound { credential: String },

    #[error("Run state persistence failed: {0}")]
    Persistence(String),

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Invalid transition for '{subject}': {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConveyorError {
    /// A step of `stage` exited non-zero.
    pub fn step_failure(stage: &str, step: &str, exit_code: i32) -> Self {
        ConveyorError::StageExecution {
            stage: stage.to_string(),
            kind: FailureKind::StepFailure,
            message: format!("step '{}' exited with code {}", step, exit_code),
            exit_code: Some(exit_code),
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConveyorError::EnvironmentProvision {
                retryable: true,
                ..
            }
        )
    }

    /// Returns `true` for errors raised while checking a definition, before anything ran.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConveyorError::Validation(_) | ConveyorError::CyclicDependency { .. }
        )
    }

    /// The failure kind recorded on a stage when this error ends it.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ConveyorError::StageExecution { kind, .. } => *kind,
            ConveyorError::EnvironmentProvision { .. } => FailureKind::Provision,
            ConveyorError::ArtifactNotFound { .. } => FailureKind::ArtifactMissing,
            ConveyorError::SecretNotFound { .. } => FailureKind::SecretMissing,
            ConveyorError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Executor,
        }
    }

    /// Convert into the serializable error recorded on a [`StageResult`].
    ///
    /// Stage execution errors keep their own message and exit code, since the
    /// stage name is already on the result.
    pub fn to_stage_error(&self) -> StageError {
        if let ConveyorError::StageExecution {
            kind,
            message,
            exit_code,
            ..
        } = self
        {
            return StageError {
                kind: *kind,
                message: message.clone(),
                exit_code: *exit_code,
            };
        }
        StageError {
            kind: self.failure_kind(),
            message: self.to_string(),
            exit_code: None,
        }
    }
}

/// A convenience alias for `Result<T, ConveyorError>`.
pub type Result<T> = std::result::Result<T, ConveyorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_validation() {
        let err = ConveyorError::Validation("duplicate stage 'Build'".into());
        assert_eq!(
            err.to_string(),
            "Pipeline validation failed: duplicate stage 'Build'"
        );
    }

    #[test]
    fn error_display_cycle_names_every_hop() {
        let err = ConveyorError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: A -> B -> A");
    }

    #[test]
    fn error_display_stage_execution() {
        let err = ConveyorError::StageExecution {
            stage: "Build".into(),
            kind: FailureKind::Timeout,
            message: "exceeded 30s".into(),
            exit_code: None,
        };
        assert_eq!(err.to_string(), "Stage 'Build' failed (timeout): exceeded 30s");
    }

    #[test]
    fn step_failure_keeps_exit_code_on_stage_error() {
        let err = ConveyorError::step_failure("Build", "compile", 2);
        assert_eq!(
            err.to_string(),
            "Stage 'Build' failed (step_failure): step 'compile' exited with code 2"
        );
        assert_eq!(err.failure_kind(), FailureKind::StepFailure);

        let recorded = err.to_stage_error();
        assert_eq!(recorded.kind, FailureKind::StepFailure);
        assert_eq!(recorded.message, "step 'compile' exited with code 2");
        assert_eq!(recorded.exit_code, Some(2));
    }

    #[test]
    fn error_display_run_not_found() {
        let err = ConveyorError::RunNotFound(RunId(42));
        assert_eq!(err.to_string(), "Run 42 not found");
    }

    #[test]
    fn retryable_only_when_provision_flagged() {
        let transient = ConveyorError::EnvironmentProvision {
            label: "build".into(),
            message: "daemon busy".into(),
            retryable: true,
        };
        let permanent = ConveyorError::EnvironmentProvision {
            label: "build".into(),
            message: "unsupported network policy".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!ConveyorError::Cancelled.is_retryable());
        assert!(!ConveyorError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn validation_category() {
        assert!(ConveyorError::Validation("x".into()).is_validation());
        assert!(ConveyorError::CyclicDependency { cycle: vec![] }.is_validation());
        assert!(!ConveyorError::Cancelled.is_validation());
    }

    #[test]
    fn failure_kind_mapping() {
        let provision = ConveyorError::EnvironmentProvision {
            label: "x".into(),
            message: "y".into(),
            retryable: true,
        };
        assert_eq!(provision.failure_kind(), FailureKind::Provision);
        assert_eq!(
            ConveyorError::ArtifactNotFound { key: "dist".into() }.failure_kind(),
            FailureKind::ArtifactMissing
        );
        assert_eq!(
            ConveyorError::SecretNotFound {
                credential: "registry".into()
            }
            .failure_kind(),
            FailureKind::SecretMissing
        );
        assert_eq!(ConveyorError::Cancelled.failure_kind(), FailureKind::Cancelled);
        assert_eq!(
            ConveyorError::Other("boom".into()).failure_kind(),
            FailureKind::Executor
        );
    }

    #[test]
    fn to_stage_error_carries_message() {
        let err = ConveyorError::ArtifactNotFound { key: "report".into() };
        let stage_err = err.to_stage_error();
        assert_eq!(stage_err.kind, FailureKind::ArtifactMissing);
        assert_eq!(stage_err.message, "Artifact 'report' not found");
        assert_eq!(stage_err.exit_code, None);
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConveyorError = io_err.into();
        assert!(matches!(err, ConveyorError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ConveyorError = json_err.into();
        assert!(matches!(err, ConveyorError::Json(_)));
    }
}
