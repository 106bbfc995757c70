//! Pipeline definition model and loaders.
//!
//! A [`PipelineDefinition`] is the parsed, immutable description of a pipeline.
//! It is loaded from JSON or YAML and compiled into a
//! [`PipelineGraph`](crate::dag::PipelineGraph) before anything runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conveyor_exec::{CommandSpec, EnvironmentSpec};
use conveyor_types::{ConveyorError, Result};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_uses() -> String {
    "shell".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    /// Named parameters available to command templates as `${name}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Environment every stage starts from.
    #[serde(default)]
    pub environment: EnvironmentSpec,
    /// Run-level hooks, executed once after every stage is terminal.
    #[serde(default, skip_serializing_if = "PostHooks::is_empty")]
    pub post: PostHooks,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Merged over the pipeline environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentSpec>,
    #[serde(default, skip_serializing_if = "PostHooks::is_empty")]
    pub post: PostHooks,
    /// Explicit dependencies. `None` chains the stage after the previous one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// A failed blocking stage halts dispatch of everything not yet started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
    /// A failed stage that is not required does not fail the run.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default,
        with = "conveyor_types::duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            environment: None,
            post: PostHooks::default(),
            depends_on: None,
            blocking: None,
            required: true,
            enabled: true,
            timeout: None,
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Executor kind, resolved through the `ExecutorRegistry`.
    #[serde(default = "default_uses")]
    pub uses: String,
    #[serde(flatten)]
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<ArtifactBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<ArtifactBinding>,
    /// Once a step with this key succeeds, re-dispatches of the stage skip it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl StepSpec {
    pub fn shell(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uses: default_uses(),
            command: CommandSpec::new(run),
            credentials: Vec::new(),
            produces: Vec::new(),
            consumes: Vec::new(),
            idempotency_key: None,
        }
    }
}

/// Exposes credential `id` to the step as environment variable `env`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub id: String,
    pub env: String,
}

/// A named artifact and the workspace-relative file it is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBinding {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostHooks {
    pub always: Vec<StepSpec>,
    pub success: Vec<StepSpec>,
    pub failure: Vec<StepSpec>,
}

impl PostHooks {
    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.success.is_empty() && self.failure.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &StepSpec> {
        self.always
            .iter()
            .chain(self.success.iter())
            .chain(self.failure.iter())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PipelineDefinition {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| ConveyorError::Validation(format!("invalid pipeline JSON: {}", e)))
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        serde_yaml::from_str(source)
            .map_err(|e| ConveyorError::Validation(format!("invalid pipeline YAML: {}", e)))
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&source),
            Some("json") => Self::from_json_str(&source),
            _ => Err(ConveyorError::Validation(format!(
                "unsupported pipeline file '{}': expected .json, .yaml or .yml",
                path.display()
            ))),
        }
    }

    /// Rebuild a definition from the copy stored on a run record.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ConveyorError::Validation(format!("stored definition is invalid: {}", e)))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Effective environment of a stage: the pipeline binding with the
    /// stage override merged on top.
    pub fn stage_environment(&self, stage: &StageSpec) -> EnvironmentSpec {
        match &stage.environment {
            Some(overrides) => self.environment.merged_with(overrides),
            None => self.environment.clone(),
        }
    }
}
