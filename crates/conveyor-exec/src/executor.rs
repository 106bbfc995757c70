//! Step executor trait and the registry that maps executor kinds to implementations.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::environment::ScopedEnvironment;
use crate::secrets::SecretBindings;
use crate::shell::ShellExecutor;

// ---------------------------------------------------------------------------
// CommandSpec / StepOutput
// ---------------------------------------------------------------------------

/// What a step asks its executor to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub run: String,
    /// Interpreter override. Defaults to `bash` locally and `sh` in containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Relative to the stage workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: i32,
    /// Combined stdout then stderr, unredacted.
    pub output: String,
    pub duration_ms: u64,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Runs one step's command inside a provisioned environment.
///
/// A non-zero exit is reported through [`StepOutput::exit_code`]; `Err` is
/// reserved for the executor itself failing (spawn errors and the like).
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The executor kind steps select with `uses` (e.g. `"shell"`).
    fn kind(&self) -> &str;

    async fn run(
        &self,
        command: &CommandSpec,
        env: &ScopedEnvironment,
        secrets: &SecretBindings,
    ) -> conveyor_types::Result<StepOutput>;
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: impl StepExecutor + 'static) {
        let kind = executor.kind().to_string();
        self.executors.insert(kind, Arc::new(executor));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Registry with the built-in executors.
pub fn default_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(ShellExecutor::new());
    registry
}
