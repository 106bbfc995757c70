//! Engine configuration.
//!
//! [`EngineConfig`] is an explicit, immutable value handed to the engine. Every
//! field has a default, so a config file only needs the options it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conveyor_types::{ConveyorError, Result};
use serde::{Deserialize, Serialize};

use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of stages in flight at once.
    pub concurrency_limit: usize,
    /// Applied to stages without their own `timeout`.
    #[serde(with = "conveyor_types::duration_serde::option")]
    pub default_stage_timeout: Option<Duration>,
    /// Extra provisioning attempts after a retryable failure.
    pub provision_retries: usize,
    pub provision_backoff: BackoffPolicy,
    /// Characters of stage output kept on the run record.
    pub output_tail_chars: usize,
    /// How often the store is polled for cancel markers.
    #[serde(with = "conveyor_types::duration_serde")]
    pub cancel_poll_interval: Duration,
    pub state_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub workspace_root: PathBuf,
    /// Docker-compatible CLI used for container environments.
    pub container_runtime: String,
    /// Named service URLs, available to commands as `${endpoint.<name>}`.
    pub endpoints: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            default_stage_timeout: None,
            provision_retries: 3,
            provision_backoff: BackoffPolicy::default(),
            output_tail_chars: 4000,
            cancel_poll_interval: Duration::from_millis(500),
            state_dir: PathBuf::from(".conveyor/state"),
            artifact_dir: PathBuf::from(".conveyor/artifacts"),
            workspace_root: PathBuf::from(".conveyor/workspaces"),
            container_runtime: "docker".to_string(),
            endpoints: BTreeMap::new(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)
            .map_err(|e| ConveyorError::Validation(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(ConveyorError::Validation(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.cancel_poll_interval.is_zero() {
            return Err(ConveyorError::Validation(
                "cancel_poll_interval must be positive".into(),
            ));
        }
        if self.container_runtime.trim().is_empty() {
            return Err(ConveyorError::Validation(
                "container_runtime must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Which terminal runs `prune` keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many terminal runs (newest first).
    pub keep_last: Option<usize>,
    /// Drop terminal runs that finished longer ago than this.
    #[serde(with = "conveyor_types::duration_serde::option")]
    pub max_age: Option<Duration>,
}
