use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use conveyor_types::RunId;
use serde::{Deserialize, Serialize};

/// Working directory of the stage workspace inside a container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Network access granted to an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Whatever the provisioner gives by default (bridge network for containers).
    #[default]
    Default,
    /// No network access.
    #[serde(rename = "none")]
    Isolated,
    /// Share the host network.
    Host,
}

/// A host path made visible inside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Declared execution environment for a stage or for the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSpec {
    /// Container image. Without one the stage runs in a local workspace directory.
    pub image: Option<String>,
    pub mounts: Vec<Mount>,
    pub network: Option<NetworkPolicy>,
    /// Plain (non-secret) variables exported to every step.
    pub variables: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    pub fn network(&self) -> NetworkPolicy {
        self.network.unwrap_or_default()
    }

    /// Layer `overrides` on top of `self`: image and network replace, mounts
    /// append, variables merge with the override winning.
    pub fn merged_with(&self, overrides: &EnvironmentSpec) -> EnvironmentSpec {
        let mut merged = self.clone();
        if overrides.image.is_some() {
            merged.image = overrides.image.clone();
        }
        if overrides.network.is_some() {
            merged.network = overrides.network;
        }
        merged.mounts.extend(overrides.mounts.iter().cloned());
        merged.variables.extend(
            overrides
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }
}

/// Identifies who an environment is provisioned for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvScope {
    pub run_id: RunId,
    pub stage: String,
}

impl EnvScope {
    pub fn new(run_id: RunId, stage: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("run-{}/{}", self.run_id, self.stage)
    }
}

/// How steps reach the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvHandle {
    /// Steps run as host processes inside `workdir`.
    Local,
    /// Steps run through `<runtime> exec` in a long-lived container.
    Container {
        runtime: String,
        container_id: String,
    },
}

/// A provisioned environment. Not `Clone`: handing it to
/// [`EnvironmentProvisioner::release`] consumes it, so it is released at most once.
#[derive(Debug)]
pub struct ScopedEnvironment {
    pub id: String,
    pub label: String,
    pub spec: EnvironmentSpec,
    /// Host directory holding the stage workspace.
    pub workdir: PathBuf,
    pub handle: EnvHandle,
}

/// Acquires and tears down isolated execution environments.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        scope: &EnvScope,
    ) -> conveyor_types::Result<ScopedEnvironment>;

    async fn release(&self, env: ScopedEnvironment) -> conveyor_types::Result<()>;

    /// Tear down anything a crashed process left behind for `run_id`.
    /// Returns how many environments were removed.
    async fn reclaim(&self, _run_id: RunId) -> conveyor_types::Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_image_and_network() {
        let base = EnvironmentSpec {
            image: Some("rust:1.80".into()),
            network: Some(NetworkPolicy::Default),
            ..Default::default()
        };
        let stage = EnvironmentSpec {
            image: Some("sonar-scanner:5".into()),
            network: Some(NetworkPolicy::Isolated),
            ..Default::default()
        };
        let merged = base.merged_with(&stage);
        assert_eq!(merged.image.as_deref(), Some("sonar-scanner:5"));
        assert_eq!(merged.network(), NetworkPolicy::Isolated);
    }

    #[test]
    fn merge_keeps_base_when_override_is_empty() {
        let base = EnvironmentSpec {
            image: Some("rust:1.80".into()),
            ..Default::default()
        };
        let merged = base.merged_with(&EnvironmentSpec::default());
        assert_eq!(merged, base);
    }

    #[test]
    fn merge_appends_mounts_and_merges_variables() {
        let mut base = EnvironmentSpec::default();
        base.variables.insert("PROFILE".into(), "release".into());
        base.variables.insert("REGION".into(), "eu".into());
        base.mounts.push(Mount {
            source: "/cache/cargo".into(),
            target: "/root/.cargo".into(),
            read_only: false,
        });

        let mut stage = EnvironmentSpec::default();
        stage.variables.insert("REGION".into(), "us".into());
        stage.mounts.push(Mount {
            source: "/var/run/docker.sock".into(),
            target: "/var/run/docker.sock".into(),
            read_only: true,
        });

        let merged = base.merged_with(&stage);
        assert_eq!(merged.mounts.len(), 2);
        assert_eq!(merged.variables["PROFILE"], "release");
        assert_eq!(merged.variables["REGION"], "us");
    }

    #[test]
    fn network_policy_none_serializes_as_none() {
        assert_eq!(
            serde_json::to_string(&NetworkPolicy::Isolated).unwrap(),
            "\"none\""
        );
        let parsed: NetworkPolicy = serde_json::from_str("\"host\"").unwrap();
        assert_eq!(parsed, NetworkPolicy::Host);
    }

    #[test]
    fn scope_label_names_run_and_stage() {
        let scope = EnvScope::new(RunId(12), "Build");
        assert_eq!(scope.label(), "run-12/Build");
    }
}
