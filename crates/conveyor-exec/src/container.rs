use std::path::PathBuf;

use async_trait::async_trait;
use conveyor_types::{ConveyorError, RunId};
use tokio::process::Command;

use crate::environment::{
    EnvHandle, EnvScope, EnvironmentProvisioner, EnvironmentSpec, NetworkPolicy,
    ScopedEnvironment, CONTAINER_WORKDIR,
};
use crate::local_env::LocalProvisioner;

const RUN_LABEL: &str = "conveyor.run";
const STAGE_LABEL: &str = "conveyor.stage";

/// Provisions one long-lived container per stage through a docker-compatible CLI.
///
/// The stage workspace is a host directory (created the same way as
/// [`LocalProvisioner`] does) bind-mounted at [`CONTAINER_WORKDIR`]. Steps are
/// then run with `<runtime> exec`. Containers carry the run id as a label so
/// that leftovers of a crashed process can be found and removed.
#[derive(Debug, Clone)]
pub struct ContainerProvisioner {
    runtime: String,
    workspaces: LocalProvisioner,
}

impl ContainerProvisioner {
    pub fn new(runtime: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            workspaces: LocalProvisioner::new(workspace_root),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Arguments for `<runtime> run` that start the stage container.
    pub fn run_args(
        &self,
        image: &str,
        spec: &EnvironmentSpec,
        scope: &EnvScope,
        workdir: &std::path::Path,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            format!("{}={}", RUN_LABEL, scope.run_id),
            "--label".to_string(),
            format!("{}={}", STAGE_LABEL, scope.stage),
            "-v".to_string(),
            format!("{}:{}", workdir.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];

        match spec.network() {
            NetworkPolicy::Default => {}
            NetworkPolicy::Isolated => {
                args.push("--network".to_string());
                args.push("none".to_string());
            }
            NetworkPolicy::Host => {
                args.push("--network".to_string());
                args.push("host".to_string());
            }
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            let mut volume = format!("{}:{}", mount.source.display(), mount.target.display());
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push(volume);
        }

        for (key, value) in &spec.variables {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(image.to_string());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }

    async fn remove_container(&self, container_id: &str) -> conveyor_types::Result<()> {
        let output = Command::new(&self.runtime)
            .args(["rm", "-f", container_id])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConveyorError::Other(format!(
                "failed to remove container {}: {}",
                container_id,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EnvironmentProvisioner for ContainerProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        scope: &EnvScope,
    ) -> conveyor_types::Result<ScopedEnvironment> {
        let image = spec
            .image
            .as_deref()
            .ok_or_else(|| ConveyorError::EnvironmentProvision {
                label: scope.label(),
                message: "container environment needs an image".into(),
                retryable: false,
            })?;

        let (id, workdir) = self.workspaces.create_workspace(scope).await?;
        let args = self.run_args(image, spec, scope, &workdir);

        let output = match Command::new(&self.runtime).args(&args).output().await {
            Ok(output) => output,
            Err(e) => {
                let _ = self.workspaces.remove_workspace(&workdir).await;
                return Err(ConveyorError::EnvironmentProvision {
                    label: scope.label(),
                    message: format!("container runtime '{}' unavailable: {}", self.runtime, e),
                    retryable: false,
                });
            }
        };

        if !output.status.success() {
            let _ = self.workspaces.remove_workspace(&workdir).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConveyorError::EnvironmentProvision {
                label: scope.label(),
                message: format!("failed to start {}: {}", image, stderr.trim()),
                retryable: true,
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(env = %id, container = %container_id, image, "provisioned container");

        Ok(ScopedEnvironment {
            id,
            label: scope.label(),
            spec: spec.clone(),
            workdir,
            handle: EnvHandle::Container {
                runtime: self.runtime.clone(),
                container_id,
            },
        })
    }

    async fn release(&self, env: ScopedEnvironment) -> conveyor_types::Result<()> {
        let removed = match &env.handle {
            EnvHandle::Container { container_id, .. } => self.remove_container(container_id).await,
            EnvHandle::Local => Ok(()),
        };
        self.workspaces.remove_workspace(&env.workdir).await?;
        removed
    }

    async fn reclaim(&self, run_id: RunId) -> conveyor_types::Result<usize> {
        let filter = format!("label={}={}", RUN_LABEL, run_id);
        let output = Command::new(&self.runtime)
            .args(["ps", "-aq", "--filter", &filter])
            .output()
            .await;

        let mut count = 0;
        match output {
            Ok(output) if output.status.success() => {
                let ids = String::from_utf8_lossy(&output.stdout).to_string();
                for container_id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match self.remove_container(container_id).await {
                        Ok(()) => count += 1,
                        Err(e) => tracing::warn!(container = container_id, error = %e, "reclaim failed"),
                    }
                }
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(run = %run_id, stderr = %stderr.trim(), "container listing failed");
            }
            Err(e) => {
                tracing::debug!(run = %run_id, error = %e, "container runtime unavailable for reclaim");
            }
        }

        self.workspaces.reclaim_workspaces(run_id).await?;
        Ok(count)
    }
}
