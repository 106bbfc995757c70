use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use conveyor_types::{ConveyorError, RunId};

use crate::environment::{
    EnvHandle, EnvScope, EnvironmentProvisioner, EnvironmentSpec, NetworkPolicy,
    ScopedEnvironment,
};

/// Provisions a fresh workspace directory on the host for each stage.
///
/// Layout: `<root>/<run id>/<stage>-<short id>`. Mounts are exposed as
/// symlinks inside the workspace, so their targets must be relative paths.
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    root: PathBuf,
}

impl LocalProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("run-{}", run_id))
    }

    /// Create the workspace directory only. Shared with the container provisioner,
    /// which bind-mounts it into the container.
    pub(crate) async fn create_workspace(&self, scope: &EnvScope) -> conveyor_types::Result<(String, PathBuf)> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", sanitize(&scope.stage), &short[..8]);
        let workdir = self.run_dir(scope.run_id).join(&id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| ConveyorError::EnvironmentProvision {
                label: scope.label(),
                message: format!("cannot create workspace {}: {}", workdir.display(), e),
                retryable: true,
            })?;
        Ok((id, workdir))
    }

    pub(crate) async fn remove_workspace(&self, workdir: &Path) -> conveyor_types::Result<()> {
        match tokio::fs::remove_dir_all(workdir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn reclaim_workspaces(&self, run_id: RunId) -> conveyor_types::Result<usize> {
        let dir = self.run_dir(run_id);
        let mut count = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(count)
    }
}

#[async_trait]
impl EnvironmentProvisioner for LocalProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        scope: &EnvScope,
    ) -> conveyor_types::Result<ScopedEnvironment> {
        if spec.network() != NetworkPolicy::Default {
            return Err(ConveyorError::EnvironmentProvision {
                label: scope.label(),
                message: format!(
                    "network policy {:?} requires a container image",
                    spec.network()
                ),
                retryable: false,
            });
        }
        if let Some(mount) = spec.mounts.iter().find(|m| m.target.is_absolute()) {
            return Err(ConveyorError::EnvironmentProvision {
                label: scope.label(),
                message: format!(
                    "mount target {} must be relative for a local workspace",
                    mount.target.display()
                ),
                retryable: false,
            });
        }

        let (id, workdir) = self.create_workspace(scope).await?;
        for mount in &spec.mounts {
            if let Err(e) = link_mount(&mount.source, &workdir.join(&mount.target)).await {
                let _ = self.remove_workspace(&workdir).await;
                return Err(ConveyorError::EnvironmentProvision {
                    label: scope.label(),
                    message: format!("cannot mount {}: {}", mount.source.display(), e),
                    retryable: false,
                });
            }
        }

        tracing::debug!(env = %id, workdir = %workdir.display(), "provisioned local workspace");
        Ok(ScopedEnvironment {
            id,
            label: scope.label(),
            spec: spec.clone(),
            workdir,
            handle: EnvHandle::Local,
        })
    }

    async fn release(&self, env: ScopedEnvironment) -> conveyor_types::Result<()> {
        tracing::debug!(env = %env.id, "releasing local workspace");
        self.remove_workspace(&env.workdir).await
    }

    async fn reclaim(&self, run_id: RunId) -> conveyor_types::Result<usize> {
        self.reclaim_workspaces(run_id).await
    }
}

#[cfg(unix)]
async fn link_mount(source: &Path, link: &Path) -> std::io::Result<()> {
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::symlink(source, link).await
}

#[cfg(not(unix))]
async fn link_mount(_source: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "mounts in local workspaces need symlink support",
    ))
}

fn sanitize(stage: &str) -> String {
    stage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Host environment for local step processes, with anything that looks like a
/// credential stripped out. Secrets reach steps only through explicit bindings.
pub(crate) fn filtered_env() -> HashMap<String, String> {
    let exclude_suffixes: &[&str] = &[
        "_api_key",
        "_secret",
        "_token",
        "_password",
        "_credential",
    ];
    let always_include: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR"];

    std::env::vars()
        .filter(|(key, _)| {
            if always_include.contains(&key.as_str()) {
                return true;
            }
            let lower = key.to_lowercase();
            !lower.starts_with("conveyor_secret_")
                && !exclude_suffixes.iter().any(|s| lower.ends_with(s))
        })
        .collect()
}
