use std::path::PathBuf;

use async_trait::async_trait;
use conveyor_types::RunId;

use crate::container::ContainerProvisioner;
use crate::environment::{
    EnvHandle, EnvScope, EnvironmentProvisioner, EnvironmentSpec, ScopedEnvironment,
};
use crate::local_env::LocalProvisioner;

/// Picks the container provisioner when the environment names an image and the local
/// workspace provisioner otherwise.
#[derive(Debug, Clone)]
pub struct DefaultProvisioner {
    local: LocalProvisioner,
    container: ContainerProvisioner,
}

impl DefaultProvisioner {
    pub fn new(workspace_root: impl Into<PathBuf>, container_runtime: impl Into<String>) -> Self {
        let root = workspace_root.into();
        Self {
            local: LocalProvisioner::new(root.clone()),
            container: ContainerProvisioner::new(container_runtime, root),
        }
    }
}

#[async_trait]
impl EnvironmentProvisioner for DefaultProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        scope: &EnvScope,
    ) -> conveyor_types::Result<ScopedEnvironment> {
        if spec.image.is_some() {
            self.container.provision(spec, scope).await
        } else {
            self.local.provision(spec, scope).await
        }
    }

    async fn release(&self, env: ScopedEnvironment) -> conveyor_types::Result<()> {
        match env.handle {
            EnvHandle::Container { .. } => self.container.release(env).await,
            EnvHandle::Local => self.local.release(env).await,
        }
    }

    async fn reclaim(&self, run_id: RunId) -> conveyor_types::Result<usize> {
        // The container side also sweeps the shared workspace directory.
        self.container.reclaim(run_id).await
    }
}
