use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use conveyor_types::ConveyorError;
use tokio::process::Command;

use crate::environment::{EnvHandle, ScopedEnvironment, CONTAINER_WORKDIR};
use crate::executor::{CommandSpec, StepExecutor, StepOutput};
use crate::local_env::filtered_env;
use crate::secrets::SecretBindings;

/// The built-in `shell` executor.
///
/// Locally the command runs as `bash -c` in its own process group inside the
/// stage workspace. In a container it runs as `<runtime> exec ... sh -c`.
/// Secret values are handed over through the environment of the spawned
/// process only, never on a command line.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    fn local_command(
        &self,
        command: &CommandSpec,
        env: &ScopedEnvironment,
        secrets: &SecretBindings,
    ) -> Command {
        let shell = command.shell.as_deref().unwrap_or("bash");
        let cwd = match &command.working_dir {
            Some(dir) => env.workdir.join(dir),
            None => env.workdir.clone(),
        };

        let mut cmd = Command::new(shell);
        cmd.args(["-c", command.run.as_str()])
            .current_dir(cwd)
            .env_clear()
            .envs(filtered_env())
            .envs(&env.spec.variables)
            .envs(&command.env)
            .envs(secrets.iter_env());

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }

    fn container_command(
        &self,
        runtime: &str,
        container_id: &str,
        command: &CommandSpec,
        secrets: &SecretBindings,
    ) -> Command {
        let shell = command.shell.as_deref().unwrap_or("sh");
        let cwd = match &command.working_dir {
            Some(dir) => Path::new(CONTAINER_WORKDIR).join(dir),
            None => PathBuf::from(CONTAINER_WORKDIR),
        };

        let mut cmd = Command::new(runtime);
        cmd.arg("exec").arg("-w").arg(cwd);
        for (key, value) in &command.env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        // `-e NAME` without a value copies NAME from the exec process environment.
        for name in secrets.names() {
            cmd.arg("-e").arg(name);
        }
        cmd.envs(secrets.iter_env());
        cmd.arg(container_id).args([shell, "-c", command.run.as_str()]);
        cmd
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    fn kind(&self) -> &str {
        "shell"
    }

    async fn run(
        &self,
        command: &CommandSpec,
        env: &ScopedEnvironment,
        secrets: &SecretBindings,
    ) -> conveyor_types::Result<StepOutput> {
        let mut cmd = match &env.handle {
            EnvHandle::Local => self.local_command(command, env, secrets),
            EnvHandle::Container {
                runtime,
                container_id,
            } => self.container_command(runtime, container_id, command, secrets),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = tokio::time::Instant::now();
        let child = cmd.spawn().map_err(|e| ConveyorError::Executor {
            executor: "shell".into(),
            message: format!("failed to spawn: {}", e),
        })?;

        // Dropping this future (stage timeout or cancellation) kills the whole group.
        let mut guard = ProcessGroupGuard::new(child.id(), matches!(env.handle, EnvHandle::Local));
        let output = child.wait_with_output().await?;
        guard.disarm();

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(StepOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Sends SIGKILL to a local step's process group unless disarmed.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>, local: bool) -> Self {
        Self {
            pid: if local { pid } else { None },
        }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid.take() {
                tracing::debug!(pid, "killing step process group");
                // SAFETY: plain syscall on a pgid we created with process_group(0).
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentSpec, ScopedEnvironment};
    use crate::secrets::SecretValue;
    use std::time::Duration;

    fn local_env(dir: &Path) -> ScopedEnvironment {
        ScopedEnvironment {
            id: "test".into(),
            label: "run-1/Test".into(),
            spec: EnvironmentSpec::default(),
            workdir: dir.to_path_buf(),
            handle: EnvHandle::Local,
        }
    }

    #[tokio::test]
    async fn runs_in_workspace_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = local_env(dir.path());
        let out = ShellExecutor::new()
            .run(
                &CommandSpec::new("echo hello > greeting.txt; cat greeting.txt; echo oops >&2"),
                &env,
                &SecretBindings::new(),
            )
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.output, "hello\noops\n");
        assert!(dir.path().join("greeting.txt").exists());
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellExecutor::new()
            .run(&CommandSpec::new("exit 3"), &local_env(dir.path()), &SecretBindings::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn environment_layers_reach_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = local_env(dir.path());
        env.spec.variables.insert("STAGE_VAR".into(), "from-env".into());

        let mut command = CommandSpec::new("echo $STAGE_VAR $STEP_VAR $TOKEN");
        command.env.insert("STEP_VAR".into(), "from-step".into());
        let mut secrets = SecretBindings::new();
        secrets.insert("TOKEN", SecretValue::new("t0k3n"));

        let out = ShellExecutor::new().run(&command, &env, &secrets).await.unwrap();
        assert_eq!(out.output.trim(), "from-env from-step t0k3n");
    }

    #[tokio::test]
    async fn working_dir_is_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut command = CommandSpec::new("pwd");
        command.working_dir = Some("sub".into());

        let out = ShellExecutor::new()
            .run(&command, &local_env(dir.path()), &SecretBindings::new())
            .await
            .unwrap();
        assert!(out.output.trim().ends_with("sub"));
    }

    #[tokio::test]
    async fn missing_shell_is_executor_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = CommandSpec::new("true");
        command.shell = Some("conveyor-no-such-shell".into());
        let err = ShellExecutor::new()
            .run(&command, &local_env(dir.path()), &SecretBindings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Executor { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_the_run_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let env = local_env(dir.path());
        let command = CommandSpec::new("sleep 0.5; touch late.txt");
        let executor = ShellExecutor::new();

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            executor.run(&command, &env, &SecretBindings::new()),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!dir.path().join("late.txt").exists());
    }
}
