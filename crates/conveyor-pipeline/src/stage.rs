//! A single stage attempt: acquire an environment, run steps, run hooks, release.
//!
//! Stage tasks never touch the run record. Receipts and produced artifacts are
//! streamed back to the dispatch loop as [`StageProgress`] messages the moment
//! they exist, and the attempt ends with one [`StageReport`].
//!
//! Steps run in their own task so that a timeout can abort the in-flight step
//! and an executor panic surfaces as a `JoinError`. Either way the environment
//! is still held here and gets released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor_exec::{
    truncate_tail, EnvScope, EnvironmentProvisioner, EnvironmentSpec, ExecutorRegistry,
    ScopedEnvironment, SecretBindings, SecretResolver, SecretValue, StepOutput,
};
use conveyor_types::duration_serde::format_duration;
use conveyor_types::{ArtifactRef, ConveyorError, FailureKind, Result, RunId, StageError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::artifacts::{run_key, run_owner, ArtifactStore};
use crate::config::EngineConfig;
use crate::definition::{ArtifactBinding, PostHooks, StepSpec};
use crate::events::{EventEmitter, PipelineEvent};
use crate::retry::retry_with_backoff;
use crate::transforms::expand_command;

/// Environment scope and log name used for pipeline-level hooks. `#` cannot
/// appear in a stage name.
pub(crate) const RUN_HOOKS_SCOPE: &str = "#post";

// ---------------------------------------------------------------------------
// Job / report types
// ---------------------------------------------------------------------------

/// Everything a stage task needs besides the job itself.
#[derive(Clone)]
pub(crate) struct Services {
    pub config: Arc<EngineConfig>,
    pub provisioner: Arc<dyn EnvironmentProvisioner>,
    pub executors: ExecutorRegistry,
    pub secrets: Arc<dyn SecretResolver>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub events: EventEmitter,
}

pub(crate) enum StageWork {
    /// Run the steps, then `always` hooks and the hooks matching the outcome.
    Steps(Vec<StepSpec>),
    /// Hooks only. `succeeded: None` runs just the `always` hooks.
    Hooks { succeeded: Option<bool> },
}

pub(crate) struct StageJob {
    pub run_id: RunId,
    /// `None` for pipeline-level hooks.
    pub stage: Option<String>,
    pub work: StageWork,
    pub hooks: PostHooks,
    pub environment: EnvironmentSpec,
    pub timeout: Option<Duration>,
    pub vars: HashMap<String, String>,
    /// Artifacts recorded on the run when the stage was dispatched.
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub receipts: BTreeSet<String>,
    pub cancel: CancellationToken,
    pub progress: mpsc::UnboundedSender<StageProgress>,
}

impl StageJob {
    fn scope_name(&self) -> &str {
        self.stage.as_deref().unwrap_or(RUN_HOOKS_SCOPE)
    }

    fn hooks_for(&self, outcome: &std::result::Result<(), StageError>) -> Vec<StepSpec> {
        let succeeded = match &self.work {
            StageWork::Steps(_) => Some(outcome.is_ok()),
            StageWork::Hooks { succeeded } => *succeeded,
        };
        let mut hooks = self.hooks.always.clone();
        match succeeded {
            Some(true) => hooks.extend(self.hooks.success.iter().cloned()),
            Some(false) => hooks.extend(self.hooks.failure.iter().cloned()),
            None => {}
        }
        hooks
    }
}

/// Sent while a stage runs so the loop can persist it immediately.
#[derive(Debug)]
pub(crate) enum StageProgress {
    Receipt { key: String },
    Artifact { name: String, artifact: ArtifactRef },
}

#[derive(Debug)]
pub(crate) struct StageReport {
    pub stage: Option<String>,
    pub outcome: std::result::Result<(), StageError>,
    pub output_tail: String,
    pub log: Option<ArtifactRef>,
    pub hook_failures: Vec<String>,
    pub duration_ms: u64,
}

impl StageReport {
    /// Report for a stage task that died before producing its own report.
    pub(crate) fn crashed(stage: Option<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            stage,
            outcome: Err(StageError {
                kind: FailureKind::Executor,
                message: format!("stage task ended unexpectedly: {}", reason),
                exit_code: None,
            }),
            output_tail: String::new(),
            log: None,
            hook_failures: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Receipt names are scoped to the stage so equal keys in two stages do not collide.
pub(crate) fn receipt_key(stage: &str, key: &str) -> String {
    format!("{}:{}", stage, key)
}

// ---------------------------------------------------------------------------
// Stage log
// ---------------------------------------------------------------------------

/// Full stage output, redacted as it is appended.
#[derive(Default)]
struct StageLog {
    text: String,
    /// Every secret bound so far in this stage, so that a value printed by a
    /// later step is masked too.
    secrets: SecretBindings,
    bound: usize,
}

impl StageLog {
    fn remember(&mut self, bindings: &SecretBindings) {
        for (name, value) in bindings.iter_env() {
            self.bound += 1;
            self.secrets
                .insert(format!("{}#{}", name, self.bound), SecretValue::new(value));
        }
    }

    fn line(&mut self, line: &str) {
        let line = self.secrets.redact(line);
        self.text.push_str(&line);
        self.text.push('\n');
    }

    fn section(&mut self, header: &str, body: &str) {
        self.line(&format!("==> {}", header));
        if !body.is_empty() {
            let body = self.secrets.redact(body);
            self.text.push_str(&body);
            if !body.ends_with('\n') {
                self.text.push('\n');
            }
        }
    }
}

type SharedLog = Arc<Mutex<StageLog>>;

// ---------------------------------------------------------------------------
// Stage task
// ---------------------------------------------------------------------------

pub(crate) async fn run_stage(services: Services, job: StageJob) -> StageReport {
    let started = Instant::now();
    let job = Arc::new(job);
    let log: SharedLog = Arc::new(Mutex::new(StageLog::default()));
    let scope = EnvScope::new(job.run_id, job.scope_name());

    let (outcome, env) = match &job.work {
        StageWork::Steps(_) => match acquire(&services, &job, &scope, &job.cancel).await {
            Ok(env) => {
                let env = Arc::new(env);
                let outcome = run_steps_bounded(&services, &job, &env, log.clone()).await;
                (outcome, Some(env))
            }
            Err(e) => {
                log.lock().await.line(&format!("environment unavailable: {}", e));
                (Err(e.to_stage_error()), None)
            }
        },
        StageWork::Hooks { .. } => (Ok(()), None),
    };

    let hooks = job.hooks_for(&outcome);
    let mut hook_failures = Vec::new();
    let env = match env {
        Some(env) => Some(env),
        None if !hooks.is_empty() => {
            // hooks still run after a cancelled or failed acquisition
            match acquire(&services, &job, &scope, &CancellationToken::new()).await {
                Ok(env) => Some(Arc::new(env)),
                Err(e) => {
                    let failure = format!("environment unavailable for hooks: {}", e);
                    log.lock().await.line(&failure);
                    hook_failures.push(failure);
                    None
                }
            }
        }
        None => None,
    };

    if let Some(env) = env {
        if !hooks.is_empty() {
            hook_failures.extend(run_hooks_isolated(&services, &job, hooks, &env, log.clone()).await);
        }
        release(&services, env).await;
    }

    let (output_tail, log_ref) = finish_log(&services, &job, &log).await;
    StageReport {
        stage: job.stage.clone(),
        outcome,
        output_tail,
        log: log_ref,
        hook_failures,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn acquire(
    services: &Services,
    job: &StageJob,
    scope: &EnvScope,
    cancel: &CancellationToken,
) -> Result<ScopedEnvironment> {
    let config = &services.config;
    retry_with_backoff(
        || services.provisioner.provision(&job.environment, scope),
        config.provision_retries,
        &config.provision_backoff,
        cancel,
        |attempt, delay, error| {
            let delay_ms = delay.as_millis() as u64;
            tracing::warn!(
                run = %job.run_id,
                stage = %scope.stage,
                attempt,
                delay_ms,
                error = %error,
                "environment provisioning failed, retrying"
            );
            services.events.emit(PipelineEvent::EnvironmentRetrying {
                run_id: job.run_id,
                stage: scope.stage.clone(),
                attempt,
                delay_ms,
                error: error.to_string(),
            });
        },
    )
    .await
}

/// Step and hook tasks are joined before this runs, so `env` is the last reference.
async fn release(services: &Services, env: Arc<ScopedEnvironment>) {
    match Arc::try_unwrap(env) {
        Ok(env) => {
            let label = env.label.clone();
            if let Err(e) = services.provisioner.release(env).await {
                tracing::warn!(env = %label, error = %e, "failed to release environment");
            }
        }
        Err(env) => {
            tracing::error!(
                env = %env.label,
                references = Arc::strong_count(&env),
                "environment still referenced after its tasks finished, not released"
            );
        }
    }
}

/// Run the steps in their own task, bounded by the stage timeout.
async fn run_steps_bounded(
    services: &Services,
    job: &Arc<StageJob>,
    env: &Arc<ScopedEnvironment>,
    log: SharedLog,
) -> std::result::Result<(), StageError> {
    let mut handle = tokio::spawn(run_steps(services.clone(), job.clone(), env.clone(), log.clone()));

    let joined = match job.timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // dropping the step future kills its process group
                handle.abort();
                let _ = handle.await;
                let message = format!("stage exceeded its timeout of {}", format_duration(limit));
                tracing::warn!(run = %job.run_id, stage = job.scope_name(), "{}", message);
                log.lock().await.line(&message);
                return Err(
                    stage_execution(job, FailureKind::Timeout, message).to_stage_error(),
                );
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = if e.is_panic() {
                "step executor panicked".to_string()
            } else {
                format!("step task ended unexpectedly: {}", e)
            };
            tracing::error!(run = %job.run_id, stage = job.scope_name(), "{}", message);
            log.lock().await.line(&message);
            Err(stage_execution(job, FailureKind::Executor, message).to_stage_error())
        }
    }
}

fn stage_execution(job: &StageJob, kind: FailureKind, message: String) -> ConveyorError {
    ConveyorError::StageExecution {
        stage: job.scope_name().to_string(),
        kind,
        message,
        exit_code: None,
    }
}

async fn run_steps(
    services: Services,
    job: Arc<StageJob>,
    env: Arc<ScopedEnvironment>,
    log: SharedLog,
) -> std::result::Result<(), StageError> {
    let StageWork::Steps(steps) = &job.work else {
        return Ok(());
    };
    let stage = job.scope_name();
    let mut available = job.artifacts.clone();

    for step in steps {
        if job.cancel.is_cancelled() {
            log.lock()
                .await
                .line("cancellation requested, remaining steps not run");
            return Err(ConveyorError::Cancelled.to_stage_error());
        }

        if let Some(key) = &step.idempotency_key {
            if job.receipts.contains(&receipt_key(stage, key)) {
                tracing::info!(run = %job.run_id, stage, step = %step.name, key = %key, "step already completed, skipping");
                log.lock()
                    .await
                    .line(&format!("==> {} (skipped, receipt '{}' recorded)", step.name, key));
                services.events.emit(PipelineEvent::StepSkipped {
                    run_id: job.run_id,
                    stage: stage.to_string(),
                    step: step.name.clone(),
                    idempotency_key: key.clone(),
                });
                continue;
            }
        }

        if let Err(e) = stage_inputs(&services, &env, &step.consumes, &available).await {
            log.lock().await.line(&format!("step '{}' inputs: {}", step.name, e));
            return Err(e.to_stage_error());
        }

        let output = match execute_step(&services, &job.vars, step, &env, &log).await {
            Ok(output) => output,
            Err(e) => {
                log.lock()
                    .await
                    .line(&format!("step '{}' could not run: {}", step.name, e));
                return Err(e.to_stage_error());
            }
        };
        tracing::info!(
            run = %job.run_id,
            stage,
            step = %step.name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "step finished"
        );
        services.events.emit(PipelineEvent::StepCompleted {
            run_id: job.run_id,
            stage: stage.to_string(),
            step: step.name.clone(),
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
        });
        if !output.success() {
            return Err(
                ConveyorError::step_failure(stage, &step.name, output.exit_code).to_stage_error(),
            );
        }

        for binding in &step.produces {
            let artifact = match collect_output(&services, job.run_id, &env, binding).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    log.lock().await.line(&format!("step '{}' outputs: {}", step.name, e));
                    return Err(e.to_stage_error());
                }
            };
            available.insert(binding.name.clone(), artifact.clone());
            let _ = job.progress.send(StageProgress::Artifact {
                name: binding.name.clone(),
                artifact,
            });
        }
        if let Some(key) = &step.idempotency_key {
            let _ = job.progress.send(StageProgress::Receipt {
                key: receipt_key(stage, key),
            });
        }
    }
    Ok(())
}

/// Resolve the executor and credentials, expand the command and run it.
/// The redacted output is appended to the stage log.
async fn execute_step(
    services: &Services,
    vars: &HashMap<String, String>,
    step: &StepSpec,
    env: &ScopedEnvironment,
    log: &SharedLog,
) -> Result<StepOutput> {
    let executor = services
        .executors
        .get(&step.uses)
        .ok_or_else(|| ConveyorError::Executor {
            executor: step.uses.clone(),
            message: "no executor registered for this kind".into(),
        })?;

    let mut secrets = SecretBindings::new();
    for credential in &step.credentials {
        let value = services.secrets.resolve(&credential.id).await?;
        secrets.insert(credential.env.clone(), value);
    }

    let command = expand_command(&step.command, vars);
    let output = executor.run(&command, env, &secrets).await?;

    let mut log = log.lock().await;
    log.remember(&secrets);
    log.section(
        &format!(
            "{} (exit {}, {}ms)",
            step.name, output.exit_code, output.duration_ms
        ),
        &output.output,
    );
    Ok(output)
}

/// Copy consumed artifacts into the workspace at their bound paths.
async fn stage_inputs(
    services: &Services,
    env: &ScopedEnvironment,
    bindings: &[ArtifactBinding],
    available: &BTreeMap<String, ArtifactRef>,
) -> Result<()> {
    for binding in bindings {
        let artifact = available
            .get(&binding.name)
            .ok_or_else(|| ConveyorError::ArtifactNotFound {
                key: binding.name.clone(),
            })?;
        let content = services.artifacts.get(artifact).await?;
        let path = env.workdir.join(&binding.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        tracing::debug!(artifact = %artifact, path = %path.display(), "artifact staged");
    }
    Ok(())
}

/// Store a produced file and hold it for the run.
async fn collect_output(
    services: &Services,
    run_id: RunId,
    env: &ScopedEnvironment,
    binding: &ArtifactBinding,
) -> Result<ArtifactRef> {
    let path = env.workdir.join(&binding.path);
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConveyorError::ArtifactNotFound {
                key: format!("{} (expected at {})", binding.name, binding.path.display()),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let artifact = services
        .artifacts
        .put_retained(&run_key(run_id, &binding.name), &content, &run_owner(run_id))
        .await?;
    tracing::debug!(artifact = %artifact, size = artifact.size, "artifact stored");
    Ok(artifact)
}

async fn run_hooks_isolated(
    services: &Services,
    job: &Arc<StageJob>,
    hooks: Vec<StepSpec>,
    env: &Arc<ScopedEnvironment>,
    log: SharedLog,
) -> Vec<String> {
    let handle = tokio::spawn(run_hooks(services.clone(), job.clone(), hooks, env.clone(), log));
    match handle.await {
        Ok(failures) => failures,
        Err(e) => {
            tracing::error!(run = %job.run_id, stage = job.scope_name(), error = %e, "hook task ended unexpectedly");
            vec![format!("hooks aborted: {}", e)]
        }
    }
}

/// Hooks never stop early: every selected hook runs and each failure is collected.
async fn run_hooks(
    services: Services,
    job: Arc<StageJob>,
    hooks: Vec<StepSpec>,
    env: Arc<ScopedEnvironment>,
    log: SharedLog,
) -> Vec<String> {
    let mut failures = Vec::new();
    for hook in &hooks {
        let failure = match execute_step(&services, &job.vars, hook, &env, &log).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!(
                "hook '{}' exited with code {}",
                hook.name, output.exit_code
            )),
            Err(e) => Some(format!("hook '{}' could not run: {}", hook.name, e)),
        };
        if let Some(error) = failure {
            tracing::warn!(run = %job.run_id, stage = job.scope_name(), hook = %hook.name, error = %error, "hook failed");
            services.events.emit(PipelineEvent::HookFailed {
                run_id: job.run_id,
                stage: job.stage.clone(),
                hook: hook.name.clone(),
                error: error.clone(),
            });
            failures.push(error);
        }
    }
    failures
}

/// Store the full log as an artifact and return the tail kept on the record.
async fn finish_log(
    services: &Services,
    job: &StageJob,
    log: &SharedLog,
) -> (String, Option<ArtifactRef>) {
    let text = std::mem::take(&mut log.lock().await.text);
    let tail = truncate_tail(&text, services.config.output_tail_chars);

    let key = run_key(job.run_id, &format!("logs/{}", job.scope_name()));
    let stored = services
        .artifacts
        .put_retained(&key, text.as_bytes(), &run_owner(job.run_id))
        .await;

    match stored {
        Ok(artifact) => (tail, Some(artifact)),
        Err(e) => {
            tracing::warn!(run = %job.run_id, stage = job.scope_name(), error = %e, "failed to store stage log");
            (tail, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conveyor_exec::{default_registry, CommandSpec, EnvHandle, StaticSecretResolver, StepExecutor};

    use crate::artifacts::MemoryArtifactStore;

    struct TempProvisioner {
        root: std::path::PathBuf,
        released: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EnvironmentProvisioner for TempProvisioner {
        async fn provision(&self, spec: &EnvironmentSpec, scope: &EnvScope) -> Result<ScopedEnvironment> {
            let workdir = self.root.join(scope.stage.replace('#', "_"));
            tokio::fs::create_dir_all(&workdir).await?;
            Ok(ScopedEnvironment {
                id: scope.stage.clone(),
                label: scope.label(),
                spec: spec.clone(),
                workdir,
                handle: EnvHandle::Local,
            })
        }

        async fn release(&self, _env: ScopedEnvironment) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingExecutor;

    #[async_trait::async_trait]
    impl StepExecutor for PanickingExecutor {
        fn kind(&self) -> &str {
            "panics"
        }

        async fn run(
            &self,
            _command: &CommandSpec,
            _env: &ScopedEnvironment,
            _secrets: &SecretBindings,
        ) -> Result<StepOutput> {
            panic!("executor bug");
        }
    }

    fn services(root: &std::path::Path) -> (Services, Arc<MemoryArtifactStore>) {
        let (services, artifacts, _) = counting_services(root, default_registry());
        (services, artifacts)
    }

    fn counting_services(
        root: &std::path::Path,
        executors: ExecutorRegistry,
    ) -> (Services, Arc<MemoryArtifactStore>, Arc<AtomicUsize>) {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let released = Arc::new(AtomicUsize::new(0));
        let services = Services {
            config: Arc::new(EngineConfig::default()),
            provisioner: Arc::new(TempProvisioner {
                root: root.to_path_buf(),
                released: released.clone(),
            }),
            executors,
            secrets: Arc::new(StaticSecretResolver::new().with("api", "hunter2")),
            artifacts: artifacts.clone(),
            events: EventEmitter::default(),
        };
        (services, artifacts, released)
    }

    fn job(stage: &str, steps: Vec<StepSpec>) -> (StageJob, mpsc::UnboundedReceiver<StageProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = StageJob {
            run_id: RunId(1),
            stage: Some(stage.to_string()),
            work: StageWork::Steps(steps),
            hooks: PostHooks::default(),
            environment: EnvironmentSpec::default(),
            timeout: None,
            vars: HashMap::new(),
            artifacts: BTreeMap::new(),
            receipts: BTreeSet::new(),
            cancel: CancellationToken::new(),
            progress: tx,
        };
        (job, rx)
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    // 1. Steps run in order and stop at the first failure
    #[tokio::test]
    async fn fail_fast_on_first_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let (job, _rx) = job(
            "Build",
            vec![
                StepSpec::shell("one", "echo first"),
                StepSpec::shell("two", "exit 3"),
                StepSpec::shell("three", "echo never"),
            ],
        );

        let report = run_stage(services, job).await;
        let err = report.outcome.unwrap_err();
        assert_eq!(err.kind, FailureKind::StepFailure);
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.message, "step 'two' exited with code 3");
        assert!(report.output_tail.contains("first"));
        assert!(!report.output_tail.contains("never"));
        assert!(report.log.is_some());
    }

    // 2. Secrets are available to the step and masked in the log
    #[tokio::test]
    async fn secrets_are_redacted_from_output() {
        let dir = tempfile::tempdir().unwrap();
        let (services, artifacts) = services(dir.path());
        let mut step = StepSpec::shell("login", "echo token=$API_TOKEN");
        step.credentials.push(crate::definition::CredentialBinding {
            id: "api".into(),
            env: "API_TOKEN".into(),
        });
        let (job, _rx) = job("Deploy", vec![step]);

        let report = run_stage(services, job).await;
        assert!(report.outcome.is_ok());
        assert!(report.output_tail.contains("token=****"));
        assert!(!report.output_tail.contains("hunter2"));
        let stored = artifacts.get(report.log.as_ref().unwrap()).await.unwrap();
        assert!(!String::from_utf8_lossy(&stored).contains("hunter2"));
    }

    // 3. A missing credential fails the stage as secret_missing
    #[tokio::test]
    async fn unknown_credential_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let mut step = StepSpec::shell("push", "true");
        step.credentials.push(crate::definition::CredentialBinding {
            id: "registry".into(),
            env: "REGISTRY_TOKEN".into(),
        });
        let (job, _rx) = job("Publish", vec![step]);

        let report = run_stage(services, job).await;
        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::SecretMissing);
    }

    // 4. Produced files are stored, retained and announced
    #[tokio::test]
    async fn produced_artifact_is_stored_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (services, artifacts) = services(dir.path());
        let mut step = StepSpec::shell("build", "mkdir -p out && printf bundle > out/app.tgz");
        step.produces.push(ArtifactBinding {
            name: "dist".into(),
            path: "out/app.tgz".into(),
        });
        let (job, mut rx) = job("Build", vec![step]);

        let report = run_stage(services, job).await;
        assert!(report.outcome.is_ok());
        match rx.recv().await.unwrap() {
            StageProgress::Artifact { name, artifact } => {
                assert_eq!(name, "dist");
                assert_eq!(artifact.key, "run-1/dist");
                assert_eq!(artifacts.get(&artifact).await.unwrap(), b"bundle");
            }
            other => panic!("unexpected progress: {:?}", other),
        }
    }

    // 5. A declared output that was never written fails as artifact_missing
    #[tokio::test]
    async fn missing_output_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let mut step = StepSpec::shell("build", "true");
        step.produces.push(ArtifactBinding {
            name: "dist".into(),
            path: "out/app.tgz".into(),
        });
        let (job, _rx) = job("Build", vec![step]);

        let report = run_stage(services, job).await;
        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::ArtifactMissing);
    }

    // 6. Steps with a recorded receipt are skipped
    #[tokio::test]
    async fn receipt_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let mut step = StepSpec::shell("migrate", "exit 9");
        step.idempotency_key = Some("migrate-v3".into());
        let (mut job, _rx) = job("Deploy", vec![step]);
        job.receipts.insert(receipt_key("Deploy", "migrate-v3"));

        let report = run_stage(services, job).await;
        assert!(report.outcome.is_ok());
        assert!(report.output_tail.contains("receipt 'migrate-v3'"));
    }

    // 7. Timeout aborts the running step
    #[tokio::test]
    async fn timeout_aborts_step() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let (mut job, _rx) = job("Slow", vec![StepSpec::shell("sleep", "sleep 30")]);
        job.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let report = run_stage(services, job).await;
        let err = report.outcome.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.message, "stage exceeded its timeout of 200ms");
        assert_eq!(err.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    // 8. A cancelled token stops before the first step
    #[tokio::test]
    async fn cancelled_before_step() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let (job, _rx) = job("Build", vec![StepSpec::shell("one", "echo ran")]);
        job.cancel.cancel();

        let report = run_stage(services, job).await;
        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::Cancelled);
        assert!(!report.output_tail.contains("ran"));
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    // 9. always runs before failure hooks, success hooks are skipped
    #[tokio::test]
    async fn hooks_follow_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let (mut job, _rx) = job("Test", vec![StepSpec::shell("test", "exit 1")]);
        job.hooks = PostHooks {
            always: vec![StepSpec::shell("collect", "echo always-hook")],
            success: vec![StepSpec::shell("badge", "echo success-hook")],
            failure: vec![
                StepSpec::shell("notify", "echo failure-hook"),
                StepSpec::shell("broken", "exit 4"),
            ],
        };

        let report = run_stage(services, job).await;
        assert!(report.outcome.is_err());
        let always = report.output_tail.find("always-hook").unwrap();
        let failure = report.output_tail.find("failure-hook").unwrap();
        assert!(always < failure);
        assert!(!report.output_tail.contains("success-hook"));
        assert_eq!(report.hook_failures, vec!["hook 'broken' exited with code 4"]);
    }

    // 10. Hook-only work runs just the always hooks
    #[tokio::test]
    async fn skipped_stage_runs_always_hooks_only() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let (mut job, _rx) = job("Publish", Vec::new());
        job.work = StageWork::Hooks { succeeded: None };
        job.hooks = PostHooks {
            always: vec![StepSpec::shell("cleanup", "echo cleaned")],
            success: Vec::new(),
            failure: vec![StepSpec::shell("notify", "echo notified")],
        };

        let report = run_stage(services, job).await;
        assert!(report.outcome.is_ok());
        assert!(report.output_tail.contains("cleaned"));
        assert!(!report.output_tail.contains("notified"));
    }

    // 11. The environment is released after an executor panic and after a timeout
    #[tokio::test]
    async fn environment_released_after_panic_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut executors = default_registry();
        executors.register(PanickingExecutor);
        let (services, _, released) = counting_services(dir.path(), executors);

        let mut step = StepSpec::shell("boom", "ignored");
        step.uses = "panics".into();
        let mut hook = StepSpec::shell("report", "ignored");
        hook.uses = "panics".into();
        let (mut crash, _rx) = job("Crash", vec![step]);
        crash.hooks.failure.push(hook);

        let report = run_stage(services.clone(), crash).await;
        let err = report.outcome.unwrap_err();
        assert_eq!(err.kind, FailureKind::Executor);
        assert_eq!(err.message, "step executor panicked");
        assert_eq!(report.hook_failures.len(), 1);
        assert!(report.hook_failures[0].starts_with("hooks aborted"));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let (mut slow, _rx) = job("Slow", vec![StepSpec::shell("sleep", "sleep 30")]);
        slow.timeout = Some(Duration::from_millis(100));
        let report = run_stage(services, slow).await;
        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::Timeout);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stage_log_masks_later_output() {
        let mut log = StageLog::default();
        let mut bindings = SecretBindings::new();
        bindings.insert("TOKEN", SecretValue::new("s3cr3t"));
        log.remember(&bindings);
        log.section("print", "value s3cr3t");
        log.line("again s3cr3t");
        assert_eq!(log.text, "==> print\nvalue ****\nagain ****\n");
    }
}
