//! Pipeline execution engine: the dispatch loop.
//!
//! The loop is the only writer of the [`Run`] record. It decides which stages
//! are dispatched or skipped, applies stage reports and progress messages, and
//! saves the record after every change. Stage work runs on a [`JoinSet`], at
//! most `concurrency_limit` stages at a time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use conveyor_exec::{EnvironmentProvisioner, ExecutorRegistry, SecretResolver};
use conveyor_types::{
    ConveyorError, FailureKind, Result, Run, RunId, RunStatus, SkipReason, StageResult,
    StageStatus,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::config::EngineConfig;
use crate::dag::{PipelineGraph, StageNode};
use crate::definition::PipelineDefinition;
use crate::events::{EventEmitter, PipelineEvent};
use crate::stage::{run_stage, Services, StageJob, StageProgress, StageReport, StageWork};
use crate::state::RunStateStore;
use crate::transforms::template_vars;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Drives runs of validated pipeline graphs.
pub struct PipelineExecutor {
    services: Services,
    store: Arc<dyn RunStateStore>,
}

/// A run to drive, plus the handles the caller keeps.
pub struct RunContext {
    pub run: Run,
    /// Cancelling this stops dispatch. Cancel markers in the store cancel it too.
    pub cancel: CancellationToken,
    /// Extra `${name}` variables for step commands.
    pub variables: HashMap<String, String>,
}

impl RunContext {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            cancel: CancellationToken::new(),
            variables: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// The final record of a driven run.
#[derive(Debug)]
pub struct RunResult {
    pub run: Run,
}

impl RunResult {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn succeeded(&self) -> bool {
        self.run.status == RunStatus::Succeeded
    }

    pub fn first_failure(&self) -> Option<&StageResult> {
        self.run.first_failure()
    }

    /// Whether the first failing stage failed for reasons outside its own steps
    /// (provisioning, executor, missing secret or artifact).
    pub fn is_infrastructure_failure(&self) -> bool {
        self.first_failure()
            .and_then(|stage| stage.error.as_ref())
            .is_some_and(|error| error.kind.is_infrastructure())
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    pub fn new(
        config: EngineConfig,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        executors: ExecutorRegistry,
        secrets: Arc<dyn SecretResolver>,
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn RunStateStore>,
    ) -> Self {
        Self {
            services: Services {
                config: Arc::new(config),
                provisioner,
                executors,
                secrets,
                artifacts,
                events: EventEmitter::default(),
            },
            store,
        }
    }

    /// Replace the event emitter, e.g. one a caller already subscribed to.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.services.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.services.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.services.artifacts
    }

    /// Allocate and persist a new Pending run for `graph`.
    pub async fn create_run(&self, graph: &PipelineGraph) -> Result<Run> {
        graph.check_executors(&self.services.executors)?;
        let id = self.store.next_run_id().await?;
        let run = Run::new(
            id,
            graph.name(),
            graph.definition().to_value()?,
            graph.stage_names(),
        );
        self.store.save(&run).await?;
        tracing::info!(run = %id, pipeline = %graph.name(), "run created");
        Ok(run)
    }

    /// Load an interrupted run and rebuild its graph from the stored definition.
    ///
    /// Environments the previous process left behind are reclaimed and any
    /// stale cancel marker is dropped.
    pub async fn prepare_resume(&self, id: RunId) -> Result<(PipelineGraph, Run)> {
        let run = self.store.load(id).await?;
        if run.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                subject: format!("run {}", id),
                from: run.status.to_string(),
                to: "resumed".into(),
            });
        }
        let definition = PipelineDefinition::from_value(run.definition.clone())?;
        let graph = PipelineGraph::build(definition)?;

        let reclaimed = self.services.provisioner.reclaim(id).await?;
        if reclaimed > 0 {
            tracing::info!(run = %id, reclaimed, "reclaimed environments of interrupted attempt");
        }
        self.store.clear_cancel(id).await?;
        Ok((graph, run))
    }

    /// Drive a run to a terminal status.
    ///
    /// Stages left Running by a previous attempt go back to Pending; finished
    /// stages are kept. Returns `Err` only when the run could not be driven at
    /// all, most notably when its state can no longer be saved. Stage failures
    /// are reported through the returned record.
    pub async fn execute(&self, graph: &PipelineGraph, ctx: RunContext) -> Result<RunResult> {
        let RunContext {
            mut run,
            cancel,
            variables,
        } = ctx;
        if run.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                subject: format!("run {}", run.id),
                from: run.status.to_string(),
                to: "running".into(),
            });
        }
        graph.check_executors(&self.services.executors)?;

        let run_id = run.id;
        let resumed = run.started_at.is_some();
        for name in graph.stage_names() {
            run.ensure_stage(name.to_string());
        }
        for stage in run
            .stages
            .iter_mut()
            .filter(|s| s.status == StageStatus::Running)
        {
            tracing::info!(run = %run_id, stage = %stage.name, "stage was interrupted, resetting");
            stage.reset_interrupted()?;
        }
        run.start()?;
        self.store.save(&run).await?;

        tracing::info!(run = %run_id, pipeline = %run.pipeline, resumed, "run started");
        self.services.events.emit(PipelineEvent::RunStarted {
            run_id,
            pipeline: run.pipeline.clone(),
            stage_count: graph.stages().len(),
            resumed,
        });

        let started = Instant::now();
        let mut driver = RunDriver::new(self, graph, run, cancel, variables);
        if let Err(e) = driver.drive().await {
            return Err(driver.abort(e).await);
        }
        let run = match driver.finalize().await {
            Ok(run) => run,
            Err(e) => return Err(driver.abort(e).await),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(run = %run_id, status = %run.status, duration_ms, "run finished");
        self.services.events.emit(PipelineEvent::RunCompleted {
            run_id,
            status: run.status,
            duration_ms,
        });
        Ok(RunResult { run })
    }
}

// ---------------------------------------------------------------------------
// RunDriver
// ---------------------------------------------------------------------------

enum Decision {
    Wait,
    Skip(SkipReason),
    Dispatch,
}

/// State of one `execute` call.
struct RunDriver<'a> {
    services: &'a Services,
    store: &'a dyn RunStateStore,
    graph: &'a PipelineGraph,
    order: Vec<&'a str>,
    run: Run,
    cancel: CancellationToken,
    variables: HashMap<String, String>,
    tasks: JoinSet<StageReport>,
    /// Stages whose steps are in flight. Hook-only tasks are not counted.
    running: BTreeSet<String>,
    progress_tx: mpsc::UnboundedSender<StageProgress>,
    progress_rx: mpsc::UnboundedReceiver<StageProgress>,
    halted_by: Option<String>,
    cancel_announced: bool,
}

impl<'a> RunDriver<'a> {
    fn new(
        executor: &'a PipelineExecutor,
        graph: &'a PipelineGraph,
        run: Run,
        cancel: CancellationToken,
        variables: HashMap<String, String>,
    ) -> Self {
        // a blocking failure from an earlier attempt still halts the run
        let halted_by = run
            .stages
            .iter()
            .find(|s| {
                s.status == StageStatus::Failed
                    && graph.stage(&s.name).is_some_and(|node| node.blocking)
            })
            .map(|s| s.name.clone());
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            services: &executor.services,
            store: executor.store.as_ref(),
            graph,
            order: graph.topological_order(),
            run,
            cancel,
            variables,
            tasks: JoinSet::new(),
            running: BTreeSet::new(),
            progress_tx,
            progress_rx,
            halted_by,
            cancel_announced: false,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut poll = tokio::time::interval(self.services.config.cancel_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.schedule().await?;
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(message) = self.progress_rx.recv() => {
                    self.apply_progress(message).await?;
                }
                Some(joined) = self.tasks.join_next() => {
                    let report = joined.map_err(|e| {
                        ConveyorError::Other(format!("stage supervisor failed: {}", e))
                    })?;
                    self.apply_report(report).await?;
                }
                _ = self.cancel.cancelled(), if !self.cancel_announced => {
                    self.announce_cancel();
                }
                _ = poll.tick() => {
                    self.poll_cancel_marker().await;
                }
            }
        }

        while let Ok(message) = self.progress_rx.try_recv() {
            self.apply_progress(message).await?;
        }
        Ok(())
    }

    // -- scheduling ----------------------------------------------------------

    fn decide(&self, node: &StageNode) -> Decision {
        let deps: Vec<&StageResult> = node
            .dependencies
            .iter()
            .filter_map(|d| self.run.stage(d))
            .collect();

        if let Some(dep) = deps.iter().find(|d| d.blocks_dependents()) {
            return Decision::Skip(SkipReason::DependencyFailed {
                dependency: dep.name.clone(),
            });
        }
        if self.cancel.is_cancelled() {
            return Decision::Skip(SkipReason::Cancelled);
        }
        if let Some(by) = &self.halted_by {
            return Decision::Skip(SkipReason::Halted { by: by.clone() });
        }
        if !deps.iter().all(|d| d.is_satisfied()) {
            return Decision::Wait;
        }
        if !node.spec.enabled {
            return Decision::Skip(SkipReason::Disabled);
        }
        if self.running.len() < self.services.config.concurrency_limit {
            Decision::Dispatch
        } else {
            Decision::Wait
        }
    }

    /// One pass in topological order. Upstream decisions land before their
    /// dependents are looked at, so skips cascade within the pass.
    async fn schedule(&mut self) -> Result<()> {
        let graph = self.graph;
        for i in 0..self.order.len() {
            let name = self.order[i];
            let Some(node) = graph.stage(name) else {
                continue;
            };
            if self.run.stage(name).map(|s| s.status) != Some(StageStatus::Pending) {
                continue;
            }
            match self.decide(node) {
                Decision::Wait => {}
                Decision::Skip(reason) => self.skip(node, reason).await?,
                Decision::Dispatch => self.dispatch(node).await?,
            }
        }
        Ok(())
    }

    async fn skip(&mut self, node: &'a StageNode, reason: SkipReason) -> Result<()> {
        let name = node.name();
        self.run.stage_mut(name)?.mark_skipped(reason.clone())?;
        self.persist().await?;

        tracing::info!(run = %self.run.id, stage = name, reason = %reason, "stage skipped");
        self.services.events.emit(PipelineEvent::StageSkipped {
            run_id: self.run.id,
            stage: name.to_string(),
            reason: reason.to_string(),
        });

        if !node.spec.post.always.is_empty() {
            let job = self.stage_job(node, StageWork::Hooks { succeeded: None });
            self.spawn(job);
        }
        Ok(())
    }

    async fn dispatch(&mut self, node: &'a StageNode) -> Result<()> {
        let name = node.name();
        let stage = self.run.stage_mut(name)?;
        stage.mark_running()?;
        let attempt = stage.attempt;
        self.persist().await?;

        self.running.insert(name.to_string());
        tracing::info!(run = %self.run.id, stage = name, attempt, "stage started");
        self.services.events.emit(PipelineEvent::StageStarted {
            run_id: self.run.id,
            stage: name.to_string(),
            attempt,
        });

        let job = self.stage_job(node, StageWork::Steps(node.spec.steps.clone()));
        self.spawn(job);
        Ok(())
    }

    fn stage_job(&self, node: &StageNode, work: StageWork) -> StageJob {
        let definition = self.graph.definition();
        let config = &self.services.config;
        let environment = definition.stage_environment(&node.spec);
        let vars = template_vars(
            definition,
            &environment,
            &config.endpoints,
            &self.variables,
            self.run.id,
            Some(node.name()),
        );
        StageJob {
            run_id: self.run.id,
            stage: Some(node.name().to_string()),
            work,
            hooks: node.spec.post.clone(),
            environment,
            timeout: node.spec.timeout.or(config.default_stage_timeout),
            vars,
            artifacts: self.run.artifacts.clone(),
            receipts: self.run.receipts.clone(),
            cancel: self.cancel.clone(),
            progress: self.progress_tx.clone(),
        }
    }

    /// Stage tasks run under a supervisor so that even a crashed task yields a
    /// report naming its stage.
    fn spawn(&mut self, job: StageJob) {
        let services = self.services.clone();
        let stage = job.stage.clone();
        self.tasks.spawn(async move {
            match tokio::spawn(run_stage(services, job)).await {
                Ok(report) => report,
                Err(e) => StageReport::crashed(stage, e),
            }
        });
    }

    // -- applying results ----------------------------------------------------

    async fn apply_progress(&mut self, message: StageProgress) -> Result<()> {
        match message {
            StageProgress::Receipt { key } => {
                tracing::debug!(run = %self.run.id, receipt = %key, "receipt recorded");
                self.run.record_receipt(key)?;
            }
            StageProgress::Artifact { name, artifact } => {
                tracing::debug!(run = %self.run.id, name = %name, artifact = %artifact, "artifact recorded");
                self.run.record_artifact(name, artifact)?;
            }
        }
        self.persist().await
    }

    async fn apply_report(&mut self, report: StageReport) -> Result<()> {
        let Some(name) = report.stage else {
            return Ok(());
        };
        let was_running = self.running.remove(&name);
        let stage = self.run.stage_mut(&name)?;
        stage.hook_failures.extend(report.hook_failures);

        if !was_running {
            // always hooks of a skipped stage
            if stage.log.is_none() {
                stage.log = report.log;
                stage.output_tail = report.output_tail;
            }
            return self.persist().await;
        }

        stage.output_tail = report.output_tail;
        stage.log = report.log;
        match report.outcome {
            Ok(()) => stage.mark_succeeded()?,
            Err(error) => stage.mark_failed(error)?,
        }
        let status = stage.status;
        let error = stage.error.as_ref().map(|e| e.message.clone());

        if status == StageStatus::Failed
            && self.halted_by.is_none()
            && self.graph.stage(&name).is_some_and(|node| node.blocking)
        {
            tracing::warn!(run = %self.run.id, stage = %name, "blocking stage failed, halting dispatch");
            self.halted_by = Some(name.clone());
        }
        self.persist().await?;

        match &error {
            Some(message) => {
                tracing::warn!(run = %self.run.id, stage = %name, duration_ms = report.duration_ms, error = %message, "stage failed")
            }
            None => {
                tracing::info!(run = %self.run.id, stage = %name, duration_ms = report.duration_ms, "stage succeeded")
            }
        }
        self.services.events.emit(PipelineEvent::StageCompleted {
            run_id: self.run.id,
            stage: name,
            status,
            duration_ms: report.duration_ms,
            error,
        });
        Ok(())
    }

    // -- cancellation --------------------------------------------------------

    fn announce_cancel(&mut self) {
        self.cancel_announced = true;
        tracing::info!(run = %self.run.id, "cancellation requested, stopping dispatch");
        self.services
            .events
            .emit(PipelineEvent::CancellationRequested { run_id: self.run.id });
    }

    async fn poll_cancel_marker(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.store.cancel_requested(self.run.id).await {
            Ok(true) => self.cancel.cancel(),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(run = %self.run.id, error = %e, "failed to check for cancel marker")
            }
        }
    }

    // -- finishing -----------------------------------------------------------

    fn outcome(&self) -> RunStatus {
        let cancelled = self.run.stages.iter().any(|s| {
            matches!(s.skip_reason, Some(SkipReason::Cancelled))
                || s.error
                    .as_ref()
                    .is_some_and(|e| e.kind == FailureKind::Cancelled)
        });
        if cancelled {
            return RunStatus::Aborted;
        }
        let satisfied = self
            .graph
            .stages()
            .iter()
            .filter(|node| node.spec.required)
            .all(|node| self.run.stage(node.name()).is_some_and(StageResult::is_satisfied));
        if satisfied {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Run the pipeline-level hooks once and write the terminal record.
    async fn finalize(&mut self) -> Result<Run> {
        let status = self.outcome();
        let graph = self.graph;
        let definition = graph.definition();

        if !definition.post.is_empty() {
            let vars = template_vars(
                definition,
                &definition.environment,
                &self.services.config.endpoints,
                &self.variables,
                self.run.id,
                None,
            );
            let job = StageJob {
                run_id: self.run.id,
                stage: None,
                work: StageWork::Hooks {
                    succeeded: Some(status == RunStatus::Succeeded),
                },
                hooks: definition.post.clone(),
                environment: definition.environment.clone(),
                timeout: None,
                vars,
                artifacts: self.run.artifacts.clone(),
                receipts: self.run.receipts.clone(),
                // pipeline hooks run even when the run was cancelled
                cancel: CancellationToken::new(),
                progress: self.progress_tx.clone(),
            };
            let report = match tokio::spawn(run_stage(self.services.clone(), job)).await {
                Ok(report) => report,
                Err(e) => StageReport::crashed(None, e),
            };
            if let Err(error) = report.outcome {
                self.run.record_hook_failure(error.message)?;
            }
            for failure in report.hook_failures {
                self.run.record_hook_failure(failure)?;
            }
        }

        self.run.finish(status)?;
        self.persist().await?;
        if let Err(e) = self.store.clear_cancel(self.run.id).await {
            tracing::warn!(run = %self.run.id, error = %e, "failed to clear cancel marker");
        }
        Ok(self.run.clone())
    }

    async fn persist(&self) -> Result<()> {
        self.store.save(&self.run).await
    }

    /// Stop everything after an unrecoverable error. In-flight stages see the
    /// cancellation, run their hooks and release their environments.
    async fn abort(&mut self, error: ConveyorError) -> ConveyorError {
        tracing::error!(run = %self.run.id, error = %error, "run cannot continue, draining stages");
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        error
    }
}
