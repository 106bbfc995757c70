//! DAG builder: compiles a [`PipelineDefinition`] into an executable graph.
//!
//! Validation happens here, before any run record exists. The resulting graph
//! exposes a deterministic topological order (Kahn's algorithm, ties broken by
//! declaration order), parallel levels, and transitive dependents.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use conveyor_exec::ExecutorRegistry;
use conveyor_types::{ConveyorError, Result};
use regex::Regex;

use crate::definition::{PipelineDefinition, StageSpec, StepSpec};

fn stage_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_](?:[A-Za-z0-9_ .-]*[A-Za-z0-9_.-])?$").unwrap())
}

fn artifact_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap())
}

fn env_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StageNode {
    pub spec: StageSpec,
    /// Resolved dependencies (explicit, or the previous stage when implicit).
    pub dependencies: Vec<String>,
    pub blocking: bool,
}

impl StageNode {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    definition: PipelineDefinition,
    /// Declaration order.
    nodes: Vec<StageNode>,
    index: HashMap<String, usize>,
    /// `dependents[i]` = indices of stages that directly depend on stage `i`.
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl PipelineGraph {
    /// Validate `definition` and compile it.
    pub fn build(definition: PipelineDefinition) -> Result<Self> {
        validate_definition(&definition)?;

        let mut index = HashMap::new();
        for (i, stage) in definition.stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(ConveyorError::Validation(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let mut nodes = Vec::with_capacity(definition.stages.len());
        for (i, stage) in definition.stages.iter().enumerate() {
            let (dependencies, implicit) = match &stage.depends_on {
                Some(deps) => (deps.clone(), false),
                None if i == 0 => (Vec::new(), true),
                None => (vec![definition.stages[i - 1].name.clone()], true),
            };

            let mut seen = HashSet::new();
            for dep in &dependencies {
                if dep == &stage.name {
                    return Err(ConveyorError::Validation(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    )));
                }
                if !index.contains_key(dep) {
                    return Err(ConveyorError::Validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
                if !seen.insert(dep.as_str()) {
                    return Err(ConveyorError::Validation(format!(
                        "stage '{}' lists dependency '{}' twice",
                        stage.name, dep
                    )));
                }
            }

            nodes.push(StageNode {
                spec: stage.clone(),
                blocking: stage.blocking.unwrap_or(implicit),
                dependencies,
            });
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                dependents[index[dep]].push(i);
            }
        }

        let mut graph = Self {
            definition,
            nodes,
            index,
            dependents,
            order: Vec::new(),
        };
        graph.detect_cycles()?;
        graph.order = graph.kahn_order()?;
        graph.validate_artifact_flow()?;
        Ok(graph)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn stage(&self, name: &str) -> Option<&StageNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(StageNode::name)
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].name()).collect()
    }

    /// Groups of stages that could run in parallel: level `n` holds the stages
    /// whose longest dependency chain has length `n`.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for &i in &self.order {
            depth[i] = self.nodes[i]
                .dependencies
                .iter()
                .map(|d| depth[self.index[d]] + 1)
                .max()
                .unwrap_or(0);
        }

        let max = depth.iter().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); if self.nodes.is_empty() { 0 } else { max + 1 }];
        for &i in &self.order {
            levels[depth[i]].push(self.nodes[i].name());
        }
        levels
    }

    /// Every stage that depends on `name` directly or indirectly, in topological order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut reached = HashSet::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if reached.insert(d) {
                    stack.push(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|&&i| reached.contains(&i))
            .map(|&i| self.nodes[i].name())
            .collect()
    }

    /// Reject steps whose `uses` names no registered executor.
    pub fn check_executors(&self, registry: &ExecutorRegistry) -> Result<()> {
        let stage_steps = self
            .nodes
            .iter()
            .flat_map(|n| n.spec.steps.iter().chain(n.spec.post.all()));
        for step in stage_steps.chain(self.definition.post.all()) {
            if !registry.has(&step.uses) {
                return Err(ConveyorError::Validation(format!(
                    "step '{}' uses unknown executor '{}' (registered: {})",
                    step.name,
                    step.uses,
                    registry.kinds().join(", ")
                )));
            }
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn detect_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        for i in 0..self.nodes.len() {
            if !visited.contains(&i) {
                if let Some(cycle) = self.dfs_cycle(i, &mut visited, &mut path) {
                    return Err(ConveyorError::CyclicDependency { cycle });
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        i: usize,
        visited: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(i);
        path.push(i);

        for dep in &self.nodes[i].dependencies {
            let d = self.index[dep];
            if let Some(pos) = path.iter().position(|&p| p == d) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&p| self.nodes[p].name().to_string())
                    .collect();
                cycle.push(self.nodes[d].name().to_string());
                return Some(cycle);
            }
            if !visited.contains(&d) {
                if let Some(cycle) = self.dfs_cycle(d, visited, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        None
    }

    fn kahn_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &self.dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() != self.nodes.len() {
            // detect_cycles runs first, so this only guards against inconsistency.
            return Err(ConveyorError::Validation(
                "dependency graph could not be ordered".into(),
            ));
        }
        Ok(order)
    }

    /// Every consumed artifact must be produced earlier in the same stage or by
    /// a stage the consumer (transitively) depends on.
    fn validate_artifact_flow(&self) -> Result<()> {
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for step in &node.spec.steps {
                for artifact in &step.produces {
                    if let Some(&other) = producers.get(artifact.name.as_str()) {
                        return Err(ConveyorError::Validation(format!(
                            "artifact '{}' is produced by both '{}' and '{}'",
                            artifact.name,
                            self.nodes[other].name(),
                            node.name()
                        )));
                    }
                    producers.insert(&artifact.name, i);
                }
            }
        }

        for (i, node) in self.nodes.iter().enumerate() {
            let ancestors = self.ancestors(i);
            let mut produced_here = HashSet::new();
            for step in &node.spec.steps {
                for artifact in &step.consumes {
                    let ok = produced_here.contains(artifact.name.as_str())
                        || producers
                            .get(artifact.name.as_str())
                            .is_some_and(|p| ancestors.contains(p));
                    if !ok {
                        return Err(ConveyorError::Validation(format!(
                            "stage '{}' consumes artifact '{}' that no upstream stage produces",
                            node.name(),
                            artifact.name
                        )));
                    }
                }
                produced_here.extend(step.produces.iter().map(|a| a.name.as_str()));
            }
        }
        Ok(())
    }

    fn ancestors(&self, i: usize) -> HashSet<usize> {
        let mut reached = HashSet::new();
        let mut stack = vec![i];
        while let Some(n) = stack.pop() {
            for dep in &self.nodes[n].dependencies {
                let d = self.index[dep];
                if reached.insert(d) {
                    stack.push(d);
                }
            }
        }
        reached
    }
}

// ---------------------------------------------------------------------------
// Definition checks
// ---------------------------------------------------------------------------

fn validate_definition(def: &PipelineDefinition) -> Result<()> {
    if def.name.trim().is_empty() {
        return Err(ConveyorError::Validation("pipeline name is empty".into()));
    }
    if def.stages.is_empty() {
        return Err(ConveyorError::Validation(format!(
            "pipeline '{}' has no stages",
            def.name
        )));
    }

    for stage in &def.stages {
        if stage.name.trim().is_empty() {
            return Err(ConveyorError::Validation("stage name is empty".into()));
        }
        if !stage_name_re().is_match(&stage.name) {
            return Err(ConveyorError::Validation(format!(
                "invalid stage name '{}'",
                stage.name
            )));
        }
        if stage.steps.is_empty() {
            return Err(ConveyorError::Validation(format!(
                "stage '{}' has no steps",
                stage.name
            )));
        }
        if stage.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConveyorError::Validation(format!(
                "stage '{}' has a zero timeout",
                stage.name
            )));
        }
        for step in &stage.steps {
            validate_step(&stage.name, step)?;
        }
        for hook in stage.post.all() {
            validate_hook(&stage.name, hook)?;
        }
    }
    for hook in def.post.all() {
        validate_hook("<pipeline post>", hook)?;
    }
    Ok(())
}

fn validate_hook(owner: &str, hook: &StepSpec) -> Result<()> {
    validate_step(owner, hook)?;
    if !hook.produces.is_empty() || !hook.consumes.is_empty() {
        return Err(ConveyorError::Validation(format!(
            "hook '{}' of '{}' cannot exchange artifacts",
            hook.name, owner
        )));
    }
    if hook.idempotency_key.is_some() {
        return Err(ConveyorError::Validation(format!(
            "hook '{}' of '{}' cannot carry an idempotency key",
            hook.name, owner
        )));
    }
    Ok(())
}

fn validate_step(stage: &str, step: &StepSpec) -> Result<()> {
    if step.name.trim().is_empty() {
        return Err(ConveyorError::Validation(format!(
            "stage '{}' has a step without a name",
            stage
        )));
    }
    if step.command.run.trim().is_empty() {
        return Err(ConveyorError::Validation(format!(
            "step '{}' in stage '{}' has an empty command",
            step.name, stage
        )));
    }
    for binding in &step.credentials {
        if !env_name_re().is_match(&binding.env) {
            return Err(ConveyorError::Validation(format!(
                "step '{}' binds credential '{}' to invalid variable name '{}'",
                step.name, binding.id, binding.env
            )));
        }
    }
    for artifact in step.produces.iter().chain(step.consumes.iter()) {
        if !artifact_name_re().is_match(&artifact.name) {
            return Err(ConveyorError::Validation(format!(
                "step '{}' references invalid artifact name '{}'",
                step.name, artifact.name
            )));
        }
        if artifact.path.is_absolute()
            || artifact
                .path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ConveyorError::Validation(format!(
                "artifact '{}' path {} must stay inside the workspace",
                artifact.name,
                artifact.path.display()
            )));
        }
    }
    Ok(())
}
