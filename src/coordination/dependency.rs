//! Dependency graph for tracking step ordering within a run

use super::step::{Dependency, DependencyKind, Pipeline, StepStatus};
use crate::error::{OrchestratorError, OrchestratorResult};

use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Dependency graph for a pipeline's steps
#[derive(Debug)]
pub struct DependencyGraph {
    /// Step IDs in pipeline order
    order: Vec<String>,
    /// Current state of each step
    states: HashMap<String, StepStatus>,
    /// Dependencies: step -> what it waits on
    dependencies: HashMap<String, Vec<Dependency>>,
    /// Dependents: step -> steps waiting on it
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Validate a pipeline and build its graph.
    ///
    /// Dependencies may only name earlier steps, which keeps the graph
    /// acyclic. Steps that something waits on for confirmation are promoted
    /// to require confirmation; steps whose output is consumed are promoted
    /// to capture it.
    pub fn build(pipeline: &mut Pipeline) -> OrchestratorResult<Self> {
        let mut order = Vec::with_capacity(pipeline.len());
        let mut states = HashMap::new();
        let mut dependencies = HashMap::new();
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();
        let mut needs_confirmation = HashSet::new();
        let mut needs_output = HashSet::new();

        for step in &pipeline.steps {
            step.validate()?;

            if states.contains_key(&step.id) {
                return Err(OrchestratorError::Pipeline(format!(
                    "Duplicate step id {}",
                    step.id
                )));
            }

            let deps = step.dependencies();
            for dep in &deps {
                if dep.step == step.id {
                    return Err(OrchestratorError::Pipeline(format!(
                        "Step {} depends on itself",
                        step.id
                    )));
                }
                if !states.contains_key(&dep.step) {
                    return Err(OrchestratorError::Pipeline(format!(
                        "Step {} depends on {}, which is not an earlier step",
                        step.id, dep.step
                    )));
                }
                if dep.kind == DependencyKind::Confirmation {
                    needs_confirmation.insert(dep.step.clone());
                }
                dependents
                    .entry(dep.step.clone())
                    .or_default()
                    .insert(step.id.clone());
            }
            for source in step.output_sources() {
                needs_output.insert(source.to_string());
            }

            order.push(step.id.clone());
            states.insert(step.id.clone(), StepStatus::Pending);
            dependencies.insert(step.id.clone(), deps);
        }

        for step in &mut pipeline.steps {
            if needs_confirmation.contains(&step.id) && !step.requires_confirmation {
                debug!("Step {} must be confirmed before its dependents run", step.id);
                step.requires_confirmation = true;
            }
            if needs_output.contains(&step.id) {
                step.capture_output = true;
            }
        }

        Ok(Self {
            order,
            states,
            dependencies,
            dependents,
        })
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.states.get(step).copied()
    }

    pub fn dependencies_of(&self, step: &str) -> &[Dependency] {
        self.dependencies
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether every dependency of `step` has reached the state it needs
    pub fn is_ready(&self, step: &str) -> bool {
        self.status(step) == Some(StepStatus::Pending)
            && self.dependencies_of(step).iter().all(|dep| {
                self.status(&dep.step)
                    .map(|s| s.satisfies(dep.kind))
                    .unwrap_or(false)
            })
    }

    /// Ready steps not yet started, in pipeline order
    pub fn ready_steps(&self, started: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !started.contains(*id) && self.is_ready(id))
            .cloned()
            .collect()
    }

    pub fn mark_submitted(&mut self, step: &str) {
        self.set(step, StepStatus::Submitted);
    }

    pub fn mark_confirmed(&mut self, step: &str) {
        self.set(step, StepStatus::Confirmed);
    }

    pub fn mark_failed(&mut self, step: &str) {
        self.set(step, StepStatus::Failed);
    }

    fn set(&mut self, step: &str, status: StepStatus) {
        if let Some(state) = self.states.get_mut(step) {
            *state = status;
        }
    }

    /// Every step that transitively waits on `step`
    pub fn transitive_dependents(&self, step: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![step.to_string()];

        while let Some(current) = stack.pop() {
            if let Some(waiting) = self.dependents.get(&current) {
                for dependent in waiting {
                    if seen.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
        seen
    }

    /// The failed step, if any, that `step` transitively waits on
    pub fn failed_ancestor(&self, step: &str) -> Option<String> {
        let mut stack: Vec<&str> = vec![step];
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            for dep in self.dependencies_of(current) {
                if self.status(&dep.step) == Some(StepStatus::Failed) {
                    return Some(dep.step.clone());
                }
                if seen.insert(dep.step.as_str()) {
                    stack.push(dep.step.as_str());
                }
            }
        }
        None
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }
}
