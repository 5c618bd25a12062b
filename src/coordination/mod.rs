//! Coordination of dependent transaction steps
//!
//! The orchestrator:
//! 1. Validates a pipeline into a dependency graph
//! 2. Starts every step whose dependencies are satisfied
//! 3. Feeds decoded outputs of confirmed steps into later arguments
//! 4. Stops the dependents of failed steps and reports every outcome

pub mod dependency;
pub mod engine;
pub mod step;

pub use dependency::DependencyGraph;
pub use engine::{Orchestrator, RunReport};
pub use step::{
    Dependency, DependencyKind, OutputSelector, Pipeline, StepArg, StepResult, StepStatus,
    TransactionStep,
};
