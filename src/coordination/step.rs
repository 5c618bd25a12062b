//! Pipeline steps, argument references and per-step results

use crate::contract::ContractBinding;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::tx::BoundSigner;

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;

/// How a step waits on an earlier one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Submit once the dependency is broadcast; nonces keep the order
    Ordering,
    /// Submit once the dependency is confirmed on chain
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub step: String,
    pub kind: DependencyKind,
}

/// Which part of a decoded output value to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSelector {
    Whole,
    /// Last element of an array output, e.g. a router's final swap amount
    Last,
    Element(usize),
}

/// A call argument, fixed or taken from an earlier step's decoded output
#[derive(Debug, Clone, PartialEq)]
pub enum StepArg {
    Literal(Token),
    Output {
        step: String,
        index: usize,
        select: OutputSelector,
    },
}

impl StepArg {
    pub fn address(address: Address) -> Self {
        StepArg::Literal(Token::Address(address))
    }

    pub fn uint(value: impl Into<U256>) -> Self {
        StepArg::Literal(Token::Uint(value.into()))
    }

    pub fn output(step: &str, index: usize) -> Self {
        StepArg::Output {
            step: step.to_string(),
            index,
            select: OutputSelector::Whole,
        }
    }

    pub fn output_last(step: &str, index: usize) -> Self {
        StepArg::Output {
            step: step.to_string(),
            index,
            select: OutputSelector::Last,
        }
    }

    fn referenced_step(&self) -> Option<&str> {
        match self {
            StepArg::Literal(_) => None,
            StepArg::Output { step, .. } => Some(step),
        }
    }

    /// Substitute a reference with the producing step's decoded value
    fn resolve(&self, results: &HashMap<String, StepResult>) -> OrchestratorResult<Token> {
        match self {
            StepArg::Literal(token) => Ok(token.clone()),
            StepArg::Output {
                step,
                index,
                select,
            } => {
                let output = results
                    .get(step)
                    .and_then(|r| r.output.as_ref())
                    .ok_or_else(|| {
                        OrchestratorError::Pipeline(format!("Step {} has no decoded output", step))
                    })?;
                let value = output.get(*index).ok_or_else(|| {
                    OrchestratorError::Pipeline(format!(
                        "Step {} output has no value at index {}",
                        step, index
                    ))
                })?;
                select_from(value, select).ok_or_else(|| {
                    OrchestratorError::Pipeline(format!(
                        "Cannot select {:?} from output {} of step {}",
                        select, index, step
                    ))
                })
            }
        }
    }
}

fn select_from(value: &Token, select: &OutputSelector) -> Option<Token> {
    match (select, value) {
        (OutputSelector::Whole, _) => Some(value.clone()),
        (OutputSelector::Last, Token::Array(items) | Token::FixedArray(items)) => {
            items.last().cloned()
        }
        (OutputSelector::Element(i), Token::Array(items) | Token::FixedArray(items)) => {
            items.get(*i).cloned()
        }
        (OutputSelector::Element(i), Token::Tuple(items)) => items.get(*i).cloned(),
        _ => None,
    }
}

/// Resolve every argument of a step against recorded results
pub fn resolve_args(
    args: &[StepArg],
    results: &HashMap<String, StepResult>,
) -> OrchestratorResult<Vec<Token>> {
    args.iter().map(|arg| arg.resolve(results)).collect()
}

/// One write call in a pipeline
#[derive(Debug, Clone)]
pub struct TransactionStep {
    pub id: String,
    pub binding: Arc<ContractBinding>,
    pub signer: BoundSigner,
    pub method: String,
    pub args: Vec<StepArg>,
    pub value: Option<U256>,
    pub gas_limit: Option<U256>,
    pub requires_confirmation: bool,
    /// Simulate the call before sending and keep its decoded return value
    pub capture_output: bool,
    pub depends_on: Vec<Dependency>,
}

impl TransactionStep {
    pub fn new(id: &str, binding: Arc<ContractBinding>, signer: BoundSigner, method: &str) -> Self {
        Self {
            id: id.to_string(),
            binding,
            signer,
            method: method.to_string(),
            args: Vec::new(),
            value: None,
            gas_limit: None,
            requires_confirmation: true,
            capture_output: false,
            depends_on: Vec::new(),
        }
    }

    pub fn args(mut self, args: Vec<StepArg>) -> Self {
        self.args = args;
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    pub fn gas_limit(mut self, gas_limit: impl Into<U256>) -> Self {
        self.gas_limit = Some(gas_limit.into());
        self
    }

    /// Submit and move on without waiting for a receipt
    pub fn fire_and_forget(mut self) -> Self {
        self.requires_confirmation = false;
        self
    }

    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Order after `step` by nonce only
    pub fn after(mut self, step: &str) -> Self {
        self.depends_on.push(Dependency {
            step: step.to_string(),
            kind: DependencyKind::Ordering,
        });
        self
    }

    /// Wait for `step` to be confirmed, e.g. an approval this step spends
    pub fn after_confirmed(mut self, step: &str) -> Self {
        self.depends_on.push(Dependency {
            step: step.to_string(),
            kind: DependencyKind::Confirmation,
        });
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.binding.connection().chain_id()
    }

    /// Declared dependencies plus a confirmation dependency per referenced output.
    /// When a step is named twice, the stronger requirement wins.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut merged: Vec<Dependency> = Vec::new();
        let implied = self
            .args
            .iter()
            .filter_map(StepArg::referenced_step)
            .map(|step| Dependency {
                step: step.to_string(),
                kind: DependencyKind::Confirmation,
            });

        for dep in self.depends_on.iter().cloned().chain(implied) {
            match merged.iter_mut().find(|d| d.step == dep.step) {
                Some(existing) => {
                    if dep.kind == DependencyKind::Confirmation {
                        existing.kind = DependencyKind::Confirmation;
                    }
                }
                None => merged.push(dep),
            }
        }
        merged
    }

    /// Steps whose decoded output this step consumes
    pub fn output_sources(&self) -> Vec<&str> {
        self.args.iter().filter_map(StepArg::referenced_step).collect()
    }

    /// Check the method and argument count against the binding's interface
    pub fn validate(&self) -> OrchestratorResult<()> {
        self.binding
            .interface()
            .check_arity(&self.method, self.args.len())
            .map_err(|e| OrchestratorError::Pipeline(format!("Step {}: {}", self.id, e)))?;

        if self.signer.chain_id() != self.chain_id() {
            return Err(OrchestratorError::Pipeline(format!(
                "Step {}: signer is bound to chain {} but {} lives on chain {}",
                self.id,
                self.signer.chain_id(),
                self.binding.name(),
                self.chain_id()
            )));
        }
        Ok(())
    }
}

/// An ordered list of steps executed as one run
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<TransactionStep>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: TransactionStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&TransactionStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Submitted => "submitted",
            StepStatus::Confirmed => "confirmed",
            StepStatus::Failed => "failed",
        }
    }

    /// Whether a dependency in this state satisfies `kind`
    pub fn satisfies(&self, kind: DependencyKind) -> bool {
        match kind {
            DependencyKind::Ordering => {
                matches!(self, StepStatus::Submitted | StepStatus::Confirmed)
            }
            DependencyKind::Confirmation => *self == StepStatus::Confirmed,
        }
    }
}

/// Outcome of one step in a run
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub chain_id: u64,
    pub signer: Address,
    pub nonce: Option<u64>,
    pub tx_hash: Option<H256>,
    pub status: StepStatus,
    /// Decoded return value, for steps that capture output
    pub output: Option<Vec<Token>>,
    pub receipt: Option<TransactionReceipt>,
    pub error: Option<OrchestratorError>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step: &TransactionStep) -> Self {
        Self {
            step_id: step.id.clone(),
            chain_id: step.chain_id(),
            signer: step.signer.address(),
            nonce: None,
            tx_hash: None,
            status: StepStatus::Pending,
            output: None,
            receipt: None,
            error: None,
            submitted_at: None,
            finished_at: None,
        }
    }
}
