//! Error types for the pipeline orchestrator

use ethers::types::{Address, H256};
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error on chain {chain_id}: {message}")]
    Network { chain_id: u64, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction {tx_hash:?} reverted on chain {chain_id}")]
    Revert { chain_id: u64, tx_hash: H256 },

    #[error("Nonce {nonce} for {address:?} on chain {chain_id} was already issued")]
    NonceConflict {
        chain_id: u64,
        address: Address,
        nonce: u64,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Invalid pipeline: {0}")]
    Pipeline(String),

    #[error("Step {step} blocked by failed dependency {dependency}")]
    DependencyFailed { step: String, dependency: String },

    #[error("Run cancelled before step {step} started")]
    Cancelled { step: String },
}

impl OrchestratorError {
    /// Errors that invalidate the whole run rather than a single step
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Signing(_) | OrchestratorError::NonceConflict { .. }
        )
    }

    /// Short label used for metrics and the run report
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Network { .. } => "network",
            OrchestratorError::Signing(_) => "signing",
            OrchestratorError::Revert { .. } => "revert",
            OrchestratorError::NonceConflict { .. } => "nonce_conflict",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::Contract(_) => "contract",
            OrchestratorError::Pipeline(_) => "pipeline",
            OrchestratorError::DependencyFailed { .. } => "dependency_failed",
            OrchestratorError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
