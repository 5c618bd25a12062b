//! Confirmation tracking for submitted transactions
//!
//! A transaction is confirmed once its receipt exists, reports success and
//! sits `confirmation_blocks` deep. Waits are always bounded by a timeout.

use super::ChainConnection;
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::types::{TransactionReceipt, H256};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polls receipts for transactions on a specific chain
pub struct ConfirmationWatcher {
    /// Chain ID
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    /// Delay between receipt polls
    poll_interval: Duration,
}

impl ConfirmationWatcher {
    pub fn new(chain_id: u64, confirmation_blocks: u64, poll_interval: Duration) -> Self {
        Self {
            chain_id,
            confirmation_blocks: confirmation_blocks.max(1),
            poll_interval,
        }
    }

    /// Wait for `tx_hash` to be confirmed, giving up after `timeout`
    pub async fn wait(
        &self,
        connection: &ChainConnection,
        tx_hash: H256,
        timeout: Duration,
    ) -> OrchestratorResult<TransactionReceipt> {
        match tokio::time::timeout(timeout, self.poll(connection, tx_hash)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "No confirmation for {:?} on chain {} within {:?}",
                    tx_hash, self.chain_id, timeout
                );
                Err(OrchestratorError::Timeout {
                    operation: format!("confirmation of {:?} on chain {}", tx_hash, self.chain_id),
                })
            }
        }
    }

    async fn poll(
        &self,
        connection: &ChainConnection,
        tx_hash: H256,
    ) -> OrchestratorResult<TransactionReceipt> {
        loop {
            if let Some(receipt) = connection.get_transaction_receipt(tx_hash).await? {
                if let Some(block) = receipt.block_number {
                    if receipt.status == Some(0u64.into()) {
                        warn!("Transaction {:?} reverted on chain {}", tx_hash, self.chain_id);
                        return Err(OrchestratorError::Revert {
                            chain_id: self.chain_id,
                            tx_hash,
                        });
                    }

                    let current_block = connection.get_block_number().await?;
                    let confirmations = confirmations_at(block.as_u64(), current_block);

                    if confirmations >= self.confirmation_blocks {
                        info!(
                            "Transaction {:?} confirmed on chain {} ({} confirmations)",
                            tx_hash, self.chain_id, confirmations
                        );
                        return Ok(receipt);
                    }

                    debug!(
                        "Transaction {:?} has {} / {} confirmations on chain {}",
                        tx_hash, confirmations, self.confirmation_blocks, self.chain_id
                    );
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// The inclusion block itself counts as the first confirmation
fn confirmations_at(inclusion_block: u64, current_block: u64) -> u64 {
    if current_block < inclusion_block {
        return 0;
    }
    current_block - inclusion_block + 1
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Local development nodes and forks mine instantly
        31337 | 1337 => 1,
        // Ethereum mainnet
        1 => 3,
        // Ethereum testnets
        11155111 | 17000 => 2,
        _ => 1,
    }
}
