//! HTTP JSON-RPC chain client backed by ethers

use super::ChainClient;
use crate::config::{GasPriceStrategy, NetworkConfig};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

/// Single-endpoint HTTP provider for one chain
pub struct HttpChainClient {
    chain_id: u64,
    provider: Provider<Http>,
    gas_price_strategy: GasPriceStrategy,
    max_gas_price_gwei: u64,
}

impl HttpChainClient {
    /// Create a new HTTP client from network configuration
    pub fn new(config: &NetworkConfig) -> OrchestratorResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| {
                OrchestratorError::Config(format!(
                    "Invalid RPC URL for chain {}: {}",
                    config.chain_id, e
                ))
            })?
            .interval(Duration::from_millis(100));

        debug!("Created HTTP provider for chain {}", config.chain_id);

        Ok(Self {
            chain_id: config.chain_id,
            provider,
            gas_price_strategy: config.gas_price_strategy,
            max_gas_price_gwei: config.max_gas_price_gwei,
        })
    }

    fn network_error(&self, e: impl Display) -> OrchestratorError {
        OrchestratorError::Network {
            chain_id: self.chain_id,
            message: e.to_string(),
        }
    }

    /// Estimate EIP-1559 fees from the latest block's base fee
    async fn estimate_eip1559_fees(&self) -> OrchestratorResult<(U256, U256)> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.network_error(e))?
            .ok_or_else(|| self.network_error("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| self.network_error("No base fee in block"))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee, capped at the configured ceiling
        let max_fee = base_fee * 2 + priority_fee;
        let ceiling = U256::from(self.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, ceiling);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn get_chain_id(&self) -> OrchestratorResult<u64> {
        self.provider
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| self.network_error(e))
    }

    async fn get_balance(&self, address: Address) -> OrchestratorResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| self.network_error(e))
    }

    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|count| count.as_u64())
            .map_err(|e| self.network_error(e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256> {
        self.provider
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| self.network_error(e))
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.network_error(e))
    }

    async fn get_block_number(&self) -> OrchestratorResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|block| block.as_u64())
            .map_err(|e| self.network_error(e))
    }

    async fn call(&self, tx: TypedTransaction) -> OrchestratorResult<Bytes> {
        self.provider
            .call(&tx, None)
            .await
            .map_err(|e| self.network_error(e))
    }

    async fn estimate_gas(&self, tx: TypedTransaction) -> OrchestratorResult<U256> {
        self.provider
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| self.network_error(e))
    }

    async fn gas_price(&self) -> OrchestratorResult<GasPrice> {
        match self.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .provider
                    .get_gas_price()
                    .await
                    .map_err(|e| self.network_error(e))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
