//! Gas limits and fee pricing for outgoing transactions

use crate::chain::{ChainConnection, GasPrice};
use crate::error::OrchestratorResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use tracing::debug;

/// Fields shared by every transaction the orchestrator builds
#[derive(Debug, Clone)]
pub struct TxFields {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub nonce: u64,
}

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimate the gas limit for a call and add the safety buffer
    pub async fn estimate_gas_limit(
        &self,
        connection: &ChainConnection,
        fields: &TxFields,
    ) -> OrchestratorResult<U256> {
        let probe: TypedTransaction = TransactionRequest::new()
            .from(fields.from)
            .to(fields.to)
            .data(fields.data.clone())
            .value(fields.value)
            .into();

        let estimate = connection.estimate_gas(probe).await?;
        let buffered = estimate + estimate * self.gas_limit_buffer_percent / 100;

        debug!(
            "Gas limit on chain {}: {} (estimated {})",
            connection.chain_id(),
            buffered,
            estimate
        );
        Ok(buffered)
    }

    /// Get the connection's gas price with the buffer applied
    pub async fn get_gas_price(&self, connection: &ChainConnection) -> OrchestratorResult<GasPrice> {
        let gas_price = connection.gas_price().await?;
        let buffered = self.buffer_price(&gas_price);

        debug!("Gas price for chain {}: {:?}", connection.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, gas_price: &GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = *price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(*price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = *max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    *max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: *max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: *max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Build a typed transaction with an explicit nonce, gas limit and price
    pub fn build_transaction(
        fields: &TxFields,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(fields.from)
                .to(fields.to)
                .data(fields.data.clone())
                .value(fields.value)
                .nonce(fields.nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(fields.from)
                .to(fields.to)
                .data(fields.data.clone())
                .value(fields.value)
                .nonce(fields.nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .into(),
        }
    }

    /// Calculate maximum total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
