//! Chain module - network connections used by the orchestrator
//!
//! This module provides:
//! - The `ChainClient` seam over JSON-RPC transport
//! - `ChainConnection`, a shared handle to one network
//! - Receipt polling with bounded confirmation waits
//! - `ChainManager`, the registry of connections for a run

pub mod confirmation;
#[cfg(test)]
pub mod fake;
pub mod provider;

pub use confirmation::{recommended_confirmations, ConfirmationWatcher};
pub use provider::{GasPrice, HttpChainClient};

use crate::config::{NetworkConfig, Settings};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// JSON-RPC operations the orchestrator needs from a network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `eth_chainId`
    async fn get_chain_id(&self) -> OrchestratorResult<u64>;

    /// `eth_getBalance` at the latest block
    async fn get_balance(&self, address: Address) -> OrchestratorResult<U256>;

    /// `eth_getTransactionCount` at the pending block
    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64>;

    /// `eth_sendRawTransaction`
    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256>;

    /// `eth_getTransactionReceipt`
    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>>;

    /// `eth_blockNumber`
    async fn get_block_number(&self) -> OrchestratorResult<u64>;

    /// `eth_call` at the latest block
    async fn call(&self, tx: TypedTransaction) -> OrchestratorResult<Bytes>;

    /// `eth_estimateGas`
    async fn estimate_gas(&self, tx: TypedTransaction) -> OrchestratorResult<U256>;

    /// Current gas price according to the network's pricing strategy
    async fn gas_price(&self) -> OrchestratorResult<GasPrice>;
}

/// Read/write channel to one network
pub struct ChainConnection {
    name: String,
    endpoint: String,
    chain_id: u64,
    confirmation_blocks: u64,
    poll_interval: Duration,
    client: Arc<dyn ChainClient>,
}

impl ChainConnection {
    /// Connect over HTTP and verify the endpoint serves the configured chain
    pub async fn connect(
        name: &str,
        config: &NetworkConfig,
        poll_interval: Duration,
    ) -> OrchestratorResult<Self> {
        let client = HttpChainClient::new(config)?;
        let connection = Self::with_client(
            name,
            &config.rpc_url,
            config.chain_id,
            config
                .confirmation_blocks
                .unwrap_or_else(|| recommended_confirmations(config.chain_id)),
            poll_interval,
            Arc::new(client),
        );

        connection.verify_chain_id().await?;
        Ok(connection)
    }

    /// Build a connection over an arbitrary client
    pub fn with_client(
        name: &str,
        endpoint: &str,
        chain_id: u64,
        confirmation_blocks: u64,
        poll_interval: Duration,
        client: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            chain_id,
            confirmation_blocks: confirmation_blocks.max(1),
            poll_interval,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Fail if the endpoint reports a different chain ID than configured
    pub async fn verify_chain_id(&self) -> OrchestratorResult<()> {
        let reported = self.client.get_chain_id().await?;
        if reported != self.chain_id {
            return Err(OrchestratorError::Config(format!(
                "Endpoint for {} reports chain {} but {} was configured",
                self.name, reported, self.chain_id
            )));
        }
        debug!("Verified chain {} for {}", self.chain_id, self.name);
        Ok(())
    }

    pub async fn get_balance(&self, address: Address) -> OrchestratorResult<U256> {
        self.client.get_balance(address).await
    }

    pub async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        self.client.get_transaction_count(address).await
    }

    /// Broadcast a signed transaction payload
    pub async fn submit(&self, raw: Bytes) -> OrchestratorResult<H256> {
        let tx_hash = self.client.send_raw_transaction(raw).await?;
        debug!("Broadcast {:?} on chain {}", tx_hash, self.chain_id);
        Ok(tx_hash)
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        self.client.get_transaction_receipt(tx_hash).await
    }

    pub async fn get_block_number(&self) -> OrchestratorResult<u64> {
        self.client.get_block_number().await
    }

    pub async fn call(&self, tx: TypedTransaction) -> OrchestratorResult<Bytes> {
        self.client.call(tx).await
    }

    pub async fn estimate_gas(&self, tx: TypedTransaction) -> OrchestratorResult<U256> {
        self.client.estimate_gas(tx).await
    }

    pub async fn gas_price(&self) -> OrchestratorResult<GasPrice> {
        self.client.gas_price().await
    }

    /// Wait until the transaction is mined with enough confirmations.
    ///
    /// A reverted receipt yields `Revert`; exceeding `timeout` yields `Timeout`.
    pub async fn await_confirmation(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> OrchestratorResult<TransactionReceipt> {
        ConfirmationWatcher::new(self.chain_id, self.confirmation_blocks, self.poll_interval)
            .wait(self, tx_hash, timeout)
            .await
    }
}

impl fmt::Debug for ChainConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConnection")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("confirmation_blocks", &self.confirmation_blocks)
            .finish()
    }
}

/// Connections for every enabled network, indexed by chain ID
pub struct ChainManager {
    connections: DashMap<u64, Arc<ChainConnection>>,
}

impl ChainManager {
    /// Connect to every enabled network in the settings
    pub async fn new(settings: &Settings) -> OrchestratorResult<Self> {
        let manager = Self::empty();
        let poll_interval = Duration::from_millis(settings.orchestrator.poll_interval_ms);

        for (name, network) in settings.enabled_networks() {
            info!("Connecting to {} (chain {})", name, network.chain_id);
            let connection = ChainConnection::connect(name, network, poll_interval).await?;
            manager.insert(connection);
        }

        Ok(manager)
    }

    pub fn empty() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn insert(&self, connection: ChainConnection) -> Arc<ChainConnection> {
        let connection = Arc::new(connection);
        self.connections
            .insert(connection.chain_id(), connection.clone());
        connection
    }

    /// Get connection for a specific chain
    pub fn get_connection(&self, chain_id: u64) -> OrchestratorResult<Arc<ChainConnection>> {
        self.connections
            .get(&chain_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                OrchestratorError::Config(format!("Chain {} is not connected", chain_id))
            })
    }

    /// All connections, ordered by chain ID
    pub fn connections(&self) -> Vec<Arc<ChainConnection>> {
        let mut all: Vec<_> = self.connections.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.chain_id());
        all
    }
}
