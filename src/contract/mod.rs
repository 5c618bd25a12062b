//! Typed contract bindings
//!
//! Interfaces are declared up front from human-readable signatures and
//! validated before anything is encoded or sent. Writes always carry the
//! nonce chosen by the caller.

use crate::chain::ChainConnection;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::tx::{BoundSigner, GasEstimator, TxFields};

use ethers::abi::{Abi, Function, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use std::sync::Arc;
use tracing::debug;

/// Statically described contract interface
#[derive(Debug, Clone)]
pub struct ContractInterface {
    abi: Abi,
}

impl ContractInterface {
    /// Parse human-readable signatures such as
    /// `function approve(address spender, uint256 amount) returns (bool)`
    pub fn parse(signatures: &[&str]) -> OrchestratorResult<Self> {
        let abi = ethers::abi::parse_abi(signatures)
            .map_err(|e| OrchestratorError::Contract(format!("Invalid interface: {}", e)))?;
        Ok(Self { abi })
    }

    pub fn function(&self, method: &str) -> OrchestratorResult<&Function> {
        self.abi
            .function(method)
            .map_err(|_| OrchestratorError::Contract(format!("Unknown method {}", method)))
    }

    /// Fail unless `method` exists and takes exactly `arg_count` arguments
    pub fn check_arity(&self, method: &str, arg_count: usize) -> OrchestratorResult<()> {
        let function = self.function(method)?;
        if function.inputs.len() != arg_count {
            return Err(OrchestratorError::Contract(format!(
                "{} expects {} arguments, got {}",
                method,
                function.inputs.len(),
                arg_count
            )));
        }
        Ok(())
    }

    /// ABI-encode a call, checking argument count and types
    pub fn encode(&self, method: &str, args: &[Token]) -> OrchestratorResult<Bytes> {
        self.check_arity(method, args.len())?;
        let data = self
            .function(method)?
            .encode_input(args)
            .map_err(|e| {
                OrchestratorError::Contract(format!("Cannot encode {} arguments: {}", method, e))
            })?;
        Ok(data.into())
    }

    pub fn decode_output(&self, method: &str, data: &[u8]) -> OrchestratorResult<Vec<Token>> {
        self.function(method)?
            .decode_output(data)
            .map_err(|e| {
                OrchestratorError::Contract(format!("Cannot decode {} output: {}", method, e))
            })
    }

    pub fn selector(&self, method: &str) -> OrchestratorResult<[u8; 4]> {
        Ok(self.function(method)?.short_signature())
    }
}

/// Per-send overrides; the nonce is always explicit
#[derive(Debug, Clone, Default)]
pub struct SendOverrides {
    pub nonce: u64,
    pub gas_limit: Option<U256>,
    pub value: Option<U256>,
}

/// A deployed contract reachable through one connection
#[derive(Debug, Clone)]
pub struct ContractBinding {
    name: String,
    address: Address,
    interface: Arc<ContractInterface>,
    connection: Arc<ChainConnection>,
    gas_estimator: GasEstimator,
}

impl ContractBinding {
    /// Create a binding, failing fast if any `required_methods` is missing
    pub fn new(
        name: &str,
        address: Address,
        interface: Arc<ContractInterface>,
        connection: Arc<ChainConnection>,
        required_methods: &[&str],
    ) -> OrchestratorResult<Self> {
        for method in required_methods {
            interface.function(method).map_err(|_| {
                OrchestratorError::Contract(format!("{} interface has no method {}", name, method))
            })?;
        }

        Ok(Self {
            name: name.to_string(),
            address,
            interface,
            connection,
            gas_estimator: GasEstimator::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn interface(&self) -> &ContractInterface {
        &self.interface
    }

    pub fn connection(&self) -> &Arc<ChainConnection> {
        &self.connection
    }

    /// Read-only call; no signer or nonce involved
    pub async fn call(&self, method: &str, args: &[Token]) -> OrchestratorResult<Vec<Token>> {
        self.eth_call(method, args, None, None).await
    }

    /// Execute a write method with `eth_call` from `from` and decode what it
    /// would return, without broadcasting anything
    pub async fn simulate(
        &self,
        method: &str,
        args: &[Token],
        from: Address,
        value: Option<U256>,
    ) -> OrchestratorResult<Vec<Token>> {
        self.eth_call(method, args, Some(from), value).await
    }

    async fn eth_call(
        &self,
        method: &str,
        args: &[Token],
        from: Option<Address>,
        value: Option<U256>,
    ) -> OrchestratorResult<Vec<Token>> {
        let data = self.interface.encode(method, args)?;

        let mut request = TransactionRequest::new().to(self.address).data(data);
        if let Some(from) = from {
            request = request.from(from);
        }
        if let Some(value) = value {
            request = request.value(value);
        }

        let output = self.connection.call(request.into()).await?;
        self.interface.decode_output(method, &output)
    }

    /// Build the signed-ready transaction for a write
    pub async fn prepare(
        &self,
        method: &str,
        args: &[Token],
        signer: &BoundSigner,
        overrides: &SendOverrides,
    ) -> OrchestratorResult<TypedTransaction> {
        if signer.chain_id() != self.connection.chain_id() {
            return Err(OrchestratorError::Config(format!(
                "Signer bound to chain {} cannot send to {} on chain {}",
                signer.chain_id(),
                self.name,
                self.connection.chain_id()
            )));
        }

        let fields = TxFields {
            from: signer.address(),
            to: self.address,
            data: self.interface.encode(method, args)?,
            value: overrides.value.unwrap_or_default(),
            nonce: overrides.nonce,
        };

        let gas_limit = match overrides.gas_limit {
            Some(limit) => limit,
            None => {
                self.gas_estimator
                    .estimate_gas_limit(&self.connection, &fields)
                    .await?
            }
        };
        let gas_price = self.gas_estimator.get_gas_price(&self.connection).await?;

        debug!(
            "Prepared {}.{} nonce {} calldata 0x{}",
            self.name,
            method,
            fields.nonce,
            hex::encode(&fields.data)
        );

        Ok(GasEstimator::build_transaction(&fields, gas_limit, &gas_price))
    }

    /// Sign and broadcast a write with the caller-supplied nonce
    pub async fn send(
        &self,
        method: &str,
        args: &[Token],
        signer: &BoundSigner,
        overrides: SendOverrides,
    ) -> OrchestratorResult<H256> {
        let tx = self.prepare(method, args, signer, &overrides).await?;
        signer.sign_and_send(&tx).await
    }
}
