//! Credentials and network-bound signers
//!
//! Private keys are read from the environment only and never logged.

use crate::chain::ChainConnection;
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// An account able to sign transactions
#[derive(Clone)]
pub struct Credential {
    name: String,
    wallet: LocalWallet,
}

impl Credential {
    /// Create a credential from a hex-encoded private key (with or without 0x)
    pub fn from_private_key(name: &str, private_key_hex: &str) -> OrchestratorResult<Self> {
        let key_hex = private_key_hex.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let wallet = key_hex.parse::<LocalWallet>().map_err(|e| {
            OrchestratorError::Signing(format!("Invalid private key for {}: {}", name, e))
        })?;

        info!("Loaded credential {} ({:?})", name, wallet.address());

        Ok(Self {
            name: name.to_string(),
            wallet,
        })
    }

    /// Load the private key from the named environment variable
    pub fn from_env(name: &str, env_var: &str) -> OrchestratorResult<Self> {
        let key = std::env::var(env_var).map_err(|_| {
            OrchestratorError::Signing(format!(
                "Environment variable {} for credential {} is not set",
                env_var, name
            ))
        })?;

        Self::from_private_key(name, &key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Bind this credential to a connection; the credential itself is unchanged
    pub fn connect(&self, connection: Arc<ChainConnection>) -> BoundSigner {
        BoundSigner {
            wallet: self.wallet.clone().with_chain_id(connection.chain_id()),
            connection,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("address", &self.address())
            .finish()
    }
}

/// A credential connected to exactly one network
#[derive(Clone, Debug)]
pub struct BoundSigner {
    wallet: LocalWallet,
    connection: Arc<ChainConnection>,
}

impl BoundSigner {
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.connection.chain_id()
    }

    pub fn connection(&self) -> &Arc<ChainConnection> {
        &self.connection
    }

    /// Sign `tx` for this signer's chain and return the raw payload
    pub async fn sign(&self, tx: &TypedTransaction) -> OrchestratorResult<Bytes> {
        let mut tx = tx.clone();
        tx.set_chain_id(self.chain_id());
        tx.set_from(self.address());

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| OrchestratorError::Signing(e.to_string()))?;

        debug!(
            "Signed nonce {:?} for {:?} on chain {}",
            tx.nonce(),
            self.address(),
            self.chain_id()
        );

        Ok(tx.rlp_signed(&signature))
    }

    /// Sign `tx` and broadcast it through the bound connection
    pub async fn sign_and_send(&self, tx: &TypedTransaction) -> OrchestratorResult<H256> {
        let raw = self.sign(tx).await?;
        self.connection.submit(raw).await
    }
}
