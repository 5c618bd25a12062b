//! In-memory chain used by orchestration tests.
//!
//! Decodes signed legacy transactions, mines each one into its own block and
//! can be told to revert or never mine calls by function selector.

use super::{ChainClient, ChainConnection, GasPrice};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Transaction, TransactionReceipt, H256, U256, U64};
use ethers::utils::rlp;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A transaction accepted by the fake chain
#[derive(Debug, Clone)]
pub struct Submission {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas: U256,
    pub input: Bytes,
}

impl Submission {
    pub fn selector(&self) -> [u8; 4] {
        selector_of(&self.input)
    }
}

#[derive(Default)]
struct FakeState {
    tx_counts: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    submissions: Vec<Submission>,
    receipts: HashMap<H256, TransactionReceipt>,
    block_number: u64,
    call_responses: HashMap<[u8; 4], Bytes>,
    reverting: HashSet<[u8; 4]>,
    stalled: HashSet<[u8; 4]>,
    refuse_broadcast: bool,
}

pub struct FakeChain {
    chain_id: u64,
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            state: Mutex::new(FakeState {
                block_number: 1,
                ..Default::default()
            }),
        })
    }

    pub fn connection(self: &Arc<Self>, name: &str) -> ChainConnection {
        ChainConnection::with_client(
            name,
            "memory://",
            self.chain_id,
            1,
            Duration::from_millis(5),
            self.clone(),
        )
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.lock().tx_counts.insert(address, count);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.lock().balances.insert(address, balance);
    }

    /// Answer `eth_call` for this selector with `data`
    pub fn respond_to_call(&self, selector: [u8; 4], data: Vec<u8>) {
        self.lock().call_responses.insert(selector, data.into());
    }

    /// Mine transactions with this selector as reverted
    pub fn revert_on(&self, selector: [u8; 4]) {
        self.lock().reverting.insert(selector);
    }

    /// Accept but never mine transactions with this selector
    pub fn stall_on(&self, selector: [u8; 4]) {
        self.lock().stalled.insert(selector);
    }

    pub fn refuse_broadcasts(&self) {
        self.lock().refuse_broadcast = true;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn submission_for(&self, selector: [u8; 4]) -> Option<Submission> {
        self.submissions()
            .into_iter()
            .find(|s| s.selector() == selector)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake chain state poisoned")
    }

    fn error(&self, message: &str) -> OrchestratorError {
        OrchestratorError::Network {
            chain_id: self.chain_id,
            message: message.to_string(),
        }
    }
}

fn selector_of(data: &[u8]) -> [u8; 4] {
    let mut selector = [0u8; 4];
    if data.len() >= 4 {
        selector.copy_from_slice(&data[..4]);
    }
    selector
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_chain_id(&self) -> OrchestratorResult<u64> {
        Ok(self.chain_id)
    }

    async fn get_balance(&self, address: Address) -> OrchestratorResult<U256> {
        Ok(self.lock().balances.get(&address).copied().unwrap_or_default())
    }

    async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        Ok(self.lock().tx_counts.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256> {
        let tx: Transaction =
            rlp::decode(raw.as_ref()).map_err(|e| self.error(&format!("bad payload: {}", e)))?;

        let mut state = self.lock();
        if state.refuse_broadcast {
            return Err(self.error("broadcast refused"));
        }

        let submission = Submission {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            nonce: tx.nonce.as_u64(),
            value: tx.value,
            gas: tx.gas,
            input: tx.input.clone(),
        };
        let selector = submission.selector();
        state.submissions.push(submission);

        if !state.stalled.contains(&selector) {
            state.block_number += 1;
            let status = if state.reverting.contains(&selector) { 0u64 } else { 1u64 };
            let receipt = TransactionReceipt {
                transaction_hash: tx.hash,
                block_number: Some(U64::from(state.block_number)),
                from: tx.from,
                to: tx.to,
                status: Some(U64::from(status)),
                ..Default::default()
            };
            state.receipts.insert(tx.hash, receipt);
        }

        Ok(tx.hash)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        Ok(self.lock().receipts.get(&tx_hash).cloned())
    }

    async fn get_block_number(&self) -> OrchestratorResult<u64> {
        Ok(self.lock().block_number)
    }

    async fn call(&self, tx: TypedTransaction) -> OrchestratorResult<Bytes> {
        let selector = tx.data().map(|d| selector_of(d)).unwrap_or_default();
        Ok(self
            .lock()
            .call_responses
            .get(&selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn estimate_gas(&self, _tx: TypedTransaction) -> OrchestratorResult<U256> {
        Ok(U256::from(100_000u64))
    }

    async fn gas_price(&self) -> OrchestratorResult<GasPrice> {
        Ok(GasPrice::Legacy(U256::from(1_000_000_000u64)))
    }
}
