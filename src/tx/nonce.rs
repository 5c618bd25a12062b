//! Nonce allocation for dependent transaction pipelines
//!
//! Handles:
//! - Lazy seeding from the on-chain transaction count
//! - Atomic per-(address, chain) allocation
//! - Conflict detection and rewinding of never-broadcast nonces

use crate::chain::ChainConnection;
use crate::error::{OrchestratorError, OrchestratorResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Nonce state for one (address, chain) key
#[derive(Default)]
struct KeyState {
    /// Next nonce to hand out; `None` until seeded from the chain
    next: Option<u64>,
    /// Nonces handed out during this run
    issued: BTreeSet<u64>,
}

/// Hands out strictly increasing nonces per (address, chain ID)
#[derive(Default)]
pub struct NonceTracker {
    keys: DashMap<(Address, u64), Arc<Mutex<KeyState>>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, address: Address, chain_id: u64) -> Arc<Mutex<KeyState>> {
        self.keys
            .entry((address, chain_id))
            .or_default()
            .value()
            .clone()
    }

    /// Allocate the next nonce for `address` on `connection`'s chain.
    ///
    /// The per-key lock is held across seeding, so concurrent first callers
    /// never both seed from the same transaction count.
    pub async fn next(
        &self,
        address: Address,
        connection: &ChainConnection,
    ) -> OrchestratorResult<u64> {
        let chain_id = connection.chain_id();
        let slot = self.slot(address, chain_id);
        let mut state = slot.lock().await;

        let nonce = match state.next {
            Some(nonce) => nonce,
            None => {
                let on_chain = connection.get_transaction_count(address).await?;
                debug!(
                    "Seeded nonce for {:?} on chain {}: {}",
                    address, chain_id, on_chain
                );
                on_chain
            }
        };

        if !state.issued.insert(nonce) {
            return Err(OrchestratorError::NonceConflict {
                chain_id,
                address,
                nonce,
            });
        }
        state.next = Some(nonce + 1);

        debug!("Allocated nonce {} for {:?} on chain {}", nonce, address, chain_id);
        Ok(nonce)
    }

    /// Return a nonce whose transaction was never broadcast.
    ///
    /// Only the most recently allocated nonce can be rewound; releasing an
    /// older one leaves a gap that later transactions will queue behind.
    pub async fn release(&self, address: Address, chain_id: u64, nonce: u64) -> bool {
        let slot = self.slot(address, chain_id);
        let mut state = slot.lock().await;

        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            state.issued.remove(&nonce);
            debug!("Released nonce {} for {:?} on chain {}", nonce, address, chain_id);
            true
        } else {
            warn!(
                "Nonce {} for {:?} on chain {} cannot be rewound; later nonces are already issued",
                nonce, address, chain_id
            );
            false
        }
    }

    /// Next nonce that would be allocated, if the key has been seeded
    pub async fn peek(&self, address: Address, chain_id: u64) -> Option<u64> {
        let slot = self.keys.get(&(address, chain_id))?.value().clone();
        let state = slot.lock().await;
        state.next
    }

    /// All nonces issued for a key, ascending
    pub async fn issued(&self, address: Address, chain_id: u64) -> Vec<u64> {
        match self.keys.get(&(address, chain_id)).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.issued.iter().copied().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use std::time::Duration;

    fn connection(mock: MockChainClient, chain_id: u64) -> Arc<ChainConnection> {
        Arc::new(ChainConnection::with_client(
            "test",
            "http://localhost:8545",
            chain_id,
            1,
            Duration::from_millis(5),
            Arc::new(mock),
        ))
    }

    #[tokio::test]
    async fn test_seeds_once_then_increments() {
        let mut mock = MockChainClient::new();
        mock.expect_get_transaction_count()
            .times(1)
            .returning(|_| Ok(5));
        let connection = connection(mock, 31337);

        let tracker = NonceTracker::new();
        let address = Address::repeat_byte(1);

        assert_eq!(tracker.peek(address, 31337).await, None);
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 5);
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 6);
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 7);
        assert_eq!(tracker.peek(address, 31337).await, Some(8));
    }

    #[tokio::test]
    async fn test_concurrent_allocation_has_no_gaps_or_repeats() {
        let mut mock = MockChainClient::new();
        mock.expect_get_transaction_count()
            .times(1)
            .returning(|_| Ok(12));
        let connection = connection(mock, 31337);

        let tracker = Arc::new(NonceTracker::new());
        let address = Address::repeat_byte(2);

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let tracker = tracker.clone();
                let connection = connection.clone();
                tokio::spawn(async move { tracker.next(address, &connection).await.unwrap() })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in futures::future::join_all(handles).await {
            nonces.push(handle.unwrap());
        }
        nonces.sort_unstable();

        assert_eq!(nonces, (12..76).collect::<Vec<u64>>());
        assert_eq!(tracker.issued(address, 31337).await, nonces);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let mut fork = MockChainClient::new();
        fork.expect_get_transaction_count().returning(|_| Ok(3));
        let mut testnet = MockChainClient::new();
        testnet.expect_get_transaction_count().returning(|_| Ok(40));

        let fork = connection(fork, 31337);
        let testnet = connection(testnet, 11155111);
        let tracker = NonceTracker::new();
        let alice = Address::repeat_byte(0xa);
        let bob = Address::repeat_byte(0xb);

        assert_eq!(tracker.next(alice, &fork).await.unwrap(), 3);
        assert_eq!(tracker.next(alice, &testnet).await.unwrap(), 40);
        assert_eq!(tracker.next(bob, &fork).await.unwrap(), 3);
        assert_eq!(tracker.next(alice, &fork).await.unwrap(), 4);
        assert_eq!(tracker.next(alice, &testnet).await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_release_only_rewinds_latest() {
        let mut mock = MockChainClient::new();
        mock.expect_get_transaction_count().returning(|_| Ok(0));
        let connection = connection(mock, 31337);

        let tracker = NonceTracker::new();
        let address = Address::repeat_byte(3);

        assert_eq!(tracker.next(address, &connection).await.unwrap(), 0);
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 1);

        assert!(!tracker.release(address, 31337, 0).await);
        assert!(tracker.release(address, 31337, 1).await);
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_seed_is_retried_on_next_call() {
        let mut mock = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_get_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(OrchestratorError::Network {
                    chain_id: 31337,
                    message: "timeout".into(),
                })
            });
        mock.expect_get_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(9));
        let connection = connection(mock, 31337);

        let tracker = NonceTracker::new();
        let address = Address::repeat_byte(4);

        assert!(tracker.next(address, &connection).await.is_err());
        assert_eq!(tracker.next(address, &connection).await.unwrap(), 9);
    }
}
