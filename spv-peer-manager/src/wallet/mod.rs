//! Wallet capability consumed by the peer manager.
//!
//! The manager never inspects scripts or balances itself. It asks the wallet for
//! the data its bloom filter must match, hands it relayed transactions, and tells
//! it at which height each matched transaction confirmed.

use async_trait::async_trait;

use crate::types::{Transaction, Txid};

/// Trait for wallet implementations to receive SPV events
#[async_trait]
pub trait WalletInterface: Send + Sync {
    /// Data the bloom filter must match: public key hashes, scripts and serialized outpoints.
    async fn bloom_filter_elements(&self) -> Vec<Vec<u8>>;

    /// Offer a relayed transaction. Returns true if it concerns the wallet and was recorded.
    async fn register_transaction(&mut self, tx: &Transaction) -> bool;

    /// Set the confirmation height of `txids`. `TX_UNCONFIRMED` rolls them back to unconfirmed.
    async fn update_transactions(&mut self, txids: &[Txid], height: u32, timestamp: u32);

    /// Drop a transaction the network refused.
    async fn remove_transaction(&mut self, txid: &Txid);

    /// Transactions not yet in a block, announced again on every connect.
    async fn unconfirmed_transactions(&self) -> Vec<Transaction>;
}
