//! Chain management module with reorganization support
//!
//! This module provides functionality for managing blockchain state including:
//! - The verified main chain and side branches
//! - Fork choice by cumulative work, with bounded reorganization depth
//! - Orphan blocks waiting for their parents
//! - Network parameters and checkpoints

pub mod chain_store;
pub mod chain_work;
pub mod checkpoints;
pub mod orphan_pool;


pub use chain_store::{BlockEntry, BlockSave, ChainStore, ChainUpdate};
pub use chain_work::{ChainWork, Target};
pub use checkpoints::{Checkpoint, Network, NetworkParams};
pub use orphan_pool::{OrphanBlock, OrphanPool, OrphanPoolStats};

use crate::types::{BlockHash, BlockHeader, MerkleBlock, Txid};

/// A block received from a peer that passed header validation but is not yet linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBlock {
    pub header: BlockHeader,
    pub hash: BlockHash,
    pub total_transactions: u32,
    /// Transactions the merkle proof matched.
    pub matched_txids: Vec<Txid>,
}

impl IncomingBlock {
    /// A bare header, as delivered by `headers`.
    pub fn from_header(header: BlockHeader) -> Self {
        Self {
            hash: header.block_hash(),
            header,
            total_transactions: 0,
            matched_txids: Vec::new(),
        }
    }

    /// A verified merkle block with its matched transactions.
    pub fn from_merkle_block(block: &MerkleBlock, matched_txids: Vec<Txid>) -> Self {
        Self {
            hash: block.block_hash(),
            header: block.header,
            total_transactions: block.total_transactions,
            matched_txids,
        }
    }
}
