//! Peer protocol messages exchanged with the connection layer.
//!
//! Framing and serialization belong to the [`PeerConnection`](super::PeerConnection)
//! implementation; the manager only sees these decoded forms.

use std::net::SocketAddr;

use crate::bloom::BloomFlags;
use crate::types::{BlockHash, BlockHeader, MerkleBlock, ServiceFlags, Transaction, Txid};

/// Reject code for an invalid message or transaction.
pub const REJECT_INVALID: u8 = 0x10;
/// Reject code for a duplicate (including double-spending) transaction.
pub const REJECT_DUPLICATE: u8 = 0x12;
/// Reject code for a non-standard transaction.
pub const REJECT_NONSTANDARD: u8 = 0x40;
/// Reject code for a transaction paying too little fee.
pub const REJECT_INSUFFICIENTFEE: u8 = 0x42;

/// Inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inventory {
    Transaction(Txid),
    Block(BlockHash),
    FilteredBlock(BlockHash),
}

/// Payload shared by `getheaders` and `getblocks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub locator_hashes: Vec<BlockHash>,
    pub stop_hash: BlockHash,
}

/// A `filterload` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoad {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomFlags,
}

/// One entry of an `addr` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    /// Last time the advertising node saw this address (unix seconds).
    pub time: u32,
    pub services: ServiceFlags,
    pub address: SocketAddr,
}

/// A `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Command of the rejected message (e.g. `tx`).
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the rejected transaction, when `message` is `tx`.
    pub txid: Option<Txid>,
}

impl Reject {
    /// Whether the rejection says the transaction spends outputs we do not know are spent,
    /// meaning local history is likely incomplete.
    pub fn indicates_spent_inputs(&self) -> bool {
        let reason = self.reason.to_ascii_lowercase();
        matches!(self.code, REJECT_INVALID | REJECT_DUPLICATE)
            && (reason.contains("spent") || reason.contains("missing-inputs"))
    }
}

/// Decoded peer protocol messages the manager sends or reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    FilterLoad(FilterLoad),
    GetHeaders(GetBlocksMessage),
    GetBlocks(GetBlocksMessage),
    GetData(Vec<Inventory>),
    Inv(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Tx(Transaction),
    MerkleBlock(MerkleBlock),
    Headers(Vec<BlockHeader>),
    MemPool,
    GetAddr,
    Addr(Vec<AddrEntry>),
    Ping(u64),
    Pong(u64),
    Reject(Reject),
}

impl NetworkMessage {
    /// Wire command name.
    pub fn cmd(&self) -> &'static str {
        match self {
            NetworkMessage::FilterLoad(_) => "filterload",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::MerkleBlock(_) => "merkleblock",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::MemPool => "mempool",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Reject(_) => "reject",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(code: u8, reason: &str) -> Reject {
        Reject {
            message: "tx".to_string(),
            code,
            reason: reason.to_string(),
            txid: None,
        }
    }

    #[test]
    fn test_reject_spent_detection() {
        assert!(reject(REJECT_DUPLICATE, "bad-txns-inputs-spent").indicates_spent_inputs());
        assert!(reject(REJECT_INVALID, "Missing-Inputs").indicates_spent_inputs());
        assert!(!reject(REJECT_INSUFFICIENTFEE, "insufficient fee").indicates_spent_inputs());
        assert!(!reject(REJECT_NONSTANDARD, "spent but nonstandard").indicates_spent_inputs());
    }

    #[test]
    fn test_command_names() {
        assert_eq!(NetworkMessage::MemPool.cmd(), "mempool");
        assert_eq!(NetworkMessage::Inv(vec![]).cmd(), "inv");
        assert_eq!(
            NetworkMessage::GetBlocks(GetBlocksMessage {
                locator_hashes: vec![],
                stop_hash: BlockHash::all_zeros(),
            })
            .cmd(),
            "getblocks"
        );
    }
}
