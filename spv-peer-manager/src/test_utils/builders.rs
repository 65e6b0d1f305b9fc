//! Test data builders for headers, chains and transactions

use crate::chain::{BlockEntry, ChainWork, NetworkParams, Target};
use crate::types::{
    BlockHash, BlockHeader, MerkleBlock, OutPoint, Transaction, TxIn, TxMerkleNode, TxOut, Txid,
};

/// Regtest difficulty: every other hash meets the target.
pub const REGTEST_BITS: u32 = 0x207fffff;

/// Seconds between consecutive test blocks.
pub const BLOCK_SPACING: u32 = 600;

/// Builder for creating test block headers
pub struct TestHeaderBuilder {
    version: i32,
    prev_blockhash: BlockHash,
    merkle_root: TxMerkleNode,
    time: u32,
    bits: u32,
    nonce: u32,
}

impl Default for TestHeaderBuilder {
    fn default() -> Self {
        Self {
            version: 0x2000_0000,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: REGTEST_BITS,
            nonce: 0,
        }
    }
}

impl TestHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_prev_blockhash(mut self, hash: BlockHash) -> Self {
        self.prev_blockhash = hash;
        self
    }

    pub fn with_merkle_root(mut self, root: TxMerkleNode) -> Self {
        self.merkle_root = root;
        self
    }

    pub fn with_time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    /// Build the header as configured, without checking proof of work.
    pub fn build(self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_blockhash: self.prev_blockhash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Build the header and search nonces until its hash meets the target.
    pub fn build_mined(self) -> BlockHeader {
        mine_header(self.build())
    }
}

/// Increment the nonce until `header` meets its own target.
///
/// Only practical for regtest-style bits.
pub fn mine_header(mut header: BlockHeader) -> BlockHeader {
    let Some(target) = Target::from_compact(header.bits) else {
        return header;
    };
    while !target.is_met_by(&header.block_hash()) {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// Mine `count` headers on top of `parent`.
///
/// `branch` is mixed into the merkle root so that two calls from the same parent produce
/// distinct forks.
pub fn mine_chain(parent: &BlockHeader, count: usize, branch: u8) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count);
    let mut prev = *parent;
    for _ in 0..count {
        let header = TestHeaderBuilder::new()
            .with_prev_blockhash(prev.block_hash())
            .with_merkle_root(TxMerkleNode::from_byte_array([branch; 32]))
            .with_time(prev.time + BLOCK_SPACING)
            .build_mined();
        headers.push(header);
        prev = header;
    }
    headers
}

/// Chain store entries for `headers`, which must extend the genesis block of `params`.
pub fn block_entries(params: &NetworkParams, headers: &[BlockHeader]) -> Vec<BlockEntry> {
    let genesis = BlockEntry::genesis(params);
    let mut work: ChainWork = genesis.chain_work;
    let mut entries = vec![genesis];
    for (i, header) in headers.iter().enumerate() {
        work = work.add_header(header);
        entries.push(BlockEntry {
            hash: header.block_hash(),
            header: *header,
            height: i as u32 + 1,
            chain_work: work,
            total_transactions: 1,
            matched_txids: Vec::new(),
        });
    }
    entries
}

/// A merkle block carrying `header` with no partial tree. Pair with `MockMerkleVerifier`.
pub fn merkle_block(header: BlockHeader) -> MerkleBlock {
    MerkleBlock {
        header,
        total_transactions: 1,
        hashes: Vec::new(),
        flags: Vec::new(),
    }
}

/// P2PKH output script paying to `[tag; 20]`.
pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Bloom filter element matching [`p2pkh_script`]`(tag)`.
pub fn p2pkh_element(tag: u8) -> Vec<u8> {
    vec![tag; 20]
}

/// A signed-looking transaction paying to [`p2pkh_script`]`(tag)`.
pub fn test_transaction(tag: u8, spend: u32) -> Transaction {
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([0xee; 32]), spend),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
        }],
        output: vec![TxOut {
            value: 50_000,
            script_pubkey: p2pkh_script(tag),
        }],
        lock_time: 0,
    }
}
