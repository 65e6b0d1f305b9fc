//! Merkle inclusion proofs carried by `merkleblock` messages.

use crate::types::{MerkleBlock, Txid, sha256d};

/// Outcome of checking a merkle block's partial tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleMatch {
    /// Transactions the proof marks as matching the bloom filter, in block order.
    pub matched: Vec<Txid>,
    /// Whether the tree is well formed and hashes to the header's merkle root.
    pub valid: bool,
}

impl MerkleMatch {
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Verifies the partial merkle tree of a merkle block.
pub trait MerkleVerifier: Send + Sync {
    fn verify(&self, block: &MerkleBlock) -> MerkleMatch;
}

/// BIP37 partial merkle tree verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialMerkleVerifier;

struct Traversal<'a> {
    total: u32,
    hashes: &'a [Txid],
    flags: &'a [u8],
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Txid>,
}

impl Traversal<'_> {
    fn width(&self, height: u32) -> u32 {
        ((self.total as u64 + (1u64 << height) - 1) >> height) as u32
    }

    fn next_bit(&mut self) -> Option<bool> {
        let byte = self.flags.get(self.bits_used / 8)?;
        let bit = (byte >> (self.bits_used % 8)) & 1 == 1;
        self.bits_used += 1;
        Some(bit)
    }

    fn next_hash(&mut self) -> Option<[u8; 32]> {
        let hash = self.hashes.get(self.hashes_used)?;
        self.hashes_used += 1;
        Some(hash.to_byte_array())
    }

    fn descend(&mut self, height: u32, pos: u32) -> Option<[u8; 32]> {
        let parent_of_match = self.next_bit()?;
        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(Txid::from_byte_array(hash));
            }
            return Some(hash);
        }

        let left = self.descend(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < self.width(height - 1) {
            let right = self.descend(height - 1, pos * 2 + 1)?;
            // Identical siblings allow forging a different transaction set for the same root.
            if right == left {
                return None;
            }
            right
        } else {
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        Some(sha256d(&concat))
    }
}

impl MerkleVerifier for PartialMerkleVerifier {
    fn verify(&self, block: &MerkleBlock) -> MerkleMatch {
        let total = block.total_transactions;
        if total == 0
            || block.hashes.len() > total as usize
            || block.flags.len() * 8 < block.hashes.len()
        {
            return MerkleMatch::invalid();
        }

        let mut traversal = Traversal {
            total,
            hashes: &block.hashes,
            flags: &block.flags,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let mut height = 0;
        while traversal.width(height) > 1 {
            height += 1;
        }

        let Some(root) = traversal.descend(height, 0) else {
            return MerkleMatch::invalid();
        };
        let consumed_all = traversal.bits_used.div_ceil(8) == block.flags.len()
            && traversal.hashes_used == block.hashes.len();
        if !consumed_all || root != *block.header.merkle_root.as_bytes() {
            return MerkleMatch::invalid();
        }

        MerkleMatch {
            matched: traversal.matched,
            valid: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHeaderBuilder;
    use crate::types::TxMerkleNode;

    fn block(root: [u8; 32], total: u32, hashes: Vec<Txid>, flags: Vec<u8>) -> MerkleBlock {
        MerkleBlock {
            header: TestHeaderBuilder::new().with_merkle_root(TxMerkleNode::from_byte_array(root)).build(),
            total_transactions: total,
            hashes,
            flags,
        }
    }

    #[test]
    fn test_single_transaction_match() {
        let txid = Txid::from_byte_array([7; 32]);
        let result = PartialMerkleVerifier.verify(&block([7; 32], 1, vec![txid], vec![0x01]));
        assert!(result.valid);
        assert_eq!(result.matched, vec![txid]);
    }

    #[test]
    fn test_two_transactions_second_matched() {
        let h0 = Txid::from_byte_array([1; 32]);
        let h1 = Txid::from_byte_array([2; 32]);
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(h0.as_bytes());
        concat[32..].copy_from_slice(h1.as_bytes());
        let root = sha256d(&concat);

        // Bits in traversal order: root (parent of match), left (no), right (match).
        let result = PartialMerkleVerifier.verify(&block(root, 2, vec![h0, h1], vec![0b101]));
        assert!(result.valid);
        assert_eq!(result.matched, vec![h1]);

        let wrong_root = PartialMerkleVerifier.verify(&block([0; 32], 2, vec![h0, h1], vec![0b101]));
        assert!(!wrong_root.valid);

        let extra_flags =
            PartialMerkleVerifier.verify(&block(root, 2, vec![h0, h1], vec![0b101, 0]));
        assert!(!extra_flags.valid);
    }

    #[test]
    fn test_duplicate_siblings_rejected() {
        let h = Txid::from_byte_array([3; 32]);
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(h.as_bytes());
        concat[32..].copy_from_slice(h.as_bytes());
        let root = sha256d(&concat);
        let result = PartialMerkleVerifier.verify(&block(root, 2, vec![h, h], vec![0b111]));
        assert_eq!(result, MerkleMatch::invalid());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(!PartialMerkleVerifier.verify(&block([0; 32], 0, vec![], vec![])).valid);
        let h = Txid::from_byte_array([1; 32]);
        assert!(!PartialMerkleVerifier.verify(&block([1; 32], 1, vec![h, h], vec![0xff])).valid);
        assert!(!PartialMerkleVerifier.verify(&block([1; 32], 1, vec![h], vec![])).valid);
    }
}
