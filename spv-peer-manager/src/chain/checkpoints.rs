//! Network parameters: proof-of-work limit, genesis header and hard-coded checkpoints.

use serde::{Deserialize, Serialize};

use crate::types::{BlockHash, BlockHeader, TxMerkleNode};

/// Merkle root of the genesis coinbase, shared by all networks.
const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

const MAINNET_CHECKPOINTS: &[(u32, &str)] = &[
    (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    (168000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    (193000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    (210000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
    (216116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    (225430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
    (250000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    (279000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
    (295000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
];

const TESTNET_CHECKPOINTS: &[(u32, &str)] =
    &[(546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70")];

/// Which chain the manager follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// A block hash pinned at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

/// Consensus parameters the manager validates against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub network: Network,
    /// Compact encoding of the easiest allowed target.
    pub pow_limit_bits: u32,
    pub genesis: BlockHeader,
    /// Sorted by height.
    pub checkpoints: Vec<Checkpoint>,
}

fn parse_checkpoints(raw: &[(u32, &str)]) -> Vec<Checkpoint> {
    raw.iter()
        .filter_map(|(height, hash)| {
            BlockHash::from_hex(hash).ok().map(|hash| Checkpoint {
                height: *height,
                hash,
            })
        })
        .collect()
}

fn genesis_header(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_hex(GENESIS_MERKLE_ROOT)
            .unwrap_or_else(|_| TxMerkleNode::all_zeros()),
        time,
        bits,
        nonce,
    }
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            pow_limit_bits: 0x1d00ffff,
            genesis: genesis_header(1231006505, 0x1d00ffff, 2083236893),
            checkpoints: parse_checkpoints(MAINNET_CHECKPOINTS),
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            pow_limit_bits: 0x1d00ffff,
            genesis: genesis_header(1296688602, 0x1d00ffff, 414098458),
            checkpoints: parse_checkpoints(TESTNET_CHECKPOINTS),
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            pow_limit_bits: 0x207fffff,
            genesis: genesis_header(1296688602, 0x207fffff, 2),
            checkpoints: Vec::new(),
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.block_hash()
    }

    /// The checkpoint pinned at `height`, if any.
    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |c| c.height)
            .ok()
            .and_then(|i| self.checkpoints.get(i))
    }

    /// Highest checkpoint at or below `height`.
    pub fn last_checkpoint_at_or_below(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.height <= height)
    }

    /// Whether `hash` at `height` agrees with the checkpoints (heights without one always agree).
    pub fn matches_checkpoint(&self, height: u32, hash: &BlockHash) -> bool {
        self.checkpoint_at(height).is_none_or(|c| c.hash == *hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            NetworkParams::mainnet().genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            NetworkParams::testnet().genesis_hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            NetworkParams::regtest().genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_checkpoints_sorted_and_parsed() {
        let params = NetworkParams::mainnet();
        assert_eq!(params.checkpoints.len(), MAINNET_CHECKPOINTS.len());
        assert!(params.checkpoints.windows(2).all(|w| w[0].height < w[1].height));
    }

    #[test]
    fn test_checkpoint_lookup() {
        let params = NetworkParams::mainnet();
        let cp = params.checkpoint_at(33333).unwrap();
        assert_eq!(
            cp.hash.to_string(),
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"
        );
        assert!(params.checkpoint_at(33334).is_none());
        assert_eq!(params.last_checkpoint_at_or_below(100000).unwrap().height, 74000);
        assert!(params.last_checkpoint_at_or_below(100).is_none());

        assert!(params.matches_checkpoint(33333, &cp.hash));
        assert!(!params.matches_checkpoint(33333, &BlockHash::all_zeros()));
        assert!(params.matches_checkpoint(33334, &BlockHash::all_zeros()));
    }
}
