//! BIP37 bloom filter.

use bitvec::prelude::*;

use super::hash::murmur3;
use crate::error::{BloomError, BloomResult};
use crate::network::FilterLoad;
use crate::types::{OutPoint, Transaction, script_pushes};

/// Maximum size of a bloom filter in bytes (36KB)
pub const MAX_BLOOM_FILTER_SIZE: usize = 36000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

const SEED_MULTIPLIER: u32 = 0xfba4c795;

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// How a peer updates the filter when an output matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BloomFlags {
    /// Never update
    None,
    /// Insert the outpoint of every matched output
    #[default]
    All,
    /// Insert the outpoint only for pay-to-pubkey and bare multisig outputs
    PubkeyOnly,
}

impl BloomFlags {
    pub fn as_u8(self) -> u8 {
        match self {
            BloomFlags::None => 0,
            BloomFlags::All => 1,
            BloomFlags::PubkeyOnly => 2,
        }
    }
}

/// Bloom filter as specified in BIP37
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    filter: BitVec<u8, Lsb0>,
    n_hash_funcs: u32,
    n_tweak: u32,
    flags: BloomFlags,
}

impl BloomFilter {
    /// Size a filter for `elements` entries at `false_positive_rate`.
    pub fn new(
        elements: u32,
        false_positive_rate: f64,
        tweak: u32,
        flags: BloomFlags,
    ) -> BloomResult<Self> {
        if elements == 0 {
            return Err(BloomError::InvalidElementCount(elements));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(BloomError::InvalidFalsePositiveRate(false_positive_rate));
        }

        let ln2 = std::f64::consts::LN_2;
        let bits = (-(elements as f64) * false_positive_rate.ln() / (ln2 * ln2)).ceil() as usize;
        let bytes = bits.div_ceil(8).clamp(1, MAX_BLOOM_FILTER_SIZE);
        let n_hash_funcs = ((bytes * 8) as f64 / elements as f64 * ln2).ceil() as u32;

        Ok(Self {
            filter: bitvec![u8, Lsb0; 0; bytes * 8],
            n_hash_funcs: n_hash_funcs.clamp(1, MAX_HASH_FUNCS),
            n_tweak: tweak,
            flags,
        })
    }

    /// Rebuild a filter from its `filterload` parts.
    pub fn from_bytes(
        data: Vec<u8>,
        n_hash_funcs: u32,
        n_tweak: u32,
        flags: BloomFlags,
    ) -> BloomResult<Self> {
        if data.len() > MAX_BLOOM_FILTER_SIZE {
            return Err(BloomError::FilterTooLarge(data.len()));
        }
        if n_hash_funcs > MAX_HASH_FUNCS {
            return Err(BloomError::TooManyHashFuncs(n_hash_funcs));
        }
        Ok(Self {
            filter: BitVec::from_vec(data),
            n_hash_funcs,
            n_tweak,
            flags,
        })
    }

    fn bit_index(&self, data: &[u8], i: u32) -> usize {
        let seed = i.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.n_tweak);
        murmur3(data, seed) as usize % self.filter.len()
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.filter.is_empty() {
            return;
        }
        for i in 0..self.n_hash_funcs {
            let index = self.bit_index(data, i);
            self.filter.set(index, true);
        }
    }

    /// Check if data might be in the filter. A zero-length filter matches everything.
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        (0..self.n_hash_funcs).all(|i| self.filter[self.bit_index(data, i)])
    }

    /// Whether `tx` is relevant under BIP37 matching rules. Matched outputs are inserted
    /// into the filter according to its flags, the way a remote peer applying it would.
    pub fn matches_transaction(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let mut found = self.contains(txid.as_bytes());

        for (vout, output) in tx.output.iter().enumerate() {
            let script = &output.script_pubkey;
            if script_pushes(script).into_iter().any(|push| self.contains(push)) {
                found = true;
                let update = match self.flags {
                    BloomFlags::None => false,
                    BloomFlags::All => true,
                    BloomFlags::PubkeyOnly => is_pubkey_script(script),
                };
                if update {
                    self.insert(&OutPoint::new(txid, vout as u32).to_bytes());
                }
            }
        }
        if found {
            return true;
        }

        tx.input.iter().any(|input| {
            self.contains(&input.previous_output.to_bytes())
                || script_pushes(&input.script_sig).into_iter().any(|push| self.contains(push))
        })
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        !self.filter.any()
    }

    /// Filter size in bytes.
    pub fn size(&self) -> usize {
        self.filter.len().div_ceil(8)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.filter.as_raw_slice().to_vec()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.n_hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.n_tweak
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    /// Expected false positive rate once `elements` entries are inserted:
    /// `(1 - e^(-k*n/m))^k`.
    pub fn estimate_false_positive_rate(&self, elements: u32) -> f64 {
        if elements == 0 || self.filter.is_empty() {
            return 0.0;
        }
        let k = self.n_hash_funcs as f64;
        let exponent = -(k * elements as f64) / self.filter.len() as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// The `filterload` message announcing this filter.
    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad {
            data: self.to_bytes(),
            hash_funcs: self.n_hash_funcs,
            tweak: self.n_tweak,
            flags: self.flags,
        }
    }
}

/// Pay-to-pubkey (`<pubkey> OP_CHECKSIG`) or bare multisig (`... OP_CHECKMULTISIG`).
fn is_pubkey_script(script: &[u8]) -> bool {
    match script.last() {
        Some(&OP_CHECKMULTISIG) => true,
        Some(&OP_CHECKSIG) => matches!(script.len(), 35 | 67) && matches!(script[0], 33 | 65),
        _ => false,
    }
}
