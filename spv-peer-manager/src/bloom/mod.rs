//! Bloom filter support for SPV clients
//!
//! The filter sent to peers is derived from the wallet's elements plus a random
//! pad, so its size does not reveal how many addresses the wallet holds.

pub mod builder;
pub mod filter;
pub mod hash;
pub mod manager;

pub use builder::BloomFilterBuilder;
pub use filter::{BloomFilter, BloomFlags, MAX_BLOOM_FILTER_SIZE, MAX_HASH_FUNCS};
pub use hash::murmur3;
pub use manager::{
    BloomFilterConfig, BloomFilterManager, BloomFilterStats, DEFAULT_FP_RATE, REDUCED_FP_RATE,
    update_fp_rate,
};
