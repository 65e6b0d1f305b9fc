//! Configuration management for the peer manager.

use std::time::Duration;

use crate::bloom::{BloomFilterConfig, BloomFlags, DEFAULT_FP_RATE, REDUCED_FP_RATE};
use crate::chain::chain_store::{ChainLimits, DEFAULT_BLOCK_RETENTION, DEFAULT_MAX_REORG_DEPTH};
use crate::chain::orphan_pool::{MAX_ORPHAN_BLOCKS, ORPHAN_TIMEOUT};
use crate::chain::NetworkParams;
use crate::network::constants::*;
use crate::network::reputation::DEFAULT_BAN_SCORE;
use crate::network::MisbehaviorScores;

/// Configuration for the peer manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Chain to follow: proof-of-work limit, genesis and checkpoints.
    pub network_params: NetworkParams,

    /// Outbound connections kept open.
    pub max_connections: usize,

    /// Cap on the known-peer set.
    pub max_known_peers: usize,

    /// Timeout of the first connection attempt to a peer. Doubles per consecutive failure.
    pub connect_timeout: Duration,

    /// Upper bound for the doubled connect timeout.
    pub max_connect_timeout: Duration,

    /// Delay before reconnecting after a session drops. Doubles per consecutive failure.
    pub reconnect_delay: Duration,

    pub max_reconnect_delay: Duration,

    /// Consecutive failed attempts with no peer connected before sync is reported failed.
    pub max_connect_failures: u32,

    /// The download peer is replaced when it delivers nothing new for this long.
    pub sync_timeout: Duration,

    /// How long a published transaction waits for relays.
    pub publish_timeout: Duration,

    /// Period of the maintenance tick.
    pub maintenance_interval: Duration,

    /// Relays needed for a publish to succeed early.
    pub min_relay_peers: usize,

    // Chain
    pub max_reorg_depth: u32,
    pub max_orphans: usize,
    pub orphan_timeout: Duration,
    /// Main-chain blocks kept in memory below the tip.
    pub block_retention: u32,
    pub headers_batch_size: usize,
    pub blocks_batch_size: usize,
    /// Blocks are saved at least this often during a long sync.
    pub block_save_interval: u32,
    /// Peers this far below our tip are dropped once synced.
    pub lagging_peer_threshold: u32,
    /// How far ahead of the local clock a block timestamp may be.
    pub max_future_block_time: Duration,

    // Bloom filter
    pub bloom_fp_rate: f64,
    pub bloom_reduced_fp_rate: f64,
    pub bloom_pad_min: u32,
    pub bloom_pad_max: u32,
    pub bloom_flags: BloomFlags,

    /// Larger `addr` messages count as misbehavior.
    pub max_addr_per_message: usize,

    /// Penalty per kind of misbehavior.
    pub misbehavior: MisbehaviorScores,

    /// Score at which a peer is banned.
    pub ban_score: i32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(NetworkParams::mainnet())
    }
}

impl ManagerConfig {
    /// Create a configuration with default policy for the given network.
    pub fn new(network_params: NetworkParams) -> Self {
        Self {
            network_params,
            max_connections: MAX_CONNECTIONS,
            max_known_peers: MAX_KNOWN_PEERS,
            connect_timeout: CONNECT_TIMEOUT,
            max_connect_timeout: MAX_CONNECT_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            max_connect_failures: MAX_CONNECT_FAILURES,
            sync_timeout: SYNC_TIMEOUT,
            publish_timeout: PUBLISH_TIMEOUT,
            maintenance_interval: MAINTENANCE_INTERVAL,
            min_relay_peers: 2,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            max_orphans: MAX_ORPHAN_BLOCKS,
            orphan_timeout: ORPHAN_TIMEOUT,
            block_retention: DEFAULT_BLOCK_RETENTION,
            headers_batch_size: 2000,
            blocks_batch_size: 500,
            block_save_interval: 2016,
            lagging_peer_threshold: LAGGING_PEER_THRESHOLD,
            max_future_block_time: Duration::from_secs(2 * 60 * 60),
            bloom_fp_rate: DEFAULT_FP_RATE,
            bloom_reduced_fp_rate: REDUCED_FP_RATE,
            bloom_pad_min: 100,
            bloom_pad_max: 200,
            bloom_flags: BloomFlags::All,
            max_addr_per_message: MAX_ADDR_PER_MESSAGE,
            misbehavior: MisbehaviorScores::default(),
            ban_score: DEFAULT_BAN_SCORE,
        }
    }

    pub fn mainnet() -> Self {
        Self::new(NetworkParams::mainnet())
    }

    pub fn testnet() -> Self {
        Self::new(NetworkParams::testnet())
    }

    pub fn regtest() -> Self {
        Self::new(NetworkParams::regtest())
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_known_peers(mut self, max: usize) -> Self {
        self.max_known_peers = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_min_relay_peers(mut self, peers: usize) -> Self {
        self.min_relay_peers = peers;
        self
    }

    pub fn with_max_reorg_depth(mut self, depth: u32) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    pub fn with_block_retention(mut self, blocks: u32) -> Self {
        self.block_retention = blocks;
        self
    }

    /// Set the false positive rates used while syncing and once synced.
    pub fn with_bloom_rates(mut self, syncing: f64, synced: f64) -> Self {
        self.bloom_fp_rate = syncing;
        self.bloom_reduced_fp_rate = synced;
        self
    }

    pub fn with_misbehavior_scores(mut self, scores: MisbehaviorScores) -> Self {
        self.misbehavior = scores;
        self
    }

    pub fn with_ban_score(mut self, score: i32) -> Self {
        self.ban_score = score;
        self
    }

    pub(crate) fn chain_limits(&self) -> ChainLimits {
        ChainLimits {
            max_reorg_depth: self.max_reorg_depth,
            block_retention: self.block_retention,
            max_orphans: self.max_orphans,
            orphan_timeout: self.orphan_timeout,
        }
    }

    pub(crate) fn bloom_config(&self) -> BloomFilterConfig {
        BloomFilterConfig {
            false_positive_rate: self.bloom_fp_rate,
            reduced_false_positive_rate: self.bloom_reduced_fp_rate,
            pad_min: self.bloom_pad_min,
            pad_max: self.bloom_pad_max,
            flags: self.bloom_flags,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_known_peers < self.max_connections {
            return Err("max_known_peers must be at least max_connections".to_string());
        }
        if self.min_relay_peers == 0 {
            return Err("min_relay_peers must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() || self.connect_timeout > self.max_connect_timeout {
            return Err("connect_timeout must be > 0 and <= max_connect_timeout".to_string());
        }
        if self.reconnect_delay > self.max_reconnect_delay {
            return Err("reconnect_delay must be <= max_reconnect_delay".to_string());
        }
        if self.maintenance_interval.is_zero() {
            return Err("maintenance_interval must be > 0".to_string());
        }
        if self.block_retention < self.max_reorg_depth {
            return Err("block_retention must be at least max_reorg_depth".to_string());
        }
        if self.headers_batch_size == 0 || self.blocks_batch_size == 0 {
            return Err("batch sizes must be > 0".to_string());
        }
        let rates = [
            ("bloom_fp_rate", self.bloom_fp_rate),
            ("bloom_reduced_fp_rate", self.bloom_reduced_fp_rate),
        ];
        for (name, rate) in rates {
            if !(rate > 0.0 && rate < 1.0) {
                return Err(format!("{} must be in (0, 1), got {}", name, rate));
            }
        }
        if self.bloom_pad_min > self.bloom_pad_max {
            return Err("bloom_pad_min must be <= bloom_pad_max".to_string());
        }
        if self.ban_score <= 0 {
            return Err("ban_score must be > 0".to_string());
        }
        Ok(())
    }
}
