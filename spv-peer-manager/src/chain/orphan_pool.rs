use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::IncomingBlock;
use crate::types::BlockHash;

/// Maximum number of orphan blocks to keep in memory
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Maximum time to keep an orphan block before eviction
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(900); // 15 minutes

/// An orphan block with metadata
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub block: IncomingBlock,
    /// When this orphan was received
    pub received_at: Instant,
}

/// Holds blocks that arrived before their parents
#[derive(Debug)]
pub struct OrphanPool {
    /// Orphan hashes indexed by their previous block hash
    orphans_by_prev: HashMap<BlockHash, Vec<BlockHash>>,
    /// All orphan blocks indexed by their own hash
    orphans_by_hash: HashMap<BlockHash, OrphanBlock>,
    /// Queue for eviction order (oldest first)
    eviction_queue: VecDeque<BlockHash>,
    max_orphans: usize,
    orphan_timeout: Duration,
}

impl OrphanPool {
    /// Creates a new orphan pool with default settings
    pub fn new() -> Self {
        Self::with_config(MAX_ORPHAN_BLOCKS, ORPHAN_TIMEOUT)
    }

    /// Creates a new orphan pool with custom configuration
    pub fn with_config(max_orphans: usize, orphan_timeout: Duration) -> Self {
        Self {
            orphans_by_prev: HashMap::new(),
            orphans_by_hash: HashMap::new(),
            eviction_queue: VecDeque::new(),
            max_orphans,
            orphan_timeout,
        }
    }

    /// Adds an orphan block to the pool. Returns false if it was already present.
    pub fn add_orphan(&mut self, block: IncomingBlock) -> bool {
        let hash = block.hash;
        if self.orphans_by_hash.contains_key(&hash) {
            trace!("Orphan block {} already in pool", hash);
            return false;
        }
        if self.max_orphans == 0 {
            return false;
        }

        while self.orphans_by_hash.len() >= self.max_orphans {
            let Some(oldest) = self.eviction_queue.pop_front() else {
                break;
            };
            if self.remove_orphan(&oldest).is_some() {
                debug!("Evicted oldest orphan {} due to size limit", oldest);
            }
        }

        let prev = block.header.prev_blockhash;
        self.orphans_by_prev.entry(prev).or_default().push(hash);
        self.orphans_by_hash.insert(
            hash,
            OrphanBlock {
                block,
                received_at: Instant::now(),
            },
        );
        self.eviction_queue.push_back(hash);

        debug!("Added orphan block {} (prev: {})", hash, prev);
        true
    }

    /// Removes and returns every orphan waiting on `prev_hash`, in arrival order
    pub fn take_children(&mut self, prev_hash: &BlockHash) -> Vec<IncomingBlock> {
        let Some(hashes) = self.orphans_by_prev.remove(prev_hash) else {
            return Vec::new();
        };
        let mut children = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(orphan) = self.orphans_by_hash.remove(&hash) {
                self.eviction_queue.retain(|h| *h != hash);
                children.push(orphan.block);
            }
        }
        children
    }

    /// Removes an orphan block from the pool
    pub fn remove_orphan(&mut self, hash: &BlockHash) -> Option<OrphanBlock> {
        let orphan = self.orphans_by_hash.remove(hash)?;
        let prev = orphan.block.header.prev_blockhash;
        if let Some(siblings) = self.orphans_by_prev.get_mut(&prev) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.orphans_by_prev.remove(&prev);
            }
        }
        self.eviction_queue.retain(|h| h != hash);
        trace!("Removed orphan block {}", hash);
        Some(orphan)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.orphans_by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&OrphanBlock> {
        self.orphans_by_hash.get(hash)
    }

    pub fn len(&self) -> usize {
        self.orphans_by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans_by_hash.is_empty()
    }

    /// Removes expired orphans
    pub fn remove_expired(&mut self) -> Vec<BlockHash> {
        let now = Instant::now();
        let expired: Vec<BlockHash> = self
            .orphans_by_hash
            .iter()
            .filter(|(_, orphan)| now.duration_since(orphan.received_at) > self.orphan_timeout)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired {
            self.remove_orphan(hash);
            debug!("Removed expired orphan {}", hash);
        }
        expired
    }

    /// Gets statistics about the orphan pool
    pub fn stats(&self) -> OrphanPoolStats {
        let now = Instant::now();
        OrphanPoolStats {
            total_orphans: self.orphans_by_hash.len(),
            unique_parents: self.orphans_by_prev.len(),
            oldest_age: self
                .orphans_by_hash
                .values()
                .map(|o| now.duration_since(o.received_at))
                .max()
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Clears all orphans from the pool
    pub fn clear(&mut self) {
        if self.orphans_by_hash.is_empty() {
            return;
        }
        self.orphans_by_prev.clear();
        self.orphans_by_hash.clear();
        self.eviction_queue.clear();
        debug!("Cleared orphan pool");
    }
}

/// Statistics about the orphan pool
#[derive(Debug, Clone)]
pub struct OrphanPoolStats {
    pub total_orphans: usize,
    /// Number of unique parent blocks referenced
    pub unique_parents: usize,
    pub oldest_age: Duration,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}
