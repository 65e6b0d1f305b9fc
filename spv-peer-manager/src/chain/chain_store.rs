//! In-memory verified chain with side branches, orphans and fork choice.
//!
//! The store keeps the main chain from a root (genesis, or the lowest retained
//! seed block) up to the tip, plus any side branches that fork above the root.
//! Blocks whose parent is unknown wait in the [`OrphanPool`] and are linked as
//! soon as the parent arrives. A branch replaces the main chain only when its
//! cumulative work is strictly greater.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::chain_work::ChainWork;
use super::checkpoints::NetworkParams;
use super::orphan_pool::{MAX_ORPHAN_BLOCKS, ORPHAN_TIMEOUT, OrphanPool};
use super::IncomingBlock;
use crate::error::{ValidationError, ValidationResult};
use crate::types::{BlockHash, BlockHeader, Txid};

/// Reorganizations deeper than this are refused.
pub const DEFAULT_MAX_REORG_DEPTH: u32 = 100;

/// Main-chain blocks kept below the tip.
pub const DEFAULT_BLOCK_RETENTION: u32 = 4032;

const ONE_WEEK: u64 = 7 * 24 * 60 * 60;

/// Number of consecutive hashes at the start of a block locator.
const LOCATOR_DENSE_HASHES: usize = 10;

/// One verified block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub hash: BlockHash,
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative work up to and including this block.
    pub chain_work: ChainWork,
    pub total_transactions: u32,
    /// Wallet transactions the merkle proof matched.
    #[serde(default)]
    pub matched_txids: Vec<Txid>,
}

impl BlockEntry {
    /// The genesis block of `params` at height zero.
    pub fn genesis(params: &NetworkParams) -> Self {
        Self {
            hash: params.genesis.block_hash(),
            header: params.genesis,
            height: 0,
            chain_work: ChainWork::from_header(&params.genesis),
            total_transactions: 1,
            matched_txids: Vec::new(),
        }
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }
}

/// What accepting a block did to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainUpdate {
    /// The block extended the main chain.
    Extended(BlockEntry),
    /// The block was stored on a branch with no more work than the main chain.
    SideChain {
        hash: BlockHash,
        height: u32,
    },
    /// A branch with more work replaced the top of the main chain.
    Reorganized {
        fork_height: u32,
        /// Blocks rolled back, tip first.
        disconnected: Vec<BlockEntry>,
        /// Blocks applied, lowest first.
        connected: Vec<BlockEntry>,
    },
    /// The parent is unknown; the block waits in the orphan pool.
    Orphaned {
        hash: BlockHash,
        prev_hash: BlockHash,
    },
    /// A main-chain block was received again with additional matched transactions.
    Updated(BlockEntry),
    /// Already known.
    Duplicate {
        hash: BlockHash,
    },
}

/// Blocks that should be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSave {
    pub blocks: Vec<BlockEntry>,
    /// Replace the whole persisted chain instead of upserting one block.
    pub replace: bool,
}

/// Limits applied by the chain store.
#[derive(Debug, Clone)]
pub struct ChainLimits {
    pub max_reorg_depth: u32,
    pub block_retention: u32,
    pub max_orphans: usize,
    pub orphan_timeout: Duration,
}

impl Default for ChainLimits {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            block_retention: DEFAULT_BLOCK_RETENTION,
            max_orphans: MAX_ORPHAN_BLOCKS,
            orphan_timeout: ORPHAN_TIMEOUT,
        }
    }
}

/// The verified chain.
#[derive(Debug)]
pub struct ChainStore {
    params: NetworkParams,
    limits: ChainLimits,
    blocks: HashMap<BlockHash, BlockEntry>,
    main_chain: BTreeMap<u32, BlockHash>,
    tip: BlockEntry,
    orphans: OrphanPool,
    /// Main-chain blocks changed since the last save.
    dirty: HashSet<BlockHash>,
    /// The main chain was rewritten since the last save.
    replace_pending: bool,
}

impl ChainStore {
    /// Build the store from persisted blocks, or from genesis when `seed` is empty.
    ///
    /// Seed blocks must have strictly increasing heights, hashes matching their headers,
    /// linked parents at consecutive heights and agree with the checkpoints. When the seed
    /// has gaps, only the last contiguous run is kept and its first block becomes the root.
    pub fn new(
        params: NetworkParams,
        seed: Vec<BlockEntry>,
        limits: ChainLimits,
    ) -> ValidationResult<Self> {
        let run = Self::validate_seed(&params, seed)?;
        let orphans = OrphanPool::with_config(limits.max_orphans, limits.orphan_timeout);

        let mut iter = run.into_iter();
        let mut root = match iter.next() {
            Some(root) => root,
            None => BlockEntry::genesis(&params),
        };
        if root.chain_work.is_zero() {
            root.chain_work = ChainWork::from_header(&root.header);
        }

        let mut store = Self {
            params,
            limits,
            blocks: HashMap::new(),
            main_chain: BTreeMap::new(),
            tip: root.clone(),
            orphans,
            dirty: HashSet::new(),
            replace_pending: false,
        };
        store.main_chain.insert(root.height, root.hash);
        store.blocks.insert(root.hash, root);

        for mut entry in iter {
            entry.chain_work = store.tip.chain_work.add_header(&entry.header);
            store.main_chain.insert(entry.height, entry.hash);
            store.blocks.insert(entry.hash, entry.clone());
            store.tip = entry;
        }
        store.prune();

        info!(
            "Chain store ready: root {} at height {}, tip {} at height {}",
            store.root_hash(),
            store.root_height(),
            store.tip.hash,
            store.tip.height
        );
        Ok(store)
    }

    fn validate_seed(
        params: &NetworkParams,
        seed: Vec<BlockEntry>,
    ) -> ValidationResult<Vec<BlockEntry>> {
        for entry in &seed {
            if entry.hash != entry.header.block_hash() {
                return Err(ValidationError::InvalidSeed(format!(
                    "hash mismatch at height {}",
                    entry.height
                )));
            }
            if !params.matches_checkpoint(entry.height, &entry.hash) {
                return Err(ValidationError::InvalidSeed(format!(
                    "checkpoint mismatch at height {}",
                    entry.height
                )));
            }
        }

        let mut run_start = 0;
        for (i, pair) in seed.windows(2).enumerate() {
            let (lower, upper) = (&pair[0], &pair[1]);
            if upper.height <= lower.height {
                return Err(ValidationError::InvalidSeed(format!(
                    "height {} follows height {}",
                    upper.height, lower.height
                )));
            }
            if upper.height == lower.height + 1 {
                if upper.prev_hash() != lower.hash {
                    return Err(ValidationError::InvalidSeed(format!(
                        "block at height {} does not link to its predecessor",
                        upper.height
                    )));
                }
            } else {
                run_start = i + 1;
            }
        }

        if run_start > 0 {
            debug!("Seed has gaps, keeping {} blocks after the last gap", seed.len() - run_start);
        }
        Ok(seed.into_iter().skip(run_start).collect())
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn tip(&self) -> &BlockEntry {
        &self.tip
    }

    pub fn tip_height(&self) -> u32 {
        self.tip.height
    }

    pub fn root_height(&self) -> u32 {
        self.main_chain.keys().next().copied().unwrap_or(self.tip.height)
    }

    pub fn root_hash(&self) -> BlockHash {
        self.main_chain.values().next().copied().unwrap_or(self.tip.hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&BlockEntry> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash) || self.orphans.contains(hash)
    }

    pub fn is_main_chain(&self, hash: &BlockHash) -> bool {
        self.blocks.get(hash).is_some_and(|e| self.main_chain.get(&e.height) == Some(hash))
    }

    pub fn get_by_height(&self, height: u32) -> Option<&BlockEntry> {
        self.main_chain.get(&height).and_then(|h| self.blocks.get(h))
    }

    /// Main-chain entries from the root up.
    pub fn main_chain(&self) -> impl DoubleEndedIterator<Item = &BlockEntry> {
        self.main_chain.values().filter_map(|h| self.blocks.get(h))
    }

    /// Number of stored blocks, main chain and side branches.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    /// Drop orphans older than the configured timeout.
    pub fn expire_orphans(&mut self) -> Vec<BlockHash> {
        self.orphans.remove_expired()
    }

    /// Link a validated block and promote any orphans waiting on it, in one pass.
    ///
    /// Returns the updates in the order they happened. An error means the block itself was
    /// refused; orphans that fail while being promoted are dropped.
    pub fn accept_block(&mut self, block: IncomingBlock) -> ValidationResult<Vec<ChainUpdate>> {
        let hash = block.hash;
        let first = self.link(block)?;
        let mut reorganized = matches!(
            first,
            ChainUpdate::Reorganized {
                ..
            }
        );
        let linked = reorganized
            || matches!(
                first,
                ChainUpdate::Extended(_)
                    | ChainUpdate::SideChain {
                        ..
                    }
            );
        let mut updates = vec![first];

        if linked {
            let mut parents = VecDeque::from([hash]);
            while let Some(parent) = parents.pop_front() {
                for child in self.orphans.take_children(&parent) {
                    let child_hash = child.hash;
                    match self.link(child) {
                        Ok(update) => {
                            trace!("Promoted orphan {}", child_hash);
                            reorganized |= matches!(
                                update,
                                ChainUpdate::Reorganized {
                                    ..
                                }
                            );
                            parents.push_back(child_hash);
                            updates.push(update);
                        }
                        Err(e) => warn!("Dropping orphan {}: {}", child_hash, e),
                    }
                }
            }
        }

        if reorganized {
            self.orphans.clear();
        }
        Ok(updates)
    }

    fn link(&mut self, block: IncomingBlock) -> ValidationResult<ChainUpdate> {
        let hash = block.hash;

        if self.blocks.contains_key(&hash) {
            return Ok(self.merge_known(block));
        }
        if self.orphans.contains(&hash) {
            return Ok(ChainUpdate::Duplicate {
                hash,
            });
        }

        let prev_hash = block.header.prev_blockhash;
        let Some(parent) = self.blocks.get(&prev_hash) else {
            self.orphans.add_orphan(block);
            return Ok(ChainUpdate::Orphaned {
                hash,
                prev_hash,
            });
        };

        let height = parent.height + 1;
        if !self.params.matches_checkpoint(height, &hash) {
            return Err(ValidationError::CheckpointMismatch {
                height,
            });
        }

        let entry = BlockEntry {
            hash,
            header: block.header,
            height,
            chain_work: parent.chain_work.add_header(&block.header),
            total_transactions: block.total_transactions,
            matched_txids: block.matched_txids,
        };

        if prev_hash == self.tip.hash {
            self.blocks.insert(hash, entry.clone());
            self.main_chain.insert(height, hash);
            self.dirty.insert(hash);
            self.tip = entry.clone();
            self.prune();
            return Ok(ChainUpdate::Extended(entry));
        }

        if entry.chain_work <= self.tip.chain_work {
            debug!("Block {} at height {} stored on side chain", hash, height);
            self.blocks.insert(hash, entry);
            return Ok(ChainUpdate::SideChain {
                hash,
                height,
            });
        }

        self.reorganize(entry)
    }

    fn merge_known(&mut self, block: IncomingBlock) -> ChainUpdate {
        let hash = block.hash;
        let in_main = self.is_main_chain(&hash);
        let Some(existing) = self.blocks.get_mut(&hash) else {
            return ChainUpdate::Duplicate {
                hash,
            };
        };
        let new_txids: Vec<Txid> = block
            .matched_txids
            .into_iter()
            .filter(|txid| !existing.matched_txids.contains(txid))
            .collect();
        if !in_main || new_txids.is_empty() {
            return ChainUpdate::Duplicate {
                hash,
            };
        }

        existing.matched_txids.extend(new_txids);
        existing.total_transactions = existing.total_transactions.max(block.total_transactions);
        let entry = existing.clone();
        if self.tip.hash == hash {
            self.tip = entry.clone();
        }
        self.dirty.insert(hash);
        ChainUpdate::Updated(entry)
    }

    fn reorganize(&mut self, entry: BlockEntry) -> ValidationResult<ChainUpdate> {
        // Walk the new branch down to the main chain.
        let mut branch = Vec::new();
        let mut cursor = entry.prev_hash();
        let fork_height = loop {
            let Some(ancestor) = self.blocks.get(&cursor) else {
                return Err(ValidationError::InvalidHeaderChain(format!(
                    "branch of {} does not reach the main chain",
                    entry.hash
                )));
            };
            if self.main_chain.get(&ancestor.height) == Some(&cursor) {
                break ancestor.height;
            }
            branch.push(cursor);
            cursor = ancestor.prev_hash();
        };

        let depth = self.tip.height - fork_height;
        if depth > self.limits.max_reorg_depth {
            return Err(ValidationError::ReorgTooDeep {
                depth,
                max_depth: self.limits.max_reorg_depth,
            });
        }

        let disconnected: Vec<BlockEntry> = self
            .main_chain
            .range(fork_height + 1..)
            .rev()
            .filter_map(|(_, h)| self.blocks.get(h).cloned())
            .collect();
        let _ = self.main_chain.split_off(&(fork_height + 1));

        self.blocks.insert(entry.hash, entry.clone());
        branch.reverse();
        branch.push(entry.hash);
        let mut connected = Vec::with_capacity(branch.len());
        for h in branch {
            if let Some(e) = self.blocks.get(&h) {
                self.main_chain.insert(e.height, h);
                connected.push(e.clone());
            }
        }

        info!(
            "Reorganized at height {}: {} blocks disconnected, {} connected, new tip {} at {}",
            fork_height,
            disconnected.len(),
            connected.len(),
            entry.hash,
            entry.height
        );
        self.tip = entry;
        self.replace_pending = true;
        self.prune();

        Ok(ChainUpdate::Reorganized {
            fork_height,
            disconnected,
            connected,
        })
    }

    /// Drop main-chain blocks beyond the retention window and side branches that no longer
    /// attach above the root.
    fn prune(&mut self) {
        let retention = self.limits.block_retention.max(self.limits.max_reorg_depth) as usize;
        if self.main_chain.len() <= retention + 1 {
            return;
        }
        while self.main_chain.len() > retention + 1 {
            if let Some((_, hash)) = self.main_chain.pop_first() {
                self.blocks.remove(&hash);
                self.dirty.remove(&hash);
            }
        }
        let root_height = self.root_height();

        let mut side: Vec<(u32, BlockHash, BlockHash)> = self
            .blocks
            .values()
            .filter(|e| self.main_chain.get(&e.height) != Some(&e.hash))
            .map(|e| (e.height, e.hash, e.prev_hash()))
            .collect();
        side.sort();
        for (height, hash, prev) in side {
            if height <= root_height || !self.blocks.contains_key(&prev) {
                self.blocks.remove(&hash);
            }
        }
    }

    /// Height the chain is rewound to for a rescan: the last main-chain block at least one
    /// week older than `earliest_key_time`, or the root.
    pub fn rescan_height(&self, earliest_key_time: u64) -> u32 {
        self.main_chain()
            .rev()
            .find(|e| e.time() as u64 + ONE_WEEK <= earliest_key_time)
            .map(|e| e.height)
            .unwrap_or_else(|| self.root_height())
    }

    /// Truncate the main chain to `height` (clamped to the root). Side branches and orphans
    /// are discarded. Returns the removed main-chain blocks, tip first.
    pub fn rewind_to(&mut self, height: u32) -> Vec<BlockEntry> {
        let height = height.max(self.root_height());
        if height >= self.tip.height {
            return Vec::new();
        }

        let removed_hashes: Vec<BlockHash> =
            self.main_chain.split_off(&(height + 1)).into_values().rev().collect();
        let removed: Vec<BlockEntry> =
            removed_hashes.iter().filter_map(|h| self.blocks.remove(h)).collect();

        let main: HashSet<BlockHash> = self.main_chain.values().copied().collect();
        self.blocks.retain(|h, _| main.contains(h));
        self.orphans.clear();
        self.dirty.retain(|h| main.contains(h));

        if let Some(new_tip) = self.get_by_height(height).cloned() {
            self.tip = new_tip;
        }
        self.replace_pending = true;
        info!("Rewound chain to height {} ({} blocks removed)", height, removed.len());
        removed
    }

    /// Locator for `getblocks`/`getheaders`: the ten most recent hashes, then exponentially
    /// sparser, ending with the root.
    pub fn block_locator(&self) -> Vec<BlockHash> {
        self.locator_from(self.tip.height)
    }

    /// Locator starting at the main-chain block at `height`.
    pub fn locator_from(&self, height: u32) -> Vec<BlockHash> {
        let root = self.root_height();
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut height = height.min(self.tip.height);
        while height > root {
            if let Some(hash) = self.main_chain.get(&height) {
                hashes.push(*hash);
            }
            if hashes.len() >= LOCATOR_DENSE_HASHES {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step).max(root);
        }
        hashes.push(self.root_hash());
        hashes
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.replace_pending || !self.dirty.is_empty()
    }

    /// Collect what needs persisting since the last call: one upserted block, or the whole
    /// main chain when several blocks changed or the chain was rewritten.
    pub fn take_save(&mut self) -> Option<BlockSave> {
        if !self.has_unsaved_changes() {
            return None;
        }
        let replace_pending = std::mem::take(&mut self.replace_pending);
        let dirty: Vec<BlockHash> = self.dirty.drain().collect();

        if !replace_pending {
            match dirty.as_slice() {
                [] => return None,
                [hash] => {
                    return self.blocks.get(hash).cloned().map(|entry| BlockSave {
                        blocks: vec![entry],
                        replace: false,
                    });
                }
                _ => {}
            }
        }
        Some(BlockSave {
            blocks: self.main_chain().cloned().collect(),
            replace: true,
        })
    }
}
