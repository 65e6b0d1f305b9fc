//! Bloom filter lifecycle: generations, rate selection and false-positive tracking.

use tracing::{debug, info};

use super::builder::BloomFilterBuilder;
use super::filter::{BloomFilter, BloomFlags};
use crate::error::BloomResult;
use crate::network::FilterLoad;
use crate::types::Transaction;

/// Default false positive rate while catching up.
pub const DEFAULT_FP_RATE: f64 = 0.0005;

/// False positive rate once synced, or after a peer overloaded us with false positives.
pub const REDUCED_FP_RATE: f64 = 0.00005;

/// Transactions per block the false positive estimate is normalized against.
const FP_WINDOW_TX: f64 = 1400.0;

/// Weight of the newest block in the moving estimate.
const FP_SMOOTHING: f64 = 0.01;

/// Configuration for bloom filter behavior
#[derive(Debug, Clone)]
pub struct BloomFilterConfig {
    /// Rate used while far behind the network
    pub false_positive_rate: f64,
    /// Rate used once synced
    pub reduced_false_positive_rate: f64,
    /// Lower bound of the random size padding
    pub pad_min: u32,
    /// Upper bound of the random size padding
    pub pad_max: u32,
    /// Update behavior flags
    pub flags: BloomFlags,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: DEFAULT_FP_RATE,
            reduced_false_positive_rate: REDUCED_FP_RATE,
            pad_min: 100,
            pad_max: 200,
            flags: BloomFlags::All,
        }
    }
}

/// Statistics for bloom filter usage
#[derive(Debug, Clone, Default)]
pub struct BloomFilterStats {
    /// Number of times the filter was regenerated
    pub recreations: u64,
    /// Transactions checked against the filter
    pub queries: u64,
    /// Transactions that matched
    pub matches: u64,
    /// Expected false positive rate of the current filter
    pub current_false_positive_rate: f64,
}

/// Owns the current filter and its generation counter.
#[derive(Debug)]
pub struct BloomFilterManager {
    config: BloomFilterConfig,
    filter: Option<BloomFilter>,
    generation: u64,
    element_count: usize,
    rate_in_use: f64,
    force_reduced: bool,
    stats: BloomFilterStats,
}

impl BloomFilterManager {
    pub fn new(config: BloomFilterConfig) -> Self {
        let rate_in_use = config.false_positive_rate;
        Self {
            config,
            filter: None,
            generation: 0,
            element_count: 0,
            rate_in_use,
            force_reduced: false,
            stats: BloomFilterStats::default(),
        }
    }

    /// Current generation. Zero means no filter was built yet.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// False positive rate the current filter was built for.
    pub fn false_positive_rate(&self) -> f64 {
        self.rate_in_use
    }

    pub fn filter(&self) -> Option<&BloomFilter> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> &BloomFilterStats {
        &self.stats
    }

    /// Use the reduced rate for every future generation.
    pub fn force_reduced_rate(&mut self) {
        self.force_reduced = true;
    }

    /// Whether the wallet grew past the elements in the current filter.
    pub fn needs_update(&self, wallet_element_count: usize) -> bool {
        self.filter.is_none() || wallet_element_count > self.element_count
    }

    /// Build a new generation from the wallet's elements.
    pub fn rebuild(&mut self, elements: Vec<Vec<u8>>, synced: bool) -> BloomResult<FilterLoad> {
        let rate = if synced || self.force_reduced {
            self.config.reduced_false_positive_rate
        } else {
            self.config.false_positive_rate
        };
        let element_count = elements.len();
        let filter = BloomFilterBuilder::new()
            .false_positive_rate(rate)
            .flags(self.config.flags)
            .random_padding(self.config.pad_min..=self.config.pad_max, &mut rand::thread_rng())
            .add_elements(elements)
            .build()?;

        self.generation += 1;
        self.element_count = element_count;
        self.rate_in_use = rate;
        self.stats.recreations += 1;
        self.stats.current_false_positive_rate =
            filter.estimate_false_positive_rate(element_count as u32);

        info!(
            "Built bloom filter generation {} with {} elements ({} bytes, fp rate {})",
            self.generation,
            element_count,
            filter.size(),
            rate
        );
        let load = filter.to_filter_load();
        self.filter = Some(filter);
        Ok(load)
    }

    /// Check a relayed transaction against the filter, applying BIP37 updates.
    /// Everything matches before the first filter is built.
    pub fn matches_transaction(&mut self, tx: &Transaction) -> bool {
        self.stats.queries += 1;
        let matched = match self.filter.as_mut() {
            Some(filter) => filter.matches_transaction(tx),
            None => true,
        };
        if matched {
            self.stats.matches += 1;
        }
        matched
    }

    /// Whether a peer's observed false positive rate means it is padding our filter results.
    pub fn is_overloaded(&self, observed_rate: f64) -> bool {
        let overloaded = observed_rate > 10.0 * self.rate_in_use;
        if overloaded {
            debug!("Observed fp rate {} exceeds 10x filter rate {}", observed_rate, self.rate_in_use);
        }
        overloaded
    }
}

/// Fold one merkle block into a peer's moving false positive estimate.
pub fn update_fp_rate(current: f64, total_transactions: u32, false_positives: u32) -> f64 {
    let decay = 1.0 - FP_SMOOTHING * total_transactions as f64 / FP_WINDOW_TX;
    (current * decay + FP_SMOOTHING * false_positives as f64 / FP_WINDOW_TX).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_increase() {
        let mut manager = BloomFilterManager::new(BloomFilterConfig::default());
        assert_eq!(manager.generation(), 0);
        assert!(manager.needs_update(0));

        manager.rebuild(vec![vec![1; 20]], false).unwrap();
        assert_eq!(manager.generation(), 1);
        assert!(!manager.needs_update(1));
        assert!(manager.needs_update(2));

        manager.rebuild(vec![vec![1; 20], vec![2; 20]], false).unwrap();
        assert_eq!(manager.generation(), 2);
        assert_eq!(manager.element_count(), 2);
    }

    #[test]
    fn test_rate_selection() {
        let mut manager = BloomFilterManager::new(BloomFilterConfig::default());
        manager.rebuild(vec![], false).unwrap();
        assert_eq!(manager.false_positive_rate(), DEFAULT_FP_RATE);

        manager.rebuild(vec![], true).unwrap();
        assert_eq!(manager.false_positive_rate(), REDUCED_FP_RATE);

        manager.force_reduced_rate();
        manager.rebuild(vec![], false).unwrap();
        assert_eq!(manager.false_positive_rate(), REDUCED_FP_RATE);
    }

    #[test]
    fn test_padding_applied() {
        let mut manager = BloomFilterManager::new(BloomFilterConfig::default());
        let load = manager.rebuild(vec![vec![7; 20]], false).unwrap();
        // At least 101 elements worth of capacity at 0.0005.
        let min = BloomFilter::new(101, DEFAULT_FP_RATE, 0, BloomFlags::All).unwrap();
        assert!(load.data.len() >= min.size());
    }

    #[test]
    fn test_fp_rate_update() {
        let rate = update_fp_rate(REDUCED_FP_RATE, 1400, 0);
        assert!(rate < REDUCED_FP_RATE);

        let mut rate = REDUCED_FP_RATE;
        for _ in 0..50 {
            rate = update_fp_rate(rate, 20, 10);
        }
        let manager = BloomFilterManager::new(BloomFilterConfig {
            false_positive_rate: REDUCED_FP_RATE,
            ..Default::default()
        });
        assert!(manager.is_overloaded(rate));
        assert!(!manager.is_overloaded(REDUCED_FP_RATE));
    }

    #[test]
    fn test_unfiltered_matches_everything() {
        let mut manager = BloomFilterManager::new(BloomFilterConfig::default());
        let tx = Transaction {
            version: 1,
            input: vec![],
            output: vec![],
            lock_time: 0,
        };
        assert!(manager.matches_transaction(&tx));
        assert_eq!(manager.stats().matches, 1);
    }
}
