//! Bloom filter construction from wallet elements

use std::ops::RangeInclusive;

use rand::Rng;

use super::filter::{BloomFilter, BloomFlags};
use crate::error::BloomResult;

/// Builder for constructing bloom filters from wallet state
#[derive(Debug, Clone)]
pub struct BloomFilterBuilder {
    /// Elements to insert (pubkey hashes, scripts, serialized outpoints)
    elements: Vec<Vec<u8>>,
    /// Desired false positive rate
    false_positive_rate: f64,
    /// Random tweak value
    tweak: u32,
    /// Update flags
    flags: BloomFlags,
    /// Extra capacity so the filter size does not reveal the wallet size
    padding: u32,
}

impl Default for BloomFilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilterBuilder {
    /// Create a new bloom filter builder
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            false_positive_rate: 0.0005,
            tweak: rand::random::<u32>(),
            flags: BloomFlags::All,
            padding: 0,
        }
    }

    /// Set the false positive rate
    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    /// Set the tweak value
    pub fn tweak(mut self, tweak: u32) -> Self {
        self.tweak = tweak;
        self
    }

    /// Set the update flags
    pub fn flags(mut self, flags: BloomFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set an exact padding
    pub fn padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Draw the padding uniformly from `range`
    pub fn random_padding<R: Rng + ?Sized>(mut self, range: RangeInclusive<u32>, rng: &mut R) -> Self {
        self.padding = if range.is_empty() {
            *range.start()
        } else {
            rng.gen_range(range)
        };
        self
    }

    /// Add raw data to the filter
    pub fn add_data(mut self, data: Vec<u8>) -> Self {
        self.elements.push(data);
        self
    }

    /// Add multiple data elements
    pub fn add_elements(mut self, elements: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.elements.extend(elements);
        self
    }

    /// Number of real (unpadded) elements
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Build the bloom filter
    pub fn build(self) -> BloomResult<BloomFilter> {
        let capacity = (self.elements.len() as u32).saturating_add(self.padding).max(1);
        let mut filter =
            BloomFilter::new(capacity, self.false_positive_rate, self.tweak, self.flags)?;
        for element in &self.elements {
            filter.insert(element);
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_build_contains_elements() {
        let filter = BloomFilterBuilder::new()
            .tweak(1)
            .add_data(vec![1, 2, 3])
            .add_elements(vec![vec![4, 5], vec![6]])
            .build()
            .unwrap();
        assert!(filter.contains(&[1, 2, 3]));
        assert!(filter.contains(&[4, 5]));
        assert!(filter.contains(&[6]));
        assert_eq!(filter.tweak(), 1);
    }

    #[test]
    fn test_padding_grows_filter() {
        let base = BloomFilterBuilder::new().add_data(vec![1]).build().unwrap();
        let padded = BloomFilterBuilder::new().add_data(vec![1]).padding(150).build().unwrap();
        assert!(padded.size() > base.size());
    }

    #[test]
    fn test_random_padding_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let builder = BloomFilterBuilder::new().random_padding(100..=200, &mut rng);
            assert!((100..=200).contains(&builder.padding));
        }
    }

    #[test]
    fn test_empty_wallet_still_builds() {
        let filter = BloomFilterBuilder::new().build().unwrap();
        assert!(filter.size() >= 1);
        assert!(filter.is_empty());
    }
}
