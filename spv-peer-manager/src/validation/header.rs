use std::time::Duration;

use crate::chain::{IncomingBlock, NetworkParams, Target};
use crate::error::{ValidationError, ValidationResult};
use crate::types::{BlockHash, BlockHeader, unix_time_now};
use crate::validation::Validator;

/// Checks proof of work and timestamps of single headers and header batches.
#[derive(Debug, Clone)]
pub struct HeaderValidator {
    pow_limit: Option<Target>,
    max_future_time: Duration,
}

impl HeaderValidator {
    pub fn new(params: &NetworkParams, max_future_time: Duration) -> Self {
        Self {
            pow_limit: Target::from_compact(params.pow_limit_bits),
            max_future_time,
        }
    }

    /// Validate one header whose hash was already computed, against the clock `now` (unix seconds).
    ///
    /// Proof of work is checked first: `bits` must decode, the target must be nonzero and no
    /// easier than the network limit, and the hash must meet it. Then the timestamp may not be
    /// more than the allowed drift ahead of `now`.
    pub fn check_header(
        &self,
        header: &BlockHeader,
        hash: &BlockHash,
        now: u64,
    ) -> ValidationResult<()> {
        let limit = self.pow_limit.ok_or(ValidationError::InvalidProofOfWork)?;
        let target = Target::from_compact(header.bits).ok_or(ValidationError::InvalidProofOfWork)?;
        if target.is_zero() || target > limit || !target.is_met_by(hash) {
            return Err(ValidationError::InvalidProofOfWork);
        }

        if header.time as u64 > now + self.max_future_time.as_secs() {
            return Err(ValidationError::TimestampTooFarInFuture {
                time: header.time,
            });
        }
        Ok(())
    }
}

impl Validator<&[IncomingBlock]> for HeaderValidator {
    fn validate(&self, blocks: &[IncomingBlock]) -> ValidationResult<()> {
        let now = unix_time_now();
        for (i, block) in blocks.iter().enumerate() {
            if i > 0 && block.header.prev_blockhash != blocks[i - 1].hash {
                return Err(ValidationError::InvalidHeaderChain(format!(
                    "header {} does not connect to {}",
                    block.hash,
                    blocks[i - 1].hash
                )));
            }
            self.check_header(&block.header, &block.hash, now)?;
        }

        tracing::trace!("Header batch validation passed for {} headers", blocks.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestHeaderBuilder, mine_chain};

    const NOW: u64 = 1_700_000_000;

    fn validator() -> HeaderValidator {
        HeaderValidator::new(&NetworkParams::regtest(), Duration::from_secs(2 * 60 * 60))
    }

    #[test]
    fn test_mined_header_passes() {
        let header = TestHeaderBuilder::new().build_mined();
        assert!(validator().check_header(&header, &header.block_hash(), NOW).is_ok());
    }

    #[test]
    fn test_hash_above_target_fails() {
        let mut header = TestHeaderBuilder::new().build_mined();
        let target = Target::from_compact(header.bits).unwrap();
        while target.is_met_by(&header.block_hash()) {
            header.nonce += 1;
        }
        assert_eq!(
            validator().check_header(&header, &header.block_hash(), NOW),
            Err(ValidationError::InvalidProofOfWork)
        );
    }

    #[test]
    fn test_target_easier_than_limit_fails() {
        // Valid encoding, but easier than the regtest limit.
        let header = TestHeaderBuilder::new().with_bits(0x2100ffff).build();
        assert_eq!(
            validator().check_header(&header, &BlockHash::all_zeros(), NOW),
            Err(ValidationError::InvalidProofOfWork)
        );
    }

    #[test]
    fn test_malformed_bits_fail() {
        let negative = TestHeaderBuilder::new().with_bits(0x04923456).build();
        let zero = TestHeaderBuilder::new().with_bits(0).build();
        for header in [negative, zero] {
            assert_eq!(
                validator().check_header(&header, &BlockHash::all_zeros(), NOW),
                Err(ValidationError::InvalidProofOfWork)
            );
        }
    }

    #[test]
    fn test_timestamp_drift() {
        let v = validator();
        let ok = TestHeaderBuilder::new().with_time((NOW + 2 * 60 * 60) as u32).build_mined();
        assert!(v.check_header(&ok, &ok.block_hash(), NOW).is_ok());

        let late = TestHeaderBuilder::new().with_time((NOW + 2 * 60 * 60 + 1) as u32).build_mined();
        assert_eq!(
            v.check_header(&late, &late.block_hash(), NOW),
            Err(ValidationError::TimestampTooFarInFuture {
                time: late.time
            })
        );
    }

    #[test]
    fn test_batch_requires_linkage() {
        let params = NetworkParams::regtest();
        let headers = mine_chain(&params.genesis, 3, 0);
        let mut blocks: Vec<IncomingBlock> =
            headers.iter().copied().map(IncomingBlock::from_header).collect();
        assert!(validator().validate(&blocks[..]).is_ok());
        assert!(validator().validate(&Vec::<IncomingBlock>::new()[..]).is_ok());

        blocks.swap(1, 2);
        assert!(matches!(
            validator().validate(&blocks[..]),
            Err(ValidationError::InvalidHeaderChain(_))
        ));
    }
}
