//! Misbehavior accounting for peers.
//!
//! Every violation disconnects the offending peer and adds a penalty to its
//! [`PeerRecord`](super::PeerRecord). Once the accumulated score reaches the ban
//! threshold the record is dropped from the known set and its address is banned.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

/// Score at which a peer is banned.
pub const DEFAULT_BAN_SCORE: i32 = 100;

/// Kinds of peer misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Misbehavior {
    /// Header with bad proof of work, broken linkage or malformed bits
    InvalidHeader,
    /// Merkle block whose partial tree does not verify
    InvalidMerkleProof,
    /// Transaction that does not match the loaded bloom filter
    FilterViolation,
    /// Block that contradicts a hard-coded checkpoint
    CheckpointMismatch,
    /// Fork that would rewind beyond the reorg limit
    ReorgTooDeep,
    /// Download peer stalled
    Timeout,
    /// Malformed, oversized or unsolicited message
    InvalidMessage,
}

impl Misbehavior {
    /// Classify a block validation failure.
    pub fn from_validation(err: &ValidationError) -> Self {
        match err {
            ValidationError::InvalidMerkleProof(_) => Misbehavior::InvalidMerkleProof,
            ValidationError::CheckpointMismatch {
                ..
            } => Misbehavior::CheckpointMismatch,
            ValidationError::ReorgTooDeep {
                ..
            } => Misbehavior::ReorgTooDeep,
            ValidationError::InvalidSeed(_) => Misbehavior::InvalidMessage,
            ValidationError::InvalidProofOfWork
            | ValidationError::InvalidHeaderChain(_)
            | ValidationError::TimestampTooFarInFuture {
                ..
            } => Misbehavior::InvalidHeader,
        }
    }
}

/// Penalty for each kind of misbehavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MisbehaviorScores {
    pub invalid_header: i32,
    pub invalid_merkle_proof: i32,
    pub filter_violation: i32,
    pub checkpoint_mismatch: i32,
    pub reorg_too_deep: i32,
    pub timeout: i32,
    pub invalid_message: i32,
}

impl Default for MisbehaviorScores {
    fn default() -> Self {
        Self {
            invalid_header: 50,
            invalid_merkle_proof: 50,
            filter_violation: 20,
            checkpoint_mismatch: 100,
            reorg_too_deep: 100,
            timeout: 5,
            invalid_message: 10,
        }
    }
}

impl MisbehaviorScores {
    pub fn score_for(&self, misbehavior: Misbehavior) -> i32 {
        match misbehavior {
            Misbehavior::InvalidHeader => self.invalid_header,
            Misbehavior::InvalidMerkleProof => self.invalid_merkle_proof,
            Misbehavior::FilterViolation => self.filter_violation,
            Misbehavior::CheckpointMismatch => self.checkpoint_mismatch,
            Misbehavior::ReorgTooDeep => self.reorg_too_deep,
            Misbehavior::Timeout => self.timeout,
            Misbehavior::InvalidMessage => self.invalid_message,
        }
    }
}

/// Clamp a persisted misbehavior score into `0..=DEFAULT_BAN_SCORE`.
pub(crate) fn clamp_misbehavior_score<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let v = i32::deserialize(deserializer)?;
    if !(0..=DEFAULT_BAN_SCORE).contains(&v) {
        tracing::warn!("Peer has invalid score {v}, clamping to 0..={DEFAULT_BAN_SCORE}");
    }
    Ok(v.clamp(0, DEFAULT_BAN_SCORE))
}
