//! Validation of blocks received from peers.
//!
//! Only what an SPV client can check is verified: proof of work, timestamps,
//! header linkage and merkle inclusion. Checkpoints and fork choice are enforced
//! by the chain store.

mod header;
mod merkle;

pub use header::HeaderValidator;
pub use merkle::{MerkleMatch, MerkleVerifier, PartialMerkleVerifier};

use crate::error::ValidationResult;

pub trait Validator<T> {
    fn validate(&self, data: T) -> ValidationResult<()>;
}
