//! Chain work calculation for determining the best chain
//!
//! Cumulative proof of work decides fork choice: the chain with strictly more
//! work wins. Work per block is `2^256 / (target + 1)`.

use std::fmt;
use std::ops::Add;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::types::{BlockHash, BlockHeader};

/// A 256-bit proof-of-work target decoded from the compact `bits` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
    /// Decode compact `bits`. Returns `None` for negative or overflowing encodings.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;

        if mantissa != 0 && bits & 0x0080_0000 != 0 {
            return None;
        }
        if mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32))
        {
            return None;
        }

        let value = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            U256::from(mantissa) << (8 * (exponent - 3))
        };
        Some(Self(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether `hash`, read as a little-endian 256-bit number, is at or below this target.
    pub fn is_met_by(&self, hash: &BlockHash) -> bool {
        U256::from_little_endian(hash.as_bytes()) <= self.0
    }

    /// Work represented by one block at this target.
    pub fn to_work(&self) -> ChainWork {
        if self.0.is_zero() {
            return ChainWork::zero();
        }
        // 2^256 / (t + 1) == (!t / (t + 1)) + 1
        let denominator = self.0.saturating_add(U256::one());
        ChainWork((!self.0 / denominator).saturating_add(U256::one()))
    }
}

/// Represents cumulative chain work as a 256-bit integer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChainWork(U256);

impl ChainWork {
    /// Create a new ChainWork with zero work
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn from_u64(work: u64) -> Self {
        Self(U256::from(work))
    }

    /// Work of a single header. Malformed `bits` carry no work.
    pub fn from_header(header: &BlockHeader) -> Self {
        Target::from_compact(header.bits).map(|t| t.to_work()).unwrap_or_default()
    }

    /// Add the work from a header to this cumulative work
    pub fn add_header(self, header: &BlockHeader) -> Self {
        self + Self::from_header(header)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.0.to_big_endian(&mut bytes);
        bytes
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_big_endian(&bytes))
    }

    /// Create ChainWork from a big-endian hex string
    pub fn from_hex(hex: &str) -> Result<Self, String> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex).map_err(|e| format!("Invalid hex: {}", e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("Invalid work length: expected 32 bytes, got {}", b.len()))?;
        Ok(Self::from_be_bytes(bytes))
    }
}

impl Add for ChainWork {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}
