//! 32-bit Murmur3, the hash family behind BIP37 filters.

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

/// Murmur3 (x86, 32-bit) of `data` with `seed`.
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let k = tail.iter().enumerate().fold(0u32, |k, (i, b)| k | (*b as u32) << (8 * i));
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_empty() {
        assert_eq!(murmur3(b"", 0), 0);
        assert_eq!(murmur3(b"", 1), 0x514e28b7);
        assert_eq!(murmur3(b"", 0xffffffff), 0x81f16f39);
        assert_eq!(murmur3(b"", 0xfba4c795), 0x6a396f08);
    }

    #[test]
    fn test_murmur3_short_inputs() {
        assert_eq!(murmur3(b"\x00", 0), 0x514e28b7);
        assert_eq!(murmur3(b"\xff", 0), 0xfd6cf10d);
        assert_eq!(murmur3(b"Hello", 0), 0x12da77c8);
    }

    #[test]
    fn test_murmur3_full_blocks() {
        assert_eq!(murmur3(b"test", 0), 0xba6bd213);
        assert_eq!(murmur3(b"test", 1), 0x99c02ae2);
        assert_eq!(murmur3(b"\x21\x43\x65\x87", 0), 0xf55b516b);
        assert_eq!(murmur3(b"\x21\x43\x65\x87", 0x5082edee), 0x2362f9de);
    }
}
