//! Split partition function
//!
//! Every node that produces or consumes a split set must compute the same
//! index for the same term, so everything here is pure 32/64-bit wrapping
//! arithmetic with no per-process state.

/// Fixed seed of the 32-bit string hash
pub const MURMUR_SEED: u32 = 0x9747_b28c;

/// Default large prime used when none is configured
pub const DEFAULT_LARGE_PRIME: i32 = 2_147_483_629;

/// MurmurHash2, 32-bit, little-endian block reads, fixed seed
pub fn murmur_hash32(data: &[u8]) -> u32 {
    murmur_hash32_seeded(data, MURMUR_SEED)
}

/// MurmurHash2, 32-bit, with an explicit seed
pub fn murmur_hash32_seeded(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Split index of an integer term
///
/// `(((t * P + 12345) & 0x7FFFFFFF) >> 16) mod K` in 64-bit wrapping
/// arithmetic.
#[inline]
pub fn split_index_int(term: i64, large_prime: i32, num_splits: usize) -> usize {
    let mixed = term
        .wrapping_mul(large_prime as i64)
        .wrapping_add(12345)
        & 0x7FFF_FFFF;
    (mixed >> 16) as usize % num_splits
}

/// Split index of a byte-string term
///
/// Same mixing as [`split_index_int`] over the 32-bit string hash, in 32-bit
/// wrapping arithmetic.
#[inline]
pub fn split_index_bytes(term: &[u8], large_prime: i32, num_splits: usize) -> usize {
    let hash = murmur_hash32(term) as i32;
    let mixed = hash.wrapping_mul(large_prime).wrapping_add(12345) & 0x7FFF_FFFF;
    (mixed >> 16) as usize % num_splits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_scenario_is_stable() {
        // 42 * 7 + 12345 = 12639; 12639 >> 16 = 0
        let first = split_index_int(42, 7, 4);
        assert_eq!(first, 0);
        for _ in 0..100 {
            assert_eq!(split_index_int(42, 7, 4), first);
        }
    }

    #[test]
    fn test_int_index_in_range_for_extremes() {
        for term in [i64::MIN, -1, 0, 1, i64::MAX] {
            for k in 1..9 {
                assert!(split_index_int(term, DEFAULT_LARGE_PRIME, k) < k);
            }
        }
    }

    #[test]
    fn test_int_mixing_uses_high_bits() {
        // 1 << 16 lands exactly on the first bit kept after the shift
        assert_eq!(split_index_int(1 << 16, 1, 1 << 15), 1);
        assert_eq!(split_index_int(-12345, 1, 7), 0);
    }

    #[test]
    fn test_murmur_known_values() {
        assert_eq!(murmur_hash32_seeded(b"", 0), 0);
        assert_eq!(murmur_hash32(b"abc"), murmur_hash32(b"abc"));
        assert_ne!(murmur_hash32(b"abc"), murmur_hash32(b"acb"));
    }

    #[test]
    fn test_bytes_index_in_range() {
        for term in [&b""[..], b"a", b"hello world", b"\xff\xfe\x00"] {
            for k in 1..9 {
                assert!(split_index_bytes(term, DEFAULT_LARGE_PRIME, k) < k);
            }
        }
    }
}
