// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Deterministic hashing over flow words.
//!
//! Revalidation tags, bond and multipath link selection all need a hash that
//! is stable for the life of the process and independent of the std hasher.
//! Hash maps use [`map_hasher`] instead, a fixed-seed `ahash` state so map
//! iteration order is reproducible across runs.

use ahash::RandomState;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

fn mix(mut hash: u32, data: u32) -> u32 {
    let mut k = data.wrapping_mul(C1);
    k = k.rotate_left(15);
    k = k.wrapping_mul(C2);
    hash ^= k;
    hash = hash.rotate_left(13);
    hash.wrapping_mul(5).wrapping_add(0xe654_6b64)
}

fn finish(mut hash: u32, n_bytes: u32) -> u32 {
    hash ^= n_bytes;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^ (hash >> 16)
}

/// Murmur3-style hash of a word sequence with a caller-supplied basis.
#[must_use]
pub fn hash_words(words: &[u32], basis: u32) -> u32 {
    let mut hash = basis;
    for &w in words {
        hash = mix(hash, w);
    }
    finish(hash, (words.len() * 4) as u32)
}

/// Fixed-seed hasher state for engine-internal maps.
#[must_use]
pub fn map_hasher() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let words = [1u32, 2, 3, 4];
        assert_eq!(hash_words(&words, 0), hash_words(&words, 0));
        assert_ne!(hash_words(&words, 0), hash_words(&words, 1));
        assert_ne!(hash_words(&words, 0), hash_words(&[1, 2, 3], 0));
    }

    #[test]
    fn distributes_single_bit_changes() {
        let a = hash_words(&[0, 0, 0, 0], 0);
        let b = hash_words(&[0, 0, 0, 1], 0);
        assert_ne!(a & 0xffff, b & 0xffff);
    }
}
