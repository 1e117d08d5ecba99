//! The proof-of-work digest.
//!
//! One digest drives both seal kinds: its high 128 bits are compared
//! against the block target, its low 128 bits against the fruit target.
//! The mix folds words of the active lookup table so the function cannot
//! be evaluated without the table snapshot.

use crate::crypto::{keccak256, keccak256_concat};
use primitive_types::{H256, U256};

/// Computes `(mix_digest, result)` for one nonce attempt. `hash` is the
/// header's no-nonce hash; `result` is the 256-bit value measured against
/// the difficulty targets.
pub fn pow_digest(dataset: &[u64], hash: &H256, nonce: u64) -> (H256, [u8; 32]) {
    debug_assert!(!dataset.is_empty());

    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(hash.as_bytes());
    seed_input[32..].copy_from_slice(&nonce.to_be_bytes());
    let seed = keccak256(&seed_input);

    let words = dataset.len() as u64;
    let mut mix = [0u8; 64];
    for i in 0..8 {
        let sel = u32::from_be_bytes(seed.as_bytes()[i * 4..(i + 1) * 4].try_into().unwrap());
        let index = ((sel as u64) ^ nonce.rotate_left(8 * i as u32)) % words;
        let word = dataset[index as usize] ^ (sel as u64);
        mix[i * 8..(i + 1) * 8].copy_from_slice(&word.to_be_bytes());
    }

    let digest = keccak256_concat([seed.as_bytes(), &mix[..]]);
    let result = keccak256_concat([hash.as_bytes(), digest.as_bytes(), &nonce.to_be_bytes()]);
    (digest, result.to_fixed_bytes())
}

/// `⌊2¹²⁸ / difficulty⌋`, the boundary a 128-bit result half must not
/// exceed.
pub fn target_for(difficulty: U256) -> U256 {
    if difficulty.is_zero() {
        U256::MAX
    } else {
        (U256::one() << 128) / difficulty
    }
}

/// Splits a digest result into its `(high, low)` 128-bit halves.
pub fn split_result(result: &[u8; 32]) -> (U256, U256) {
    (
        U256::from_big_endian(&result[..16]),
        U256::from_big_endian(&result[16..]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let dataset = vec![7u64; 1024];
        let hash = keccak256(b"header");
        assert_eq!(
            pow_digest(&dataset, &hash, 42),
            pow_digest(&dataset, &hash, 42)
        );
        assert_ne!(
            pow_digest(&dataset, &hash, 42).1,
            pow_digest(&dataset, &hash, 43).1
        );
    }

    #[test]
    fn digest_depends_on_the_table() {
        let hash = keccak256(b"header");
        let a = pow_digest(&vec![1u64; 1024], &hash, 5);
        let b = pow_digest(&vec![2u64; 1024], &hash, 5);
        assert_ne!(a.1, b.1);
    }

    #[test]
    fn unit_difficulty_accepts_any_half() {
        let target = target_for(U256::one());
        let (high, low) = split_result(&[0xffu8; 32]);
        assert!(high <= target);
        assert!(low <= target);
    }

    #[test]
    fn split_orders_halves_big_endian() {
        let mut result = [0u8; 32];
        result[15] = 1; // high half == 1
        result[31] = 2; // low half == 2
        let (high, low) = split_result(&result);
        assert_eq!(high, U256::from(1));
        assert_eq!(low, U256::from(2));
    }
}
