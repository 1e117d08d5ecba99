//! Hashing and secp256k1 signature primitives.
//!
//! Thin wrappers over `sha3` and `k256` so the rest of the crate never
//! touches curve types directly: keys travel as uncompressed SEC1 bytes,
//! signatures as 65-byte `r || s || v` blobs with a recoverable id.

use crate::blockcfg::PbftSign;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use primitive_types::{H160, H256};
use sha3::{Digest, Keccak256};

/// Uncompressed SEC1 public key size (0x04 tag + two coordinates).
pub const PUBKEY_SIZE: usize = 65;
/// Recoverable signature size (`r || s || v`).
pub const SIGNATURE_SIZE: usize = 65;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid public key encoding")]
    InvalidPubkey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("public key recovery failed")]
    RecoveryFailed,
    #[error("signing failed")]
    SigningFailed,
}

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Keccak-256 over several byte slices fed in order.
pub fn keccak256_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256::from_slice(&hasher.finalize())
}

/// Derives the 20-byte address from an uncompressed public key:
/// `keccak(pubkey[1..])[12..]`.
pub fn pubkey_to_address(pubkey: &[u8]) -> Result<H160, Error> {
    if pubkey.len() != PUBKEY_SIZE || pubkey[0] != 0x04 {
        return Err(Error::InvalidPubkey);
    }
    let hash = keccak256(&pubkey[1..]);
    Ok(H160::from_slice(&hash.as_bytes()[12..]))
}

/// Checks that `pubkey` is a well-formed uncompressed secp256k1 point.
pub fn validate_pubkey(pubkey: &[u8]) -> Result<(), Error> {
    VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| Error::InvalidPubkey)?;
    Ok(())
}

/// Signs a 32-byte prehash, returning the 65-byte recoverable signature.
pub fn sign_hash(key: &SigningKey, hash: H256) -> Result<Vec<u8>, Error> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(hash.as_bytes())
        .map_err(|_| Error::SigningFailed)?;
    let mut out = Vec::with_capacity(SIGNATURE_SIZE);
    out.extend_from_slice(&signature.to_bytes());
    out.push(recovery_id.to_byte());
    Ok(out)
}

/// Recovers the uncompressed public key that produced `sig` over `hash`.
pub fn recover_pubkey(hash: H256, sig: &[u8]) -> Result<Vec<u8>, Error> {
    if sig.len() != SIGNATURE_SIZE {
        return Err(Error::InvalidSignature);
    }
    let signature =
        Signature::from_slice(&sig[..64]).map_err(|_| Error::InvalidSignature)?;
    let recovery_id =
        RecoveryId::from_byte(sig[64]).ok_or(Error::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &signature, recovery_id)
        .map_err(|_| Error::RecoveryFailed)?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

/// Aggregated sign-hash over a batch of PBFT signs: the keccak of the
/// concatenated per-sign message hashes. A fruit header's `sign_hash`
/// commits to exactly this value.
pub fn calc_sign_hash(signs: &[PbftSign]) -> H256 {
    let mut hasher = Keccak256::new();
    for sign in signs {
        hasher.update(sign.hash_with_no_sign().as_bytes());
    }
    H256::from_slice(&hasher.finalize())
}

/// Generates a fresh signing key from the OS entropy source.
pub fn generate_key() -> SigningKey {
    SigningKey::random(&mut rand::rngs::OsRng)
}

/// Uncompressed SEC1 bytes of the key's public half.
pub fn pubkey_bytes(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let key = generate_key();
        let hash = keccak256(b"ratatosk");
        let sig = sign_hash(&key, hash).unwrap();
        let recovered = recover_pubkey(hash, &sig).unwrap();
        assert_eq!(recovered, pubkey_bytes(&key));
    }

    #[test]
    fn address_is_tail_of_keccak() {
        let key = generate_key();
        let pubkey = pubkey_bytes(&key);
        let addr = pubkey_to_address(&pubkey).unwrap();
        let expect = keccak256(&pubkey[1..]);
        assert_eq!(addr.as_bytes(), &expect.as_bytes()[12..]);
    }

    #[test]
    fn malformed_pubkey_is_rejected() {
        assert_eq!(pubkey_to_address(&[0u8; 65]), Err(Error::InvalidPubkey));
        assert_eq!(pubkey_to_address(&[4u8; 3]), Err(Error::InvalidPubkey));
        assert!(validate_pubkey(&[0u8; 65]).is_err());
    }

    #[test]
    fn recovery_rejects_bad_signature_length() {
        let hash = keccak256(b"x");
        assert_eq!(
            recover_pubkey(hash, &[0u8; 10]),
            Err(Error::InvalidSignature)
        );
    }
}
