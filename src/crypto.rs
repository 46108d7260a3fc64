//! Session cryptography: X25519 key agreement and AES-256-GCM chat sealing
//!
//! Every TCP session gets a fresh ephemeral key pair on each side. The raw
//! X25519 output is used directly as the AES-256-GCM key for that session.
//! There is no identity binding: any responder speaking the protocol is
//! accepted, matching the LAN trust model.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 public key / shared secret size
pub const KEY_SIZE: usize = 32;

/// AES-GCM standard nonce size
pub const NONCE_SIZE: usize = 12;

pub type SharedSecret = [u8; KEY_SIZE];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key length: {0}")]
    InvalidPublicKey(usize),
    #[error("invalid nonce length: {0}")]
    InvalidNonce(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (authentication tag mismatch)")]
    Decrypt,
}

/// Per-connection ephemeral X25519 key pair
///
/// `StaticSecret` is used instead of `EphemeralSecret` because the initiator
/// must keep the secret in the peer table until `handshake_response` arrives.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    pub public: [u8; KEY_SIZE],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Complete key agreement against the remote public key
    pub fn derive(&self, remote_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        derive_shared_key(&self.secret, remote_public)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish_non_exhaustive()
    }
}

/// Scalar multiplication of the local private scalar with the remote point
pub fn derive_shared_key(
    secret: &StaticSecret,
    remote_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let remote: [u8; KEY_SIZE] = remote_public
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey(remote_public.len()))?;
    Ok(secret.diffie_hellman(&PublicKey::from(remote)).to_bytes())
}

/// Seal a chat payload. Returns (ciphertext, nonce).
pub fn seal(key: &SharedSecret, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok((ciphertext, nonce.to_vec()))
}

/// Open a sealed payload. Tag mismatch is an error, never a wrong plaintext.
pub fn open(key: &SharedSecret, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Short printable identifier of a session key (SHA3-256 prefix, never the key itself)
pub fn session_fingerprint(secret: &SharedSecret) -> String {
    let digest = Sha3_256::digest(secret);
    hex::encode(&digest[..8])
}

/// Get public key fingerprint for logging
pub fn pubkey_fingerprint(pubkey: &[u8]) -> String {
    hex::encode(&pubkey[..pubkey.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_agreement_symmetry() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();

        let ab = a.derive(&b.public).unwrap();
        let ba = b.derive(&a.public).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_keypairs_unique() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn test_derive_rejects_short_key() {
        let a = EphemeralKeyPair::generate();
        assert_eq!(a.derive(&[0u8; 31]), Err(CryptoError::InvalidPublicKey(31)));
    }

    #[test]
    fn test_seal_open() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let key = a.derive(&b.public).unwrap();

        let (ct, nonce) = seal(&key, b"hello").unwrap();
        assert_eq!(nonce.len(), NONCE_SIZE);
        assert_ne!(&ct[..], b"hello");
        assert_eq!(open(&key, &ct, &nonce).unwrap(), b"hello");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let key = EphemeralKeyPair::generate()
            .derive(&EphemeralKeyPair::generate().public)
            .unwrap();
        let other = EphemeralKeyPair::generate()
            .derive(&EphemeralKeyPair::generate().public)
            .unwrap();

        let (ct, nonce) = seal(&key, b"secret").unwrap();
        assert_eq!(open(&other, &ct, &nonce), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_open_tampered_ciphertext_fails() {
        let key = [7u8; KEY_SIZE];
        let (mut ct, nonce) = seal(&key, b"payload").unwrap();
        ct[0] ^= 0xff;
        assert_eq!(open(&key, &ct, &nonce), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_open_bad_nonce_length() {
        let key = [7u8; KEY_SIZE];
        let (ct, _) = seal(&key, b"payload").unwrap();
        assert_eq!(open(&key, &ct, &[0u8; 8]), Err(CryptoError::InvalidNonce(8)));
    }

    #[test]
    fn test_nonces_fresh_per_message() {
        let key = [1u8; KEY_SIZE];
        let (_, n1) = seal(&key, b"x").unwrap();
        let (_, n2) = seal(&key, b"x").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_session_fingerprint_stable() {
        let key = [9u8; KEY_SIZE];
        assert_eq!(session_fingerprint(&key), session_fingerprint(&key));
        assert_eq!(session_fingerprint(&key).len(), 16);
        assert_ne!(session_fingerprint(&key), session_fingerprint(&[8u8; KEY_SIZE]));
    }
}
