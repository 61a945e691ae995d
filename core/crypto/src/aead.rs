//! Authenticated encryption with associated data.
//!
//! Nonces are always supplied by the caller. The engine never generates them
//! on its own; uniqueness per key is the responsibility of the stream format
//! in [`crate::stream`].

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    ChaCha20Poly1305, XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};

use crate::keys::VaultKey;
use myvault_common::{Error, Result};

/// Authentication tag size (16 bytes) for every supported algorithm.
pub const TAG_SIZE: usize = 16;

/// AEAD algorithm recorded in the manifest and in every file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    XChaCha20Poly1305,
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Nonce length in bytes.
    pub fn nonce_len(&self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            Self::ChaCha20Poly1305 | Self::Aes256Gcm => 12,
        }
    }

    /// Width in bytes of the chunk counter appended to the base nonce.
    pub fn counter_len(&self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 8,
            Self::ChaCha20Poly1305 | Self::Aes256Gcm => 4,
        }
    }

    /// Length of the random per-file nonce prefix.
    pub fn base_nonce_len(&self) -> usize {
        self.nonce_len() - self.counter_len()
    }

    /// Largest chunk count addressable by the counter.
    pub fn max_chunks(&self) -> u64 {
        match self.counter_len() {
            8 => u64::MAX,
            width => (1u64 << (width * 8)) - 1,
        }
    }

    /// Stable identifier written into file headers.
    pub fn id(&self) -> u8 {
        match self {
            Self::XChaCha20Poly1305 => 1,
            Self::ChaCha20Poly1305 => 2,
            Self::Aes256Gcm => 3,
        }
    }

    /// Look up an algorithm by header identifier.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::XChaCha20Poly1305),
            2 => Some(Self::ChaCha20Poly1305),
            3 => Some(Self::Aes256Gcm),
            _ => None,
        }
    }
}

impl Default for CipherAlgorithm {
    fn default() -> Self {
        Self::XChaCha20Poly1305
    }
}

/// Encrypt and authenticate `plaintext`.
///
/// # Preconditions
/// - `nonce` is `algorithm.nonce_len()` bytes and never reused with this key
///
/// # Postconditions
/// - Returns ciphertext || tag, `plaintext.len() + TAG_SIZE` bytes
///
/// # Errors
/// - `InvalidParameter` if the nonce length is wrong
pub fn seal(
    algorithm: CipherAlgorithm,
    key: &VaultKey,
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    check_nonce(algorithm, nonce)?;
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    match algorithm {
        CipherAlgorithm::XChaCha20Poly1305 => seal_with::<XChaCha20Poly1305>(key, nonce, payload),
        CipherAlgorithm::ChaCha20Poly1305 => seal_with::<ChaCha20Poly1305>(key, nonce, payload),
        CipherAlgorithm::Aes256Gcm => seal_with::<Aes256Gcm>(key, nonce, payload),
    }
}

/// Verify and decrypt `sealed` (ciphertext || tag).
///
/// # Errors
/// - `InvalidParameter` if the nonce length is wrong
/// - `AuthFailure` if the input is shorter than a tag or the tag does not
///   verify; no plaintext is returned in that case
pub fn open(
    algorithm: CipherAlgorithm,
    key: &VaultKey,
    nonce: &[u8],
    aad: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    check_nonce(algorithm, nonce)?;
    if sealed.len() < TAG_SIZE {
        return Err(Error::AuthFailure);
    }
    let payload = Payload { msg: sealed, aad };
    match algorithm {
        CipherAlgorithm::XChaCha20Poly1305 => open_with::<XChaCha20Poly1305>(key, nonce, payload),
        CipherAlgorithm::ChaCha20Poly1305 => open_with::<ChaCha20Poly1305>(key, nonce, payload),
        CipherAlgorithm::Aes256Gcm => open_with::<Aes256Gcm>(key, nonce, payload),
    }
}

fn check_nonce(algorithm: CipherAlgorithm, nonce: &[u8]) -> Result<()> {
    if nonce.len() != algorithm.nonce_len() {
        return Err(Error::InvalidParameter(format!(
            "Invalid nonce length for {:?}: expected {}, got {}",
            algorithm,
            algorithm.nonce_len(),
            nonce.len()
        )));
    }
    Ok(())
}

fn seal_with<C: Aead + KeyInit>(key: &VaultKey, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
}

fn open_with<C: Aead + KeyInit>(key: &VaultKey, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| Error::AuthFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;
    use proptest::prelude::*;

    const ALL: [CipherAlgorithm; 3] = [
        CipherAlgorithm::XChaCha20Poly1305,
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
    ];

    fn key(byte: u8) -> VaultKey {
        VaultKey::from_bytes([byte; KEY_LENGTH])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for alg in ALL {
            let nonce = vec![7u8; alg.nonce_len()];
            let sealed = seal(alg, &key(42), &nonce, b"ad", b"Hello, World!").unwrap();
            assert_eq!(sealed.len(), 13 + TAG_SIZE);

            let opened = open(alg, &key(42), &nonce, b"ad", &sealed).unwrap();
            assert_eq!(opened, b"Hello, World!");
        }
    }

    #[test]
    fn test_empty_plaintext() {
        for alg in ALL {
            let nonce = vec![0u8; alg.nonce_len()];
            let sealed = seal(alg, &key(1), &nonce, b"", b"").unwrap();
            assert_eq!(sealed.len(), TAG_SIZE);
            assert!(open(alg, &key(1), &nonce, b"", &sealed).unwrap().is_empty());
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        for alg in ALL {
            let nonce = vec![0u8; alg.nonce_len()];
            let sealed = seal(alg, &key(1), &nonce, b"", b"Secret data").unwrap();
            assert!(matches!(
                open(alg, &key(2), &nonce, b"", &sealed),
                Err(Error::AuthFailure)
            ));
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        for alg in ALL {
            let nonce = vec![0u8; alg.nonce_len()];
            let sealed = seal(alg, &key(1), &nonce, b"chunk-0", b"data").unwrap();
            assert!(matches!(
                open(alg, &key(1), &nonce, b"chunk-1", &sealed),
                Err(Error::AuthFailure)
            ));
        }
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let err = seal(CipherAlgorithm::Aes256Gcm, &key(1), &[0u8; 24], b"", b"x");
        assert!(matches!(err, Err(Error::InvalidParameter(_))));

        let err = open(CipherAlgorithm::XChaCha20Poly1305, &key(1), &[0u8; 12], b"", &[0u8; 32]);
        assert!(matches!(err, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_too_short_is_auth_failure() {
        let nonce = [0u8; 24];
        assert!(matches!(
            open(CipherAlgorithm::XChaCha20Poly1305, &key(1), &nonce, b"", &[0u8; 15]),
            Err(Error::AuthFailure)
        ));
    }

    #[test]
    fn test_every_bit_flip_detected() {
        for alg in ALL {
            let nonce = vec![3u8; alg.nonce_len()];
            let sealed = seal(alg, &key(9), &nonce, b"aad", b"integrity matters").unwrap();

            for byte in 0..sealed.len() {
                for bit in 0..8 {
                    let mut tampered = sealed.clone();
                    tampered[byte] ^= 1 << bit;
                    assert!(
                        matches!(open(alg, &key(9), &nonce, b"aad", &tampered), Err(Error::AuthFailure)),
                        "{:?}: flip at byte {} bit {} went undetected",
                        alg,
                        byte,
                        bit
                    );
                }
            }
        }
    }

    #[test]
    fn test_header_ids_roundtrip() {
        for alg in ALL {
            assert_eq!(CipherAlgorithm::from_id(alg.id()), Some(alg));
            assert_eq!(alg.base_nonce_len() + alg.counter_len(), alg.nonce_len());
        }
        assert_eq!(CipherAlgorithm::from_id(0), None);
    }

    proptest! {
        #[test]
        fn seal_open_any_input(
            plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
            aad in proptest::collection::vec(any::<u8>(), 0..64),
            alg_index in 0usize..3,
        ) {
            let alg = ALL[alg_index];
            let nonce = vec![5u8; alg.nonce_len()];
            let sealed = seal(alg, &key(11), &nonce, &aad, &plaintext).unwrap();
            prop_assert_eq!(open(alg, &key(11), &nonce, &aad, &sealed).unwrap(), plaintext);
        }
    }
}
