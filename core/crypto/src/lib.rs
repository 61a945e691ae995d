//! Cryptographic primitives for MyVault.
//!
//! This module provides:
//! - Memory-hard key derivation (scrypt or Argon2id) with bounded cost
//! - Authenticated encryption with caller-supplied nonces
//! - Key types with automatic zeroization and one-way verification tags
//! - The chunked stream format used for encrypted vault files
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No password, plaintext or key material is ever logged
//! - Verification tags are compared in constant time

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use aead::{open, seal, CipherAlgorithm, TAG_SIZE};
pub use kdf::{
    derive, derive_key, derive_key_with_limits, derive_with_limits, KdfAlgorithm, KdfLimits,
    KdfParams,
};
pub use keys::{KeySlot, Salt, VaultKey, VerificationTag, KEY_LENGTH};
pub use stream::{decrypt_stream, encrypt_stream, FileHeader, StreamSummary, DEFAULT_CHUNK_SIZE};
