//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use blake2::digest::consts::U32;
use blake2::digest::{KeyInit, Mac};
use blake2::Blake2bMac;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use myvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of per-vault salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Length of verification tags in bytes.
pub const TAG_LENGTH: usize = 32;

const VERIFICATION_DOMAIN: &[u8] = b"myvault/key-verification/v1";

/// Vault key derived from the user password.
///
/// There is exactly one owner per derivation; the type is deliberately not
/// `Clone` so that wiping the owner wipes the only copy.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    key: [u8; KEY_LENGTH],
}

impl VaultKey {
    /// Create a vault key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Copy a key out of a slice without an intermediate stack buffer.
    ///
    /// # Errors
    /// - `InvalidParameter` if `bytes` is not `KEY_LENGTH` long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = Self {
            key: [0u8; KEY_LENGTH],
        };
        key.key.copy_from_slice(bytes);
        Ok(key)
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Compute the verification tag for this key.
    ///
    /// The tag is a keyed BLAKE2b MAC over a fixed domain constant, the vault
    /// id and the salt. Neither the key nor the password can be recovered
    /// from it.
    pub fn verification_tag(&self, vault_id: &str, salt: &Salt) -> Result<VerificationTag> {
        let mut mac = <Blake2bMac<U32> as KeyInit>::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("Invalid MAC key: {}", e)))?;
        Mac::update(&mut mac, VERIFICATION_DOMAIN);
        Mac::update(&mut mac, &(vault_id.len() as u32).to_be_bytes());
        Mac::update(&mut mac, vault_id.as_bytes());
        Mac::update(&mut mac, salt.as_bytes());

        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&Mac::finalize(mac).into_bytes());
        Ok(VerificationTag(tag))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

/// Shared, wipeable home for a resident vault key.
///
/// Readers borrow the key for the duration of a closure. `wipe` takes the
/// write lock, so it returns only once no reader is using the key and the
/// bytes have been zeroized.
pub struct KeySlot {
    key: RwLock<Option<VaultKey>>,
}

impl KeySlot {
    /// Place a key in a new slot.
    pub fn new(key: VaultKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Run `f` with the resident key.
    ///
    /// # Errors
    /// - `NotPermitted` if the key has been wiped
    /// - Any error returned by `f`
    pub fn with_key<T>(&self, f: impl FnOnce(&VaultKey) -> Result<T>) -> Result<T> {
        let guard = self.key.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(key) => f(key),
            None => Err(Error::NotPermitted("Vault key has been wiped".to_string())),
        }
    }

    /// Zeroize and drop the key. Idempotent.
    pub fn wipe(&self) {
        let mut guard = self.key.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut key) = guard.take() {
            key.zeroize();
        }
    }

    /// Whether the key is still resident.
    pub fn is_resident(&self) -> bool {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySlot(resident: {})", self.is_resident())
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

/// One-way password verification tag stored in the manifest.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationTag([u8; TAG_LENGTH]);

impl VerificationTag {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; TAG_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the tag bytes.
    pub fn as_bytes(&self) -> &[u8; TAG_LENGTH] {
        &self.0
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &VerificationTag) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for VerificationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationTag({})", STANDARD.encode(self.0))
    }
}

fn decode_fixed<'de, D, const N: usize>(deserializer: D) -> std::result::Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    let bytes = STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| de::Error::invalid_length(b.len(), &"a fixed-length byte string"))
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        decode_fixed(deserializer).map(Self)
    }
}

impl Serialize for VerificationTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for VerificationTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        decode_fixed(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_slice() {
        let key = VaultKey::from_slice(&[9u8; KEY_LENGTH]).unwrap();
        assert_eq!(key.as_bytes(), &[9u8; KEY_LENGTH]);
        assert!(matches!(
            VaultKey::from_slice(&[9u8; KEY_LENGTH - 1]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_verification_tag_depends_on_key() {
        let salt = Salt::from_bytes([7u8; SALT_LENGTH]);
        let a = VaultKey::from_bytes([1u8; KEY_LENGTH]);
        let b = VaultKey::from_bytes([2u8; KEY_LENGTH]);

        let tag_a = a.verification_tag("vault", &salt).unwrap();
        assert!(tag_a.matches(&a.verification_tag("vault", &salt).unwrap()));
        assert!(!tag_a.matches(&b.verification_tag("vault", &salt).unwrap()));
    }

    #[test]
    fn test_verification_tag_bound_to_vault() {
        let salt = Salt::from_bytes([7u8; SALT_LENGTH]);
        let key = VaultKey::from_bytes([1u8; KEY_LENGTH]);

        let one = key.verification_tag("vault-one", &salt).unwrap();
        let two = key.verification_tag("vault-two", &salt).unwrap();
        assert!(!one.matches(&two));
    }

    #[test]
    fn test_verification_tag_is_not_the_key() {
        let salt = Salt::generate();
        let key = VaultKey::from_bytes([9u8; KEY_LENGTH]);
        let tag = key.verification_tag("vault", &salt).unwrap();
        assert_ne!(tag.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_key_slot_wipe() {
        let slot = KeySlot::new(VaultKey::from_bytes([3u8; KEY_LENGTH]));
        assert!(slot.is_resident());
        assert_eq!(slot.with_key(|k| Ok(k.as_bytes()[0])).unwrap(), 3);

        slot.wipe();
        assert!(!slot.is_resident());
        assert!(matches!(
            slot.with_key(|_| Ok(())),
            Err(Error::NotPermitted(_))
        ));

        // Idempotent
        slot.wipe();
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_salt_serde_base64() {
        let salt = Salt::from_bytes([0xAB; SALT_LENGTH]);
        let json = serde_json::to_string(&salt).unwrap();
        assert!(json.starts_with('"'));

        let restored: Salt = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, salt);

        assert!(serde_json::from_str::<Salt>("\"AAAA\"").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = VaultKey::from_bytes([5u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "VaultKey([REDACTED])");
    }
}
