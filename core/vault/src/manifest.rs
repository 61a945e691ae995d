//! Vault manifest: persisted metadata that never contains the key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use myvault_common::{Error, Result, VaultId};
use myvault_crypto::{
    derive_key_with_limits, CipherAlgorithm, KdfLimits, KdfParams, Salt, VaultKey,
    VerificationTag,
};

/// Manifest format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    /// Current manifest format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Request to create a vault.
#[derive(Debug, Clone)]
pub struct NewVault {
    pub name: String,
    pub description: String,
    pub storage_path: PathBuf,
    pub kdf: KdfParams,
    pub cipher: CipherAlgorithm,
    pub biometric_unlock_enabled: bool,
}

impl NewVault {
    /// Request with default KDF and cipher settings.
    pub fn new(name: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            storage_path: storage_path.into(),
            kdf: KdfParams::default(),
            cipher: CipherAlgorithm::default(),
            biometric_unlock_enabled: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_cipher(mut self, cipher: CipherAlgorithm) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_biometric_unlock(mut self, enabled: bool) -> Self {
        self.biometric_unlock_enabled = enabled;
        self
    }
}

/// Persisted per-vault metadata.
///
/// Only the display name, the description and the biometric flag can change
/// after creation; everything needed to rebuild the key is fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultManifest {
    id: VaultId,
    version: FormatVersion,
    name: String,
    description: String,
    kdf: KdfParams,
    salt: Salt,
    verification_tag: VerificationTag,
    cipher: CipherAlgorithm,
    biometric_unlock_enabled: bool,
    storage_path: PathBuf,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl VaultManifest {
    /// Create a manifest and the key it describes.
    ///
    /// Runs the KDF once; callers on an async runtime should do this on a
    /// blocking thread.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty name or password
    /// - `InvalidParameter` for KDF parameters outside `limits`
    pub fn create(request: NewVault, password: &[u8], limits: &KdfLimits) -> Result<(Self, VaultKey)> {
        validate_name(&request.name)?;

        let id = VaultId::generate();
        let salt = Salt::generate();
        let key = derive_key_with_limits(password, &salt, &request.kdf, limits)?;
        let verification_tag = key.verification_tag(id.as_str(), &salt)?;
        let now = Utc::now();

        let manifest = Self {
            id,
            version: FormatVersion::CURRENT,
            name: request.name,
            description: request.description,
            kdf: request.kdf,
            salt,
            verification_tag,
            cipher: request.cipher,
            biometric_unlock_enabled: request.biometric_unlock_enabled,
            storage_path: request.storage_path,
            created_at: now,
            modified_at: now,
        };
        Ok((manifest, key))
    }

    /// Re-derive the key for a candidate password.
    ///
    /// The result still has to be checked with [`verify_key`](Self::verify_key).
    pub fn derive_key(&self, password: &[u8], limits: &KdfLimits) -> Result<VaultKey> {
        if !self.version.is_compatible() {
            return Err(Error::Corrupted(format!(
                "Incompatible manifest version: {}.{}",
                self.version.major, self.version.minor
            )));
        }
        derive_key_with_limits(password, &self.salt, &self.kdf, limits)
    }

    /// Check a derived key against the verification tag in constant time.
    pub fn verify_key(&self, key: &VaultKey) -> Result<bool> {
        let candidate = key.verification_tag(self.id.as_str(), &self.salt)?;
        Ok(self.verification_tag.matches(&candidate))
    }

    /// Derive and verify in one step.
    ///
    /// # Returns
    /// - `Ok(true)` if password is correct
    /// - `Ok(false)` if password is incorrect
    pub fn verify_password(&self, password: &[u8], limits: &KdfLimits) -> Result<bool> {
        let key = self.derive_key(password, limits)?;
        self.verify_key(&key)
    }

    pub fn id(&self) -> &VaultId {
        &self.id
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub fn verification_tag(&self) -> &VerificationTag {
        &self.verification_tag
    }

    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    pub fn biometric_unlock_enabled(&self) -> bool {
        self.biometric_unlock_enabled
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Rename the vault.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        self.modified_at = Utc::now();
        Ok(())
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.modified_at = Utc::now();
    }

    pub fn set_biometric_unlock(&mut self, enabled: bool) {
        self.biometric_unlock_enabled = enabled;
        self.modified_at = Utc::now();
    }

    /// Reject an update that touches anything but the mutable display fields.
    pub fn ensure_same_identity(&self, updated: &VaultManifest) -> Result<()> {
        let same = self.id == updated.id
            && self.version == updated.version
            && self.kdf == updated.kdf
            && self.salt == updated.salt
            && self.verification_tag == updated.verification_tag
            && self.cipher == updated.cipher
            && self.storage_path == updated.storage_path
            && self.created_at == updated.created_at;
        if !same {
            return Err(Error::NotPermitted(format!(
                "Only name, description and biometric unlock of vault {} may change",
                self.id
            )));
        }
        Ok(())
    }

    /// Serialize manifest to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("Vault name cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NewVault {
        NewVault::new("Personal", "/tmp/personal").with_kdf(KdfParams::scrypt(10, 1))
    }

    #[test]
    fn test_version_compatibility() {
        assert!(FormatVersion::CURRENT.is_compatible());
        assert!(!FormatVersion { major: 2, minor: 0 }.is_compatible());
    }

    #[test]
    fn test_create_and_verify() {
        let limits = KdfLimits::default();
        let (manifest, key) = VaultManifest::create(request(), b"secure-password", &limits).unwrap();

        assert!(manifest.verify_key(&key).unwrap());
        assert!(manifest.verify_password(b"secure-password", &limits).unwrap());
        assert!(!manifest.verify_password(b"wrong-password", &limits).unwrap());
    }

    #[test]
    fn test_salt_unique_per_vault() {
        let limits = KdfLimits::default();
        let (a, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();
        let (b, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();

        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.verification_tag(), b.verification_tag());
    }

    #[test]
    fn test_empty_name_rejected() {
        let limits = KdfLimits::default();
        let result = VaultManifest::create(NewVault::new("  ", "/tmp/x"), b"pw", &limits);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_bad_kdf_rejected_before_work() {
        let limits = KdfLimits::default();
        let result = VaultManifest::create(request().with_kdf(KdfParams::scrypt(20, 1)), b"pw", &limits);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_mutable_fields() {
        let limits = KdfLimits::default();
        let (mut manifest, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();
        let original = manifest.clone();

        manifest.set_name("Renamed").unwrap();
        manifest.set_description("Tax documents");
        manifest.set_biometric_unlock(true);
        assert!(manifest.set_name("").is_err());

        assert_eq!(manifest.name(), "Renamed");
        assert!(manifest.biometric_unlock_enabled());
        assert!(original.ensure_same_identity(&manifest).is_ok());
    }

    #[test]
    fn test_identity_change_rejected() {
        let limits = KdfLimits::default();
        let (a, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();
        let (b, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();

        assert!(matches!(a.ensure_same_identity(&b), Err(Error::NotPermitted(_))));
    }

    #[test]
    fn test_json_roundtrip_keeps_verification() {
        let limits = KdfLimits::default();
        let (manifest, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();

        let json = manifest.to_json().unwrap();
        assert!(!json.contains("\"pw\""));
        let restored = VaultManifest::from_json(&json).unwrap();

        assert_eq!(restored, manifest);
        assert!(restored.verify_password(b"pw", &limits).unwrap());
    }

    #[test]
    fn test_incompatible_version_refused() {
        let limits = KdfLimits::default();
        let (manifest, _) = VaultManifest::create(request(), b"pw", &limits).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        value["version"]["major"] = serde_json::json!(9);
        let future = VaultManifest::from_json(&value.to_string()).unwrap();

        assert!(matches!(future.derive_key(b"pw", &limits), Err(Error::Corrupted(_))));
    }
}
