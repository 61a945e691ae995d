//! Memory-hard key derivation.
//!
//! Two algorithms are supported, both parameterized by a single cost exponent
//! and a lane count:
//! - scrypt with `N = 2^cost_factor`, `r = 8`, `p = parallelism`
//! - Argon2id with `2^cost_factor` KiB of memory, 3 passes and
//!   `parallelism` lanes
//!
//! Derivation is intentionally slow. Parameters are validated against
//! [`KdfLimits`] before any work is done so that a hostile manifest can't
//! make the engine allocate unbounded memory.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::debug;

use crate::keys::{Salt, VaultKey, KEY_LENGTH};
use myvault_common::{Error, Result, SensitiveBytes};

/// Minimum accepted salt length in bytes.
pub const MIN_SALT_LENGTH: usize = 16;

/// Minimum accepted output length in bytes.
pub const MIN_OUTPUT_LENGTH: usize = 16;

/// scrypt block size, fixed for every vault.
pub const SCRYPT_BLOCK_SIZE: u32 = 8;

/// Length handed to `scrypt::Params`. It only sizes PHC hash strings; the
/// raw output length is taken from the output buffer.
const SCRYPT_PARAMS_LEN: usize = 32;

/// Argon2id pass count, fixed for every vault.
pub const ARGON2_PASSES: u32 = 3;

/// Key derivation algorithm recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Scrypt,
    Argon2id,
}

impl Default for KdfAlgorithm {
    fn default() -> Self {
        Self::Scrypt
    }
}

/// Parameters for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Derivation algorithm.
    pub algorithm: KdfAlgorithm,
    /// CPU/memory cost exponent.
    pub cost_factor: u8,
    /// Number of independent lanes.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create scrypt parameters.
    pub fn scrypt(cost_factor: u8, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Scrypt,
            cost_factor,
            parallelism,
        }
    }

    /// Create Argon2id parameters.
    pub fn argon2id(cost_factor: u8, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            cost_factor,
            parallelism,
        }
    }

    /// Parameters suitable for interactive use on desktop hardware.
    pub fn interactive() -> Self {
        Self::scrypt(14, 1)
    }

    /// Moderate parameters for mobile devices.
    pub fn moderate() -> Self {
        Self::scrypt(12, 1)
    }

    /// Higher parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self::scrypt(16, 2)
    }

    /// Check these parameters against `limits`.
    ///
    /// # Errors
    /// - `InvalidParameter` if cost factor or parallelism is out of range
    pub fn validate(&self, limits: &KdfLimits) -> Result<()> {
        if !limits.cost_factor.contains(&self.cost_factor) {
            return Err(Error::InvalidParameter(format!(
                "cost factor {} outside {}..={}",
                self.cost_factor,
                limits.cost_factor.start(),
                limits.cost_factor.end()
            )));
        }
        if !limits.parallelism.contains(&self.parallelism) {
            return Err(Error::InvalidParameter(format!(
                "parallelism {} outside {}..={}",
                self.parallelism,
                limits.parallelism.start(),
                limits.parallelism.end()
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::moderate()
    }
}

/// Accepted ranges for KDF parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfLimits {
    pub cost_factor: RangeInclusive<u8>,
    pub parallelism: RangeInclusive<u32>,
}

impl Default for KdfLimits {
    fn default() -> Self {
        Self {
            cost_factor: 10..=16,
            parallelism: 1..=16,
        }
    }
}

/// Derive `output_len` bytes from a password and salt.
///
/// Uses the default [`KdfLimits`].
///
/// # Errors
/// - `InvalidInput` if the password is empty
/// - `InvalidParameter` for out-of-range parameters, a salt shorter than
///   16 bytes, or `output_len < 16`
pub fn derive(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
    output_len: usize,
) -> Result<SensitiveBytes> {
    derive_with_limits(password, salt, params, output_len, &KdfLimits::default())
}

/// Derive `output_len` bytes, validating against explicit limits.
pub fn derive_with_limits(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
    output_len: usize,
    limits: &KdfLimits,
) -> Result<SensitiveBytes> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    if salt.len() < MIN_SALT_LENGTH {
        return Err(Error::InvalidParameter(format!(
            "salt must be at least {} bytes, got {}",
            MIN_SALT_LENGTH,
            salt.len()
        )));
    }
    if output_len < MIN_OUTPUT_LENGTH {
        return Err(Error::InvalidParameter(format!(
            "output length must be at least {} bytes, got {}",
            MIN_OUTPUT_LENGTH, output_len
        )));
    }
    params.validate(limits)?;

    debug!(
        algorithm = ?params.algorithm,
        cost_factor = params.cost_factor,
        parallelism = params.parallelism,
        "Deriving key"
    );

    let mut output = SensitiveBytes::new(vec![0u8; output_len]);
    match params.algorithm {
        KdfAlgorithm::Scrypt => {
            let scrypt_params = scrypt::Params::new(
                params.cost_factor,
                SCRYPT_BLOCK_SIZE,
                params.parallelism,
                SCRYPT_PARAMS_LEN,
            )
            .map_err(|e| Error::InvalidParameter(format!("Invalid scrypt parameters: {}", e)))?;

            scrypt::scrypt(password, salt, &scrypt_params, output.as_mut_bytes())
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
        KdfAlgorithm::Argon2id => {
            let memory_kib = 1u32.checked_shl(u32::from(params.cost_factor)).ok_or_else(|| {
                Error::InvalidParameter(format!("cost factor {} too large", params.cost_factor))
            })?;
            let argon2_params = Params::new(
                memory_kib,
                ARGON2_PASSES,
                params.parallelism,
                Some(output_len),
            )
            .map_err(|e| Error::InvalidParameter(format!("Invalid Argon2 parameters: {}", e)))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(password, salt, output.as_mut_bytes())
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
    }

    Ok(output)
}

/// Derive a vault key from a password and salt.
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Security
/// - Password is not stored or logged
/// - Intermediate output is zeroized after copying into the key
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<VaultKey> {
    derive_key_with_limits(password, salt, params, &KdfLimits::default())
}

/// Derive a vault key, validating against explicit limits.
pub fn derive_key_with_limits(
    password: &[u8],
    salt: &Salt,
    params: &KdfParams,
    limits: &KdfLimits,
) -> Result<VaultKey> {
    let output = derive_with_limits(password, salt.as_bytes(), params, KEY_LENGTH, limits)?;
    VaultKey::from_slice(output.as_bytes())
}
