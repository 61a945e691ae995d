//! Common utilities and types shared across the MyVault crates.
//!
//! This module provides the error taxonomy and the identifier and path
//! types used by the crypto and vault layers.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{SensitiveBytes, VaultId, VaultPath};
