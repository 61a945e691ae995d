//! Vault engine for MyVault.
//!
//! This module provides:
//! - Vault manifests: the persisted, key-free description of a vault
//! - The file codec: chunked authenticated encryption with atomic writes
//! - Sessions: the state machine that holds a derived key while unlocked
//! - Metadata stores and the manager that ties them together
//!
//! # Architecture
//! The vault module sits between the hosting application and the crypto
//! crate. The application owns a [`ManifestStore`] handle and a
//! [`VaultManager`]; every file access goes through a [`VaultSession`].

pub mod codec;
pub mod manager;
pub mod manifest;
pub mod session;
pub mod store;

pub use codec::{CodecOptions, FileCodec, FileRecord};
pub use manager::VaultManager;
pub use manifest::{FormatVersion, NewVault, VaultManifest};
pub use session::{Authorization, DeviceAuthorizer, SessionOptions, SessionState, VaultSession};
pub use store::{ManifestStore, MemoryStore, SqliteStore};
