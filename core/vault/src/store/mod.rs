//! Metadata stores for vault manifests.
//!
//! A store persists manifests only. It never sees passwords, keys or file
//! contents.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::manifest::VaultManifest;
use myvault_common::{Result, VaultId};

/// Persistence for vault manifests.
///
/// Names are unique across a store. Callers must not rely on the order
/// returned by [`list`](ManifestStore::list).
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Persist a new manifest.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id or the name is taken
    async fn create(&self, manifest: &VaultManifest) -> Result<()>;

    /// Fetch a manifest by id.
    ///
    /// # Errors
    /// - `NotFound` if no such vault exists
    async fn get(&self, id: &VaultId) -> Result<VaultManifest>;

    /// Replace a stored manifest.
    ///
    /// Only the display name, description and biometric flag may differ from
    /// the stored version.
    ///
    /// # Errors
    /// - `NotFound` if no such vault exists
    /// - `AlreadyExists` if the new name is taken
    /// - `NotPermitted` if an immutable field changed
    async fn update(&self, manifest: &VaultManifest) -> Result<()>;

    /// Remove a manifest.
    ///
    /// # Errors
    /// - `NotFound` if no such vault exists
    async fn delete(&self, id: &VaultId) -> Result<()>;

    /// All stored manifests.
    async fn list(&self) -> Result<Vec<VaultManifest>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store must share.

    use super::*;
    use crate::manifest::NewVault;
    use myvault_common::Error;
    use myvault_crypto::{KdfLimits, KdfParams};

    pub fn manifest(name: &str) -> VaultManifest {
        let request = NewVault::new(name, "/tmp/vault").with_kdf(KdfParams::scrypt(10, 1));
        VaultManifest::create(request, b"pw", &KdfLimits::default())
            .unwrap()
            .0
    }

    pub async fn crud(store: &dyn ManifestStore) {
        let a = manifest("Alpha");
        store.create(&a).await.unwrap();
        assert_eq!(store.get(a.id()).await.unwrap(), a);

        let mut renamed = a.clone();
        renamed.set_name("Alpha 2").unwrap();
        renamed.set_description("renamed");
        store.update(&renamed).await.unwrap();
        assert_eq!(store.get(a.id()).await.unwrap().name(), "Alpha 2");

        store.delete(a.id()).await.unwrap();
        assert!(matches!(store.get(a.id()).await, Err(Error::NotFound(_))));
        assert!(matches!(store.delete(a.id()).await, Err(Error::NotFound(_))));
        assert!(matches!(store.update(&renamed).await, Err(Error::NotFound(_))));
    }

    pub async fn unique_names(store: &dyn ManifestStore) {
        let a = manifest("Shared");
        let b = manifest("Shared");
        store.create(&a).await.unwrap();
        assert!(matches!(store.create(&b).await, Err(Error::AlreadyExists(_))));
        assert!(matches!(store.create(&a).await, Err(Error::AlreadyExists(_))));

        let c = manifest("Other");
        store.create(&c).await.unwrap();
        let mut clash = c.clone();
        clash.set_name("Shared").unwrap();
        assert!(matches!(store.update(&clash).await, Err(Error::AlreadyExists(_))));

        let mut names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Other", "Shared"]);
    }

    pub async fn immutable_fields(store: &dyn ManifestStore) {
        let a = manifest("Fixed");
        store.create(&a).await.unwrap();

        // Same id, different salt
        let original_salt = serde_json::to_string(a.salt()).unwrap();
        let other_salt = serde_json::to_string(manifest("x").salt()).unwrap();
        let json = a.to_json().unwrap().replace(&original_salt, &other_salt);
        let forged = VaultManifest::from_json(&json).unwrap();
        assert!(matches!(store.update(&forged).await, Err(Error::NotPermitted(_))));
        assert_eq!(store.get(a.id()).await.unwrap(), a);
    }
}
