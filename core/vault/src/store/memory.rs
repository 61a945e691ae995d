//! In-memory manifest store for testing and embedding.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ManifestStore;
use crate::manifest::VaultManifest;
use myvault_common::{Error, Result, VaultId};

/// In-memory manifest store.
///
/// All data is lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    manifests: RwLock<HashMap<VaultId, VaultManifest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<VaultId, VaultManifest>> {
        self.manifests.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<VaultId, VaultManifest>> {
        self.manifests.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn name_taken(manifests: &HashMap<VaultId, VaultManifest>, name: &str, except: &VaultId) -> bool {
    manifests
        .values()
        .any(|m| m.name() == name && m.id() != except)
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn create(&self, manifest: &VaultManifest) -> Result<()> {
        let mut manifests = self.write();
        if manifests.contains_key(manifest.id()) {
            return Err(Error::AlreadyExists(format!("Vault {}", manifest.id())));
        }
        if name_taken(&manifests, manifest.name(), manifest.id()) {
            return Err(Error::AlreadyExists(format!("Vault name '{}'", manifest.name())));
        }
        manifests.insert(manifest.id().clone(), manifest.clone());
        Ok(())
    }

    async fn get(&self, id: &VaultId) -> Result<VaultManifest> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Vault {}", id)))
    }

    async fn update(&self, manifest: &VaultManifest) -> Result<()> {
        let mut manifests = self.write();
        let stored = manifests
            .get(manifest.id())
            .ok_or_else(|| Error::NotFound(format!("Vault {}", manifest.id())))?;
        stored.ensure_same_identity(manifest)?;
        if name_taken(&manifests, manifest.name(), manifest.id()) {
            return Err(Error::AlreadyExists(format!("Vault name '{}'", manifest.name())));
        }
        manifests.insert(manifest.id().clone(), manifest.clone());
        Ok(())
    }

    async fn delete(&self, id: &VaultId) -> Result<()> {
        self.write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Vault {}", id)))
    }

    async fn list(&self) -> Result<Vec<VaultManifest>> {
        Ok(self.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn test_crud() {
        contract::crud(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_unique_names() {
        contract::unique_names(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_immutable_fields() {
        contract::immutable_fields(&MemoryStore::new()).await;
    }
}
