//! Vault manager for creating and managing vaults.

use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use crate::manifest::{NewVault, VaultManifest};
use crate::session::{SessionOptions, VaultSession};
use crate::store::ManifestStore;
use myvault_common::{Error, Result, VaultId};

/// Vault manager for creating and opening vaults.
///
/// Owns a handle to the manifest store; several managers may share one
/// store.
#[derive(Clone)]
pub struct VaultManager {
    store: Arc<dyn ManifestStore>,
    options: SessionOptions,
}

impl VaultManager {
    /// Create a manager over `store` with default session options.
    pub fn new(store: Arc<dyn ManifestStore>) -> Self {
        Self::with_options(store, SessionOptions::default())
    }

    pub fn with_options(store: Arc<dyn ManifestStore>, options: SessionOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<dyn ManifestStore> {
        &self.store
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Create a new vault.
    ///
    /// # Preconditions
    /// - The storage directory exists
    /// - No vault with the same name exists
    ///
    /// # Postconditions
    /// - The manifest is persisted
    /// - Returns an unlocked session
    ///
    /// # Errors
    /// - `NotFound` if the storage directory is missing
    /// - `AlreadyExists` if the name is taken
    /// - `InvalidInput` for an empty name or password
    /// - `InvalidParameter` for KDF parameters outside the limits
    pub async fn create_vault(&self, request: NewVault, password: &[u8]) -> Result<VaultSession> {
        if !request.storage_path.is_dir() {
            return Err(Error::NotFound(format!(
                "Storage directory: {}",
                request.storage_path.display()
            )));
        }
        if self.find_by_name(&request.name).await?.is_some() {
            return Err(Error::AlreadyExists(format!("Vault name '{}'", request.name)));
        }

        let password = Zeroizing::new(password.to_vec());
        let limits = self.options.kdf_limits.clone();
        let (manifest, key) =
            tokio::task::spawn_blocking(move || VaultManifest::create(request, &password, &limits))
                .await
                .map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))??;

        self.store.create(&manifest).await?;
        info!(vault = %manifest.id(), name = manifest.name(), "Vault created");

        VaultSession::from_verified_key(manifest, key, self.options.clone())
    }

    /// Open a locked session for an existing vault.
    ///
    /// # Errors
    /// - `NotFound` if no such vault exists
    pub async fn open_vault(&self, id: &VaultId) -> Result<VaultSession> {
        let manifest = self.store.get(id).await?;
        VaultSession::new(manifest, self.options.clone())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<VaultManifest>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|m| m.name() == name))
    }

    /// Like [`find_by_name`](Self::find_by_name) but fails with `NotFound`.
    pub async fn get_by_name(&self, name: &str) -> Result<VaultManifest> {
        self.find_by_name(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Vault '{}'", name)))
    }

    pub async fn list_vaults(&self) -> Result<Vec<VaultManifest>> {
        self.store.list().await
    }

    /// Remove a vault's manifest.
    ///
    /// Encrypted files under the storage directory are left in place.
    pub async fn delete_vault(&self, id: &VaultId) -> Result<()> {
        self.store.delete(id).await?;
        info!(vault = %id, "Vault deleted");
        Ok(())
    }

    pub async fn rename_vault(&self, id: &VaultId, name: &str) -> Result<VaultManifest> {
        self.modify(id, |m| m.set_name(name)).await
    }

    pub async fn set_description(&self, id: &VaultId, description: &str) -> Result<VaultManifest> {
        self.modify(id, |m| {
            m.set_description(description);
            Ok(())
        })
        .await
    }

    /// Toggle biometric re-authorization. Sessions opened earlier keep the
    /// setting they started with.
    pub async fn set_biometric_unlock(&self, id: &VaultId, enabled: bool) -> Result<VaultManifest> {
        self.modify(id, |m| {
            m.set_biometric_unlock(enabled);
            Ok(())
        })
        .await
    }

    async fn modify<F>(&self, id: &VaultId, change: F) -> Result<VaultManifest>
    where
        F: FnOnce(&mut VaultManifest) -> Result<()>,
    {
        let mut manifest = self.store.get(id).await?;
        change(&mut manifest)?;
        self.store.update(&manifest).await?;
        info!(vault = %id, "Vault manifest updated");
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::store::{MemoryStore, SqliteStore};
    use myvault_common::VaultPath;
    use myvault_crypto::KdfParams;
    use tempfile::TempDir;

    fn request(name: &str, dir: &TempDir) -> NewVault {
        NewVault::new(name, dir.path()).with_kdf(KdfParams::scrypt(10, 1))
    }

    #[tokio::test]
    async fn test_create_vault() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(MemoryStore::new()));

        let session = manager
            .create_vault(request("Personal", &dir), b"secure-password")
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Unlocked);
        let stored = manager.get_by_name("Personal").await.unwrap();
        assert_eq!(&stored, session.manifest());
    }

    #[tokio::test]
    async fn test_open_vault() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let path = VaultPath::parse("/secret.txt").unwrap();

        let session = manager
            .create_vault(request("Work", &dir), b"secure-password")
            .await
            .unwrap();
        let id = session.vault_id().clone();
        session.write_file(&path, b"classified".to_vec()).await.unwrap();
        drop(session);

        let reopened = manager.open_vault(&id).await.unwrap();
        assert_eq!(reopened.state(), SessionState::Locked);
        assert!(matches!(
            reopened.unlock(b"guess").await,
            Err(Error::AuthenticationFailed)
        ));
        reopened.unlock(b"secure-password").await.unwrap();
        assert_eq!(reopened.read_file(&path).await.unwrap(), b"classified");
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(MemoryStore::new()));
        manager.create_vault(request("Same", &dir), b"pw").await.unwrap();

        assert!(matches!(
            manager.create_vault(request("Same", &dir), b"pw").await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(manager.list_vaults().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_storage_directory() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(MemoryStore::new()));
        let missing = NewVault::new("Gone", dir.path().join("missing"));

        assert!(matches!(
            manager.create_vault(missing, b"pw").await,
            Err(Error::NotFound(_))
        ));
        assert!(manager.list_vaults().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_describe_and_delete() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(MemoryStore::new()));
        let session = manager.create_vault(request("Old", &dir), b"pw").await.unwrap();
        let id = session.vault_id().clone();

        let renamed = manager.rename_vault(&id, "New").await.unwrap();
        assert_eq!(renamed.name(), "New");
        manager.set_description(&id, "Receipts").await.unwrap();
        let updated = manager.set_biometric_unlock(&id, true).await.unwrap();
        assert_eq!(updated.description(), "Receipts");
        assert!(updated.biometric_unlock_enabled());
        assert_eq!(updated.salt(), session.manifest().salt());

        assert!(manager.find_by_name("Old").await.unwrap().is_none());
        manager.delete_vault(&id).await.unwrap();
        assert!(matches!(manager.open_vault(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_kdf_limits_enforced() {
        let dir = TempDir::new().unwrap();
        let manager = VaultManager::new(Arc::new(MemoryStore::new()));
        let request = NewVault::new("Heavy", dir.path()).with_kdf(KdfParams::scrypt(24, 1));

        assert!(matches!(
            manager.create_vault(request, b"pw").await,
            Err(Error::InvalidParameter(_))
        ));
    }
}
