//! SQLite-backed manifest store.
//!
//! One row per vault; the manifest itself is stored as JSON next to an
//! indexed, unique name column.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::ManifestStore;
use crate::manifest::VaultManifest;
use myvault_common::{Error, Result, VaultId};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS vaults (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        manifest TEXT NOT NULL
    );
"#;

/// Manifest store backed by a SQLite database file.
///
/// Queries run on the blocking pool; the connection is shared behind a
/// mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a database.
    ///
    /// # Errors
    /// - `Storage` if the database cannot be opened or migrated
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        info!(path = %db_path.as_ref().display(), "Manifest store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("Store task failed: {}", e)))?
    }
}

fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Map a uniqueness violation to `AlreadyExists`.
fn conflict(e: rusqlite::Error, what: String) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::AlreadyExists(what)
        }
        _ => storage(e),
    }
}

fn load(conn: &Connection, id: &VaultId) -> Result<VaultManifest> {
    let json: Option<String> = conn
        .query_row(
            "SELECT manifest FROM vaults WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage)?;
    match json {
        Some(json) => VaultManifest::from_json(&json),
        None => Err(Error::NotFound(format!("Vault {}", id))),
    }
}

#[async_trait]
impl ManifestStore for SqliteStore {
    async fn create(&self, manifest: &VaultManifest) -> Result<()> {
        let manifest = manifest.clone();
        self.run(move |conn| {
            let json = manifest.to_json()?;
            conn.execute(
                "INSERT INTO vaults (id, name, manifest) VALUES (?1, ?2, ?3)",
                params![manifest.id().as_str(), manifest.name(), json],
            )
            .map_err(|e| conflict(e, format!("Vault name '{}'", manifest.name())))?;
            debug!(vault = %manifest.id(), "Manifest stored");
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &VaultId) -> Result<VaultManifest> {
        let id = id.clone();
        self.run(move |conn| load(conn, &id)).await
    }

    async fn update(&self, manifest: &VaultManifest) -> Result<()> {
        let manifest = manifest.clone();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(storage)?;
            load(&tx, manifest.id())?.ensure_same_identity(&manifest)?;

            let json = manifest.to_json()?;
            tx.execute(
                "UPDATE vaults SET name = ?2, manifest = ?3 WHERE id = ?1",
                params![manifest.id().as_str(), manifest.name(), json],
            )
            .map_err(|e| conflict(e, format!("Vault name '{}'", manifest.name())))?;
            tx.commit().map_err(storage)?;
            debug!(vault = %manifest.id(), "Manifest updated");
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &VaultId) -> Result<()> {
        let id = id.clone();
        self.run(move |conn| {
            let removed = conn
                .execute("DELETE FROM vaults WHERE id = ?1", [id.as_str()])
                .map_err(storage)?;
            if removed == 0 {
                return Err(Error::NotFound(format!("Vault {}", id)));
            }
            debug!(vault = %id, "Manifest deleted");
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<VaultManifest>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT manifest FROM vaults ORDER BY name")
                .map_err(storage)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage)?;

            let mut manifests = Vec::new();
            for json in rows {
                manifests.push(VaultManifest::from_json(&json.map_err(storage)?)?);
            }
            Ok(manifests)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_crud() {
        contract::crud(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_unique_names() {
        contract::unique_names(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_immutable_fields() {
        contract::immutable_fields(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("vaults.sqlite3");
        let manifest = contract::manifest("Durable");

        {
            let store = SqliteStore::open(&db).unwrap();
            store.create(&manifest).await.unwrap();
        }

        let reopened = SqliteStore::open(&db).unwrap();
        let restored = reopened.get(manifest.id()).await.unwrap();
        assert_eq!(restored, manifest);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_reported() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .run(|conn| {
                conn.execute(
                    "INSERT INTO vaults (id, name, manifest) VALUES ('x', 'Broken', 'not json')",
                    [],
                )
                .map_err(storage)?;
                Ok(())
            })
            .await
            .unwrap();

        let id = VaultId::new("x").unwrap();
        assert!(matches!(store.get(&id).await, Err(Error::Serialization(_))));
    }
}
