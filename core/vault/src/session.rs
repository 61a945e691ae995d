//! Vault session management.
//!
//! A session owns the lock state of one vault. While unlocked it holds the
//! derived key in a [`KeySlot`] and mediates every file access; locking,
//! invalidating, timing out or dropping the last handle wipes the key.
//!
//! ```text
//! Locked --unlock--> Unlocking --tag match--> Unlocked
//!                    Unlocking --mismatch---> Locked (or Invalidated)
//! Unlocked --lock / timeout--> Locked
//! any --invalidate--> Invalidated
//! ```

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::codec::{CodecOptions, FileCodec, FileRecord};
use crate::manifest::VaultManifest;
use myvault_common::{Error, Result, VaultId, VaultPath};
use myvault_crypto::{KdfLimits, KeySlot, VaultKey};

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No key in memory.
    Locked,
    /// A key derivation is in flight.
    Unlocking,
    /// Key is resident and file operations are allowed.
    Unlocked,
    /// Terminal: the session refuses every further operation.
    Invalidated,
}

/// Answer of a device authorization prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    Denied,
}

/// Platform oracle for biometric or device-credential confirmation.
///
/// It can only re-release a key that is already resident; it never stands
/// in for the password on first unlock.
#[async_trait]
pub trait DeviceAuthorizer: Send + Sync {
    async fn request_authorization(&self) -> Authorization;
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Unlocked time after which the key is wiped. `None` disables auto-lock.
    pub auto_lock_after: Option<Duration>,
    /// Wrong-password attempts after which the session is invalidated.
    pub max_failed_attempts: Option<u32>,
    pub kdf_limits: KdfLimits,
    pub codec: CodecOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_lock_after: Some(Duration::from_secs(5 * 60)),
            max_failed_attempts: None,
            kdf_limits: KdfLimits::default(),
            codec: CodecOptions::default(),
        }
    }
}

type UnlockOutcome = std::result::Result<(), Arc<Error>>;
type PendingUnlock = Shared<BoxFuture<'static, UnlockOutcome>>;

/// One running key derivation.
struct Derivation {
    attempt: u64,
    outcome: PendingUnlock,
}

enum Slot {
    /// `draining` is a derivation abandoned by `lock`. No new derivation
    /// starts until it has finished.
    Locked {
        draining: Option<Derivation>,
    },
    Unlocking(Derivation),
    Unlocked {
        key: Arc<KeySlot>,
        unlocked_at: Instant,
    },
    Invalidated,
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Locked { .. } => SessionState::Locked,
            Slot::Unlocking(_) => SessionState::Unlocking,
            Slot::Unlocked { .. } => SessionState::Unlocked,
            Slot::Invalidated => SessionState::Invalidated,
        }
    }
}

struct Inner {
    manifest: VaultManifest,
    options: SessionOptions,
    codec: FileCodec,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<SessionState>,
    file_locks: Mutex<HashMap<VaultPath, Arc<tokio::sync::Mutex<()>>>>,
    next_attempt: AtomicU64,
    derivations: AtomicU64,
    failed_attempts: AtomicU64,
}

/// Handle to an open vault.
///
/// Clones share the same state; the key is wiped when the last clone is
/// dropped.
#[derive(Clone)]
pub struct VaultSession {
    inner: Arc<Inner>,
}

impl VaultSession {
    /// Open a locked session for `manifest`.
    ///
    /// # Errors
    /// - `InvalidParameter` if the codec options are out of range
    pub fn new(manifest: VaultManifest, options: SessionOptions) -> Result<Self> {
        Self::build(manifest, options, Slot::Locked { draining: None })
    }

    /// Open an unlocked session from a key that was just derived for
    /// `manifest`.
    ///
    /// # Errors
    /// - `AuthenticationFailed` if `key` does not match the manifest
    pub fn from_verified_key(
        manifest: VaultManifest,
        key: VaultKey,
        options: SessionOptions,
    ) -> Result<Self> {
        if !manifest.verify_key(&key)? {
            return Err(Error::AuthenticationFailed);
        }
        let slot = Slot::Unlocked {
            key: Arc::new(KeySlot::new(key)),
            unlocked_at: Instant::now(),
        };
        Self::build(manifest, options, slot)
    }

    fn build(manifest: VaultManifest, options: SessionOptions, slot: Slot) -> Result<Self> {
        let codec = FileCodec::new(manifest.storage_path(), manifest.cipher(), options.codec)?;
        let (state_tx, _) = watch::channel(slot.state());
        Ok(Self {
            inner: Arc::new(Inner {
                manifest,
                options,
                codec,
                slot: Mutex::new(slot),
                state_tx,
                file_locks: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(0),
                derivations: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
            }),
        })
    }

    /// Get the vault ID.
    pub fn vault_id(&self) -> &VaultId {
        self.inner.manifest.id()
    }

    /// Manifest as it was when the session was opened.
    pub fn manifest(&self) -> &VaultManifest {
        &self.inner.manifest
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Current state, applying any pending auto-lock first.
    pub fn state(&self) -> SessionState {
        let mut slot = self.inner.slot();
        self.inner.expire(&mut slot);
        slot.state()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    /// Receive every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of key derivations this session has started.
    pub fn derivation_count(&self) -> u64 {
        self.inner.derivations.load(Ordering::SeqCst)
    }

    /// Wrong passwords entered so far.
    pub fn failed_attempts(&self) -> u64 {
        self.inner.failed_attempts.load(Ordering::SeqCst)
    }

    /// Unlock with a password.
    ///
    /// The KDF runs on the blocking pool. Concurrent callers share a single
    /// in-flight derivation; the derivation also runs to completion if every
    /// caller goes away, and its result is adopted by the session. A
    /// derivation abandoned by [`lock`](Self::lock) is awaited before a new
    /// one starts, so at most one runs at a time.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty password
    /// - `AuthenticationFailed` for a wrong password
    /// - `InvalidParameter` if the stored KDF parameters exceed the limits
    /// - `NotPermitted` if the session is invalidated, or was locked while
    ///   the derivation ran
    pub async fn unlock(&self, password: &[u8]) -> Result<()> {
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }

        loop {
            let (attempt, outcome, draining) = {
                let mut slot = self.inner.slot();
                self.inner.expire(&mut slot);
                match &*slot {
                    Slot::Unlocked { .. } => return Ok(()),
                    Slot::Invalidated => return Err(invalidated()),
                    Slot::Unlocking(derivation) => {
                        debug!(vault = %self.vault_id(), "Joining in-flight unlock");
                        (derivation.attempt, derivation.outcome.clone(), false)
                    }
                    Slot::Locked {
                        draining: Some(derivation),
                    } => {
                        debug!(vault = %self.vault_id(), "Waiting for abandoned unlock");
                        (derivation.attempt, derivation.outcome.clone(), true)
                    }
                    Slot::Locked { draining: None } => {
                        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
                        let outcome = Inner::start_derivation(&self.inner, attempt, password);
                        *slot = Slot::Unlocking(Derivation {
                            attempt,
                            outcome: outcome.clone(),
                        });
                        self.inner.publish(SessionState::Unlocking);
                        (attempt, outcome, false)
                    }
                }
            };

            let result = outcome.await;
            if !draining {
                return result.map_err(|e| replay(&e));
            }
            self.inner.end_drain(attempt);
        }
    }

    /// Wipe the key and return to `Locked`. Idempotent.
    ///
    /// An in-flight unlock is abandoned; its result is discarded.
    pub fn lock(&self) {
        let mut slot = self.inner.slot();
        let draining = match std::mem::replace(&mut *slot, Slot::Locked { draining: None }) {
            Slot::Unlocked { key, .. } => {
                key.wipe();
                None
            }
            Slot::Unlocking(derivation) => Some(derivation),
            unchanged => {
                *slot = unchanged;
                return;
            }
        };
        *slot = Slot::Locked { draining };
        self.inner.publish(SessionState::Locked);
        info!(vault = %self.vault_id(), "Vault locked");
    }

    /// Wipe the key and refuse every further operation.
    pub fn invalidate(&self) {
        let mut slot = self.inner.slot();
        if let Slot::Unlocked { key, .. } = &*slot {
            key.wipe();
        }
        if !matches!(*slot, Slot::Invalidated) {
            *slot = Slot::Invalidated;
            self.inner.publish(SessionState::Invalidated);
            warn!(vault = %self.vault_id(), "Session invalidated");
        }
    }

    /// Apply the auto-lock deadline now.
    ///
    /// # Returns
    /// `true` if this call locked the session.
    pub fn enforce_timeout(&self) -> bool {
        let mut slot = self.inner.slot();
        self.inner.expire(&mut slot)
    }

    /// Ask the device to confirm the user, then extend the unlocked period.
    ///
    /// # Errors
    /// - `NotPermitted` if biometric unlock is disabled for the vault or no
    ///   key is resident
    /// - `AuthenticationFailed` if the device denies the request; the session
    ///   stays unlocked
    pub async fn reauthorize_with_device(&self, authorizer: &dyn DeviceAuthorizer) -> Result<()> {
        if !self.inner.manifest.biometric_unlock_enabled() {
            return Err(Error::NotPermitted(
                "Biometric unlock is not enabled for this vault".to_string(),
            ));
        }
        let key = self.inner.key()?;

        match authorizer.request_authorization().await {
            Authorization::Denied => {
                debug!(vault = %self.vault_id(), "Device authorization denied");
                Err(Error::AuthenticationFailed)
            }
            Authorization::Granted => {
                let mut slot = self.inner.slot();
                match &mut *slot {
                    Slot::Unlocked {
                        key: resident,
                        unlocked_at,
                    } if Arc::ptr_eq(resident, &key) => {
                        *unlocked_at = Instant::now();
                        debug!(vault = %self.vault_id(), "Unlock period extended by device");
                        Ok(())
                    }
                    _ => Err(Error::NotPermitted(
                        "Vault was locked during device authorization".to_string(),
                    )),
                }
            }
        }
    }

    /// Encrypt `data` to `path`.
    pub async fn write_file(&self, path: &VaultPath, data: Vec<u8>) -> Result<FileRecord> {
        let target = path.clone();
        self.with_file(path, move |codec, key| {
            let data = Zeroizing::new(data);
            codec.write(key, &target, &data)
        })
        .await
    }

    /// Encrypt the local file `source` to `path`.
    pub async fn write_file_from(&self, path: &VaultPath, source: PathBuf) -> Result<FileRecord> {
        let target = path.clone();
        self.with_file(path, move |codec, key| {
            let reader = std::fs::File::open(&source).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::NotFound(format!("Source file: {}", source.display()))
                } else {
                    Error::Io(e)
                }
            })?;
            codec.write_from(key, &target, io::BufReader::new(reader))
        })
        .await
    }

    /// Decrypt `path` into memory.
    pub async fn read_file(&self, path: &VaultPath) -> Result<Vec<u8>> {
        let target = path.clone();
        self.with_file(path, move |codec, key| codec.read(key, &target))
            .await
    }

    /// Decrypt `path` to the local file `destination`.
    pub async fn export_file(&self, path: &VaultPath, destination: PathBuf) -> Result<u64> {
        let target = path.clone();
        self.with_file(path, move |codec, key| {
            codec.export(key, &target, &destination)
        })
        .await
    }

    pub async fn delete_file(&self, path: &VaultPath) -> Result<()> {
        let target = path.clone();
        self.with_file(path, move |codec, _| codec.delete(&target))
            .await
    }

    pub async fn file_record(&self, path: &VaultPath) -> Result<FileRecord> {
        let target = path.clone();
        self.with_file(path, move |codec, _| codec.record(&target))
            .await
    }

    /// List the encrypted files of the vault.
    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.inner.key()?;
        let codec = self.inner.codec.clone();
        tokio::task::spawn_blocking(move || codec.list())
            .await
            .map_err(join_error)?
    }

    /// Run a codec operation on the blocking pool while holding the
    /// per-file lock of `path`.
    async fn with_file<T, F>(&self, path: &VaultPath, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileCodec, &KeySlot) -> Result<T> + Send + 'static,
    {
        let file_lock = self.inner.file_lock(path);
        let result = {
            let _guard = file_lock.lock().await;
            match self.inner.key() {
                Ok(key) => {
                    let codec = self.inner.codec.clone();
                    tokio::task::spawn_blocking(move || op(&codec, key.as_ref()))
                        .await
                        .map_err(join_error)
                        .and_then(|r| r)
                }
                Err(e) => Err(e),
            }
        };
        self.inner.release_file_lock(path, file_lock);
        result
    }
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("vault", self.inner.manifest.id())
            .field("state", &self.inner.slot().state())
            .finish()
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Lock the session if the auto-lock deadline has passed.
    fn expire(&self, slot: &mut Slot) -> bool {
        let Some(limit) = self.options.auto_lock_after else {
            return false;
        };
        match slot {
            Slot::Unlocked { key, unlocked_at } if unlocked_at.elapsed() >= limit => {
                key.wipe();
                *slot = Slot::Locked { draining: None };
                self.publish(SessionState::Locked);
                info!(vault = %self.manifest.id(), "Vault auto-locked");
                true
            }
            _ => false,
        }
    }

    /// The resident key, if the session is unlocked.
    fn key(&self) -> Result<Arc<KeySlot>> {
        let mut slot = self.slot();
        self.expire(&mut slot);
        match &*slot {
            Slot::Unlocked { key, .. } => Ok(Arc::clone(key)),
            Slot::Invalidated => Err(invalidated()),
            Slot::Locked { .. } | Slot::Unlocking(_) => {
                Err(Error::NotPermitted("Vault is locked".to_string()))
            }
        }
    }

    fn start_derivation(this: &Arc<Self>, attempt: u64, password: &[u8]) -> PendingUnlock {
        this.derivations.fetch_add(1, Ordering::SeqCst);
        debug!(vault = %this.manifest.id(), attempt, "Starting key derivation");

        let password = Zeroizing::new(password.to_vec());
        let manifest = this.manifest.clone();
        let limits = this.options.kdf_limits.clone();
        let weak: Weak<Self> = Arc::downgrade(this);

        let driver = tokio::spawn(async move {
            let derived = tokio::task::spawn_blocking(move || {
                let key = manifest.derive_key(&password, &limits)?;
                if manifest.verify_key(&key)? {
                    Ok(key)
                } else {
                    Err(Error::AuthenticationFailed)
                }
            })
            .await
            .map_err(join_error)
            .and_then(|r| r);

            match weak.upgrade() {
                Some(inner) => inner.finish_unlock(attempt, derived),
                None => Err(Arc::new(Error::NotPermitted(
                    "Session closed during unlock".to_string(),
                ))),
            }
        });

        async move {
            match driver.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(join_error(e))),
            }
        }
        .boxed()
        .shared()
    }

    fn finish_unlock(&self, attempt: u64, derived: Result<VaultKey>) -> UnlockOutcome {
        let mut slot = self.slot();
        let current = matches!(&*slot, Slot::Unlocking(d) if d.attempt == attempt);
        if !current {
            // Dropping the key zeroizes it.
            drop(derived);
            Self::clear_drain(&mut slot, attempt);
            debug!(vault = %self.manifest.id(), attempt, "Discarding superseded unlock");
            return Err(Arc::new(Error::NotPermitted(
                "Unlock was cancelled by a lock or invalidation".to_string(),
            )));
        }

        match derived {
            Ok(key) => {
                *slot = Slot::Unlocked {
                    key: Arc::new(KeySlot::new(key)),
                    unlocked_at: Instant::now(),
                };
                self.publish(SessionState::Unlocked);
                info!(vault = %self.manifest.id(), "Vault unlocked");
                Ok(())
            }
            Err(e) => {
                let next = if matches!(e, Error::AuthenticationFailed) {
                    let failures = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(vault = %self.manifest.id(), failures, "Unlock failed: wrong password");
                    match self.options.max_failed_attempts {
                        Some(max) if failures >= u64::from(max) => Slot::Invalidated,
                        _ => Slot::Locked { draining: None },
                    }
                } else {
                    warn!(vault = %self.manifest.id(), error = %e, "Unlock failed");
                    Slot::Locked { draining: None }
                };
                let state = next.state();
                *slot = next;
                self.publish(state);
                Err(Arc::new(e))
            }
        }
    }

    /// Forget an abandoned derivation once it has finished.
    fn end_drain(&self, attempt: u64) {
        let mut slot = self.slot();
        Self::clear_drain(&mut slot, attempt);
    }

    fn clear_drain(slot: &mut Slot, attempt: u64) {
        if let Slot::Locked { draining } = slot {
            if draining.as_ref().is_some_and(|d| d.attempt == attempt) {
                *draining = None;
            }
        }
    }

    fn file_lock(&self, path: &VaultPath) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.file_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.clone()).or_default())
    }

    /// Drop the per-file lock once nobody else holds or waits for it.
    fn release_file_lock(&self, path: &VaultPath, file_lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.file_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&file_lock) == 2 {
            locks.remove(path);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Slot::Unlocked { key, .. } = slot {
            key.wipe();
        }
    }
}

fn invalidated() -> Error {
    Error::NotPermitted("Session has been invalidated".to_string())
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(e))
}

/// Rebuild a shared unlock error for each waiting caller.
fn replay(e: &Error) -> Error {
    match e {
        Error::InvalidParameter(m) => Error::InvalidParameter(m.clone()),
        Error::AuthenticationFailed => Error::AuthenticationFailed,
        Error::AuthFailure => Error::AuthFailure,
        Error::Corrupted(m) => Error::Corrupted(m.clone()),
        Error::Io(io_err) => Error::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        Error::Crypto(m) => Error::Crypto(m.clone()),
        Error::Storage(m) => Error::Storage(m.clone()),
        Error::Serialization(m) => Error::Serialization(m.clone()),
        Error::InvalidInput(m) => Error::InvalidInput(m.clone()),
        Error::NotPermitted(m) => Error::NotPermitted(m.clone()),
        Error::NotFound(m) => Error::NotFound(m.clone()),
        Error::AlreadyExists(m) => Error::AlreadyExists(m.clone()),
    }
}
