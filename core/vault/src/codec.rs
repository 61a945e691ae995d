//! Encrypted file storage below a vault's storage directory.
//!
//! Every file is written through a temporary sibling that is synced and then
//! renamed over the target, so a reader only ever sees the previous or the
//! new complete ciphertext. Reads are all-or-nothing: plaintext is handed
//! out only after the final chunk authenticates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use myvault_common::{Error, Result, VaultPath};
use myvault_crypto::stream::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use myvault_crypto::{
    decrypt_stream, encrypt_stream, CipherAlgorithm, FileHeader, KeySlot, DEFAULT_CHUNK_SIZE,
};

/// Prefix of in-progress temporary files. Listing skips them.
pub const TEMP_PREFIX: &str = ".mvtmp";

/// Largest buffer `read` reserves up front from a header's plain size.
const MAX_READ_RESERVE: u64 = 256 * 1024 * 1024;

/// Codec tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Plaintext bytes per chunk.
    pub chunk_size: u32,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl CodecOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::InvalidParameter(format!(
                "chunk size {} outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

/// Description of one encrypted file, read from its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub relative_path: VaultPath,
    pub plain_size: u64,
    pub chunk_count: u64,
    pub last_modified: DateTime<Utc>,
}

/// Synchronous file codec for one vault.
///
/// The key is passed per call so the codec itself holds nothing secret.
/// Callers on an async runtime run these methods on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileCodec {
    root: PathBuf,
    cipher: CipherAlgorithm,
    options: CodecOptions,
}

impl FileCodec {
    /// Create a codec rooted at a vault's storage directory.
    ///
    /// # Errors
    /// - `InvalidParameter` if the chunk size is out of range
    pub fn new(root: impl Into<PathBuf>, cipher: CipherAlgorithm, options: CodecOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            root: root.into(),
            cipher,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// Encrypt `data` to `path`, replacing any previous version.
    pub fn write(&self, key: &KeySlot, path: &VaultPath, data: &[u8]) -> Result<FileRecord> {
        self.write_from(key, path, data)
    }

    /// Encrypt everything `reader` yields to `path`, replacing any previous
    /// version atomically.
    ///
    /// # Preconditions
    /// - The storage directory and the target's parent directory exist
    ///
    /// # Errors
    /// - `InvalidInput` if `path` is the root
    /// - `NotFound` if the storage or parent directory is missing
    /// - `NotPermitted` if the key is wiped mid-write (the target is untouched)
    /// - `Io` for filesystem failures
    pub fn write_from<R: Read>(&self, key: &KeySlot, path: &VaultPath, reader: R) -> Result<FileRecord> {
        let target = self.target(path)?;
        let parent = existing_parent(&target)?;

        debug!(path = %path, "Encrypting file");

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        let header = FileHeader::new(self.cipher, self.options.chunk_size)?;
        let file_id = path.to_string_path();

        let summary = {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let summary = encrypt_stream(key, header, file_id.as_bytes(), reader, &mut writer)?;
            writer.flush()?;
            summary
        };
        persist(temp, &target, &parent)?;

        info!(path = %path, size = summary.plain_size, chunks = summary.chunk_count, "File written");
        Ok(FileRecord {
            relative_path: path.clone(),
            plain_size: summary.plain_size,
            chunk_count: summary.chunk_count,
            last_modified: modified_at(&target)?,
        })
    }

    /// Decrypt `path` into memory.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Corrupted` if any part of the file fails validation
    /// - `NotPermitted` if the key is wiped mid-read
    pub fn read(&self, key: &KeySlot, path: &VaultPath) -> Result<Vec<u8>> {
        let mut source = self.open(path)?;
        // Reserve once so growth never leaves unwiped copies behind
        let reserve = FileHeader::read_from(&mut source)?.plain_size.min(MAX_READ_RESERVE);
        source.seek(SeekFrom::Start(0))?;
        let mut plaintext = Vec::with_capacity(reserve as usize);
        let file_id = path.to_string_path();

        match decrypt_stream(key, self.cipher, file_id.as_bytes(), BufReader::new(source), &mut plaintext) {
            Ok(summary) => {
                debug!(path = %path, size = summary.plain_size, "File read");
                Ok(plaintext)
            }
            Err(e) => {
                plaintext.zeroize();
                warn!(path = %path, error = %e, "File read failed");
                Err(e)
            }
        }
    }

    /// Decrypt `path` into `destination` on the local filesystem.
    ///
    /// The plaintext is staged next to `destination` and renamed into place
    /// only after every chunk authenticates; on failure `destination` is left
    /// as it was.
    ///
    /// # Returns
    /// Number of plaintext bytes written.
    pub fn export(&self, key: &KeySlot, path: &VaultPath, destination: &Path) -> Result<u64> {
        let source = self.open(path)?;
        let parent = existing_parent(destination)?;
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        let file_id = path.to_string_path();

        let summary = {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let summary = decrypt_stream(key, self.cipher, file_id.as_bytes(), BufReader::new(source), &mut writer)?;
            writer.flush()?;
            summary
        };
        persist(temp, destination, &parent)?;

        info!(path = %path, size = summary.plain_size, "File exported");
        Ok(summary.plain_size)
    }

    /// Remove the ciphertext of `path`.
    ///
    /// The file is unlinked, not overwritten.
    pub fn delete(&self, path: &VaultPath) -> Result<()> {
        let target = self.target(path)?;
        fs::remove_file(&target).map_err(|e| not_found_or_io(e, path))?;
        info!(path = %path, "File deleted");
        Ok(())
    }

    /// Read the header of `path` without decrypting it.
    pub fn record(&self, path: &VaultPath) -> Result<FileRecord> {
        let target = self.target(path)?;
        let mut source = File::open(&target).map_err(|e| not_found_or_io(e, path))?;
        let header = FileHeader::read_from(&mut source)?;
        Ok(FileRecord {
            relative_path: path.clone(),
            plain_size: header.plain_size,
            chunk_count: header.chunk_count(),
            last_modified: modified_at(&target)?,
        })
    }

    /// List every encrypted file below the storage directory, sorted by path.
    ///
    /// Temporary files, files without a valid header and names that are not
    /// valid vault paths are skipped.
    pub fn list(&self) -> Result<Vec<FileRecord>> {
        if !self.root.is_dir() {
            return Err(Error::NotFound(format!(
                "Storage directory: {}",
                self.root.display()
            )));
        }

        let mut records = Vec::new();
        let mut pending = vec![VaultPath::root()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(dir.resolve(&self.root))? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let Ok(child) = dir.join(&name) else {
                    continue;
                };

                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(child);
                } else if file_type.is_file() {
                    match self.record(&child) {
                        Ok(record) => records.push(record),
                        Err(Error::Corrupted(reason)) => {
                            debug!(path = %child, reason = %reason, "Skipping foreign file");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(records)
    }

    fn target(&self, path: &VaultPath) -> Result<PathBuf> {
        match path.name() {
            None => return Err(Error::InvalidInput("Path must name a file".to_string())),
            Some(name) if name.starts_with(TEMP_PREFIX) => {
                return Err(Error::InvalidInput(format!(
                    "File names starting with '{}' are reserved",
                    TEMP_PREFIX
                )));
            }
            Some(_) => {}
        }
        if !self.root.is_dir() {
            return Err(Error::NotFound(format!(
                "Storage directory: {}",
                self.root.display()
            )));
        }
        Ok(path.resolve(&self.root))
    }

    fn open(&self, path: &VaultPath) -> Result<File> {
        let target = self.target(path)?;
        File::open(&target).map_err(|e| not_found_or_io(e, path))
    }
}

fn existing_parent(target: &Path) -> Result<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.is_dir() {
        return Err(Error::NotFound(format!(
            "Parent directory: {}",
            parent.display()
        )));
    }
    Ok(parent)
}

fn persist(temp: NamedTempFile, target: &Path, parent: &Path) -> Result<()> {
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| Error::Io(e.error))?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(fs::metadata(path)?.modified()?))
}

fn not_found_or_io(e: io::Error, path: &VaultPath) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("File: {}", path))
    } else {
        Error::Io(e)
    }
}
