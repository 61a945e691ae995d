//! MyVault CLI - Command line interface for vault operations.
//!
//! This tool provides a command-line interface for creating, managing,
//! and operating on encrypted vaults.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use myvault_common::VaultPath;
use myvault_crypto::{CipherAlgorithm, KdfAlgorithm, KdfParams};
use myvault_vault::{NewVault, SqliteStore, VaultManager, VaultManifest, VaultSession};

#[derive(Parser)]
#[command(name = "myvault")]
#[command(about = "MyVault - Password-protected encrypted vaults")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault database (default: <data dir>/myvault/vaults.sqlite3).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Create {
        /// Vault name.
        #[arg(short, long)]
        name: String,

        /// Existing directory that will hold the encrypted files.
        #[arg(short, long)]
        path: PathBuf,

        /// Free-form description.
        #[arg(long, default_value = "")]
        description: String,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "moderate")]
        strength: String,

        /// KDF algorithm: "scrypt" or "argon2id".
        #[arg(long, default_value = "scrypt")]
        kdf: String,

        /// Cipher: "xchacha20-poly1305", "chacha20-poly1305" or "aes-256-gcm".
        #[arg(short, long, default_value = "xchacha20-poly1305")]
        cipher: String,

        /// Allow device re-authorization while unlocked.
        #[arg(long)]
        biometric: bool,
    },

    /// List all vaults.
    List,

    /// Show vault information.
    Info {
        #[arg(short, long)]
        name: String,
    },

    /// Delete a vault's metadata. Encrypted files are kept.
    Delete {
        #[arg(short, long)]
        name: String,
    },

    /// Encrypt a local file into the vault.
    Add {
        #[arg(short, long)]
        name: String,

        /// Source file to add.
        #[arg(short, long)]
        source: PathBuf,

        /// Destination path in vault.
        #[arg(short, long)]
        dest: String,
    },

    /// Decrypt a file from the vault.
    Extract {
        #[arg(short, long)]
        name: String,

        /// Source path in vault.
        #[arg(short, long)]
        source: String,

        /// Destination file path.
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// List the files of a vault.
    Files {
        #[arg(short, long)]
        name: String,
    },

    /// Remove a file from the vault.
    Remove {
        #[arg(short, long)]
        name: String,

        /// Path to remove.
        #[arg(short = 'f', long)]
        file: String,
    },

    /// Rename a vault.
    Rename {
        #[arg(short, long)]
        name: String,

        #[arg(long)]
        new_name: String,
    },

    /// Change a vault's description.
    Describe {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        description: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = open_manager(cli.db)?;

    match cli.command {
        Commands::Create {
            name,
            path,
            description,
            strength,
            kdf,
            cipher,
            biometric,
        } => {
            let request = NewVault::new(name, path)
                .with_description(description)
                .with_kdf(parse_kdf(&strength, &kdf)?)
                .with_cipher(parse_cipher(&cipher)?)
                .with_biometric_unlock(biometric);
            cmd_create(&manager, request).await
        }

        Commands::List => cmd_list(&manager).await,

        Commands::Info { name } => cmd_info(&manager, &name).await,

        Commands::Delete { name } => cmd_delete(&manager, &name).await,

        Commands::Add { name, source, dest } => cmd_add(&manager, &name, source, &dest).await,

        Commands::Extract { name, source, dest } => {
            cmd_extract(&manager, &name, &source, dest).await
        }

        Commands::Files { name } => cmd_files(&manager, &name).await,

        Commands::Remove { name, file } => cmd_remove(&manager, &name, &file).await,

        Commands::Rename { name, new_name } => cmd_rename(&manager, &name, &new_name).await,

        Commands::Describe { name, description } => {
            cmd_describe(&manager, &name, &description).await
        }
    }
}

fn open_manager(db: Option<PathBuf>) -> Result<VaultManager> {
    let db = match db {
        Some(db) => db,
        None => dirs::data_dir()
            .context("Could not determine the user data directory; pass --db")?
            .join("myvault")
            .join("vaults.sqlite3"),
    };
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let store = SqliteStore::open(&db)
        .with_context(|| format!("Failed to open vault database {}", db.display()))?;
    Ok(VaultManager::new(Arc::new(store)))
}

fn parse_kdf(strength: &str, algorithm: &str) -> Result<KdfParams> {
    let preset = match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        _ => {
            anyhow::bail!("Invalid strength. Use: interactive, moderate, or sensitive");
        }
    };
    match algorithm {
        "scrypt" => Ok(preset),
        "argon2id" => Ok(KdfParams::argon2id(preset.cost_factor, preset.parallelism)),
        _ => anyhow::bail!("Invalid KDF. Use: scrypt or argon2id"),
    }
}

fn parse_cipher(cipher: &str) -> Result<CipherAlgorithm> {
    match cipher {
        "xchacha20-poly1305" => Ok(CipherAlgorithm::XChaCha20Poly1305),
        "chacha20-poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
        "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
        _ => anyhow::bail!(
            "Invalid cipher. Use: xchacha20-poly1305, chacha20-poly1305, or aes-256-gcm"
        ),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

async fn find(manager: &VaultManager, name: &str) -> Result<VaultManifest> {
    manager
        .get_by_name(name)
        .await
        .with_context(|| format!("Failed to find vault '{}'", name))
}

/// Look up a vault by name and unlock it with a prompted password.
async fn unlock(manager: &VaultManager, name: &str) -> Result<VaultSession> {
    let manifest = find(manager, name).await?;
    let session = manager
        .open_vault(manifest.id())
        .await
        .context("Failed to open vault")?;

    let password = prompt_password("Enter password: ")?;
    session
        .unlock(&password)
        .await
        .context("Failed to unlock vault")?;
    Ok(session)
}

/// Create a new vault.
async fn cmd_create(manager: &VaultManager, request: NewVault) -> Result<()> {
    info!("Creating new vault: {}", request.name);

    let password = prompt_password("Enter password: ")?;
    let confirm = prompt_password("Confirm password: ")?;

    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let location = request.storage_path.clone();
    let session = manager
        .create_vault(request, &password)
        .await
        .context("Failed to create vault")?;
    session.lock();

    println!("Vault created successfully!");
    println!("  ID: {}", session.vault_id());
    println!("  Name: {}", session.manifest().name());
    println!("  Location: {}", location.display());

    Ok(())
}

/// List all vaults.
async fn cmd_list(manager: &VaultManager) -> Result<()> {
    let vaults = manager.list_vaults().await.context("Failed to list vaults")?;

    if vaults.is_empty() {
        println!("No vaults.");
    } else {
        for vault in vaults {
            println!("  {}  {}", vault.name(), vault.storage_path().display());
        }
    }

    Ok(())
}

/// Show vault information.
async fn cmd_info(manager: &VaultManager, name: &str) -> Result<()> {
    let manifest = find(manager, name).await?;
    let kdf = manifest.kdf();
    let algorithm = match kdf.algorithm {
        KdfAlgorithm::Scrypt => "scrypt",
        KdfAlgorithm::Argon2id => "argon2id",
    };

    println!("Vault Information:");
    println!("  ID: {}", manifest.id());
    println!("  Name: {}", manifest.name());
    println!("  Description: {}", manifest.description());
    println!("  Location: {}", manifest.storage_path().display());
    println!("  Version: {}.{}", manifest.version().major, manifest.version().minor);
    println!("  Cipher: {:?}", manifest.cipher());
    println!("  Biometric unlock: {}", manifest.biometric_unlock_enabled());
    println!("  Created: {}", manifest.created_at());
    println!("  Modified: {}", manifest.modified_at());
    println!("  KDF Parameters:");
    println!("    Algorithm: {}", algorithm);
    println!("    Cost factor: 2^{}", kdf.cost_factor);
    println!("    Parallelism: {}", kdf.parallelism);

    Ok(())
}

/// Delete a vault after confirming the password.
async fn cmd_delete(manager: &VaultManager, name: &str) -> Result<()> {
    let session = unlock(manager, name).await?;
    let id = session.vault_id().clone();
    session.invalidate();

    manager
        .delete_vault(&id)
        .await
        .context("Failed to delete vault")?;

    println!("Vault deleted: {}", name);
    println!(
        "  Encrypted files remain in {}",
        session.manifest().storage_path().display()
    );

    Ok(())
}

/// Add a file to the vault.
async fn cmd_add(manager: &VaultManager, name: &str, source: PathBuf, dest: &str) -> Result<()> {
    info!("Adding file {} to vault as {}", source.display(), dest);

    let dest_path = VaultPath::parse(dest).context("Invalid destination path")?;
    let session = unlock(manager, name).await?;

    let record = session
        .write_file_from(&dest_path, source)
        .await
        .context("Failed to add file")?;
    session.lock();

    println!(
        "File added successfully: {} ({} bytes)",
        record.relative_path, record.plain_size
    );

    Ok(())
}

/// Extract a file from the vault.
async fn cmd_extract(manager: &VaultManager, name: &str, source: &str, dest: PathBuf) -> Result<()> {
    info!("Extracting {} from vault to {}", source, dest.display());

    let source_path = VaultPath::parse(source).context("Invalid source path")?;
    let session = unlock(manager, name).await?;

    let size = session
        .export_file(&source_path, dest.clone())
        .await
        .context("Failed to extract file from vault")?;
    session.lock();

    println!(
        "File extracted successfully: {} ({} bytes)",
        dest.display(),
        size
    );

    Ok(())
}

/// List the files of a vault.
async fn cmd_files(manager: &VaultManager, name: &str) -> Result<()> {
    let session = unlock(manager, name).await?;
    let files = session.list_files().await.context("Failed to list files")?;
    session.lock();

    if files.is_empty() {
        println!("Vault is empty.");
    } else {
        for file in files {
            println!(
                "  {} ({} bytes, modified {})",
                file.relative_path,
                file.plain_size,
                file.last_modified.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Remove a file from the vault.
async fn cmd_remove(manager: &VaultManager, name: &str, file: &str) -> Result<()> {
    info!("Removing: {}", file);

    let file_path = VaultPath::parse(file).context("Invalid file path")?;
    let session = unlock(manager, name).await?;

    session
        .delete_file(&file_path)
        .await
        .context("Failed to remove file")?;
    session.lock();

    println!("File removed: {}", file);

    Ok(())
}

/// Rename a vault.
async fn cmd_rename(manager: &VaultManager, name: &str, new_name: &str) -> Result<()> {
    let manifest = find(manager, name).await?;
    manager
        .rename_vault(manifest.id(), new_name)
        .await
        .context("Failed to rename vault")?;

    println!("Vault renamed: {} -> {}", name, new_name);

    Ok(())
}

/// Change a vault's description.
async fn cmd_describe(manager: &VaultManager, name: &str, description: &str) -> Result<()> {
    let manifest = find(manager, name).await?;
    manager
        .set_description(manifest.id(), description)
        .await
        .context("Failed to update description")?;

    println!("Description updated for {}", name);

    Ok(())
}
