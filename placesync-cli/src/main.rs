use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use placesync_core::crypto::encoding::{bytes_to_hex, hex_to_bytes};
use placesync_core::crypto::{derive_main_key, EncryptedRecord, RecordCrypto};
use placesync_core::sync::checkpoint::Checkpoint;
use placesync_core::sync::SqliteCheckpointStore;
use placesync_core::{CredentialBundle, EngineConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Places Sync CLI - inspect keys, records and checkpoints of a sync account
#[derive(Parser)]
#[command(name = "placesync")]
#[command(about = "Encrypted history and bookmarks sync tool", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the account root secret comes from.
#[derive(clap::Args)]
struct Secret {
    /// Hex-encoded kB
    #[arg(long, conflicts_with = "credentials")]
    kb: Option<String>,

    /// Credentials JSON file with URL, assertion, xClientState and kB
    #[arg(long)]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the main sync key from kB
    DeriveKey {
        #[command(flatten)]
        secret: Secret,
    },

    /// Check that kB unlocks a crypto/keys record
    VerifyKeys {
        #[command(flatten)]
        secret: Secret,

        /// Encrypted crypto/keys record (JSON)
        #[arg(long)]
        crypto_keys: PathBuf,
    },

    /// Decrypt one record payload
    Decrypt {
        #[command(flatten)]
        secret: Secret,

        #[arg(long)]
        crypto_keys: PathBuf,

        /// Encrypted record (JSON with ciphertext, IV and hmac)
        #[arg(long)]
        record: PathBuf,

        #[arg(long, default_value = "history")]
        collection: String,
    },

    /// Encrypt a cleartext payload
    Encrypt {
        #[command(flatten)]
        secret: Secret,

        #[arg(long)]
        crypto_keys: PathBuf,

        /// Cleartext payload (JSON)
        #[arg(long)]
        payload: PathBuf,

        #[arg(long, default_value = "history")]
        collection: String,
    },

    /// Show the stored checkpoint of a collection
    Checkpoint {
        /// Checkpoint database
        #[arg(long)]
        db: PathBuf,

        /// Account scope (the xClientState)
        #[arg(long)]
        account: String,

        #[arg(long, default_value = "history")]
        collection: String,
    },

    /// Print the effective engine configuration
    Config,
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn resolve_kb(secret: Secret) -> Result<String> {
    match (secret.kb, secret.credentials) {
        (Some(kb), _) => Ok(kb),
        (None, Some(path)) => {
            let value: serde_json::Value = serde_json::from_str(&read_file(&path)?)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            let bundle = CredentialBundle::from_value(&value)?;
            debug!("Loaded credentials for {:?}", bundle);
            Ok(bundle.kb)
        }
        (None, None) => bail!("Either --kb or --credentials is required"),
    }
}

fn read_record(path: &Path) -> Result<EncryptedRecord> {
    Ok(EncryptedRecord::from_json(&read_file(path)?)?)
}

/// Session crypto unlocked with kB and the account's crypto/keys record.
fn unlock(secret: Secret, crypto_keys: &Path) -> Result<RecordCrypto> {
    let kb = resolve_kb(secret)?;
    let mut crypto = RecordCrypto::new();
    crypto.import_main_key(&kb)?;
    crypto
        .unwrap_bulk_keys(&read_record(crypto_keys)?)
        .context("kB does not unlock this crypto/keys record")?;
    Ok(crypto)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(EngineConfig::load(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::DeriveKey { secret } => {
            let kb = resolve_kb(secret)?;
            let main_key = derive_main_key(&hex_to_bytes("kB", &kb)?)?;
            println!("aes:  {}", bytes_to_hex(main_key.aes_key()));
            println!("hmac: {}", bytes_to_hex(main_key.hmac_key()));
        }
        Commands::VerifyKeys {
            secret,
            crypto_keys,
        } => {
            let crypto = unlock(secret, &crypto_keys)?;
            let collections = crypto
                .bulk_keys()
                .map(|keys| keys.collection_names())
                .unwrap_or_default();
            println!("crypto/keys verified");
            if collections.is_empty() {
                println!("default key bundle only");
            } else {
                println!("collection key bundles: {}", collections.join(", "));
            }
        }
        Commands::Decrypt {
            secret,
            crypto_keys,
            record,
            collection,
        } => {
            let crypto = unlock(secret, &crypto_keys)?;
            let payload = crypto.decrypt(&read_record(&record)?, &collection)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Encrypt {
            secret,
            crypto_keys,
            payload,
            collection,
        } => {
            let crypto = unlock(secret, &crypto_keys)?;
            let cleartext: serde_json::Value = serde_json::from_str(&read_file(&payload)?)
                .with_context(|| format!("{} is not valid JSON", payload.display()))?;
            let record = crypto.encrypt(&cleartext, &collection)?;
            println!("{}", record.to_json()?);
        }
        Commands::Checkpoint {
            db,
            account,
            collection,
        } => {
            let store = SqliteCheckpointStore::open(&db)?;
            let checkpoint = Checkpoint::new(&store, &account, &collection);
            println!("mtime:    {}", checkpoint.mtime()?);
            println!(
                "revision: {}",
                checkpoint.revision()?.unwrap_or_else(|| "-".to_string())
            );
            let id_map = checkpoint.id_map()?;
            println!("mapped records: {}", id_map.len());
            for (remote_id, local_key) in id_map {
                println!("  {} -> {}", remote_id, local_key);
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
