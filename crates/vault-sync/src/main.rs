use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vault_core::paths::{default_root, MANIFEST_FILE};
use vault_core::profile::{ComplianceMode, EncryptionStrength};
use vault_core::{
    Collection, EngineSettings, ExportOptions, ProfileOverrides, VaultEngine,
};

mod keys;
mod sync_loop;

use crate::sync_loop::spawn_sync_loop;

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock vault sync engine", long_about = None)]
struct Cli {
    /// Vault root; defaults to $VAULT_SYNC_ROOT, then the platform data directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Engine settings (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Profile to apply after opening, instead of the configured default
    #[arg(long, global = true)]
    profile: Option<String>,
    /// Keep the vault key in the OS keyring instead of deriving it from a password
    #[arg(long, global = true)]
    keyring: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new vault
    Init {
        /// Use a random key instead of a password (printed once unless --keyring)
        #[arg(long)]
        generate_key: bool,
    },
    /// Queue one update and drain immediately
    Sync {
        entity_id: String,
        collection: Collection,
        /// JSON payload
        payload: String,
    },
    /// Print one decrypted record
    Get {
        collection: Collection,
        entity_id: String,
    },
    /// List entity ids in a collection
    List { collection: Collection },
    /// Write a fork bundle for an entity
    Export {
        entity_id: String,
        /// Restrict to these collections
        #[arg(long, value_delimiter = ',')]
        collections: Vec<Collection>,
        /// Keep payloads sealed under this vault's key
        #[arg(long)]
        keep_encrypted: bool,
        #[arg(long)]
        include_platform_configs: bool,
    },
    /// Import a fork bundle under a new entity id
    Import {
        bundle: PathBuf,
        new_entity_id: String,
    },
    /// Apply a platform profile, or list profiles when no name is given
    Profile {
        name: Option<String>,
        #[arg(long)]
        sync_interval: Option<u64>,
        /// standard | maximum
        #[arg(long)]
        strength: Option<String>,
        #[arg(long)]
        checkpoints: Option<bool>,
        #[arg(long)]
        archival: Option<bool>,
        /// none | audit | strict
        #[arg(long)]
        compliance: Option<String>,
    },
    /// List mirror checkpoints for an entity
    Checkpoints { entity_id: String },
    /// Apply checkpoint retention
    Cleanup {
        /// Only this entity (default: all)
        entity_id: Option<String>,
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Check every indexed record and the audit journal chain
    Verify,
    /// Read JSONL sync items from stdin and drain on the profile's interval
    Run,
}

/// One line of `run` input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingItem {
    entity_id: String,
    collection: Collection,
    payload: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let root = match &cli.root {
        Some(root) => root.clone(),
        None => default_root()?,
    };
    let settings = match &cli.config {
        Some(path) => EngineSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => EngineSettings::default(),
    };

    if let Commands::Init { generate_key } = cli.command {
        return init_command(&root, settings, cli.keyring, generate_key);
    }

    let engine = open(&root, settings, cli.keyring)?;
    if let Some(name) = &cli.profile {
        engine.apply_profile(name, &ProfileOverrides::default())?;
    }

    match cli.command {
        // Handled before the vault is opened.
        Commands::Init { .. } => {}
        Commands::Sync {
            entity_id,
            collection,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("payload is not JSON")?;
            let receipt = engine.enqueue(entity_id, collection, payload);
            if !receipt.queued {
                return Err(anyhow!("queue full ({} items)", receipt.queue_length));
            }
            let summary = engine.drain_now().await;
            print_json(&summary)?;
            if !summary.errors.is_empty() {
                return Err(anyhow!("{} item(s) failed", summary.errors.len()));
            }
            if let Some(stalled) = &summary.stalled {
                return Err(anyhow!("item {} still writing: {}", stalled.item_id, stalled.error));
            }
        }
        Commands::Get {
            collection,
            entity_id,
        } => {
            let got = engine.get(collection, &entity_id)?;
            print_json(&json!({
                "collection": got.collection,
                "entityId": got.record.entity_id,
                "lastUpdated": got.record.last_updated,
                "checksum": got.record.checksum,
                "algorithm": got.record.encrypted.algorithm,
                "protected": got.record.protected,
                "importedFrom": got.record.imported_from,
                "importedAt": got.record.imported_at,
                "data": got.data,
            }))?;
        }
        Commands::List { collection } => print_json(&engine.list(collection)?)?,
        Commands::Export {
            entity_id,
            collections,
            keep_encrypted,
            include_platform_configs,
        } => {
            let options = ExportOptions {
                collections: (!collections.is_empty()).then_some(collections),
                keep_encrypted,
                include_platform_configs,
            };
            let path = engine.export(&entity_id, &options)?;
            println!("{}", path.display());
        }
        Commands::Import {
            bundle,
            new_entity_id,
        } => print_json(&engine.import(&bundle, &new_entity_id)?)?,
        Commands::Profile {
            name: None,
            ..
        } => {
            let profiles: Vec<_> = engine
                .profiles()
                .names()
                .filter_map(|n| engine.profiles().get(n).ok())
                .collect();
            print_json(&json!({
                "active": engine.active_profile().name,
                "profiles": profiles,
            }))?;
        }
        Commands::Profile {
            name: Some(name),
            sync_interval,
            strength,
            checkpoints,
            archival,
            compliance,
        } => {
            let overrides = ProfileOverrides {
                sync_interval_secs: sync_interval,
                encryption_strength: strength.as_deref().map(parse_strength).transpose()?,
                checkpoints_enabled: checkpoints,
                archival_retention: archival,
                compliance_mode: compliance.as_deref().map(parse_compliance).transpose()?,
            };
            print_json(&engine.apply_profile(&name, &overrides)?)?;
        }
        Commands::Checkpoints { entity_id } => print_json(&engine.checkpoints(&entity_id)?)?,
        Commands::Cleanup { entity_id, keep } => {
            print_json(&engine.cleanup_checkpoints(entity_id.as_deref(), keep)?)?
        }
        Commands::Verify => {
            let report = engine.verify()?;
            let journal_entries = engine.journal().verify_chain()?;
            print_json(&json!({
                "checked": report.checked,
                "problems": report.problems,
                "journalEntries": journal_entries,
            }))?;
            if !report.problems.is_empty() {
                return Err(anyhow!("{} problem(s) found", report.problems.len()));
            }
        }
        Commands::Run => run_command(Arc::new(engine)).await?,
    }
    Ok(())
}

fn open(root: &Path, settings: EngineSettings, use_keyring: bool) -> Result<VaultEngine> {
    if !root.join(MANIFEST_FILE).exists() {
        return Err(anyhow!(
            "no vault at {}; run init first",
            root.display()
        ));
    }
    let key = keys::resolve(root, use_keyring)?;
    VaultEngine::open(root, key, settings).with_context(|| format!("opening vault at {}", root.display()))
}

fn init_command(
    root: &Path,
    settings: EngineSettings,
    use_keyring: bool,
    generate_key: bool,
) -> Result<()> {
    if root.join(MANIFEST_FILE).exists() {
        return Err(anyhow!("vault already exists at {}", root.display()));
    }
    let (key, shown) = keys::for_new_vault(root, use_keyring, generate_key)?;
    let engine = VaultEngine::open(root, key, settings)?;
    println!("Vault created at {}", engine.layout().root().display());
    println!("Active profile: {}", engine.active_profile().name);
    if let Some(hex) = shown {
        println!("Vault key (store it now, it is not kept anywhere): {}", *hex);
    }
    Ok(())
}

async fn run_command(engine: Arc<VaultEngine>) -> Result<()> {
    let (loop_task, handle) = spawn_sync_loop(Arc::clone(&engine));

    let reader_engine = Arc::clone(&engine);
    let wake = handle.wake.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut accepted = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let item: IncomingItem = match serde_json::from_str(&line) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "skipping malformed input line");
                    continue;
                }
            };
            let receipt = reader_engine.enqueue(item.entity_id, item.collection, item.payload);
            if receipt.queued {
                accepted += 1;
            } else {
                // Full queue: drain now rather than wait out the interval.
                wake.notify_one();
            }
        }
        Ok::<_, std::io::Error>(accepted)
    });

    info!("vault sync running; reading items from stdin");
    let interrupted = tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("interrupt received");
            true
        }
        res = reader => {
            let accepted = res.map_err(|e| anyhow!("stdin reader: {e}"))??;
            info!(accepted, "input closed");
            false
        }
    };

    info!("vault sync stopping");
    let _ = handle.shutdown_tx.send(true);
    loop_task.await.map_err(|e| anyhow!("sync loop: {e}"))?;
    if interrupted {
        // The stdin read is parked on a blocking thread the runtime would
        // otherwise wait for.
        std::process::exit(0);
    }
    Ok(())
}

fn parse_strength(s: &str) -> Result<EncryptionStrength> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| anyhow!("unknown encryption strength {s:?} (standard | maximum)"))
}

fn parse_compliance(s: &str) -> Result<ComplianceMode> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| anyhow!("unknown compliance mode {s:?} (none | audit | strict)"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
