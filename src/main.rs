use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_anchor::anchor::{AnchorSigner, RpcLedgerClient};
use audit_anchor::audit::entry::{hash_entry, parse_hash, ProcessEntry};
use audit_anchor::audit::proof::{load_proof, verify_against_root, verify_proof};
use audit_anchor::audit::{MerkleEngine, ProofService};
use audit_anchor::batch::BatchSigner;
use audit_anchor::config::{AppConfig, StorageConfig};
use audit_anchor::workflow::{AppState, RunHistory, RunOutcome, Step, Workflow};

#[derive(Parser)]
#[command(name = "audit-anchor")]
#[command(about = "Sign audit log batches, commit them to a Merkle root and anchor it on a ledger")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./audit-anchor.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the log batch directory
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Override the endpoint key directory
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    /// Password for the encrypted endpoint key
    #[arg(long, global = true, env = "AUDIT_ANCHOR_KEY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the endpoint Ed25519 keypair
    GenerateKeypair {
        /// Encrypt the private key with --password
        #[arg(long)]
        encrypt: bool,
        /// Replace an existing private key
        #[arg(long)]
        force: bool,
    },
    /// Sign every unsigned batch
    Sign,
    /// Verify one batch against its detached signature
    VerifyBatch {
        /// Batch file name, e.g. batch_001.json
        name: String,
    },
    /// Build the Merkle tree over all valid batches and persist the root
    BuildTree,
    /// Locate an entry in the batch store
    Find {
        /// JSON file holding the entry
        entry: PathBuf,
    },
    /// Generate and save an inclusion proof for an entry
    Prove {
        /// JSON file holding the entry
        entry: PathBuf,
        /// File name for the proof under the proofs directory
        #[arg(long)]
        out: Option<String>,
    },
    /// Verify an inclusion proof
    Verify {
        proof: PathBuf,
        entry: PathBuf,
        /// Expected Merkle root, hex encoded
        #[arg(long)]
        root: Option<String>,
    },
    /// Anchor the latest Merkle root on the ledger
    Anchor {
        /// Pay and sign with this wallet keypair instead of the endpoint key
        #[arg(long)]
        wallet: Option<PathBuf>,
        /// Return once the transaction is sent
        #[arg(long)]
        no_confirm: bool,
    },
    /// Sign, build and anchor in sequence
    Run {
        #[arg(long)]
        wallet: Option<PathBuf>,
        #[arg(long)]
        no_confirm: bool,
    },
    /// Show recorded step runs
    History {
        /// Number of most recent runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_anchor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli {
        config: config_path,
        logs_dir,
        key_dir,
        password,
        command,
    } = Cli::parse();

    // Loaded per command: `verify` runs without any configuration
    let load_config = || -> Result<AppConfig> {
        let mut config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
        if let Some(logs_dir) = &logs_dir {
            config.storage.logs_dir = logs_dir.clone();
        }
        if let Some(key_dir) = &key_dir {
            config.storage.key_dir = key_dir.clone();
        }
        Ok(config)
    };

    match command {
        Commands::GenerateKeypair { encrypt, force } => {
            let storage = load_config()?.storage;
            let password = if encrypt {
                Some(
                    password
                        .as_deref()
                        .filter(|p| !p.is_empty())
                        .ok_or_else(|| anyhow!("--encrypt requires --password or AUDIT_ANCHOR_KEY_PASSWORD"))?,
                )
            } else {
                None
            };
            let keys = storage.keys();
            let key = keys.generate_and_store(password, force)?;
            println!("✓ Generated Ed25519 keypair in {}", keys.key_dir().display());
            println!("  Public key: {}", hex::encode(key.verifying_key().as_bytes()));
            if encrypt {
                println!("  Private key is encrypted");
            } else {
                warn!("Private key stored unencrypted");
            }
        }
        Commands::Sign => {
            let storage = load_config()?.storage;
            let batches = storage.batches();
            let keys = storage.keys();
            let report = BatchSigner::new(&batches, &keys).sign_with_stored_key(password.as_deref())?;
            println!("✓ {}", report.summary());
            for (name, reason) in &report.failed {
                println!("  ✗ {}: {}", name, reason);
            }
        }
        Commands::VerifyBatch { name } => {
            let storage = load_config()?.storage;
            let batches = storage.batches();
            let keys = storage.keys();
            if BatchSigner::new(&batches, &keys).verify_batch(&name)? {
                println!("✓ Signature valid for {}", name);
            } else {
                println!("✗ Signature invalid for {}", name);
                std::process::exit(1);
            }
        }
        Commands::BuildTree => {
            let storage = load_config()?.storage;
            let report = MerkleEngine::from_key_store(storage.batches(), &storage.keys())?.build_tree()?;
            println!("✓ Merkle root: {}", report.root_hex());
            println!("  Leaves: {}", report.leaf_count);
            println!("  Batches included: {}", report.included.len());
            for skipped in &report.skipped {
                println!("  Skipped {}: {}", skipped.name, skipped.reason);
            }
            println!("  Root written to {}", report.root_file.display());
        }
        Commands::Find { entry } => {
            let entry = read_entry(&entry)?;
            let service = proof_service(&load_config()?.storage)?;
            match service.find_entry(&entry)? {
                Some(locator) => {
                    println!("✓ Found in {} at index {}", locator.batch_name, locator.index);
                }
                None => {
                    println!("✗ Entry not found");
                    std::process::exit(1);
                }
            }
        }
        Commands::Prove { entry, out } => {
            let entry = read_entry(&entry)?;
            let service = proof_service(&load_config()?.storage)?;
            let proof = service.generate_proof(&entry)?;
            let path = service.save_proof(&proof, out.as_deref())?;
            println!("✓ Proof for {}#{} saved to {}", proof.entry.batch_name, proof.entry.index, path.display());
            println!("  Merkle root: {}", proof.merkle_root);
        }
        Commands::Verify { proof, entry, root } => {
            verify_command(&proof, &entry, root.as_deref())?;
        }
        Commands::Anchor { wallet, no_confirm } => {
            let mut state = AppState::new(load_config()?, password)?;
            configure_anchor(&mut state, wallet, no_confirm);
            let workflow = Workflow::new(ledger_client(&state.config)?);
            let summary = workflow.run_step(&mut state, Step::Anchor).await?;
            println!("✓ {}", summary);
        }
        Commands::Run { wallet, no_confirm } => {
            let mut state = AppState::new(load_config()?, password)?;
            configure_anchor(&mut state, wallet, no_confirm);
            let workflow = Workflow::new(ledger_client(&state.config)?);
            for summary in workflow.run_all(&mut state).await? {
                println!("✓ {}", summary);
            }
        }
        Commands::History { limit } => {
            let history = RunHistory::load(load_config()?.storage.batches().history_file())?;
            let records = history.records();
            if records.is_empty() {
                println!("No runs recorded in {}", history.path().display());
            }
            for record in records.iter().rev().take(limit).rev() {
                let mark = match record.outcome {
                    RunOutcome::Success => "✓",
                    RunOutcome::Failure => "✗",
                };
                println!(
                    "{} {} {:<6} {}",
                    mark,
                    record.started_at.format("%Y-%m-%d %H:%M:%S"),
                    record.step,
                    record.summary
                );
            }
        }
    }

    Ok(())
}

fn read_entry(path: &Path) -> Result<ProcessEntry> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read entry {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Entry {} is not valid JSON", path.display()))
}

fn verify_command(proof: &Path, entry: &Path, root: Option<&str>) -> Result<()> {
    let entry = read_entry(entry)?;
    let proof = load_proof(proof)?;
    let valid = match root {
        Some(root_hex) => {
            let root = parse_hash(root_hex).ok_or_else(|| anyhow!("--root is not a 32-byte hex digest"))?;
            verify_against_root(&entry, &proof, &root)
        }
        None => verify_proof(&entry, &proof),
    };
    if valid {
        println!("✓ Proof valid for root {}", proof.merkle_root);
    } else {
        println!("✗ Proof invalid (entry hash {})", hex::encode(hash_entry(&entry)));
        std::process::exit(1);
    }
    Ok(())
}

fn proof_service(storage: &StorageConfig) -> Result<ProofService> {
    let engine = MerkleEngine::from_key_store(storage.batches(), &storage.keys())?;
    Ok(ProofService::new(engine))
}

fn configure_anchor(state: &mut AppState, wallet: Option<PathBuf>, no_confirm: bool) {
    if let Some(wallet) = wallet {
        state.anchor_signer = Some(AnchorSigner::Wallet(wallet));
    }
    state.confirm_anchor = !no_confirm;
}

fn ledger_client(config: &AppConfig) -> Result<RpcLedgerClient> {
    info!("Using ledger RPC endpoint {}", config.ledger.rpc_url);
    Ok(RpcLedgerClient::new(&config.ledger.rpc_url, &config.ledger.commitment)?)
}
