use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::fs;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use audit_anchor::audit::entry::{hash_entry, parse_hash, ProcessEntry};
use audit_anchor::audit::proof::{load_proof, verify_against_root, verify_proof};

fn main() {
    let matches = Command::new("verify-proof")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Check a Merkle inclusion proof offline, without the log store")
        .arg(
            Arg::new("proof")
                .short('p')
                .long("proof")
                .value_name("PATH")
                .help("Proof file produced by `audit-anchor prove`")
                .required(true),
        )
        .arg(
            Arg::new("entry")
                .short('e')
                .long("entry")
                .value_name("PATH")
                .help("JSON file holding the log entry to check")
                .required(true),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("HEX")
                .help("Expected (anchored) Merkle root"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let default_level = if quiet {
        "audit_anchor=error,verify_proof=error"
    } else if verbose {
        "audit_anchor=debug,verify_proof=debug"
    } else {
        "audit_anchor=info,verify_proof=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let proof_path = matches.get_one::<String>("proof").map(String::as_str).unwrap_or_default();
    let entry_path = matches.get_one::<String>("entry").map(String::as_str).unwrap_or_default();
    let expected_root = matches.get_one::<String>("root").map(String::as_str);

    match run(Path::new(proof_path), Path::new(entry_path), expected_root, verbose) {
        Ok(()) => {
            if !quiet {
                println!("✓ Inclusion proof verified");
            }
        }
        Err(e) => {
            error!("Proof verification failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(proof_path: &Path, entry_path: &Path, expected_root: Option<&str>, verbose: bool) -> Result<()> {
    info!("Verifying {} against {}", entry_path.display(), proof_path.display());

    let proof = load_proof(proof_path)?;
    let entry_json = fs::read_to_string(entry_path)
        .with_context(|| format!("Failed to read entry {}", entry_path.display()))?;
    let entry: ProcessEntry = serde_json::from_str(&entry_json)
        .with_context(|| format!("Entry {} is not valid JSON", entry_path.display()))?;

    if verbose {
        println!("Entry hash:    {}", hex::encode(hash_entry(&entry)));
        println!("Proof root:    {}", proof.merkle_root);
        println!(
            "Position:      {} of {} ({}#{})",
            proof.entry_position, proof.total_entries, proof.entry.batch_name, proof.entry.index
        );
        println!("Path length:   {}", proof.proof.len());
    }

    match expected_root {
        Some(root_hex) => {
            let root = parse_hash(root_hex)
                .ok_or_else(|| anyhow!("Expected root is not a 32-byte hex digest"))?;
            if !verify_against_root(&entry, &proof, &root) {
                return Err(anyhow!(
                    "Entry is not included under root {} (proof root {})",
                    root_hex,
                    proof.merkle_root
                ));
            }
        }
        None => {
            if !verify_proof(&entry, &proof) {
                return Err(anyhow!("Proof does not resolve to root {}", proof.merkle_root));
            }
        }
    }

    Ok(())
}
