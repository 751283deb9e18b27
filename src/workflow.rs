//! Step Orchestration
//!
//! Runs the sign, build and anchor steps in process and records each run.
//! All session state lives in an [`AppState`] owned by the caller.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::anchor::chain::{AnchorSigner, ChainAnchor};
use crate::anchor::ledger::LedgerClient;
use crate::audit::engine::MerkleEngine;
use crate::batch::{BatchDirectory, BatchSigner};
use crate::config::AppConfig;
use crate::crypto::KeyManager;
use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Sign,
    Build,
    Anchor,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Sign, Step::Build, Step::Anchor];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Sign => "sign",
            Step::Build => "build",
            Step::Anchor => "anchor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub step: Step,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub summary: String,
}

/// Persisted list of past step runs, oldest first
#[derive(Debug, Clone)]
pub struct RunHistory {
    path: PathBuf,
    records: Vec<RunRecord>,
}

impl RunHistory {
    /// Load history from `path`; a missing file is an empty history.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let contents = fs::read(&path).map_err(|e| AuditError::io_at(&path, e))?;
            serde_json::from_slice(&contents).map_err(|e| AuditError::parse_at(&path, e))?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&RunRecord> {
        self.records.last()
    }

    pub fn push(&mut self, record: RunRecord) {
        self.records.push(record);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AuditError::io_at(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(&self.records)?;
        fs::write(&self.path, json).map_err(|e| AuditError::io_at(&self.path, e))
    }
}

/// Session state owned by the caller and passed into every step
pub struct AppState {
    pub config: AppConfig,
    pub password: Option<String>,
    /// Overrides the signer chosen by configuration
    pub anchor_signer: Option<AnchorSigner>,
    pub confirm_anchor: bool,
    pub history: RunHistory,
}

impl AppState {
    /// Validate the full configuration and load the run history. Only the
    /// ledger-facing commands need this; offline ones use `config.storage`.
    pub fn new(config: AppConfig, password: Option<String>) -> Result<Self> {
        config.validate()?;
        let history = RunHistory::load(config.storage.batches().history_file())?;
        Ok(Self {
            config,
            password,
            anchor_signer: None,
            confirm_anchor: true,
            history,
        })
    }

    pub fn batches(&self) -> BatchDirectory {
        self.config.storage.batches()
    }

    pub fn keys(&self) -> KeyManager {
        self.config.storage.keys()
    }
}

pub struct Workflow<C: LedgerClient> {
    client: Arc<C>,
}

impl<C: LedgerClient> Workflow<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Run one step and append its record to the history.
    pub async fn run_step(&self, state: &mut AppState, step: Step) -> Result<String> {
        let started_at = Utc::now();
        info!("Running step {}", step);
        let result = self.execute(state, step).await;

        let (outcome, summary) = match &result {
            Ok(summary) => (RunOutcome::Success, summary.clone()),
            Err(e) => {
                error!("Step {} failed: {}", step, e);
                (RunOutcome::Failure, e.to_string())
            }
        };
        state.history.push(RunRecord {
            id: Uuid::new_v4(),
            step,
            started_at,
            finished_at: Utc::now(),
            outcome,
            summary,
        });
        state.history.save()?;

        result
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run_all(&self, state: &mut AppState) -> Result<Vec<String>> {
        let mut summaries = Vec::with_capacity(Step::ALL.len());
        for step in Step::ALL {
            summaries.push(self.run_step(state, step).await?);
        }
        Ok(summaries)
    }

    async fn execute(&self, state: &AppState, step: Step) -> Result<String> {
        let batches = state.batches();
        let keys = state.keys();
        let password = state.password.as_deref();

        match step {
            Step::Sign => {
                let report = BatchSigner::new(&batches, &keys).sign_with_stored_key(password)?;
                Ok(report.summary())
            }
            Step::Build => {
                let report = MerkleEngine::from_key_store(batches, &keys)?.build_tree()?;
                Ok(format!(
                    "Merkle root {} over {} entries ({} batches, {} skipped)",
                    report.root_hex(),
                    report.leaf_count,
                    report.included.len(),
                    report.skipped.len()
                ))
            }
            Step::Anchor => {
                let ledger = &state.config.ledger;
                let signer = state
                    .anchor_signer
                    .clone()
                    .unwrap_or_else(|| ledger.anchor_signer())
                    .resolve(&keys, password)?;
                let anchor = ChainAnchor::new(self.client.clone(), ledger.program_id()?, signer)
                    .with_retry_policies(
                        state.config.retry.network.policy(),
                        state.config.retry.blockchain.policy(),
                    );
                let record = anchor.anchor_latest(&batches, state.confirm_anchor).await?;
                Ok(format!(
                    "Root {} anchored in transaction {} ({:?})",
                    record.root, record.signature, record.status
                ))
            }
        }
    }
}
