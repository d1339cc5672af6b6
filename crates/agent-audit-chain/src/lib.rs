#![forbid(unsafe_code)]

//! Per-thread append-only hash chain.
//!
//! Every record a thread logs becomes one [`ChainBlock`] whose
//! `previous_hash` is the `content_hash` of the block before it. Blocks are
//! written to two formats side by side: `chain.sig`, a compact
//! `block_id:content_hash` line per block, and `chain.yaml`, the full
//! ordered ledger. The chain is a passive oracle: integrity findings are
//! reported in a [`ChainVerification`], never raised as errors.

use std::path::{Path, PathBuf};

use agent_audit_domain::{format_rfc3339, hash_chained_content, now_utc, ChainBlock};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SIG_FILE: &str = "chain.sig";
const LEDGER_FILE: &str = "chain.yaml";

/// Re-reads the original content for a block so `verify` can recompute its
/// hash from durable storage rather than trusting anything in memory.
pub trait BlockContentLoader {
    /// # Errors
    /// Returns an error when storage for the block cannot be read.
    fn load(&self, block_id: &str) -> Result<Option<Value>>;
}

impl<F> BlockContentLoader for F
where
    F: Fn(&str) -> Result<Option<Value>>,
{
    fn load(&self, block_id: &str) -> Result<Option<Value>> {
        self(block_id)
    }
}

/// Full structured ledger persisted as `chain.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChainLedger {
    #[serde(default)]
    total_blocks: u64,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    blocks: Vec<ChainBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub first_invalid_block: Option<String>,
    pub error: Option<String>,
}

impl ChainVerification {
    fn valid_for(total: u64) -> Self {
        Self {
            valid: true,
            total_blocks: total,
            verified_blocks: total,
            first_invalid_block: None,
            error: None,
        }
    }

    fn invalid_at(total: u64, verified: u64, block_id: &str, error: String) -> Self {
        Self {
            valid: false,
            total_blocks: total,
            verified_blocks: verified,
            first_invalid_block: Some(block_id.to_string()),
            error: Some(error),
        }
    }

    fn fatal(total: u64, error: String) -> Self {
        Self {
            valid: false,
            total_blocks: total,
            verified_blocks: 0,
            first_invalid_block: None,
            error: Some(error),
        }
    }
}

/// Everything after (and including) one block, proving the chain continued
/// unmodified past it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainProof {
    pub block_id: String,
    pub proof_blocks: Vec<ChainBlock>,
    pub final_hash: String,
}

#[derive(Debug, Clone)]
pub struct IntegrityChain {
    sig_path: PathBuf,
    ledger_path: PathBuf,
}

impl IntegrityChain {
    #[must_use]
    pub fn new(thread_dir: &Path) -> Self {
        Self {
            sig_path: thread_dir.join(SIG_FILE),
            ledger_path: thread_dir.join(LEDGER_FILE),
        }
    }

    /// Hash `content` canonically (stable key order, hash fields stripped),
    /// link it to the previous block, and persist it to both ledger formats.
    ///
    /// The two writes are not atomic: a crash between them leaves the
    /// formats inconsistent, which `verify` later reports as fatal.
    ///
    /// # Errors
    /// Returns an error when hashing or either write fails.
    pub fn append(&mut self, block_id: &str, content: &Value) -> Result<ChainBlock> {
        let content_hash = hash_chained_content(content)?;
        let previous_hash = self.last_hash()?;

        let block = ChainBlock {
            block_id: block_id.to_string(),
            content_hash,
            previous_hash,
            appended_at: now_utc(),
        };

        agent_audit_store::append_line(
            &self.sig_path,
            &format!("{}:{}", block.block_id, block.content_hash),
        )
        .with_context(|| format!("failed to append to {}", self.sig_path.display()))?;

        let mut ledger = self.load_ledger()?;
        ledger.blocks.push(block.clone());
        ledger.total_blocks = ledger.blocks.len() as u64;
        ledger.updated_at = Some(format_rfc3339(now_utc())?);
        agent_audit_store::write_yaml(&self.ledger_path, &ledger)
            .with_context(|| format!("failed to write {}", self.ledger_path.display()))?;

        Ok(block)
    }

    /// `content_hash` of the most recent block, from the compact ledger's
    /// last line. `None` for an empty chain.
    ///
    /// # Errors
    /// Returns an error when the compact ledger cannot be read.
    pub fn last_hash(&self) -> Result<Option<String>> {
        let Some(line) = agent_audit_store::read_last_line(&self.sig_path)? else {
            return Ok(None);
        };
        Ok(Some(parse_sig_line(&line)?.1))
    }

    /// Ordered blocks from the full ledger. Empty when no block was ever
    /// appended.
    ///
    /// # Errors
    /// Returns an error when the full ledger is malformed or unreadable.
    pub fn blocks(&self) -> Result<Vec<ChainBlock>> {
        Ok(self.load_ledger()?.blocks)
    }

    /// Walk the chain in order, checking each block's `previous_hash`
    /// against its predecessor's `content_hash`, and, when a loader is
    /// given, recomputing each content hash from durable storage. Stops at
    /// the first mismatch. An empty chain is vacuously valid. A divergence
    /// between the compact and full ledger formats is reported as fatal
    /// rather than trusting either side.
    ///
    /// # Errors
    /// Returns an error only for unreadable/malformed storage; integrity
    /// findings land in the returned report.
    pub fn verify(&self, loader: Option<&dyn BlockContentLoader>) -> Result<ChainVerification> {
        let blocks = self.blocks()?;
        let total = blocks.len() as u64;

        let sig_lines = agent_audit_store::read_lines(&self.sig_path)?;
        if sig_lines.len() != blocks.len() {
            return Ok(ChainVerification::fatal(
                total,
                format!(
                    "ledger formats diverge: {} compact entries vs {} full blocks",
                    sig_lines.len(),
                    blocks.len()
                ),
            ));
        }
        for (line, block) in sig_lines.iter().zip(&blocks) {
            let (line_id, line_hash) = parse_sig_line(line)?;
            if line_id != block.block_id || line_hash != block.content_hash {
                return Ok(ChainVerification::fatal(
                    total,
                    format!(
                        "ledger formats diverge at {}: compact entry {line_id}:{line_hash}",
                        block.block_id
                    ),
                ));
            }
        }

        let mut previous: Option<&str> = None;
        for (index, block) in blocks.iter().enumerate() {
            let verified = index as u64;
            if block.previous_hash.as_deref() != previous {
                return Ok(ChainVerification::invalid_at(
                    total,
                    verified,
                    &block.block_id,
                    format!("broken link at {}", block.block_id),
                ));
            }

            if let Some(loader) = loader {
                let Some(content) = loader.load(&block.block_id)? else {
                    return Ok(ChainVerification::invalid_at(
                        total,
                        verified,
                        &block.block_id,
                        format!("content missing for {}", block.block_id),
                    ));
                };
                let recomputed = hash_chained_content(&content)?;
                if recomputed != block.content_hash {
                    return Ok(ChainVerification::invalid_at(
                        total,
                        verified,
                        &block.block_id,
                        format!("content hash mismatch at {}", block.block_id),
                    ));
                }
            }

            previous = Some(block.content_hash.as_str());
        }

        Ok(ChainVerification::valid_for(total))
    }

    /// The target block plus every later block, or `None` when the block id
    /// is not on the chain.
    ///
    /// # Errors
    /// Returns an error when the full ledger cannot be read.
    pub fn proof(&self, block_id: &str) -> Result<Option<ChainProof>> {
        let blocks = self.blocks()?;
        let Some(start) = blocks.iter().position(|block| block.block_id == block_id) else {
            return Ok(None);
        };

        let proof_blocks: Vec<ChainBlock> = blocks[start..].to_vec();
        let final_hash = match proof_blocks.last() {
            Some(last) => last.content_hash.clone(),
            None => return Ok(None),
        };

        Ok(Some(ChainProof {
            block_id: block_id.to_string(),
            proof_blocks,
            final_hash,
        }))
    }

    fn load_ledger(&self) -> Result<ChainLedger> {
        Ok(agent_audit_store::read_yaml(&self.ledger_path)
            .with_context(|| format!("failed to read {}", self.ledger_path.display()))?
            .unwrap_or_default())
    }
}

fn parse_sig_line(line: &str) -> Result<(String, String)> {
    let (block_id, hash) = line
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("malformed compact ledger line: {line}"))?;
    Ok((block_id.to_string(), hash.to_string()))
}
