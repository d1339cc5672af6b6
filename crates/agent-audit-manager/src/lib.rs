#![forbid(unsafe_code)]

//! Platform-facing façade over the audit trail.
//!
//! An [`AuditManager`] composes a [`ThreadCorrelator`] with per-thread log
//! components (transactions, frames, conversation archive) behind a
//! lock-per-thread registry: components are created on first access for a
//! thread id, guarded by that thread's own mutex, and evicted when the
//! thread completes. The outer registry lock is held only to look up or
//! insert the per-thread handle, never across I/O.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_audit_chain::{ChainProof, ChainVerification, IntegrityChain};
use agent_audit_correlator::{CompletionStats, CreatedThread, ThreadCorrelator, ThreadSpec};
pub use agent_audit_correlator::{LineageNode, ParallelTask};
use agent_audit_domain::{
    LlmInteraction, RecordId, RecordKind, SpawnKind, ThreadId, ThreadInfo, ThreadKind,
    ThreadOutcome,
};
use agent_audit_log::{
    ConversationArchive, FrameLog, FrameRecord, SchemaRef, SequenceCheck, TransactionLog,
    TransactionRecord, TurnRecord,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The three per-thread log components, sharing one hash chain through the
/// thread directory.
#[derive(Debug)]
struct ThreadComponents {
    transactions: TransactionLog,
    frames: FrameLog,
    conversations: ConversationArchive,
}

impl ThreadComponents {
    fn open(thread_dir: &Path, thread_id: &ThreadId) -> Self {
        Self {
            transactions: TransactionLog::new(thread_dir, thread_id.clone()),
            frames: FrameLog::new(thread_dir, thread_id.clone()),
            conversations: ConversationArchive::new(thread_dir, thread_id.clone()),
        }
    }
}

/// Both halves of one recorded LLM round trip: the compact transaction and
/// the verbatim conversation turn.
#[derive(Debug, Clone)]
pub struct LlmAuditRecord {
    pub transaction: TransactionRecord,
    pub turn: TurnRecord,
}

/// Combined integrity report for one thread: the hash-chain walk plus the
/// per-log sequence-contiguity checks. Findings are reported, never raised.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadVerification {
    pub thread_id: ThreadId,
    pub chain: ChainVerification,
    pub transactions: SequenceCheck,
    pub frames: SequenceCheck,
    pub conversations: SequenceCheck,
}

impl ThreadVerification {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.chain.valid
            && self.transactions.contiguous
            && self.frames.contiguous
            && self.conversations.contiguous
    }
}

#[derive(Debug)]
pub struct AuditManager {
    correlator: ThreadCorrelator,
    registry: Mutex<BTreeMap<ThreadId, Arc<Mutex<ThreadComponents>>>>,
}

impl AuditManager {
    #[must_use]
    pub fn new(audit_root: &Path) -> Self {
        Self {
            correlator: ThreadCorrelator::new(audit_root),
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn correlator(&self) -> &ThreadCorrelator {
        &self.correlator
    }

    /// Create a root thread and transition it straight to running; the
    /// platform calls this at the moment execution begins.
    ///
    /// # Errors
    /// Returns an error when the id already exists or a write fails.
    pub fn create_root_thread(
        &self,
        thread_id: ThreadId,
        thread_kind: ThreadKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<ThreadInfo> {
        let mut spec = ThreadSpec::root(thread_id.clone(), thread_kind, name);
        spec.description = description.map(str::to_string);
        self.correlator.create_thread(spec)?;
        self.correlator.start_thread(&thread_id)
    }

    /// Spawn a delegated child under `parent_id`. The delegation is
    /// recorded twice: a spawn event under the parent's directory and a
    /// `spawn` transaction in the parent's own log, so "how did this child
    /// come to exist" is answerable from the parent's log alone.
    ///
    /// # Errors
    /// Returns an error when the parent is missing or any write fails.
    pub fn spawn_child_thread(
        &self,
        parent_id: &ThreadId,
        thread_id: ThreadId,
        name: &str,
        reason: &str,
        delegated_task: Option<&str>,
        delegated_context: Option<Value>,
    ) -> Result<ThreadInfo> {
        let spec = ThreadSpec {
            thread_id: thread_id.clone(),
            parent_thread_id: Some(parent_id.clone()),
            thread_kind: ThreadKind::SubAgent,
            name: name.to_string(),
            description: None,
            spawn_kind: Some(SpawnKind::Delegated),
            spawn_reason: Some(reason.to_string()),
            delegated_task: delegated_task.map(str::to_string),
            delegated_context,
            parallel_group_id: None,
            parallel_index: None,
        };
        let created = self.correlator.create_thread(spec)?;

        if let Some(spawn) = &created.spawn {
            let handle = self.components(parent_id)?;
            let mut components = lock(&handle)?;
            components.transactions.log_spawn(spawn)?;
        }

        self.correlator.start_thread(&thread_id)
    }

    /// Spawn every task in one parallel group under `parent_id` and record
    /// the whole fan-out as a single transaction in the parent's log.
    ///
    /// # Errors
    /// Returns an error when the parent is missing or any write fails.
    pub fn spawn_parallel_group(
        &self,
        parent_id: &ThreadId,
        group_id: &str,
        tasks: &[ParallelTask],
    ) -> Result<Vec<ThreadInfo>> {
        let created = self
            .correlator
            .create_parallel_group(parent_id, group_id, tasks)?;

        let child_ids: Vec<ThreadId> = created
            .iter()
            .map(|child| child.info.thread_id.clone())
            .collect();
        {
            let handle = self.components(parent_id)?;
            let mut components = lock(&handle)?;
            components.transactions.log_parallel_spawn(
                group_id,
                &child_ids,
                &format!("parallel group {group_id}"),
            )?;
        }

        let mut started = Vec::with_capacity(created.len());
        for CreatedThread { info, .. } in created {
            started.push(self.correlator.start_thread(&info.thread_id)?);
        }
        Ok(started)
    }

    /// Record one LLM round trip twice: a compact transaction (lengths,
    /// tool names, tokens) and a verbatim conversation turn. Both land on
    /// the same chain, in that order.
    ///
    /// # Errors
    /// Returns an error when the thread is missing or any write fails.
    pub fn log_llm_interaction(
        &self,
        thread_id: &ThreadId,
        interaction: &LlmInteraction,
    ) -> Result<LlmAuditRecord> {
        let handle = self.components(thread_id)?;
        let mut components = lock(&handle)?;
        let transaction = components.transactions.log_llm_call(interaction)?;
        let turn = components.conversations.archive_turn(interaction)?;
        Ok(LlmAuditRecord { transaction, turn })
    }

    /// # Errors
    /// Returns an error when the thread is missing or the append fails.
    pub fn log_human_interaction(
        &self,
        thread_id: &ThreadId,
        interaction_kind: &str,
        prompt: &str,
        response: &str,
        resolution: Option<&str>,
    ) -> Result<TransactionRecord> {
        let handle = self.components(thread_id)?;
        let mut components = lock(&handle)?;
        components
            .transactions
            .log_human_interaction(interaction_kind, prompt, response, resolution)
    }

    /// # Errors
    /// Returns an error when the thread is missing or the append fails.
    #[allow(clippy::too_many_arguments)]
    pub fn log_stage_frame(
        &self,
        thread_id: &ThreadId,
        stage_name: &str,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
        duration_ms: Option<u64>,
    ) -> Result<FrameRecord> {
        let handle = self.components(thread_id)?;
        let mut components = lock(&handle)?;
        components.frames.log_stage_frame(
            stage_name,
            input,
            output,
            input_schema,
            output_schema,
            duration_ms,
        )
    }

    /// # Errors
    /// Returns an error when the thread is missing or the append fails.
    pub fn log_agent_step(
        &self,
        thread_id: &ThreadId,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
        duration_ms: Option<u64>,
    ) -> Result<FrameRecord> {
        let handle = self.components(thread_id)?;
        let mut components = lock(&handle)?;
        components
            .frames
            .log_agent_step(input, output, input_schema, output_schema, duration_ms)
    }

    /// Complete a running thread: aggregate counts from its own logs
    /// (transaction count, summed durations, token rollup), hand them to
    /// the correlator for the terminal transition, and evict the cached
    /// components.
    ///
    /// # Errors
    /// Returns an error when the thread is missing, not running, or a
    /// write fails.
    pub fn complete_thread(
        &self,
        thread_id: &ThreadId,
        outcome: ThreadOutcome,
        error: Option<&str>,
    ) -> Result<ThreadInfo> {
        let stats = {
            let handle = self.components(thread_id)?;
            let components = lock(&handle)?;

            let mut total_duration_ms = 0_u64;
            let ids = components.transactions.list()?;
            for id in &ids {
                if let Some(record) = components.transactions.get(id)? {
                    total_duration_ms += record.duration_ms.unwrap_or(0);
                }
            }
            let index = components.conversations.index()?;

            CompletionStats {
                outcome,
                error: error.map(str::to_string),
                transaction_count: ids.len() as u64,
                total_tokens: index.total_tokens,
                total_duration_ms,
            }
        };

        let info = self.correlator.complete_thread(thread_id, &stats)?;
        self.evict(thread_id)?;
        Ok(info)
    }

    /// Verify one thread against durable storage: walk the hash chain with
    /// a loader that re-reads each record from disk, then check sequence
    /// contiguity in each log.
    ///
    /// # Errors
    /// Returns an error only for unreadable/malformed storage; integrity
    /// findings land in the returned report.
    pub fn verify_thread(&self, thread_id: &ThreadId) -> Result<ThreadVerification> {
        let handle = self.components(thread_id)?;
        let components = lock(&handle)?;

        let chain = IntegrityChain::new(&self.correlator.thread_dir(thread_id));
        let loader = |block_id: &str| -> Result<Option<Value>> {
            let record_id = RecordId(block_id.to_string());
            match block_kind(block_id) {
                Some(RecordKind::Transaction) => {
                    components.transactions.load_chain_content(&record_id)
                }
                Some(RecordKind::Frame) => components.frames.load_chain_content(&record_id),
                Some(RecordKind::Turn) => {
                    components.conversations.load_chain_content(&record_id)
                }
                None => Ok(None),
            }
        };
        let chain_report = chain.verify(Some(&loader))?;

        Ok(ThreadVerification {
            thread_id: thread_id.clone(),
            chain: chain_report,
            transactions: components.transactions.check_sequences()?,
            frames: components.frames.check_sequences()?,
            conversations: components.conversations.check_sequences()?,
        })
    }

    /// Inclusion proof for one record: the block itself plus every later
    /// block on the thread's chain. `None` when the id is not on the chain.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn prove_record(
        &self,
        thread_id: &ThreadId,
        record_id: &RecordId,
    ) -> Result<Option<ChainProof>> {
        self.ensure_thread(thread_id)?;
        let chain = IntegrityChain::new(&self.correlator.thread_dir(thread_id));
        chain.proof(record_id.as_str())
    }

    /// Every record of one thread in chain order, each paired with its
    /// chain block, as self-describing JSON documents.
    ///
    /// # Errors
    /// Returns an error when storage cannot be read.
    pub fn export_thread(&self, thread_id: &ThreadId) -> Result<Vec<Value>> {
        let handle = self.components(thread_id)?;
        let components = lock(&handle)?;

        let chain = IntegrityChain::new(&self.correlator.thread_dir(thread_id));
        let mut entries = Vec::new();
        for block in chain.blocks()? {
            let record_id = RecordId(block.block_id.clone());
            let record = match block_kind(&block.block_id) {
                Some(RecordKind::Transaction) => {
                    components.transactions.load_chain_content(&record_id)?
                }
                Some(RecordKind::Frame) => components.frames.load_chain_content(&record_id)?,
                Some(RecordKind::Turn) => {
                    components.conversations.load_chain_content(&record_id)?
                }
                None => None,
            };
            entries.push(json!({
                "block": serde_json::to_value(&block)?,
                "record": record,
            }));
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the manifest is malformed.
    pub fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadInfo>> {
        self.correlator.get_thread(thread_id)
    }

    /// # Errors
    /// Returns an error when a manifest on the path is malformed.
    pub fn get_ancestry(&self, thread_id: &ThreadId) -> Result<Vec<ThreadId>> {
        self.correlator.get_ancestry(thread_id)
    }

    /// # Errors
    /// Returns an error when a manifest is malformed.
    pub fn get_thread_tree(&self, root_id: &ThreadId) -> Result<Option<LineageNode>> {
        self.correlator.get_thread_tree(root_id)
    }

    /// # Errors
    /// Returns an error when the index or a manifest is malformed.
    pub fn get_parallel_group(&self, group_id: &str) -> Result<Vec<ThreadInfo>> {
        self.correlator.get_parallel_group(group_id)
    }

    /// # Errors
    /// Returns an error when the index is malformed.
    pub fn get_root_threads(&self) -> Result<Vec<ThreadId>> {
        self.correlator.get_root_threads()
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list_threads(&self) -> Result<Vec<ThreadId>> {
        self.correlator.list_threads()
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list_transactions(&self, thread_id: &ThreadId) -> Result<Vec<RecordId>> {
        let handle = self.components(thread_id)?;
        let components = lock(&handle)?;
        components.transactions.list()
    }

    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn get_transaction(
        &self,
        thread_id: &ThreadId,
        record_id: &RecordId,
    ) -> Result<Option<TransactionRecord>> {
        let handle = self.components(thread_id)?;
        let components = lock(&handle)?;
        components.transactions.get(record_id)
    }

    fn ensure_thread(&self, thread_id: &ThreadId) -> Result<ThreadInfo> {
        self.correlator
            .get_thread(thread_id)?
            .ok_or_else(|| anyhow!("thread {thread_id} not found"))
    }

    /// First access creates the components for a thread id; later accesses
    /// share the same per-thread handle.
    fn components(&self, thread_id: &ThreadId) -> Result<Arc<Mutex<ThreadComponents>>> {
        self.ensure_thread(thread_id)?;
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| anyhow!("audit registry lock poisoned"))?;
        let handle = registry.entry(thread_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(ThreadComponents::open(
                &self.correlator.thread_dir(thread_id),
                thread_id,
            )))
        });
        Ok(Arc::clone(handle))
    }

    fn evict(&self, thread_id: &ThreadId) -> Result<()> {
        self.registry
            .lock()
            .map_err(|_| anyhow!("audit registry lock poisoned"))?
            .remove(thread_id);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("audit component lock poisoned"))
}

fn block_kind(block_id: &str) -> Option<RecordKind> {
    [RecordKind::Transaction, RecordKind::Frame, RecordKind::Turn]
        .into_iter()
        .find(|kind| {
            block_id
                .strip_prefix(kind.id_prefix())
                .is_some_and(|rest| rest.starts_with('-'))
        })
}
