#![forbid(unsafe_code)]

//! Sequence-numbered append-only record logs, one per `(thread, kind)`.
//!
//! A [`RecordLog`] assigns gapless 1-based sequence numbers, chains every
//! record through the thread's [`IntegrityChain`], and persists one YAML
//! document per record (plus markdown side files for bulky text). Three
//! instantiations cover the trail's vocabulary: raw transactions,
//! schema-validated frames, and full conversation turns.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use agent_audit_chain::IntegrityChain;
use agent_audit_domain::{
    now_utc, LlmInteraction, Record, RecordId, RecordKind, SpawnKind, ThreadId, ThreadSpawn,
    TokenUsage, ToolCall, ValidationReport, ValidationStatus,
};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Generic record log
// ---------------------------------------------------------------------------

/// Outcome of the sequence-contiguity check. Gaps or duplicates are a
/// distinct integrity class from hash-chain breaks: they indicate a crash
/// between sequence assignment and chain append rather than tampering.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SequenceCheck {
    pub contiguous: bool,
    pub record_count: u64,
    pub findings: Vec<String>,
}

/// Append-only store for one record kind in one thread directory.
///
/// Append is read-modify-write (read last hash, compute next sequence,
/// write) with no locking; callers must hold single-writer discipline per
/// thread id.
#[derive(Debug)]
pub struct RecordLog<P> {
    thread_id: ThreadId,
    kind: RecordKind,
    dir: PathBuf,
    chain: IntegrityChain,
    _payload: PhantomData<P>,
}

impl<P> RecordLog<P>
where
    P: Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(thread_dir: &Path, thread_id: ThreadId, kind: RecordKind) -> Self {
        Self {
            thread_id,
            kind,
            dir: thread_dir.join(kind.subdir()),
            chain: IntegrityChain::new(thread_dir),
            _payload: PhantomData,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a record: assign the next sequence, derive the record id,
    /// chain the canonical content, copy the returned hashes back onto the
    /// record, and persist it (plus any side artifacts).
    ///
    /// Sequence assignment and chain append are not atomic with each other;
    /// a crash between them surfaces later via [`RecordLog::check_sequences`].
    ///
    /// # Errors
    /// Returns an error when listing, hashing, or any write fails.
    pub fn append(
        &mut self,
        payload: P,
        duration_ms: Option<u64>,
        artifacts: &[(&str, &str)],
    ) -> Result<Record<P>> {
        let sequence = self.next_sequence()?;
        let record_id = RecordId::from_sequence(self.kind, sequence);

        let mut record = Record {
            record_id: record_id.clone(),
            thread_id: self.thread_id.clone(),
            sequence,
            kind: self.kind,
            recorded_at: now_utc(),
            duration_ms,
            payload,
            previous_hash: None,
            content_hash: None,
        };

        let content = serde_json::to_value(&record)?;
        let block = self.chain.append(record_id.as_str(), &content)?;
        record.previous_hash = block.previous_hash;
        record.content_hash = Some(block.content_hash);

        let path = self.record_path(&record_id);
        agent_audit_store::write_yaml(&path, &record)
            .with_context(|| format!("failed to persist record {record_id}"))?;

        for (suffix, body) in artifacts {
            let artifact = self.dir.join(format!("{record_id}{suffix}.md"));
            agent_audit_store::write_text(&artifact, body)
                .with_context(|| format!("failed to persist artifact for {record_id}"))?;
        }

        Ok(record)
    }

    /// Load one record by id (`Ok(None)` when absent).
    ///
    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn get(&self, record_id: &RecordId) -> Result<Option<Record<P>>> {
        let path = self.record_path(record_id);
        agent_audit_store::read_yaml(&path)
            .with_context(|| format!("failed to read record {record_id}"))
    }

    /// Ordered record ids derived from the durable directory listing, so
    /// the log survives restarts without any in-memory index.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<RecordId>> {
        let prefix = format!("{}-", self.kind.id_prefix());
        let stems = agent_audit_store::list_stems(&self.dir, "yaml")?;
        Ok(stems
            .into_iter()
            .filter(|stem| stem.starts_with(&prefix))
            .map(RecordId)
            .collect())
    }

    /// Stored content for one record in the exact canonical shape that was
    /// hashed at append time, for chain verification against durable state.
    ///
    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn load_chain_content(&self, record_id: &RecordId) -> Result<Option<Value>> {
        let Some(record) = self.get(record_id)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::to_value(&record)?))
    }

    /// Check that stored sequences form the gapless series `1..=N`.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be listed or an id does
    /// not carry a parseable sequence.
    pub fn check_sequences(&self) -> Result<SequenceCheck> {
        let ids = self.list()?;
        let mut sequences = Vec::with_capacity(ids.len());
        for id in &ids {
            sequences.push(parse_sequence(id)?);
        }
        sequences.sort_unstable();

        let mut findings = Vec::new();
        let mut expected = 1_u64;
        for sequence in &sequences {
            match sequence.cmp(&expected) {
                std::cmp::Ordering::Equal => expected += 1,
                std::cmp::Ordering::Greater => {
                    for missing in expected..*sequence {
                        findings.push(format!("missing sequence {missing}"));
                    }
                    expected = sequence + 1;
                }
                std::cmp::Ordering::Less => {
                    findings.push(format!("duplicate sequence {sequence}"));
                }
            }
        }

        Ok(SequenceCheck {
            contiguous: findings.is_empty(),
            record_count: sequences.len() as u64,
            findings,
        })
    }

    fn next_sequence(&self) -> Result<u64> {
        let mut max = 0_u64;
        for id in self.list()? {
            max = max.max(parse_sequence(&id)?);
        }
        Ok(max + 1)
    }

    fn record_path(&self, record_id: &RecordId) -> PathBuf {
        self.dir.join(format!("{record_id}.yaml"))
    }
}

fn parse_sequence(record_id: &RecordId) -> Result<u64> {
    let (_, digits) = record_id
        .as_str()
        .rsplit_once('-')
        .ok_or_else(|| anyhow!("record id without sequence: {record_id}"))?;
    digits
        .parse::<u64>()
        .map_err(|err| anyhow!("record id {record_id} has non-numeric sequence: {err}"))
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Compact transaction payloads: bulky text is recorded as lengths only,
/// with the verbatim text relegated to side artifacts and the conversation
/// archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transaction_type", rename_all = "snake_case")]
pub enum TransactionPayload {
    LlmCall {
        #[serde(default)]
        stage_name: Option<String>,
        system_prompt_chars: u64,
        user_message_chars: u64,
        response_chars: u64,
        thinking_chars: u64,
        tool_call_names: Vec<String>,
        token_usage: TokenUsage,
    },
    Spawn {
        child_thread_id: ThreadId,
        spawn_kind: SpawnKind,
        reason: String,
        #[serde(default)]
        parallel_group_id: Option<String>,
        #[serde(default)]
        parallel_index: Option<u32>,
    },
    ParallelSpawn {
        parallel_group_id: String,
        child_thread_ids: Vec<ThreadId>,
        reason: String,
    },
    HumanInteraction {
        interaction_kind: String,
        prompt_chars: u64,
        response_chars: u64,
        #[serde(default)]
        resolution: Option<String>,
    },
}

pub type TransactionRecord = Record<TransactionPayload>;

#[derive(Debug)]
pub struct TransactionLog {
    inner: RecordLog<TransactionPayload>,
}

impl TransactionLog {
    #[must_use]
    pub fn new(thread_dir: &Path, thread_id: ThreadId) -> Self {
        Self {
            inner: RecordLog::new(thread_dir, thread_id, RecordKind::Transaction),
        }
    }

    /// Record one LLM round trip compactly (lengths, tool names, tokens);
    /// response and thinking text land in markdown side files.
    ///
    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_llm_call(&mut self, interaction: &LlmInteraction) -> Result<TransactionRecord> {
        let payload = TransactionPayload::LlmCall {
            stage_name: interaction.stage_name.clone(),
            system_prompt_chars: interaction.system_prompt.chars().count() as u64,
            user_message_chars: interaction.user_message.chars().count() as u64,
            response_chars: interaction.response.chars().count() as u64,
            thinking_chars: interaction
                .thinking
                .as_ref()
                .map_or(0, |text| text.chars().count() as u64),
            tool_call_names: interaction
                .tool_calls
                .iter()
                .map(|call| call.tool_name.clone())
                .collect(),
            token_usage: interaction.token_usage,
        };

        let mut artifacts: Vec<(&str, &str)> = vec![("-llm", interaction.response.as_str())];
        if let Some(thinking) = interaction.thinking.as_deref() {
            artifacts.push(("-thinking", thinking));
        }

        self.inner
            .append(payload, interaction.duration_ms, &artifacts)
    }

    /// Record a spawn in the parent's own log, referencing the child, so
    /// "how did this child come to exist" is answerable from the parent
    /// alone.
    ///
    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_spawn(&mut self, spawn: &ThreadSpawn) -> Result<TransactionRecord> {
        let payload = TransactionPayload::Spawn {
            child_thread_id: spawn.child_thread_id.clone(),
            spawn_kind: spawn.spawn_kind,
            reason: spawn.reason.clone(),
            parallel_group_id: spawn.parallel_group_id.clone(),
            parallel_index: spawn.parallel_index,
        };
        self.inner.append(payload, None, &[])
    }

    /// Record one parallel fan-out as a single transaction naming every
    /// child in the group.
    ///
    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_parallel_spawn(
        &mut self,
        parallel_group_id: &str,
        child_thread_ids: &[ThreadId],
        reason: &str,
    ) -> Result<TransactionRecord> {
        let payload = TransactionPayload::ParallelSpawn {
            parallel_group_id: parallel_group_id.to_string(),
            child_thread_ids: child_thread_ids.to_vec(),
            reason: reason.to_string(),
        };
        self.inner.append(payload, None, &[])
    }

    /// Record a human escalation (prompt/response as lengths only).
    ///
    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_human_interaction(
        &mut self,
        interaction_kind: &str,
        prompt: &str,
        response: &str,
        resolution: Option<&str>,
    ) -> Result<TransactionRecord> {
        let payload = TransactionPayload::HumanInteraction {
            interaction_kind: interaction_kind.to_string(),
            prompt_chars: prompt.chars().count() as u64,
            response_chars: response.chars().count() as u64,
            resolution: resolution.map(str::to_string),
        };
        self.inner.append(payload, None, &[])
    }

    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn get(&self, record_id: &RecordId) -> Result<Option<TransactionRecord>> {
        self.inner.get(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<RecordId>> {
        self.inner.list()
    }

    /// # Errors
    /// Returns an error when a stored document is malformed.
    pub fn load_chain_content(&self, record_id: &RecordId) -> Result<Option<Value>> {
        self.inner.load_chain_content(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn check_sequences(&self) -> Result<SequenceCheck> {
        self.inner.check_sequences()
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Reference to a schema plus the schema document itself, supplied by the
/// contract system. The document is the minimal shape this trail validates
/// against: a `required` list and per-property primitive `type` names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaRef {
    pub schema_id: String,
    pub document: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Stage,
    AgentStep,
    HumanInteraction,
    Spawn,
}

impl FrameKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::AgentStep => "agent_step",
            Self::HumanInteraction => "human_interaction",
            Self::Spawn => "spawn",
        }
    }
}

/// A schema-validated snapshot of one execution step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramePayload {
    pub frame_kind: FrameKind,
    #[serde(default)]
    pub stage_name: Option<String>,
    #[serde(default)]
    pub input_schema_id: Option<String>,
    #[serde(default)]
    pub output_schema_id: Option<String>,
    pub input: Value,
    pub output: Value,
    pub input_validation: ValidationReport,
    pub output_validation: ValidationReport,
}

pub type FrameRecord = Record<FramePayload>;

#[derive(Debug)]
pub struct FrameLog {
    inner: RecordLog<FramePayload>,
}

impl FrameLog {
    #[must_use]
    pub fn new(thread_dir: &Path, thread_id: ThreadId) -> Self {
        Self {
            inner: RecordLog::new(thread_dir, thread_id, RecordKind::Frame),
        }
    }

    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_stage_frame(
        &mut self,
        stage_name: &str,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
        duration_ms: Option<u64>,
    ) -> Result<FrameRecord> {
        self.log_frame(
            FrameKind::Stage,
            Some(stage_name),
            input,
            output,
            input_schema,
            output_schema,
            duration_ms,
        )
    }

    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_agent_step(
        &mut self,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
        duration_ms: Option<u64>,
    ) -> Result<FrameRecord> {
        self.log_frame(
            FrameKind::AgentStep,
            None,
            input,
            output,
            input_schema,
            output_schema,
            duration_ms,
        )
    }

    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_human_interaction(
        &mut self,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
    ) -> Result<FrameRecord> {
        self.log_frame(
            FrameKind::HumanInteraction,
            None,
            input,
            output,
            input_schema,
            output_schema,
            None,
        )
    }

    /// # Errors
    /// Returns an error when the append fails.
    pub fn log_spawn(
        &mut self,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
    ) -> Result<FrameRecord> {
        self.log_frame(
            FrameKind::Spawn,
            None,
            input,
            output,
            input_schema,
            output_schema,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn log_frame(
        &mut self,
        frame_kind: FrameKind,
        stage_name: Option<&str>,
        input: Value,
        output: Value,
        input_schema: Option<&SchemaRef>,
        output_schema: Option<&SchemaRef>,
        duration_ms: Option<u64>,
    ) -> Result<FrameRecord> {
        let input_validation =
            input_schema.map_or_else(ValidationReport::skipped, |schema| {
                validate_against_schema(&input, &schema.document)
            });
        let output_validation =
            output_schema.map_or_else(ValidationReport::skipped, |schema| {
                validate_against_schema(&output, &schema.document)
            });

        let payload = FramePayload {
            frame_kind,
            stage_name: stage_name.map(str::to_string),
            input_schema_id: input_schema.map(|schema| schema.schema_id.clone()),
            output_schema_id: output_schema.map(|schema| schema.schema_id.clone()),
            input,
            output,
            input_validation,
            output_validation,
        };
        self.inner.append(payload, duration_ms, &[])
    }

    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn get(&self, record_id: &RecordId) -> Result<Option<FrameRecord>> {
        self.inner.get(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<RecordId>> {
        self.inner.list()
    }

    /// # Errors
    /// Returns an error when a stored document is malformed.
    pub fn load_chain_content(&self, record_id: &RecordId) -> Result<Option<Value>> {
        self.inner.load_chain_content(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn check_sequences(&self) -> Result<SequenceCheck> {
        self.inner.check_sequences()
    }
}

/// Check `value` against a schema document: every `required` field must be
/// present, and every present property with a declared primitive `type`
/// must match it. Deliberately not full JSON Schema; the contract system
/// owns that.
#[must_use]
pub fn validate_against_schema(value: &Value, schema: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    let Some(object) = value.as_object() else {
        return ValidationReport {
            status: ValidationStatus::Failed,
            errors: vec!["value is not an object".to_string()],
        };
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            if let Some(name) = field.as_str() {
                if !object.contains_key(name) {
                    errors.push(format!("missing required field: {name}"));
                }
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, spec) in properties {
            let Some(declared) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(actual) = object.get(name) else {
                continue;
            };
            if !primitive_type_matches(actual, declared) {
                errors.push(format!(
                    "field {name} has type {}, expected {declared}",
                    json_type_name(actual)
                ));
            }
        }
    }

    let status = if errors.is_empty() {
        ValidationStatus::Passed
    } else {
        ValidationStatus::Failed
    };
    ValidationReport { status, errors }
}

fn primitive_type_matches(value: &Value, declared: &str) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Conversation archive
// ---------------------------------------------------------------------------

/// One full conversation turn, verbatim. The compact transaction log keeps
/// lengths; this archive keeps the text a human reads when reconstructing
/// what the agent actually said.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnPayload {
    #[serde(default)]
    pub stage_name: Option<String>,
    pub system_prompt: String,
    pub user_message: String,
    pub response: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

pub type TurnRecord = Record<TurnPayload>;

/// Rollup entry per turn in `conversations/index.yaml`, rebuilt wholesale
/// on every archive.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TurnSummary {
    pub record_id: RecordId,
    #[serde(default)]
    pub stage_name: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConversationIndex {
    pub total_turns: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub turns: Vec<TurnSummary>,
}

#[derive(Debug)]
pub struct ConversationArchive {
    inner: RecordLog<TurnPayload>,
}

impl ConversationArchive {
    #[must_use]
    pub fn new(thread_dir: &Path, thread_id: ThreadId) -> Self {
        Self {
            inner: RecordLog::new(thread_dir, thread_id, RecordKind::Turn),
        }
    }

    /// Archive a full turn: YAML record, markdown transcript, and a rebuilt
    /// rollup index.
    ///
    /// # Errors
    /// Returns an error when any write fails.
    pub fn archive_turn(&mut self, interaction: &LlmInteraction) -> Result<TurnRecord> {
        let payload = TurnPayload {
            stage_name: interaction.stage_name.clone(),
            system_prompt: interaction.system_prompt.clone(),
            user_message: interaction.user_message.clone(),
            response: interaction.response.clone(),
            thinking: interaction.thinking.clone(),
            tool_calls: interaction.tool_calls.clone(),
            token_usage: interaction.token_usage,
        };

        let record = self.inner.append(payload, interaction.duration_ms, &[])?;

        let transcript = render_transcript(&record);
        let transcript_path = self
            .inner
            .dir()
            .join(format!("{}.md", record.record_id));
        agent_audit_store::write_text(&transcript_path, &transcript)
            .with_context(|| format!("failed to write transcript for {}", record.record_id))?;

        self.rebuild_index()?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when the stored document is malformed.
    pub fn get(&self, record_id: &RecordId) -> Result<Option<TurnRecord>> {
        self.inner.get(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<RecordId>> {
        self.inner.list()
    }

    /// Current rollup (zeroed default when nothing was archived yet).
    ///
    /// # Errors
    /// Returns an error when the index document is malformed.
    pub fn index(&self) -> Result<ConversationIndex> {
        Ok(
            agent_audit_store::read_yaml(&self.inner.dir().join("index.yaml"))
                .context("failed to read conversation index")?
                .unwrap_or_default(),
        )
    }

    /// # Errors
    /// Returns an error when a stored document is malformed.
    pub fn load_chain_content(&self, record_id: &RecordId) -> Result<Option<Value>> {
        self.inner.load_chain_content(record_id)
    }

    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn check_sequences(&self) -> Result<SequenceCheck> {
        self.inner.check_sequences()
    }

    fn rebuild_index(&self) -> Result<()> {
        let mut turns = Vec::new();
        let mut input_tokens = 0_u64;
        let mut output_tokens = 0_u64;

        for record_id in self.inner.list()? {
            let Some(record) = self.inner.get(&record_id)? else {
                continue;
            };
            input_tokens += record.payload.token_usage.input_tokens;
            output_tokens += record.payload.token_usage.output_tokens;
            turns.push(TurnSummary {
                record_id,
                stage_name: record.payload.stage_name.clone(),
                input_tokens: record.payload.token_usage.input_tokens,
                output_tokens: record.payload.token_usage.output_tokens,
            });
        }

        let index = ConversationIndex {
            total_turns: turns.len() as u64,
            total_input_tokens: input_tokens,
            total_output_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
            turns,
        };
        agent_audit_store::write_yaml(&self.inner.dir().join("index.yaml"), &index)
            .context("failed to rebuild conversation index")?;
        Ok(())
    }
}

fn render_transcript(record: &TurnRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", record.record_id));
    if let Some(stage) = &record.payload.stage_name {
        out.push_str(&format!("stage: {stage}\n\n"));
    }
    out.push_str("## System\n\n");
    out.push_str(&record.payload.system_prompt);
    out.push_str("\n\n## User\n\n");
    out.push_str(&record.payload.user_message);
    if let Some(thinking) = &record.payload.thinking {
        out.push_str("\n\n## Thinking\n\n");
        out.push_str(thinking);
    }
    out.push_str("\n\n## Response\n\n");
    out.push_str(&record.payload.response);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::{
        validate_against_schema, ConversationArchive, FrameLog, SchemaRef, TransactionLog,
        TransactionPayload,
    };
    use agent_audit_domain::{
        LlmInteraction, RecordId, ThreadId, TokenUsage, ValidationStatus,
    };
    use serde_json::json;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create tempdir: {err}"))
    }

    fn interaction(stage: &str) -> LlmInteraction {
        LlmInteraction {
            system_prompt: "You are a careful reviewer.".to_string(),
            user_message: "Summarize the diff.".to_string(),
            response: "The diff renames a module.".to_string(),
            thinking: Some("short diff, low risk".to_string()),
            tool_calls: Vec::new(),
            token_usage: TokenUsage {
                input_tokens: 120,
                output_tokens: 40,
            },
            duration_ms: Some(900),
            stage_name: Some(stage.to_string()),
        }
    }

    #[test]
    fn sequences_start_at_one_and_are_gapless() {
        let dir = scratch();
        let mut log = TransactionLog::new(dir.path(), ThreadId::new("thread-a"));

        for round in 0..3 {
            let logged = log.log_llm_call(&interaction(&format!("stage-{round}")));
            assert!(logged.is_ok());
        }

        let ids = log.list();
        assert!(ids.is_ok());
        match ids {
            Ok(ids) => {
                assert_eq!(
                    ids,
                    vec![
                        RecordId("TXN-000001".to_string()),
                        RecordId("TXN-000002".to_string()),
                        RecordId("TXN-000003".to_string()),
                    ]
                );
            }
            Err(_) => unreachable!(),
        }

        let check = log.check_sequences();
        assert!(check.is_ok());
        match check {
            Ok(check) => {
                assert!(check.contiguous);
                assert_eq!(check.record_count, 3);
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn records_survive_reload_with_equal_fields() {
        let dir = scratch();
        let thread_id = ThreadId::new("thread-a");
        let written = {
            let mut log = TransactionLog::new(dir.path(), thread_id.clone());
            let written = log.log_llm_call(&interaction("review"));
            assert!(written.is_ok());
            written.unwrap_or_else(|_| unreachable!())
        };

        let reopened = TransactionLog::new(dir.path(), thread_id);
        let loaded = reopened.get(&written.record_id);
        assert!(loaded.is_ok());
        match loaded {
            Ok(Some(loaded)) => assert_eq!(loaded, written),
            _ => unreachable!(),
        }
    }

    #[test]
    fn llm_call_records_lengths_not_text() {
        let dir = scratch();
        let mut log = TransactionLog::new(dir.path(), ThreadId::new("thread-a"));
        let record = log.log_llm_call(&interaction("review"));
        assert!(record.is_ok());
        let record = record.unwrap_or_else(|_| unreachable!());

        match record.payload {
            TransactionPayload::LlmCall {
                response_chars,
                thinking_chars,
                token_usage,
                ..
            } => {
                assert_eq!(response_chars, 26);
                assert_eq!(thinking_chars, 20);
                assert_eq!(token_usage.total(), 160);
            }
            _ => unreachable!(),
        }

        // Verbatim response lives in the side artifact, not the record.
        let side = std::fs::read_to_string(
            dir.path().join("transactions/TXN-000001-llm.md"),
        );
        assert!(side.is_ok());
        match side {
            Ok(body) => assert_eq!(body, "The diff renames a module."),
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn sequence_gap_is_reported_as_its_own_finding() {
        let dir = scratch();
        let mut log = TransactionLog::new(dir.path(), ThreadId::new("thread-a"));
        for _ in 0..3 {
            assert!(log.log_llm_call(&interaction("s")).is_ok());
        }

        // Simulate a crash-induced gap by deleting the middle record.
        let removed = std::fs::remove_file(dir.path().join("transactions/TXN-000002.yaml"));
        assert!(removed.is_ok());

        let check = log.check_sequences();
        assert!(check.is_ok());
        match check {
            Ok(check) => {
                assert!(!check.contiguous);
                assert_eq!(check.findings, vec!["missing sequence 2".to_string()]);
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn frame_validation_checks_required_fields_and_types() {
        let schema = SchemaRef {
            schema_id: "stage.input.v1".to_string(),
            document: json!({
                "required": ["task", "attempt"],
                "properties": {
                    "task": {"type": "string"},
                    "attempt": {"type": "integer"},
                }
            }),
        };

        let passing = validate_against_schema(&json!({"task": "fix", "attempt": 1}), &schema.document);
        assert_eq!(passing.status, ValidationStatus::Passed);

        let failing =
            validate_against_schema(&json!({"attempt": "first"}), &schema.document);
        assert_eq!(failing.status, ValidationStatus::Failed);
        assert_eq!(failing.errors.len(), 2);
    }

    #[test]
    fn frame_without_schema_is_skipped_not_failed() {
        let dir = scratch();
        let mut log = FrameLog::new(dir.path(), ThreadId::new("thread-a"));
        let record = log.log_agent_step(json!({"step": 1}), json!({"ok": true}), None, None, None);
        assert!(record.is_ok());
        match record {
            Ok(record) => {
                assert_eq!(
                    record.payload.input_validation.status,
                    ValidationStatus::Skipped
                );
                assert_eq!(
                    record.payload.output_validation.status,
                    ValidationStatus::Skipped
                );
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn archive_rebuilds_token_rollup_index() {
        let dir = scratch();
        let mut archive = ConversationArchive::new(dir.path(), ThreadId::new("thread-a"));

        assert!(archive.archive_turn(&interaction("draft")).is_ok());
        assert!(archive.archive_turn(&interaction("review")).is_ok());

        let index = archive.index();
        assert!(index.is_ok());
        match index {
            Ok(index) => {
                assert_eq!(index.total_turns, 2);
                assert_eq!(index.total_input_tokens, 240);
                assert_eq!(index.total_output_tokens, 80);
                assert_eq!(index.total_tokens, 320);
                assert_eq!(index.turns[0].record_id, RecordId("TURN-000001".to_string()));
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn transcript_markdown_sits_next_to_the_turn() {
        let dir = scratch();
        let mut archive = ConversationArchive::new(dir.path(), ThreadId::new("thread-a"));
        assert!(archive.archive_turn(&interaction("draft")).is_ok());

        let body = std::fs::read_to_string(dir.path().join("conversations/TURN-000001.md"));
        assert!(body.is_ok());
        match body {
            Ok(body) => {
                assert!(body.contains("## System"));
                assert!(body.contains("You are a careful reviewer."));
                assert!(body.contains("## Response"));
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn mixed_logs_share_one_thread_chain() {
        let dir = scratch();
        let thread_id = ThreadId::new("thread-a");
        let mut transactions = TransactionLog::new(dir.path(), thread_id.clone());
        let mut archive = ConversationArchive::new(dir.path(), thread_id);

        assert!(transactions.log_llm_call(&interaction("draft")).is_ok());
        assert!(archive.archive_turn(&interaction("draft")).is_ok());
        assert!(transactions.log_llm_call(&interaction("review")).is_ok());

        let chain = agent_audit_chain::IntegrityChain::new(dir.path());
        let blocks = chain.blocks();
        assert!(blocks.is_ok());
        match blocks {
            Ok(blocks) => {
                let ids: Vec<&str> = blocks.iter().map(|b| b.block_id.as_str()).collect();
                assert_eq!(ids, vec!["TXN-000001", "TURN-000001", "TXN-000002"]);
            }
            Err(_) => unreachable!(),
        }

        let report = chain.verify(None);
        assert!(report.is_ok());
        match report {
            Ok(report) => assert!(report.valid),
            Err(_) => unreachable!(),
        }
    }
}
