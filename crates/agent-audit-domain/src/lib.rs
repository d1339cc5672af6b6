#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Identifier of one execution thread (pipeline run, delegated sub-agent,
/// parallel task). Callers may supply their own ids; [`ThreadId::generate`]
/// mints a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Ulid::new().to_string().to_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one appended record, derived deterministically from the
/// record kind and 1-based sequence number, e.g. `TXN-000004`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn from_sequence(kind: RecordKind, sequence: u64) -> Self {
        Self(format!("{}-{sequence:06}", kind.id_prefix()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Transaction,
    Frame,
    Turn,
}

impl RecordKind {
    #[must_use]
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Transaction => "TXN",
            Self::Frame => "FRAME",
            Self::Turn => "TURN",
        }
    }

    #[must_use]
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Transaction => "transactions",
            Self::Frame => "frames",
            Self::Turn => "conversations",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Frame => "frame",
            Self::Turn => "turn",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ThreadStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadOutcome {
    Success,
    Failure,
    Cancelled,
}

impl ThreadOutcome {
    #[must_use]
    pub fn terminal_status(self) -> ThreadStatus {
        match self {
            Self::Success => ThreadStatus::Completed,
            Self::Failure => ThreadStatus::Failed,
            Self::Cancelled => ThreadStatus::Cancelled,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Pipeline,
    SubAgent,
    ParallelTask,
}

impl ThreadKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::SubAgent => "sub_agent",
            Self::ParallelTask => "parallel_task",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SpawnKind {
    Delegated,
    Parallel,
}

impl SpawnKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::Parallel => "parallel",
        }
    }
}

/// Current state of one thread, persisted as `manifest.yaml` in the
/// thread's directory. A thread is a root iff `parent_thread_id` is absent;
/// `root_thread_id` is set iff a parent is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadInfo {
    pub thread_id: ThreadId,
    pub parent_thread_id: Option<ThreadId>,
    pub root_thread_id: Option<ThreadId>,
    pub thread_kind: ThreadKind,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ThreadStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
    #[serde(default)]
    pub spawn_kind: Option<SpawnKind>,
    #[serde(default)]
    pub spawn_reason: Option<String>,
    #[serde(default)]
    pub parallel_group_id: Option<String>,
    #[serde(default)]
    pub parallel_index: Option<u32>,
    #[serde(default)]
    pub child_thread_ids: Vec<ThreadId>,
    #[serde(default)]
    pub outcome: Option<ThreadOutcome>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transaction_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_duration_ms: u64,
}

impl ThreadInfo {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_thread_id.is_none()
    }
}

/// Immutable delegation event, persisted once per spawn under the parent's
/// `spawns/` directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadSpawn {
    pub parent_thread_id: ThreadId,
    pub child_thread_id: ThreadId,
    pub spawn_kind: SpawnKind,
    pub reason: String,
    #[serde(default)]
    pub delegated_task: Option<String>,
    #[serde(default)]
    pub delegated_context: Option<Value>,
    #[serde(default)]
    pub parallel_group_id: Option<String>,
    #[serde(default)]
    pub parallel_index: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub spawned_at: DateTimeUtc,
}

/// One hashed, linked entry in a thread's tamper-evident ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainBlock {
    pub block_id: String,
    pub content_hash: String,
    #[serde(default)]
    pub previous_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub appended_at: DateTimeUtc,
}

/// Envelope around one appended record. The hash fields are copied back
/// from the chain at append time and are excluded from the record's own
/// content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record<P> {
    pub record_id: RecordId,
    pub thread_id: ThreadId,
    pub sequence: u64,
    pub kind: RecordKind,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub payload: P,
    #[serde(default)]
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total(self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub result_summary: Option<String>,
}

/// What the execution loop hands over for one LLM round trip. The audit
/// trail records it twice: a compact transaction (lengths only) and a full
/// conversation turn (verbatim text).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmInteraction {
    pub system_prompt: String,
    pub user_message: String,
    pub response: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub stage_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
    Skipped,
}

impl ValidationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            status: ValidationStatus::Skipped,
            errors: Vec::new(),
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error when the value cannot be represented in RFC3339.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not valid RFC3339.
pub fn parse_rfc3339(input: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(input, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value after canonicalization (recursive stable key order,
/// UTF-8 text encoding).
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let canonical = canonicalize_json(value);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hash_bytes(&bytes))
}

/// Canonical content hash for chained documents: strips any top-level
/// `previous_hash` / `content_hash` fields first so a record never hashes
/// its own chain linkage.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_chained_content(value: &Value) -> Result<String> {
    let stripped = strip_hash_fields(value);
    hash_json(&stripped)
}

/// Rewrite every JSON object into sorted-key order so hashing is stable
/// regardless of insertion order.
#[must_use]
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, item)| (key, canonicalize_json(item)))
                .collect();
            let mut out = serde_json::Map::with_capacity(ordered.len());
            for (key, item) in ordered {
                out.insert(key.clone(), item);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

#[must_use]
pub fn strip_hash_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = map.clone();
            out.remove("previous_hash");
            out.remove("content_hash");
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        canonicalize_json, hash_chained_content, hash_json, RecordId, RecordKind, ThreadOutcome,
        ThreadStatus,
    };
    use serde_json::json;

    #[test]
    fn record_id_is_deterministic_for_sequence() {
        assert_eq!(
            RecordId::from_sequence(RecordKind::Transaction, 4).as_str(),
            "TXN-000004"
        );
        assert_eq!(
            RecordId::from_sequence(RecordKind::Turn, 12).as_str(),
            "TURN-000012"
        );
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let left = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let right = json!({"a": {"c": 3, "d": 2}, "b": 1});
        let first = hash_json(&left);
        let second = hash_json(&right);
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => assert_eq!(first, second),
            _ => unreachable!(),
        }
    }

    #[test]
    fn chained_content_hash_excludes_hash_fields() {
        let bare = json!({"payload": "x"});
        let chained = json!({
            "payload": "x",
            "previous_hash": "aaaa",
            "content_hash": "bbbb",
        });
        let first = hash_chained_content(&bare);
        let second = hash_chained_content(&chained);
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => assert_eq!(first, second),
            _ => unreachable!(),
        }
    }

    #[test]
    fn canonicalize_sorts_nested_objects() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": [ {"b": 1, "a": 2} ]});
        let canonical = canonicalize_json(&value);
        let rendered = serde_json::to_string(&canonical);
        assert!(rendered.is_ok());
        match rendered {
            Ok(text) => assert_eq!(text, r#"{"a":[{"a":2,"b":1}],"z":{"x":2,"y":1}}"#),
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(ThreadStatus::Completed.is_terminal());
        assert!(ThreadStatus::Failed.is_terminal());
        assert!(ThreadStatus::Cancelled.is_terminal());
        assert!(!ThreadStatus::Pending.is_terminal());
        assert!(!ThreadStatus::Running.is_terminal());
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(
            ThreadOutcome::Success.terminal_status(),
            ThreadStatus::Completed
        );
        assert_eq!(
            ThreadOutcome::Failure.terminal_status(),
            ThreadStatus::Failed
        );
        assert_eq!(
            ThreadOutcome::Cancelled.terminal_status(),
            ThreadStatus::Cancelled
        );
    }
}
