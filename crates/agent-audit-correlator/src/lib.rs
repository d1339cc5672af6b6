#![forbid(unsafe_code)]

//! Thread lifecycle and the parent→child delegation tree.
//!
//! Each thread owns a `manifest.yaml` in its directory; spawns are
//! immutable events under the parent's `spawns/` directory; a global
//! `index.yaml` tracks the root set, per-thread status, and parallel-group
//! membership; `lineage/{root_id}.yaml` holds the reconstructed tree for a
//! root, rebuilt whenever a thread under that root completes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use agent_audit_domain::{
    ensure_non_empty, format_rfc3339, now_utc, SpawnKind, ThreadId, ThreadInfo, ThreadKind,
    ThreadOutcome, ThreadSpawn, ThreadStatus,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MANIFEST_FILE: &str = "manifest.yaml";
const INDEX_FILE: &str = "index.yaml";
const THREADS_DIR: &str = "threads";
const LINEAGE_DIR: &str = "lineage";

// Hard ceiling on ancestry/tree walks. Cycles are never expected, but a
// corrupted manifest must not hang verification.
const MAX_TREE_DEPTH: usize = 1024;

/// Everything needed to create one thread. Optional spawn fields are only
/// meaningful when a parent is present.
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub thread_id: ThreadId,
    pub parent_thread_id: Option<ThreadId>,
    pub thread_kind: ThreadKind,
    pub name: String,
    pub description: Option<String>,
    pub spawn_kind: Option<SpawnKind>,
    pub spawn_reason: Option<String>,
    pub delegated_task: Option<String>,
    pub delegated_context: Option<Value>,
    pub parallel_group_id: Option<String>,
    pub parallel_index: Option<u32>,
}

impl ThreadSpec {
    #[must_use]
    pub fn root(thread_id: ThreadId, thread_kind: ThreadKind, name: &str) -> Self {
        Self {
            thread_id,
            parent_thread_id: None,
            thread_kind,
            name: name.to_string(),
            description: None,
            spawn_kind: None,
            spawn_reason: None,
            delegated_task: None,
            delegated_context: None,
            parallel_group_id: None,
            parallel_index: None,
        }
    }
}

/// One task inside a parallel group.
#[derive(Debug, Clone)]
pub struct ParallelTask {
    pub thread_id: ThreadId,
    pub name: String,
    pub description: Option<String>,
    pub delegated_task: Option<String>,
}

/// Terminal accounting handed over at completion, aggregated by the caller
/// from the thread's logs.
#[derive(Debug, Clone)]
pub struct CompletionStats {
    pub outcome: ThreadOutcome,
    pub error: Option<String>,
    pub transaction_count: u64,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
}

/// Result of `create_thread`: the new manifest plus the spawn event when
/// the creation was a delegation.
#[derive(Debug, Clone)]
pub struct CreatedThread {
    pub info: ThreadInfo,
    pub spawn: Option<ThreadSpawn>,
}

/// Global audit-root index: root set, per-thread status summary, and
/// parallel-group membership. Lazily loaded, rewritten wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditIndex {
    #[serde(default)]
    pub root_thread_ids: Vec<ThreadId>,
    #[serde(default)]
    pub statuses: BTreeMap<String, ThreadStatus>,
    #[serde(default)]
    pub parallel_groups: BTreeMap<String, Vec<ThreadId>>,
}

/// One node of a reconstructed lineage tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineageNode {
    pub thread_id: ThreadId,
    pub name: String,
    pub thread_kind: ThreadKind,
    pub status: ThreadStatus,
    #[serde(default)]
    pub children: Vec<LineageNode>,
}

/// Snapshot persisted as `lineage/{root_id}.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineageSnapshot {
    pub root_thread_id: ThreadId,
    pub generated_at: String,
    pub tree: LineageNode,
}

#[derive(Debug, Clone)]
pub struct ThreadCorrelator {
    root: PathBuf,
}

impl ThreadCorrelator {
    #[must_use]
    pub fn new(audit_root: &Path) -> Self {
        Self {
            root: audit_root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn audit_root(&self) -> &Path {
        &self.root
    }

    /// Directory owning one thread's manifest, chain, and logs.
    #[must_use]
    pub fn thread_dir(&self, thread_id: &ThreadId) -> PathBuf {
        self.root.join(THREADS_DIR).join(thread_id.as_str())
    }

    /// Create a thread: resolve its root through the parent chain, register
    /// it with the parent (idempotently), persist a spawn event when the
    /// creation is a delegation, and update the global index.
    ///
    /// # Errors
    /// Returns an error when the id already exists, the parent is missing,
    /// or any write fails.
    pub fn create_thread(&self, spec: ThreadSpec) -> Result<CreatedThread> {
        ensure_non_empty("thread_id", spec.thread_id.as_str())?;
        ensure_non_empty("name", &spec.name)?;

        if self.load_manifest(&spec.thread_id)?.is_some() {
            return Err(anyhow!("thread {} already exists", spec.thread_id));
        }

        let root_thread_id = match &spec.parent_thread_id {
            None => None,
            Some(parent_id) => {
                let parent = self
                    .load_manifest(parent_id)?
                    .ok_or_else(|| anyhow!("parent thread {parent_id} not found"))?;
                Some(
                    parent
                        .root_thread_id
                        .clone()
                        .unwrap_or_else(|| parent.thread_id.clone()),
                )
            }
        };

        let info = ThreadInfo {
            thread_id: spec.thread_id.clone(),
            parent_thread_id: spec.parent_thread_id.clone(),
            root_thread_id,
            thread_kind: spec.thread_kind,
            name: spec.name.clone(),
            description: spec.description.clone(),
            status: ThreadStatus::Pending,
            created_at: now_utc(),
            started_at: None,
            completed_at: None,
            spawn_kind: spec.spawn_kind,
            spawn_reason: spec.spawn_reason.clone(),
            parallel_group_id: spec.parallel_group_id.clone(),
            parallel_index: spec.parallel_index,
            child_thread_ids: Vec::new(),
            outcome: None,
            error: None,
            transaction_count: 0,
            total_tokens: 0,
            total_duration_ms: 0,
        };
        self.save_manifest(&info)?;

        if let Some(parent_id) = &spec.parent_thread_id {
            let mut parent = self
                .load_manifest(parent_id)?
                .ok_or_else(|| anyhow!("parent thread {parent_id} not found"))?;
            if !parent.child_thread_ids.contains(&spec.thread_id) {
                parent.child_thread_ids.push(spec.thread_id.clone());
                self.save_manifest(&parent)?;
            }
        }

        let spawn = match (&spec.parent_thread_id, spec.spawn_kind) {
            (Some(parent_id), Some(spawn_kind)) => {
                let spawn = ThreadSpawn {
                    parent_thread_id: parent_id.clone(),
                    child_thread_id: spec.thread_id.clone(),
                    spawn_kind,
                    reason: spec.spawn_reason.clone().unwrap_or_default(),
                    delegated_task: spec.delegated_task.clone(),
                    delegated_context: spec.delegated_context.clone(),
                    parallel_group_id: spec.parallel_group_id.clone(),
                    parallel_index: spec.parallel_index,
                    spawned_at: now_utc(),
                };
                let path = self
                    .thread_dir(parent_id)
                    .join("spawns")
                    .join(format!("spawn-{}.yaml", spec.thread_id));
                agent_audit_store::write_yaml(&path, &spawn)
                    .with_context(|| format!("failed to persist spawn of {}", spec.thread_id))?;
                Some(spawn)
            }
            _ => None,
        };

        let mut index = self.load_index()?;
        if spec.parent_thread_id.is_none()
            && !index.root_thread_ids.contains(&spec.thread_id)
        {
            index.root_thread_ids.push(spec.thread_id.clone());
        }
        index
            .statuses
            .insert(spec.thread_id.0.clone(), ThreadStatus::Pending);
        if let Some(group_id) = &spec.parallel_group_id {
            let members = index.parallel_groups.entry(group_id.clone()).or_default();
            if !members.contains(&spec.thread_id) {
                members.push(spec.thread_id.clone());
            }
        }
        self.save_index(&index)?;

        Ok(CreatedThread { info, spawn })
    }

    /// pending → running.
    ///
    /// # Errors
    /// Returns an error when the thread is missing or not pending.
    pub fn start_thread(&self, thread_id: &ThreadId) -> Result<ThreadInfo> {
        let mut info = self
            .load_manifest(thread_id)?
            .ok_or_else(|| anyhow!("thread {thread_id} not found"))?;

        if info.status != ThreadStatus::Pending {
            return Err(anyhow!(
                "invalid transition: thread {thread_id} is {} not pending",
                info.status.as_str()
            ));
        }

        info.status = ThreadStatus::Running;
        info.started_at = Some(now_utc());
        self.save_manifest(&info)?;
        self.update_index_status(&info)?;
        Ok(info)
    }

    /// running → completed/failed/cancelled; rebuilds the root's lineage
    /// snapshot afterwards. No transition out of a terminal state.
    ///
    /// # Errors
    /// Returns an error when the thread is missing, already terminal, or
    /// not running.
    pub fn complete_thread(
        &self,
        thread_id: &ThreadId,
        stats: &CompletionStats,
    ) -> Result<ThreadInfo> {
        let mut info = self
            .load_manifest(thread_id)?
            .ok_or_else(|| anyhow!("thread {thread_id} not found"))?;

        if info.status.is_terminal() {
            return Err(anyhow!(
                "invalid transition: thread {thread_id} is already {}",
                info.status.as_str()
            ));
        }
        if info.status != ThreadStatus::Running {
            return Err(anyhow!(
                "invalid transition: thread {thread_id} is {} not running",
                info.status.as_str()
            ));
        }

        info.status = stats.outcome.terminal_status();
        info.completed_at = Some(now_utc());
        info.outcome = Some(stats.outcome);
        info.error = stats.error.clone();
        info.transaction_count = stats.transaction_count;
        info.total_tokens = stats.total_tokens;
        info.total_duration_ms = stats.total_duration_ms;
        self.save_manifest(&info)?;
        self.update_index_status(&info)?;

        let root_id = info
            .root_thread_id
            .clone()
            .unwrap_or_else(|| info.thread_id.clone());
        self.rebuild_lineage(&root_id)?;

        Ok(info)
    }

    /// Load one manifest (`Ok(None)` when the thread does not exist).
    ///
    /// # Errors
    /// Returns an error when the manifest is malformed.
    pub fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadInfo>> {
        self.load_manifest(thread_id)
    }

    /// `[self, parent, ..., root]`. Terminates at the first missing
    /// manifest and is bounded against cycles.
    ///
    /// # Errors
    /// Returns an error when a manifest on the path is malformed.
    pub fn get_ancestry(&self, thread_id: &ThreadId) -> Result<Vec<ThreadId>> {
        let mut ancestry = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(thread_id.clone());

        while let Some(current) = cursor {
            if !seen.insert(current.clone()) || ancestry.len() >= MAX_TREE_DEPTH {
                break;
            }
            ancestry.push(current.clone());
            cursor = match self.load_manifest(&current)? {
                Some(info) => info.parent_thread_id,
                None => None,
            };
        }

        Ok(ancestry)
    }

    /// Create one child per task under `parent_id`, all sharing
    /// `group_id`, with distinct 0-based parallel indices.
    ///
    /// # Errors
    /// Returns an error when any child creation fails.
    pub fn create_parallel_group(
        &self,
        parent_id: &ThreadId,
        group_id: &str,
        tasks: &[ParallelTask],
    ) -> Result<Vec<CreatedThread>> {
        ensure_non_empty("parallel_group_id", group_id)?;

        let mut created = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let spec = ThreadSpec {
                thread_id: task.thread_id.clone(),
                parent_thread_id: Some(parent_id.clone()),
                thread_kind: ThreadKind::ParallelTask,
                name: task.name.clone(),
                description: task.description.clone(),
                spawn_kind: Some(SpawnKind::Parallel),
                spawn_reason: Some(format!("parallel group {group_id}")),
                delegated_task: task.delegated_task.clone(),
                delegated_context: None,
                parallel_group_id: Some(group_id.to_string()),
                parallel_index: Some(index as u32),
            };
            created.push(self.create_thread(spec)?);
        }
        Ok(created)
    }

    /// Members of a parallel group, sorted by parallel index. Empty when
    /// the group is unknown.
    ///
    /// # Errors
    /// Returns an error when the index or a member manifest is malformed.
    pub fn get_parallel_group(&self, group_id: &str) -> Result<Vec<ThreadInfo>> {
        let index = self.load_index()?;
        let Some(members) = index.parallel_groups.get(group_id) else {
            return Ok(Vec::new());
        };

        let mut infos = Vec::with_capacity(members.len());
        for member in members {
            if let Some(info) = self.load_manifest(member)? {
                infos.push(info);
            }
        }
        infos.sort_by_key(|info| info.parallel_index.unwrap_or(u32::MAX));
        Ok(infos)
    }

    /// Recursive reconstruction of the delegation tree below `root_id`,
    /// defensively bounded against cycles. `Ok(None)` when the root does
    /// not exist.
    ///
    /// # Errors
    /// Returns an error when a manifest is malformed.
    pub fn get_thread_tree(&self, root_id: &ThreadId) -> Result<Option<LineageNode>> {
        let mut seen = BTreeSet::new();
        self.build_tree(root_id, &mut seen, 0)
    }

    /// All root thread ids recorded in the global index.
    ///
    /// # Errors
    /// Returns an error when the index is malformed.
    pub fn get_root_threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.load_index()?.root_thread_ids)
    }

    /// Every thread id with a directory under the audit root, from the
    /// durable listing rather than the index.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be listed.
    pub fn list_threads(&self) -> Result<Vec<ThreadId>> {
        Ok(
            agent_audit_store::list_dirs(&self.root.join(THREADS_DIR))
                .context("failed to list thread directories")?
                .into_iter()
                .map(ThreadId)
                .collect(),
        )
    }

    /// # Errors
    /// Returns an error when the index is malformed.
    pub fn load_index(&self) -> Result<AuditIndex> {
        Ok(agent_audit_store::read_yaml(&self.root.join(INDEX_FILE))
            .context("failed to read audit index")?
            .unwrap_or_default())
    }

    /// Persisted lineage snapshot for a root (`Ok(None)` when never built).
    ///
    /// # Errors
    /// Returns an error when the snapshot is malformed.
    pub fn get_lineage(&self, root_id: &ThreadId) -> Result<Option<LineageSnapshot>> {
        let path = self
            .root
            .join(LINEAGE_DIR)
            .join(format!("{root_id}.yaml"));
        agent_audit_store::read_yaml(&path)
            .with_context(|| format!("failed to read lineage for {root_id}"))
    }

    fn rebuild_lineage(&self, root_id: &ThreadId) -> Result<()> {
        let Some(tree) = self.get_thread_tree(root_id)? else {
            return Ok(());
        };
        let snapshot = LineageSnapshot {
            root_thread_id: root_id.clone(),
            generated_at: format_rfc3339(now_utc())?,
            tree,
        };
        let path = self
            .root
            .join(LINEAGE_DIR)
            .join(format!("{root_id}.yaml"));
        agent_audit_store::write_yaml(&path, &snapshot)
            .with_context(|| format!("failed to write lineage for {root_id}"))?;
        Ok(())
    }

    fn build_tree(
        &self,
        thread_id: &ThreadId,
        seen: &mut BTreeSet<ThreadId>,
        depth: usize,
    ) -> Result<Option<LineageNode>> {
        if depth >= MAX_TREE_DEPTH || !seen.insert(thread_id.clone()) {
            return Ok(None);
        }
        let Some(info) = self.load_manifest(thread_id)? else {
            return Ok(None);
        };

        let mut children = Vec::with_capacity(info.child_thread_ids.len());
        for child_id in &info.child_thread_ids {
            if let Some(child) = self.build_tree(child_id, seen, depth + 1)? {
                children.push(child);
            }
        }

        Ok(Some(LineageNode {
            thread_id: info.thread_id,
            name: info.name,
            thread_kind: info.thread_kind,
            status: info.status,
            children,
        }))
    }

    fn load_manifest(&self, thread_id: &ThreadId) -> Result<Option<ThreadInfo>> {
        let path = self.thread_dir(thread_id).join(MANIFEST_FILE);
        agent_audit_store::read_yaml(&path)
            .with_context(|| format!("failed to read manifest for {thread_id}"))
    }

    fn save_manifest(&self, info: &ThreadInfo) -> Result<()> {
        let path = self.thread_dir(&info.thread_id).join(MANIFEST_FILE);
        agent_audit_store::write_yaml(&path, info)
            .with_context(|| format!("failed to write manifest for {}", info.thread_id))?;
        Ok(())
    }

    fn update_index_status(&self, info: &ThreadInfo) -> Result<()> {
        let mut index = self.load_index()?;
        index
            .statuses
            .insert(info.thread_id.0.clone(), info.status);
        self.save_index(&index)
    }

    fn save_index(&self, index: &AuditIndex) -> Result<()> {
        agent_audit_store::write_yaml(&self.root.join(INDEX_FILE), index)
            .context("failed to write audit index")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompletionStats, ParallelTask, ThreadCorrelator, ThreadSpec,
    };
    use agent_audit_domain::{
        SpawnKind, ThreadId, ThreadKind, ThreadOutcome, ThreadStatus,
    };

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create tempdir: {err}"))
    }

    fn child_spec(id: &str, parent: &ThreadId) -> ThreadSpec {
        ThreadSpec {
            thread_id: ThreadId::new(id),
            parent_thread_id: Some(parent.clone()),
            thread_kind: ThreadKind::SubAgent,
            name: format!("child {id}"),
            description: None,
            spawn_kind: Some(SpawnKind::Delegated),
            spawn_reason: Some("handoff".to_string()),
            delegated_task: Some("investigate".to_string()),
            delegated_context: None,
            parallel_group_id: None,
            parallel_index: None,
        }
    }

    fn success_stats() -> CompletionStats {
        CompletionStats {
            outcome: ThreadOutcome::Success,
            error: None,
            transaction_count: 2,
            total_tokens: 300,
            total_duration_ms: 1500,
        }
    }

    fn make_root(correlator: &ThreadCorrelator, id: &str) -> ThreadId {
        let root_id = ThreadId::new(id);
        let created = correlator.create_thread(ThreadSpec::root(
            root_id.clone(),
            ThreadKind::Pipeline,
            "pipeline run",
        ));
        assert!(created.is_ok());
        root_id
    }

    #[test]
    fn siblings_keep_creation_order_and_share_a_root() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");

        assert!(correlator.create_thread(child_spec("child-a", &root)).is_ok());
        assert!(correlator.create_thread(child_spec("child-b", &root)).is_ok());

        let parent = correlator.get_thread(&root);
        assert!(parent.is_ok());
        match parent {
            Ok(Some(parent)) => assert_eq!(
                parent.child_thread_ids,
                vec![ThreadId::new("child-a"), ThreadId::new("child-b")]
            ),
            _ => unreachable!(),
        }

        for id in ["child-a", "child-b"] {
            let info = correlator.get_thread(&ThreadId::new(id));
            assert!(info.is_ok());
            match info {
                Ok(Some(info)) => {
                    assert_eq!(info.root_thread_id.as_ref(), Some(&root));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn grandchild_resolves_root_through_parent() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");

        assert!(correlator.create_thread(child_spec("child", &root)).is_ok());
        let grandchild = child_spec("grandchild", &ThreadId::new("child"));
        assert!(correlator.create_thread(grandchild).is_ok());

        let info = correlator.get_thread(&ThreadId::new("grandchild"));
        assert!(info.is_ok());
        match info {
            Ok(Some(info)) => assert_eq!(info.root_thread_id.as_ref(), Some(&root)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn ancestry_length_is_depth_plus_one() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        assert!(correlator.create_thread(child_spec("child", &root)).is_ok());
        assert!(correlator
            .create_thread(child_spec("grandchild", &ThreadId::new("child")))
            .is_ok());

        let ancestry = correlator.get_ancestry(&ThreadId::new("grandchild"));
        assert!(ancestry.is_ok());
        match ancestry {
            Ok(ancestry) => {
                assert_eq!(ancestry.len(), 3);
                assert_eq!(ancestry[0], ThreadId::new("grandchild"));
                assert_eq!(ancestry[2], root);
                // The last element has no parent.
                let last = correlator.get_thread(&ancestry[2]);
                assert!(last.is_ok());
                match last {
                    Ok(Some(last)) => assert!(last.is_root()),
                    _ => unreachable!(),
                }
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn ancestry_terminates_on_missing_manifest() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let ancestry = correlator.get_ancestry(&ThreadId::new("ghost"));
        assert!(ancestry.is_ok());
        match ancestry {
            Ok(ancestry) => assert_eq!(ancestry, vec![ThreadId::new("ghost")]),
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn lifecycle_transitions_are_enforced() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");

        // Completing a pending thread is invalid.
        assert!(correlator.complete_thread(&root, &success_stats()).is_err());

        assert!(correlator.start_thread(&root).is_ok());
        // Starting twice is invalid.
        assert!(correlator.start_thread(&root).is_err());

        let completed = correlator.complete_thread(&root, &success_stats());
        assert!(completed.is_ok());
        match completed {
            Ok(info) => {
                assert_eq!(info.status, ThreadStatus::Completed);
                assert_eq!(info.transaction_count, 2);
                assert_eq!(info.total_tokens, 300);
                assert!(info.completed_at.is_some());
            }
            Err(_) => unreachable!(),
        }

        // No transition out of a terminal state.
        assert!(correlator.complete_thread(&root, &success_stats()).is_err());
        assert!(correlator.start_thread(&root).is_err());
    }

    #[test]
    fn failure_outcome_lands_in_failed_status() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        assert!(correlator.start_thread(&root).is_ok());

        let stats = CompletionStats {
            outcome: ThreadOutcome::Failure,
            error: Some("tool crashed".to_string()),
            transaction_count: 1,
            total_tokens: 10,
            total_duration_ms: 50,
        };
        let completed = correlator.complete_thread(&root, &stats);
        assert!(completed.is_ok());
        match completed {
            Ok(info) => {
                assert_eq!(info.status, ThreadStatus::Failed);
                assert_eq!(info.error.as_deref(), Some("tool crashed"));
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn manifest_round_trip_preserves_all_fields() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        let created = correlator.create_thread(child_spec("child", &root));
        assert!(created.is_ok());
        let created = created.unwrap_or_else(|_| unreachable!());

        let reloaded = correlator.get_thread(&ThreadId::new("child"));
        assert!(reloaded.is_ok());
        match reloaded {
            Ok(Some(reloaded)) => assert_eq!(reloaded, created.info),
            _ => unreachable!(),
        }
    }

    #[test]
    fn spawn_event_is_persisted_under_the_parent() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        let created = correlator.create_thread(child_spec("child", &root));
        assert!(created.is_ok());
        let created = created.unwrap_or_else(|_| unreachable!());
        assert!(created.spawn.is_some());

        let spawn_path = correlator
            .thread_dir(&root)
            .join("spawns/spawn-child.yaml");
        assert!(spawn_path.exists());
    }

    #[test]
    fn parallel_group_is_ordered_by_index() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");

        let tasks = vec![
            ParallelTask {
                thread_id: ThreadId::new("p-one"),
                name: "first".to_string(),
                description: None,
                delegated_task: None,
            },
            ParallelTask {
                thread_id: ThreadId::new("p-two"),
                name: "second".to_string(),
                description: None,
                delegated_task: None,
            },
        ];
        let created = correlator.create_parallel_group(&root, "group-7", &tasks);
        assert!(created.is_ok());

        let members = correlator.get_parallel_group("group-7");
        assert!(members.is_ok());
        match members {
            Ok(members) => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].thread_id, ThreadId::new("p-one"));
                assert_eq!(members[0].parallel_index, Some(0));
                assert_eq!(members[1].thread_id, ThreadId::new("p-two"));
                assert_eq!(members[1].parallel_index, Some(1));
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn unknown_parallel_group_is_empty_not_an_error() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let members = correlator.get_parallel_group("nope");
        assert!(members.is_ok());
        match members {
            Ok(members) => assert!(members.is_empty()),
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn completion_rebuilds_the_root_lineage_snapshot() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        assert!(correlator.create_thread(child_spec("child", &root)).is_ok());

        let child_id = ThreadId::new("child");
        assert!(correlator.start_thread(&child_id).is_ok());
        assert!(correlator.complete_thread(&child_id, &success_stats()).is_ok());

        let snapshot = correlator.get_lineage(&root);
        assert!(snapshot.is_ok());
        match snapshot {
            Ok(Some(snapshot)) => {
                assert_eq!(snapshot.root_thread_id, root);
                assert_eq!(snapshot.tree.children.len(), 1);
                assert_eq!(snapshot.tree.children[0].thread_id, child_id);
                assert_eq!(snapshot.tree.children[0].status, ThreadStatus::Completed);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn thread_tree_reflects_nested_children() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        assert!(correlator.create_thread(child_spec("child", &root)).is_ok());
        assert!(correlator
            .create_thread(child_spec("grandchild", &ThreadId::new("child")))
            .is_ok());

        let tree = correlator.get_thread_tree(&root);
        assert!(tree.is_ok());
        match tree {
            Ok(Some(tree)) => {
                assert_eq!(tree.thread_id, root);
                assert_eq!(tree.children.len(), 1);
                assert_eq!(tree.children[0].children.len(), 1);
                assert_eq!(
                    tree.children[0].children[0].thread_id,
                    ThreadId::new("grandchild")
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn duplicate_thread_id_is_rejected() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let _root = make_root(&correlator, "root-1");
        let again = correlator.create_thread(ThreadSpec::root(
            ThreadId::new("root-1"),
            ThreadKind::Pipeline,
            "again",
        ));
        assert!(again.is_err());
    }

    #[test]
    fn durable_listing_sees_every_thread_directory() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root = make_root(&correlator, "root-1");
        assert!(correlator.create_thread(child_spec("child", &root)).is_ok());

        let listed = correlator.list_threads();
        assert!(listed.is_ok());
        match listed {
            Ok(listed) => {
                assert_eq!(listed, vec![ThreadId::new("child"), ThreadId::new("root-1")]);
            }
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn roots_are_tracked_in_the_global_index() {
        let dir = scratch();
        let correlator = ThreadCorrelator::new(dir.path());
        let root_a = make_root(&correlator, "root-a");
        let root_b = make_root(&correlator, "root-b");
        assert!(correlator.create_thread(child_spec("child", &root_a)).is_ok());

        let roots = correlator.get_root_threads();
        assert!(roots.is_ok());
        match roots {
            Ok(roots) => assert_eq!(roots, vec![root_a, root_b]),
            Err(_) => unreachable!(),
        }
    }
}
