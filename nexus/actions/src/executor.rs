use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use shared_event_bus::EventBus;
use shared_logging::truncate;

use crate::bridge::KnowledgeBridge;
use crate::handlers;
use crate::kind::ActionKind;
use crate::policy::PolicyGate;
use crate::result::{ActionResult, ActionStatus, OUTPUT_CAP};

/// Timeout and history knobs.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Deadline applied when the caller provides none.
    pub default_timeout: Duration,
    /// Hard cap on caller-provided deadlines.
    pub max_timeout: Duration,
    /// Results kept in the in-memory ring.
    pub history_ring: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
            history_ring: 200,
        }
    }
}

/// Shared state handed to every handler.
pub struct HandlerContext {
    /// Project root; relative paths resolve against it.
    pub project_root: PathBuf,
    /// Default mutable workspace.
    pub workspace: PathBuf,
    /// Task records file.
    pub tasks_file: PathBuf,
    /// Shared HTTP client.
    pub http: reqwest::Client,
    /// Knowledge bridge, when wired.
    pub knowledge: Option<Arc<dyn KnowledgeBridge>>,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("project_root", &self.project_root)
            .finish_non_exhaustive()
    }
}

/// The typed action dispatcher.
///
/// Every execution—policy denial, unknown action, timeout, success—ends in a
/// terminal [`ActionResult`] appended to the history file and the in-memory
/// ring. The executor never panics or raises past this boundary.
pub struct ActionExecutor {
    gate: RwLock<PolicyGate>,
    ctx: Arc<HandlerContext>,
    history_path: PathBuf,
    recent: Mutex<VecDeque<ActionResult>>,
    config: ExecutorConfig,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("history_path", &self.history_path)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// Creates an executor. Prior history (tail of the JSONL file) is loaded
    /// into the ring; malformed lines are skipped.
    #[must_use]
    pub fn new(
        gate: PolicyGate,
        ctx: HandlerContext,
        history_path: impl Into<PathBuf>,
        config: ExecutorConfig,
    ) -> Self {
        let history_path = history_path.into();
        let recent = load_history_tail(&history_path, config.history_ring);
        Self {
            gate: RwLock::new(gate),
            ctx: Arc::new(ctx),
            history_path,
            recent: Mutex::new(recent),
            config,
            bus: None,
        }
    }

    /// Attaches an event bus; completions emit `action.completed` events.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Current execution mode label.
    #[must_use]
    pub fn execution_mode(&self) -> &'static str {
        self.gate.read().mode().as_str()
    }

    /// Swaps the execution mode at runtime.
    pub fn set_execution_mode(&self, mode: crate::policy::ExecutionMode) {
        self.gate.write().set_mode(mode);
    }

    /// Executes one action to a terminal result.
    pub async fn execute(
        &self,
        action_type: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> ActionResult {
        let started_at = Utc::now();
        let mut result = ActionResult {
            id: action_id(),
            action_type: action_type.to_string(),
            status: ActionStatus::Pending,
            output: String::new(),
            error: None,
            data: Value::Null,
            started_at,
            completed_at: None,
            duration_ms: 0,
            policy_blocked: false,
            objective_success: None,
        };

        let Some(kind) = ActionKind::parse(action_type) else {
            result.status = ActionStatus::Failed;
            result.error = Some(format!("Unknown action type: {action_type}"));
            return self.finalise(result);
        };

        if let Some(violation) = self.policy_violation(kind, &params) {
            result.status = ActionStatus::Failed;
            result.policy_blocked = true;
            result.error = Some(violation);
            return self.finalise(result);
        }

        result.status = ActionStatus::Running;
        let deadline = timeout.map_or(self.config.default_timeout, |t| t.min(self.config.max_timeout));
        let ctx = Arc::clone(&self.ctx);
        let worker = tokio::spawn(async move { handlers::dispatch(&ctx, kind, &params).await });

        match tokio::time::timeout(deadline, worker).await {
            Err(_) => {
                // Deadline hit: the worker task is abandoned.
                result.status = ActionStatus::Timeout;
                result.error = Some(format!("Action timed out after {}s", deadline.as_secs()));
            }
            Ok(Err(join_err)) => {
                result.status = ActionStatus::Failed;
                result.error = Some(format!("handler aborted: {join_err}"));
            }
            Ok(Ok(Ok(output))) => {
                result.status = ActionStatus::Success;
                result.output = output.output;
                result.data = output.data;
                result.objective_success = output.objective_success;
            }
            Ok(Ok(Err(err))) => {
                result.status = ActionStatus::Failed;
                result.policy_blocked = err.is_policy_denied();
                result.error = Some(err.to_string());
            }
        }

        self.finalise(result)
    }

    fn policy_violation(&self, kind: ActionKind, params: &Value) -> Option<String> {
        let gate = self.gate.read();
        if kind.checks_path() {
            if let Some(raw) = params.get("path").and_then(Value::as_str) {
                let path = handlers::resolve_path(&self.ctx, raw);
                if let Err(violation) = gate.check_path(&path, kind) {
                    return Some(violation.to_string());
                }
            }
        }
        if kind == ActionKind::RunShell {
            if let Some(command) = params.get("command").and_then(Value::as_str) {
                if let Err(violation) = gate.check_shell(command) {
                    return Some(violation.to_string());
                }
            }
        }
        None
    }

    fn finalise(&self, mut result: ActionResult) -> ActionResult {
        let completed = Utc::now();
        result.completed_at = Some(completed);
        result.duration_ms = (completed - result.started_at).num_milliseconds().max(0);

        let mut persisted = result.clone();
        persisted.output = truncate(&persisted.output, OUTPUT_CAP);
        let _ = append_history_line(&self.history_path, &persisted);

        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.config.history_ring {
                recent.pop_front();
            }
            recent.push_back(result.clone());
        }

        if let Some(bus) = &self.bus {
            bus.emit(
                "action.completed",
                json!({
                    "id": result.id,
                    "action_type": result.action_type,
                    "status": result.status,
                    "policy_blocked": result.policy_blocked,
                    "duration_ms": result.duration_ms,
                }),
            );
        }

        result
    }

    /// The most recent results, oldest first.
    #[must_use]
    pub fn recent_results(&self, limit: usize) -> Vec<ActionResult> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Execution statistics over the in-memory ring.
    #[must_use]
    pub fn stats(&self) -> Value {
        let recent = self.recent.lock();
        let total = recent.len();
        let success = recent.iter().filter(|r| r.status == ActionStatus::Success).count();
        let failed = recent.iter().filter(|r| r.status == ActionStatus::Failed).count();
        json!({
            "total": total,
            "success": success,
            "failed": failed,
            "success_rate": if total > 0 { success as f64 / total as f64 } else { 0.0 },
            "available_actions": ActionKind::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        })
    }

    /// Registered actions with their categories.
    #[must_use]
    pub fn available_actions() -> Vec<Value> {
        ActionKind::ALL
            .iter()
            .map(|kind| json!({"action": kind.as_str(), "category": kind.category()}))
            .collect()
    }
}

fn action_id() -> String {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let digest = hasher.finalize();
    let tag: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    format!("action_{}_{tag}", now.format("%Y%m%d_%H%M%S"))
}

fn append_history_line(path: &PathBuf, result: &ActionResult) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(result)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

fn load_history_tail(path: &PathBuf, limit: usize) -> VecDeque<ActionResult> {
    let mut ring = VecDeque::with_capacity(limit);
    let Ok(file) = File::open(path) else {
        return ring;
    };
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(result) = serde_json::from_str::<ActionResult>(&line) {
            if ring.len() >= limit {
                ring.pop_front();
            }
            ring.push_back(result);
        }
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExecutionMode;
    use tempfile::tempdir;

    fn executor(root: &std::path::Path, mode: ExecutionMode) -> ActionExecutor {
        let workspace = root.join("workspace");
        let data = root.join("data").join("brain");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&data).unwrap();
        let gate = PolicyGate::new(
            mode,
            vec![workspace.clone(), root.join("data"), root.join("src")],
        );
        let ctx = HandlerContext {
            project_root: root.to_path_buf(),
            workspace,
            tasks_file: data.join("tasks.json"),
            http: reqwest::Client::new(),
            knowledge: None,
        };
        ActionExecutor::new(gate, ctx, data.join("action_history.jsonl"), ExecutorConfig::default())
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);

        let write = executor
            .execute(
                "write_file",
                json!({"path": "workspace/hello.txt", "content": "hello world"}),
                None,
            )
            .await;
        assert_eq!(write.status, ActionStatus::Success);
        assert_eq!(write.data["size"], 11);
        assert_eq!(write.objective_success, Some(true));

        let read = executor
            .execute("read_file", json!({"path": "workspace/hello.txt"}), None)
            .await;
        assert_eq!(read.status, ActionStatus::Success);
        assert!(read.output.contains("hello world"));
        assert!(read.duration_ms >= 0);
    }

    #[tokio::test]
    async fn unknown_action_is_failed_and_persisted() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        let result = executor.execute("nonexistent_action_xyz", json!({}), None).await;
        assert_eq!(result.status, ActionStatus::Failed);
        assert!(result.error.unwrap().contains("Unknown action type"));
        let history = fs::read_to_string(dir.path().join("data/brain/action_history.jsonl")).unwrap();
        assert!(history.contains("nonexistent_action_xyz"));
    }

    #[tokio::test]
    async fn dash_alias_resolves() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        executor
            .execute("write-file", json!({"path": "workspace/a.txt", "content": "x"}), None)
            .await;
        let read = executor
            .execute("read-file", json!({"path": "workspace/a.txt"}), None)
            .await;
        assert_eq!(read.status, ActionStatus::Success);
        assert_eq!(read.action_type, "read-file");
    }

    #[tokio::test]
    async fn safe_mode_read_outside_roots_is_policy_blocked() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::Safe);
        let result = executor
            .execute("read_file", json!({"path": "/tmp/outside_file.txt"}), None)
            .await;
        assert_eq!(result.status, ActionStatus::Failed);
        assert!(result.policy_blocked);
    }

    #[tokio::test]
    async fn dangerous_shell_is_policy_blocked() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        let result = executor
            .execute("run_shell", json!({"command": "rm -rf /"}), None)
            .await;
        assert_eq!(result.status, ActionStatus::Failed);
        assert!(result.policy_blocked);
        assert!(result.error.unwrap().contains("dangerous"));
    }

    #[tokio::test]
    async fn edit_file_replaces_exactly_once() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        executor
            .execute(
                "write_file",
                json!({"path": "workspace/edit.txt", "content": "old text old text"}),
                None,
            )
            .await;
        let edit = executor
            .execute(
                "edit_file",
                json!({"path": "workspace/edit.txt", "old": "old text", "new": "new text"}),
                None,
            )
            .await;
        assert_eq!(edit.status, ActionStatus::Success);
        let read = executor
            .execute("read_file", json!({"path": "workspace/edit.txt"}), None)
            .await;
        assert_eq!(read.output, "new text old text");

        let missing = executor
            .execute(
                "edit_file",
                json!({"path": "workspace/edit.txt", "old": "absent string"}),
                None,
            )
            .await;
        assert_eq!(missing.status, ActionStatus::Failed);
        // The failed edit never wrote.
        let after = executor
            .execute("read_file", json!({"path": "workspace/edit.txt"}), None)
            .await;
        assert_eq!(after.output, "new text old text");
    }

    #[tokio::test]
    async fn delete_then_read_is_not_found() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        executor
            .execute("write_file", json!({"path": "workspace/del.txt", "content": "bye"}), None)
            .await;
        let del = executor
            .execute("delete_file", json!({"path": "workspace/del.txt"}), None)
            .await;
        assert_eq!(del.status, ActionStatus::Success);
        let read = executor
            .execute("read_file", json!({"path": "workspace/del.txt"}), None)
            .await;
        assert_eq!(read.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_yields_timeout_status() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        let result = executor
            .execute(
                "run_shell",
                json!({"command": "sleep 5"}),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(result.status, ActionStatus::Timeout);
    }

    #[tokio::test]
    async fn history_ring_and_stats_track_results() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        executor
            .execute("write_file", json!({"path": "workspace/s.txt", "content": "x"}), None)
            .await;
        executor.execute("nonexistent", json!({}), None).await;
        let stats = executor.stats();
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["success"], 1);
        assert_eq!(stats["failed"], 1);
        let recent = executor.recent_results(10);
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn history_reloads_skipping_malformed_lines() {
        let dir = tempdir().unwrap();
        {
            let executor = executor(dir.path(), ExecutionMode::FullAuto);
            executor
                .execute("write_file", json!({"path": "workspace/h.txt", "content": "x"}), None)
                .await;
        }
        let history = dir.path().join("data/brain/action_history.jsonl");
        let mut file = OpenOptions::new().append(true).open(&history).unwrap();
        file.write_all(b"{malformed\n").unwrap();
        drop(file);
        let reloaded = executor(dir.path(), ExecutionMode::FullAuto);
        assert_eq!(reloaded.recent_results(10).len(), 1);
    }

    #[tokio::test]
    async fn create_task_appends_record() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        let result = executor
            .execute("create_task", json!({"task": "review scan findings"}), None)
            .await;
        assert_eq!(result.status, ActionStatus::Success);
        let tasks: Vec<Value> = serde_json::from_slice(
            &fs::read(dir.path().join("data/brain/tasks.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["priority"], "MEDIUM");
    }

    #[tokio::test]
    async fn analyze_code_counts_structures() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), ExecutionMode::FullAuto);
        executor
            .execute(
                "write_file",
                json!({"path": "workspace/sample.rs", "content": "use std::fs;\npub struct A;\nfn main() {}\n"}),
                None,
            )
            .await;
        let result = executor
            .execute("analyze_code", json!({"path": "workspace/sample.rs"}), None)
            .await;
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(result.data["functions"], 1);
        assert_eq!(result.data["types"], 1);
        assert_eq!(result.data["imports"], 1);
    }
}
