use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::EventBus;
use tokio::process::Command;

use nexus_learning::SkillTracker;
use nexus_memory::{load_json_or_default, save_json_atomic, LearningEvent, StorageV2};

use crate::analyzer::{Analysis, FeedbackSink, LearningAnalyzer};
use crate::shellcheck::split_args;
use crate::task::{LoopTask, TaskAction, TaskPriority, TaskStatus};
use crate::verifier::TargetVerifier;

/// Marker carrying the structured `result` value out of `run_python` tasks.
const RESULT_MARKER: &str = "__NEXUS_RESULT__:";
/// Completed tasks retained on disk.
const COMPLETED_CAP: usize = 100;

/// Summary of one loop cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CycleResult {
    /// Tasks processed this cycle (0 or 1).
    pub tasks_processed: usize,
    /// Learnings extracted.
    pub learnings: usize,
    /// Improvement suggestions generated.
    pub improvements: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoopStateFile {
    #[serde(default)]
    pending_tasks: Vec<LoopTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

/// The autonomous task loop: priority queue driving Execute → Verify →
/// Analyse → Learn, with retry semantics and persisted state.
pub struct AutonomousLoop {
    queue: Mutex<Vec<LoopTask>>,
    completed: Mutex<Vec<LoopTask>>,
    verifier: TargetVerifier,
    analyzer: LearningAnalyzer,
    storage: Arc<StorageV2>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    skills: Option<Arc<SkillTracker>>,
    bus: Option<Arc<EventBus>>,
    state_path: PathBuf,
    completed_path: PathBuf,
    project_root: PathBuf,
}

impl std::fmt::Debug for AutonomousLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomousLoop")
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

impl AutonomousLoop {
    /// Creates the loop, restoring any queued tasks from disk (restored
    /// tasks are reset to pending).
    pub fn new(
        verifier: TargetVerifier,
        analyzer: LearningAnalyzer,
        storage: Arc<StorageV2>,
        state_path: impl Into<PathBuf>,
        completed_path: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        let state_path = state_path.into();
        let state: LoopStateFile = load_json_or_default(&state_path);
        let queue = state
            .pending_tasks
            .into_iter()
            .map(|mut task| {
                task.status = TaskStatus::Pending;
                task
            })
            .collect();
        Self {
            queue: Mutex::new(queue),
            completed: Mutex::new(Vec::new()),
            verifier,
            analyzer,
            storage,
            feedback: None,
            skills: None,
            bus: None,
            state_path,
            completed_path: completed_path.into(),
            project_root: project_root.into(),
        }
    }

    /// Attaches a feedback sink.
    #[must_use]
    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// Attaches a skill tracker; each executed task records a skill run.
    #[must_use]
    pub fn with_skills(mut self, skills: Arc<SkillTracker>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Attaches an event bus; task completions emit `loop.task_completed`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Enqueues a task, keeping the queue ordered by priority.
    pub fn add_task(
        &self,
        name: &str,
        description: &str,
        action: TaskAction,
        params: Value,
        priority: TaskPriority,
    ) -> LoopTask {
        let task = {
            let mut queue = self.queue.lock();
            let task = LoopTask::new(
                format!("task_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), queue.len()),
                name,
                description,
                action,
                params,
                priority,
            );
            let position = queue
                .iter()
                .position(|t| task.priority < t.priority)
                .unwrap_or(queue.len());
            queue.insert(position, task.clone());
            task
        };
        self.save_state();
        task
    }

    /// Enqueues a high-priority verification task for a URL or file.
    pub fn add_verification_task(&self, target: &str, is_url: bool) -> LoopTask {
        let head: String = target.chars().take(50).collect();
        if is_url {
            self.add_task(
                &format!("Verify URL: {head}"),
                &format!("Verify and probe {target}"),
                TaskAction::VerifyUrl,
                json!({"url": target}),
                TaskPriority::High,
            )
        } else {
            self.add_task(
                &format!("Verify File: {head}"),
                &format!("Verify local file {target}"),
                TaskAction::VerifyFile,
                json!({"file_path": target}),
                TaskPriority::High,
            )
        }
    }

    /// Executes one task to a result, applying retry semantics.
    pub async fn execute_task(&self, task: &mut LoopTask) -> Value {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());

        let result = match self.dispatch(task).await {
            Ok(result) => result,
            Err(error) => json!({"success": false, "error": error}),
        };
        let success = result.get("success").and_then(Value::as_bool).unwrap_or(false);

        task.result = result.clone();
        task.completed_at = Some(Utc::now());
        if let Some(skills) = &self.skills {
            let duration_ms = task
                .started_at
                .map_or(0.0, |started| (Utc::now() - started).num_milliseconds().max(0) as f64);
            skills.record_execution(task.action.as_str(), duration_ms, success);
        }
        if success {
            task.status = TaskStatus::Completed;
        } else {
            task.retry_count += 1;
            task.status = if task.retry_count < task.max_retries {
                TaskStatus::Pending
            } else {
                TaskStatus::Failed
            };
        }
        result
    }

    async fn dispatch(&self, task: &mut LoopTask) -> Result<Value, String> {
        match task.action {
            TaskAction::VerifyUrl => {
                let url = str_param(&task.params, "url")?;
                let outcome = self.verifier.verify_url(&url, &task.id).await;
                task.verification = json!(outcome);
                Ok(json!({"success": outcome.success, "output": outcome}))
            }
            TaskAction::VerifyFile => {
                let raw = str_param(&task.params, "file_path")?;
                let path = PathBuf::from(&raw);
                let path = if path.is_absolute() {
                    path
                } else {
                    self.project_root.join(path)
                };
                let outcome = self.verifier.verify_file(&path, &task.id);
                task.verification = json!(outcome);
                Ok(json!({"success": outcome.success, "output": outcome}))
            }
            TaskAction::RunCommand => {
                let command = str_param(&task.params, "command")?;
                let args = split_args(&command).map_err(|e| e.to_string())?;
                let timeout = task
                    .params
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(60);
                let mut process = Command::new(&args[0]);
                process
                    .args(&args[1..])
                    .current_dir(&self.project_root)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                let output = tokio::time::timeout(StdDuration::from_secs(timeout), process.output())
                    .await
                    .map_err(|_| format!("command timed out after {timeout}s"))?
                    .map_err(|e| e.to_string())?;
                Ok(json!({
                    "success": output.status.success(),
                    "output": {
                        "stdout": String::from_utf8_lossy(&output.stdout),
                        "stderr": String::from_utf8_lossy(&output.stderr),
                    },
                }))
            }
            TaskAction::RunPython => {
                let code = str_param(&task.params, "code")?;
                let wrapped = format!(
                    "{code}\n\n\
                     import json as __nexus_json\n\
                     import sys as __nexus_sys\n\
                     __nexus_value = globals().get('result', 'Executed')\n\
                     try:\n\
                     \x20   __nexus_sys.stdout.write('\\n{RESULT_MARKER}' + __nexus_json.dumps(__nexus_value, default=str))\n\
                     except Exception:\n\
                     \x20   __nexus_sys.stdout.write('\\n{RESULT_MARKER}' + __nexus_json.dumps(str(__nexus_value)))\n"
                );
                let output = tokio::time::timeout(
                    StdDuration::from_secs(30),
                    Command::new("python3")
                        .arg("-c")
                        .arg(wrapped)
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .output(),
                )
                .await
                .map_err(|_| "python timed out after 30s".to_string())?
                .map_err(|e| e.to_string())?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(if stderr.trim().is_empty() {
                        format!("Python exited with {}", output.status)
                    } else {
                        stderr.trim().to_string()
                    });
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                let value = stdout.rfind(RESULT_MARKER).map_or_else(
                    || Value::String("Executed".into()),
                    |pos| {
                        let payload = stdout[pos + RESULT_MARKER.len()..].trim();
                        serde_json::from_str(payload)
                            .unwrap_or_else(|_| Value::String(payload.to_string()))
                    },
                );
                Ok(json!({"success": true, "output": value}))
            }
            TaskAction::LearnFromInput => {
                let content = str_param(&task.params, "content")?;
                let input_type = task
                    .params
                    .get("input_type")
                    .and_then(Value::as_str)
                    .unwrap_or("general");
                let value_score = task
                    .params
                    .get("value_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5);
                let mut event = LearningEvent::new("loop", input_type, content.clone());
                event.value = value_score.clamp(0.0, 1.0);
                event.confidence = 0.5;
                let id = self
                    .storage
                    .record_learning_event(event)
                    .map_err(|e| e.to_string())?;
                Ok(json!({"success": true, "output": {"event_id": id}}))
            }
            TaskAction::Unknown => Err("Unknown action".to_string()),
        }
    }

    /// Verifies and learns from a finished task.
    pub async fn verify_and_learn(&self, task: &mut LoopTask) -> Analysis {
        let execution_success = task
            .result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        task.status = TaskStatus::Verifying;

        let verification = if task.verification.is_null() {
            json!({"success": execution_success})
        } else {
            task.verification.clone()
        };
        let analysis = self.analyzer.analyze_result(task, &verification).await;

        task.status = TaskStatus::Learning;
        for learning in &analysis.learnings {
            task.learnings.push(learning.content.clone());
        }

        if let Some(feedback) = &self.feedback {
            let action = task.action.as_str();
            if execution_success {
                feedback.record_approval(action, json!({"task_id": task.id}));
            } else {
                let reason = task
                    .result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                feedback.record_denial(action, reason, json!({"task_id": task.id}));
            }
        }

        // Completed tasks keep their terminal status after learning.
        task.status = if execution_success {
            TaskStatus::Completed
        } else if task.retry_count < task.max_retries {
            TaskStatus::Pending
        } else {
            TaskStatus::Failed
        };
        analysis
    }

    /// Runs one cycle: pop the highest-priority task, execute, verify,
    /// learn, and archive (or re-queue on retry).
    pub async fn run_single_cycle(&self) -> CycleResult {
        let Some(mut task) = ({
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        }) else {
            return CycleResult::default();
        };
        self.save_state();

        self.execute_task(&mut task).await;
        let analysis = self.verify_and_learn(&mut task).await;
        let learnings = analysis.learnings.len();
        let improvements = LearningAnalyzer::improvement_suggestions(&analysis).len();

        if task.status == TaskStatus::Pending {
            // Retry: back into the queue at its priority position.
            let mut queue = self.queue.lock();
            let position = queue
                .iter()
                .position(|t| task.priority < t.priority)
                .unwrap_or(queue.len());
            queue.insert(position, task);
            drop(queue);
            self.save_state();
        } else {
            if let Some(bus) = &self.bus {
                bus.emit(
                    "loop.task_completed",
                    json!({"task_id": task.id, "status": task.status}),
                );
            }
            let mut completed = self.completed.lock();
            completed.push(task);
            if completed.len() > COMPLETED_CAP {
                let excess = completed.len() - COMPLETED_CAP;
                completed.drain(..excess);
            }
            let snapshot = completed.clone();
            drop(completed);
            let _ = save_json_atomic(&self.completed_path, &snapshot);
        }

        CycleResult {
            tasks_processed: 1,
            learnings,
            improvements,
        }
    }

    /// Runs cycles until `shutdown` is set, idling briefly when the queue is
    /// empty.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            let cycle = self.run_single_cycle().await;
            let idle = cycle.tasks_processed == 0;
            let pause = if idle { 1000 } else { 100 };
            let mut waited = 0;
            while waited < pause {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                waited += 50;
            }
        }
    }

    /// Pending task count.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Completed task count (this process).
    #[must_use]
    pub fn completed_tasks(&self) -> usize {
        self.completed.lock().len()
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> Value {
        let completed = self.completed.lock();
        let success = completed
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        json!({
            "pending_tasks": self.queue.lock().len(),
            "completed_tasks": completed.len(),
            "success_rate": if completed.is_empty() { 0.0 } else { success as f64 / completed.len() as f64 },
            "last_updated": Utc::now(),
        })
    }

    fn save_state(&self) {
        let snapshot = LoopStateFile {
            pending_tasks: self.queue.lock().clone(),
            last_updated: Some(Utc::now()),
        };
        let _ = save_json_atomic(&self.state_path, &snapshot);
    }
}

fn str_param(params: &Value, name: &str) -> Result<String, String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .ok_or_else(|| format!("{name} parameter required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_memory::NexusPaths;
    use tempfile::tempdir;

    fn build_loop(root: &std::path::Path) -> AutonomousLoop {
        let paths = NexusPaths::new(root);
        paths.ensure().unwrap();
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        AutonomousLoop::new(
            TargetVerifier::new().unwrap(),
            LearningAnalyzer::new(),
            storage,
            paths.loop_state_file(),
            paths.completed_tasks_file(),
            root,
        )
    }

    #[test]
    fn queue_preserves_priority_order() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        autonomous.add_task("low", "d", TaskAction::VerifyFile, Value::Null, TaskPriority::Low);
        autonomous.add_task("critical", "d", TaskAction::VerifyFile, Value::Null, TaskPriority::Critical);
        autonomous.add_task("medium", "d", TaskAction::VerifyFile, Value::Null, TaskPriority::Medium);
        let queue = autonomous.queue.lock();
        let names: Vec<&str> = queue.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["critical", "medium", "low"]);
    }

    #[tokio::test]
    async fn verify_file_task_succeeds_for_existing_file() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        std::fs::write(dir.path().join("target.html"), "<html/>").unwrap();
        autonomous.add_verification_task("target.html", false);
        let cycle = autonomous.run_single_cycle().await;
        assert_eq!(cycle.tasks_processed, 1);
        assert!(cycle.learnings >= 1);
        assert_eq!(autonomous.completed_tasks(), 1);
        assert_eq!(autonomous.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn failing_task_requeues_until_retries_exhaust() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        let task = autonomous.add_task(
            "missing file",
            "verify a file that does not exist",
            TaskAction::VerifyFile,
            json!({"file_path": "nope/missing.txt"}),
            TaskPriority::High,
        );
        assert_eq!(task.max_retries, 3);

        // Two failures re-queue; the third exhausts retries.
        for expected_pending in [1usize, 1, 0] {
            autonomous.run_single_cycle().await;
            assert_eq!(autonomous.pending_tasks(), expected_pending);
        }
        let completed = autonomous.completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, TaskStatus::Failed);
        assert_eq!(completed[0].retry_count, 3);
    }

    #[tokio::test]
    async fn run_command_rejects_metacharacters() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        let mut task = autonomous.add_task(
            "bad command",
            "attempt shell injection",
            TaskAction::RunCommand,
            json!({"command": "echo hi; rm -rf /"}),
            TaskPriority::High,
        );
        let result = autonomous.execute_task(&mut task).await;
        assert_eq!(result["success"], false);
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("disallowed shell metacharacter"));
    }

    #[tokio::test]
    async fn run_command_executes_plain_commands() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        let mut task = autonomous.add_task(
            "echo",
            "say hello",
            TaskAction::RunCommand,
            json!({"command": "echo hello-loop"}),
            TaskPriority::Medium,
        );
        let result = autonomous.execute_task(&mut task).await;
        assert_eq!(result["success"], true);
        assert!(result["output"]["stdout"].as_str().unwrap().contains("hello-loop"));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn learn_from_input_records_an_event() {
        let dir = tempdir().unwrap();
        let autonomous = build_loop(dir.path());
        let mut task = autonomous.add_task(
            "learn",
            "record an observation",
            TaskAction::LearnFromInput,
            json!({"input_type": "operator_note", "content": "prefer smaller patches", "value_score": 0.8}),
            TaskPriority::Medium,
        );
        let result = autonomous.execute_task(&mut task).await;
        assert_eq!(result["success"], true);
        let events = autonomous.storage.list_learning_events(5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "operator_note");
    }

    #[tokio::test]
    async fn state_restores_pending_tasks() {
        let dir = tempdir().unwrap();
        {
            let autonomous = build_loop(dir.path());
            autonomous.add_task(
                "survives",
                "queued across restarts",
                TaskAction::VerifyFile,
                json!({"file_path": "x"}),
                TaskPriority::Medium,
            );
        }
        let restored = build_loop(dir.path());
        assert_eq!(restored.pending_tasks(), 1);
    }
}
