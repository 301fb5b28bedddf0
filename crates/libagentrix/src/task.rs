use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use agentrix_protocol::{StepLog, StepStatus, Task, TaskId, TaskStatus, TaskStep};
use serde_json::{Map, Value};

use crate::epoch_ms;

/// Sink for per-step progress of a running task.
///
/// Steps are declared lazily with `ensure_step`, move to running with
/// `start_step` and end with exactly one of complete, fail or skip.
pub trait TaskProgress: Send + Sync {
    fn ensure_step(&self, id: &str, label: &str);
    fn start_step(&self, id: &str);
    fn complete_step(&self, id: &str, message: Option<String>);
    fn fail_step(&self, id: &str, message: String);
    fn skip_step(&self, id: &str, message: Option<String>);
    fn log_step(&self, id: &str, message: String);
    fn set_metadata(&self, key: &str, value: Value);
}

/// Shared, mutable handle to one task record.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Mutex<Task>>,
}

impl TaskHandle {
    fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.lock();
        let out = f(&mut task);
        task.updated_at_epoch_ms = now_ms();
        out
    }

    pub fn id(&self) -> TaskId {
        self.lock().id.clone()
    }

    pub fn snapshot(&self) -> Task {
        self.lock().clone()
    }

    pub fn start(&self) {
        self.update(|task| task.status = TaskStatus::Running);
    }

    /// Mark the task completed with `result` attached.
    pub fn succeed(&self, result: Value) {
        self.update(|task| {
            task.status = TaskStatus::Completed;
            task.metadata
                .insert("status".to_string(), Value::from("succeeded"));
            task.result = Some(result);
            task.completed_at_epoch_ms = Some(now_ms());
        });
    }

    /// Mark the task failed, recording the step that failed when known.
    pub fn fail(&self, step: Option<&str>, error: &str) {
        self.update(|task| {
            task.status = TaskStatus::Failed;
            task.metadata
                .insert("status".to_string(), Value::from("failed"));
            if let Some(step) = step {
                task.metadata
                    .insert("failedStep".to_string(), Value::from(step));
            }
            task.error = Some(error.to_string());
            task.completed_at_epoch_ms = Some(now_ms());
        });
    }

    fn with_step(&self, id: &str, f: impl FnOnce(&mut TaskStep)) {
        self.update(|task| {
            let idx = match task.steps.iter().position(|s| s.id == id) {
                Some(idx) => idx,
                None => {
                    task.steps.push(new_step(id, id));
                    task.steps.len() - 1
                }
            };
            f(&mut task.steps[idx]);
        });
    }
}

impl TaskProgress for TaskHandle {
    fn ensure_step(&self, id: &str, label: &str) {
        self.update(|task| {
            if !task.steps.iter().any(|s| s.id == id) {
                task.steps.push(new_step(id, label));
            }
        });
    }

    fn start_step(&self, id: &str) {
        self.with_step(id, |step| step.status = StepStatus::Running);
    }

    fn complete_step(&self, id: &str, message: Option<String>) {
        self.with_step(id, |step| {
            step.status = StepStatus::Completed;
            step.message = message;
        });
    }

    fn fail_step(&self, id: &str, message: String) {
        self.with_step(id, |step| {
            step.status = StepStatus::Failed;
            step.message = Some(message);
        });
    }

    fn skip_step(&self, id: &str, message: Option<String>) {
        self.with_step(id, |step| {
            step.status = StepStatus::Skipped;
            step.message = message;
        });
    }

    fn log_step(&self, id: &str, message: String) {
        self.with_step(id, |step| {
            step.logs.push(StepLog {
                timestamp_epoch_ms: now_ms(),
                message,
            })
        });
    }

    fn set_metadata(&self, key: &str, value: Value) {
        self.update(|task| {
            task.metadata.insert(key.to_string(), value);
        });
    }
}

fn new_step(id: &str, label: &str) -> TaskStep {
    TaskStep {
        id: id.to_string(),
        label: label.to_string(),
        status: StepStatus::Pending,
        message: None,
        logs: Vec::new(),
    }
}

fn now_ms() -> u64 {
    epoch_ms(SystemTime::now())
}

/// In-memory task records.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: &str, title: &str, metadata: Map<String, Value>) -> TaskHandle {
        let now = now_ms();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
            metadata,
            result: None,
            error: None,
            created_at_epoch_ms: now,
            updated_at_epoch_ms: now,
            completed_at_epoch_ms: None,
        };
        let handle = TaskHandle {
            inner: Arc::new(Mutex::new(task)),
        };
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(TaskHandle::snapshot)
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(TaskHandle::snapshot)
            .collect();
        tasks.sort_by(|a, b| b.created_at_epoch_ms.cmp(&a.created_at_epoch_ms));
        tasks
    }

    /// Drop finished tasks that completed at least `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(older_than.as_millis() as u64);
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|_, handle| {
            let task = handle.lock();
            !(task.status.is_finished()
                && task
                    .completed_at_epoch_ms
                    .is_some_and(|done| done <= cutoff))
        });
        before - tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_declared_lazily_and_keep_order() {
        let store = TaskStore::new();
        let task = store.create("automation", "demo", Map::new());
        task.ensure_step("one", "First");
        task.ensure_step("two", "Second");
        task.ensure_step("one", "Renamed");
        task.start_step("one");
        task.complete_step("one", Some("ok".into()));
        task.skip_step("two", None);

        let snap = store.get(&task.id()).expect("task");
        let ids: Vec<_> = snap.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
        assert_eq!(snap.steps[0].label, "First");
        assert_eq!(snap.steps[0].status, StepStatus::Completed);
        assert_eq!(snap.steps[0].message.as_deref(), Some("ok"));
        assert_eq!(snap.steps[1].status, StepStatus::Skipped);
    }

    #[test]
    fn failure_records_step_and_error() {
        let store = TaskStore::new();
        let task = store.create("automation", "demo", Map::new());
        task.start();
        task.ensure_step("clone", "Clone");
        task.start_step("clone");
        task.log_step("clone", "cloning".into());
        task.fail_step("clone", "network down".into());
        task.fail(Some("clone"), "network down");

        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.metadata["status"], "failed");
        assert_eq!(snap.metadata["failedStep"], "clone");
        assert_eq!(snap.error.as_deref(), Some("network down"));
        assert_eq!(snap.steps[0].logs.len(), 1);
        assert!(snap.completed_at_epoch_ms.is_some());
    }

    #[test]
    fn prune_keeps_running_tasks() {
        let store = TaskStore::new();
        let running = store.create("automation", "a", Map::new());
        running.start();
        let done = store.create("automation", "b", Map::new());
        done.succeed(serde_json::json!({"ok": true}));

        assert_eq!(store.prune_finished(Duration::ZERO), 1);
        assert!(store.get(&running.id()).is_some());
        assert!(store.get(&done.id()).is_none());
        assert_eq!(store.list().len(), 1);
    }
}
