use crate::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority queue with dependency resolution plus the stores tasks move
/// through once dispatched.
///
/// Pending tasks are kept sorted by descending priority; equal priorities keep
/// insertion order. Dispatched tasks live in `active` until they finish, then
/// move to `completed` or `failed` (which also holds cancelled and retrying
/// generations) until they are purged.
pub struct TaskQueue {
    pending: Vec<Task>,
    active: HashMap<Uuid, Task>,
    completed: HashMap<Uuid, Task>,
    failed: HashMap<Uuid, Task>,
    /// original_task_id -> id of the newest generation.
    lineage: HashMap<Uuid, Uuid>,
    max_queue_size: usize,
}

/// Move `task` to `next`, which must be a legal forward transition.
fn transition(task: &mut Task, next: TaskStatus) {
    debug_assert!(
        task.status.can_transition_to(next),
        "illegal task transition {} -> {next} for {}",
        task.status,
        task.id
    );
    task.status = next;
}

impl TaskQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            active: HashMap::new(),
            completed: HashMap::new(),
            failed: HashMap::new(),
            lineage: HashMap::new(),
            max_queue_size,
        }
    }

    /// Queue a task behind every task of equal or higher priority.
    pub fn enqueue(&mut self, task: Task) -> JobSwitchResult<Uuid> {
        if self.pending.len() >= self.max_queue_size {
            return Err(JobSwitchError::Orchestrator(format!(
                "Task queue is full ({} tasks)",
                self.max_queue_size
            )));
        }
        let id = task.id;
        for dep in &task.dependencies {
            let latest = self.latest_generation(*dep);
            if let Some(parent) = self.find_mut(latest) {
                if !parent.dependents.contains(&id) {
                    parent.dependents.push(id);
                }
            }
        }
        self.lineage.insert(task.original_task_id, id);
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, task);
        Ok(id)
    }

    /// Put a task that could not run yet at the very back of the queue.
    pub fn requeue_back(&mut self, task: Task) {
        self.pending.push(task);
    }

    /// Remove and return the first pending task whose dependencies are all completed.
    pub fn pop_ready(&mut self) -> Option<Task> {
        let idx = self
            .pending
            .iter()
            .position(|t| t.is_ready(|dep| self.is_dependency_completed(*dep)))?;
        Some(self.pending.remove(idx))
    }

    /// True when the newest generation of `id` has completed.
    pub fn is_dependency_completed(&self, id: Uuid) -> bool {
        self.completed.contains_key(&self.latest_generation(id))
    }

    /// Resolve any generation id (or original id) to the newest generation.
    pub fn latest_generation(&self, id: Uuid) -> Uuid {
        let original = self.find(id).map_or(id, |t| t.original_task_id);
        self.lineage.get(&original).copied().unwrap_or(id)
    }

    /// Move a popped task into the active set.
    pub fn mark_in_progress(&mut self, mut task: Task) -> Task {
        transition(&mut task, TaskStatus::InProgress);
        task.started_at = Some(Utc::now());
        self.active.insert(task.id, task.clone());
        task
    }

    /// Finish an active task successfully.
    ///
    /// A task cancelled while running keeps its cancelled status and the
    /// result is dropped.
    pub fn complete(&mut self, id: Uuid, result: serde_json::Value) -> Option<Task> {
        let mut task = self.active.remove(&id)?;
        task.completed_at = Some(Utc::now());
        if task.status == TaskStatus::Cancelled {
            self.failed.insert(id, task.clone());
            return Some(task);
        }
        transition(&mut task, TaskStatus::Completed);
        task.result = Some(result);
        self.completed.insert(id, task.clone());
        Some(task)
    }

    /// Finish an active task with an error.
    ///
    /// The generation becomes `Retrying` while retries remain, `Failed`
    /// otherwise. Cancelled tasks stay cancelled.
    pub fn fail(&mut self, id: Uuid, error: impl Into<String>) -> Option<Task> {
        let mut task = self.active.remove(&id)?;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.into());
        if task.status != TaskStatus::Cancelled {
            let next = if task.can_retry() {
                TaskStatus::Retrying
            } else {
                TaskStatus::Failed
            };
            transition(&mut task, next);
        }
        self.failed.insert(id, task.clone());
        Some(task)
    }

    /// Hand off a retrying generation: returns its successor and closes the old
    /// generation as failed. `None` if it was cancelled in the meantime.
    pub fn take_retry(&mut self, id: Uuid) -> Option<Task> {
        let task = self.failed.get_mut(&id)?;
        if task.status != TaskStatus::Retrying {
            return None;
        }
        transition(task, TaskStatus::Failed);
        Some(task.next_generation())
    }

    /// Record a task that never made it into the queue (e.g. a retry whose
    /// agent disappeared).
    pub fn record_failed(&mut self, mut task: Task, error: impl Into<String>) {
        transition(&mut task, TaskStatus::Failed);
        task.error = Some(error.into());
        task.completed_at = Some(Utc::now());
        self.lineage.insert(task.original_task_id, task.id);
        self.failed.insert(task.id, task);
    }

    /// Cancel the newest generation of `id`.
    ///
    /// Pending tasks leave the queue immediately. Running tasks are only
    /// marked; the call in flight keeps running.
    pub fn cancel(&mut self, id: Uuid) -> JobSwitchResult<Task> {
        let id = self.latest_generation(id);
        if let Some(idx) = self.pending.iter().position(|t| t.id == id) {
            let mut task = self.pending.remove(idx);
            transition(&mut task, TaskStatus::Cancelled);
            task.completed_at = Some(Utc::now());
            self.failed.insert(id, task.clone());
            return Ok(task);
        }
        if let Some(task) = self.active.get_mut(&id) {
            if task.status != TaskStatus::Cancelled {
                transition(task, TaskStatus::Cancelled);
            }
            return Ok(task.clone());
        }
        if let Some(task) = self.failed.get_mut(&id) {
            if task.status == TaskStatus::Retrying {
                transition(task, TaskStatus::Cancelled);
                return Ok(task.clone());
            }
        }
        match self.find(id) {
            Some(task) => Err(JobSwitchError::Task(format!(
                "Task {id} is already {} and cannot be cancelled",
                task.status
            ))),
            None => Err(JobSwitchError::Task(format!("Task {id} not found"))),
        }
    }

    /// Look up a task by id, following retries to the newest generation.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.find(self.latest_generation(id))
    }

    /// Look up exactly this generation.
    pub fn find(&self, id: Uuid) -> Option<&Task> {
        self.pending
            .iter()
            .find(|t| t.id == id)
            .or_else(|| self.active.get(&id))
            .or_else(|| self.completed.get(&id))
            .or_else(|| self.failed.get(&id))
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        if let Some(task) = self.pending.iter_mut().find(|t| t.id == id) {
            return Some(task);
        }
        if let Some(task) = self.active.get_mut(&id) {
            return Some(task);
        }
        if let Some(task) = self.completed.get_mut(&id) {
            return Some(task);
        }
        self.failed.get_mut(&id)
    }

    /// Pending tasks that list `id` (any generation of it) as a dependency.
    pub fn waiting_on(&self, id: Uuid) -> Vec<Uuid> {
        let latest = self.latest_generation(id);
        self.pending
            .iter()
            .filter(|t| {
                t.dependencies
                    .iter()
                    .any(|dep| self.latest_generation(*dep) == latest)
            })
            .map(|t| t.id)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Drop finished tasks whose `completed_at` is before `cutoff`.
    /// Returns how many were removed.
    pub fn purge_finished_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired = |t: &Task| t.status != TaskStatus::Retrying && t.completed_at.is_some_and(|at| at < cutoff);
        let before = self.completed.len() + self.failed.len();
        self.completed.retain(|_, t| !expired(t));
        self.failed.retain(|_, t| !expired(t));
        let removed = before - (self.completed.len() + self.failed.len());

        let live: std::collections::HashSet<Uuid> = self
            .pending
            .iter()
            .map(|t| t.id)
            .chain(self.active.keys().copied())
            .chain(self.completed.keys().copied())
            .chain(self.failed.keys().copied())
            .collect();
        self.lineage.retain(|_, latest| live.contains(latest));
        removed
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}
