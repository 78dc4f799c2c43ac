use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A JSON object, used for payloads, agent context and shared context entries.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// Default number of re-submissions a task gets after its first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-attempt execution timeout.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Scheduling priority. Higher values are dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle of a single task generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// The attempt failed and a new generation is scheduled after backoff.
    Retrying,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// Nothing moves back to `Pending`: a retry is a new generation. A pending
    /// task fails directly when its agent is gone before dispatch.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Retrying)
                | (InProgress, Cancelled)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// A unit of work addressed to one agent.
///
/// Each retry produces a new generation: a fresh `id` that keeps the
/// `original_task_id` of the first submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub original_task_id: Uuid,
    pub generation: u32,
    pub agent_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub dependents: Vec<Uuid>,
}

impl Task {
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            original_task_id: id,
            generation: 0,
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// True when the task is pending and every dependency is completed.
    pub fn is_ready(&self, is_completed: impl Fn(&Uuid) -> bool) -> bool {
        self.status == TaskStatus::Pending && self.dependencies.iter().all(is_completed)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether this generation came from a retry rather than a fresh submission.
    pub fn is_retry(&self) -> bool {
        self.generation > 0
    }

    /// Build the next generation of this task for re-submission.
    pub fn next_generation(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_task_id: self.original_task_id,
            generation: self.generation + 1,
            agent_id: self.agent_id.clone(),
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds,
            dependencies: self.dependencies.clone(),
            dependents: self.dependents.clone(),
        }
    }
}

/// Kind of inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Broadcast,
    ContextUpdate,
    HealthCheck,
}

/// A best-effort, in-process message between agents (or from the orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type,
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
            delivered: false,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("resume_agent", "optimize_resume", json!({"resume": "..."}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.original_task_id, task.id);
        assert_eq!(task.generation, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_is_ready_with_deps() {
        let dep_id = Uuid::new_v4();
        let task = Task::new("a", "t", json!({})).with_dependencies(vec![dep_id]);
        assert!(!task.is_ready(|_| false));
        assert!(task.is_ready(|id| *id == dep_id));
    }

    #[test]
    fn test_task_not_ready_when_running() {
        let mut task = Task::new("a", "t", json!({}));
        task.status = TaskStatus::InProgress;
        assert!(!task.is_ready(|_| true));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::Urgent.value(), 4);
        assert_eq!(TaskPriority::Low.to_string(), "low");
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Retrying.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_next_generation_keeps_lineage() {
        let task = Task::new("a", "t", json!({"k": 1}))
            .with_priority(TaskPriority::High)
            .with_max_retries(2);
        let retry = task.next_generation();
        assert_ne!(retry.id, task.id);
        assert_eq!(retry.original_task_id, task.id);
        assert_eq!(retry.generation, 1);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.priority, TaskPriority::High);
        assert!(retry.is_retry());
        assert!(retry.can_retry());
        assert!(!retry.next_generation().can_retry());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_message_type_field_name() {
        let msg = Message::new("orchestrator", "echo", MessageType::HealthCheck, json!({}))
            .with_correlation_id("abc");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "health_check");
        assert_eq!(value["correlation_id"], "abc");
        assert_eq!(value["delivered"], false);
    }
}
