use thiserror::Error;

/// A convenience `Result` alias using [`JobSwitchError`].
pub type JobSwitchResult<T> = Result<T, JobSwitchError>;

/// Top-level error type for the JobSwitch orchestrator.
///
/// Variants follow the failure classes the orchestrator distinguishes:
/// validation problems fail fast, infrastructure problems are retried,
/// task failures are folded into task state, and startup failures abort.
#[derive(Error, Debug)]
pub enum JobSwitchError {
    /// Malformed input: bad agent shape, empty ids, invalid workflows.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error scoped to a single agent (registration, invocation).
    #[error("Agent error [{agent_id}]: {message}")]
    Agent {
        /// The agent the failure belongs to.
        agent_id: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A general orchestrator error (queue full, unknown agent, not ready).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// The orchestrator failed to start. Not recoverable automatically.
    #[error("Startup error: {0}")]
    Startup(String),

    /// An operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A task-level failure (lookup, cancellation, execution).
    #[error("Task error: {0}")]
    Task(String),

    /// The cache/broker collaborator failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The workflow engine collaborator failed.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobSwitchError {
    /// Build an [`JobSwitchError::Agent`] from an id and a message.
    pub fn agent(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Validation, configuration and serialization errors are permanent;
    /// everything else is treated as transient infrastructure trouble.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobSwitchError::Validation(_) | JobSwitchError::Config(_) | JobSwitchError::Json(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let err = JobSwitchError::agent("resume_agent", "get_status returned a list");
        assert_eq!(
            err.to_string(),
            "Agent error [resume_agent]: get_status returned a list"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!JobSwitchError::Validation("empty agent_id".into()).is_retryable());
        assert!(!JobSwitchError::Config("bad toml".into()).is_retryable());
        assert!(JobSwitchError::Timeout("ready gate".into()).is_retryable());
        assert!(JobSwitchError::agent("a", "boom").is_retryable());
        assert!(JobSwitchError::Broker("connection refused".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_json() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: JobSwitchError = parse.unwrap_err().into();
        assert!(matches!(err, JobSwitchError::Json(_)));
        assert!(!err.is_retryable());
    }
}
