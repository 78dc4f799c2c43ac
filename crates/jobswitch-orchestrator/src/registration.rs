use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One attempt to register an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAttempt {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Audit trail of every registration attempt for one agent id.
///
/// Survives unregistration so operators can see how an agent came and went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistrationStatus {
    pub agent_id: String,
    pub attempts: Vec<RegistrationAttempt>,
    /// Set by the first successful attempt. Later failures elsewhere do not clear it.
    pub is_registered: bool,
    pub first_registered_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentRegistrationStatus {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            attempts: Vec::new(),
            is_registered: false,
            first_registered_at: None,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, attempt: u32) {
        let now = Utc::now();
        self.attempts.push(RegistrationAttempt {
            attempt,
            timestamp: now,
            success: true,
            error: None,
        });
        if !self.is_registered {
            self.is_registered = true;
            self.first_registered_at = Some(now);
        }
        self.last_attempt_at = Some(now);
    }

    pub fn record_failure(&mut self, attempt: u32, error: impl Into<String>) {
        let now = Utc::now();
        let error = error.into();
        self.attempts.push(RegistrationAttempt {
            attempt,
            timestamp: now,
            success: false,
            error: Some(error.clone()),
        });
        self.last_attempt_at = Some(now);
        self.last_error = Some(error);
    }

    /// Number of failed attempts across the agent's history.
    pub fn retry_count(&self) -> usize {
        self.attempts.iter().filter(|a| !a.success).count()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agent_id": self.agent_id,
            "is_registered": self.is_registered,
            "retry_count": self.retry_count(),
            "total_attempts": self.total_attempts(),
            "first_registered_at": self.first_registered_at,
            "last_attempt_at": self.last_attempt_at,
            "last_error": self.last_error,
            "attempts": self.attempts,
        })
    }
}
