use crate::types::{ContextMap, Message};
use async_trait::async_trait;
use jobswitch_core::JobSwitchResult;
use serde::{Deserialize, Serialize};

/// Self-reported lifecycle of an agent implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Created,
    Initialized,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Created => write!(f, "created"),
            AgentStatus::Initialized => write!(f, "initialized"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Capability every orchestrated agent provides.
///
/// The orchestrator treats implementations as black boxes: it hands them a
/// payload plus a merged context snapshot and folds whatever they return
/// into task state.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier. Registering another agent with the same id replaces this one.
    fn agent_id(&self) -> &str;

    /// Lifecycle reported by the implementation itself.
    fn status(&self) -> AgentStatus {
        AgentStatus::Initialized
    }

    /// Handle one unit of work.
    async fn process_request(
        &self,
        payload: serde_json::Value,
        context: &ContextMap,
    ) -> JobSwitchResult<serde_json::Value>;

    /// Report agent-specific status. Must be a JSON object.
    async fn get_status(&self) -> JobSwitchResult<serde_json::Value>;

    /// Receive a shared-context update the agent is subscribed to.
    async fn update_context(&self, _update: &ContextMap) -> JobSwitchResult<()> {
        Ok(())
    }
}

/// Callback invoked by the delivery loop for messages addressed to an agent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> JobSwitchResult<()>;
}
