use crate::engine::{Orchestrator, ORCHESTRATOR_ID};
use crate::health::AgentHealthState;
use crate::types::{Message, MessageType};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Oldest finish time that survives cleanup. Saturates at the earliest
/// representable instant, so an oversized window purges nothing.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Orchestrator {
    pub(crate) async fn health_check_loop(self) {
        let interval = self.shared.config.health_check_interval();
        debug!("Health check loop started");
        while self.is_running() {
            tokio::time::sleep(interval).await;
            if !self.is_running() {
                break;
            }
            self.run_health_checks().await;
        }
    }

    pub(crate) async fn cleanup_loop(self) {
        let interval = self.shared.config.cleanup_interval();
        debug!("Cleanup loop started");
        while self.is_running() {
            tokio::time::sleep(interval).await;
            if !self.is_running() {
                break;
            }
            self.run_cleanup().await;
        }
    }

    /// Probe every agent once. Only updates health state; never unregisters.
    pub async fn run_health_checks(&self) {
        let agents: Vec<_> = self
            .shared
            .agents
            .read()
            .await
            .iter()
            .map(|(id, agent)| (id.clone(), agent.clone()))
            .collect();
        let timeout = self.shared.config.health_check_timeout();

        for (agent_id, agent) in agents {
            let ping = Message::new(
                ORCHESTRATOR_ID,
                agent_id.clone(),
                MessageType::HealthCheck,
                serde_json::json!({ "timestamp": Utc::now() }),
            );
            if let Err(e) = self.send_message(ping).await {
                debug!(agent_id = %agent_id, error = %e, "Could not queue health check message");
            }

            let responded = match tokio::time::timeout(timeout, agent.get_status()).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(agent_id = %agent_id, error = %e, "Health check failed");
                    false
                }
                Err(_) => {
                    warn!(agent_id = %agent_id, timeout_ms = timeout.as_millis() as u64, "Health check timed out");
                    false
                }
            };

            let previous = self.shared.monitor.get_state(&agent_id).await.map(|s| s.state);
            let current = self.shared.monitor.record_check(&agent_id, responded).await;
            if let (Some(previous), Some(current)) = (previous, current) {
                if previous != current {
                    info!(agent_id = %agent_id, from = ?previous, to = ?current, "Agent health changed");
                }
                if current == AgentHealthState::Unhealthy {
                    debug!(agent_id = %agent_id, "Agent responding but unhealthy");
                }
            }
        }
    }

    /// Purge finished tasks older than the retention window. Returns how many
    /// were removed.
    pub async fn run_cleanup(&self) -> usize {
        let cutoff = retention_cutoff(Utc::now(), self.shared.config.task_retention());
        let removed = self.shared.queue.write().await.purge_finished_before(cutoff);
        if removed > 0 {
            info!(removed, "Purged finished tasks");
        } else {
            debug!("Cleanup found nothing to purge");
        }
        removed
    }
}
