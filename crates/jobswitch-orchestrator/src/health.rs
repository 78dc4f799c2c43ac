use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Number of response-time samples kept per agent.
pub const RESPONSE_WINDOW: usize = 100;
/// An agent without a heartbeat for this long is unhealthy.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;
/// Minimum success rate once enough samples exist.
pub const MIN_SUCCESS_RATE: f64 = 0.8;
/// Samples needed before the success rate is enforced.
pub const MIN_SAMPLES: u64 = 10;

/// Observed health classification of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealthState {
    Healthy,
    Unhealthy,
    /// The agent failed to answer a health check at all.
    Offline,
}

/// Rolling health metrics for one registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthStatus {
    pub agent_id: String,
    /// Most recent response times in milliseconds, oldest first.
    pub response_times: VecDeque<f64>,
    pub error_count: u64,
    pub success_count: u64,
    pub current_load: u32,
    pub max_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub state: AgentHealthState,
    /// Identifies the registration these metrics belong to. A re-registered
    /// agent gets a new value, so finishes from the old instance are ignored.
    #[serde(default)]
    pub registration: u64,
}

impl AgentHealthStatus {
    pub fn new(agent_id: impl Into<String>, max_load: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
            error_count: 0,
            success_count: 0,
            current_load: 0,
            max_load,
            last_heartbeat: Utc::now(),
            state: AgentHealthState::Healthy,
            registration: 0,
        }
    }

    pub fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed.as_micros() as f64 / 1000.0);
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.record_response_time(elapsed);
        self.success_count += 1;
        self.last_heartbeat = Utc::now();
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count + self.error_count
    }

    /// Fraction of successful requests; 1.0 before any request.
    pub fn success_rate(&self) -> f64 {
        match self.total_requests() {
            0 => 1.0,
            total => self.success_count as f64 / total as f64,
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            0.0
        } else {
            self.response_times.iter().sum::<f64>() / self.response_times.len() as f64
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_load
    }

    /// Derived at call time from heartbeat recency, success rate and load.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let fresh = (now - self.last_heartbeat).num_seconds() < HEARTBEAT_TIMEOUT_SECS;
        let reliable =
            self.total_requests() < MIN_SAMPLES || self.success_rate() >= MIN_SUCCESS_RATE;
        fresh && reliable && self.current_load <= self.max_load
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state,
            "is_healthy": self.is_healthy(),
            "success_count": self.success_count,
            "error_count": self.error_count,
            "success_rate": self.success_rate(),
            "average_response_time_ms": self.average_response_time_ms(),
            "current_load": self.current_load,
            "max_load": self.max_load,
            "last_heartbeat": self.last_heartbeat,
        })
    }
}

/// Tracks health for every registered agent.
pub struct AgentMonitor {
    states: RwLock<HashMap<String, AgentHealthStatus>>,
    next_registration: AtomicU64,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
        }
    }

    /// Start tracking an agent with fresh metrics, replacing any old entry.
    /// Returns the registration number load slots are charged against.
    pub async fn track(&self, agent_id: &str, max_load: u32) -> u64 {
        let registration = self.next_registration.fetch_add(1, Ordering::SeqCst);
        let mut status = AgentHealthStatus::new(agent_id, max_load);
        status.registration = registration;
        self.states.write().await.insert(agent_id.to_string(), status);
        registration
    }

    pub async fn forget(&self, agent_id: &str) -> Option<AgentHealthStatus> {
        self.states.write().await.remove(agent_id)
    }

    /// Take a load slot if the agent has one free. Returns the registration
    /// the slot belongs to; `None` for unknown or fully loaded agents.
    pub async fn try_start_task(&self, agent_id: &str) -> Option<u64> {
        let mut states = self.states.write().await;
        let state = states.get_mut(agent_id).filter(|s| s.has_capacity())?;
        state.current_load += 1;
        Some(state.registration)
    }

    /// Metrics of the current registration, if `registration` still is it.
    fn current<'a>(
        states: &'a mut HashMap<String, AgentHealthStatus>,
        agent_id: &str,
        registration: u64,
    ) -> Option<&'a mut AgentHealthStatus> {
        states
            .get_mut(agent_id)
            .filter(|state| state.registration == registration)
    }

    /// Record a successful task and release its load slot.
    pub async fn finish_success(&self, agent_id: &str, registration: u64, elapsed: Duration) {
        let mut states = self.states.write().await;
        if let Some(state) = Self::current(&mut states, agent_id, registration) {
            state.current_load = state.current_load.saturating_sub(1);
            state.record_success(elapsed);
        }
    }

    /// Record a failed task and release its load slot.
    pub async fn finish_error(&self, agent_id: &str, registration: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = Self::current(&mut states, agent_id, registration) {
            state.current_load = state.current_load.saturating_sub(1);
            state.record_error();
        }
    }

    /// Apply a health-check outcome and return the resulting state.
    pub async fn record_check(&self, agent_id: &str, responded: bool) -> Option<AgentHealthState> {
        let mut states = self.states.write().await;
        let state = states.get_mut(agent_id)?;
        state.state = if responded {
            state.heartbeat();
            if state.is_healthy() {
                AgentHealthState::Healthy
            } else {
                AgentHealthState::Unhealthy
            }
        } else {
            AgentHealthState::Offline
        };
        Some(state.state)
    }

    pub async fn get_state(&self, agent_id: &str) -> Option<AgentHealthStatus> {
        self.states.read().await.get(agent_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<AgentHealthStatus> {
        self.states.read().await.values().cloned().collect()
    }

    /// Counts of agents per health state.
    pub async fn summary(&self) -> serde_json::Value {
        let states = self.states.read().await;
        let count = |wanted: AgentHealthState| states.values().filter(|s| s.state == wanted).count();
        serde_json::json!({
            "healthy": count(AgentHealthState::Healthy),
            "unhealthy": count(AgentHealthState::Unhealthy),
            "offline": count(AgentHealthState::Offline),
            "total_load": states.values().map(|s| u64::from(s.current_load)).sum::<u64>(),
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_agent_is_healthy() {
        let status = AgentHealthStatus::new("resume_agent", 10);
        assert!(status.is_healthy());
        assert_eq!(status.success_rate(), 1.0);
        assert_eq!(status.average_response_time_ms(), 0.0);
    }

    #[test]
    fn test_response_window_is_bounded() {
        let mut status = AgentHealthStatus::new("a", 10);
        for i in 0..150 {
            status.record_success(Duration::from_millis(i));
        }
        assert_eq!(status.response_times.len(), RESPONSE_WINDOW);
        assert_eq!(status.response_times.front().copied(), Some(50.0));
        assert_eq!(status.success_count, 150);
    }

    #[test]
    fn test_success_rate_only_enforced_after_min_samples() {
        let mut status = AgentHealthStatus::new("a", 10);
        for _ in 0..5 {
            status.record_error();
        }
        // 0% success but only 5 samples
        assert!(status.is_healthy());

        for _ in 0..5 {
            status.record_success(Duration::from_millis(5));
        }
        // 50% over 10 samples
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_stale_heartbeat_is_unhealthy() {
        let status = AgentHealthStatus::new("a", 10);
        let later = Utc::now() + chrono::Duration::seconds(HEARTBEAT_TIMEOUT_SECS + 1);
        assert!(!status.is_healthy_at(later));
    }

    #[test]
    fn test_overload_is_unhealthy() {
        let mut status = AgentHealthStatus::new("a", 1);
        status.current_load = 1;
        assert!(status.is_healthy());
        assert!(!status.has_capacity());
        status.current_load = 2;
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_monitor_load_accounting() {
        let monitor = AgentMonitor::new();
        let registration = monitor.track("coach", 2).await;

        assert_eq!(monitor.try_start_task("coach").await, Some(registration));
        assert_eq!(monitor.try_start_task("coach").await, Some(registration));
        assert!(monitor.try_start_task("coach").await.is_none());

        monitor.finish_success("coach", registration, Duration::from_millis(20)).await;
        monitor.finish_error("coach", registration).await;
        let state = monitor.get_state("coach").await.unwrap();
        assert_eq!(state.current_load, 0);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.error_count, 1);
    }

    #[tokio::test]
    async fn test_finishes_from_replaced_registration_are_ignored() {
        let monitor = AgentMonitor::new();
        let old = monitor.track("coach", 1).await;
        assert_eq!(monitor.try_start_task("coach").await, Some(old));

        let new = monitor.track("coach", 1).await;
        assert_ne!(old, new);
        assert_eq!(monitor.try_start_task("coach").await, Some(new));

        // The old instance's task finishing must not free the new one's slot.
        monitor.finish_success("coach", old, Duration::from_millis(5)).await;
        monitor.finish_error("coach", old).await;
        let state = monitor.get_state("coach").await.unwrap();
        assert_eq!(state.current_load, 1);
        assert_eq!(state.total_requests(), 0);
        assert!(monitor.try_start_task("coach").await.is_none());

        monitor.finish_success("coach", new, Duration::from_millis(5)).await;
        assert_eq!(monitor.get_state("coach").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_unknown_agent_has_no_capacity() {
        let monitor = AgentMonitor::new();
        assert!(monitor.try_start_task("ghost").await.is_none());
        assert!(monitor.record_check("ghost", true).await.is_none());
    }

    #[tokio::test]
    async fn test_record_check_states() {
        let monitor = AgentMonitor::new();
        monitor.track("a", 10).await;
        assert_eq!(monitor.record_check("a", false).await, Some(AgentHealthState::Offline));
        assert_eq!(monitor.record_check("a", true).await, Some(AgentHealthState::Healthy));

        let summary = monitor.summary().await;
        assert_eq!(summary["healthy"], 1);
        assert_eq!(summary["offline"], 0);
    }

    #[tokio::test]
    async fn test_forget_removes_metrics() {
        let monitor = AgentMonitor::new();
        monitor.track("a", 10).await;
        assert!(monitor.forget("a").await.is_some());
        assert!(monitor.get_state("a").await.is_none());
        assert!(monitor.snapshot().await.is_empty());
    }
}
