use crate::agent::{Agent, AgentStatus, MessageHandler};
use crate::broker::CacheBroker;
use crate::config::OrchestratorConfig;
use crate::context::{ContextStore, GLOBAL_CONTEXT};
use crate::health::AgentMonitor;
use crate::registration::AgentRegistrationStatus;
use crate::task_queue::TaskQueue;
use crate::types::Message;
use crate::workflow::WorkflowEngine;
use chrono::{DateTime, Utc};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sender id used for messages the orchestrator emits itself.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Initializing,
    Ready,
    Stopped,
    Failed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// State shared by every clone of an [`Orchestrator`] and its background loops.
pub(crate) struct Shared {
    pub(crate) config: OrchestratorConfig,
    pub(crate) agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    pub(crate) monitor: AgentMonitor,
    pub(crate) registrations: RwLock<HashMap<String, AgentRegistrationStatus>>,
    registration_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) queue: RwLock<TaskQueue>,
    pub(crate) messages: Mutex<VecDeque<Message>>,
    pub(crate) handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    pub(crate) context: RwLock<ContextStore>,
    broker: Option<Arc<dyn CacheBroker>>,
    broker_active: AtomicBool,
    pub(crate) workflow_engine: Option<Arc<dyn WorkflowEngine>>,
    state: watch::Sender<LifecycleState>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    /// Wakes the dispatch loop (new task, finished task, freed capacity).
    pub(crate) task_wakeup: Notify,
    /// Wakes the delivery loop.
    pub(crate) message_wakeup: Notify,
    /// Signalled whenever a task reaches a final or retrying state.
    pub(crate) task_finished: Notify,
    pub(crate) delivered_messages: AtomicU64,
}

/// Agent orchestrator: registry, task queue, messaging and context sharing.
///
/// A cheap `Clone` handle; every clone drives the same state. Construct one
/// per application and pass it to whoever needs it.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) shared: Arc<Shared>,
}

/// Builder for an [`Orchestrator`] with optional collaborators.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    broker: Option<Arc<dyn CacheBroker>>,
    workflow_engine: Option<Arc<dyn WorkflowEngine>>,
}

impl OrchestratorBuilder {
    /// Cache/broker client, used only when `config.cache.enabled` is set.
    pub fn with_broker(mut self, broker: Arc<dyn CacheBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// External engine for `coordinate_agents`.
    pub fn with_workflow_engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.workflow_engine = Some(engine);
        self
    }

    pub fn build(self) -> Orchestrator {
        let broker = match (self.config.cache.enabled, self.broker) {
            (true, Some(broker)) => Some(broker),
            (true, None) => {
                warn!("Cache enabled but no broker client supplied, running in memory");
                None
            }
            (false, Some(_)) => {
                info!("Cache disabled, ignoring supplied broker client");
                None
            }
            (false, None) => None,
        };
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        let max_queue_size = self.config.max_queue_size;

        Orchestrator {
            shared: Arc::new(Shared {
                config: self.config,
                agents: RwLock::new(HashMap::new()),
                monitor: AgentMonitor::new(),
                registrations: RwLock::new(HashMap::new()),
                registration_locks: Mutex::new(HashMap::new()),
                queue: RwLock::new(TaskQueue::new(max_queue_size)),
                messages: Mutex::new(VecDeque::new()),
                handlers: RwLock::new(HashMap::new()),
                context: RwLock::new(ContextStore::new()),
                broker,
                broker_active: AtomicBool::new(false),
                workflow_engine: self.workflow_engine,
                state,
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                loops: Mutex::new(Vec::new()),
                started_at: RwLock::new(None),
                task_wakeup: Notify::new(),
                message_wakeup: Notify::new(),
                task_finished: Notify::new(),
                delivered_messages: AtomicU64::new(0),
            }),
        }
    }
}

impl Orchestrator {
    /// Create an in-memory orchestrator with no collaborators.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            broker: None,
            workflow_engine: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The broker, if one is configured and answered the startup ping.
    pub(crate) fn active_broker(&self) -> Option<Arc<dyn CacheBroker>> {
        if self.shared.broker_active.load(Ordering::SeqCst) {
            self.shared.broker.clone()
        } else {
            None
        }
    }

    // --- Lifecycle ---

    /// Connect collaborators, spawn the background loops and become ready.
    ///
    /// A no-op when already ready. A failing broker ping only disables the
    /// broker; a failing workflow engine leaves the orchestrator `Failed`.
    pub async fn start(&self) -> JobSwitchResult<()> {
        let _guard = self.shared.lifecycle.lock().await;
        if self.state() == LifecycleState::Ready {
            debug!("Orchestrator already running");
            return Ok(());
        }

        info!("Starting orchestrator");
        self.shared.state.send_replace(LifecycleState::Initializing);

        if let Err(e) = self.connect_collaborators().await {
            error!(error = %e, "Orchestrator failed to start");
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.state.send_replace(LifecycleState::Failed);
            return Err(JobSwitchError::Startup(e.to_string()));
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let handles = vec![
            tokio::spawn(self.clone().dispatch_loop()),
            tokio::spawn(self.clone().delivery_loop()),
            tokio::spawn(self.clone().health_check_loop()),
            tokio::spawn(self.clone().cleanup_loop()),
        ];
        *self.shared.loops.lock().await = handles;
        *self.shared.started_at.write().await = Some(Utc::now());

        self.shared.state.send_replace(LifecycleState::Ready);
        info!(
            max_concurrent_tasks = self.shared.config.max_concurrent_tasks,
            broker = self.active_broker().is_some(),
            workflow_engine = self.shared.workflow_engine.is_some(),
            "Orchestrator ready"
        );
        Ok(())
    }

    async fn connect_collaborators(&self) -> JobSwitchResult<()> {
        if let Some(broker) = &self.shared.broker {
            match broker.ping().await {
                Ok(()) => {
                    self.shared.broker_active.store(true, Ordering::SeqCst);
                    info!("Cache broker connected");
                }
                Err(e) => {
                    self.shared.broker_active.store(false, Ordering::SeqCst);
                    warn!(error = %e, "Cache broker unreachable, continuing in memory");
                }
            }
        }
        if let Some(engine) = &self.shared.workflow_engine {
            engine
                .initialize()
                .await
                .map_err(|e| JobSwitchError::Workflow(format!("engine initialization failed: {e}")))?;
            info!("Workflow engine initialized");
        }
        Ok(())
    }

    /// Wait until the orchestrator is ready.
    ///
    /// Returns `true` at once when ready. Otherwise parks until the state
    /// turns ready (`true`), failed or stopped (`false`), or `timeout`
    /// elapses (`false`).
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        if *rx.borrow_and_update() == LifecycleState::Ready {
            return true;
        }
        let wait = async {
            while rx.changed().await.is_ok() {
                match *rx.borrow_and_update() {
                    LifecycleState::Ready => return true,
                    LifecycleState::Failed | LifecycleState::Stopped => return false,
                    LifecycleState::NotStarted | LifecycleState::Initializing => {}
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Stop the background loops and release collaborators. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        let handles = std::mem::take(&mut *self.shared.loops.lock().await);
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if !was_running && handles.is_empty() {
            debug!(state = %self.state(), "Orchestrator not running, nothing to stop");
            // Release anyone parked in wait_for_ready.
            self.shared.state.send_if_modified(|state| {
                let changed = *state != LifecycleState::Stopped;
                *state = LifecycleState::Stopped;
                changed
            });
            return;
        }

        info!("Stopping orchestrator");
        for handle in handles {
            handle.abort();
        }
        self.shared.state.send_replace(LifecycleState::Stopped);

        if let Some(broker) = self.active_broker() {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "Failed to close cache broker");
            }
            self.shared.broker_active.store(false, Ordering::SeqCst);
        }
        info!("Orchestrator stopped");
    }

    // --- Registration ---

    /// Register an agent, replacing any agent with the same id.
    ///
    /// Each attempt waits for readiness, commits the agent and then checks
    /// that `get_status` returns an object. Failed attempts are rolled back
    /// and retried with the registration backoff; every attempt is recorded.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> JobSwitchResult<()> {
        let agent_id = agent.agent_id().to_string();
        if agent_id.trim().is_empty() {
            return Err(JobSwitchError::Validation("Agent id must not be empty".into()));
        }

        let result = {
            let lock = self.registration_lock(&agent_id).await;
            let _guard = lock.lock().await;
            self.register_locked(agent, &agent_id).await
        };
        self.prune_registration_lock(&agent_id).await;
        result
    }

    async fn register_locked(&self, agent: Arc<dyn Agent>, agent_id: &str) -> JobSwitchResult<()> {
        let agent_id = agent_id.to_string();
        self.shared
            .registrations
            .write()
            .await
            .entry(agent_id.clone())
            .or_insert_with(|| AgentRegistrationStatus::new(&agent_id));

        let policy = self.shared.config.registration_retry.clone();
        let result = policy
            .retry("register_agent", |attempt| {
                let this = self.clone();
                let agent = Arc::clone(&agent);
                async move {
                    let outcome = this.try_register(Arc::clone(&agent), attempt).await;
                    this.record_registration_attempt(agent.agent_id(), attempt, &outcome)
                        .await;
                    outcome
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(agent_id = %agent_id, "Agent registered");
                Ok(())
            }
            Err(e @ JobSwitchError::Validation(_)) => Err(e),
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Agent registration failed");
                Err(JobSwitchError::agent(
                    &agent_id,
                    format!("registration failed: {e}"),
                ))
            }
        }
    }

    async fn registration_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.shared.registration_locks.lock().await;
        Arc::clone(locks.entry(agent_id.to_string()).or_default())
    }

    /// Drop the per-id lock once no caller holds it.
    async fn prune_registration_lock(&self, agent_id: &str) {
        let mut locks = self.shared.registration_locks.lock().await;
        if locks.get(agent_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(agent_id);
        }
    }

    async fn try_register(&self, agent: Arc<dyn Agent>, attempt: u32) -> JobSwitchResult<()> {
        let agent_id = agent.agent_id().to_string();
        let ready_timeout = self.shared.config.registration_ready_timeout();
        if !self.wait_for_ready(ready_timeout).await {
            return Err(JobSwitchError::Timeout(format!(
                "orchestrator not ready after {}s (state: {})",
                ready_timeout.as_secs_f64(),
                self.state()
            )));
        }

        let status = agent.status();
        if status != AgentStatus::Initialized {
            warn!(agent_id = %agent_id, status = %status, "Agent is not initialized");
        }

        if self.remove_agent(&agent_id).await {
            info!(agent_id = %agent_id, attempt, "Replacing existing agent");
        }

        self.shared
            .agents
            .write()
            .await
            .insert(agent_id.clone(), Arc::clone(&agent));
        self.shared
            .monitor
            .track(&agent_id, self.shared.config.default_max_load)
            .await;
        self.shared
            .context
            .write()
            .await
            .subscribe(&agent_id, GLOBAL_CONTEXT);

        let check = match agent.get_status().await {
            Ok(value) if value.is_object() => Ok(()),
            Ok(other) => Err(JobSwitchError::Validation(format!(
                "get_status for '{agent_id}' must return a JSON object, got {other}"
            ))),
            Err(e) => Err(JobSwitchError::agent(
                &agent_id,
                format!("status check failed: {e}"),
            )),
        };
        if let Err(e) = check {
            warn!(agent_id = %agent_id, attempt, error = %e, "Post-registration check failed, rolling back");
            self.remove_agent(&agent_id).await;
            return Err(e);
        }
        debug!(agent_id = %agent_id, attempt, "Registration attempt succeeded");
        Ok(())
    }

    async fn record_registration_attempt(
        &self,
        agent_id: &str,
        attempt: u32,
        outcome: &JobSwitchResult<()>,
    ) {
        let mut registrations = self.shared.registrations.write().await;
        let status = registrations
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRegistrationStatus::new(agent_id));
        match outcome {
            Ok(()) => status.record_success(attempt),
            Err(e) => status.record_failure(attempt, e.to_string()),
        }
    }

    /// Drop an agent from the registry, health map, subscriptions and handlers.
    async fn remove_agent(&self, agent_id: &str) -> bool {
        let removed = self.shared.agents.write().await.remove(agent_id).is_some();
        self.shared.monitor.forget(agent_id).await;
        self.shared.context.write().await.unsubscribe_all(agent_id);
        self.shared.handlers.write().await.remove(agent_id);
        removed
    }

    /// Unregister an agent. Its registration history is kept.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = {
            let lock = self.registration_lock(agent_id).await;
            let _guard = lock.lock().await;
            self.remove_agent(agent_id).await
        };
        self.prune_registration_lock(agent_id).await;
        if removed {
            info!(agent_id = %agent_id, "Agent unregistered");
        }
        removed
    }

    pub(crate) async fn agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.shared.agents.read().await.get(agent_id).cloned()
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.shared.agents.read().await.contains_key(agent_id)
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // --- Status surface ---

    /// Latest generation of a task, by any of its generation ids.
    pub async fn get_task_status(&self, task_id: Uuid) -> Option<serde_json::Value> {
        let queue = self.shared.queue.read().await;
        let task = queue.get(task_id)?;
        serde_json::to_value(task).ok()
    }

    /// Health metrics plus whatever the agent reports about itself.
    pub async fn get_agent_status(&self, agent_id: &str) -> Option<serde_json::Value> {
        let agent = self.agent(agent_id).await?;
        let health = self.shared.monitor.get_state(agent_id).await;
        let reported = match agent.get_status().await {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        let subscriptions = self.shared.context.read().await.subscriptions_of(agent_id);
        Some(serde_json::json!({
            "agent_id": agent_id,
            "status": agent.status(),
            "healthy": health.as_ref().is_some_and(|h| h.is_healthy()),
            "health": health.map(|h| h.to_json()),
            "subscriptions": subscriptions,
            "agent_status": reported,
        }))
    }

    /// Registration history, kept even after the agent is unregistered.
    pub async fn get_registration_status(&self, agent_id: &str) -> Option<serde_json::Value> {
        let registrations = self.shared.registrations.read().await;
        registrations.get(agent_id).map(AgentRegistrationStatus::to_json)
    }

    /// One entry per registered agent, keyed by agent id.
    pub async fn get_registered_agents(&self) -> serde_json::Value {
        let agents: Vec<(String, AgentStatus)> = self
            .shared
            .agents
            .read()
            .await
            .iter()
            .map(|(id, agent)| (id.clone(), agent.status()))
            .collect();
        let mut out = serde_json::Map::new();
        for (agent_id, status) in agents {
            let health = self.shared.monitor.get_state(&agent_id).await;
            out.insert(
                agent_id.clone(),
                serde_json::json!({
                    "status": status,
                    "health_state": health.as_ref().map(|h| h.state),
                    "current_load": health.as_ref().map_or(0, |h| h.current_load),
                    "max_load": health.as_ref().map_or(0, |h| h.max_load),
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    pub async fn get_orchestrator_status(&self) -> serde_json::Value {
        let started_at = *self.shared.started_at.read().await;
        let uptime = started_at
            .filter(|_| self.is_running())
            .map_or(0, |at| (Utc::now() - at).num_seconds().max(0));
        let agent_count = self.shared.agents.read().await.len();
        let health = self.shared.monitor.summary().await;
        let (pending, active, completed, failed, max_queue_size) = {
            let queue = self.shared.queue.read().await;
            (
                queue.pending_count(),
                queue.active_count(),
                queue.completed_count(),
                queue.failed_count(),
                queue.max_queue_size(),
            )
        };
        let queued_messages = self.shared.messages.lock().await.len();
        let contexts = self.shared.context.read().await.context_count();

        serde_json::json!({
            "state": self.state(),
            "running": self.is_running(),
            "started_at": started_at,
            "uptime_seconds": uptime,
            "agents": {
                "registered": agent_count,
                "health": health,
            },
            "tasks": {
                "pending": pending,
                "active": active,
                "completed": completed,
                "failed": failed,
                "max_queue_size": max_queue_size,
                "max_concurrent_tasks": self.shared.config.max_concurrent_tasks,
            },
            "messages": {
                "queued": queued_messages,
                "delivered": self.shared.delivered_messages.load(Ordering::SeqCst),
            },
            "shared_contexts": contexts,
            "cache": {
                "enabled": self.shared.config.cache.enabled,
                "active": self.active_broker().is_some(),
            },
            "workflow_engine": self.shared.workflow_engine.is_some(),
        })
    }
}
