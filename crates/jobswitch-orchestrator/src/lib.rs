//! Agent orchestration core for JobSwitch.
//!
//! Registers long-lived agents and dispatches work to them through a priority
//! queue with dependency resolution, retries and per-agent load limits. Also
//! carries in-process messaging, shared context broadcast, health tracking and
//! multi-step workflow coordination.
//!
//! # Main types
//!
//! - [`Orchestrator`]: the cloneable handle that owns all state and background loops.
//! - [`Agent`]: the capability an orchestrated agent implements.
//! - [`Task`] / [`Message`]: units of work and inter-agent messages.
//! - [`TaskQueue`]: priority queue plus the completed/failed stores.
//! - [`RetryConfig`]: exponential backoff with jitter.
//! - [`OrchestratorConfig`]: TOML-loadable tuning.
//! - [`CacheBroker`] / [`WorkflowEngine`]: optional collaborators.

/// The agent capability and message handler traits.
pub mod agent;
/// Optional cache/broker collaborator and an in-memory implementation.
pub mod broker;
/// Orchestrator configuration.
pub mod config;
/// Shared context store and subscriptions.
pub mod context;
/// Workflow coordination across agents.
mod coordinator;
/// Task submission, dispatch and retry.
mod dispatch;
/// Orchestrator state, lifecycle, registration and status.
pub mod engine;
/// Per-agent health tracking.
pub mod health;
/// Health check and cleanup loops.
mod maintenance;
/// Message queue and context broadcast.
mod messaging;
/// Registration attempt history.
pub mod registration;
/// Backoff policies.
pub mod retry;
/// Priority task queue with dependency resolution.
pub mod task_queue;
/// Task and message value types.
pub mod types;
/// Workflow definitions and the external engine trait.
pub mod workflow;

pub use agent::{Agent, AgentStatus, MessageHandler};
pub use broker::{CacheBroker, CacheConfig, InMemoryBroker};
pub use config::OrchestratorConfig;
pub use context::{ContextStore, GLOBAL_CONTEXT};
pub use engine::{LifecycleState, Orchestrator, OrchestratorBuilder, ORCHESTRATOR_ID};
pub use health::{AgentHealthState, AgentHealthStatus, AgentMonitor};
pub use registration::{AgentRegistrationStatus, RegistrationAttempt};
pub use retry::{RetryConfig, TaskRetryConfig};
pub use task_queue::TaskQueue;
pub use types::{ContextMap, Message, MessageType, Task, TaskPriority, TaskStatus};
pub use workflow::{Workflow, WorkflowEngine, WorkflowOutcome, WorkflowResult, WorkflowStep};
