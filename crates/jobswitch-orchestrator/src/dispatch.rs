use crate::agent::Agent;
use crate::engine::Orchestrator;
use crate::types::{Task, TaskPriority, TaskStatus};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Orchestrator {
    /// Queue a task for its agent. Returns the task id.
    ///
    /// Fails without touching the queue when the agent is unknown or the
    /// queue is full.
    pub async fn submit_task(&self, task: Task) -> JobSwitchResult<Uuid> {
        {
            let agents = self.shared.agents.read().await;
            if !agents.contains_key(&task.agent_id) {
                let mut known: Vec<&str> = agents.keys().map(String::as_str).collect();
                known.sort_unstable();
                return Err(JobSwitchError::agent(
                    &task.agent_id,
                    format!("agent not registered (registered: [{}])", known.join(", ")),
                ));
            }
        }

        let id = self.shared.queue.write().await.enqueue(task.clone())?;
        info!(
            task_id = %id,
            agent_id = %task.agent_id,
            task_type = %task.task_type,
            priority = %task.priority,
            dependencies = task.dependencies.len(),
            generation = task.generation,
            "Task submitted"
        );
        self.persist_task(&task).await;
        self.shared.task_wakeup.notify_one();
        Ok(id)
    }

    /// Build a task from parts and submit it.
    pub async fn create_task(
        &self,
        agent_id: &str,
        task_type: &str,
        payload: serde_json::Value,
        priority: TaskPriority,
        dependencies: Vec<Uuid>,
    ) -> JobSwitchResult<Uuid> {
        let task = Task::new(agent_id, task_type, payload)
            .with_priority(priority)
            .with_dependencies(dependencies);
        self.submit_task(task).await
    }

    /// Cancel the newest generation of a task.
    ///
    /// A queued task is removed at once. A running task is only marked: the
    /// agent call finishes and its result is discarded.
    pub async fn cancel_task(&self, task_id: Uuid) -> JobSwitchResult<()> {
        let cancelled = self.shared.queue.write().await.cancel(task_id)?;
        info!(task_id = %cancelled.id, agent_id = %cancelled.agent_id, "Task cancelled");
        self.persist_task(&cancelled).await;
        self.shared.task_finished.notify_waiters();
        Ok(())
    }

    pub(crate) async fn dispatch_loop(self) {
        let interval = self.shared.config.dispatch_interval();
        debug!("Task dispatch loop started");
        while self.is_running() {
            self.dispatch_ready_tasks().await;
            tokio::select! {
                _ = self.shared.task_wakeup.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Task dispatch loop stopped");
    }

    /// Start every ready task the concurrency limit and agent loads allow.
    ///
    /// Tasks whose agent is at capacity go to the back of the queue; the pass
    /// ends once it has deferred as many tasks as were pending.
    async fn dispatch_ready_tasks(&self) {
        let max_concurrent = self.shared.config.max_concurrent_tasks;
        let mut started: Vec<(Task, Arc<dyn Agent>, u64)> = Vec::new();
        let mut orphaned: Vec<Task> = Vec::new();
        {
            let mut queue = self.shared.queue.write().await;
            let budget = queue.pending_count();
            let mut deferred = 0;
            while queue.active_count() < max_concurrent && deferred < budget {
                let Some(task) = queue.pop_ready() else {
                    break;
                };
                let Some(agent) = self.agent(&task.agent_id).await else {
                    let error = format!("agent '{}' is no longer registered", task.agent_id);
                    queue.record_failed(task.clone(), error);
                    orphaned.push(task);
                    continue;
                };
                let Some(registration) = self.shared.monitor.try_start_task(&task.agent_id).await
                else {
                    debug!(task_id = %task.id, agent_id = %task.agent_id, "Agent at capacity, deferring task");
                    queue.requeue_back(task);
                    deferred += 1;
                    continue;
                };
                let task = queue.mark_in_progress(task);
                started.push((task, agent, registration));
            }
        }

        for task in orphaned {
            warn!(task_id = %task.id, agent_id = %task.agent_id, "Dropping task for unregistered agent");
            self.shared.task_finished.notify_waiters();
        }
        for (task, agent, registration) in started {
            self.persist_task(&task).await;
            tokio::spawn(self.clone().execute_task(task, agent, registration));
        }
    }

    /// Run one task generation against its agent and fold the outcome into
    /// task state. Errors never escape this function.
    ///
    /// `registration` is the agent registration the load slot was taken from.
    async fn execute_task(self, task: Task, agent: Arc<dyn Agent>, registration: u64) {
        let context = self.shared.context.read().await.snapshot_for(&task.agent_id);
        debug!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            generation = task.generation,
            "Executing task"
        );

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            task.timeout(),
            agent.process_request(task.payload.clone(), &context),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}s", task.timeout_seconds)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self
                    .shared
                    .monitor
                    .finish_success(&task.agent_id, registration, elapsed)
                    .await;
                let finished = self.shared.queue.write().await.complete(task.id, result);
                if let Some(finished) = finished {
                    if finished.status == TaskStatus::Completed {
                        info!(
                            task_id = %finished.id,
                            agent_id = %finished.agent_id,
                            duration_ms = elapsed.as_millis() as u64,
                            "Task completed"
                        );
                    } else {
                        info!(task_id = %finished.id, "Cancelled task finished, result discarded");
                    }
                    self.persist_task(&finished).await;
                }
            }
            Err(error) => {
                self.shared.monitor.finish_error(&task.agent_id, registration).await;
                let (finished, blocked) = {
                    let mut queue = self.shared.queue.write().await;
                    let finished = queue.fail(task.id, error.clone());
                    let blocked = match &finished {
                        Some(t) if t.status == TaskStatus::Failed => queue.waiting_on(t.id),
                        _ => Vec::new(),
                    };
                    (finished, blocked)
                };
                if !blocked.is_empty() {
                    warn!(
                        task_id = %task.id,
                        dependents = ?blocked,
                        "Dependents of a failed task stay pending"
                    );
                }
                if let Some(finished) = finished {
                    match finished.status {
                        TaskStatus::Retrying => {
                            warn!(
                                task_id = %finished.id,
                                agent_id = %finished.agent_id,
                                retry_count = finished.retry_count,
                                max_retries = finished.max_retries,
                                error = %error,
                                "Task failed, scheduling retry"
                            );
                            self.schedule_retry(finished.id, finished.retry_count);
                        }
                        _ => warn!(
                            task_id = %finished.id,
                            agent_id = %finished.agent_id,
                            status = %finished.status,
                            error = %error,
                            "Task failed"
                        ),
                    }
                    self.persist_task(&finished).await;
                }
            }
        }

        self.shared.task_finished.notify_waiters();
        self.shared.task_wakeup.notify_one();
    }

    fn schedule_retry(&self, task_id: Uuid, retry_count: u32) {
        let delay = self.shared.config.task_retry.delay_for(retry_count);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.resubmit(task_id).await;
        });
    }

    /// Queue the next generation of a retrying task, unless it was cancelled.
    async fn resubmit(&self, task_id: Uuid) {
        let next = {
            let mut queue = self.shared.queue.write().await;
            let Some(next) = queue.take_retry(task_id) else {
                debug!(task_id = %task_id, "Retry no longer wanted");
                return;
            };
            if !self.is_registered(&next.agent_id).await {
                let error = format!("agent '{}' is no longer registered", next.agent_id);
                warn!(task_id = %next.id, agent_id = %next.agent_id, "Retry dropped, agent gone");
                queue.record_failed(next, error);
                drop(queue);
                self.shared.task_finished.notify_waiters();
                return;
            }
            match queue.enqueue(next.clone()) {
                Ok(_) => next,
                Err(e) => {
                    warn!(task_id = %next.id, error = %e, "Retry could not be queued");
                    queue.record_failed(next, e.to_string());
                    drop(queue);
                    self.shared.task_finished.notify_waiters();
                    return;
                }
            }
        };

        info!(
            task_id = %next.id,
            original_task_id = %next.original_task_id,
            retry_count = next.retry_count,
            "Task re-submitted"
        );
        self.persist_task(&next).await;
        self.shared.task_wakeup.notify_one();
    }

    /// Mirror a task snapshot to the broker as `task:{id}`.
    async fn persist_task(&self, task: &Task) {
        let Some(broker) = self.active_broker() else {
            return;
        };
        let fields = match serde_json::to_value(task) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(_) => return,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to serialize task");
                return;
            }
        };
        let key = format!("task:{}", task.id);
        let ttl = self.shared.config.cache.task_ttl();
        let result = async {
            broker.hset(&key, &fields).await?;
            broker.expire(&key, ttl).await
        }
        .await;
        if let Err(e) = result {
            warn!(task_id = %task.id, error = %e, "Failed to persist task to cache");
        }
    }
}
