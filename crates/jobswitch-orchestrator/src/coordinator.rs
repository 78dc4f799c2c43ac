use crate::engine::Orchestrator;
use crate::types::{Task, TaskStatus};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowResult};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Fallback poll period while waiting on workflow tasks.
const WORKFLOW_POLL: Duration = Duration::from_millis(100);

enum Progress {
    Running,
    Done,
    Failed { step_id: String, error: String },
}

impl Orchestrator {
    /// Run a multi-step workflow across agents.
    ///
    /// Invalid graphs are rejected before anything runs. With an external
    /// engine the workflow is handed over whole; otherwise every step becomes
    /// a task wired to the tasks of the steps it depends on. A failed step
    /// cancels the steps still queued. Step failures are reported in the
    /// result, not as errors.
    pub async fn coordinate_agents(&self, workflow: Workflow) -> JobSwitchResult<WorkflowResult> {
        workflow.validate()?;
        match self.shared.workflow_engine.clone() {
            Some(engine) => self.run_external_workflow(engine, &workflow).await,
            None => self.run_local_workflow(&workflow).await,
        }
    }

    async fn run_external_workflow(
        &self,
        engine: Arc<dyn WorkflowEngine>,
        workflow: &Workflow,
    ) -> JobSwitchResult<WorkflowResult> {
        info!(workflow = %workflow.name, steps = workflow.steps.len(), "Handing workflow to engine");
        let created = engine.create_workflow(workflow.to_definition()).await?;
        if !created.success {
            return Ok(WorkflowResult {
                success: false,
                workflow_id: created.workflow_id.unwrap_or_default(),
                results: BTreeMap::new(),
                task_ids: BTreeMap::new(),
                error: Some(created.error.unwrap_or_else(|| "workflow creation failed".into())),
            });
        }
        let workflow_id = created.workflow_id.ok_or_else(|| {
            JobSwitchError::Workflow("engine created a workflow without an id".into())
        })?;

        let executed = engine
            .execute_workflow(&workflow_id, workflow.input.clone())
            .await?;
        let results = match executed.results {
            Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
            Some(serde_json::Value::Null) | None => BTreeMap::new(),
            Some(other) => BTreeMap::from([("result".to_string(), other)]),
        };
        info!(workflow_id = %workflow_id, success = executed.success, "Engine workflow finished");
        Ok(WorkflowResult {
            success: executed.success,
            workflow_id: executed.workflow_id.unwrap_or(workflow_id),
            results,
            task_ids: BTreeMap::new(),
            error: executed.error,
        })
    }

    async fn run_local_workflow(&self, workflow: &Workflow) -> JobSwitchResult<WorkflowResult> {
        for step in &workflow.steps {
            if !self.is_registered(&step.agent_id).await {
                return Err(JobSwitchError::Validation(format!(
                    "Step '{}' targets unregistered agent '{}'",
                    step.id, step.agent_id
                )));
            }
        }

        let workflow_id = Uuid::new_v4().to_string();
        info!(workflow_id = %workflow_id, workflow = %workflow.name, steps = workflow.steps.len(), "Running workflow locally");

        let mut task_ids: BTreeMap<String, Uuid> = BTreeMap::new();
        for step in workflow.topological_order() {
            let dependencies = step
                .depends_on
                .iter()
                .filter_map(|dep| task_ids.get(dep).copied())
                .collect();
            let mut task = Task::new(&step.agent_id, &step.task_type, step.payload.clone())
                .with_priority(step.priority)
                .with_dependencies(dependencies);
            if let Some(max_retries) = step.max_retries {
                task = task.with_max_retries(max_retries);
            }
            if let Some(timeout_seconds) = step.timeout_seconds {
                task = task.with_timeout_seconds(timeout_seconds);
            }
            match self.submit_task(task).await {
                Ok(id) => {
                    task_ids.insert(step.id.clone(), id);
                }
                Err(e) => {
                    self.cancel_unfinished(&task_ids).await;
                    return Err(e);
                }
            }
        }

        let timeout = self.shared.config.workflow_timeout();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let finished = self.shared.task_finished.notified();
                match self.workflow_progress(&task_ids).await {
                    Progress::Running => {}
                    other => return other,
                }
                tokio::select! {
                    _ = finished => {}
                    _ = tokio::time::sleep(WORKFLOW_POLL) => {}
                }
            }
        })
        .await;

        let error = match waited {
            Ok(Progress::Done) => None,
            Ok(Progress::Failed { step_id, error }) => {
                warn!(workflow_id = %workflow_id, step_id = %step_id, error = %error, "Workflow step failed");
                Some(format!("step '{step_id}' failed: {error}"))
            }
            Ok(Progress::Running) | Err(_) => {
                warn!(workflow_id = %workflow_id, timeout_secs = timeout.as_secs_f64(), "Workflow timed out");
                Some(format!("workflow timed out after {}s", timeout.as_secs_f64()))
            }
        };
        if error.is_some() {
            self.cancel_unfinished(&task_ids).await;
        }

        let mut results = BTreeMap::new();
        {
            let queue = self.shared.queue.read().await;
            for (step_id, task_id) in &task_ids {
                if let Some(task) = queue.get(*task_id) {
                    if task.status == TaskStatus::Completed {
                        results.insert(step_id.clone(), task.result.clone().unwrap_or_default());
                    }
                }
            }
        }

        info!(workflow_id = %workflow_id, success = error.is_none(), completed_steps = results.len(), "Workflow finished");
        Ok(WorkflowResult {
            success: error.is_none(),
            workflow_id,
            results,
            task_ids,
            error,
        })
    }

    async fn workflow_progress(&self, task_ids: &BTreeMap<String, Uuid>) -> Progress {
        let queue = self.shared.queue.read().await;
        let mut done = true;
        for (step_id, task_id) in task_ids {
            let Some(task) = queue.get(*task_id) else {
                return Progress::Failed {
                    step_id: step_id.clone(),
                    error: "task disappeared".into(),
                };
            };
            match task.status {
                TaskStatus::Completed => {}
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    return Progress::Failed {
                        step_id: step_id.clone(),
                        error: task.error.clone().unwrap_or_else(|| task.status.to_string()),
                    };
                }
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Retrying => done = false,
            }
        }
        if done {
            Progress::Done
        } else {
            Progress::Running
        }
    }

    /// Cancel workflow tasks that are still waiting to run.
    async fn cancel_unfinished(&self, task_ids: &BTreeMap<String, Uuid>) {
        let waiting: Vec<Uuid> = {
            let queue = self.shared.queue.read().await;
            task_ids
                .values()
                .filter(|id| {
                    queue
                        .get(**id)
                        .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
                })
                .copied()
                .collect()
        };
        for id in waiting {
            if let Err(e) = self.cancel_task(id).await {
                warn!(task_id = %id, error = %e, "Failed to cancel workflow task");
            }
        }
    }
}
