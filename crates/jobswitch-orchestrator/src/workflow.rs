use crate::types::TaskPriority;
use async_trait::async_trait;
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// External workflow engine that can run a whole multi-agent workflow.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Prepare the engine. A failure here aborts orchestrator start.
    async fn initialize(&self) -> JobSwitchResult<()> {
        Ok(())
    }

    async fn create_workflow(&self, definition: serde_json::Value) -> JobSwitchResult<WorkflowOutcome>;

    async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> JobSwitchResult<WorkflowOutcome>;
}

/// Response shape shared by `create_workflow` and `execute_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub success: bool,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One step of a workflow, executed as a task on `agent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub agent_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            payload,
            depends_on: Vec::new(),
            priority: TaskPriority::default(),
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn depends_on(mut self, step_ids: &[&str]) -> Self {
        self.depends_on = step_ids.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A named graph of steps handed to `coordinate_agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// Input passed to an external engine's `execute_workflow`.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            input: serde_json::Value::Null,
        }
    }

    /// Check the graph: non-empty, unique ids, known references, no cycles.
    pub fn validate(&self) -> JobSwitchResult<()> {
        if self.steps.is_empty() {
            return Err(JobSwitchError::Validation(format!(
                "Workflow '{}' has no steps",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(JobSwitchError::Validation("Workflow step id must not be empty".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(JobSwitchError::Validation(format!(
                    "Duplicate workflow step id '{}'",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(JobSwitchError::Validation(format!(
                    "Step '{}' depends on unknown step '{missing}'",
                    step.id
                )));
            }
        }
        if self.has_cycle() {
            return Err(JobSwitchError::Validation(format!(
                "Dependency cycle detected in workflow '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Check for cycles in the step dependency graph.
    pub fn has_cycle(&self) -> bool {
        let graph: HashMap<&str, &WorkflowStep> =
            self.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut visited = HashMap::new();
        for step in &self.steps {
            if Self::dfs_cycle(&graph, step.id.as_str(), &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(
        graph: &HashMap<&'a str, &'a WorkflowStep>,
        id: &'a str,
        visited: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(step) = graph.get(id) {
            for dep in &step.depends_on {
                if Self::dfs_cycle(graph, dep.as_str(), visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Steps ordered so every step follows its dependencies. Assumes a valid graph.
    pub fn topological_order(&self) -> Vec<&WorkflowStep> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.steps.len());
        while ordered.len() < self.steps.len() {
            let before = ordered.len();
            for step in &self.steps {
                if !placed.contains(step.id.as_str())
                    && step.depends_on.iter().all(|d| placed.contains(d.as_str()))
                {
                    placed.insert(step.id.as_str());
                    ordered.push(step);
                }
            }
            if ordered.len() == before {
                break;
            }
        }
        ordered
    }

    /// Definition handed to an external engine.
    pub fn to_definition(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "steps": self.steps,
        })
    }
}

/// Outcome of `coordinate_agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub workflow_id: String,
    /// step id -> result of the step's task.
    pub results: BTreeMap<String, serde_json::Value>,
    /// step id -> task id, empty when an external engine ran the workflow.
    pub task_ids: BTreeMap<String, Uuid>,
    pub error: Option<String>,
}
