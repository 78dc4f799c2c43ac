use async_trait::async_trait;
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use jobswitch_orchestrator::{Agent, ContextMap, Task, TaskPriority};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Built-in agent that answers every request with its payload.
pub struct EchoAgent;

pub const ECHO_AGENT_ID: &str = "echo";

#[async_trait]
impl Agent for EchoAgent {
    fn agent_id(&self) -> &str {
        ECHO_AGENT_ID
    }

    async fn process_request(
        &self,
        payload: serde_json::Value,
        _context: &ContextMap,
    ) -> JobSwitchResult<serde_json::Value> {
        Ok(payload)
    }

    async fn get_status(&self) -> JobSwitchResult<serde_json::Value> {
        Ok(serde_json::json!({ "agent": ECHO_AGENT_ID, "kind": "builtin" }))
    }
}

fn default_agent() -> String {
    ECHO_AGENT_ID.to_string()
}

fn default_task_type() -> String {
    "echo".to_string()
}

/// One entry of a `--tasks` file.
#[derive(Debug, Deserialize)]
pub struct TaskSpec {
    /// Label other entries use in `depends_on`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_agent")]
    pub agent_id: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Parse a JSON array of task specs.
pub fn parse_task_file(raw: &str) -> JobSwitchResult<Vec<TaskSpec>> {
    let specs: Vec<TaskSpec> = serde_json::from_str(raw)?;
    Ok(specs)
}

pub fn load_task_file(path: &Path) -> JobSwitchResult<Vec<TaskSpec>> {
    let raw = std::fs::read_to_string(path)?;
    parse_task_file(&raw)
}

/// Turn specs into tasks, resolving `depends_on` names to earlier entries.
///
/// Returns each task with its display label (name, or position).
pub fn build_tasks(specs: Vec<TaskSpec>) -> JobSwitchResult<Vec<(String, Task)>> {
    let mut by_name: HashMap<String, Uuid> = HashMap::new();
    let mut tasks = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let mut dependencies = Vec::with_capacity(spec.depends_on.len());
        for dep in &spec.depends_on {
            let id = by_name.get(dep).copied().ok_or_else(|| {
                JobSwitchError::Validation(format!(
                    "task #{index} depends on '{dep}', which is not defined earlier in the file"
                ))
            })?;
            dependencies.push(id);
        }

        let mut task = Task::new(spec.agent_id, spec.task_type, spec.payload)
            .with_priority(spec.priority)
            .with_dependencies(dependencies);
        if let Some(max_retries) = spec.max_retries {
            task = task.with_max_retries(max_retries);
        }
        if let Some(timeout_seconds) = spec.timeout_seconds {
            task = task.with_timeout_seconds(timeout_seconds);
        }

        let label = match spec.name {
            Some(name) => {
                if by_name.insert(name.clone(), task.id).is_some() {
                    return Err(JobSwitchError::Validation(format!(
                        "task name '{name}' is used more than once"
                    )));
                }
                name
            }
            None => format!("#{index}"),
        };
        tasks.push((label, task));
    }
    Ok(tasks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_echo() {
        let specs = parse_task_file(r#"[{"payload": {"x": 1}}]"#).unwrap();
        let tasks = build_tasks(specs).unwrap();
        let (label, task) = &tasks[0];
        assert_eq!(label, "#0");
        assert_eq!(task.agent_id, "echo");
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.payload["x"], 1);
    }

    #[test]
    fn test_dependencies_resolve_by_name() {
        let specs = parse_task_file(
            r#"[
                {"name": "parse", "payload": {}},
                {"name": "score", "depends_on": ["parse"], "priority": "urgent", "max_retries": 0}
            ]"#,
        )
        .unwrap();
        let tasks = build_tasks(specs).unwrap();
        assert_eq!(tasks[1].1.dependencies, vec![tasks[0].1.id]);
        assert_eq!(tasks[1].1.priority, TaskPriority::Urgent);
        assert_eq!(tasks[1].1.max_retries, 0);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let specs = parse_task_file(r#"[{"depends_on": ["later"]}, {"name": "later"}]"#).unwrap();
        let err = build_tasks(specs).unwrap_err();
        assert!(err.to_string().contains("later"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let specs = parse_task_file(r#"[{"name": "a"}, {"name": "a"}]"#).unwrap();
        assert!(build_tasks(specs).is_err());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            parse_task_file("{not json").unwrap_err(),
            JobSwitchError::Json(_)
        ));
    }

    #[tokio::test]
    async fn test_echo_agent_returns_payload() {
        let payload = serde_json::json!({"resume": "draft"});
        let result = EchoAgent
            .process_request(payload.clone(), &ContextMap::new())
            .await
            .unwrap();
        assert_eq!(result, payload);
        assert!(EchoAgent.get_status().await.unwrap().is_object());
    }
}
