mod tasks;

use clap::{Parser, Subcommand};
use jobswitch_core::{init_tracing, LogFormat};
use jobswitch_orchestrator::{Orchestrator, OrchestratorConfig, TaskStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "jobswitch", about = "JobSwitch agent orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "jobswitch.toml")]
    config: PathBuf,

    /// Log output format: text or json
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tasks in a JSON file against the built-in echo agent
    Run {
        /// JSON array of tasks
        #[arg(short, long)]
        tasks: PathBuf,
        /// Seconds to wait for every task to finish
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    OrchestratorConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {e}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { tasks, timeout } => run(config, &tasks, Duration::from_secs(timeout)).await,
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: OrchestratorConfig, tasks_path: &Path, timeout: Duration) -> anyhow::Result<()> {
    let specs = tasks::load_task_file(tasks_path)
        .map_err(|e| anyhow::anyhow!("Failed to read tasks '{}': {e}", tasks_path.display()))?;
    let tasks = tasks::build_tasks(specs)?;

    let orchestrator = Orchestrator::new(config);
    orchestrator.start().await?;
    orchestrator.register_agent(Arc::new(tasks::EchoAgent)).await?;

    let mut submitted: Vec<(String, Uuid)> = Vec::with_capacity(tasks.len());
    for (label, task) in tasks {
        match orchestrator.submit_task(task).await {
            Ok(id) => submitted.push((label, id)),
            Err(e) => {
                orchestrator.stop().await;
                return Err(anyhow::anyhow!("Failed to submit task '{label}': {e}"));
            }
        }
    }
    info!(count = submitted.len(), "Tasks submitted");

    if !wait_until_finished(&orchestrator, &submitted, timeout).await {
        warn!(timeout_secs = timeout.as_secs(), "Timed out waiting for tasks");
    }

    let mut report = serde_json::Map::new();
    for (label, id) in &submitted {
        let status = orchestrator
            .get_task_status(*id)
            .await
            .unwrap_or(serde_json::Value::Null);
        report.insert(label.clone(), status);
    }
    let output = serde_json::json!({
        "tasks": report,
        "orchestrator": orchestrator.get_orchestrator_status().await,
    });
    orchestrator.stop().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn wait_until_finished(
    orchestrator: &Orchestrator,
    submitted: &[(String, Uuid)],
    timeout: Duration,
) -> bool {
    let poll = async {
        loop {
            let mut finished = true;
            for (_, id) in submitted {
                let status = orchestrator
                    .get_task_status(*id)
                    .await
                    .and_then(|t| serde_json::from_value::<TaskStatus>(t["status"].clone()).ok());
                if !status.is_some_and(TaskStatus::is_terminal) {
                    finished = false;
                    break;
                }
            }
            if finished {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}
