//! CLI surface: a thin clap layer over the services.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use uuid::Uuid;

use crate::domain::models::{DagDefinition, Task, TaskStatus};
use crate::domain::ports::TaskFilter;
use crate::services::queue::ReorderAnchor;
use crate::services::review::ReviewHandler;
use crate::services::task_store::TaskStore;
use crate::services::{DagEngine, PriorityQueue};

#[derive(Parser)]
#[command(name = "foreman", version, about = "Local-first orchestrator for AI-assisted work")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator loops (dispatcher, watchdog, scheduler)
    Serve,
    /// Task management
    #[command(subcommand)]
    Task(TaskCommands),
    /// Queue inspection and reordering
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Human approvals
    #[command(subcommand)]
    Approval(ApprovalCommands),
    /// Pipeline runs
    #[command(subcommand)]
    Dag(DagCommands),
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Submit a new task
    Submit {
        /// The prompt / instructions
        prompt: String,
        #[arg(long, default_value = "chat")]
        task_type: String,
        #[arg(long)]
        backend: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        summary: Option<String>,
        /// Task ids this one depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<Uuid>,
    },
    /// List tasks, optionally by status
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one task
    Show { id: Uuid },
    /// Block a task for operator attention
    Block { id: Uuid },
    /// Return a blocked task to the queue
    Unblock { id: Uuid },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show the next dispatchable task
    Next {
        #[arg(long)]
        task_type: Option<String>,
    },
    /// Move a task within its priority bucket
    Reorder {
        id: Uuid,
        #[arg(long, conflicts_with_all = ["before", "after"])]
        top: bool,
        #[arg(long)]
        before: Option<Uuid>,
        #[arg(long)]
        after: Option<Uuid>,
    },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List pending approvals
    List,
    /// Approve a task in review
    Approve { id: Uuid },
    /// Reject a task in review, bouncing it with feedback
    Reject {
        id: Uuid,
        #[arg(long)]
        feedback: String,
    },
}

#[derive(Subcommand)]
pub enum DagCommands {
    /// Validate and execute a pipeline definition from a YAML/JSON file
    Run {
        /// Path to the definition
        file: std::path::PathBuf,
        /// Run context entries, key=json-value
        #[arg(long, value_delimiter = ',')]
        context: Vec<String>,
    },
    /// List stored runs
    Runs {
        #[arg(long)]
        dag_name: Option<String>,
    },
}

pub async fn handle_task(store: &Arc<TaskStore>, cmd: TaskCommands, json: bool) -> Result<()> {
    match cmd {
        TaskCommands::Submit {
            prompt,
            task_type,
            backend,
            priority,
            summary,
            depends_on,
        } => {
            let mut task = Task::new(task_type, prompt).with_priority(priority);
            if let Some(summary) = summary {
                task = task.with_summary(summary);
            }
            task.backend = backend;
            for dep in depends_on {
                task = task.with_dependency(dep);
            }
            let task = store.create(task, "cli").await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                println!("submitted {} ({})", task.id, task.summary);
            }
        }
        TaskCommands::List { status, limit } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    TaskStatus::from_str(s).with_context(|| format!("unknown status {s:?}"))?,
                ),
                None => None,
            };
            let tasks = store
                .list(TaskFilter {
                    status,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_task_table(&tasks);
            }
        }
        TaskCommands::Show { id } => {
            let task = store.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Block { id } => {
            store
                .transition(
                    id,
                    TaskStatus::Blocked,
                    crate::domain::models::TransitionRequest::default(),
                    "cli",
                )
                .await?;
            println!("blocked {id}");
        }
        TaskCommands::Unblock { id } => {
            store
                .transition(
                    id,
                    TaskStatus::Pending,
                    crate::domain::models::TransitionRequest::default(),
                    "cli",
                )
                .await?;
            println!("unblocked {id}");
        }
    }
    Ok(())
}

pub async fn handle_queue(queue: &PriorityQueue, cmd: QueueCommands, json: bool) -> Result<()> {
    match cmd {
        QueueCommands::Next { task_type } => match queue.next(task_type.as_deref()).await? {
            Some(task) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&task)?);
                } else {
                    println!("{} [{}] {}", task.id, task.task_type, task.summary);
                }
            }
            None => println!("queue is empty"),
        },
        QueueCommands::Reorder { id, top, before, after } => {
            let anchor = if top {
                ReorderAnchor::Top
            } else if let Some(before) = before {
                ReorderAnchor::Before(before)
            } else if let Some(after) = after {
                ReorderAnchor::After(after)
            } else {
                bail!("specify one of --top, --before, --after");
            };
            queue.reorder(id, anchor).await?;
            println!("reordered {id}");
        }
    }
    Ok(())
}

pub async fn handle_approval(
    handler: &ReviewHandler,
    approvals: &Arc<dyn crate::domain::ports::ApprovalRepository>,
    cmd: ApprovalCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        ApprovalCommands::List => {
            let pending = approvals.list_pending().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else {
                for approval in pending {
                    println!("{}  task={}  since={}", approval.id, approval.task_id, approval.created_at);
                }
            }
        }
        ApprovalCommands::Approve { id } => {
            handler.resolve_approval(id, true, None).await?;
            println!("approved {id}");
        }
        ApprovalCommands::Reject { id, feedback } => {
            handler.resolve_approval(id, false, Some(feedback)).await?;
            println!("rejected {id}");
        }
    }
    Ok(())
}

pub async fn handle_dag(
    engine: &DagEngine,
    runs_repo: &Arc<dyn crate::domain::ports::DagRunRepository>,
    cmd: DagCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        DagCommands::Run { file, context } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let definition: DagDefinition = if file.extension().is_some_and(|e| e == "json") {
                serde_json::from_str(&raw)?
            } else {
                serde_yaml::from_str(&raw)?
            };

            let mut run_context = BTreeMap::new();
            for entry in context {
                let (key, value) = entry
                    .split_once('=')
                    .with_context(|| format!("bad context entry {entry:?}, expected key=value"))?;
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
                run_context.insert(key.to_string(), value);
            }

            runs_repo.save_definition(&definition).await?;
            let run = engine.create_run(&definition, run_context).await?;
            let agent = Arc::new(crate::adapters::ShellBlockAgent::default());
            let run = engine.execute(&definition, run, agent).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("run {} finished: {}", run.id, run.status.as_str());
                for (block_id, instance) in &run.blocks {
                    println!(
                        "  {block_id}: {} (attempts: {})",
                        instance.status.as_str(),
                        instance.retry_state.attempt
                    );
                }
            }
        }
        DagCommands::Runs { dag_name } => {
            let runs = runs_repo.list_runs(dag_name.as_deref()).await?;
            for run in runs {
                println!("{}  {}  {}", run.id, run.dag_name, run.status.as_str());
            }
        }
    }
    Ok(())
}

fn print_task_table(tasks: &[Task]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["id", "type", "status", "prio", "attempts", "summary"]);
    for task in tasks {
        table.add_row(vec![
            task.id.to_string(),
            task.task_type.clone(),
            task.status.as_str().to_string(),
            task.priority.to_string(),
            format!("{}/{}", task.attempt_count, task.max_attempts),
            task.summary.chars().take(60).collect(),
        ]);
    }
    println!("{table}");
}
