use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eduflow::actions::ActionRegistry;
use eduflow::clients::{
    DbClient, DryRunNotificationClient, HttpNotificationClient, NotificationClient, SqliteDbClient,
};
use eduflow::config::Config;
use eduflow::engine::{Engine, FireOutcome};
use eduflow::idempotency::TriggerFiring;
use eduflow::nodes::NodeRegistry;
use eduflow::storage::{ExecutionQuery, ExecutionStatus, SqliteStorage};
use eduflow::workflow::{parse_workflow_file, validate_workflow_with_actions, WorkflowStatus};

#[derive(Parser)]
#[command(name = "eduflow")]
#[command(about = "Workflow automation engine for education platforms", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Inspect executions and their logs
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
    /// Start the server (API + scheduler)
    Serve {
        /// Overrides the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// List all workflows
    List {
        /// Only workflows owned by this institute
        #[arg(long)]
        institute: Option<String>,
    },
    /// Import (create or update) a workflow from a JSON or YAML file
    Import {
        /// Path to workflow file
        file: String,
    },
    /// Validate a workflow file without storing it
    Validate {
        /// Path to workflow file
        file: String,
    },
    /// Show a stored workflow and its version history
    Show {
        /// Workflow ID
        id: String,
    },
    /// Mark a workflow ACTIVE
    Activate {
        /// Workflow ID
        id: String,
    },
    /// Mark a workflow INACTIVE
    Deactivate {
        /// Workflow ID
        id: String,
    },
    /// Fire a workflow manually and wait for it to finish
    Run {
        /// Workflow ID
        id: String,
        /// JSON object seeding the execution context
        #[arg(short, long)]
        payload: Option<String>,
        /// Event id, used by EVENT_BASED idempotency
        #[arg(long)]
        event_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// List recent executions
    List {
        /// Filter by workflow ID
        #[arg(long)]
        workflow: Option<String>,
        /// Status filter: pending|running|succeeded|failed
        #[arg(long)]
        status: Option<String>,
        /// Page size
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show the per-node log of one execution
    Logs {
        /// Execution ID
        execution_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "eduflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Workflows { action } => match action {
            WorkflowActions::List { institute } => {
                cmd_workflows_list(&config, institute.as_deref()).await?
            }
            WorkflowActions::Import { file } => cmd_workflows_import(&config, &file).await?,
            WorkflowActions::Validate { file } => cmd_workflows_validate(&config, &file)?,
            WorkflowActions::Show { id } => cmd_workflows_show(&config, &id).await?,
            WorkflowActions::Activate { id } => {
                cmd_workflows_set_status(&config, &id, WorkflowStatus::Active).await?
            }
            WorkflowActions::Deactivate { id } => {
                cmd_workflows_set_status(&config, &id, WorkflowStatus::Inactive).await?
            }
            WorkflowActions::Run {
                id,
                payload,
                event_id,
            } => cmd_workflows_run(&config, &id, payload.as_deref(), event_id).await?,
        },
        Commands::Executions { action } => match action {
            ExecutionActions::List {
                workflow,
                status,
                limit,
            } => cmd_executions_list(&config, workflow, status.as_deref(), limit).await?,
            ExecutionActions::Logs { execution_id } => {
                cmd_executions_logs(&config, &execution_id).await?
            }
        },
        Commands::Serve { port } => cmd_serve(config, port).await?,
        Commands::Completions { shell } => cmd_completions(shell)?,
    }

    Ok(())
}

/// Shell completion variants
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Workflow Commands
// ============================================================================

async fn cmd_workflows_list(config: &Config, institute: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let workflows = storage.list_workflows(institute).await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Import one with: eduflow workflows import <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<30} {:<16} {:<10} {:<20}",
        "ID", "INSTITUTE", "STATUS", "UPDATED"
    );
    println!("{}", "-".repeat(78));

    for wf in workflows {
        println!(
            "{:<30} {:<16} {:<10} {:<20}",
            wf.id,
            wf.institute_id.as_deref().unwrap_or("-"),
            wf.status.as_str(),
            wf.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_workflows_import(config: &Config, file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let workflow = parse_workflow_file(path)?;
    validate_workflow_with_actions(&workflow, &build_actions(config)?)?;

    let storage = get_storage(config)?;
    let created_by = std::env::var("USER").ok();
    let version = storage.save_workflow(&workflow, created_by.as_deref()).await?;

    println!("✓ Workflow '{}' imported (version {})", workflow.id, version.version);
    println!();
    println!("  Nodes: {}", workflow.nodes.len());
    println!("  Status: {}", workflow.status.as_str());
    println!();
    println!("Run with: eduflow workflows run {}", workflow.id);

    Ok(())
}

fn cmd_workflows_validate(config: &Config, file: &str) -> anyhow::Result<()> {
    let workflow = parse_workflow_file(Path::new(file))?;

    match validate_workflow_with_actions(&workflow, &build_actions(config)?) {
        Ok(()) => {
            println!("✓ Workflow '{}' is valid", workflow.id);
            println!("  Nodes: {}", workflow.nodes.len());
            let types: Vec<&str> = workflow.node_types().iter().map(|t| t.as_str()).collect();
            println!("  Node types: {}", types.join(", "));
            Ok(())
        }
        Err(e) => anyhow::bail!("✗ {}", e),
    }
}

async fn cmd_workflows_show(config: &Config, id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let stored = storage
        .get_workflow(id)
        .await?
        .with_context(|| format!("Workflow not found: {}", id))?;
    let definition = stored.to_definition()?;

    println!("Workflow: {}", stored.id);
    println!("Name: {}", stored.name);
    println!("Institute: {}", stored.institute_id.as_deref().unwrap_or("-"));
    println!("Status: {}", stored.status.as_str());
    println!("Updated: {}", stored.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    println!("Nodes:");
    for node in &definition.nodes {
        let targets = node.routing.targets();
        println!(
            "  {:<24} {:<14} -> {}",
            node.id,
            node.node_type.as_str(),
            if targets.is_empty() {
                "end".to_string()
            } else {
                targets.join(", ")
            }
        );
    }

    let versions = storage.list_workflow_versions(id).await?;
    if !versions.is_empty() {
        println!();
        println!("Versions:");
        for v in versions {
            println!(
                "  v{:<4} {} {} {}",
                v.version,
                v.created_at.format("%Y-%m-%d %H:%M"),
                &v.checksum[..v.checksum.len().min(8)],
                v.created_by.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

async fn cmd_workflows_set_status(
    config: &Config,
    id: &str,
    status: WorkflowStatus,
) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    if !storage.set_workflow_status(id, status).await? {
        anyhow::bail!("Workflow not found: {}", id);
    }
    println!("✓ Workflow '{}' is now {}", id, status.as_str());
    Ok(())
}

async fn cmd_workflows_run(
    config: &Config,
    id: &str,
    payload: Option<&str>,
    event_id: Option<String>,
) -> anyhow::Result<()> {
    let payload: Map<String, Value> = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload must be a JSON object")?,
        None => Map::new(),
    };

    let engine = build_engine(config)?;
    match engine
        .fire(id, TriggerFiring::manual(event_id, payload))
        .await?
    {
        FireOutcome::Started {
            execution_id,
            handle,
        } => {
            println!("Started execution {}", execution_id);
            let execution = handle.await??;
            let duration = match (execution.started_at, execution.completed_at) {
                (Some(s), Some(c)) => format!("{}ms", (c - s).num_milliseconds()),
                _ => "-".to_string(),
            };
            println!("Status: {} ({})", execution.status, duration);
            if let Some(error) = &execution.error_message {
                println!(
                    "Failed at node '{}': {}",
                    execution.failed_node_id.as_deref().unwrap_or("?"),
                    error
                );
            }
            println!();
            println!("Logs: eduflow executions logs {}", execution.id);
        }
        FireOutcome::Duplicate {
            idempotency_key,
            existing_execution_id,
        } => {
            println!(
                "Duplicate firing (key {}); existing execution {}",
                idempotency_key, existing_execution_id
            );
        }
    }

    Ok(())
}

// ============================================================================
// Execution Commands
// ============================================================================

async fn cmd_executions_list(
    config: &Config,
    workflow: Option<String>,
    status: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let status = status.map(str::parse::<ExecutionStatus>).transpose()?;
    let storage = get_storage(config)?;
    let executions = storage
        .list_executions(&ExecutionQuery {
            workflow_id: workflow,
            status,
            limit,
            ..Default::default()
        })
        .await?;

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<10} {:<10} {:<20}",
        "ID", "WORKFLOW", "TRIGGER", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(104));
    for e in executions {
        println!(
            "{:<38} {:<24} {:<10} {:<10} {:<20}",
            e.id,
            e.workflow_id,
            e.trigger_type,
            e.status,
            e.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cmd_executions_logs(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let trace = storage
        .get_execution_trace(execution_id)
        .await?
        .with_context(|| format!("Execution not found: {}", execution_id))?;

    let execution = &trace.execution;
    println!("Execution: {}", execution.id);
    println!(
        "Workflow: {} (v{})",
        execution.workflow_id, execution.workflow_version
    );
    println!("Key: {}", execution.idempotency_key);
    println!("Status: {}", execution.status);
    if let Some(error) = &execution.error_message {
        println!(
            "Error at '{}': {}",
            execution.failed_node_id.as_deref().unwrap_or("?"),
            error
        );
    }
    println!();

    for log in &trace.logs {
        let timing = log
            .execution_time_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();
        println!(
            "{:<24} {:<14} {:<10} {:>8}",
            log.node_template_id, log.node_type, log.status, timing
        );
        if let Some(error) = &log.error_message {
            println!(
                "    {}: {}",
                log.error_type.as_deref().unwrap_or("ERROR"),
                error
            );
        }
    }

    Ok(())
}

// ============================================================================
// Server
// ============================================================================

async fn cmd_serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    use eduflow::api::{create_router, AppState};
    use eduflow::triggers::Scheduler;

    eduflow::metrics::init_metrics();

    let engine = build_engine(&config)?;
    engine.recover_interrupted().await?;

    let scheduler = Scheduler::new(engine.clone()).await?;
    scheduler.start().await?;
    let job_count = scheduler.job_count().await;

    let app = create_router(AppState::new(engine));

    let port = port.unwrap_or(config.server.port);
    let addr = format!("{}:{}", config.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!("eduflow server running on http://{}", addr);
    println!();
    println!("Scheduler: {} job(s) active", job_count);
    println!(
        "Notifications: {}",
        config
            .notification
            .base_url
            .as_deref()
            .unwrap_or("dry-run (logging only)")
    );
    println!();
    println!("API endpoints:");
    println!("  GET  /api/health");
    println!("  GET  /metrics");
    println!("  GET  /api/workflows");
    println!("  GET  /api/workflows/{{id}}");
    println!("  POST /api/workflows/{{id}}/fire");
    println!("  POST /api/events");
    println!("  GET  /api/executions");
    println!("  GET  /api/executions/{{id}}");
    println!("  GET  /api/executions/{{id}}/logs");
    println!();
    println!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await?;

    println!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down gracefully...");
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let db_path = config.database_path();
    ensure_parent_dir(&db_path)?;
    Ok(SqliteStorage::open(&db_path)?)
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn build_clients(
    config: &Config,
) -> anyhow::Result<(Arc<dyn NotificationClient>, Arc<dyn DbClient>)> {
    let notifications: Arc<dyn NotificationClient> = match &config.notification.base_url {
        Some(url) => Arc::new(HttpNotificationClient::new(
            url,
            config.notification.api_key.clone(),
            config.notification.timeout(),
        )),
        None => Arc::new(DryRunNotificationClient),
    };

    let data_path = config.data_database_path();
    ensure_parent_dir(&data_path)?;
    let db: Arc<dyn DbClient> = Arc::new(SqliteDbClient::open(&data_path)?);

    Ok((notifications, db))
}

fn build_actions(config: &Config) -> anyhow::Result<ActionRegistry> {
    let (notifications, db) = build_clients(config)?;
    Ok(ActionRegistry::new(notifications, db))
}

fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let (notifications, db) = build_clients(config)?;
    let actions = Arc::new(ActionRegistry::new(notifications, db.clone()));
    let nodes = NodeRegistry::new(actions, db, config.engine.combot_max_concurrency);
    Ok(Engine::new(
        get_storage(config)?,
        nodes,
        config.engine_config(),
    ))
}
