use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use opsflow::actions::{ActionRegistry, ActionServices, LogNotifier};
use opsflow::api::{create_router, AppState};
use opsflow::config::Config;
use opsflow::shutdown::ShutdownCoordinator;
use opsflow::storage::{ExecutionFilter, SqliteStorage};
use opsflow::triggers::{Caller, Scheduler};
use opsflow::workflow::{parse_workflow_file, validate_workflow, WorkflowStatus};
use opsflow::{AdminService, Engine, RunMode, TriggerHub};

#[derive(Parser)]
#[command(name = "opsflow")]
#[command(about = "Embedded workflow automation engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/opsflow/config.toml)
    #[arg(short, long, global = true, env = "OPSFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (API + scheduler)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Parse and validate a workflow file without storing it
    Validate {
        /// Path to workflow YAML file
        file: PathBuf,
    },
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Inspect executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// List workflows of a tenant
    List {
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },
    /// Create a workflow from a YAML file
    Create {
        file: PathBuf,
        #[arg(short, long, default_value = "default")]
        tenant: String,
        /// Activate right after creation
        #[arg(long)]
        activate: bool,
    },
    /// Run a manually triggered workflow and wait for it
    Run {
        /// Workflow ID
        id: String,
        #[arg(short, long, default_value = "default")]
        tenant: String,
        /// Parameter values (key=value)
        #[arg(short, long = "param", value_parser = parse_var)]
        params: Vec<(String, String)>,
        #[arg(long)]
        role: Option<String>,
        /// Seconds to wait for completion
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// Show recent executions
    List {
        #[arg(short, long, default_value = "default")]
        tenant: String,
        #[arg(short, long)]
        workflow: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one execution with its logs
    Show {
        id: String,
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter '{}', expected key=value", s))?;
    Ok((key.to_string(), value.to_string()))
}

/// Values that parse as JSON keep their type; the rest are strings.
fn parameters_json(params: &[(String, String)]) -> serde_json::Value {
    let map = params
        .iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(v)
                .unwrap_or_else(|_| serde_json::Value::String(v.clone()));
            (k.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    })
}

/// Open storage and assemble the engine, trigger hub and admin service.
async fn build_admin(config: &Config) -> anyhow::Result<Arc<AdminService>> {
    let db_path = config.storage.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStorage::open(&db_path)?);
    let services = Arc::new(
        ActionServices::new(store, Arc::new(LogNotifier))
            .with_settings(config.actions.clone(), config.engine.clone()),
    );
    let engine = Engine::new(ActionRegistry::new(), services);
    let hub = Arc::new(TriggerHub::new(engine));
    hub.refresh().await?;
    Ok(Arc::new(AdminService::new(hub, config.versions.clone())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    opsflow::telemetry::init_telemetry(config.logging.format)?;

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(config, port, host).await?,
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Workflows { action } => {
            let admin = build_admin(&config).await?;
            match action {
                WorkflowActions::List { tenant } => cmd_workflows_list(&admin, &tenant).await?,
                WorkflowActions::Create {
                    file,
                    tenant,
                    activate,
                } => cmd_workflows_create(&admin, &file, &tenant, activate).await?,
                WorkflowActions::Run {
                    id,
                    tenant,
                    params,
                    role,
                    timeout,
                } => {
                    let mut caller = Caller::new(&tenant);
                    if let Some(role) = role.as_deref() {
                        caller = caller.with_role(role);
                    }
                    cmd_workflows_run(&admin, &caller, &id, &params, timeout).await?
                }
            }
        }
        Commands::Executions { action } => {
            let admin = build_admin(&config).await?;
            match action {
                ExecutionActions::List {
                    tenant,
                    workflow,
                    limit,
                } => cmd_executions_list(&admin, &tenant, workflow, limit).await?,
                ExecutionActions::Show { id, tenant } => {
                    cmd_executions_show(&admin, &tenant, &id).await?
                }
            }
        }
    }

    Ok(())
}

async fn cmd_serve(mut config: Config, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    opsflow::metrics::init_metrics()?;
    let admin = build_admin(&config).await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    let scheduler = Arc::new(Scheduler::new(
        admin.engine().clone(),
        config.scheduler.clone(),
    ));
    let scheduler_task = scheduler.spawn(shutdown.clone());

    let app = create_router(AppState {
        admin: admin.clone(),
    });
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        %addr,
        subscriptions = admin.hub().index().len().await,
        max_concurrent = config.engine.max_concurrent_executions,
        "opsflow server listening"
    );

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait_for_shutdown().await })
        .await?;

    shutdown.request_shutdown();
    if let Err(e) = scheduler_task.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    info!("opsflow server stopped");
    Ok(())
}

fn cmd_validate(file: &Path) -> anyhow::Result<()> {
    let workflow = parse_workflow_file(file)?;
    validate_workflow(&workflow, Some(&ActionRegistry::new()))?;
    println!(
        "Workflow '{}' is valid ({} nodes, trigger {})",
        workflow.name,
        workflow.nodes.len(),
        workflow.trigger.kind.trigger_type()
    );
    Ok(())
}

async fn cmd_workflows_list(admin: &AdminService, tenant: &str) -> anyhow::Result<()> {
    let workflows = admin.list_workflows(tenant, None).await?;
    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Create one with: opsflow workflows create <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<38} {:<28} {:<10} {:<8} {:<14}",
        "ID", "NAME", "STATUS", "VERSION", "TRIGGER"
    );
    println!("{}", "-".repeat(100));
    for wf in workflows {
        println!(
            "{:<38} {:<28} {:<10} {:<8} {:<14}",
            wf.id,
            wf.name,
            wf.status,
            wf.version,
            wf.trigger.kind.trigger_type()
        );
    }
    Ok(())
}

async fn cmd_workflows_create(
    admin: &AdminService,
    file: &Path,
    tenant: &str,
    activate: bool,
) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let workflow = parse_workflow_file(file)?;
    let caller = Caller::new(tenant);
    let mut created = admin.create_workflow(&caller, workflow).await?;
    if activate {
        created = admin
            .set_status(&caller, &created.id, WorkflowStatus::Active)
            .await?;
    }

    println!("Workflow '{}' created", created.name);
    println!("  ID:      {}", created.id);
    println!("  Status:  {}", created.status);
    println!("  Version: {}", created.version);
    Ok(())
}

async fn cmd_workflows_run(
    admin: &AdminService,
    caller: &Caller,
    id: &str,
    params: &[(String, String)],
    timeout: u64,
) -> anyhow::Result<()> {
    let mode = RunMode::Sync {
        timeout: Duration::from_secs(timeout),
    };
    let execution = admin
        .trigger_workflow(caller, id, parameters_json(params), mode)
        .await?;

    println!("Execution {} {}", execution.id, execution.status);
    if let Some(error) = &execution.error {
        println!("  Error: {}", error);
    }
    if let Some(output) = &execution.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

async fn cmd_executions_list(
    admin: &AdminService,
    tenant: &str,
    workflow: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let filter = ExecutionFilter {
        workflow_id: workflow,
        limit: Some(limit),
        ..Default::default()
    };
    let executions = admin.list_executions(tenant, filter).await?;
    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<10} {:<14} {:<20}",
        "ID", "WORKFLOW", "STATUS", "TRIGGER", "CREATED"
    );
    println!("{}", "-".repeat(108));
    for e in executions {
        println!(
            "{:<38} {:<24} {:<10} {:<14} {:<20}",
            e.id,
            e.workflow_name,
            e.status,
            e.context.trigger_type,
            e.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_executions_show(admin: &AdminService, tenant: &str, id: &str) -> anyhow::Result<()> {
    let execution = admin.get_execution(tenant, id).await?;
    println!("Execution {}", execution.id);
    println!("  Workflow: {} (v{})", execution.workflow_name, execution.workflow_version);
    println!("  Status:   {}", execution.status);
    if let Some(node) = &execution.current_node_id {
        println!("  Node:     {}", node);
    }
    if let Some(error) = &execution.error {
        println!("  Error:    {}", error);
    }
    println!();
    for step in &execution.steps {
        println!(
            "  {:<24} {:<10} attempts={} {}ms",
            step.node_id,
            step.status,
            step.retry_count + 1,
            step.duration_ms.unwrap_or(0)
        );
    }

    let logs = admin.execution_logs(tenant, id).await?;
    if !logs.is_empty() {
        println!();
        for log in logs {
            println!(
                "  {} {:<5} {}",
                log.timestamp.format("%H:%M:%S%.3f"),
                log.level,
                log.message
            );
        }
    }
    Ok(())
}
