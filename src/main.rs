use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use compute_node::config::{NodeConfig, SandboxConfig, StoreConfig};
use compute_node::error::ComputeError;
use compute_node::models::{ExecutionState, ResourceUsage};
use compute_node::node::ComputeNode;
use compute_node::shutdown::install_shutdown_handler;
use compute_node::store::{self, ExecutionStore};

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "compute-node")]
#[command(version)]
#[command(about = "Compute node execution lifecycle engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a compute node
    Run(RunArgs),

    /// Read or prune a node's sqlite execution store offline
    Inspect {
        /// Path to the sqlite database
        #[arg(long, default_value = "compute-node.db")]
        db_path: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: InspectCommands,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Node ID reported in events and metrics
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Execution store engine
    #[arg(long, default_value = "memory")]
    store: StoreKind,

    /// Path to the sqlite database (with --store sqlite)
    #[arg(long, default_value = "compute-node.db")]
    db_path: PathBuf,

    /// Total CPUs available to running executions
    #[arg(long, default_value = "4")]
    cpu: f64,

    /// Total memory available to running executions, in MiB
    #[arg(long, default_value = "8192")]
    memory_mb: u64,

    /// Total disk available to running executions, in MiB
    #[arg(long, default_value = "102400")]
    disk_mb: u64,

    /// Total GPUs available to running executions
    #[arg(long, default_value = "0")]
    gpu: u64,

    /// Timeout for jobs that do not set their own, in seconds
    #[arg(long, default_value = "600")]
    job_timeout_secs: u64,

    /// Port for the status server (optional)
    #[arg(long)]
    status_port: Option<u16>,

    /// Directory shard results are staged in
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Docker image for jobs that do not name one
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Inspect Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum InspectCommands {
    /// Show one execution
    Get { execution_id: String },
    /// Show the transition history of an execution
    History { execution_id: String },
    /// List the executions of a shard ("<job_id>:<index>")
    Shard { shard_id: String },
    /// Count executions per state
    Count {
        /// Only this state (e.g. "running")
        #[arg(long)]
        state: Option<ExecutionState>,
    },
    /// Delete an execution with its history
    Delete { execution_id: String },
}

#[derive(Serialize)]
struct CountOutput {
    state: String,
    count: u64,
}

// =============================================================================
// Node Implementation
// =============================================================================

fn mib_to_bytes(flag: &str, mib: u64) -> Result<u64, ComputeError> {
    mib.checked_mul(MIB)
        .ok_or_else(|| ComputeError::Config(format!("{} {} overflows a byte count", flag, mib)))
}

async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let status_addr: Option<SocketAddr> = match args.status_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let store = match args.store {
        StoreKind::Memory => StoreConfig::Memory,
        StoreKind::Sqlite => StoreConfig::Sqlite {
            path: args.db_path,
        },
    };

    let mut config = NodeConfig::new(args.node_id)
        .with_store(store)
        .with_total_capacity(ResourceUsage::new(
            args.cpu,
            mib_to_bytes("--memory-mb", args.memory_mb)?,
            mib_to_bytes("--disk-mb", args.disk_mb)?,
            args.gpu,
        ))
        .with_default_job_timeout(Duration::from_secs(args.job_timeout_secs));
    if let Some(dir) = args.results_dir {
        config = config.with_results_dir(dir);
    }
    config.sandbox = SandboxConfig {
        image: args.image,
        ..SandboxConfig::default()
    };

    tracing::info!(
        node_id = %config.node_id,
        store = ?config.store,
        capacity = %config.capacity.total,
        status_addr = ?status_addr,
        "Starting compute node"
    );

    let shutdown = install_shutdown_handler();
    let (node, events) = ComputeNode::new(config)?;
    node.run(events, status_addr, shutdown).await?;
    Ok(())
}

// =============================================================================
// Inspect Handlers
// =============================================================================

fn print_execution_table(execution: &compute_node::models::Execution) {
    println!("Execution ID:    {}", execution.id);
    println!("Shard:           {}", execution.shard);
    println!("State:           {}", execution.state);
    println!("Version:         {}", execution.version);
    println!("Resources:       {}", execution.resource_usage);
    println!("Created:         {}", execution.create_time.to_rfc3339());
    println!("Updated:         {}", execution.update_time.to_rfc3339());
    if !execution.latest_comment.is_empty() {
        println!("Comment:         {}", execution.latest_comment);
    }
}

fn handle_inspect(
    store: &dyn ExecutionStore,
    command: InspectCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        InspectCommands::Get { execution_id } => {
            let execution = store.get_execution(&execution_id)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&execution)?),
                OutputFormat::Table => print_execution_table(&execution),
            }
        }
        InspectCommands::History { execution_id } => {
            let history = store.get_execution_history(&execution_id)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                OutputFormat::Table => {
                    println!(
                        "{:<8} {:<22} {:<22} {:<32} COMMENT",
                        "VERSION", "FROM", "TO", "TIME"
                    );
                    println!("{}", "-".repeat(100));
                    for entry in history {
                        println!(
                            "{:<8} {:<22} {:<22} {:<32} {}",
                            entry.new_version,
                            entry.previous_state.to_string(),
                            entry.new_state.to_string(),
                            entry.time.to_rfc3339(),
                            entry.comment
                        );
                    }
                }
            }
        }
        InspectCommands::Shard { shard_id } => {
            let executions = store.get_executions(&shard_id)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&executions)?),
                OutputFormat::Table => {
                    println!("{:<42} {:<22} {:<8} UPDATED", "EXECUTION ID", "STATE", "VERSION");
                    println!("{}", "-".repeat(100));
                    for execution in executions {
                        println!(
                            "{:<42} {:<22} {:<8} {}",
                            execution.id,
                            execution.state.to_string(),
                            execution.version,
                            execution.update_time.to_rfc3339()
                        );
                    }
                }
            }
        }
        InspectCommands::Count { state } => {
            let states: Vec<ExecutionState> = match state {
                Some(state) => vec![state],
                None => ExecutionState::ALL
                    .into_iter()
                    .filter(|s| *s != ExecutionState::Undefined)
                    .collect(),
            };
            let mut counts = Vec::with_capacity(states.len());
            for state in states {
                counts.push(CountOutput {
                    state: state.to_string(),
                    count: store.get_execution_count(state)?,
                });
            }
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
                OutputFormat::Table => {
                    println!("{:<22} COUNT", "STATE");
                    println!("{}", "-".repeat(30));
                    for c in counts {
                        println!("{:<22} {}", c.state, c.count);
                    }
                }
            }
        }
        InspectCommands::Delete { execution_id } => {
            store.delete_execution(&execution_id)?;
            match output {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "deleted": execution_id }))?
                ),
                OutputFormat::Table => println!("Deleted execution {}", execution_id),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_node(run_args).await?;
        }
        Commands::Inspect {
            db_path,
            output,
            command,
        } => {
            if !db_path.exists() {
                eprintln!("Error: no database at {}", db_path.display());
                std::process::exit(1);
            }
            let store = store::open_sqlite(&db_path)?;
            if let Err(e) = handle_inspect(store.as_ref(), command, &output) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
