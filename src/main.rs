use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use dispatch_lite::client::JobClient;
use dispatch_lite::config::{
    DriverConfig, LoadBalancerConfig, NodeConfig, SandboxConfig, DEFAULT_MAX_FRAME_LEN,
};
use dispatch_lite::driver::Driver;
use dispatch_lite::protocol::JobSla;
use dispatch_lite::scheduler::{Job, JobResults, TaskOutcome};
use dispatch_lite::shutdown::install_shutdown_handler;
use dispatch_lite::worker::{NodeRunner, ShellExecutor};

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "A job dispatch driver with adaptive task bundling")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a driver
    Server(ServerArgs),

    /// Start a worker node connected to a driver
    Node(NodeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to accept node and client connections on
    #[arg(long, default_value = "0.0.0.0:11111")]
    listen: SocketAddr,

    /// Port for the admin dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Number of reactor threads driving the channels
    #[arg(long, default_value = "2")]
    reactor_threads: usize,

    /// Load-balancing algorithm: fixed, adaptive or proportional
    #[arg(long, default_value = "proportional")]
    algorithm: String,

    /// Algorithm parameter, format: "name=value" (repeatable)
    /// Example: --param size=10
    #[arg(long = "param", value_parser = parse_parameter)]
    parameters: Vec<(String, String)>,

    /// Largest frame accepted from a peer, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Driver address (host:port)
    #[arg(long, short = 'd', default_value = "127.0.0.1:11111")]
    driver: String,

    /// Number of tasks executed concurrently (defaults to the CPU count)
    #[arg(long)]
    threads: Option<usize>,

    /// Docker image to run tasks in; tasks run on the host shell when unset
    #[arg(long)]
    image: Option<String>,

    /// Allow network access inside the sandbox
    #[arg(long, requires = "image")]
    allow_network: bool,

    /// Sandbox memory limit (e.g., "256m")
    #[arg(long, default_value = "256m")]
    memory: String,

    /// Sandbox CPU limit (e.g., "0.5")
    #[arg(long, default_value = "0.5")]
    cpus: String,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Driver address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:11111")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job and wait for its results
    Submit {
        /// Job name
        #[arg(long, default_value = "job")]
        name: String,

        /// Higher priorities are dispatched first
        #[arg(long, default_value = "0")]
        priority: i32,

        /// Maximum number of nodes running the job at once (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_nodes: i32,

        /// Send every task to a single node in one bundle
        #[arg(long)]
        broadcast: bool,

        /// Cancel the job if it is still running after this many milliseconds
        #[arg(long)]
        expiration_ms: Option<u64>,

        /// Data piped to the stdin of every task
        #[arg(long)]
        data: Option<String>,

        /// Shell commands, one task each (e.g., "echo hello")
        #[arg(required = true)]
        tasks: Vec<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct TaskOutput {
    index: usize,
    status: &'static str,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct JobResultOutput {
    job_id: String,
    name: String,
    completed: usize,
    tasks: Vec<TaskOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_parameter(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("invalid parameter {s:?}, expected name=value")),
    }
}

fn task_output(index: usize, outcome: &TaskOutcome) -> TaskOutput {
    let text = |bytes: &Bytes| String::from_utf8_lossy(bytes).trim_end().to_string();
    match outcome {
        TaskOutcome::Completed(result) => TaskOutput {
            index,
            status: "COMPLETED",
            output: text(result),
            error: None,
        },
        TaskOutcome::Failed { task, reason } => TaskOutput {
            index,
            status: "FAILED",
            output: text(task),
            error: Some(reason.clone()),
        },
        TaskOutcome::Cancelled(task) => TaskOutput {
            index,
            status: "CANCELLED",
            output: text(task),
            error: None,
        },
    }
}

fn print_results(
    results: &JobResults,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let tasks: Vec<TaskOutput> = results
        .outcomes
        .iter()
        .enumerate()
        .map(|(index, outcome)| task_output(index, outcome))
        .collect();
    match output_format {
        OutputFormat::Json => {
            let output = JobResultOutput {
                job_id: results.job_uuid.to_string(),
                name: results.name.clone(),
                completed: results.completed_count(),
                tasks,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", results.job_uuid);
            println!("Name:      {}", results.name);
            println!(
                "Completed: {}/{}",
                results.completed_count(),
                results.outcomes.len()
            );
            println!();
            println!("{:<6} {:<10} OUTPUT", "TASK", "STATUS");
            println!("{}", "-".repeat(60));
            for task in tasks {
                let first_line = task.output.lines().next().unwrap_or("");
                println!("{:<6} {:<10} {}", task.index, task.status, first_line);
                if let Some(error) = task.error {
                    println!("{:<17} error: {}", "", error);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut load_balancer = LoadBalancerConfig::new(args.algorithm);
    for (name, value) in args.parameters {
        load_balancer = load_balancer.with_parameter(name, value);
    }

    let mut config = DriverConfig::new(args.listen).with_load_balancer(load_balancer);
    config.reactor_threads = args.reactor_threads;
    config.max_frame_len = args.max_frame_len;
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(SocketAddr::new(args.listen.ip(), port));
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        reactor_threads = config.reactor_threads,
        algorithm = %config.load_balancer.algorithm,
        parameters = ?config.load_balancer.parameters,
        "Starting dispatch driver"
    );

    let driver = Driver::bind(config).await?;
    let shutdown = install_shutdown_handler();
    driver.run(shutdown).await?;
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let sandbox = SandboxConfig {
        image: args.image,
        network_disabled: !args.allow_network,
        memory_limit: Some(args.memory),
        cpu_limit: Some(args.cpus),
    };
    let mut config = NodeConfig::new(args.driver);
    if let Some(threads) = args.threads {
        config = config.with_processing_threads(threads);
    }
    config.sandbox = sandbox.clone();

    tracing::info!(
        driver = %config.driver_addr,
        threads = config.processing_threads,
        image = ?sandbox.image,
        "Starting worker node"
    );

    let runner = NodeRunner::new(config, ShellExecutor::new(sandbox));
    let shutdown = install_shutdown_handler();
    runner.run(shutdown).await?;
    Ok(())
}

async fn handle_job_submit(
    client_args: &ClientArgs,
    job: Job,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = JobClient::connect(client_args.addr.as_str()).await?;
    let results = client.submit(job).await?;
    print_results(&results, &client_args.output)?;
    if results.completed_count() < results.outcomes.len() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Node(node_args) => run_node(node_args).await,
        Commands::Job { client, command } => match command {
            JobCommands::Submit {
                name,
                priority,
                max_nodes,
                broadcast,
                expiration_ms,
                data,
                tasks,
            } => {
                let mut job = Job::new(name, tasks.into_iter().map(Bytes::from).collect())
                    .with_priority(priority)
                    .with_sla(JobSla {
                        max_nodes,
                        broadcast,
                        expiration_ms,
                        ..JobSla::default()
                    });
                if let Some(data) = data {
                    job = job.with_data_provider(Bytes::from(data));
                }
                handle_job_submit(&client, job).await
            }
        },
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The driver's reactor thread count is configurable, so the runtime is built by hand
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Commands::Server(server_args) = &args.command {
        builder.worker_threads(server_args.reactor_threads.max(1));
    }
    let runtime = builder.enable_all().build()?;
    runtime.block_on(run(args))
}
