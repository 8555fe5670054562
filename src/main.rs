use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fleetrun::config::{NodeConfig, PoolConfig, RetryPolicy, SessionConfig, TransportKind};
use fleetrun::events::{EventKind, ExecutionEvent, HostStatus, OutputStream};
use fleetrun::hosts::StaticDirectory;
use fleetrun::node::{build_transport, Node};
use fleetrun::scheduler::JobQueue;
use fleetrun::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(version)]
#[command(about = "Run one shell command across a fleet of hosts and stream the output")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FLEETRUN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator service (HTTP API and observer WebSocket)
    Serve(ServeArgs),

    /// Run one command in-process and print events as they arrive
    Run(RunArgs),
}

// =============================================================================
// Execution Arguments (shared by serve and run)
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Host inventory file (JSON array of hosts)
    #[arg(long, env = "FLEETRUN_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// How sessions reach hosts
    #[arg(long, value_enum, default_value = "ssh", env = "FLEETRUN_TRANSPORT")]
    transport: TransportArg,

    /// Number of concurrent workers
    #[arg(long, default_value = "4", env = "FLEETRUN_WORKERS")]
    workers: usize,

    /// Attempts per job, including the first
    #[arg(long, default_value = "3", env = "FLEETRUN_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Delay before the first retry in milliseconds; doubles per attempt
    #[arg(long, default_value = "1000", env = "FLEETRUN_RETRY_DELAY_MS")]
    retry_delay_ms: u64,

    /// SSH connect timeout in seconds
    #[arg(long, default_value = "10", env = "FLEETRUN_CONNECT_TIMEOUT")]
    connect_timeout: u64,

    /// Upper bound for a single command in seconds
    #[arg(long, default_value = "300", env = "FLEETRUN_COMMAND_TIMEOUT")]
    command_timeout: u64,

    /// Seconds in-flight sessions get to finish at shutdown
    #[arg(long, default_value = "10", env = "FLEETRUN_SHUTDOWN_GRACE")]
    shutdown_grace: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Ssh,
    Local,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Ssh => TransportKind::Ssh,
            TransportArg::Local => TransportKind::Local,
        }
    }
}

impl ExecArgs {
    fn node_config(&self, listen_addr: SocketAddr) -> NodeConfig {
        let mut config = NodeConfig::new(listen_addr).with_workers(self.workers);
        config.hosts_path = self.hosts_file.clone();
        config.transport = self.transport.into();
        config.retry = RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_delay_ms),
        };
        config.session = SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            command_timeout: Duration::from_secs(self.command_timeout),
            ..SessionConfig::default()
        };
        config.pool = PoolConfig {
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
            ..config.pool
        };
        config
    }
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0", env = "FLEETRUN_BIND")]
    bind: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "3000", env = "FLEETRUN_PORT")]
    port: u16,

    /// Queue journal file; jobs survive restarts when set
    #[arg(long, env = "FLEETRUN_JOURNAL")]
    journal: Option<PathBuf>,

    /// Events buffered per observer before it starts missing events
    #[arg(long, default_value = "256", env = "FLEETRUN_OBSERVER_BUFFER")]
    observer_buffer: usize,

    #[command(flatten)]
    exec: ExecArgs,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Target host id (repeatable). Defaults to every host in the inventory.
    #[arg(long = "host", short = 'H')]
    hosts: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    exec: ExecArgs,

    /// The command to execute (e.g., "uptime")
    command: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSummaryOutput {
    job_id: String,
    host_id: String,
    state: String,
    attempts: u32,
    exit_code: Option<i32>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to command output in `run`
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Splits output chunks into whole lines per host for the table view.
#[derive(Default)]
struct LinePrinter {
    partial: HashMap<(String, OutputStream), String>,
}

impl LinePrinter {
    fn push(&mut self, host_id: &str, stream: OutputStream, data: &str) {
        let buffer = self
            .partial
            .entry((host_id.to_string(), stream))
            .or_default();
        buffer.push_str(data);
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            print_line(host_id, stream, line.trim_end_matches(['\r', '\n']));
        }
    }

    fn flush(&mut self, host_id: &str) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            if let Some(rest) = self.partial.remove(&(host_id.to_string(), stream)) {
                if !rest.is_empty() {
                    print_line(host_id, stream, &rest);
                }
            }
        }
    }
}

fn print_line(host_id: &str, stream: OutputStream, line: &str) {
    match stream {
        OutputStream::Stdout => println!("{:<16} | {}", host_id, line),
        OutputStream::Stderr => eprintln!("{:<16} ! {}", host_id, line),
    }
}

// =============================================================================
// Serve Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr = SocketAddr::new(args.bind, args.port);
    let mut config = args.exec.node_config(listen_addr);
    config.journal_path = args.journal;
    config.observer_buffer = args.observer_buffer.max(1);

    tracing::info!(
        listen_addr = %config.listen_addr,
        hosts_file = ?config.hosts_path,
        journal = ?config.journal_path,
        transport = ?config.transport,
        workers = config.pool.workers,
        max_attempts = config.retry.max_attempts,
        "Starting fleetrun"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Run Implementation
// =============================================================================

/// Returns whether every job succeeded.
async fn run_once(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let config = args
        .exec
        .node_config(SocketAddr::from(([127, 0, 0, 1], 0)));
    let hosts_path = config
        .hosts_path
        .clone()
        .ok_or("a host inventory is required (--hosts-file or FLEETRUN_HOSTS_FILE)")?;

    let directory = StaticDirectory::load(&hosts_path)?;
    let targets = if args.hosts.is_empty() {
        directory.host_ids()
    } else {
        args.hosts.clone()
    };

    let queue = Arc::new(JobQueue::new(config.retry));
    let transport = build_transport(&config);
    let node = Node::with_parts(config, queue, Arc::new(directory), transport);

    let shutdown = install_shutdown_handler()?;
    // Subscribe before enqueueing so no event of this request is missed
    let mut events = node.hub().subscribe();
    let pool = node.spawn_workers();
    let receipt = match node.orchestrator().execute(args.command.clone(), targets) {
        Ok(receipt) => receipt,
        Err(e) => {
            pool.shutdown().await;
            return Err(e.into());
        }
    };

    let mut remaining: HashSet<Uuid> = receipt.job_ids.iter().copied().collect();
    let mut lines = LinePrinter::default();
    let mut interrupted = false;
    // A full observer buffer can swallow a terminal event; the queue knows
    let mut settle_check = tokio::time::interval(Duration::from_millis(500));

    while !remaining.is_empty() {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                interrupted = true;
                break;
            }
            _ = settle_check.tick() => {
                remaining.retain(|id| {
                    node.queue()
                        .get(id)
                        .map(|job| !job.state.is_terminal())
                        .unwrap_or(false)
                });
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if !remaining.contains(&event.job_id) {
            continue;
        }

        match args.output {
            OutputFormat::Json => println!("{}", event.to_json()?),
            OutputFormat::Table => print_event(&mut lines, &event),
        }
        if event.terminal_status().is_some() {
            remaining.remove(&event.job_id);
        }
    }

    pool.shutdown().await;

    let summary: Vec<JobSummaryOutput> = receipt
        .job_ids
        .iter()
        .filter_map(|id| node.queue().get(id))
        .map(|job| JobSummaryOutput {
            job_id: job.id.to_string(),
            host_id: job.host_id,
            state: job.state.to_string(),
            attempts: job.attempt,
            exit_code: job.exit_code,
            error: job.last_error,
        })
        .collect();

    if let OutputFormat::Table = args.output {
        println!();
        println!("{:<16} {:<10} {:<5} ERROR", "HOST", "STATE", "EXIT");
        println!("{}", "-".repeat(60));
        for job in &summary {
            println!(
                "{:<16} {:<10} {:<5} {}",
                job.host_id,
                job.state,
                job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                job.error.as_deref().unwrap_or("")
            );
        }
    }

    let all_succeeded = !interrupted && summary.iter().all(|job| job.state == "succeeded");
    Ok(all_succeeded)
}

fn print_event(lines: &mut LinePrinter, event: &ExecutionEvent) {
    match &event.kind {
        EventKind::Output { stream, data } => lines.push(&event.host_id, *stream, data),
        EventKind::Status(status) => {
            if status.is_terminal() {
                lines.flush(&event.host_id);
            }
            if *status != HostStatus::Pending {
                println!("{:<16} * {}", event.host_id, status);
            }
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_json);

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Run(run_args) => {
            if !run_once(run_args).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
