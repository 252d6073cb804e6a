use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowbot::{ClientConfig, FlowListItem, StatusEvent};

pub mod health;
pub mod list;
pub mod run;

use run::RunArgs;

#[derive(Parser, Debug)]
#[command(
    name = "flowbot",
    about = "List and run the flows of an automation worker",
    version
)]
pub struct Cli {
    /// .env file read before the process environment
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Worker install directory or executable (default: discovery)
    #[arg(long, global = true)]
    pub work_path: Option<PathBuf>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Use the blocking API instead of the async one
    #[arg(long, global = true)]
    pub blocking: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the flows the worker offers
    List,

    /// Execute one flow and follow its status
    Run(RunArgs),

    /// Ask the worker whether it is healthy
    Health,
}

#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: ClientConfig,
    pub work_path: Option<PathBuf>,
    pub blocking: bool,
}

impl CliContext {
    pub fn new(config: ClientConfig, work_path: Option<PathBuf>, blocking: bool) -> Self {
        Self { config, work_path, blocking }
    }
}

pub fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List => list::execute(context),
        Commands::Run(args) => run::execute(args, context),
        Commands::Health => health::execute(context),
    }
}

pub fn print_flows(flows: &[FlowListItem]) {
    if flows.is_empty() {
        println!("The worker offers no flows.");
        return;
    }
    for (i, flow) in flows.iter().enumerate() {
        println!("{:>3}. {:<32} {}", i + 1, flow.name, flow.id);
    }
}

pub fn print_event(event: &StatusEvent) {
    let payload = event.payload.as_ref().map(|p| p.to_string()).unwrap_or_default();
    let marker = if event.synthesized { " (local)" } else { "" };
    println!(
        "{}  {:<10}{}  {}",
        event.received_at.format("%H:%M:%S%.3f"),
        event.state,
        marker,
        payload
    );
}
