use std::str::FromStr;

use anyhow::anyhow;
use clap::Parser;
use flowbot::config::{ClientConfig, ConfigManager, EnvConfigManager};
use flowbot::logger::init_tracing;
use flowbot::runtime::run_blocking;
use tracing::error;
use worker_protocol::message::LogLevel;

mod cli;

use cli::{Cli, CliContext};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut config = run_blocking(ClientConfig::load(&manager))??;
    if let Some(level) = &cli.log_level {
        config.log_level = LogLevel::from_str(level).map_err(|e| anyhow!(e))?;
    }
    init_tracing(config.log_level, config.log_dir.as_deref())?;

    let context = CliContext::new(config, cli.work_path.clone(), cli.blocking);
    let result = cli::execute(&context, cli.command);
    if let Err(err) = &result {
        error!("flowbot failed: {err:#}");
    }
    result
}
