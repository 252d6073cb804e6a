use std::path::Path;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use worker_protocol::message::LogLevel;

pub const LOG_FILE: &str = "flowbot.log";
pub const EVENT_FILE: &str = "flowbot-requests.json";

/// Installs the process-wide subscriber.
///
/// - With `log_dir`: a plain-text daily log (`flowbot.log`) plus a JSON
///   daily log (`flowbot-requests.json`) that only receives `request` events.
/// - Without: human readable output on stderr.
///
/// `RUST_LOG`, when set, wins over `log_level`. Fails if a global subscriber
/// is already installed.
pub fn init_tracing(log_level: LogLevel, log_dir: Option<&Path>) -> Result<()> {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_directive()))
    };

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let txt_layer = fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
                .with_ansi(false)
                .with_filter(env_filter());

            let json_layer = fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE))
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));

            Registry::default()
                .with(txt_layer)
                .with(json_layer)
                .try_init()
                .map_err(|e| anyhow!("tracing already initialised: {e}"))
        }
        None => Registry::default()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(env_filter()))
            .try_init()
            .map_err(|e| anyhow!("tracing already initialised: {e}")),
    }
}

/// Runs `handler` and records one `request` event with its latency and outcome.
pub async fn instrument_request<F, Fut, T, E>(name: &str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = handler().await;
    let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

    match &result {
        Ok(_) => info!("request `{}` succeeded in {:.1} ms", name, elapsed),
        Err(err) => error!(error = %err, "request `{}` failed in {:.1} ms", name, elapsed),
    }

    tracing::event!(
        target: "request",
        tracing::Level::INFO,
        request = name,
        latency_ms = elapsed,
        status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        },
    );

    result
}
