use flowbot::runtime::run_blocking;
use flowbot::{BlockingSession, HealthResult, Session};

use super::CliContext;

pub fn execute(context: &CliContext) -> anyhow::Result<()> {
    let work_path = context.work_path.as_deref();
    let (version, health) = if context.blocking {
        let session = BlockingSession::new(context.config.clone())?;
        session.open(work_path)?;
        let version = session.worker_info().map(|w| w.worker_version);
        let health = session.health();
        session.close();
        (version, health?)
    } else {
        run_blocking(async {
            let session = Session::new(context.config.clone());
            session.open(work_path).await?;
            let version = session.worker_info().map(|w| w.worker_version);
            let health = session.health().await;
            session.close().await;
            health.map(|h| (version, h))
        })??
    };

    let version = version.unwrap_or_else(|| "unknown".to_string());
    match health {
        HealthResult { healthy: true, .. } => println!("✅ worker {version} is healthy"),
        HealthResult { reason, .. } => println!(
            "❌ worker {version} is unhealthy: {}",
            reason.unwrap_or_else(|| "no reason given".to_string())
        ),
    }
    Ok(())
}
