use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Args;
use flowbot::runtime::{get_handle, run_blocking};
use flowbot::{
    BlockingSession, ChannelObserver, ClientError, ExecError, ExecutionState, FlowListItem,
    Session, StatusEvent,
};
use tokio::signal;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{CliContext, print_event};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow name or id, as printed by `flowbot list`
    pub flow: String,

    /// Request a stop after this many milliseconds
    #[arg(long)]
    pub stop_after_ms: Option<u64>,
}

pub fn execute(args: RunArgs, context: &CliContext) -> Result<()> {
    let outcome = if context.blocking {
        run_with_blocking(&args, context)?
    } else {
        run_blocking(run_async(&args, context))??
    };

    match outcome {
        Some(ExecutionState::Completed) => Ok(()),
        Some(state) => bail!("flow `{}` ended with `{state}`", args.flow),
        None => bail!("flow `{}` ended without a terminal status", args.flow),
    }
}

fn pick(flows: &[FlowListItem], wanted: &str) -> Result<FlowListItem> {
    flows
        .iter()
        .find(|f| f.id == wanted)
        .or_else(|| flows.iter().find(|f| f.name.eq_ignore_ascii_case(wanted)))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no flow named `{wanted}`, see `flowbot list`"))
}

/// `Ok(true)` once the stop request is out (or no longer needed).
fn stop_sent(result: Result<(), ClientError>) -> Result<bool> {
    match result {
        Ok(()) => {
            info!("stop requested");
            Ok(true)
        }
        // still starting up: try again on the next event
        Err(ClientError::Exec(ExecError::NotRunning)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

async fn run_async(args: &RunArgs, context: &CliContext) -> Result<Option<ExecutionState>> {
    let session = Session::new(context.config.clone());
    session.open(context.work_path.as_deref()).await?;
    let item = pick(&session.get_flow_list().await?, &args.flow)?;

    let (observer, mut events) = ChannelObserver::new();
    session.execute(&item, observer).await?;
    println!("▶ {} ({})", item.name, item.id);

    let timer = async {
        match args.stop_after_ms {
            Some(ms) => sleep(Duration::from_millis(ms)).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let mut stop_wanted = false;
    let mut stop_done = false;
    let mut terminal = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    print_event(&event);
                    if event.is_terminal() {
                        terminal = Some(event.state);
                        break;
                    }
                }
                None => break,
            },
            _ = &mut timer, if !stop_wanted => stop_wanted = true,
            res = signal::ctrl_c(), if !stop_wanted => {
                if let Err(err) = res {
                    warn!("cannot listen for Ctrl-C: {err}");
                }
                stop_wanted = true;
            }
        }
        if stop_wanted && !stop_done {
            stop_done = stop_sent(session.stop().await)?;
        }
    }

    session.close().await;
    Ok(terminal)
}

fn run_with_blocking(args: &RunArgs, context: &CliContext) -> Result<Option<ExecutionState>> {
    let session = BlockingSession::new(context.config.clone())?;
    session.open(context.work_path.as_deref())?;
    let item = pick(&session.get_flow_list()?, &args.flow)?;

    let (tx, rx) = mpsc::channel::<ExecutionState>();
    session.execute(&item, move |event: &StatusEvent| {
        print_event(event);
        let _ = tx.send(event.state);
    })?;
    println!("▶ {} ({})", item.name, item.id);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        get_handle()?.spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }
    let deadline = args.stop_after_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

    let mut stop_done = false;
    let terminal = loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(state) if state.is_terminal() => break Some(state),
            Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break None,
        }
        let stop_wanted = interrupted.load(Ordering::SeqCst)
            || deadline.is_some_and(|d| Instant::now() >= d);
        if stop_wanted && !stop_done {
            stop_done = stop_sent(session.stop())?;
        }
    };

    session.close();
    Ok(terminal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_prefers_ids_then_names() {
        let flows = vec![
            FlowListItem::new("export", "Nightly report"),
            FlowListItem::new("nightly", "Export"),
        ];
        assert_eq!(pick(&flows, "export").unwrap().id, "export");
        assert_eq!(pick(&flows, "nightly REPORT").unwrap().id, "export");
        assert!(pick(&flows, "missing").is_err());
    }
}
