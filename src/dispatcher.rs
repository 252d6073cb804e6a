use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker_protocol::message::{ExecutionState, FlowListItem, StatusParams};
use worker_protocol::worker_actor::{Method, WorkerEvent};

use crate::execution::ExecutionController;
use crate::session::lock;

/// One state transition of an execution, as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub execution_id: String,
    pub flow: FlowListItem,
    pub state: ExecutionState,
    pub payload: Option<Value>,
    /// Produced locally because the worker could not report it.
    pub synthesized: bool,
    pub received_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        execution_id: String,
        flow: FlowListItem,
        state: ExecutionState,
        payload: Option<Value>,
        synthesized: bool,
    ) -> Self {
        Self { execution_id, flow, state, payload, synthesized, received_at: Utc::now() }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Receives the status events of one execution.
///
/// Called on the session's dispatcher task, never on the caller's thread,
/// and never concurrently with itself. Keep it short: the next event waits.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Forwards events into a channel for async consumers.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, event: &StatusEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(execution = %event.execution_id, "status receiver dropped");
        }
    }
}

/// An event bound to the observer that must see it.
pub(crate) struct Delivery {
    pub(crate) observer: Arc<dyn StatusObserver>,
    pub(crate) event: StatusEvent,
}

impl Delivery {
    pub(crate) fn deliver(self) {
        let Delivery { observer, event } = self;
        if catch_unwind(AssertUnwindSafe(|| observer.on_status(&event))).is_err() {
            error!(execution = %event.execution_id, state = %event.state, "status observer panicked");
        }
    }
}

/// Starts the task that turns worker events into observer calls.
///
/// Runs until the link reports `Disconnected` (or its event stream ends),
/// then ends any active execution with `aborted` when the session is closing
/// and `failed` otherwise.
pub(crate) fn spawn(
    mut events: UnboundedReceiver<WorkerEvent>,
    exec: Arc<Mutex<ExecutionController>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            match events.recv().await {
                Some(WorkerEvent::Notification(req)) => {
                    if !matches!(req.method.parse::<Method>(), Ok(Method::Status)) {
                        debug!(method = %req.method, "ignoring worker notification");
                        continue;
                    }
                    let status = match req.params.map(serde_json::from_value::<StatusParams>) {
                        Some(Ok(status)) => status,
                        Some(Err(err)) => {
                            warn!("malformed status from worker: {err}");
                            continue;
                        }
                        None => {
                            warn!("status notification without params");
                            continue;
                        }
                    };
                    let delivery = lock(&exec).accept(status);
                    if let Some(delivery) = delivery {
                        delivery.deliver();
                    }
                }
                Some(WorkerEvent::Disconnected { reason }) => break reason,
                None => break "worker event stream ended".to_string(),
            }
        };

        let delivery = {
            let mut ctl = lock(&exec);
            let state = if ctl.is_closing() {
                ExecutionState::Aborted
            } else {
                ExecutionState::Failed
            };
            ctl.synthesize(state, &reason)
        };
        match delivery {
            Some(delivery) => delivery.deliver(),
            None => info!(%reason, "worker link closed"),
        }
    })
}
