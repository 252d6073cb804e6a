use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::jsonrpc;
use crate::message::*;
use crate::worker_runtime::{StatusSink, WorkerHandler};

/// How long a scripted flow takes to honour a stop request.
const STOP_LATENCY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub state: ExecutionState,
    /// Pause before this step is emitted.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ScriptStep {
    pub fn new(state: ExecutionState, delay_ms: u64) -> Self {
        Self { state, delay_ms, payload: None }
    }
}

/// A flow the mock worker knows how to "run".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedFlow {
    #[serde(flatten)]
    pub item: FlowListItem,
    pub steps: Vec<ScriptStep>,
    /// Send every status twice with the same `seq`.
    #[serde(default)]
    pub redeliver: bool,
    /// Drop the link instead of emitting step `n`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_at: Option<usize>,
}

impl ScriptedFlow {
    /// `readyStart`, `running`, then `completed` after `run_ms`.
    pub fn completing(id: &str, name: &str, run_ms: u64) -> Self {
        Self::ending(id, name, run_ms, ExecutionState::Completed)
    }

    /// `readyStart`, `running`, then `terminal` after `run_ms`.
    pub fn ending(id: &str, name: &str, run_ms: u64, terminal: ExecutionState) -> Self {
        Self {
            item: FlowListItem::new(id, name),
            steps: vec![
                ScriptStep::new(ExecutionState::ReadyStart, 0),
                ScriptStep::new(ExecutionState::Running, 0),
                ScriptStep::new(terminal, run_ms),
            ],
            redeliver: false,
            crash_at: None,
        }
    }

    pub fn redelivering(mut self) -> Self {
        self.redeliver = true;
        self
    }

    pub fn crashing_at(mut self, step: usize) -> Self {
        self.crash_at = Some(step);
        self
    }
}

#[derive(Debug)]
struct ActiveRun {
    execution_id: String,
    stop: CancellationToken,
}

#[derive(Debug, Default)]
struct Counters {
    execute: AtomicUsize,
    stop: AtomicUsize,
    list: AtomicUsize,
}

/// Worker whose flows follow fixed scripts. Clones share all state.
#[derive(Debug, Clone)]
pub struct ScriptedWorker {
    flows: Arc<RwLock<Vec<ScriptedFlow>>>,
    protocol: String,
    active: Arc<Mutex<Option<ActiveRun>>>,
    counters: Arc<Counters>,
}

impl ScriptedWorker {
    pub fn new(flows: Vec<ScriptedFlow>) -> Self {
        Self {
            flows: Arc::new(RwLock::new(flows)),
            protocol: PROTOCOL_VERSION.to_string(),
            active: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// A handful of flows covering the usual outcomes.
    pub fn demo() -> Self {
        Self::new(vec![
            ScriptedFlow::completing("invoice-export", "Invoice export", 50),
            ScriptedFlow::completing("nightly-report", "Nightly report", 5_000),
            ScriptedFlow::ending("flaky-sync", "Flaky sync", 100, ExecutionState::Failed),
            ScriptedFlow::ending("slow-portal", "Slow portal login", 200, ExecutionState::Timeout),
        ])
    }

    /// Load flows from a JSON array of `ScriptedFlow`.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let flows: Vec<ScriptedFlow> = serde_json::from_str(&raw)?;
        Ok(Self::new(flows))
    }

    /// Answer the handshake with another protocol version.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    /// Swap the catalog, e.g. to make a client's snapshot stale.
    pub fn set_flows(&self, flows: Vec<ScriptedFlow>) {
        if let Ok(mut guard) = self.flows.write() {
            *guard = flows;
        }
    }

    pub fn execute_requests(&self) -> usize {
        self.counters.execute.load(Ordering::SeqCst)
    }

    pub fn stop_requests(&self) -> usize {
        self.counters.stop.load(Ordering::SeqCst)
    }

    pub fn list_requests(&self) -> usize {
        self.counters.list.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    fn find(&self, flow_id: &str) -> Option<ScriptedFlow> {
        self.flows
            .read()
            .ok()?
            .iter()
            .find(|f| f.item.id == flow_id)
            .cloned()
    }
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::demo()
    }
}

/// Numbers and sends the status events of one run.
struct Emitter {
    sink: StatusSink,
    execution_id: String,
    seq: u64,
    redeliver: bool,
}

impl Emitter {
    fn emit(&mut self, state: ExecutionState, payload: Option<Value>) {
        self.seq += 1;
        let status = StatusParams {
            execution_id: self.execution_id.clone(),
            seq: self.seq,
            state,
            payload,
        };
        debug!(execution = %self.execution_id, seq = self.seq, %state, "emit");
        if self.redeliver {
            self.sink.emit(status.clone());
        }
        self.sink.emit(status);
    }
}

async fn play(flow: ScriptedFlow, mut out: Emitter, stop: CancellationToken) {
    for (i, step) in flow.steps.iter().enumerate() {
        if flow.crash_at == Some(i) {
            info!(flow = %flow.item.id, "scripted crash");
            out.sink.disconnect();
            return;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                out.emit(ExecutionState::ReadyStop, None);
                sleep(STOP_LATENCY).await;
                out.emit(ExecutionState::Stopped, Some(json!({"step": i})));
                return;
            }
            _ = sleep(Duration::from_millis(step.delay_ms)) => {}
        }
        out.emit(step.state, step.payload.clone());
        if step.state.is_terminal() {
            return;
        }
    }
}

#[async_trait]
impl WorkerHandler for ScriptedWorker {
    fn version(&self) -> String {
        format!("{}-scripted", crate::worker_runtime::VERSION)
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    async fn list_flows(&self) -> ListFlowsResult {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        let flows = self
            .flows
            .read()
            .map(|flows| flows.iter().map(|f| f.item.clone()).collect())
            .unwrap_or_default();
        ListFlowsResult { flows }
    }

    async fn execute(
        &mut self,
        params: ExecuteParams,
        sink: StatusSink,
    ) -> Result<ExecuteResult, jsonrpc::Error> {
        self.counters.execute.fetch_add(1, Ordering::SeqCst);
        let flow = self.find(&params.flow_id).ok_or_else(|| {
            jsonrpc::Error::new(
                jsonrpc::UNKNOWN_FLOW,
                format!("unknown flow `{}`", params.flow_id),
            )
        })?;

        let stop = CancellationToken::new();
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| jsonrpc::Error::new(-32603, "worker state poisoned"))?;
            if active.is_some() {
                return Err(jsonrpc::Error::new(jsonrpc::WORKER_BUSY, "a flow is already running"));
            }
            *active = Some(ActiveRun { execution_id: params.execution_id.clone(), stop: stop.clone() });
        }

        info!(flow = %flow.item.id, execution = %params.execution_id, "starting scripted flow");
        let out = Emitter {
            sink,
            execution_id: params.execution_id.clone(),
            seq: 0,
            redeliver: flow.redeliver,
        };
        let active = Arc::clone(&self.active);
        let execution_id = params.execution_id;
        tokio::spawn(async move {
            play(flow, out, stop).await;
            if let Ok(mut guard) = active.lock() {
                if guard.as_ref().is_some_and(|run| run.execution_id == execution_id) {
                    *guard = None;
                }
            }
        });

        Ok(ExecuteResult { accepted: true })
    }

    async fn stop(&mut self, params: StopParams) -> Result<StopResult, jsonrpc::Error> {
        self.counters.stop.fetch_add(1, Ordering::SeqCst);
        let active = self
            .active
            .lock()
            .map_err(|_| jsonrpc::Error::new(-32603, "worker state poisoned"))?;
        match active.as_ref() {
            Some(run) if run.execution_id == params.execution_id => {
                run.stop.cancel();
                Ok(StopResult { accepted: true })
            }
            Some(run) => Err(jsonrpc::Error::new(
                jsonrpc::UNKNOWN_EXECUTION,
                format!("execution `{}` is not running, `{}` is", params.execution_id, run.execution_id),
            )),
            // already finished: the terminal event is on its way
            None => Ok(StopResult { accepted: false }),
        }
    }
}
