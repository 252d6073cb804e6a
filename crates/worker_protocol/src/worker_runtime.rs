//! Async runtime that wires **stdin / stdout** JSON‑RPC traffic to a
//! user‑supplied `WorkerHandler` implementation.
//!
//! A worker binary only has to implement the handler and call [`run`]:
//! ```ignore
//! use worker_protocol::worker_runtime::run;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(MyWorker::default()).await
//! }
//! ```
//!
//! Requests are dispatched in arrival order, notifications (no `id`) get no
//! reply, and anything the handler pushes through its [`StatusSink`] is
//! written to stdout as a `status` notification. stdout carries protocol
//! traffic only; logs go to stderr or to the log directory sent in `hello`.

use std::sync::Once;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, dispatcher, warn, Dispatch};
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::{fmt, Layer, Registry};

use crate::jsonrpc::{self, Id, Message, Request, Response};
use crate::message::*;
use crate::worker_actor::Method;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// -----------------------------------------------------------------------------
// StatusSink – how a handler talks back
// -----------------------------------------------------------------------------

/// Pushes `status` notifications to the client.
///
/// The sink is tied to the link: once the link is gone `emit` returns
/// `false` and nothing is sent.
#[derive(Clone, Debug)]
pub struct StatusSink {
    tx: UnboundedSender<Request>,
    link: CancellationToken,
}

impl StatusSink {
    pub fn new(tx: UnboundedSender<Request>, link: CancellationToken) -> Self {
        Self { tx, link }
    }

    pub fn emit(&self, status: StatusParams) -> bool {
        if self.link.is_cancelled() {
            return false;
        }
        let params = match serde_json::to_value(&status) {
            Ok(v) => v,
            Err(err) => {
                warn!("could not encode status {:?}: {err}", status.state);
                return false;
            }
        };
        self.tx
            .send(Request::notification(Method::Status, Some(params)))
            .is_ok()
    }

    /// Drops the link, as if the worker went away.
    pub fn disconnect(&self) {
        self.link.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.link.is_cancelled()
    }
}

// -----------------------------------------------------------------------------
// WorkerHandler trait – implement this in your worker
// -----------------------------------------------------------------------------

#[async_trait]
pub trait WorkerHandler: Send + Sync + Clone + 'static {
    fn version(&self) -> String {
        VERSION.to_string()
    }

    /// Protocol version this worker speaks.
    fn protocol(&self) -> String {
        PROTOCOL_VERSION.to_string()
    }

    /// Handshake. The client decides whether the answer is acceptable.
    async fn hello(&mut self, _params: HelloParams) -> HelloResult {
        HelloResult { worker_version: self.version(), protocol: self.protocol() }
    }

    /// Flows in the order the client should show them.
    async fn list_flows(&self) -> ListFlowsResult;

    /// Start a flow and return at once; progress goes through `sink`.
    async fn execute(
        &mut self,
        params: ExecuteParams,
        sink: StatusSink,
    ) -> Result<ExecuteResult, jsonrpc::Error>;

    /// Ask the running flow to stop. Cooperative.
    async fn stop(&mut self, params: StopParams) -> Result<StopResult, jsonrpc::Error>;

    async fn health(&self) -> HealthResult {
        HealthResult { healthy: true, reason: None }
    }
}

// -----------------------------------------------------------------------------
// Request dispatch, shared by the stdio loop and the in-process link
// -----------------------------------------------------------------------------

/// Handle one request and return the reply, or `None` for notifications.
pub async fn dispatch<H: WorkerHandler>(
    handler: &mut H,
    req: Request,
    sink: &StatusSink,
) -> Option<Response> {
    fn reply<T: Serialize>(id: Option<Id>, res: Result<T, jsonrpc::Error>) -> Option<Response> {
        let id = id?;
        Some(match res.map(|v| serde_json::to_value(v)) {
            Ok(Ok(v)) => Response::success(id, v),
            Ok(Err(e)) => Response::fail(id, -32603, "Internal error", Some(json!(e.to_string()))),
            Err(e) => Response::fail(id, e.code, e.message, e.data),
        })
    }

    fn params<T: serde::de::DeserializeOwned>(v: Option<Value>) -> Result<T, jsonrpc::Error> {
        serde_json::from_value(v.unwrap_or(Value::Null)).map_err(|e| jsonrpc::Error {
            code: jsonrpc::INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!(e.to_string())),
        })
    }

    let Request { method, params: raw, id, .. } = req;
    match method.parse::<Method>() {
        Ok(Method::Hello) => match params::<HelloParams>(raw) {
            Ok(p) => reply(id, Ok(handler.hello(p).await)),
            Err(e) => reply::<()>(id, Err(e)),
        },
        Ok(Method::ListFlows) => reply(id, Ok(handler.list_flows().await)),
        Ok(Method::Execute) => match params::<ExecuteParams>(raw) {
            Ok(p) => reply(id, handler.execute(p, sink.clone()).await),
            Err(e) => reply::<()>(id, Err(e)),
        },
        Ok(Method::Stop) => match params::<StopParams>(raw) {
            Ok(p) => reply(id, handler.stop(p).await),
            Err(e) => reply::<()>(id, Err(e)),
        },
        Ok(Method::Health) => reply(id, Ok(handler.health().await)),
        Ok(Method::Shutdown) => {
            debug!("shutdown requested by client");
            sink.disconnect();
            reply(id, Ok(Value::Null))
        }
        // `status` only flows worker → client
        Ok(Method::Status) | Err(_) => {
            warn!("client asked for unknown method `{method}`");
            reply::<()>(
                id,
                Err(jsonrpc::Error::new(jsonrpc::METHOD_NOT_FOUND, "Method not found")),
            )
        }
    }
}

// -----------------------------------------------------------------------------
// Logging for worker processes
// -----------------------------------------------------------------------------

/// Install the worker's tracing subscriber from the `hello` params.
///
/// Writes to a daily file in `log_dir` when given, to stderr otherwise.
/// Runs once per process; later calls are ignored.
pub fn init_worker_logging(params: &HelloParams) {
    static LOG_INIT: Once = Once::new();
    LOG_INIT.call_once(|| {
        let level = match params.log_level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        };

        let subscriber: Dispatch = match &params.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).ok();
                Dispatch::new(
                    Registry::default().with(
                        fmt::layer()
                            .with_ansi(false)
                            .with_target(false)
                            .with_writer(daily(dir, "worker.log"))
                            .with_filter(level),
                    ),
                )
            }
            None => Dispatch::new(
                Registry::default().with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::io::stderr)
                        .with_filter(level),
                ),
            ),
        };

        if dispatcher::set_global_default(subscriber).is_err() {
            eprintln!("worker logging already initialised");
        }
    });
}

// -----------------------------------------------------------------------------
// Runtime function – spawn read / write loops
// -----------------------------------------------------------------------------

/// Runs the JSON‑RPC stdin/stdout loop until EOF, `shutdown`, or the handler
/// drops the link.
pub async fn run<H: WorkerHandler>(mut handler: H) -> Result<()> {
    let link = CancellationToken::new();

    // ── 1. single writer so lines never interleave ───────────────────
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(io::stdout());
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                eprintln!("stdout write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                eprintln!("stdout flush error");
                break;
            }
        }
    });

    fn enqueue<T: Serialize>(tx: &UnboundedSender<String>, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(s) => {
                let _ = tx.send(format!("{s}\n"));
            }
            Err(e) => eprintln!("could not encode outgoing message: {e}"),
        }
    }

    // ── 2. status notifications from the handler → writer ────────────
    let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Request>();
    let sink = StatusSink::new(note_tx, link.clone());
    {
        let tx = tx.clone();
        let link = link.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    note = note_rx.recv() => match note {
                        Some(req) => enqueue(&tx, &req),
                        None => break,
                    },
                    _ = link.cancelled() => break,
                }
            }
            while let Ok(req) = note_rx.try_recv() {
                enqueue(&tx, &req);
            }
        });
    }

    // ── 3. read stdin, dispatch requests, send responses via the same tx ─
    let mut reader = BufReader::new(io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = link.cancelled() => break,
            line = reader.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(line) {
            Ok(Message::Request(req)) => {
                if matches!(req.method.parse::<Method>(), Ok(Method::Hello)) {
                    if let Some(p) = req
                        .params
                        .clone()
                        .and_then(|v| serde_json::from_value::<HelloParams>(v).ok())
                    {
                        init_worker_logging(&p);
                    }
                }
                if let Some(rsp) = dispatch(&mut handler, req, &sink).await {
                    enqueue(&tx, &rsp);
                }
            }
            Ok(Message::Response(_)) => { /* the client never answers us */ }
            Err(e) => {
                let err = Response::fail(
                    Id::Null,
                    jsonrpc::PARSE_ERROR,
                    "Parse error",
                    Some(json!(e.to_string())),
                );
                enqueue(&tx, &err);
            }
        }
    }

    // let queued replies reach stdout before the process exits
    link.cancel();
    drop(sink);
    drop(tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct EchoWorker;

    #[async_trait]
    impl WorkerHandler for EchoWorker {
        async fn list_flows(&self) -> ListFlowsResult {
            ListFlowsResult { flows: vec![FlowListItem::new("a", "Alpha")] }
        }

        async fn execute(
            &mut self,
            params: ExecuteParams,
            sink: StatusSink,
        ) -> Result<ExecuteResult, jsonrpc::Error> {
            if params.flow_id != "a" {
                return Err(jsonrpc::Error::new(jsonrpc::UNKNOWN_FLOW, "unknown flow"));
            }
            sink.emit(StatusParams {
                execution_id: params.execution_id,
                seq: 1,
                state: ExecutionState::ReadyStart,
                payload: None,
            });
            Ok(ExecuteResult { accepted: true })
        }

        async fn stop(&mut self, _params: StopParams) -> Result<StopResult, jsonrpc::Error> {
            Ok(StopResult { accepted: false })
        }
    }

    fn sink() -> (StatusSink, mpsc::UnboundedReceiver<Request>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = CancellationToken::new();
        (StatusSink::new(tx, link.clone()), rx, link)
    }

    #[tokio::test]
    async fn dispatch_replies_to_calls() {
        let (sink, _rx, _link) = sink();
        let mut worker = EchoWorker;
        let req = Request::call(Id::Number(7), Method::ListFlows, None);
        let rsp = dispatch(&mut worker, req, &sink).await.expect("reply");
        assert_eq!(rsp.id, Id::Number(7));
        let flows: ListFlowsResult = serde_json::from_value(rsp.result.unwrap()).unwrap();
        assert_eq!(flows.flows[0].name, "Alpha");
    }

    #[tokio::test]
    async fn dispatch_maps_handler_errors() {
        let (sink, _rx, _link) = sink();
        let mut worker = EchoWorker;
        let req = Request::call(
            Id::Number(1),
            Method::Execute,
            Some(json!({"execution_id": "e", "flow_id": "zzz"})),
        );
        let rsp = dispatch(&mut worker, req, &sink).await.unwrap();
        assert_eq!(rsp.error.unwrap().code, jsonrpc::UNKNOWN_FLOW);
    }

    #[tokio::test]
    async fn dispatch_rejects_bad_params_and_methods() {
        let (sink, _rx, _link) = sink();
        let mut worker = EchoWorker;

        let req = Request::call(Id::Number(1), Method::Execute, Some(json!({"nope": 1})));
        let rsp = dispatch(&mut worker, req, &sink).await.unwrap();
        assert_eq!(rsp.error.unwrap().code, jsonrpc::INVALID_PARAMS);

        let req = Request {
            jsonrpc: jsonrpc::JSONRPC_VERSION.into(),
            method: "frobnicate".into(),
            params: None,
            id: Some(Id::Number(2)),
        };
        let rsp = dispatch(&mut worker, req, &sink).await.unwrap();
        assert_eq!(rsp.error.unwrap().code, jsonrpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_pushes_status_through_the_sink() {
        let (sink, mut rx, _link) = sink();
        let mut worker = EchoWorker;
        let req = Request::call(
            Id::Number(3),
            Method::Execute,
            Some(json!({"execution_id": "e1", "flow_id": "a"})),
        );
        dispatch(&mut worker, req, &sink).await.unwrap();

        let note = rx.recv().await.expect("status notification");
        assert_eq!(note.method, "status");
        assert!(note.is_notification());
        let status: StatusParams = serde_json::from_value(note.params.unwrap()).unwrap();
        assert_eq!(status.state, ExecutionState::ReadyStart);
        assert_eq!(status.execution_id, "e1");
    }

    #[tokio::test]
    async fn shutdown_is_silent_and_drops_the_link() {
        let (sink, _rx, link) = sink();
        let mut worker = EchoWorker;
        let req = Request::notification(Method::Shutdown, None);
        assert!(dispatch(&mut worker, req, &sink).await.is_none());
        assert!(link.is_cancelled());
        assert!(!sink.emit(StatusParams {
            execution_id: "e".into(),
            seq: 1,
            state: ExecutionState::Running,
            payload: None,
        }));
    }
}
