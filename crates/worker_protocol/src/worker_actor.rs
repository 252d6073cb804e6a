use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jsonrpc::{self, Id, Message, Request, Response};
use crate::message::*;
use crate::worker_runtime::{StatusSink, WorkerHandler, dispatch};

/// How long a worker gets to exit on its own once its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

// -----------------------------------------------------------------------------
// Methods understood on the link
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    Hello,
    ListFlows,
    Execute,
    Stop,
    Health,
    Shutdown,
    Status,
}

/// Something the worker pushed to the client without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A JSON-RPC notification, e.g. `status`.
    Notification(Request),
    /// The link is gone. Always the last event on the stream.
    Disconnected { reason: String },
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("worker link '{0}' is closed")]
    Closed(String),
    #[error("worker '{0}' dropped the response")]
    Dropped(String),
    #[error("worker returned an error: {0}")]
    Remote(jsonrpc::Error),
    #[error("response has no result field")]
    MissingResult,
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Client side of a worker link.
///
/// Speaks plain JSON-RPC to either a child process (`spawn`) or a handler
/// running inside this process (`in_process`). Cloning shares the link.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
    worker_id: String,
    link: CancellationToken,
}

impl WorkerHandle {
    pub fn new(
        tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
        worker_id: String,
        link: CancellationToken,
    ) -> Self {
        Self { tx, worker_id, link }
    }

    pub async fn call(&self, req: Request) -> Result<Response, RpcError> {
        let (tx_resp, rx_resp) = oneshot::channel();
        self.tx
            .send((req, tx_resp))
            .await
            .map_err(|_| RpcError::Closed(self.worker_id.clone()))?;
        rx_resp.await.map_err(|_| RpcError::Dropped(self.worker_id.clone()))
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_cancelled() || self.tx.is_closed()
    }

    /// Tears the link down. The event stream ends with `Disconnected`.
    pub fn close(&self) {
        self.link.cancel();
    }

    /// Call any method and deserialize the `.result` into `T`.
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, RpcError> {
        let req = Request::call(Id::String(Uuid::new_v4().to_string()), method, params);
        let rsp = self.call(req).await?;
        if let Some(err) = rsp.error {
            return Err(RpcError::Remote(err));
        }
        let v = rsp.result.ok_or(RpcError::MissingResult)?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn rpc_notify<P: Serialize>(
        &self,
        method: Method,
        params: Option<P>,
    ) -> Result<(), RpcError> {
        let params = params.map(|p| serde_json::to_value(p)).transpose()?;
        let req = Request::notification(method, params);

        // nobody answers a notification; the responder is dropped on the other side
        let (tx, _rx) = oneshot::channel();
        self.tx
            .send((req, tx))
            .await
            .map_err(|_| RpcError::Closed(self.worker_id.clone()))
    }

    // ---------------------------------------------------------------------
    // Convenience wrappers
    // ---------------------------------------------------------------------

    pub async fn hello(&self, params: HelloParams) -> Result<HelloResult, RpcError> {
        self.rpc_call(Method::Hello, Some(serde_json::to_value(params)?)).await
    }

    pub async fn list_flows(&self) -> Result<ListFlowsResult, RpcError> {
        self.rpc_call(Method::ListFlows, None).await
    }

    pub async fn execute(&self, params: ExecuteParams) -> Result<ExecuteResult, RpcError> {
        self.rpc_call(Method::Execute, Some(serde_json::to_value(params)?)).await
    }

    pub async fn stop(&self, params: StopParams) -> Result<StopResult, RpcError> {
        self.rpc_call(Method::Stop, Some(serde_json::to_value(params)?)).await
    }

    pub async fn health(&self) -> Result<HealthResult, RpcError> {
        self.rpc_call(Method::Health, None).await
    }

    /// Ask the worker to exit. Fire and forget.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.rpc_notify::<()>(Method::Shutdown, None).await
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 1)  In-process worker
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn in_process<H: WorkerHandler>(
        handler: H,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let link = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(32);
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Request>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let sink = StatusSink::new(note_tx, link.clone());

        // (a) requests → handler → responses
        {
            let link = link.clone();
            let mut handler = handler;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = link.cancelled() => break,
                        next = rx.recv() => match next {
                            Some((req, rsp_tx)) => {
                                if let Some(rsp) = dispatch(&mut handler, req, &sink).await {
                                    let _ = rsp_tx.send(rsp);
                                }
                            }
                            None => break,
                        },
                    }
                }
                // every handle is gone or the link was closed
                link.cancel();
            });
        }

        // (b) handler notifications → events, then a final Disconnected
        {
            let link = link.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        note = note_rx.recv() => match note {
                            Some(req) => { let _ = event_tx.send(WorkerEvent::Notification(req)); }
                            None => break,
                        },
                        _ = link.cancelled() => break,
                    }
                }
                while let Ok(req) = note_rx.try_recv() {
                    let _ = event_tx.send(WorkerEvent::Notification(req));
                }
                let _ = event_tx.send(WorkerEvent::Disconnected {
                    reason: "in-process worker link closed".to_string(),
                });
            });
        }

        (Self::new(tx, "in-process".to_string(), link), event_rx)
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 2)  Child-process (binary on disk)
     * ──────────────────────────────────────────────────────────────────────── */
    pub async fn spawn<P: AsRef<Path>>(
        exe_path: P,
        work_dir: Option<&Path>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(exe_path, work_dir, event_tx).await?;
        Ok((handle, event_rx))
    }
}

/// Launch `exe_path` as a child-process, wire JSON-RPC over stdin/stdout
/// and return a `WorkerHandle` that speaks plain JSON-RPC.
///
/// Every notification the worker prints is forwarded to `event_tx`. When the
/// worker's stdout closes (or the handle is closed) all pending calls fail
/// and `WorkerEvent::Disconnected` is sent.
pub async fn spawn_worker<P: AsRef<Path>>(
    exe_path: P,
    work_dir: Option<&Path>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> anyhow::Result<WorkerHandle> {
    let exe_path = exe_path.as_ref();

    // ── launch ───────────────────────────────────────────────────────
    let mut command = TokioCommand::new(exe_path);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = work_dir {
        command.current_dir(dir);
    }
    let mut child = command.spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;

    let worker_id = exe_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("worker")
        .to_string();
    info!(worker = %worker_id, pid = ?child.id(), "worker process started");

    let link = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(32);

    // in-flight calls by `id`
    let inflight: Arc<DashMap<Id, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

    // ── task that proxies rx → child.stdin ───────────────────────────
    {
        let inflight = Arc::clone(&inflight);
        let link = link.clone();
        tokio::spawn(async move {
            loop {
                let (req, rsp_tx) = tokio::select! {
                    biased;
                    _ = link.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                let line = match serde_json::to_string(&req) {
                    Ok(line) => line,
                    Err(err) => {
                        error!("could not encode request {}: {err}", req.method);
                        continue;
                    }
                };
                if let Some(id) = &req.id {
                    inflight.insert(id.clone(), rsp_tx);
                }
                debug!(target: "worker_protocol::wire", "→ {line}");
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(err) = written {
                    warn!("writing to worker failed: {err}");
                    if let Some(id) = &req.id {
                        inflight.remove(id);
                    }
                    break;
                }
            }
            // dropping stdin tells the worker to exit
            link.cancel();
        });
    }

    // ── task that reads child.stdout → routes Response|Request ───────
    {
        let inflight = Arc::clone(&inflight);
        let link = link.clone();
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            let mut rdr = BufReader::new(stdout).lines();
            let reason = loop {
                tokio::select! {
                    _ = link.cancelled() => break "link closed by client".to_string(),
                    line = rdr.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() { continue; }
                            debug!(target: "worker_protocol::wire", "← {line}");
                            match serde_json::from_str::<Message>(&line) {
                                Ok(Message::Response(rsp)) => {
                                    if let Some((_, tx_rsp)) = inflight.remove(&rsp.id) {
                                        let _ = tx_rsp.send(rsp);
                                    } else {
                                        warn!("response for unknown id {:?}", rsp.id);
                                    }
                                }
                                Ok(Message::Request(req)) => {
                                    let _ = event_tx.send(WorkerEvent::Notification(req));
                                }
                                Err(err) => warn!("unparseable line from worker: {err}"),
                            }
                        }
                        Ok(None) => break "worker closed its output".to_string(),
                        Err(err) => break format!("reading from worker failed: {err}"),
                    },
                }
            };

            link.cancel();
            // pending callers get `Dropped`
            inflight.clear();
            info!(worker = %worker_id, %reason, "worker link down");
            let _ = event_tx.send(WorkerEvent::Disconnected { reason });

            match timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(worker = %worker_id, %status, "worker exited"),
                Ok(Err(err)) => warn!(worker = %worker_id, "waiting for worker failed: {err}"),
                Err(_) => {
                    warn!(worker = %worker_id, "worker did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            }
        });
    }

    Ok(WorkerHandle::new(tx, worker_id, link))
}
