use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use worker_protocol::jsonrpc;
use worker_protocol::message::{
    ExecuteParams, ExecutionState, FlowListItem, HealthResult, HelloResult, StopParams,
};
use worker_protocol::worker_actor::{RpcError, WorkerHandle};

use crate::catalog::{self, FlowCatalog};
use crate::config::ClientConfig;
use crate::dispatcher::{self, StatusObserver};
use crate::error::{ChannelError, ClientError, ConnectError, ExecError};
use crate::execution::ExecutionController;
use crate::logger::instrument_request;
use crate::transport::{Connector, ProcessConnector, bounded};

/// Locks a std mutex, riding over poisoning.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OpenSession {
    epoch: u64,
    handle: WorkerHandle,
    worker: HelloResult,
    catalog: FlowCatalog,
    exec: Arc<Mutex<ExecutionController>>,
    pump: JoinHandle<()>,
}

enum Phase {
    Closed,
    Opening(u64),
    Open(Box<OpenSession>),
}

/// Resets an unfinished `open` when its future is dropped or fails.
struct OpeningGuard<'a> {
    phase: &'a Mutex<Phase>,
    epoch: u64,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut phase = lock(self.phase);
        if matches!(*phase, Phase::Opening(e) if e == self.epoch) {
            *phase = Phase::Closed;
        }
    }
}

/// One connection lifecycle to an automation worker.
///
/// ```ignore
/// let session = Session::new(ClientConfig::default());
/// session.open(None).await?;
/// let flows = session.get_flow_list().await?;
/// session.execute(&flows[0], |ev: &StatusEvent| println!("{}", ev.state)).await?;
/// ```
///
/// The session owns the worker: `close`, or dropping the session, tears the
/// link down. An execution still active at that point ends with `aborted`.
pub struct Session {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    phase: Mutex<Phase>,
    epochs: AtomicU64,
}

impl Session {
    /// A session that launches the worker executable.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(ProcessConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config,
            phase: Mutex::new(Phase::Closed),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to the worker found at `work_path` (or by default discovery)
    /// and returns once the handshake is done.
    pub async fn open(&self, work_path: Option<&Path>) -> Result<(), ClientError> {
        let epoch = {
            let mut phase = lock(&self.phase);
            if !matches!(*phase, Phase::Closed) {
                return Err(ConnectError::AlreadyOpen.into());
            }
            let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
            *phase = Phase::Opening(epoch);
            epoch
        };
        let _guard = OpeningGuard { phase: &self.phase, epoch };

        let link = instrument_request("open", || self.connector.connect(work_path, &self.config))
            .await?;

        let mut phase = lock(&self.phase);
        if !matches!(*phase, Phase::Opening(e) if e == epoch) {
            drop(phase);
            link.handle.close();
            return Err(ConnectError::Cancelled.into());
        }
        let exec = Arc::new(Mutex::new(ExecutionController::default()));
        let pump = dispatcher::spawn(link.events, Arc::clone(&exec));
        info!(worker = %link.handle.id(), "session open");
        *phase = Phase::Open(Box::new(OpenSession {
            epoch,
            handle: link.handle,
            worker: link.worker,
            catalog: FlowCatalog::default(),
            exec,
            pump,
        }));
        Ok(())
    }

    /// Tears the session down. Never fails, safe to call any time.
    pub async fn close(&self) {
        let open = match std::mem::replace(&mut *lock(&self.phase), Phase::Closed) {
            Phase::Open(open) => open,
            Phase::Opening(epoch) => {
                debug!(epoch, "close cancels a pending open");
                return;
            }
            Phase::Closed => return,
        };
        let OpenSession { handle, exec, mut pump, .. } = *open;

        lock(&exec).mark_closing();
        if !handle.is_closed() {
            if let Err(err) = bounded(self.config.close_timeout, handle.shutdown()).await {
                debug!("shutdown notification not sent: {err}");
            }
        }
        handle.close();

        if timeout(self.config.close_timeout, &mut pump).await.is_err() {
            warn!("dispatcher did not finish within {:?}", self.config.close_timeout);
            pump.abort();
            let delivery = lock(&exec).synthesize(ExecutionState::Aborted, "session closed");
            if let Some(delivery) = delivery {
                delivery.deliver();
            }
        }
        info!(worker = %handle.id(), "session closed");
    }

    /// `true` while open and the worker link is alive.
    pub fn is_open(&self) -> bool {
        match &*lock(&self.phase) {
            Phase::Open(open) => !open.handle.is_closed(),
            _ => false,
        }
    }

    /// Version and protocol the worker reported in the handshake.
    pub fn worker_info(&self) -> Option<HelloResult> {
        match &*lock(&self.phase) {
            Phase::Open(open) => Some(open.worker.clone()),
            _ => None,
        }
    }

    /// Lists the worker's flows and makes them the snapshot `execute` checks against.
    pub async fn get_flow_list(&self) -> Result<Vec<FlowListItem>, ClientError> {
        let (epoch, handle) = self.with_open(|open| (open.epoch, open.handle.clone()))?;
        let flows = instrument_request("get_flow_list", || {
            catalog::fetch(&handle, self.config.request_timeout)
        })
        .await?;

        if let Phase::Open(open) = &mut *lock(&self.phase) {
            if open.epoch == epoch {
                open.catalog.replace(flows.clone());
            }
        }
        Ok(flows)
    }

    /// Starts `item` and returns once the worker accepted it.
    ///
    /// Status events go to `observer` until exactly one terminal event.
    pub async fn execute<O>(&self, item: &FlowListItem, observer: O) -> Result<(), ClientError>
    where
        O: StatusObserver + 'static,
    {
        let (handle, exec, known) = self.with_open(|open| {
            (open.handle.clone(), Arc::clone(&open.exec), open.catalog.contains(item))
        })?;

        let execution_id = lock(&exec).reserve(item.clone(), Arc::new(observer))?;
        if !known {
            lock(&exec).release(&execution_id);
            return Err(ExecError::UnknownFlow(item.id.clone()).into());
        }

        let params = ExecuteParams { execution_id: execution_id.clone(), flow_id: item.id.clone() };
        let outcome: Result<(), ClientError> = instrument_request("execute", || async {
            match timeout(self.config.request_timeout, handle.execute(params)).await {
                Ok(Ok(res)) if res.accepted => Ok(()),
                Ok(Ok(_)) => Err(ClientError::from(ExecError::AlreadyRunning)),
                Ok(Err(RpcError::Remote(e))) if e.code == jsonrpc::UNKNOWN_FLOW => {
                    Err(ClientError::from(ExecError::UnknownFlow(item.id.clone())))
                }
                Ok(Err(RpcError::Remote(e))) if e.code == jsonrpc::WORKER_BUSY => {
                    Err(ClientError::from(ExecError::AlreadyRunning))
                }
                Ok(Err(err)) => Err(ClientError::from(ChannelError::from(err))),
                Err(_) => Err(ClientError::from(ChannelError::Timeout(self.config.request_timeout))),
            }
        })
        .await;

        match &outcome {
            Ok(()) => info!(flow = %item.id, execution = %execution_id, "execution accepted"),
            // no verdict from the worker: it may have started the run anyway
            Err(ClientError::Channel(ChannelError::Timeout(_) | ChannelError::Malformed(_))) => {
                let delivery = lock(&exec).abandon(&execution_id, "execute was not confirmed");
                if let Some(delivery) = delivery {
                    delivery.deliver();
                }
                self.stop_abandoned(handle, execution_id);
            }
            Err(_) => {
                lock(&exec).release(&execution_id);
            }
        }
        outcome
    }

    /// Sends a best-effort stop for a run the client no longer tracks.
    ///
    /// The request queues behind the unanswered `execute`, so it is not
    /// awaited here.
    fn stop_abandoned(&self, handle: WorkerHandle, execution_id: String) {
        let limit = self.config.close_timeout;
        warn!(execution = %execution_id, "execute unconfirmed, asking the worker to stop it");
        tokio::spawn(async move {
            let params = StopParams { execution_id: execution_id.clone() };
            match bounded(limit, handle.stop(params)).await {
                Ok(res) => debug!(execution = %execution_id, accepted = res.accepted, "abandoned execution stop answered"),
                Err(err) => debug!(execution = %execution_id, "abandoned execution not stopped: {err}"),
            }
        });
    }

    /// Asks the running flow to stop.
    ///
    /// Only one request goes out per execution; repeated calls while that
    /// request is pending or being honoured return `Ok` without traffic.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let (handle, exec) = self.with_open(|open| (open.handle.clone(), Arc::clone(&open.exec)))?;
        let Some(execution_id) = lock(&exec).begin_stop()? else {
            return Ok(());
        };

        let params = StopParams { execution_id: execution_id.clone() };
        match bounded(self.config.request_timeout, handle.stop(params)).await {
            Ok(res) => {
                if !res.accepted {
                    debug!(execution = %execution_id, "worker had already finished");
                }
                Ok(())
            }
            Err(ChannelError::Remote(e)) if e.code == jsonrpc::UNKNOWN_EXECUTION => {
                lock(&exec).stop_failed(&execution_id);
                Err(ExecError::NotRunning.into())
            }
            Err(err) => {
                lock(&exec).stop_failed(&execution_id);
                Err(err.into())
            }
        }
    }

    /// `true` from `readyStart` until a terminal event was delivered.
    pub fn is_executing(&self) -> bool {
        self.with_open(|open| lock(&open.exec).is_executing()).unwrap_or(false)
    }

    /// Current execution state, `Idle` when closed.
    pub fn state(&self) -> ExecutionState {
        self.with_open(|open| lock(&open.exec).state()).unwrap_or_default()
    }

    pub fn current_flow(&self) -> Option<FlowListItem> {
        self.with_open(|open| lock(&open.exec).current_flow()).ok().flatten()
    }

    /// Asks the worker whether it is healthy.
    pub async fn health(&self) -> Result<HealthResult, ClientError> {
        let handle = self.with_open(|open| open.handle.clone())?;
        Ok(bounded(self.config.request_timeout, handle.health()).await?)
    }

    fn with_open<T>(&self, f: impl FnOnce(&OpenSession) -> T) -> Result<T, ClientError> {
        match &*lock(&self.phase) {
            Phase::Open(open) => Ok(f(open)),
            _ => Err(ClientError::NotOpen),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut *lock(&self.phase), Phase::Closed);
        if let Phase::Open(open) = phase {
            lock(&open.exec).mark_closing();
            open.handle.close();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &*lock(&self.phase) {
            Phase::Closed => "closed",
            Phase::Opening(_) => "opening",
            Phase::Open(_) => "open",
        };
        f.debug_struct("Session")
            .field("connector", &self.connector)
            .field("phase", &phase)
            .finish()
    }
}
