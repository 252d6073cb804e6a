//! Getting from "a session wants a worker" to a live, handshaken link.
//!
//! A [`Connector`] produces a [`Link`]: the JSON-RPC handle used for requests
//! plus the stream of worker pushed events consumed by the dispatcher.
//! [`ProcessConnector`] discovers and launches the worker executable;
//! [`InProcessConnector`] runs a [`WorkerHandler`] inside this process.

use std::env;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use worker_protocol::message::{HelloParams, HelloResult, PROTOCOL_VERSION};
use worker_protocol::worker_actor::{RpcError, WorkerEvent, WorkerHandle};
use worker_protocol::worker_runtime::WorkerHandler;

use crate::config::ClientConfig;
use crate::error::{ChannelError, ConnectError};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handshaken connection to one worker.
pub struct Link {
    pub handle: WorkerHandle,
    pub events: UnboundedReceiver<WorkerEvent>,
    pub worker: HelloResult,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("worker_id", &self.handle.id())
            .field("worker", &self.worker)
            .finish()
    }
}

#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Launch or attach to a worker and complete the handshake.
    ///
    /// On error nothing is left running.
    async fn connect(
        &self,
        work_path: Option<&Path>,
        config: &ClientConfig,
    ) -> Result<Link, ConnectError>;
}

/// Launches the worker executable as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        work_path: Option<&Path>,
        config: &ClientConfig,
    ) -> Result<Link, ConnectError> {
        let exe = discover_worker(work_path, config)?;
        info!(worker = %exe.display(), "launching worker");
        let (handle, events) = WorkerHandle::spawn(&exe, exe.parent())
            .await
            .map_err(|e| ConnectError::LaunchFailed { path: exe.clone(), reason: e.to_string() })?;
        handshake(handle, events, config).await
    }
}

/// Runs a worker handler on the current tokio runtime instead of a process.
#[derive(Clone)]
pub struct InProcessConnector<H> {
    handler: H,
}

impl<H: WorkerHandler> InProcessConnector<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

impl<H> fmt::Debug for InProcessConnector<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InProcessConnector")
    }
}

#[async_trait]
impl<H: WorkerHandler> Connector for InProcessConnector<H> {
    async fn connect(
        &self,
        _work_path: Option<&Path>,
        config: &ClientConfig,
    ) -> Result<Link, ConnectError> {
        let (handle, events) = WorkerHandle::in_process(self.handler.clone());
        handshake(handle, events, config).await
    }
}

/// Finds the worker executable.
///
/// Looks at `work_path`, then `config.worker_path`, then next to the running
/// executable. A directory means `<dir>/<config.worker_exe>`.
pub fn discover_worker(
    work_path: Option<&Path>,
    config: &ClientConfig,
) -> Result<PathBuf, ConnectError> {
    let candidate = match work_path.or(config.worker_path.as_deref()) {
        Some(path) => path.to_path_buf(),
        None => env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let exe = if candidate.is_dir() { candidate.join(&config.worker_exe) } else { candidate };
    if exe.is_file() {
        debug!(worker = %exe.display(), "worker discovered");
        Ok(exe)
    } else {
        Err(ConnectError::WorkerNotFound(exe))
    }
}

async fn handshake(
    handle: WorkerHandle,
    events: UnboundedReceiver<WorkerEvent>,
    config: &ClientConfig,
) -> Result<Link, ConnectError> {
    let hello = HelloParams {
        client_version: CLIENT_VERSION.to_string(),
        protocol: PROTOCOL_VERSION.to_string(),
        log_level: config.log_level,
        log_dir: config.log_dir.as_ref().map(|d| d.to_string_lossy().into_owned()),
    };

    let worker = match timeout(config.handshake_timeout, handle.hello(hello)).await {
        Ok(Ok(worker)) => worker,
        Ok(Err(err)) => {
            handle.close();
            return Err(match err {
                RpcError::Closed(_) | RpcError::Dropped(_) => ConnectError::LaunchFailed {
                    path: PathBuf::from(handle.id()),
                    reason: err.to_string(),
                },
                _ => ConnectError::ProtocolMismatch {
                    client: PROTOCOL_VERSION.to_string(),
                    worker: format!("unknown ({err})"),
                },
            });
        }
        Err(_) => {
            handle.close();
            return Err(ConnectError::HandshakeTimeout(config.handshake_timeout));
        }
    };

    if worker.protocol != PROTOCOL_VERSION {
        warn!(worker = %handle.id(), protocol = %worker.protocol, "protocol mismatch");
        handle.close();
        return Err(ConnectError::ProtocolMismatch {
            client: PROTOCOL_VERSION.to_string(),
            worker: worker.protocol,
        });
    }

    info!(worker = %handle.id(), version = %worker.worker_version, "worker ready");
    Ok(Link { handle, events, worker })
}

/// Awaits a worker request for at most `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, ChannelError> {
    match timeout(limit, request).await {
        Ok(res) => res.map_err(ChannelError::from),
        Err(_) => Err(ChannelError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use worker_protocol::worker_test_util::ScriptedWorker;

    #[test]
    fn directory_resolves_to_the_worker_exe() {
        let dir = tempdir().unwrap();
        let config = ClientConfig::default();
        let exe = dir.path().join(&config.worker_exe);
        fs::write(&exe, b"").unwrap();

        assert_eq!(discover_worker(Some(dir.path()), &config).unwrap(), exe);
        assert_eq!(discover_worker(Some(&exe), &config).unwrap(), exe);
    }

    #[test]
    fn configured_path_is_the_fallback() {
        let dir = tempdir().unwrap();
        let config = ClientConfig::default().with_worker_path(dir.path());
        let exe = dir.path().join(&config.worker_exe);
        fs::write(&exe, b"").unwrap();

        assert_eq!(discover_worker(None, &config).unwrap(), exe);
    }

    #[test]
    fn missing_worker_is_reported_with_its_path() {
        let dir = tempdir().unwrap();
        let config = ClientConfig::default();
        match discover_worker(Some(dir.path()), &config) {
            Err(ConnectError::WorkerNotFound(path)) => {
                assert_eq!(path, dir.path().join(&config.worker_exe))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_process_handshake_reports_worker_version() {
        let connector = InProcessConnector::new(ScriptedWorker::demo());
        let link = connector.connect(None, &ClientConfig::default()).await.unwrap();
        assert_eq!(link.worker.protocol, PROTOCOL_VERSION);
        assert!(link.worker.worker_version.ends_with("-scripted"));
        link.handle.close();
    }

    #[tokio::test]
    async fn protocol_mismatch_tears_the_link_down() {
        let connector = InProcessConnector::new(ScriptedWorker::demo().with_protocol("0"));
        let err = connector.connect(None, &ClientConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::ProtocolMismatch { ref worker, .. } if worker == "0"
        ));
    }
}
