use std::path::Path;
use std::sync::Arc;

use tracing::warn;
use worker_protocol::message::{ExecutionState, FlowListItem, HealthResult, HelloResult};

use crate::config::ClientConfig;
use crate::dispatcher::StatusObserver;
use crate::error::ClientError;
use crate::runtime::{init_tokio_runtime, run_blocking};
use crate::session::Session;
use crate::transport::Connector;

/// Blocking face of [`Session`].
///
/// Each call parks the calling thread while the shared runtime drives the
/// async core, so state and errors are identical. Not for use from inside
/// an async context.
#[derive(Debug)]
pub struct BlockingSession {
    inner: Session,
}

impl BlockingSession {
    pub fn new(config: ClientConfig) -> std::io::Result<Self> {
        init_tokio_runtime()?;
        Ok(Self { inner: Session::new(config) })
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> std::io::Result<Self> {
        init_tokio_runtime()?;
        Ok(Self { inner: Session::with_connector(config, connector) })
    }

    pub fn open(&self, work_path: Option<&Path>) -> Result<(), ClientError> {
        run_blocking(self.inner.open(work_path))?
    }

    pub fn close(&self) {
        if let Err(err) = run_blocking(self.inner.close()) {
            warn!("runtime unavailable, session not closed: {err}");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn get_flow_list(&self) -> Result<Vec<FlowListItem>, ClientError> {
        run_blocking(self.inner.get_flow_list())?
    }

    pub fn execute<O>(&self, item: &FlowListItem, observer: O) -> Result<(), ClientError>
    where
        O: StatusObserver + 'static,
    {
        run_blocking(self.inner.execute(item, observer))?
    }

    pub fn stop(&self) -> Result<(), ClientError> {
        run_blocking(self.inner.stop())?
    }

    pub fn is_executing(&self) -> bool {
        self.inner.is_executing()
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.state()
    }

    pub fn current_flow(&self) -> Option<FlowListItem> {
        self.inner.current_flow()
    }

    pub fn health(&self) -> Result<HealthResult, ClientError> {
        run_blocking(self.inner.health())?
    }

    pub fn worker_info(&self) -> Option<HelloResult> {
        self.inner.worker_info()
    }

    /// The async session underneath.
    pub fn as_async(&self) -> &Session {
        &self.inner
    }
}
