use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use worker_protocol::jsonrpc;
use worker_protocol::worker_actor::RpcError;

/// Failures while standing up a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no worker executable found at {}", .0.display())]
    WorkerNotFound(PathBuf),
    #[error("could not launch worker {}: {reason}", .path.display())]
    LaunchFailed { path: PathBuf, reason: String },
    #[error("worker did not answer the handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("worker speaks protocol {worker}, client expects {client}")]
    ProtocolMismatch { client: String, worker: String },
    #[error("session is already open")]
    AlreadyOpen,
    #[error("open was cancelled by a concurrent close")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("malformed flow list: {0}")]
    Malformed(String),
    #[error("flow list not received within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("an execution is already active in this session")]
    AlreadyRunning,
    #[error("no execution is running")]
    NotRunning,
    #[error("flow `{0}` is not in the current catalog")]
    UnknownFlow(String),
}

/// The link to the worker failed underneath a request.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("worker link closed: {0}")]
    Closed(String),
    #[error("worker rejected the request: {0}")]
    Remote(jsonrpc::Error),
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply from worker: {0}")]
    Malformed(String),
}

impl From<RpcError> for ChannelError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Closed(_) | RpcError::Dropped(_) => ChannelError::Closed(err.to_string()),
            RpcError::Remote(e) => ChannelError::Remote(e),
            RpcError::MissingResult | RpcError::Decode(_) => ChannelError::Malformed(err.to_string()),
        }
    }
}

/// Everything a session operation can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("session is not open")]
    NotOpen,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The shared runtime behind the blocking API could not be started.
    #[error("blocking runtime unavailable: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ClientError {
    pub fn is_not_open(&self) -> bool {
        matches!(self, ClientError::NotOpen)
    }

    /// The execution error behind this failure, if any.
    pub fn exec(&self) -> Option<&ExecError> {
        match self {
            ClientError::Exec(e) => Some(e),
            _ => None,
        }
    }
}

/// A configuration value could not be used.
#[derive(Debug, Error)]
#[error("invalid value `{value}` for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_map_to_channel_errors() {
        let closed: ChannelError = RpcError::Closed("w".into()).into();
        assert!(matches!(closed, ChannelError::Closed(_)));

        let remote: ChannelError =
            RpcError::Remote(jsonrpc::Error::new(jsonrpc::WORKER_BUSY, "busy")).into();
        assert!(matches!(remote, ChannelError::Remote(e) if e.code == jsonrpc::WORKER_BUSY));

        let bad: ChannelError = RpcError::MissingResult.into();
        assert!(matches!(bad, ChannelError::Malformed(_)));
    }

    #[test]
    fn umbrella_keeps_the_exec_kind() {
        let err: ClientError = ExecError::AlreadyRunning.into();
        assert_eq!(err.exec(), Some(&ExecError::AlreadyRunning));
        assert!(!err.is_not_open());
        assert_eq!(err.to_string(), "an execution is already active in this session");

        let err: ClientError = std::io::Error::other("no threads").into();
        assert!(matches!(err, ClientError::Runtime(_)));
        assert!(err.exec().is_none());
    }
}
