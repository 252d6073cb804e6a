//! Client SDK for flowbot automation workers.
//!
//! A [`Session`] launches (or attaches to) a worker, lists the flows it can
//! run and drives one execution at a time, streaming every state change to a
//! [`StatusObserver`]. [`BlockingSession`] offers the same operations for
//! callers without an async runtime.

pub mod blocking;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod logger;
pub mod runtime;
pub mod session;
pub mod transport;

pub use blocking::BlockingSession;
pub use config::ClientConfig;
pub use dispatcher::{ChannelObserver, StatusEvent, StatusObserver};
pub use error::{CatalogError, ChannelError, ClientError, ConnectError, ExecError};
pub use session::Session;
pub use transport::{Connector, InProcessConnector, ProcessConnector};
pub use worker_protocol::message::{ExecutionState, FlowListItem, HealthResult};
