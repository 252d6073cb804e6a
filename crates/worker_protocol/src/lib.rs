pub mod jsonrpc;
pub mod message;
pub mod worker_runtime;
pub mod worker_actor;

#[cfg(feature = "test-utils")]
pub mod worker_test_util;
