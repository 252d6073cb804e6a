use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the line protocol. Client and worker must agree on it.
pub const PROTOCOL_VERSION: &str = "1";

/// One executable flow known to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowListItem {
    pub id: String,                      // Opaque worker-side identifier
    pub name: String,                    // What a list widget shows
}

impl FlowListItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into() }
    }
}

impl fmt::Display for FlowListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Lifecycle of one flow execution.
///
/// Every variant except `Idle` has a wire token which must be kept verbatim:
/// `readyStart`, `readyStop`, `running`, `completed`, `failed`, `aborted`,
/// `timeout` and `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionState {
    #[default]
    #[serde(skip)]
    Idle,
    ReadyStart,
    Running,
    ReadyStop,
    Completed,
    Failed,
    Aborted,
    Timeout,
    #[serde(rename = "stop")]
    Stopped,
}

impl ExecutionState {
    /// Returns the canonical wire token. `Idle` is local only and reads `idle`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::ReadyStart => "readyStart",
            ExecutionState::Running => "running",
            ExecutionState::ReadyStop => "readyStop",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Aborted => "aborted",
            ExecutionState::Timeout => "timeout",
            ExecutionState::Stopped => "stop",
        }
    }

    /// No further events follow a terminal state.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Aborted
                | ExecutionState::Timeout
                | ExecutionState::Stopped
        )
    }

    pub const fn is_executing(&self) -> bool {
        matches!(
            self,
            ExecutionState::ReadyStart | ExecutionState::Running | ExecutionState::ReadyStop
        )
    }

    /// States in which a stop request is accepted.
    pub const fn is_stoppable(&self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::ReadyStop)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readyStart" => Ok(ExecutionState::ReadyStart),
            "running" => Ok(ExecutionState::Running),
            "readyStop" => Ok(ExecutionState::ReadyStop),
            "completed" => Ok(ExecutionState::Completed),
            "failed" => Ok(ExecutionState::Failed),
            "aborted" => Ok(ExecutionState::Aborted),
            "timeout" => Ok(ExecutionState::Timeout),
            "stop" => Ok(ExecutionState::Stopped),
            other => Err(format!("unknown status token `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

// -----------------------------------------------------------------------------
// Params / results per method
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloParams {
    pub client_version: String,
    pub protocol: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResult {
    pub worker_version: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListFlowsResult {
    pub flows: Vec<FlowListItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub execution_id: String,
    pub flow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopParams {
    pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of the `status` notification pushed by the worker.
///
/// `seq` starts at 1 for every execution and grows by one per transition;
/// a redelivered event repeats its original `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusParams {
    pub execution_id: String,
    pub seq: u64,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tokens_are_preserved() {
        let tokens = [
            (ExecutionState::ReadyStart, "readyStart"),
            (ExecutionState::ReadyStop, "readyStop"),
            (ExecutionState::Running, "running"),
            (ExecutionState::Completed, "completed"),
            (ExecutionState::Failed, "failed"),
            (ExecutionState::Aborted, "aborted"),
            (ExecutionState::Timeout, "timeout"),
            (ExecutionState::Stopped, "stop"),
        ];
        for (state, token) in tokens {
            assert_eq!(state.to_string(), token);
            assert_eq!(token.parse::<ExecutionState>().unwrap(), state);
            assert_eq!(serde_json::to_value(state).unwrap(), json!(token));
        }
    }

    #[test]
    fn idle_never_parses_from_the_wire() {
        assert!("idle".parse::<ExecutionState>().is_err());
        assert!(serde_json::from_value::<ExecutionState>(json!("idle")).is_err());
        assert!(serde_json::from_value::<ExecutionState>(json!("stopped")).is_err());
    }

    #[test]
    fn terminal_classification() {
        assert!(ExecutionState::Stopped.is_terminal());
        assert!(ExecutionState::Timeout.is_terminal());
        assert!(!ExecutionState::ReadyStop.is_terminal());
        assert!(!ExecutionState::Idle.is_terminal());
        assert!(ExecutionState::ReadyStart.is_executing());
        assert!(!ExecutionState::ReadyStart.is_stoppable());
        assert!(ExecutionState::ReadyStop.is_stoppable());
    }

    #[test]
    fn status_params_from_wire() {
        let p: StatusParams = serde_json::from_value(json!({
            "execution_id": "e1",
            "seq": 3,
            "state": "stop",
        }))
        .unwrap();
        assert_eq!(p.state, ExecutionState::Stopped);
        assert_eq!(p.payload, None);
    }

    #[test]
    fn flow_item_displays_its_name() {
        let item = FlowListItem::new("f-1", "Invoice export");
        assert_eq!(item.to_string(), "Invoice export");
    }
}
