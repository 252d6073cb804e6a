use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;
use worker_protocol::message::{ExecutionState, FlowListItem, StatusParams};

use crate::dispatcher::{Delivery, StatusEvent, StatusObserver};
use crate::error::ExecError;

struct ActiveExecution {
    execution_id: String,
    flow: FlowListItem,
    state: ExecutionState,
    stop_requested: bool,
    last_seq: u64,
    observer: Arc<dyn StatusObserver>,
}

/// State machine for the one execution a session may run at a time.
///
/// It never performs I/O: the session asks it what to send and the
/// dispatcher asks it what to deliver. Whatever it hands out as a
/// [`Delivery`] is already committed, so observers run outside its lock.
#[derive(Default)]
pub struct ExecutionController {
    active: Option<ActiveExecution>,
    closing: bool,
}

impl ExecutionController {
    pub fn state(&self) -> ExecutionState {
        self.active.as_ref().map(|a| a.state).unwrap_or_default()
    }

    pub fn is_executing(&self) -> bool {
        self.state().is_executing()
    }

    pub fn current_flow(&self) -> Option<FlowListItem> {
        self.active.as_ref().map(|a| a.flow.clone())
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.execution_id.as_str())
    }

    /// Claims the controller for `flow` and returns the new execution id.
    pub(crate) fn reserve(
        &mut self,
        flow: FlowListItem,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<String, ExecError> {
        if self.active.is_some() {
            return Err(ExecError::AlreadyRunning);
        }
        let execution_id = Uuid::new_v4().to_string();
        self.active = Some(ActiveExecution {
            execution_id: execution_id.clone(),
            flow,
            state: ExecutionState::ReadyStart,
            stop_requested: false,
            last_seq: 0,
            observer,
        });
        Ok(execution_id)
    }

    /// Drops a reservation the worker never accepted.
    pub(crate) fn release(&mut self, execution_id: &str) -> bool {
        if self.execution_id() == Some(execution_id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Drops an execution whose `execute` was never confirmed.
    ///
    /// If the worker already reported progress for it, the observer gets a
    /// synthesized `failed` so the run still ends exactly once.
    pub(crate) fn abandon(&mut self, execution_id: &str, reason: &str) -> Option<Delivery> {
        let seen = self
            .active
            .as_ref()
            .filter(|a| a.execution_id == execution_id)
            .map(|a| a.last_seq > 0)?;
        if seen {
            self.synthesize(ExecutionState::Failed, reason)
        } else {
            self.active = None;
            None
        }
    }

    /// Returns the id to send a stop for, or `None` when one is already out.
    pub(crate) fn begin_stop(&mut self) -> Result<Option<String>, ExecError> {
        let active = self.active.as_mut().ok_or(ExecError::NotRunning)?;
        if !active.state.is_stoppable() {
            return Err(ExecError::NotRunning);
        }
        if active.stop_requested {
            debug!(execution = %active.execution_id, "stop already requested");
            return Ok(None);
        }
        active.stop_requested = true;
        Ok(Some(active.execution_id.clone()))
    }

    /// The stop request never reached the worker; allow another one.
    pub(crate) fn stop_failed(&mut self, execution_id: &str) {
        if let Some(active) = self.active.as_mut().filter(|a| a.execution_id == execution_id) {
            active.stop_requested = false;
        }
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    /// Folds one worker status into the state machine.
    ///
    /// Events for other executions, redeliveries (`seq` not above the last
    /// one seen) and anything after a terminal state yield `None`.
    pub(crate) fn accept(&mut self, status: StatusParams) -> Option<Delivery> {
        let Some(active) = self.active.as_mut() else {
            debug!(execution = %status.execution_id, state = %status.state, "status without an active execution");
            return None;
        };
        if status.execution_id != active.execution_id {
            warn!(execution = %status.execution_id, "status for a foreign execution dropped");
            return None;
        }
        if status.seq <= active.last_seq {
            debug!(execution = %status.execution_id, seq = status.seq, "duplicate status dropped");
            return None;
        }
        if status.seq > active.last_seq + 1 {
            warn!(
                execution = %status.execution_id,
                expected = active.last_seq + 1,
                got = status.seq,
                "status sequence gap"
            );
        }

        active.last_seq = status.seq;
        active.state = status.state;
        let delivery = Delivery {
            observer: Arc::clone(&active.observer),
            event: StatusEvent::new(
                active.execution_id.clone(),
                active.flow.clone(),
                status.state,
                status.payload,
                false,
            ),
        };
        if status.state.is_terminal() {
            info!(execution = %delivery.event.execution_id, state = %status.state, "execution finished");
            self.active = None;
        }
        Some(delivery)
    }

    /// Ends the active execution locally with `state`, e.g. when the link died.
    pub(crate) fn synthesize(&mut self, state: ExecutionState, reason: &str) -> Option<Delivery> {
        let active = self.active.take()?;
        warn!(execution = %active.execution_id, %state, %reason, "synthesizing terminal status");
        Some(Delivery {
            observer: active.observer,
            event: StatusEvent::new(
                active.execution_id,
                active.flow,
                state,
                Some(json!({ "reason": reason })),
                true,
            ),
        })
    }
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("execution_id", &self.execution_id())
            .field("state", &self.state())
            .field("closing", &self.closing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn StatusObserver> {
        Arc::new(|_: &StatusEvent| {})
    }

    fn status(id: &str, seq: u64, state: ExecutionState) -> StatusParams {
        StatusParams { execution_id: id.to_string(), seq, state, payload: None }
    }

    #[test]
    fn only_one_execution_at_a_time() {
        let mut ctl = ExecutionController::default();
        assert_eq!(ctl.state(), ExecutionState::Idle);
        ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        assert!(ctl.is_executing());
        assert_eq!(
            ctl.reserve(FlowListItem::new("b", "B"), noop()),
            Err(ExecError::AlreadyRunning)
        );
        assert_eq!(ctl.current_flow().unwrap().id, "a");
    }

    #[test]
    fn redelivered_and_foreign_events_are_dropped() {
        let mut ctl = ExecutionController::default();
        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();

        assert!(ctl.accept(status(&id, 1, ExecutionState::ReadyStart)).is_some());
        assert!(ctl.accept(status(&id, 1, ExecutionState::ReadyStart)).is_none());
        assert!(ctl.accept(status("other", 2, ExecutionState::Running)).is_none());
        assert!(ctl.accept(status(&id, 2, ExecutionState::Running)).is_some());

        let done = ctl.accept(status(&id, 3, ExecutionState::Completed)).unwrap();
        assert_eq!(done.event.state, ExecutionState::Completed);
        assert!(!done.event.synthesized);
        assert!(ctl.accept(status(&id, 3, ExecutionState::Completed)).is_none());
        assert_eq!(ctl.state(), ExecutionState::Idle);
    }

    #[test]
    fn stop_is_sent_once_and_only_when_running() {
        let mut ctl = ExecutionController::default();
        assert_eq!(ctl.begin_stop(), Err(ExecError::NotRunning));

        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        assert_eq!(ctl.begin_stop(), Err(ExecError::NotRunning));

        ctl.accept(status(&id, 1, ExecutionState::Running));
        assert_eq!(ctl.begin_stop(), Ok(Some(id.clone())));
        assert_eq!(ctl.begin_stop(), Ok(None));

        ctl.stop_failed(&id);
        assert_eq!(ctl.begin_stop(), Ok(Some(id.clone())));

        ctl.accept(status(&id, 2, ExecutionState::ReadyStop));
        assert_eq!(ctl.begin_stop(), Ok(None));
    }

    #[test]
    fn synthesized_terminal_carries_the_reason() {
        let mut ctl = ExecutionController::default();
        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        let d = ctl.synthesize(ExecutionState::Failed, "worker closed its output").unwrap();
        assert_eq!(d.event.execution_id, id);
        assert!(d.event.synthesized);
        assert_eq!(d.event.payload.unwrap()["reason"], "worker closed its output");
        assert!(ctl.synthesize(ExecutionState::Failed, "again").is_none());
    }

    #[test]
    fn unconfirmed_execution_ends_once_if_it_was_seen() {
        let mut ctl = ExecutionController::default();
        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        assert!(ctl.abandon("someone-else", "no ack").is_none());
        assert!(ctl.abandon(&id, "no ack").is_none());
        assert_eq!(ctl.state(), ExecutionState::Idle);

        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        ctl.accept(status(&id, 1, ExecutionState::ReadyStart));
        let d = ctl.abandon(&id, "no ack").unwrap();
        assert_eq!(d.event.state, ExecutionState::Failed);
        assert!(d.event.synthesized);
        assert!(ctl.accept(status(&id, 2, ExecutionState::Running)).is_none());
    }

    #[test]
    fn release_only_matches_its_own_reservation() {
        let mut ctl = ExecutionController::default();
        let id = ctl.reserve(FlowListItem::new("a", "A"), noop()).unwrap();
        assert!(!ctl.release("someone-else"));
        assert!(ctl.release(&id));
        assert!(!ctl.is_executing());
    }
}
