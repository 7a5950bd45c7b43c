//! Per-task state machine binding one task record to one worker.
//!
//! ```text
//! Created -> Starting -> Running -> Finished
//!               |           |  ^
//!               |           v  |  (stopped flag, Running only)
//!               +--------> Failed(kind)
//! ```
//!
//! Drivers never retry or touch the queue; they only record where the task
//! is and report terminal states to the scheduler.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::AbortHandle;

use crate::bridge::protocol::seq_at_or_after;
use crate::error::ErrorKind;
use crate::orchestrator::{Event, EventSender};
use crate::task::TaskRecord;
use crate::worker::{ClientId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DriverId(pub u64);

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "driver-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Created,
    Starting,
    Running,
    Finished,
    Failed(ErrorKind),
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_))
    }

    /// Counts against the admission thresholds.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Task timeout.
    Deadline,
    /// SIGTERM sent; SIGKILL when this fires.
    KillGrace,
    /// Remote cancel sent; give up on the client when this fires.
    CancelGrace,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("reply acknowledges {ack_no}, task request was {request_seq}")]
    StaleAck { ack_no: u16, request_seq: u16 },
    #[error("reply before the task request was sent")]
    NotDispatched,
}

/// Why the farm asked a task to end early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ending {
    pub kind: ErrorKind,
    pub detail: String,
}

pub struct TaskDriver {
    id: DriverId,
    task: TaskRecord,
    attempts: u32,
    worker: WorkerId,
    client: Option<ClientId>,
    state: DriverState,
    stopped: bool,
    /// StopAll arrived before output began; applied on `mark_running`.
    stop_pending: bool,
    request_seq: Option<u16>,
    created: Instant,
    running_since: Option<Instant>,
    process_running: bool,
    ending: Option<Ending>,
    timers: HashMap<TimerKind, AbortHandle>,
}

impl TaskDriver {
    pub fn new(
        id: DriverId,
        task: TaskRecord,
        attempts: u32,
        worker: WorkerId,
        client: Option<ClientId>,
    ) -> Self {
        Self {
            id,
            task,
            attempts,
            worker,
            client,
            state: DriverState::Created,
            stopped: false,
            stop_pending: false,
            request_seq: None,
            created: Instant::now(),
            running_since: None,
            process_running: false,
            ending: None,
            timers: HashMap::new(),
        }
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    pub fn is_remote(&self) -> bool {
        self.client.is_some()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop_pending(&self) -> bool {
        self.stop_pending
    }

    /// Defer a stop or continue for a driver that is still starting.
    pub fn set_stop_pending(&mut self, pending: bool) -> Result<(), DriverError> {
        if self.state != DriverState::Starting {
            return Err(DriverError::InvalidTransition {
                from: self.state.as_str(),
                to: if pending { "stopped" } else { "resumed" },
            });
        }
        self.stop_pending = pending;
        Ok(())
    }

    pub fn ending(&self) -> Option<&Ending> {
        self.ending.as_ref()
    }

    /// Time since output started, or since creation if it never did.
    pub fn render_time(&self) -> Duration {
        self.running_since.unwrap_or(self.created).elapsed()
    }

    fn transition(&mut self, to: DriverState, allowed: bool) -> Result<(), DriverError> {
        if !allowed {
            return Err(DriverError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        tracing::trace!(driver = %self.id, from = self.state.as_str(), to = to.as_str(), "Driver transition");
        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), DriverError> {
        let allowed = self.state == DriverState::Created;
        self.transition(DriverState::Starting, allowed)
    }

    pub fn mark_running(&mut self) -> Result<(), DriverError> {
        let allowed = self.state == DriverState::Starting;
        self.transition(DriverState::Running, allowed)?;
        self.running_since = Some(Instant::now());
        self.stop_pending = false;
        Ok(())
    }

    pub fn set_stopped(&mut self, stopped: bool) -> Result<(), DriverError> {
        if self.state != DriverState::Running {
            return Err(DriverError::InvalidTransition {
                from: self.state.as_str(),
                to: if stopped { "stopped" } else { "resumed" },
            });
        }
        self.stopped = stopped;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(), DriverError> {
        let allowed = self.state.is_active();
        self.transition(DriverState::Finished, allowed)?;
        self.stopped = false;
        self.cancel_timers_except(None);
        Ok(())
    }

    pub fn fail(&mut self, kind: ErrorKind) -> Result<(), DriverError> {
        let allowed = !self.state.is_terminal();
        self.transition(DriverState::Failed(kind), allowed)?;
        self.stopped = false;
        // Escalation must survive the failure of a task still being reaped.
        self.cancel_timers_except(Some(TimerKind::KillGrace));
        Ok(())
    }

    /// Record that the farm asked the task to end, and why.
    pub fn request_end(&mut self, kind: ErrorKind, detail: impl Into<String>) {
        if self.ending.is_none() {
            self.ending = Some(Ending {
                kind,
                detail: detail.into(),
            });
        }
    }

    pub fn set_process_running(&mut self, running: bool) {
        self.process_running = running;
    }

    /// A local child has been started and not yet reaped.
    pub fn awaiting_exit(&self) -> bool {
        self.process_running
    }

    pub fn request_seq(&self) -> Option<u16> {
        self.request_seq
    }

    pub fn set_request_seq(&mut self, seq_no: u16) {
        self.request_seq = Some(seq_no);
    }

    /// Task replies must acknowledge the TaskRequest or something later.
    pub fn check_ack(&self, ack_no: u16) -> Result<(), DriverError> {
        let request_seq = self.request_seq.ok_or(DriverError::NotDispatched)?;
        if seq_at_or_after(ack_no, request_seq) {
            Ok(())
        } else {
            Err(DriverError::StaleAck {
                ack_no,
                request_seq,
            })
        }
    }

    /// Deliver `Event::TimerFired` after `delay`, replacing any timer of the same kind.
    pub fn arm(&mut self, timer: TimerKind, delay: Duration, events: &EventSender) {
        let driver = self.id;
        let events = events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::TimerFired { driver, timer });
        });
        if let Some(old) = self.timers.insert(timer, handle.abort_handle()) {
            old.abort();
        }
    }

    pub fn disarm(&mut self, timer: TimerKind) {
        if let Some(handle) = self.timers.remove(&timer) {
            handle.abort();
        }
    }

    pub fn is_armed(&self, timer: TimerKind) -> bool {
        self.timers.contains_key(&timer)
    }

    fn cancel_timers_except(&mut self, keep: Option<TimerKind>) {
        self.timers.retain(|kind, handle| {
            if Some(*kind) == keep {
                return true;
            }
            handle.abort();
            false
        });
    }

    fn disarm_all(&mut self) {
        self.cancel_timers_except(None);
    }
}

impl Drop for TaskDriver {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
