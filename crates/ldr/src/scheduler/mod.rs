//! Driver Interface: the only owner of the pending queue, the worker
//! registry and the set of task drivers.
//!
//! Every method runs on the farm event loop, so queue and registry mutation
//! is serialized by construction. Admission is re-evaluated by calling
//! [`Scheduler::schedule`] after each handled event; it never blocks.

mod admission;
mod queue;
mod registry;

pub use admission::{Admission, Thresholds};
pub use queue::{PendingQueue, PendingTask};
pub use registry::{ClientEntry, LocalFactory, WorkerRegistry};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::bridge::protocol::{DoneOutcome, Frame, Message, TaskDone, TaskStateKind, seq_at_or_after};
use crate::config::FarmConfig;
use crate::driver::{DriverId, DriverState, TaskDriver, TimerKind};
use crate::error::{ErrorKind, FarmError};
use crate::orchestrator::{Event, EventSender};
use crate::process::{ExitOutcome, TaskSignal};
use crate::source::TaskSource;
use crate::status::{ClientStatus, DriverStatus, FarmHealth, FarmStatus, format_start_time};
use crate::task::{TaskFailure, TaskId, TaskRecord, TaskResult};
use crate::version::VersionInfo;
use crate::worker::{ClientId, ClientLink, Outgoing, Started, WorkerError, WorkerId};

/// Fixed scheduler parameters, taken from the farm config.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_retries: u32,
    pub kill_grace: Duration,
    pub cancel_grace: Duration,
    pub terminate_grace: Duration,
    pub input_dir: PathBuf,
    pub start_time: u64,
    pub version: VersionInfo,
}

impl SchedulerSettings {
    pub fn from_config(config: &FarmConfig, start_time: u64) -> Self {
        let mut version = VersionInfo::new();
        if let Some(renderer) = &config.renderer {
            version = version.with_renderer(renderer.program.to_string_lossy());
        }
        Self {
            max_retries: config.max_retries,
            kill_grace: config.kill_grace,
            cancel_grace: config.cancel_grace,
            terminate_grace: config.terminate_grace,
            input_dir: config.input_dir.clone(),
            start_time,
            version,
        }
    }
}

struct Termination {
    reply: oneshot::Sender<usize>,
    deadline: AbortHandle,
}

pub struct Scheduler {
    source: Box<dyn TaskSource>,
    queue: PendingQueue,
    admission: Admission,
    registry: WorkerRegistry,
    drivers: BTreeMap<DriverId, TaskDriver>,
    events: EventSender,
    settings: SchedulerSettings,
    next_driver: u64,
    draining: bool,
    termination: Option<Termination>,
    completed: u64,
    failed: u64,
}

impl Scheduler {
    pub fn new(
        source: Box<dyn TaskSource>,
        thresholds: Thresholds,
        registry: WorkerRegistry,
        settings: SchedulerSettings,
        events: EventSender,
    ) -> Self {
        Self {
            source,
            queue: PendingQueue::new(),
            admission: Admission::new(thresholds),
            registry,
            drivers: BTreeMap::new(),
            events,
            settings,
            next_driver: 1,
            draining: false,
            termination: None,
            completed: 0,
            failed: 0,
        }
    }

    /// Drivers counted against the thresholds.
    pub fn active(&self) -> usize {
        self.drivers
            .values()
            .filter(|d| d.state().is_active())
            .count()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::ClientAuthenticated { link, njobs } => self.add_client(link, njobs),
            Event::ClientFrame { client, frame } => self.client_frame(client, frame),
            Event::Dispatching {
                client,
                frame_no,
                seq_no,
            } => self.dispatching(client, frame_no, seq_no),
            Event::FileFailed {
                client,
                frame_no,
                name,
                error,
            } => self.file_failed(client, frame_no, &name, &error),
            Event::ClientLost {
                client,
                kind,
                reason,
            } => self.drop_client(client, kind, &reason),
            Event::ProcessExited { driver, outcome } => self.process_exited(driver, outcome),
            Event::TimerFired { driver, timer } => self.timer_fired(driver, timer),
            Event::TerminateDeadline => self.terminate_deadline(),
        }
    }

    // ---- admission ----

    /// Start tasks until admission closes or nothing can be placed.
    pub fn schedule(&mut self) {
        if self.draining {
            return;
        }
        while self.admission.may_admit(self.active()) {
            let Some((pending, worker)) = self.select_next_task() else {
                break;
            };
            self.start(pending, worker);
        }
    }

    /// First queued task some idle worker will take; the source is consulted
    /// only when nothing queued can be placed.
    fn select_next_task(&mut self) -> Option<(PendingTask, WorkerId)> {
        let mut placed = None;
        for (index, pending) in self.queue.iter().enumerate() {
            if let Some(worker) = self.registry.select_worker(&pending.task) {
                placed = Some((index, worker));
                break;
            }
        }
        if let Some((index, worker)) = placed {
            return self.queue.take(index).map(|pending| (pending, worker));
        }

        if !self.registry.has_idle_capacity() {
            return None;
        }
        let pending = PendingTask::new(self.source.next_task()?);
        match self.registry.select_worker(&pending.task) {
            Some(worker) => Some((pending, worker)),
            None => {
                self.queue.push(pending);
                None
            }
        }
    }

    fn start(&mut self, pending: PendingTask, worker_id: WorkerId) {
        let Some(worker) = self.registry.get_mut(worker_id) else {
            self.queue.push_front(pending);
            return;
        };
        let id = DriverId(self.next_driver);
        self.next_driver += 1;

        let client = worker.kind().client();
        let description = worker.describe();
        let mut driver = TaskDriver::new(id, pending.task, pending.attempts, worker_id, client);
        if let Err(e) = driver.begin() {
            tracing::error!(driver = %id, error = %e, "Fresh driver refused to start");
            return;
        }
        let started = worker.start(id, driver.task());

        let task = driver.task();
        tracing::info!(
            target: "ldr::task",
            task_id = %task.id,
            frame = task.frame_no,
            driver = %id,
            worker = %description,
            attempt = driver.attempts(),
            "Task started"
        );

        let failure = match started {
            Ok(Started::Running) => {
                if let Err(e) = driver.mark_running() {
                    tracing::warn!(driver = %id, error = %e, "Driver transition failed");
                }
                driver.set_process_running(true);
                None
            }
            Ok(Started::Dispatched) => {
                if let Some(client) = client {
                    self.registry.bind_frame(client, driver.task().frame_no, id);
                }
                None
            }
            Err(e @ (WorkerError::Spawn(_) | WorkerError::NoRenderer)) => {
                Some((ErrorKind::ProcessSpawnFailed, e.to_string()))
            }
            Err(e) => Some((ErrorKind::ConnectionLost, e.to_string())),
        };

        if failure.is_none()
            && let Some(timeout) = driver.task().timeout
        {
            driver.arm(TimerKind::Deadline, timeout, &self.events);
        }
        self.drivers.insert(id, driver);

        if let Some((kind, detail)) = failure {
            self.fail_driver(id, kind, detail, None);
        }
    }

    // ---- terminal transitions ----

    fn finish_driver(&mut self, id: DriverId, render_time: Option<Duration>) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if let Err(e) = driver.finish() {
            tracing::warn!(driver = %id, error = %e, "Ignoring completion");
            return;
        }
        let result = TaskResult {
            worker: self
                .registry
                .get(driver.worker())
                .map(|w| w.describe())
                .unwrap_or_else(|| driver.worker().to_string()),
            exit_code: 0,
            render_time: render_time.unwrap_or_else(|| driver.render_time()),
        };
        let task = driver.task().clone();
        let awaiting_exit = driver.awaiting_exit();

        self.completed += 1;
        tracing::info!(
            target: "ldr::task",
            task_id = %task.id,
            frame = task.frame_no,
            driver = %id,
            worker = %result.worker,
            render_ms = result.render_time.as_millis() as u64,
            "Task done"
        );
        self.source.on_task_done(&task, &result);

        if !awaiting_exit {
            self.release_driver(id);
        }
    }

    /// Fail a driver and apply the retry policy. The only place a task is
    /// re-enqueued. A driver the farm already asked to end fails with that
    /// reason instead, whatever ended it.
    fn fail_driver(
        &mut self,
        id: DriverId,
        kind: ErrorKind,
        detail: impl Into<String>,
        exit: Option<ExitOutcome>,
    ) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        if driver.state().is_terminal() {
            return;
        }
        let (kind, detail) = match driver.ending() {
            Some(ending) => (ending.kind, ending.detail.clone()),
            None => (kind, detail.into()),
        };
        if let Err(e) = driver.fail(kind) {
            tracing::warn!(driver = %id, error = %e, "Ignoring failure");
            return;
        }
        let task = driver.task().clone();
        let attempts = driver.attempts();
        let awaiting_exit = driver.awaiting_exit();

        let retryable = matches!(kind, ErrorKind::ConnectionLost | ErrorKind::ProtocolError);
        if !self.draining && kind == ErrorKind::TaskRefused {
            tracing::info!(
                target: "ldr::task",
                task_id = %task.id,
                frame = task.frame_no,
                driver = %id,
                %detail,
                "Task refused, re-enqueued"
            );
            self.queue.push_front(PendingTask { task, attempts });
        } else if !self.draining && retryable && attempts < self.settings.max_retries {
            tracing::warn!(
                target: "ldr::task",
                task_id = %task.id,
                frame = task.frame_no,
                driver = %id,
                %kind,
                %detail,
                retry = attempts + 1,
                "Task lost its worker, re-enqueued"
            );
            self.queue.push_front(PendingTask {
                task,
                attempts: attempts + 1,
            });
        } else {
            let mut failure = TaskFailure::new(&task, kind, detail);
            if let Some(exit) = exit {
                failure = failure.with_exit(exit);
            }
            self.report_failure(&task, &failure);
        }

        if !awaiting_exit {
            self.release_driver(id);
        }
    }

    fn report_failure(&mut self, task: &TaskRecord, failure: &TaskFailure) {
        self.failed += 1;
        tracing::warn!(
            target: "ldr::task",
            task_id = %task.id,
            frame = task.frame_no,
            kind = %failure.kind,
            %failure,
            "Task failed"
        );
        self.source.on_task_failed(task, failure);
    }

    /// Drop a terminal driver and hand its worker back.
    fn release_driver(&mut self, id: DriverId) {
        let Some(driver) = self.drivers.remove(&id) else {
            return;
        };
        if let Some(client) = driver.client() {
            self.registry
                .unbind_frame(client, driver.task().frame_no, id);
        }
        self.registry.release(driver.worker());
        tracing::debug!(driver = %id, worker = %driver.worker(), "Worker released");

        if self.drivers.is_empty()
            && let Some(termination) = self.termination.take()
        {
            termination.deadline.abort();
            tracing::info!("All tasks terminated within the grace period");
            let _ = termination.reply.send(0);
        }
    }

    fn signal_driver(&mut self, id: DriverId, signal: TaskSignal) -> bool {
        let Some(driver) = self.drivers.get(&id) else {
            return false;
        };
        let worker = driver.worker();
        let Some(handle) = self.registry.get_mut(worker) else {
            return false;
        };
        match handle.signal(signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(driver = %id, %worker, ?signal, error = %e, "Failed to signal task");
                false
            }
        }
    }

    /// Ask an active task to end: terminate and escalate locally, cancel and
    /// wait remotely.
    fn end_driver(&mut self, id: DriverId, kind: ErrorKind, detail: &str) -> bool {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return false;
        };
        if driver.state().is_terminal() {
            return false;
        }
        driver.request_end(kind, detail);
        let remote = driver.is_remote();

        self.signal_driver(id, TaskSignal::Terminate);
        let (timer, grace) = if remote {
            (TimerKind::CancelGrace, self.settings.cancel_grace)
        } else {
            (TimerKind::KillGrace, self.settings.kill_grace)
        };
        if let Some(driver) = self.drivers.get_mut(&id) {
            driver.arm(timer, grace, &self.events);
        }
        true
    }

    // ---- local events ----

    fn process_exited(&mut self, id: DriverId, outcome: ExitOutcome) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            tracing::debug!(driver = %id, %outcome, "Exit for unknown driver");
            return;
        };
        driver.set_process_running(false);
        tracing::debug!(driver = %id, %outcome, "Renderer exited");

        if driver.state().is_terminal() {
            self.release_driver(id);
        } else if outcome.success() {
            self.finish_driver(id, None);
        } else {
            self.fail_driver(id, ErrorKind::RenderFailed, format!("renderer {outcome}"), Some(outcome));
        }
    }

    fn timer_fired(&mut self, id: DriverId, timer: TimerKind) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        driver.disarm(timer);
        let client = driver.client();
        let timeout = driver.task().timeout.unwrap_or_default();

        match (timer, client) {
            (TimerKind::Deadline, None) => {
                self.fail_driver(
                    id,
                    ErrorKind::Timeout,
                    format!("exceeded timeout of {timeout:?}"),
                    None,
                );
                self.signal_driver(id, TaskSignal::Terminate);
                if let Some(driver) = self.drivers.get_mut(&id) {
                    driver.arm(TimerKind::KillGrace, self.settings.kill_grace, &self.events);
                }
            }
            (TimerKind::Deadline, Some(client)) => {
                self.fail_driver(
                    id,
                    ErrorKind::Timeout,
                    format!("exceeded timeout of {timeout:?}"),
                    None,
                );
                self.drop_client(client, ErrorKind::Timeout, "task timed out on client");
            }
            (TimerKind::KillGrace, _) => {
                tracing::warn!(driver = %id, "Renderer ignored SIGTERM, killing");
                if let Some(driver) = self.drivers.get(&id)
                    && let Some(worker) = self.registry.get_mut(driver.worker())
                {
                    worker.kill();
                }
            }
            (TimerKind::CancelGrace, Some(client)) => {
                self.fail_driver(
                    id,
                    ErrorKind::Cancelled,
                    "client did not acknowledge cancel",
                    None,
                );
                self.drop_client(client, ErrorKind::Timeout, "cancel not acknowledged");
            }
            (TimerKind::CancelGrace, None) => {}
        }
    }

    // ---- remote events ----

    fn add_client(&mut self, link: ClientLink, njobs: u16) {
        if self.draining {
            tracing::info!(client = %link.id(), peer = link.peer(), "Farm draining, dropping new client");
            link.disconnect();
            return;
        }
        tracing::info!(client = %link.id(), peer = link.peer(), njobs, "Client authenticated");
        self.registry.add_client(link, njobs);
    }

    /// Remove a client; every task bound to it becomes ConnectionLost.
    fn drop_client(&mut self, client: ClientId, kind: ErrorKind, reason: &str) {
        let Some(entry) = self.registry.remove_client(client) else {
            return;
        };
        entry.link.disconnect();
        tracing::warn!(%client, peer = entry.link.peer(), %kind, reason, "Client dropped");

        let bound: Vec<DriverId> = self
            .drivers
            .values()
            .filter(|d| d.client() == Some(client))
            .map(|d| d.id())
            .collect();
        for id in bound {
            self.fail_driver(id, ErrorKind::ConnectionLost, reason, None);
        }
    }

    fn dispatching(&mut self, client: ClientId, frame_no: u32, seq_no: u16) {
        if let Some(id) = self.registry.driver_for_frame(client, frame_no)
            && let Some(driver) = self.drivers.get_mut(&id)
        {
            driver.set_request_seq(seq_no);
        }
    }

    /// Driver for a task reply, after the acknowledgement check. `last`
    /// marks the final reply for a request (TaskDone or TaskRefused).
    fn reply_driver(
        &mut self,
        client: ClientId,
        frame_no: u32,
        ack_no: u16,
        last: bool,
    ) -> Option<DriverId> {
        let abandoned = if last {
            self.registry.forget_abandoned(client, frame_no)
        } else {
            self.registry.abandoned(client, frame_no)
        };
        let Some(id) = self.registry.driver_for_frame(client, frame_no) else {
            tracing::debug!(%client, frame = frame_no, "Reply for a frame not in flight, ignored");
            return None;
        };
        let driver = self.drivers.get(&id)?;
        if let Err(e) = driver.check_ack(ack_no) {
            if abandoned.is_some_and(|seq| seq_at_or_after(ack_no, seq)) {
                tracing::debug!(%client, frame = frame_no, ack_no, "Late reply to an abandoned request, ignored");
                return None;
            }
            self.drop_client(client, ErrorKind::ProtocolError, &e.to_string());
            return None;
        }
        Some(id)
    }

    fn client_frame(&mut self, client: ClientId, frame: Frame) {
        let ack_no = frame.ack_no;
        match frame.message {
            Message::TaskRefused { frame_no, reason } => {
                let Some(id) = self.reply_driver(client, frame_no, ack_no, true) else {
                    return;
                };
                if let Some(driver) = self.drivers.get(&id) {
                    self.registry.decline(client, driver.task().id);
                }
                self.fail_driver(id, ErrorKind::TaskRefused, format!("client refused: {reason:?}"), None);
            }
            Message::FileRequest { frame_no, files } => {
                let Some(id) = self.reply_driver(client, frame_no, ack_no, false) else {
                    return;
                };
                self.send_files(client, id, frame_no, files);
            }
            Message::TaskState { frame_no, state } => {
                let Some(id) = self.reply_driver(client, frame_no, ack_no, false) else {
                    return;
                };
                self.task_state(id, state);
            }
            Message::TaskDone(done) => {
                let Some(id) = self.reply_driver(client, done.frame_no, ack_no, true) else {
                    return;
                };
                self.registry.clear_declines(client);
                self.task_done(id, &done);
            }
            Message::EndOfStream => {
                self.drop_client(client, ErrorKind::ConnectionLost, "client closed the connection");
            }
            other => {
                let reason = format!("unexpected {:?} from client", other.command());
                self.drop_client(client, ErrorKind::ProtocolError, &reason);
            }
        }
    }

    fn send_files(&mut self, client: ClientId, id: DriverId, frame_no: u32, files: Vec<String>) {
        let Some(driver) = self.drivers.get(&id) else {
            return;
        };
        if driver.state() != DriverState::Starting {
            let reason = format!("file request for frame {frame_no} after rendering began");
            self.drop_client(client, ErrorKind::ProtocolError, &reason);
            return;
        }
        if let Some(name) = files.iter().find(|name| !driver.task().has_file(name)) {
            let reason = format!("file {name:?} is not in the manifest of frame {frame_no}");
            self.drop_client(client, ErrorKind::ProtocolError, &reason);
            return;
        }
        let Some(link) = self.registry.client(client).map(|entry| entry.link.clone()) else {
            return;
        };
        for name in files {
            let path = self.settings.input_dir.join(&name);
            tracing::debug!(%client, frame = frame_no, file = %name, "Sending input file");
            if link
                .send(Outgoing::File {
                    frame_no,
                    name,
                    path,
                })
                .is_err()
            {
                break;
            }
        }
    }

    fn task_state(&mut self, id: DriverId, state: TaskStateKind) {
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        let result = match state {
            TaskStateKind::Rendering if driver.state() == DriverState::Starting => {
                let stop = driver.stop_pending();
                let result = driver.mark_running();
                if stop && result.is_ok() && self.signal_driver(id, TaskSignal::Stop) {
                    tracing::debug!(driver = %id, "Applying deferred stop");
                    if let Some(driver) = self.drivers.get_mut(&id) {
                        let _ = driver.set_stopped(true);
                    }
                }
                result
            }
            TaskStateKind::Rendering => Ok(()),
            TaskStateKind::Stopped => driver.set_stopped(true),
            TaskStateKind::Resumed => driver.set_stopped(false),
        };
        if let Err(e) = result {
            tracing::debug!(driver = %id, ?state, error = %e, "Ignoring task state");
        }
    }

    fn task_done(&mut self, id: DriverId, done: &TaskDone) {
        let render_time = Duration::from_millis(done.render_ms);
        match remote_failure(done) {
            None => self.finish_driver(id, Some(render_time)),
            Some((kind, detail, exit)) => self.fail_driver(id, kind, detail, exit),
        }
    }

    fn file_failed(&mut self, client: ClientId, frame_no: u32, name: &str, error: &str) {
        let Some(id) = self.registry.driver_for_frame(client, frame_no) else {
            return;
        };
        if let Some(seq) = self.drivers.get(&id).and_then(|d| d.request_seq()) {
            self.registry.abandon(client, frame_no, seq);
        }
        // The client is waiting on a file that will never come.
        self.signal_driver(id, TaskSignal::Terminate);
        self.fail_driver(
            id,
            ErrorKind::RenderFailed,
            format!("failed to send {name}: {error}"),
            None,
        );
    }

    // ---- operator controls ----

    pub fn enqueue(&mut self, task: TaskRecord) -> Result<TaskId, FarmError> {
        if self.draining {
            return Err(FarmError::Terminating);
        }
        let id = task.id;
        if self.queue.contains(id) || self.drivers.values().any(|d| d.task().id == id) {
            return Err(FarmError::DuplicateTask(id));
        }
        tracing::debug!(task_id = %id, frame = task.frame_no, "Task enqueued");
        self.queue.push(PendingTask::new(task));
        Ok(id)
    }

    pub fn cancel(&mut self, id: TaskId) -> Result<(), FarmError> {
        if let Some(pending) = self.queue.remove(id) {
            let failure = TaskFailure::new(&pending.task, ErrorKind::Cancelled, "cancelled while queued");
            self.report_failure(&pending.task, &failure);
            return Ok(());
        }
        let driver = self
            .drivers
            .values()
            .find(|d| d.task().id == id && !d.state().is_terminal())
            .map(|d| d.id())
            .ok_or(FarmError::UnknownTask(id))?;
        self.end_driver(driver, ErrorKind::Cancelled, "cancelled by operator");
        Ok(())
    }

    pub fn stop_all(&mut self) -> usize {
        self.signal_running(TaskSignal::Stop, false)
    }

    pub fn continue_all(&mut self) -> usize {
        self.signal_running(TaskSignal::Continue, true)
    }

    /// Signal every running driver whose stopped flag equals `stopped`.
    /// Drivers still starting take the request once they begin rendering.
    fn signal_running(&mut self, signal: TaskSignal, stopped: bool) -> usize {
        let mut deferred = 0;
        for driver in self.drivers.values_mut() {
            if driver.state() == DriverState::Starting
                && driver.stop_pending() == stopped
                && driver.set_stop_pending(!stopped).is_ok()
            {
                deferred += 1;
            }
        }
        let targets: Vec<DriverId> = self
            .drivers
            .values()
            .filter(|d| d.state() == DriverState::Running && d.is_stopped() == stopped)
            .map(|d| d.id())
            .collect();
        let mut count = 0;
        for id in targets {
            if self.signal_driver(id, signal) {
                if let Some(driver) = self.drivers.get_mut(&id) {
                    let _ = driver.set_stopped(!stopped);
                }
                count += 1;
            }
        }
        tracing::info!(?signal, count, deferred, "Signalled running tasks");
        count + deferred
    }

    /// Begin draining. `reply` receives the number of tasks force-killed,
    /// once everything ended or the grace period ran out.
    pub fn terminate_all(&mut self, reason: &str, reply: oneshot::Sender<usize>) {
        self.draining = true;
        tracing::info!(reason, active = self.drivers.len(), queued = self.queue.len(), "Terminating all tasks");

        let queued: Vec<PendingTask> = self.queue.drain().collect();
        for pending in queued {
            let failure = TaskFailure::new(&pending.task, ErrorKind::Cancelled, reason);
            self.report_failure(&pending.task, &failure);
        }

        let ids: Vec<DriverId> = self.drivers.keys().copied().collect();
        for id in ids {
            self.end_driver(id, ErrorKind::Cancelled, reason);
        }

        if self.drivers.is_empty() {
            let _ = reply.send(0);
            return;
        }
        let events = self.events.clone();
        let grace = self.settings.terminate_grace;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::TerminateDeadline);
        })
        .abort_handle();
        if let Some(previous) = self.termination.replace(Termination { reply, deadline }) {
            previous.deadline.abort();
            let _ = previous.reply.send(0);
        }
    }

    fn terminate_deadline(&mut self) {
        let Some(termination) = self.termination.take() else {
            return;
        };
        let mut killed = 0;
        let mut clients = BTreeSet::new();
        let ids: Vec<DriverId> = self.drivers.keys().copied().collect();
        for id in ids {
            let Some(driver) = self.drivers.get(&id) else {
                continue;
            };
            killed += 1;
            match driver.client() {
                Some(client) => {
                    clients.insert(client);
                }
                None => {
                    if let Some(worker) = self.registry.get_mut(driver.worker()) {
                        worker.kill();
                    }
                }
            }
            self.fail_driver(id, ErrorKind::Cancelled, "force-killed after terminate grace", None);
        }
        for client in clients {
            self.drop_client(client, ErrorKind::Cancelled, "terminate grace expired");
        }
        tracing::warn!(killed, "Terminate grace expired");
        let _ = termination.reply.send(killed);
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) -> Result<(), FarmError> {
        thresholds.validate()?;
        tracing::info!(low = thresholds.low, high = thresholds.high, "Thresholds changed");
        self.admission.set_thresholds(thresholds);
        Ok(())
    }

    pub fn status(&self, accepting: bool) -> FarmStatus {
        let health = if self.draining {
            FarmHealth::Draining
        } else if !self.admission.is_open() {
            FarmHealth::Saturated
        } else {
            FarmHealth::Ready
        };
        FarmStatus {
            version: self.settings.version.clone(),
            health,
            started_at: format_start_time(self.settings.start_time),
            accepting,
            thresholds: self.admission.thresholds(),
            queued: self.queue.len(),
            active: self.active(),
            completed: self.completed,
            failed: self.failed,
            clients: self
                .registry
                .clients()
                .map(|(id, entry)| ClientStatus {
                    id,
                    peer: entry.link.peer().to_string(),
                    njobs: entry.njobs,
                    busy: entry.busy(),
                })
                .collect(),
            drivers: self
                .drivers
                .values()
                .map(|d| DriverStatus {
                    id: d.id(),
                    task: d.task().id,
                    frame_no: d.task().frame_no,
                    worker: d.worker(),
                    state: d.state(),
                    stopped: d.is_stopped(),
                    attempts: d.attempts(),
                })
                .collect(),
        }
    }

    /// Kill every local renderer and disconnect every client.
    pub fn shutdown(&mut self) {
        tracing::info!(active = self.drivers.len(), "Scheduler shutting down");
        self.registry.kill_all();
        if let Some(termination) = self.termination.take() {
            termination.deadline.abort();
            let _ = termination.reply.send(self.drivers.len());
        }
        self.drivers.clear();
    }
}

/// Failure kind for a non-successful TaskDone, or None on success.
fn remote_failure(done: &TaskDone) -> Option<(ErrorKind, String, Option<ExitOutcome>)> {
    let failure = match done.outcome {
        DoneOutcome::Success => return None,
        DoneOutcome::ExitFailure => (
            ErrorKind::RenderFailed,
            format!("renderer exited with code {}", done.code),
            Some(ExitOutcome {
                code: Some(done.code),
                signal: None,
            }),
        ),
        DoneOutcome::Signalled => (
            ErrorKind::RenderFailed,
            format!("renderer killed by signal {}", done.code),
            Some(ExitOutcome {
                code: None,
                signal: Some(done.code),
            }),
        ),
        DoneOutcome::SpawnFailed => (
            ErrorKind::ProcessSpawnFailed,
            "client could not start the renderer".to_string(),
            None,
        ),
        DoneOutcome::Cancelled => (ErrorKind::Cancelled, "cancelled on client".to_string(), None),
        DoneOutcome::FileError => (
            ErrorKind::RenderFailed,
            "client could not store input files".to_string(),
            None,
        ),
    };
    Some(failure)
}
