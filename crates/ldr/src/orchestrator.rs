//! Farm event loop and its operator handle.
//!
//! One tokio task owns the [`Scheduler`]. Socket pumps, child-process
//! waiters and timers feed it [`Event`]s over one unbounded channel;
//! operators reach it through [`FarmControl`], whose requests arrive on a
//! second channel and are answered over oneshots.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::bridge::protocol::Frame;
use crate::config::FarmConfig;
use crate::driver::{DriverId, TimerKind};
use crate::error::{ErrorKind, FarmError};
use crate::listener;
use crate::process::{CommandSpawner, ExitOutcome, Spawner};
use crate::scheduler::{LocalFactory, Scheduler, SchedulerSettings, Thresholds, WorkerRegistry};
use crate::source::TaskSource;
use crate::status::FarmStatus;
use crate::task::{TaskId, TaskRecord};
use crate::worker::{ClientId, ClientLink, LocalWorker, LocalWorkerContext, WorkerHandle};

pub type EventSender = mpsc::UnboundedSender<Event>;

/// Everything the scheduler reacts to, other than operator requests.
#[derive(Debug)]
pub enum Event {
    /// A client passed the handshake; its pumps are running.
    ClientAuthenticated { link: ClientLink, njobs: u16 },
    ClientFrame { client: ClientId, frame: Frame },
    /// The writer pump is about to send a TaskRequest with `seq_no`.
    Dispatching {
        client: ClientId,
        frame_no: u32,
        seq_no: u16,
    },
    /// An input file could not be read for sending.
    FileFailed {
        client: ClientId,
        frame_no: u32,
        name: String,
        error: String,
    },
    ClientLost {
        client: ClientId,
        kind: ErrorKind,
        reason: String,
    },
    ProcessExited { driver: DriverId, outcome: ExitOutcome },
    TimerFired { driver: DriverId, timer: TimerKind },
    TerminateDeadline,
}

type Reply<T> = oneshot::Sender<T>;

pub enum ControlRequest {
    Enqueue {
        task: TaskRecord,
        reply: Reply<Result<TaskId, FarmError>>,
    },
    Cancel {
        id: TaskId,
        reply: Reply<Result<(), FarmError>>,
    },
    StopAll {
        reply: Reply<usize>,
    },
    ContinueAll {
        reply: Reply<usize>,
    },
    TerminateAll {
        reason: String,
        reply: Reply<usize>,
    },
    SetThresholds {
        thresholds: Thresholds,
        reply: Reply<Result<(), FarmError>>,
    },
    SetAccepting {
        accepting: bool,
        reply: Reply<()>,
    },
    ConnectClient {
        addr: String,
        reply: Reply<Result<(), FarmError>>,
    },
    Status {
        reply: Reply<FarmStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Shared by the listener, connect-out tasks and the event loop.
#[derive(Clone)]
pub struct FarmContext {
    pub events: EventSender,
    pub config: Arc<FarmConfig>,
    /// Server start time, milliseconds since the epoch.
    pub start_time: u64,
    accepting: Arc<AtomicBool>,
    next_client: Arc<AtomicU64>,
}

impl FarmContext {
    pub fn new(events: EventSender, config: Arc<FarmConfig>, start_time: u64) -> Self {
        Self {
            events,
            config,
            start_time,
            accepting: Arc::new(AtomicBool::new(true)),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn allocate_client_id(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::Relaxed))
    }
}

/// Operator-facing farm surface.
#[async_trait]
pub trait FarmControl: Send + Sync {
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, FarmError>;

    async fn cancel(&self, id: TaskId) -> Result<(), FarmError>;

    /// Returns the number of tasks signalled.
    async fn stop_all(&self) -> Result<usize, FarmError>;

    async fn continue_all(&self) -> Result<usize, FarmError>;

    /// Returns the number of tasks force-killed after the grace period.
    async fn terminate_all(&self, reason: String) -> Result<usize, FarmError>;

    async fn set_thresholds(&self, thresholds: Thresholds) -> Result<(), FarmError>;

    /// While false, new clients are refused with `NotAccepting`.
    async fn set_accepting(&self, accepting: bool) -> Result<(), FarmError>;

    /// Connect out to a render client listening at `addr`.
    async fn connect_client(&self, addr: String) -> Result<(), FarmError>;

    async fn status(&self) -> Result<FarmStatus, FarmError>;
}

/// Handle on a running farm. Dropping it stops the farm.
pub struct FarmHandle {
    control: mpsc::UnboundedSender<ControlRequest>,
    local_addr: Option<SocketAddr>,
    listener: Option<AbortHandle>,
}

impl FarmHandle {
    /// Address the LDR listener is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn request<T, F>(&self, make: F) -> Result<T, FarmError>
    where
        T: Send,
        F: FnOnce(Reply<T>) -> ControlRequest + Send,
    {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .map_err(|_| FarmError::ChannelClosed)?;
        rx.await.map_err(|_| FarmError::ChannelClosed)
    }

    /// Stop accepting connections, kill everything still running and wait
    /// for the event loop to exit.
    pub async fn shutdown(&self) -> Result<(), FarmError> {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        self.request(|reply| ControlRequest::Shutdown { reply })
            .await
    }
}

impl Drop for FarmHandle {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}

#[async_trait]
impl FarmControl for FarmHandle {
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, FarmError> {
        self.request(|reply| ControlRequest::Enqueue { task, reply })
            .await?
    }

    async fn cancel(&self, id: TaskId) -> Result<(), FarmError> {
        self.request(|reply| ControlRequest::Cancel { id, reply })
            .await?
    }

    async fn stop_all(&self) -> Result<usize, FarmError> {
        self.request(|reply| ControlRequest::StopAll { reply }).await
    }

    async fn continue_all(&self) -> Result<usize, FarmError> {
        self.request(|reply| ControlRequest::ContinueAll { reply })
            .await
    }

    async fn terminate_all(&self, reason: String) -> Result<usize, FarmError> {
        self.request(|reply| ControlRequest::TerminateAll { reason, reply })
            .await
    }

    async fn set_thresholds(&self, thresholds: Thresholds) -> Result<(), FarmError> {
        self.request(|reply| ControlRequest::SetThresholds { thresholds, reply })
            .await?
    }

    async fn set_accepting(&self, accepting: bool) -> Result<(), FarmError> {
        self.request(|reply| ControlRequest::SetAccepting { accepting, reply })
            .await
    }

    async fn connect_client(&self, addr: String) -> Result<(), FarmError> {
        self.request(|reply| ControlRequest::ConnectClient { addr, reply })
            .await?
    }

    async fn status(&self) -> Result<FarmStatus, FarmError> {
        self.request(|reply| ControlRequest::Status { reply }).await
    }
}

/// Start a farm with the default process spawner.
pub async fn spawn_farm(
    config: FarmConfig,
    source: impl TaskSource,
) -> Result<FarmHandle, FarmError> {
    spawn_farm_with(config, source, Arc::new(CommandSpawner)).await
}

/// Start a farm: bind the listener, start the event loop and connect out to
/// configured clients.
pub async fn spawn_farm_with(
    config: FarmConfig,
    source: impl TaskSource,
    spawner: Arc<dyn Spawner>,
) -> Result<FarmHandle, FarmError> {
    config.validate()?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let start_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let config = Arc::new(config);
    let ctx = FarmContext::new(events_tx.clone(), config.clone(), start_time);

    let listener = match config.listen {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };
    let local_addr = listener.as_ref().map(|l| l.local_addr()).transpose()?;

    let factory: Option<LocalFactory> = config.local_enabled().then(|| {
        let local = LocalWorkerContext {
            events: events_tx.clone(),
            spawner,
            renderer: config.renderer.clone(),
            input_dir: config.input_dir.clone(),
        };
        Box::new(move |id| Box::new(LocalWorker::new(id, local.clone())) as Box<dyn WorkerHandle>)
            as LocalFactory
    });
    let registry = WorkerRegistry::new(factory, config.local_workers);
    let scheduler = Scheduler::new(
        Box::new(source),
        config.thresholds,
        registry,
        SchedulerSettings::from_config(&config, start_time),
        events_tx,
    );

    tracing::info!(
        listen = ?local_addr,
        low = config.thresholds.low,
        high = config.thresholds.high,
        local = config.local_enabled(),
        "Starting farm"
    );
    tokio::spawn(run_event_loop(scheduler, control_rx, events_rx, ctx.clone()));

    let listener = listener.map(|l| tokio::spawn(listener::accept_loop(l, ctx.clone())).abort_handle());
    for addr in &config.connect {
        listener::spawn_connect(addr.clone(), ctx.clone());
    }

    Ok(FarmHandle {
        control: control_tx,
        local_addr,
        listener,
    })
}

async fn run_event_loop(
    mut scheduler: Scheduler,
    mut control: mpsc::UnboundedReceiver<ControlRequest>,
    mut events: mpsc::UnboundedReceiver<Event>,
    ctx: FarmContext,
) {
    scheduler.schedule();
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => scheduler.handle(event),
            request = control.recv() => match request {
                Some(ControlRequest::Shutdown { reply }) => {
                    scheduler.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Some(request) => handle_control(&mut scheduler, request, &ctx),
                None => {
                    tracing::debug!("All farm handles dropped");
                    scheduler.shutdown();
                    break;
                }
            },
        }
        scheduler.schedule();
    }
    tracing::info!("Farm event loop exiting");
}

fn handle_control(scheduler: &mut Scheduler, request: ControlRequest, ctx: &FarmContext) {
    match request {
        ControlRequest::Enqueue { task, reply } => {
            let _ = reply.send(scheduler.enqueue(task));
        }
        ControlRequest::Cancel { id, reply } => {
            let _ = reply.send(scheduler.cancel(id));
        }
        ControlRequest::StopAll { reply } => {
            let _ = reply.send(scheduler.stop_all());
        }
        ControlRequest::ContinueAll { reply } => {
            let _ = reply.send(scheduler.continue_all());
        }
        ControlRequest::TerminateAll { reason, reply } => {
            scheduler.terminate_all(&reason, reply);
        }
        ControlRequest::SetThresholds { thresholds, reply } => {
            let _ = reply.send(scheduler.set_thresholds(thresholds));
        }
        ControlRequest::SetAccepting { accepting, reply } => {
            tracing::info!(accepting, "Client admission changed");
            ctx.set_accepting(accepting);
            let _ = reply.send(());
        }
        ControlRequest::ConnectClient { addr, reply } => {
            let result = if ctx.config.password.is_none() {
                Err(FarmError::MissingPassword)
            } else {
                listener::spawn_connect(addr, ctx.clone());
                Ok(())
            };
            let _ = reply.send(result);
        }
        ControlRequest::Status { reply } => {
            let _ = reply.send(scheduler.status(ctx.is_accepting()));
        }
        ControlRequest::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RendererConfig;
    use crate::source::{Outcome, QueueSource};

    fn sh(script: &str) -> RendererConfig {
        RendererConfig::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    fn local_config(script: &str) -> FarmConfig {
        FarmConfig::new()
            .with_listen(None)
            .with_renderer(sh(script))
            .with_input_dir(std::env::temp_dir())
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn renders_source_tasks_locally() {
        let source = QueueSource::with_tasks([
            TaskRecord::new(1, 8, 8, "png"),
            TaskRecord::new(2, 8, 8, "png"),
        ]);
        let outcomes = source.outcomes();
        let farm = spawn_farm(local_config("test \"$LDR_FRAME\" -gt 0"), source)
            .await
            .unwrap();

        wait_for(|| outcomes.len() == 2).await;
        assert!(outcomes.snapshot().iter().all(Outcome::is_done));
        let status = farm.status().await.unwrap();
        assert_eq!(status.completed, 2);
        assert_eq!(status.active, 0);
        farm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_and_cancel_over_handle() {
        let source = QueueSource::new();
        let outcomes = source.outcomes();
        let farm = spawn_farm(local_config("sleep 30"), source).await.unwrap();

        let id = farm.enqueue(TaskRecord::new(1, 8, 8, "png")).await.unwrap();
        let status = farm.status().await.unwrap();
        assert_eq!(status.active, 1);

        farm.cancel(id).await.unwrap();
        wait_for(|| outcomes.len() == 1).await;
        match &outcomes.snapshot()[0] {
            Outcome::Failed { failure, .. } => {
                assert_eq!(failure.kind, ErrorKind::Cancelled);
                assert_eq!(failure.exit.unwrap().signal, Some(15));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            farm.cancel(id).await,
            Err(FarmError::UnknownTask(_))
        ));
        farm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_all_reports_force_killed() {
        let config = local_config("trap '' TERM; sleep 30")
            .with_terminate_grace(Duration::from_millis(200))
            .with_kill_grace(Duration::from_secs(30));
        let farm = spawn_farm(config, QueueSource::new()).await.unwrap();
        farm.enqueue(TaskRecord::new(1, 8, 8, "png")).await.unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let killed = farm.terminate_all("test".to_string()).await.unwrap();
        assert_eq!(killed, 1);
        assert!(matches!(
            farm.enqueue(TaskRecord::new(2, 8, 8, "png")).await,
            Err(FarmError::Terminating)
        ));
        farm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_thresholds_rejected() {
        let farm = spawn_farm(local_config("true"), QueueSource::new())
            .await
            .unwrap();
        assert!(matches!(
            farm.set_thresholds(Thresholds { low: 5, high: 1 }).await,
            Err(FarmError::Config(_))
        ));
        farm.set_thresholds(Thresholds { low: 1, high: 8 })
            .await
            .unwrap();
        assert_eq!(farm.status().await.unwrap().thresholds.high, 8);
        farm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn connect_without_password_rejected() {
        let farm = spawn_farm(local_config("true"), QueueSource::new())
            .await
            .unwrap();
        assert!(matches!(
            farm.connect_client("127.0.0.1:1".to_string()).await,
            Err(FarmError::MissingPassword)
        ));
        farm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handle_fails_after_shutdown() {
        let farm = spawn_farm(local_config("true"), QueueSource::new())
            .await
            .unwrap();
        farm.shutdown().await.unwrap();
        assert!(matches!(
            farm.status().await,
            Err(FarmError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn listener_requires_password() {
        let config = FarmConfig::new().with_listen(Some("127.0.0.1:0".parse().unwrap()));
        assert!(matches!(
            spawn_farm(config, QueueSource::new()).await,
            Err(FarmError::Config(_))
        ));
    }
}
