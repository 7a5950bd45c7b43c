use std::path::PathBuf;
use std::sync::Arc;

use super::{Started, WorkerError, WorkerHandle, WorkerId, WorkerKind, WorkerStatus};
use crate::config::RendererConfig;
use crate::driver::DriverId;
use crate::orchestrator::{Event, EventSender};
use crate::process::{ProcessSpec, Spawner, SupervisedProcess, TaskSignal};
use crate::task::TaskRecord;

/// Shared by every local worker of a farm.
#[derive(Clone)]
pub struct LocalWorkerContext {
    pub events: EventSender,
    pub spawner: Arc<dyn Spawner>,
    pub renderer: Option<RendererConfig>,
    /// Renders run here; task input files are relative to it.
    pub input_dir: PathBuf,
}

/// One child process per started task. Exit arrives as `Event::ProcessExited`.
pub struct LocalWorker {
    id: WorkerId,
    ctx: LocalWorkerContext,
    bound: Option<DriverId>,
    process: Option<SupervisedProcess>,
    gone: bool,
}

impl LocalWorker {
    pub fn new(id: WorkerId, ctx: LocalWorkerContext) -> Self {
        Self {
            id,
            ctx,
            bound: None,
            process: None,
            gone: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }
}

impl WorkerHandle for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Local
    }

    fn describe(&self) -> String {
        format!("local#{}", self.id.0)
    }

    fn start(&mut self, driver: DriverId, task: &TaskRecord) -> Result<Started, WorkerError> {
        if self.gone {
            return Err(WorkerError::Gone);
        }
        if let Some(current) = self.bound {
            return Err(WorkerError::Busy(current));
        }
        let renderer = self.ctx.renderer.as_ref().ok_or(WorkerError::NoRenderer)?;
        let spec = ProcessSpec::render(renderer, &task.to_request()).with_cwd(&self.ctx.input_dir);

        let events = self.ctx.events.clone();
        let spawned = SupervisedProcess::spawn(self.ctx.spawner.as_ref(), &spec, move |outcome| {
            let _ = events.send(Event::ProcessExited { driver, outcome });
        });

        match spawned {
            Ok(process) => {
                tracing::debug!(worker = %self.id, %driver, pid = process.pid(), "Local render started");
                self.process = Some(process);
                self.bound = Some(driver);
                Ok(Started::Running)
            }
            Err(e) => {
                // A worker whose exec failed is not reused.
                self.gone = true;
                Err(e.into())
            }
        }
    }

    fn signal(&mut self, signal: TaskSignal) -> Result<(), WorkerError> {
        let process = self.process.as_ref().ok_or(WorkerError::NotBound)?;
        process.signal(signal).map_err(WorkerError::Signal)?;
        if signal == TaskSignal::Terminate {
            // A stopped process only sees SIGTERM once continued.
            process
                .signal(TaskSignal::Continue)
                .map_err(WorkerError::Signal)?;
        }
        Ok(())
    }

    fn kill(&mut self) {
        if let Some(process) = &self.process
            && let Err(e) = process.signal(TaskSignal::Kill)
        {
            tracing::warn!(worker = %self.id, error = %e, "Failed to kill renderer");
        }
    }

    fn query(&self) -> WorkerStatus {
        match (self.gone, self.bound) {
            (true, _) => WorkerStatus::Gone,
            (false, Some(driver)) => WorkerStatus::Busy(driver),
            (false, None) => WorkerStatus::Idle,
        }
    }

    fn release(&mut self) {
        self.bound = None;
        self.process = None;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::process::CommandSpawner;

    fn worker(script: &str) -> (LocalWorker, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = LocalWorkerContext {
            events: tx,
            spawner: Arc::new(CommandSpawner),
            renderer: Some(
                RendererConfig::new("/bin/sh").with_args(vec!["-c".into(), script.into()]),
            ),
            input_dir: std::env::temp_dir(),
        };
        (LocalWorker::new(WorkerId(1), ctx), rx)
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<Event>) -> (DriverId, crate::process::ExitOutcome) {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(Event::ProcessExited { driver, outcome })) => (driver, outcome),
            _ => panic!("expected ProcessExited"),
        }
    }

    #[tokio::test]
    async fn start_binds_and_reports_exit() {
        let (mut worker, mut rx) = worker("exit 0");
        let task = TaskRecord::new(1, 8, 8, "png");
        assert_eq!(worker.start(DriverId(5), &task).unwrap(), Started::Running);
        assert_eq!(worker.query(), WorkerStatus::Busy(DriverId(5)));
        assert!(worker.pid().is_some());

        let (driver, outcome) = next_exit(&mut rx).await;
        assert_eq!(driver, DriverId(5));
        assert!(outcome.success());

        worker.release();
        assert_eq!(worker.query(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn bound_worker_rejects_second_start() {
        let (mut worker, _rx) = worker("sleep 5");
        let task = TaskRecord::new(1, 8, 8, "png");
        worker.start(DriverId(1), &task).unwrap();
        assert!(matches!(
            worker.start(DriverId(2), &task),
            Err(WorkerError::Busy(DriverId(1)))
        ));
        worker.kill();
    }

    #[tokio::test]
    async fn terminate_reaches_stopped_process() {
        let (mut worker, mut rx) = worker("sleep 30");
        worker
            .start(DriverId(1), &TaskRecord::new(1, 8, 8, "png"))
            .unwrap();
        worker.signal(TaskSignal::Stop).unwrap();
        worker.signal(TaskSignal::Terminate).unwrap();
        let (_, outcome) = next_exit(&mut rx).await;
        assert_eq!(outcome.signal, Some(15));
    }

    #[tokio::test]
    async fn spawn_failure_marks_worker_gone() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = LocalWorkerContext {
            events: tx,
            spawner: Arc::new(CommandSpawner),
            renderer: Some(RendererConfig::new("/nonexistent/renderer")),
            input_dir: std::env::temp_dir(),
        };
        let mut worker = LocalWorker::new(WorkerId(2), ctx);
        let err = worker
            .start(DriverId(1), &TaskRecord::new(1, 8, 8, "png"))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
        assert_eq!(worker.query(), WorkerStatus::Gone);
    }
}
