//! Renderer child processes.
//!
//! A [`SupervisedProcess`] owns one spawned child. A waiter task reaps it and
//! hands the [`ExitOutcome`] to the owner's callback, which normally turns it
//! into an event for the scheduler.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::bridge::protocol::TaskRequest;
use crate::config::RendererConfig;

/// Control signals deliverable to a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    Stop,
    Continue,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (_, Some(sig)) => write!(f, "killed by signal {sig}"),
            (Some(code), None) => write!(f, "exited with code {code}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Renderer invocation for one frame: configured program and base
    /// arguments, then the task's own arguments.
    pub fn render(renderer: &RendererConfig, request: &TaskRequest) -> Self {
        let mut args = renderer.args.clone();
        args.extend(request.args.iter().cloned());
        Self {
            program: renderer.program.clone(),
            args,
            env: vec![
                ("LDR_FRAME".to_string(), request.frame_no.to_string()),
                ("LDR_WIDTH".to_string(), request.width.to_string()),
                ("LDR_HEIGHT".to_string(), request.height.to_string()),
                ("LDR_OFORMAT".to_string(), request.oformat.clone()),
            ],
            cwd: None,
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawned process has no pid")]
    NoPid,
}

/// Extension point for different spawn strategies.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &ProcessSpec) -> Result<Child, SpawnError>;
}

/// Plain `tokio::process::Command` spawner.
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, spec: &ProcessSpec) -> Result<Child, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        Ok(command.spawn()?)
    }
}

/// A spawned child plus the task that reaps it.
pub struct SupervisedProcess {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl SupervisedProcess {
    pub fn spawn<F>(spawner: &dyn Spawner, spec: &ProcessSpec, on_exit: F) -> Result<Self, SpawnError>
    where
        F: FnOnce(ExitOutcome) + Send + 'static,
    {
        let mut child = spawner.spawn(spec)?;
        let pid = child.id().ok_or(SpawnError::NoPid)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        tracing::debug!(pid, program = %spec.program.display(), "Spawned renderer");

        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    tracing::error!(pid, error = %e, "Failed to wait for renderer");
                    ExitOutcome::default()
                }
            };
            exited_flag.store(true, Ordering::Release);
            tracing::debug!(pid, %outcome, "Renderer exited");
            on_exit(outcome);
        });

        Ok(Self { pid, exited })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Deliver `signal`. No-op once the child has been reaped.
    pub fn signal(&self, signal: TaskSignal) -> std::io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        send_signal(self.pid, signal)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TaskSignal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        TaskSignal::Stop => Signal::SIGSTOP,
        TaskSignal::Continue => Signal::SIGCONT,
        TaskSignal::Terminate => Signal::SIGTERM,
        TaskSignal::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: TaskSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{signal:?} is not supported on this platform"),
    ))
}

async fn forward_output<R>(pipe: R, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "ldr::renderer", pid, stream, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, stream, error = %e, "Renderer output stream error");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").with_args(["-c", script])
    }

    fn spawn(spec: &ProcessSpec) -> (SupervisedProcess, oneshot::Receiver<ExitOutcome>) {
        let (tx, rx) = oneshot::channel();
        let process = SupervisedProcess::spawn(&CommandSpawner, spec, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
        (process, rx)
    }

    async fn wait(rx: oneshot::Receiver<ExitOutcome>) -> ExitOutcome {
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("process did not exit")
            .unwrap()
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let (_process, rx) = spawn(&sh("echo rendering; exit 3"));
        let outcome = wait(rx).await;
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.success());
        assert_eq!(outcome.to_string(), "exited with code 3");
    }

    #[tokio::test]
    async fn terminate_reports_signal() {
        let (process, rx) = spawn(&sh("sleep 30"));
        process.signal(TaskSignal::Terminate).unwrap();
        let outcome = wait(rx).await;
        assert_eq!(outcome.signal, Some(15));
        assert_eq!(outcome.code, None);
    }

    #[tokio::test]
    async fn stop_and_continue() {
        let (process, rx) = spawn(&sh("sleep 0.3"));
        process.signal(TaskSignal::Stop).unwrap();
        process.signal(TaskSignal::Continue).unwrap();
        assert!(wait(rx).await.success());
    }

    #[tokio::test]
    async fn signal_after_exit_is_noop() {
        let (process, rx) = spawn(&sh("exit 0"));
        wait(rx).await;
        assert!(process.has_exited());
        process.signal(TaskSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn render_spec_sets_environment() {
        let renderer = RendererConfig::new("/bin/sh").with_args(vec!["-c".to_string()]);
        let request = TaskRequest {
            frame_no: 7,
            width: 64,
            height: 48,
            oformat: "png".to_string(),
            files: Vec::new(),
            args: vec![
                r#"test "$LDR_FRAME:$LDR_WIDTH:$LDR_HEIGHT:$LDR_OFORMAT" = "7:64:48:png""#
                    .to_string(),
            ],
        };
        let spec = ProcessSpec::render(&renderer, &request);
        assert_eq!(spec.args.len(), 2);
        let (_process, rx) = spawn(&spec);
        assert!(wait(rx).await.success());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let result = SupervisedProcess::spawn(
            &CommandSpawner,
            &ProcessSpec::new("/nonexistent/renderer"),
            |_| {},
        );
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), b"x").unwrap();
        let (_process, rx) = spawn(&sh("test -f marker").with_cwd(dir.path()));
        assert!(wait(rx).await.success());
    }
}
