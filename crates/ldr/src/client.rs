//! Render client: the worker side of the LDR protocol.
//!
//! A client authenticates against one server at a time, then serves task
//! requests on up to `njobs` slots. Input files are cached in the work
//! directory and only requested when size or mtime differ.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::handshake::{HandshakeError, client_handshake};
use crate::bridge::protocol::{
    DoneOutcome, FileChunk, FileEntry, Message, SpecialRequest, TaskDone, TaskRefusedReason,
    TaskRequest, TaskStateKind,
};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{Connection, ConnectionError, FileSink};
use crate::process::{CommandSpawner, ExitOutcome, ProcessSpec, SupervisedProcess, TaskSignal};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to reach server: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("unexpected {0} from server")]
    Unexpected(String),
}

/// Totals over the lifetime of a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub rendered: u64,
    pub failed: u64,
    pub refused: u64,
}

impl ClientSummary {
    fn merge(&mut self, other: ClientSummary) {
        self.rendered += other.rendered;
        self.failed += other.failed;
        self.refused += other.refused;
    }
}

/// Connect to the configured server, or accept servers on the configured
/// listen address one at a time, until `shutdown` fires.
pub async fn run_client(
    config: ClientConfig,
    shutdown: CancellationToken,
) -> Result<ClientSummary, ClientError> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.work_dir).await?;

    if let Some(server) = &config.server {
        let stream = TcpStream::connect(server).await?;
        let _ = stream.set_nodelay(true);
        tracing::info!(peer = %server, "Connected to server");
        return serve(stream, &config, &shutdown).await;
    }

    let Some(listen) = config.listen else {
        return Err(ConfigError::NoEndpoint.into());
    };
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "Waiting for servers");

    let mut total = ClientSummary::default();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let _ = stream.set_nodelay(true);
        tracing::info!(%peer, "Server connected");
        match serve(stream, &config, &shutdown).await {
            Ok(summary) => total.merge(summary),
            Err(e) => tracing::warn!(%peer, error = %e, "Server session ended with error"),
        }
    }
    Ok(total)
}

/// Run one authenticated session over `stream`.
pub async fn serve<S>(
    stream: S,
    config: &ClientConfig,
    shutdown: &CancellationToken,
) -> Result<ClientSummary, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream);
    let session = client_handshake(&mut conn, &config.password, HANDSHAKE_TIMEOUT).await?;
    tracing::info!(njobs = session.njobs, server_start = session.start_time, "Authenticated");

    let (exits_tx, mut exits) = mpsc::unbounded_channel();
    let mut jobs = Jobs {
        config,
        njobs: usize::from(session.njobs),
        active: HashMap::new(),
        exits: exits_tx,
        summary: ClientSummary::default(),
    };

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Client shutting down");
                jobs.kill_all();
                let _ = conn.close().await;
                break Ok(());
            }
            Some((frame_no, outcome)) = exits.recv() => {
                if let Err(e) = jobs.render_exited(&mut conn, frame_no, outcome).await {
                    break Err(e);
                }
            }
            received = conn.recv() => match received {
                Ok(Some(frame)) if frame.message == Message::EndOfStream => {
                    tracing::info!("Server closed the session");
                    break Ok(());
                }
                Ok(Some(frame)) => {
                    if let Err(e) = jobs.handle(&mut conn, frame.message).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    tracing::info!("Server connection closed");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            },
        }
    };

    jobs.kill_all();
    result.map(|()| jobs.summary)
}

enum Job {
    AwaitingFiles {
        request: TaskRequest,
        pending: HashMap<String, PendingFile>,
    },
    Rendering {
        process: SupervisedProcess,
        started: Instant,
        cancelled: bool,
    },
}

struct PendingFile {
    entry: FileEntry,
    sink: Option<FileSink>,
}

struct Jobs<'a> {
    config: &'a ClientConfig,
    njobs: usize,
    active: HashMap<u32, Job>,
    exits: mpsc::UnboundedSender<(u32, ExitOutcome)>,
    summary: ClientSummary,
}

impl Jobs<'_> {
    async fn handle<S>(&mut self, conn: &mut Connection<S>, message: Message) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match message {
            Message::TaskRequest(request) => self.task_request(conn, request).await,
            Message::FileTransmission(chunk) => self.file_chunk(conn, chunk).await,
            Message::SpecialTaskRequest { frame_no, request } => {
                self.special(conn, frame_no, request).await
            }
            other => Err(ClientError::Unexpected(format!("{:?}", other.command()))),
        }
    }

    async fn refuse<S>(
        &mut self,
        conn: &mut Connection<S>,
        frame_no: u32,
        reason: TaskRefusedReason,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!(frame = frame_no, ?reason, "Refusing task");
        self.summary.refused += 1;
        conn.send(Message::TaskRefused { frame_no, reason }).await?;
        Ok(())
    }

    async fn task_request<S>(
        &mut self,
        conn: &mut Connection<S>,
        request: TaskRequest,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame_no = request.frame_no;
        if self.config.renderer.is_none() {
            return self.refuse(conn, frame_no, TaskRefusedReason::NoRenderer).await;
        }
        if self.active.len() >= self.njobs {
            return self.refuse(conn, frame_no, TaskRefusedReason::Busy).await;
        }
        if self.active.contains_key(&frame_no)
            || request.files.iter().any(|f| !is_safe_name(&f.name))
        {
            return self.refuse(conn, frame_no, TaskRefusedReason::BadRequest).await;
        }

        let pending: HashMap<String, PendingFile> = request
            .files
            .iter()
            .filter(|entry| !is_cached(&self.config.work_dir, entry))
            .map(|entry| {
                let file = PendingFile {
                    entry: entry.clone(),
                    sink: None,
                };
                (entry.name.clone(), file)
            })
            .collect();

        if pending.is_empty() {
            return self.start_render(conn, request).await;
        }
        let files: Vec<String> = pending.keys().cloned().collect();
        tracing::debug!(frame = frame_no, ?files, "Requesting input files");
        conn.send(Message::FileRequest { frame_no, files }).await?;
        self.active
            .insert(frame_no, Job::AwaitingFiles { request, pending });
        Ok(())
    }

    async fn file_chunk<S>(&mut self, conn: &mut Connection<S>, chunk: FileChunk) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame_no = chunk.frame_no;
        let Some(Job::AwaitingFiles { pending, .. }) = self.active.get_mut(&frame_no) else {
            // Trailing chunks of a cancelled or failed task.
            tracing::debug!(frame = frame_no, file = %chunk.name, "Dropping chunk for inactive task");
            return Ok(());
        };
        let Some(file) = pending.get_mut(&chunk.name) else {
            return Err(ClientError::Unexpected(format!(
                "file {:?} that was not requested",
                chunk.name
            )));
        };

        let complete = match write_chunk(&self.config.work_dir, file, &chunk).await {
            Ok(complete) => complete,
            Err(ConnectionError::Io(e)) => {
                tracing::warn!(frame = frame_no, file = %chunk.name, error = %e, "Failed to store input file");
                self.active.remove(&frame_no);
                self.summary.failed += 1;
                return send_done(conn, frame_no, DoneOutcome::FileError, 0, 0).await;
            }
            Err(e) => return Err(e.into()),
        };
        if !complete {
            return Ok(());
        }

        if let Some(PendingFile {
            entry,
            sink: Some(sink),
        }) = pending.remove(&chunk.name)
        {
            sink.finish(entry.mtime).await?;
        }
        if !pending.is_empty() {
            return Ok(());
        }
        match self.active.remove(&frame_no) {
            Some(Job::AwaitingFiles { request, .. }) => self.start_render(conn, request).await,
            _ => Ok(()),
        }
    }

    async fn start_render<S>(&mut self, conn: &mut Connection<S>, request: TaskRequest) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame_no = request.frame_no;
        let Some(renderer) = &self.config.renderer else {
            return self.refuse(conn, frame_no, TaskRefusedReason::NoRenderer).await;
        };
        let spec = ProcessSpec::render(renderer, &request).with_cwd(&self.config.work_dir);
        let exits = self.exits.clone();
        let spawned = SupervisedProcess::spawn(&CommandSpawner, &spec, move |outcome| {
            let _ = exits.send((frame_no, outcome));
        });

        match spawned {
            Ok(process) => {
                tracing::info!(frame = frame_no, pid = process.pid(), "Rendering");
                self.active.insert(
                    frame_no,
                    Job::Rendering {
                        process,
                        started: Instant::now(),
                        cancelled: false,
                    },
                );
                conn.send(Message::TaskState {
                    frame_no,
                    state: TaskStateKind::Rendering,
                })
                .await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(frame = frame_no, error = %e, "Failed to start renderer");
                self.summary.failed += 1;
                send_done(conn, frame_no, DoneOutcome::SpawnFailed, 0, 0).await
            }
        }
    }

    async fn special<S>(
        &mut self,
        conn: &mut Connection<S>,
        frame_no: u32,
        request: SpecialRequest,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let state = match self.active.get_mut(&frame_no) {
            None => {
                tracing::debug!(frame = frame_no, ?request, "Control request for unknown frame");
                return Ok(());
            }
            Some(Job::AwaitingFiles { .. }) => {
                if request != SpecialRequest::Cancel {
                    return Ok(());
                }
                self.active.remove(&frame_no);
                tracing::info!(frame = frame_no, "Cancelled before rendering");
                return send_done(conn, frame_no, DoneOutcome::Cancelled, 0, 0).await;
            }
            Some(Job::Rendering {
                process, cancelled, ..
            }) => match request {
                SpecialRequest::Stop => {
                    signal(process, frame_no, TaskSignal::Stop);
                    TaskStateKind::Stopped
                }
                SpecialRequest::Continue => {
                    signal(process, frame_no, TaskSignal::Continue);
                    TaskStateKind::Resumed
                }
                SpecialRequest::Cancel => {
                    // TaskDone follows once the renderer exits.
                    *cancelled = true;
                    signal(process, frame_no, TaskSignal::Terminate);
                    signal(process, frame_no, TaskSignal::Continue);
                    return Ok(());
                }
            },
        };
        conn.send(Message::TaskState { frame_no, state }).await?;
        Ok(())
    }

    async fn render_exited<S>(
        &mut self,
        conn: &mut Connection<S>,
        frame_no: u32,
        outcome: ExitOutcome,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(Job::Rendering {
            started, cancelled, ..
        }) = self.active.remove(&frame_no)
        else {
            return Ok(());
        };
        let render_ms = started.elapsed().as_millis() as u64;
        let (done, code) = match (cancelled, outcome.signal, outcome.code) {
            (true, signal, _) => (DoneOutcome::Cancelled, signal.unwrap_or(0)),
            (false, Some(signal), _) => (DoneOutcome::Signalled, signal),
            (false, None, Some(0)) => (DoneOutcome::Success, 0),
            (false, None, code) => (DoneOutcome::ExitFailure, code.unwrap_or(-1)),
        };
        if done == DoneOutcome::Success {
            self.summary.rendered += 1;
        } else {
            self.summary.failed += 1;
        }
        tracing::info!(frame = frame_no, outcome = ?done, code, render_ms, "Render finished");
        send_done(conn, frame_no, done, code, render_ms).await
    }

    fn kill_all(&mut self) {
        for (frame_no, job) in self.active.drain() {
            if let Job::Rendering { process, .. } = job {
                signal(&process, frame_no, TaskSignal::Kill);
            }
        }
    }
}

fn signal(process: &SupervisedProcess, frame_no: u32, signal: TaskSignal) {
    if let Err(e) = process.signal(signal) {
        tracing::warn!(frame = frame_no, ?signal, error = %e, "Failed to signal renderer");
    }
}

async fn send_done<S>(
    conn: &mut Connection<S>,
    frame_no: u32,
    outcome: DoneOutcome,
    code: i32,
    render_ms: u64,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(Message::TaskDone(TaskDone {
        frame_no,
        outcome,
        code,
        render_ms,
    }))
    .await?;
    Ok(())
}

async fn write_chunk(
    work_dir: &Path,
    file: &mut PendingFile,
    chunk: &FileChunk,
) -> Result<bool, ConnectionError> {
    if file.sink.is_none() {
        let path = work_dir.join(&chunk.name);
        file.sink = Some(FileSink::create(path, chunk.name.clone(), chunk.total_size).await?);
    }
    match file.sink.as_mut() {
        Some(sink) => sink.write_chunk(chunk).await,
        None => Ok(false),
    }
}

/// Relative, with no `..` components.
fn is_safe_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// True when `work_dir/name` matches the manifest entry's size and mtime.
fn is_cached(work_dir: &Path, entry: &FileEntry) -> bool {
    let path: PathBuf = work_dir.join(&entry.name);
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64);
    meta.len() == entry.size && mtime == Some(entry.mtime)
}
