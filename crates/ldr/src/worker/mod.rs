//! Worker handles: execution capacity for one task at a time.
//!
//! Callers hold `Box<dyn WorkerHandle>` and never the concrete type. Handles
//! are event-driven: starting or signalling only queues work, results come
//! back as scheduler events.

mod local;
mod remote;

pub use local::{LocalWorker, LocalWorkerContext};
pub use remote::{ClientLink, Outgoing, RemoteWorker};

use serde::Serialize;

use crate::driver::DriverId;
use crate::process::{SpawnError, TaskSignal};
use crate::task::TaskRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identity of one authenticated remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Local,
    Remote { client: ClientId, slot: u16 },
}

impl WorkerKind {
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Self::Local => None,
            Self::Remote { client, .. } => Some(*client),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy(DriverId),
    /// Unusable; the registry drops it.
    Gone,
}

/// How far `start` got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// Output is being produced (local exec succeeded).
    Running,
    /// Request queued to a remote client; progress arrives later.
    Dispatched,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("no renderer configured")]
    NoRenderer,
    #[error("worker already bound to {0}")]
    Busy(DriverId),
    #[error("worker is gone")]
    Gone,
    #[error("client link closed")]
    Disconnected,
    #[error("worker has no task")]
    NotBound,
    #[error("failed to signal renderer: {0}")]
    Signal(#[source] std::io::Error),
}

pub trait WorkerHandle: Send {
    fn id(&self) -> WorkerId;

    fn kind(&self) -> WorkerKind;

    /// Human-readable description for logs and results.
    fn describe(&self) -> String;

    /// Bind to `driver` and begin executing `task`.
    fn start(&mut self, driver: DriverId, task: &TaskRecord) -> Result<Started, WorkerError>;

    fn signal(&mut self, signal: TaskSignal) -> Result<(), WorkerError>;

    /// Force the task to end now: SIGKILL locally, disconnect remotely.
    fn kill(&mut self);

    fn query(&self) -> WorkerStatus;

    /// Unbind after the task reached a terminal state.
    fn release(&mut self);
}
