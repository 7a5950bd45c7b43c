use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ClientId, Started, WorkerError, WorkerHandle, WorkerId, WorkerKind, WorkerStatus};
use crate::bridge::protocol::{Message, SpecialRequest};
use crate::driver::DriverId;
use crate::process::TaskSignal;
use crate::task::TaskRecord;

/// Work queued for a client's writer pump.
#[derive(Debug)]
pub enum Outgoing {
    Message(Message),
    /// Stream `path` to the client as `name`.
    File {
        frame_no: u32,
        name: String,
        path: PathBuf,
    },
    /// Send EndOfStream and close.
    Disconnect,
}

/// Scheduler-side handle on an authenticated client connection.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: ClientId,
    peer: String,
    tx: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
}

impl ClientLink {
    pub fn new(id: ClientId, peer: impl Into<String>, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id,
            peer: peer.into(),
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Cancelled once the link is disconnected from the scheduler side.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn send(&self, outgoing: Outgoing) -> Result<(), WorkerError> {
        if self.closed.is_cancelled() {
            return Err(WorkerError::Disconnected);
        }
        self.tx.send(outgoing).map_err(|_| WorkerError::Disconnected)
    }

    pub fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.send(Outgoing::Disconnect);
        self.closed.cancel();
    }
}

/// One slot of a remote client. A client granted `njobs` slots has `njobs`
/// of these, all sharing one link.
pub struct RemoteWorker {
    id: WorkerId,
    slot: u16,
    link: ClientLink,
    bound: Option<(DriverId, u32)>,
}

impl RemoteWorker {
    pub fn new(id: WorkerId, slot: u16, link: ClientLink) -> Self {
        Self {
            id,
            slot,
            link,
            bound: None,
        }
    }

    pub fn link(&self) -> &ClientLink {
        &self.link
    }

    fn frame_no(&self) -> Result<u32, WorkerError> {
        self.bound
            .map(|(_, frame_no)| frame_no)
            .ok_or(WorkerError::NotBound)
    }
}

impl WorkerHandle for RemoteWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Remote {
            client: self.link.id(),
            slot: self.slot,
        }
    }

    fn describe(&self) -> String {
        format!("remote {} slot {}", self.link.peer(), self.slot)
    }

    fn start(&mut self, driver: DriverId, task: &TaskRecord) -> Result<Started, WorkerError> {
        if let Some((current, _)) = self.bound {
            return Err(WorkerError::Busy(current));
        }
        self.link
            .send(Outgoing::Message(Message::TaskRequest(task.to_request())))?;
        self.bound = Some((driver, task.frame_no));
        Ok(Started::Dispatched)
    }

    fn signal(&mut self, signal: TaskSignal) -> Result<(), WorkerError> {
        let request = match signal {
            TaskSignal::Stop => SpecialRequest::Stop,
            TaskSignal::Continue => SpecialRequest::Continue,
            TaskSignal::Terminate => SpecialRequest::Cancel,
            TaskSignal::Kill => {
                self.kill();
                return Ok(());
            }
        };
        let frame_no = self.frame_no()?;
        self.link
            .send(Outgoing::Message(Message::SpecialTaskRequest { frame_no, request }))
    }

    fn kill(&mut self) {
        self.link.disconnect();
    }

    fn query(&self) -> WorkerStatus {
        match self.bound {
            _ if self.link.is_closed() => WorkerStatus::Gone,
            Some((driver, _)) => WorkerStatus::Busy(driver),
            None => WorkerStatus::Idle,
        }
    }

    fn release(&mut self) {
        self.bound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (ClientLink, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientLink::new(ClientId(3), "10.0.0.2:40000", tx), rx)
    }

    #[test]
    fn start_queues_task_request() {
        let (link, mut rx) = link();
        let mut worker = RemoteWorker::new(WorkerId(7), 0, link);
        let task = TaskRecord::new(11, 100, 50, "png");

        assert_eq!(worker.start(DriverId(1), &task).unwrap(), Started::Dispatched);
        assert_eq!(worker.query(), WorkerStatus::Busy(DriverId(1)));
        match rx.try_recv().unwrap() {
            Outgoing::Message(Message::TaskRequest(req)) => assert_eq!(req.frame_no, 11),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signals_map_to_special_requests() {
        let (link, mut rx) = link();
        let mut worker = RemoteWorker::new(WorkerId(7), 0, link);
        assert!(matches!(
            worker.signal(TaskSignal::Stop),
            Err(WorkerError::NotBound)
        ));

        worker
            .start(DriverId(1), &TaskRecord::new(4, 1, 1, "png"))
            .unwrap();
        let _ = rx.try_recv();

        for (signal, expected) in [
            (TaskSignal::Stop, SpecialRequest::Stop),
            (TaskSignal::Continue, SpecialRequest::Continue),
            (TaskSignal::Terminate, SpecialRequest::Cancel),
        ] {
            worker.signal(signal).unwrap();
            match rx.try_recv().unwrap() {
                Outgoing::Message(Message::SpecialTaskRequest { frame_no, request }) => {
                    assert_eq!(frame_no, 4);
                    assert_eq!(request, expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn kill_disconnects_every_slot() {
        let (link, mut rx) = link();
        let mut a = RemoteWorker::new(WorkerId(1), 0, link.clone());
        let b = RemoteWorker::new(WorkerId(2), 1, link);

        a.kill();
        assert!(matches!(rx.try_recv().unwrap(), Outgoing::Disconnect));
        assert_eq!(a.query(), WorkerStatus::Gone);
        assert_eq!(b.query(), WorkerStatus::Gone);
        assert!(matches!(
            a.start(DriverId(1), &TaskRecord::new(1, 1, 1, "png")),
            Err(WorkerError::Disconnected)
        ));
    }

    #[test]
    fn release_returns_to_idle() {
        let (link, _rx) = link();
        let mut worker = RemoteWorker::new(WorkerId(1), 0, link);
        worker
            .start(DriverId(9), &TaskRecord::new(1, 1, 1, "png"))
            .unwrap();
        worker.release();
        assert_eq!(worker.query(), WorkerStatus::Idle);
        assert_eq!(
            worker.kind(),
            WorkerKind::Remote {
                client: ClientId(3),
                slot: 0
            }
        );
    }
}
