use std::collections::{BTreeMap, HashMap, HashSet};

use crate::driver::DriverId;
use crate::task::{TaskId, TaskRecord};
use crate::worker::{ClientId, ClientLink, RemoteWorker, WorkerHandle, WorkerId, WorkerKind, WorkerStatus};

/// Builds a local worker on demand.
pub type LocalFactory = Box<dyn Fn(WorkerId) -> Box<dyn WorkerHandle> + Send>;

/// One authenticated remote client.
pub struct ClientEntry {
    pub link: ClientLink,
    pub njobs: u16,
    pub workers: Vec<WorkerId>,
    /// Tasks this client refused; not offered again until it completes one.
    declined: HashSet<TaskId>,
    /// Frame numbers in flight on this connection.
    frames: HashMap<u32, DriverId>,
    /// Request seq of frames released before the client's final reply.
    abandoned: HashMap<u32, u16>,
}

impl ClientEntry {
    pub fn busy(&self) -> usize {
        self.frames.len()
    }
}

/// Every known worker, plus the client list.
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, Box<dyn WorkerHandle>>,
    clients: BTreeMap<ClientId, ClientEntry>,
    local_factory: Option<LocalFactory>,
    local_limit: Option<usize>,
    next_worker: u64,
}

impl WorkerRegistry {
    pub fn new(local_factory: Option<LocalFactory>, local_limit: Option<usize>) -> Self {
        Self {
            workers: BTreeMap::new(),
            clients: BTreeMap::new(),
            local_factory,
            local_limit,
            next_worker: 1,
        }
    }

    fn allocate(&mut self) -> WorkerId {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        id
    }

    pub fn get(&self, id: WorkerId) -> Option<&dyn WorkerHandle> {
        self.workers.get(&id).map(|w| w.as_ref())
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut Box<dyn WorkerHandle>> {
        self.workers.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn local_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.kind() == WorkerKind::Local)
            .count()
    }

    fn can_grow_local(&self) -> bool {
        self.local_factory.is_some() && self.local_limit.is_none_or(|limit| self.local_count() < limit)
    }

    fn remote_accepts(&self, client: ClientId, task: &TaskRecord) -> bool {
        self.clients.get(&client).is_some_and(|entry| {
            !entry.declined.contains(&task.id) && !entry.frames.contains_key(&task.frame_no)
        })
    }

    /// Pick an idle worker for `task`: the lowest idle remote slot whose
    /// client will take it, else an idle or newly created local worker.
    pub fn select_worker(&mut self, task: &TaskRecord) -> Option<WorkerId> {
        let remote = self.workers.values().find_map(|w| match w.kind() {
            WorkerKind::Remote { client, .. }
                if w.query() == WorkerStatus::Idle && self.remote_accepts(client, task) =>
            {
                Some(w.id())
            }
            _ => None,
        });
        if remote.is_some() {
            return remote;
        }

        let local = self
            .workers
            .values()
            .find(|w| w.kind() == WorkerKind::Local && w.query() == WorkerStatus::Idle)
            .map(|w| w.id());
        if local.is_some() {
            return local;
        }

        if !self.can_grow_local() {
            return None;
        }
        let id = self.allocate();
        let worker = (self.local_factory.as_ref()?)(id);
        tracing::debug!(worker = %id, "Local worker created");
        self.workers.insert(id, worker);
        Some(id)
    }

    /// True if some task could be placed right now, ignoring declines.
    pub fn has_idle_capacity(&self) -> bool {
        self.can_grow_local() || self.workers.values().any(|w| w.query() == WorkerStatus::Idle)
    }

    /// Register an authenticated client with `njobs` remote slots.
    pub fn add_client(&mut self, link: ClientLink, njobs: u16) -> Vec<WorkerId> {
        let client = link.id();
        let mut workers = Vec::with_capacity(njobs as usize);
        for slot in 0..njobs {
            let id = self.allocate();
            self.workers
                .insert(id, Box::new(RemoteWorker::new(id, slot, link.clone())));
            workers.push(id);
        }
        self.clients.insert(
            client,
            ClientEntry {
                link,
                njobs,
                workers: workers.clone(),
                declined: HashSet::new(),
                frames: HashMap::new(),
                abandoned: HashMap::new(),
            },
        );
        workers
    }

    /// Drop a client and all of its slots.
    pub fn remove_client(&mut self, client: ClientId) -> Option<ClientEntry> {
        let entry = self.clients.remove(&client)?;
        for id in &entry.workers {
            self.workers.remove(id);
        }
        Some(entry)
    }

    pub fn client(&self, client: ClientId) -> Option<&ClientEntry> {
        self.clients.get(&client)
    }

    pub fn clients(&self) -> impl Iterator<Item = (ClientId, &ClientEntry)> {
        self.clients.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn bind_frame(&mut self, client: ClientId, frame_no: u32, driver: DriverId) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.frames.insert(frame_no, driver);
        }
    }

    pub fn unbind_frame(&mut self, client: ClientId, frame_no: u32, driver: DriverId) {
        if let Some(entry) = self.clients.get_mut(&client)
            && entry.frames.get(&frame_no) == Some(&driver)
        {
            entry.frames.remove(&frame_no);
        }
    }

    pub fn driver_for_frame(&self, client: ClientId, frame_no: u32) -> Option<DriverId> {
        self.clients.get(&client)?.frames.get(&frame_no).copied()
    }

    /// Remember that the request for `frame_no` sent at `seq_no` no longer
    /// has a driver, so its late replies can be told apart.
    pub fn abandon(&mut self, client: ClientId, frame_no: u32, seq_no: u16) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.abandoned.insert(frame_no, seq_no);
        }
    }

    pub fn abandoned(&self, client: ClientId, frame_no: u32) -> Option<u16> {
        self.clients.get(&client)?.abandoned.get(&frame_no).copied()
    }

    pub fn forget_abandoned(&mut self, client: ClientId, frame_no: u32) -> Option<u16> {
        self.clients.get_mut(&client)?.abandoned.remove(&frame_no)
    }

    pub fn decline(&mut self, client: ClientId, task: TaskId) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.declined.insert(task);
        }
    }

    pub fn has_declined(&self, client: ClientId, task: TaskId) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|entry| entry.declined.contains(&task))
    }

    pub fn clear_declines(&mut self, client: ClientId) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.declined.clear();
        }
    }

    /// Unbind a worker after its task ended. Local workers that can no
    /// longer run anything are dropped.
    pub fn release(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        worker.release();
        if worker.kind() == WorkerKind::Local && worker.query() == WorkerStatus::Gone {
            tracing::debug!(worker = %id, "Local worker removed");
            self.workers.remove(&id);
        }
    }

    /// SIGKILL every local renderer and disconnect every client.
    pub fn kill_all(&mut self) {
        for worker in self.workers.values_mut() {
            if worker.kind() == WorkerKind::Local {
                worker.kill();
            }
        }
        for entry in self.clients.values() {
            entry.link.disconnect();
        }
    }
}
