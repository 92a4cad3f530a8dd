use garm_common::model::{
    ControllerInfo, Entity, ForgeCredentials, Instance, Job, Pool, ScaleSet,
};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Entity,
    Pool,
    ScaleSet,
    Instance,
    Job,
    Credentials,
    Controller,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub enum ChangePayload {
    Entity(Entity),
    Pool(Pool),
    ScaleSet(ScaleSet),
    Instance(Instance),
    Job(Job),
    Credentials(ForgeCredentials),
    Controller(ControllerInfo),
}

#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    pub payload: ChangePayload,
}

impl ChangeRecord {
    pub fn kind(&self) -> ChangeKind {
        match &self.payload {
            ChangePayload::Entity(_) => ChangeKind::Entity,
            ChangePayload::Pool(_) => ChangeKind::Pool,
            ChangePayload::ScaleSet(_) => ChangeKind::ScaleSet,
            ChangePayload::Instance(_) => ChangeKind::Instance,
            ChangePayload::Job(_) => ChangeKind::Job,
            ChangePayload::Credentials(_) => ChangeKind::Credentials,
            ChangePayload::Controller(_) => ChangeKind::Controller,
        }
    }
}

/// Fan-out of store mutations. Slow subscribers fall behind and observe
/// `RecvError::Lagged`; they are expected to resynchronize from the store.
#[derive(Clone)]
pub struct Watcher {
    sender: broadcast::Sender<ChangeRecord>,
}

impl Watcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.sender.subscribe()
    }

    pub fn publish(&self, operation: ChangeOperation, payload: ChangePayload) {
        // no subscribers is fine, e.g. during bootstrap
        let _ = self.sender.send(ChangeRecord { operation, payload });
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new(256)
    }
}
