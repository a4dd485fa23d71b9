//! Worker slot model.
//!
//! A slot's type tag and its payload are a single sum type, so a slot can
//! never claim to be an apply worker while carrying sync (or no) payload.
//! Free slots hold no kind at all.

use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};

use crate::process::ProcessHandle;
use crate::types::{Lsn, Oid, RepOriginId};

/// Type tag of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Unused slot.
    None,
    Manager,
    Apply,
    /// Apply worker that synchronizes one table.
    Sync,
}

impl WorkerType {
    pub fn name(self) -> &'static str {
        worker_type_name(self)
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Diagnostic name of a worker type.
pub fn worker_type_name(typ: WorkerType) -> &'static str {
    match typ {
        WorkerType::None => "none",
        WorkerType::Manager => "manager",
        WorkerType::Apply => "apply",
        WorkerType::Sync => "sync",
    }
}

/// Apply worker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyWorker {
    pub subid: Oid,
    /// New synchronization info is pending.
    pub sync_pending: bool,
    /// Replay stops once this position has been applied.
    pub replay_stop_lsn: Option<Lsn>,
    /// Remote origin of this worker.
    pub replorigin: RepOriginId,
    /// Last remote commit timestamp.
    pub last_ts: Option<DateTime<Utc>>,
}

impl ApplyWorker {
    pub fn new(subid: Oid) -> Self {
        Self {
            subid,
            sync_pending: false,
            replay_stop_lsn: None,
            replorigin: 0,
            last_ts: None,
        }
    }
}

/// Sync worker state: an apply worker that copies one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWorker {
    pub apply: ApplyWorker,
    pub nspname: String,
    pub relname: String,
}

impl SyncWorker {
    pub fn new(subid: Oid, nspname: impl Into<String>, relname: impl Into<String>) -> Self {
        Self {
            apply: ApplyWorker::new(subid),
            nspname: nspname.into(),
            relname: relname.into(),
        }
    }

    pub fn matches(&self, nspname: &str, relname: &str) -> bool {
        self.nspname == nspname && self.relname == relname
    }
}

/// Kind and type-specific payload of an occupied slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    Manager,
    Apply(ApplyWorker),
    Sync(SyncWorker),
}

impl WorkerKind {
    pub fn worker_type(&self) -> WorkerType {
        match self {
            WorkerKind::Manager => WorkerType::Manager,
            WorkerKind::Apply(_) => WorkerType::Apply,
            WorkerKind::Sync(_) => WorkerType::Sync,
        }
    }

    /// Apply state of apply and sync workers.
    pub fn apply(&self) -> Option<&ApplyWorker> {
        match self {
            WorkerKind::Manager => None,
            WorkerKind::Apply(apply) => Some(apply),
            WorkerKind::Sync(sync) => Some(&sync.apply),
        }
    }

    pub(crate) fn apply_mut(&mut self) -> Option<&mut ApplyWorker> {
        match self {
            WorkerKind::Manager => None,
            WorkerKind::Apply(apply) => Some(apply),
            WorkerKind::Sync(sync) => Some(&mut sync.apply),
        }
    }

    pub fn sync(&self) -> Option<&SyncWorker> {
        match self {
            WorkerKind::Sync(sync) => Some(sync),
            _ => None,
        }
    }
}

/// What to register: the database and the worker kind with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub dboid: Oid,
    pub kind: WorkerKind,
}

impl WorkerDescriptor {
    pub fn manager(dboid: Oid) -> Self {
        Self {
            dboid,
            kind: WorkerKind::Manager,
        }
    }

    pub fn apply(dboid: Oid, subid: Oid) -> Self {
        Self {
            dboid,
            kind: WorkerKind::Apply(ApplyWorker::new(subid)),
        }
    }

    pub fn sync(
        dboid: Oid,
        subid: Oid,
        nspname: impl Into<String>,
        relname: impl Into<String>,
    ) -> Self {
        Self {
            dboid,
            kind: WorkerKind::Sync(SyncWorker::new(subid, nspname, relname)),
        }
    }

    /// Stop replay once `lsn` has been applied. No effect on managers.
    pub fn replay_until(mut self, lsn: Lsn) -> Self {
        if let Some(apply) = self.kind.apply_mut() {
            apply.replay_stop_lsn = Some(lsn);
        }
        self
    }

    /// Replication origin used by an apply or sync worker.
    pub fn with_origin(mut self, origin: RepOriginId) -> Self {
        if let Some(apply) = self.kind.apply_mut() {
            apply.replorigin = origin;
        }
        self
    }

    pub fn worker_type(&self) -> WorkerType {
        self.kind.worker_type()
    }
}

/// Opaque handle to a registered worker.
///
/// Every operation taking a `WorkerRef` compares its generation with the
/// live slot and refuses to act on a slot that has been reused since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerRef {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl WorkerRef {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot, self.generation)
    }
}

/// One entry of the worker array, live or retired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSlot {
    kind: Option<WorkerKind>,
    generation: u64,
    handle: Option<ProcessHandle>,
    crashed_at: Option<DateTime<Utc>>,
    dboid: Oid,
}

impl WorkerSlot {
    pub fn worker_type(&self) -> WorkerType {
        self.kind
            .as_ref()
            .map_or(WorkerType::None, WorkerKind::worker_type)
    }

    pub fn kind(&self) -> Option<&WorkerKind> {
        self.kind.as_ref()
    }

    pub fn is_free(&self) -> bool {
        self.kind.is_none()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> Option<ProcessHandle> {
        self.handle
    }

    pub fn crashed_at(&self) -> Option<DateTime<Utc>> {
        self.crashed_at
    }

    pub fn dboid(&self) -> Oid {
        self.dboid
    }

    pub fn apply(&self) -> Option<&ApplyWorker> {
        self.kind.as_ref().and_then(WorkerKind::apply)
    }

    pub fn sync(&self) -> Option<&SyncWorker> {
        self.kind.as_ref().and_then(WorkerKind::sync)
    }

    /// Subscription served by an apply or sync worker.
    pub fn subid(&self) -> Option<Oid> {
        self.apply().map(|a| a.subid)
    }

    pub(crate) fn apply_mut(&mut self) -> Option<&mut ApplyWorker> {
        self.kind.as_mut().and_then(WorkerKind::apply_mut)
    }

    /// Take the slot for a new worker. Bumps the generation.
    pub(crate) fn claim(&mut self, desc: WorkerDescriptor) -> u64 {
        self.generation += 1;
        self.kind = Some(desc.kind);
        self.dboid = desc.dboid;
        self.handle = None;
        self.crashed_at = None;
        self.generation
    }

    /// Return the slot to the free pool. The generation is kept so the
    /// next claim continues counting from it.
    pub(crate) fn release(&mut self) {
        self.kind = None;
        self.handle = None;
        self.crashed_at = None;
    }

    pub(crate) fn set_handle(&mut self, handle: Option<ProcessHandle>) {
        self.handle = handle;
    }

    /// The handle is kept so a later registration can confirm the
    /// process is really gone before reusing the slot.
    pub(crate) fn set_crashed(&mut self, at: DateTime<Utc>) {
        self.crashed_at = Some(at);
    }
}

/// Point-in-time copy of a slot together with its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    slot: usize,
    state: WorkerSlot,
}

impl Worker {
    pub(crate) fn new(slot: usize, state: WorkerSlot) -> Self {
        Self { slot, state }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Handle for later operations against this worker.
    pub fn worker_ref(&self) -> WorkerRef {
        WorkerRef {
            slot: self.slot,
            generation: self.state.generation,
        }
    }
}

impl Deref for Worker {
    type Target = WorkerSlot;

    fn deref(&self) -> &WorkerSlot {
        &self.state
    }
}
