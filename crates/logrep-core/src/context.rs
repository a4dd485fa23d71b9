//! Instance-wide replication context and worker registry.
//!
//! One [`ReplicationContext`] is created by the supervisor at startup and
//! shared by every worker of the instance. The registry lock guards the
//! worker array and the "subscriptions changed" flag; the stats table has
//! its own lock so counter updates never queue behind worker bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessControl, ProcessHandle};
use crate::stats::{stats_max_entries, StatsTable};
use crate::types::{Lsn, Oid};
use crate::worker::{Worker, WorkerDescriptor, WorkerRef, WorkerSlot, WorkerType};

/// Sizing and tuning of a context, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Number of worker slots.
    pub max_workers: usize,
    /// Stats table bound; negative derives it from `max_workers`.
    pub stats_max_entries: i64,
    /// Interval between stats prunes; `None` disables pruning.
    pub prune_interval: Option<Duration>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            stats_max_entries: -1,
            prune_interval: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug)]
struct Registry {
    subscriptions_changed: bool,
    workers: Vec<WorkerSlot>,
}

/// Root of the shared replication state.
pub struct ReplicationContext {
    lock: RwLock<Registry>,
    stats: StatsTable,
    supervisor: RwLock<Option<ProcessHandle>>,
    process: Arc<dyn ProcessControl>,
}

impl ReplicationContext {
    pub fn new(config: &ContextConfig, process: Arc<dyn ProcessControl>) -> Self {
        let max_entries = stats_max_entries(config.stats_max_entries, config.max_workers);

        info!(
            max_workers = config.max_workers,
            stats_max_entries = max_entries,
            "Initializing replication context"
        );

        Self {
            lock: RwLock::new(Registry {
                subscriptions_changed: false,
                workers: vec![WorkerSlot::default(); config.max_workers],
            }),
            stats: StatsTable::new(max_entries, config.prune_interval),
            supervisor: RwLock::new(None),
            process,
        }
    }

    /// Number of worker slots.
    pub fn capacity(&self) -> usize {
        self.lock.read().workers.len()
    }

    pub fn stats(&self) -> &StatsTable {
        &self.stats
    }

    pub fn set_supervisor(&self, handle: ProcessHandle) {
        *self.supervisor.write() = Some(handle);
    }

    pub fn supervisor(&self) -> Option<ProcessHandle> {
        *self.supervisor.read()
    }

    /// Claim a slot for a new worker.
    ///
    /// Takes the first slot that is unused, or that holds a crashed worker
    /// whose process is confirmed gone. On failure no slot is modified.
    pub fn register(&self, desc: WorkerDescriptor) -> Result<WorkerRef> {
        let typ = desc.worker_type();
        let dboid = desc.dboid;

        // Crashed occupants are probed before the write lock is taken.
        let dead = self.dead_crashed_slots();

        let mut registry = self.lock.write();
        let capacity = registry.workers.len();

        let slot = registry
            .workers
            .iter()
            .enumerate()
            .position(|(i, w)| w.is_free() || dead.contains(&(i, w.generation(), w.handle())))
            .ok_or(Error::NoFreeSlot { capacity })?;

        let reclaimed = !registry.workers[slot].is_free();
        let generation = registry.workers[slot].claim(desc);
        drop(registry);

        info!(
            slot,
            generation,
            worker_type = %typ,
            dboid,
            reclaimed,
            "Registered worker"
        );

        Ok(WorkerRef { slot, generation })
    }

    /// Crashed slots whose process is gone, as `(slot, generation, handle)`.
    ///
    /// A slot only qualifies at register time if it is still in the same state.
    fn dead_crashed_slots(&self) -> Vec<(usize, u64, Option<ProcessHandle>)> {
        let crashed: Vec<_> = self
            .lock
            .read()
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.crashed_at().is_some())
            .map(|(i, w)| (i, w.generation(), w.handle()))
            .collect();

        crashed
            .into_iter()
            .filter(|(_, _, handle)| !handle.map_or(false, |h| self.process.is_alive(h)))
            .collect()
    }

    /// Register a worker and start its process.
    ///
    /// If the process cannot be started the slot is released again.
    pub fn launch(&self, desc: WorkerDescriptor) -> Result<WorkerRef> {
        let worker = self.register(desc.clone())?;

        match self.process.spawn(worker, &desc) {
            Ok(handle) => {
                // The process may have attached or exited already.
                let recorded = self.with_live_slot(worker, |slot| {
                    if slot.handle().is_none() {
                        slot.set_handle(Some(handle));
                    }
                    Ok(())
                });
                if let Err(e) = recorded {
                    debug!(worker = %worker, error = %e, "Worker gone before launch completed");
                }
                info!(worker = %worker, process = %handle, worker_type = %desc.worker_type(), "Started worker");
                Ok(worker)
            }
            Err(e) => {
                warn!(worker = %worker, error = %e, "Failed to start worker, releasing slot");
                if let Err(detach_err) = self.detach(worker) {
                    debug!(worker = %worker, error = %detach_err, "Slot already reused");
                }
                Err(e)
            }
        }
    }

    /// Called by a worker once it runs: records its process handle.
    ///
    /// Fails if the slot was reused since registration or now holds a
    /// different type of worker.
    pub fn attach(&self, worker: WorkerRef, typ: WorkerType, handle: ProcessHandle) -> Result<()> {
        self.with_live_slot(worker, |slot| {
            let found = slot.worker_type();
            if found != typ {
                return Err(Error::WorkerTypeMismatch {
                    slot: worker.slot,
                    expected: typ,
                    found,
                });
            }
            slot.set_handle(Some(handle));
            Ok(())
        })?;

        info!(worker = %worker, worker_type = %typ, process = %handle, "Worker attached");
        Ok(())
    }

    /// Release the slot of an exited worker.
    ///
    /// Used by the worker's own exit path and by the supervisor's reaper.
    pub fn detach(&self, worker: WorkerRef) -> Result<()> {
        let typ = self.with_live_slot(worker, |slot| {
            let typ = slot.worker_type();
            slot.release();
            Ok(typ)
        })?;

        info!(worker = %worker, worker_type = %typ, "Worker detached");
        Ok(())
    }

    /// Record that a worker's process died. The slot stays occupied until
    /// it is detached or reclaimed by a later registration.
    pub fn mark_crashed(&self, worker: WorkerRef, at: DateTime<Utc>) -> Result<()> {
        let typ = self.with_live_slot(worker, |slot| {
            slot.set_crashed(at);
            Ok(slot.worker_type())
        })?;

        warn!(worker = %worker, worker_type = %typ, crashed_at = %at, "Worker crashed");
        Ok(())
    }

    /// Record the last remote commit applied by an apply or sync worker.
    pub fn record_commit(&self, worker: WorkerRef, commit_time: DateTime<Utc>) -> Result<()> {
        self.with_live_apply(worker, |apply| apply.last_ts = Some(commit_time))
    }

    /// Flag that new synchronization info is (or is no longer) pending.
    pub fn set_sync_pending(&self, worker: WorkerRef, pending: bool) -> Result<()> {
        self.with_live_apply(worker, |apply| apply.sync_pending = pending)
    }

    fn with_live_apply<F>(&self, worker: WorkerRef, f: F) -> Result<()>
    where
        F: FnOnce(&mut crate::worker::ApplyWorker),
    {
        self.with_live_slot(worker, |slot| {
            let found = slot.worker_type();
            match slot.apply_mut() {
                Some(apply) => {
                    f(apply);
                    Ok(())
                }
                None => Err(Error::WorkerTypeMismatch {
                    slot: worker.slot,
                    expected: WorkerType::Apply,
                    found,
                }),
            }
        })
    }

    fn with_live_slot<T, F>(&self, worker: WorkerRef, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkerSlot) -> Result<T>,
    {
        let mut registry = self.lock.write();
        let slot = registry
            .workers
            .get_mut(worker.slot)
            .ok_or(Error::InvalidSlot(worker.slot))?;
        check_live(slot, worker)?;
        f(slot)
    }

    /// Snapshot of one slot by index.
    pub fn get_worker(&self, slot: usize) -> Result<Worker> {
        let registry = self.lock.read();
        registry
            .workers
            .get(slot)
            .map(|w| Worker::new(slot, w.clone()))
            .ok_or(Error::InvalidSlot(slot))
    }

    /// Snapshots of all slots, free ones included.
    pub fn workers(&self) -> Vec<Worker> {
        self.scan(|_| true)
    }

    /// Snapshot of the slot behind a handle, if it is still live.
    pub fn resolve(&self, worker: WorkerRef) -> Result<Worker> {
        let registry = self.lock.read();
        let slot = registry
            .workers
            .get(worker.slot)
            .ok_or(Error::InvalidSlot(worker.slot))?;
        check_live(slot, worker)?;
        Ok(Worker::new(worker.slot, slot.clone()))
    }

    fn scan<F>(&self, pred: F) -> Vec<Worker>
    where
        F: Fn(&WorkerSlot) -> bool,
    {
        let registry = self.lock.read();
        registry
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| pred(w))
            .map(|(i, w)| Worker::new(i, w.clone()))
            .collect()
    }

    pub fn manager_find(&self, dboid: Oid) -> Option<Worker> {
        self.scan(|w| w.worker_type() == WorkerType::Manager && w.dboid() == dboid)
            .into_iter()
            .next()
    }

    /// The apply worker (not sync) of a subscription.
    pub fn apply_find(&self, dboid: Oid, subid: Oid) -> Option<Worker> {
        self.scan(|w| {
            w.worker_type() == WorkerType::Apply && w.dboid() == dboid && w.subid() == Some(subid)
        })
        .into_iter()
        .next()
    }

    /// Every apply and sync worker of a database.
    pub fn apply_find_all(&self, dboid: Oid) -> Vec<Worker> {
        self.scan(|w| w.apply().is_some() && w.dboid() == dboid)
    }

    pub fn sync_find(&self, dboid: Oid, subid: Oid, nspname: &str, relname: &str) -> Option<Worker> {
        self.scan(|w| {
            w.dboid() == dboid
                && w.sync()
                    .map_or(false, |s| s.apply.subid == subid && s.matches(nspname, relname))
        })
        .into_iter()
        .next()
    }

    pub fn sync_find_all(&self, dboid: Oid, subid: Oid) -> Vec<Worker> {
        self.scan(|w| w.dboid() == dboid && w.sync().map_or(false, |s| s.apply.subid == subid))
    }

    /// Whether the worker behind a handle has a confirmed-alive process.
    pub fn is_running(&self, worker: WorkerRef) -> bool {
        let handle = match self.resolve(worker) {
            Ok(w) => w.handle(),
            Err(_) => return false,
        };
        handle.map_or(false, |h| self.process.is_alive(h))
    }

    /// Ask a worker's process to terminate. Does not wait and does not
    /// release the slot.
    pub fn kill(&self, worker: WorkerRef) -> Result<()> {
        let current = self.resolve(worker)?;
        match current.handle() {
            Some(handle) => {
                info!(worker = %worker, process = %handle, worker_type = %current.worker_type(), "Terminating worker");
                self.process.terminate(handle);
            }
            None => debug!(worker = %worker, "Worker has no process to terminate"),
        }
        Ok(())
    }

    /// Signal that subscription configuration changed.
    ///
    /// With `kill`, the apply and sync workers of `subid` are terminated.
    /// The supervisor is woken so the manager can reconcile.
    pub fn subscription_changed(&self, dboid: Oid, subid: Option<Oid>, kill: bool) {
        let to_kill: Vec<(WorkerRef, Option<ProcessHandle>)> = {
            let mut registry = self.lock.write();
            registry.subscriptions_changed = true;

            match (kill, subid) {
                (true, Some(subid)) => registry
                    .workers
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.dboid() == dboid && w.subid() == Some(subid))
                    .map(|(i, w)| {
                        (
                            WorkerRef {
                                slot: i,
                                generation: w.generation(),
                            },
                            w.handle(),
                        )
                    })
                    .collect(),
                _ => Vec::new(),
            }
        };

        info!(dboid, subid = ?subid, kill, workers = to_kill.len(), "Subscriptions changed");

        for (worker, handle) in to_kill {
            if let Some(handle) = handle {
                info!(worker = %worker, process = %handle, "Terminating worker of changed subscription");
                self.process.terminate(handle);
            }
        }

        if let Some(supervisor) = self.supervisor() {
            self.process.wake(supervisor);
        }
    }

    /// Read and clear the "subscriptions changed" flag.
    pub fn take_subscriptions_changed(&self) -> bool {
        std::mem::take(&mut self.lock.write().subscriptions_changed)
    }

    pub fn subscriptions_changed(&self) -> bool {
        self.lock.read().subscriptions_changed
    }

    /// Replay stop position of an apply or sync worker.
    pub fn replay_stop_lsn(&self, worker: WorkerRef) -> Result<Option<Lsn>> {
        let current = self.resolve(worker)?;
        Ok(current.apply().and_then(|a| a.replay_stop_lsn))
    }
}

fn check_live(slot: &WorkerSlot, worker: WorkerRef) -> Result<()> {
    if slot.is_free() || slot.generation() != worker.generation {
        return Err(Error::StaleWorkerReference {
            slot: worker.slot,
            expected: worker.generation,
            found: slot.generation(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockProcesses;
    use parking_lot::Mutex;
    use std::sync::Weak;

    fn context(max_workers: usize) -> (ReplicationContext, MockProcesses) {
        let mock = MockProcesses::new();
        let config = ContextConfig {
            max_workers,
            ..Default::default()
        };
        (ReplicationContext::new(&config, Arc::new(mock.clone())), mock)
    }

    #[test]
    fn test_register_until_full() {
        let (ctx, _) = context(2);

        let a = ctx.register(WorkerDescriptor::manager(1)).unwrap();
        let b = ctx.register(WorkerDescriptor::apply(1, 10)).unwrap();
        assert_ne!(a.slot(), b.slot());

        let before = ctx.workers();
        let err = ctx.register(WorkerDescriptor::apply(1, 11)).unwrap_err();
        assert!(matches!(err, Error::NoFreeSlot { capacity: 2 }));
        assert_eq!(ctx.workers(), before);
    }

    #[test]
    fn test_generation_increases_on_reuse() {
        let (ctx, _) = context(1);

        let first = ctx.register(WorkerDescriptor::apply(1, 10)).unwrap();
        ctx.detach(first).unwrap();
        let second = ctx.register(WorkerDescriptor::apply(1, 10)).unwrap();

        assert_eq!(first.slot(), second.slot());
        assert!(second.generation() > first.generation());

        let err = ctx.kill(first).unwrap_err();
        assert!(matches!(err, Error::StaleWorkerReference { .. }));
        assert!(ctx.detach(first).is_err());
        assert!(ctx.resolve(second).is_ok());
    }

    #[test]
    fn test_attach_checks_type_and_generation() {
        let (ctx, _) = context(2);
        let worker = ctx.register(WorkerDescriptor::apply(1, 10)).unwrap();

        let err = ctx
            .attach(worker, WorkerType::Sync, ProcessHandle::new(5))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::WorkerTypeMismatch {
                expected: WorkerType::Sync,
                found: WorkerType::Apply,
                ..
            }
        ));

        ctx.attach(worker, WorkerType::Apply, ProcessHandle::new(5))
            .unwrap();
        assert_eq!(
            ctx.get_worker(worker.slot()).unwrap().handle(),
            Some(ProcessHandle::new(5))
        );

        ctx.detach(worker).unwrap();
        let reused = ctx.register(WorkerDescriptor::manager(1)).unwrap();
        assert_eq!(reused.slot(), worker.slot());
        let err = ctx
            .attach(worker, WorkerType::Apply, ProcessHandle::new(6))
            .unwrap_err();
        assert!(matches!(err, Error::StaleWorkerReference { .. }));
    }

    #[test]
    fn test_launch_records_handle() {
        let (ctx, mock) = context(2);
        let worker = ctx.launch(WorkerDescriptor::apply(1, 10)).unwrap();

        let handle = mock.handle_for(worker).unwrap();
        assert_eq!(ctx.resolve(worker).unwrap().handle(), Some(handle));
        assert!(ctx.is_running(worker));

        mock.exit(handle);
        assert!(!ctx.is_running(worker));
    }

    #[test]
    fn test_launch_failure_releases_slot() {
        let mock = MockProcesses::failing("no more processes");
        let ctx = ReplicationContext::new(
            &ContextConfig {
                max_workers: 1,
                ..Default::default()
            },
            Arc::new(mock),
        );

        let err = ctx.launch(WorkerDescriptor::manager(1)).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(ctx.get_worker(0).unwrap().is_free());
    }

    #[test]
    fn test_crashed_slot_reuse_requires_dead_process() {
        let (ctx, mock) = context(1);
        let worker = ctx.launch(WorkerDescriptor::apply(1, 10)).unwrap();
        let handle = mock.handle_for(worker).unwrap();

        // Crash reported while the process still lingers: not reusable.
        ctx.mark_crashed(worker, Utc::now()).unwrap();
        assert!(matches!(
            ctx.register(WorkerDescriptor::apply(1, 11)),
            Err(Error::NoFreeSlot { .. })
        ));

        mock.exit(handle);
        let reused = ctx.register(WorkerDescriptor::apply(1, 11)).unwrap();
        assert_eq!(reused.slot(), worker.slot());
        assert!(reused.generation() > worker.generation());

        let current = ctx.resolve(reused).unwrap();
        assert!(current.crashed_at().is_none());
        assert!(current.handle().is_none());
        assert_eq!(current.subid(), Some(11));
    }

    /// Reports every liveness probe as dead and records whether the
    /// registry lock was free at the time.
    #[derive(Default)]
    struct LockCheckingProcesses {
        ctx: Mutex<Weak<ReplicationContext>>,
        probes: Mutex<Vec<bool>>,
    }

    impl ProcessControl for LockCheckingProcesses {
        fn spawn(&self, _worker: WorkerRef, _desc: &WorkerDescriptor) -> Result<ProcessHandle> {
            Ok(ProcessHandle::new(4242))
        }

        fn is_alive(&self, _handle: ProcessHandle) -> bool {
            if let Some(ctx) = self.ctx.lock().upgrade() {
                let unlocked = ctx.lock.try_write().is_some();
                self.probes.lock().push(unlocked);
            }
            false
        }

        fn terminate(&self, _handle: ProcessHandle) {}
    }

    #[test]
    fn test_register_probes_processes_outside_registry_lock() {
        let processes = Arc::new(LockCheckingProcesses::default());
        let config = ContextConfig {
            max_workers: 1,
            ..Default::default()
        };
        let ctx = Arc::new(ReplicationContext::new(&config, processes.clone()));
        *processes.ctx.lock() = Arc::downgrade(&ctx);

        let worker = ctx.launch(WorkerDescriptor::apply(1, 10)).unwrap();
        ctx.mark_crashed(worker, Utc::now()).unwrap();

        let reused = ctx.register(WorkerDescriptor::apply(1, 11)).unwrap();
        assert_eq!(reused.slot(), worker.slot());
        assert_eq!(*processes.probes.lock(), vec![true]);
    }

    #[test]
    fn test_crash_keeps_generation() {
        let (ctx, _) = context(1);
        let worker = ctx.register(WorkerDescriptor::manager(1)).unwrap();
        ctx.mark_crashed(worker, Utc::now()).unwrap();

        let current = ctx.resolve(worker).unwrap();
        assert_eq!(current.generation(), worker.generation());
        assert!(current.crashed_at().is_some());
    }

    #[test]
    fn test_find_functions() {
        let (ctx, _) = context(8);
        ctx.register(WorkerDescriptor::manager(1)).unwrap();
        ctx.register(WorkerDescriptor::manager(2)).unwrap();
        let apply = ctx.register(WorkerDescriptor::apply(1, 10)).unwrap();
        ctx.register(WorkerDescriptor::apply(2, 10)).unwrap();
        let sync = ctx
            .register(WorkerDescriptor::sync(1, 10, "public", "users"))
            .unwrap();
        ctx.register(WorkerDescriptor::sync(1, 11, "public", "users"))
            .unwrap();

        assert_eq!(ctx.manager_find(1).unwrap().dboid(), 1);
        assert!(ctx.manager_find(3).is_none());

        let found = ctx.apply_find(1, 10).unwrap();
        assert_eq!(found.worker_ref(), apply);
        assert_eq!(found.worker_type(), WorkerType::Apply);
        assert!(ctx.apply_find(1, 11).is_none());

        assert_eq!(ctx.apply_find_all(1).len(), 3);
        assert_eq!(ctx.apply_find_all(2).len(), 1);

        let found = ctx.sync_find(1, 10, "public", "users").unwrap();
        assert_eq!(found.worker_ref(), sync);
        assert!(ctx.sync_find(1, 10, "public", "posts").is_none());
        assert_eq!(ctx.sync_find_all(1, 10).len(), 1);
        assert_eq!(ctx.sync_find_all(1, 11).len(), 1);
        assert!(ctx.sync_find_all(2, 10).is_empty());
    }

    #[test]
    fn test_subscription_changed_kills_workers() {
        let (ctx, mock) = context(4);
        let apply = ctx.launch(WorkerDescriptor::apply(1, 10)).unwrap();
        let sync = ctx
            .launch(WorkerDescriptor::sync(1, 10, "public", "users"))
            .unwrap();
        let other = ctx.launch(WorkerDescriptor::apply(1, 11)).unwrap();

        assert!(!ctx.subscriptions_changed());
        ctx.subscription_changed(1, Some(10), true);
        assert!(ctx.subscriptions_changed());

        assert!(!ctx.is_running(apply));
        assert!(!ctx.is_running(sync));
        assert!(ctx.is_running(other));
        assert_eq!(mock.terminated().len(), 2);

        // Killing never frees the slot.
        assert!(ctx.resolve(apply).is_ok());

        assert!(ctx.take_subscriptions_changed());
        assert!(!ctx.take_subscriptions_changed());
    }

    #[test]
    fn test_subscription_changed_without_kill() {
        let (ctx, mock) = context(2);
        let apply = ctx.launch(WorkerDescriptor::apply(1, 10)).unwrap();

        ctx.subscription_changed(1, Some(10), false);
        assert!(ctx.subscriptions_changed());
        assert!(ctx.is_running(apply));
        assert!(mock.terminated().is_empty());
    }

    #[test]
    fn test_apply_state_updates() {
        let (ctx, _) = context(2);
        let manager = ctx.register(WorkerDescriptor::manager(1)).unwrap();
        let apply = ctx
            .register(WorkerDescriptor::apply(1, 10).replay_until(500))
            .unwrap();

        let ts = Utc::now();
        ctx.record_commit(apply, ts).unwrap();
        ctx.set_sync_pending(apply, true).unwrap();

        let state = ctx.resolve(apply).unwrap();
        let info = state.apply().unwrap();
        assert_eq!(info.last_ts, Some(ts));
        assert!(info.sync_pending);
        assert_eq!(ctx.replay_stop_lsn(apply).unwrap(), Some(500));

        assert!(matches!(
            ctx.record_commit(manager, ts),
            Err(Error::WorkerTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_slot() {
        let (ctx, _) = context(1);
        assert!(matches!(ctx.get_worker(5), Err(Error::InvalidSlot(5))));
    }
}
