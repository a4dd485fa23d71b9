//! Per-database manager: reconciles configured subscriptions against the
//! apply and sync workers in the registry.
//!
//! Reconciliation is idempotent. With an unchanged configuration and no
//! worker exits in between, a second pass starts and stops nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::ReplicationContext;
use crate::error::{Error, Result};
use crate::types::{Lsn, Oid, RepOriginId};
use crate::worker::{Worker, WorkerDescriptor, WorkerRef};

/// A configured subscription as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: Oid,
    pub name: String,
    pub dboid: Oid,
    pub enabled: bool,
    pub origin: RepOriginId,
    /// Apply workers stop once this position has been applied.
    pub replay_stop_lsn: Option<Lsn>,
    /// Tables still waiting for their initial copy, as (schema, table).
    pub pending_sync: Vec<(String, String)>,
}

impl Subscription {
    pub fn new(id: Oid, name: impl Into<String>, dboid: Oid) -> Self {
        Self {
            id,
            name: name.into(),
            dboid,
            enabled: true,
            origin: 0,
            replay_stop_lsn: None,
            pending_sync: Vec::new(),
        }
    }

    fn apply_descriptor(&self) -> WorkerDescriptor {
        let desc = WorkerDescriptor::apply(self.dboid, self.id).with_origin(self.origin);
        match self.replay_stop_lsn {
            Some(lsn) => desc.replay_until(lsn),
            None => desc,
        }
    }

    fn wants_sync(&self, nspname: &str, relname: &str) -> bool {
        self.pending_sync
            .iter()
            .any(|(n, r)| n == nspname && r == relname)
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Workers launched, including restarts of crashed ones.
    pub started: Vec<WorkerRef>,
    /// Workers asked to terminate.
    pub stopped: Vec<WorkerRef>,
    /// Slots of dead workers returned to the free pool.
    pub released: Vec<WorkerRef>,
    /// The registry ran out of slots while starting workers.
    pub exhausted: bool,
}

impl ReconcileReport {
    /// Whether the pass started or stopped anything.
    pub fn changed(&self) -> bool {
        !self.started.is_empty() || !self.stopped.is_empty()
    }
}

/// Make sure a database has a running manager. Returns the handle of a
/// newly launched manager, or `None` if one is already running.
pub fn ensure_manager(ctx: &ReplicationContext, dboid: Oid) -> Result<Option<WorkerRef>> {
    if let Some(existing) = ctx.manager_find(dboid) {
        let existing_ref = existing.worker_ref();
        if existing.handle().is_none() || ctx.is_running(existing_ref) {
            return Ok(None);
        }
        info!(dboid, worker = %existing_ref, "Manager is gone, restarting");
        ctx.detach(existing_ref)?;
    }

    ctx.launch(WorkerDescriptor::manager(dboid)).map(Some)
}

/// Manager of one database.
pub struct Manager {
    ctx: Arc<ReplicationContext>,
    dboid: Oid,
    restart_delay: Duration,
}

impl Manager {
    pub fn new(ctx: Arc<ReplicationContext>, dboid: Oid, restart_delay: Duration) -> Self {
        Self {
            ctx,
            dboid,
            restart_delay,
        }
    }

    pub fn dboid(&self) -> Oid {
        self.dboid
    }

    /// One iteration of the manager loop: clear the change flag, reconcile
    /// and prune stats of subscriptions that no longer exist.
    pub fn tick(&self, subscriptions: &[Subscription], now: DateTime<Utc>) -> ReconcileReport {
        if self.ctx.take_subscriptions_changed() {
            debug!(dboid = self.dboid, "Reacting to subscription change");
        }

        let report = self.reconcile(subscriptions, now);

        let dboid = self.dboid;
        let known: Vec<Oid> = subscriptions
            .iter()
            .filter(|s| s.dboid == dboid)
            .map(|s| s.id)
            .collect();
        self.ctx.stats().maybe_prune(now, |key| {
            key.dboid != dboid || key.subid.map_or(true, |subid| known.contains(&subid))
        });

        report
    }

    /// Bring the workers of this database in line with `subscriptions`.
    ///
    /// Subscriptions of other databases are ignored.
    pub fn reconcile(&self, subscriptions: &[Subscription], now: DateTime<Utc>) -> ReconcileReport {
        let ordered: Vec<&Subscription> = subscriptions
            .iter()
            .filter(|s| s.dboid == self.dboid && s.enabled)
            .collect();
        let wanted: HashMap<Oid, &Subscription> = ordered.iter().map(|s| (s.id, *s)).collect();

        let mut report = ReconcileReport::default();

        for worker in self.ctx.apply_find_all(self.dboid) {
            let still_wanted = worker.subid().and_then(|id| wanted.get(&id)).map_or(false, |sub| {
                match worker.sync() {
                    Some(sync) => sub.wants_sync(&sync.nspname, &sync.relname),
                    None => true,
                }
            });

            if still_wanted {
                self.check_wanted(&worker, now, &mut report);
            } else {
                self.retire(&worker, &mut report);
            }
        }

        // Launch in configuration order so the same subscriptions win when slots run out.
        for sub in ordered {
            if report.exhausted {
                break;
            }

            if self.ctx.apply_find(self.dboid, sub.id).is_none() {
                self.start(sub.apply_descriptor(), &sub.name, &mut report);
            }

            for (nspname, relname) in &sub.pending_sync {
                if report.exhausted {
                    break;
                }
                if self
                    .ctx
                    .sync_find(self.dboid, sub.id, nspname, relname)
                    .is_none()
                {
                    let desc = WorkerDescriptor::sync(self.dboid, sub.id, nspname, relname)
                        .with_origin(sub.origin);
                    self.start(desc, &sub.name, &mut report);
                }
            }
        }

        if report.changed() {
            info!(
                dboid = self.dboid,
                started = report.started.len(),
                stopped = report.stopped.len(),
                released = report.released.len(),
                "Reconciled workers"
            );
        }

        report
    }

    /// A worker whose subscription is still configured: restart it if it
    /// died, once the restart delay has passed.
    fn check_wanted(&self, worker: &Worker, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let worker_ref = worker.worker_ref();

        if self.ctx.is_running(worker_ref) {
            return;
        }

        let dead_since = match (worker.crashed_at(), worker.handle()) {
            (Some(crashed_at), _) => crashed_at,
            // Exited without detaching or being reported as crashed.
            (None, Some(_)) => now - chrono::Duration::from_std(self.restart_delay).unwrap_or_default(),
            // Registered but not attached yet.
            (None, None) => return,
        };

        let elapsed = (now - dead_since).to_std().unwrap_or_default();
        if elapsed < self.restart_delay {
            debug!(worker = %worker_ref, ?elapsed, "Worker in restart backoff");
            return;
        }

        let Some(kind) = worker.kind().cloned() else {
            return;
        };

        if let Err(e) = self.ctx.detach(worker_ref) {
            debug!(worker = %worker_ref, error = %e, "Worker slot changed during reconcile");
            return;
        }
        report.released.push(worker_ref);

        info!(worker = %worker_ref, worker_type = %worker.worker_type(), "Restarting dead worker");
        let desc = WorkerDescriptor {
            dboid: self.dboid,
            kind,
        };
        self.start(desc, "restart", report);
    }

    /// A worker whose subscription is gone or disabled.
    fn retire(&self, worker: &Worker, report: &mut ReconcileReport) {
        let worker_ref = worker.worker_ref();

        if self.ctx.is_running(worker_ref) {
            match self.ctx.kill(worker_ref) {
                Ok(()) => report.stopped.push(worker_ref),
                Err(e) => debug!(worker = %worker_ref, error = %e, "Worker slot changed during reconcile"),
            }
        } else if worker.handle().is_some() || worker.crashed_at().is_some() {
            match self.ctx.detach(worker_ref) {
                Ok(()) => report.released.push(worker_ref),
                Err(e) => debug!(worker = %worker_ref, error = %e, "Worker slot changed during reconcile"),
            }
        }
    }

    fn start(&self, desc: WorkerDescriptor, subscription: &str, report: &mut ReconcileReport) {
        let worker_type = desc.worker_type();
        match self.ctx.launch(desc) {
            Ok(worker) => report.started.push(worker),
            Err(Error::NoFreeSlot { capacity }) => {
                error!(
                    dboid = self.dboid,
                    subscription,
                    capacity,
                    "Out of worker slots, cannot start {} worker",
                    worker_type
                );
                report.exhausted = true;
            }
            Err(e) => {
                warn!(dboid = self.dboid, subscription, error = %e, "Failed to start {} worker", worker_type);
            }
        }
    }
}
