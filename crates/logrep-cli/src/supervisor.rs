//! Runs the worker registry on tokio tasks.
//!
//! The supervisor owns the [`ReplicationContext`]. It makes sure every
//! database with subscriptions has a manager, and it turns the spawn and
//! terminate requests of the registry into tasks. Managers reconcile their
//! database's subscriptions on every naptime tick and whenever the
//! supervisor is woken by a subscription change.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use logrep_core::{
    ensure_manager, format_lsn, ChangeEvent, ContextConfig, Error as CoreError, Manager, Oid,
    ProcessControl, ProcessHandle, ReplicationContext, Subscription, SyncWorker, WorkerDescriptor,
    WorkerKind, WorkerRef,
};
use logrep_proto::{ApplyProgress, ApplySession, MemorySink, Negotiated, OutputSession};

const SUPERVISOR_PID: u32 = 1;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime knobs shared by every worker task.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub naptime: Duration,
    pub restart_delay: Duration,
    /// How long a sync worker's initial copy takes.
    pub sync_copy_time: Duration,
    pub negotiated: Negotiated,
    /// Change stream each apply worker replays through the codec.
    pub stream: Option<Arc<Vec<ChangeEvent>>>,
}

enum WorkerEvent {
    Spawn {
        worker: WorkerRef,
        desc: WorkerDescriptor,
        handle: ProcessHandle,
    },
    Exited {
        worker: WorkerRef,
        handle: ProcessHandle,
        result: std::result::Result<(), String>,
    },
}

/// [`ProcessControl`] backed by tokio tasks.
///
/// Spawning only allocates a handle and queues the request; the supervisor
/// loop starts the task. A handle counts as alive until its task returns.
pub struct TaskProcesses {
    next_pid: AtomicU32,
    running: Mutex<HashMap<ProcessHandle, Arc<Notify>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    wakeup: Notify,
}

impl TaskProcesses {
    fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            next_pid: AtomicU32::new(SUPERVISOR_PID + 1),
            running: Mutex::new(HashMap::new()),
            events,
            wakeup: Notify::new(),
        }
    }

    fn stop_signal(&self, handle: ProcessHandle) -> Option<Arc<Notify>> {
        self.running.lock().get(&handle).cloned()
    }

    fn exited(&self, worker: WorkerRef, handle: ProcessHandle, result: std::result::Result<(), String>) {
        self.running.lock().remove(&handle);
        // The receiver is only gone once the supervisor has returned.
        let _ = self.events.send(WorkerEvent::Exited {
            worker,
            handle,
            result,
        });
    }

    fn terminate_all(&self) {
        for stop in self.running.lock().values() {
            stop.notify_one();
        }
    }

    fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

impl ProcessControl for TaskProcesses {
    fn spawn(&self, worker: WorkerRef, desc: &WorkerDescriptor) -> logrep_core::Result<ProcessHandle> {
        let handle = ProcessHandle::new(self.next_pid.fetch_add(1, Ordering::Relaxed));
        self.running.lock().insert(handle, Arc::new(Notify::new()));

        let request = WorkerEvent::Spawn {
            worker,
            desc: desc.clone(),
            handle,
        };
        if self.events.send(request).is_err() {
            self.running.lock().remove(&handle);
            return Err(CoreError::Spawn("supervisor is not running".to_string()));
        }
        Ok(handle)
    }

    fn is_alive(&self, handle: ProcessHandle) -> bool {
        self.running.lock().contains_key(&handle)
    }

    fn terminate(&self, handle: ProcessHandle) {
        if let Some(stop) = self.running.lock().get(&handle) {
            stop.notify_one();
        }
    }

    fn wake(&self, handle: ProcessHandle) {
        if handle.pid() == SUPERVISOR_PID {
            self.wakeup.notify_one();
        }
    }
}

/// State every worker task can reach.
struct Shared {
    ctx: Arc<ReplicationContext>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    settings: WorkerSettings,
    manager_wake: Notify,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    processes: Arc<TaskProcesses>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    stopping: bool,
}

impl Supervisor {
    pub fn new(
        config: &ContextConfig,
        subscriptions: Vec<Subscription>,
        settings: WorkerSettings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let processes = Arc::new(TaskProcesses::new(tx));
        let control: Arc<dyn ProcessControl> = processes.clone();

        let ctx = Arc::new(ReplicationContext::new(config, control));
        ctx.set_supervisor(ProcessHandle::new(SUPERVISOR_PID));

        Self {
            shared: Arc::new(Shared {
                ctx,
                subscriptions: Arc::new(RwLock::new(subscriptions)),
                settings,
                manager_wake: Notify::new(),
            }),
            processes,
            events: rx,
            stopping: false,
        }
    }

    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.shared.ctx
    }

    /// The subscription list managers reconcile against.
    pub fn subscriptions(&self) -> &Arc<RwLock<Vec<Subscription>>> {
        &self.shared.subscriptions
    }

    /// Run until `shutdown` completes, then stop every worker.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let settings = &self.shared.settings;
        info!(
            capacity = self.shared.ctx.capacity(),
            subscriptions = self.shared.subscriptions.read().len(),
            naptime_ms = settings.naptime.as_millis() as u64,
            proto_format = %settings.negotiated.proto_format,
            "Supervisor started"
        );

        let mut naptime = tokio::time::interval(settings.naptime);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = naptime.tick() => self.start_managers(),
                _ = self.processes.wakeup.notified() => {
                    self.start_managers();
                    self.shared.manager_wake.notify_waiters();
                }
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn start_managers(&self) {
        let databases: BTreeSet<Oid> = self
            .shared
            .subscriptions
            .read()
            .iter()
            .map(|s| s.dboid)
            .collect();

        for dboid in databases {
            match ensure_manager(&self.shared.ctx, dboid) {
                Ok(Some(worker)) => debug!(dboid, worker = %worker, "Launched manager"),
                Ok(None) => {}
                Err(CoreError::NoFreeSlot { capacity }) => {
                    warn!(dboid, capacity, "No free worker slot for manager")
                }
                Err(e) => warn!(dboid, error = %e, "Failed to launch manager"),
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Spawn {
                worker,
                desc,
                handle,
            } => {
                let stop = match self.processes.stop_signal(handle) {
                    Some(stop) if !self.stopping => stop,
                    _ => {
                        debug!(worker = %worker, "Not starting worker during shutdown");
                        self.processes.exited(worker, handle, Ok(()));
                        return;
                    }
                };

                let shared = Arc::clone(&self.shared);
                let processes = Arc::clone(&self.processes);
                tokio::spawn(async move {
                    let result = run_worker(&shared, worker, desc, handle, &stop)
                        .await
                        .map_err(|e| format!("{:#}", e));
                    processes.exited(worker, handle, result);
                });
            }
            WorkerEvent::Exited {
                worker,
                handle,
                result,
            } => self.reap(worker, handle, result),
        }
    }

    fn reap(&self, worker: WorkerRef, handle: ProcessHandle, result: std::result::Result<(), String>) {
        let ctx = &self.shared.ctx;
        match result {
            Ok(()) => {
                debug!(worker = %worker, process = %handle, "Worker exited");
                if let Err(e) = ctx.detach(worker) {
                    debug!(worker = %worker, error = %e, "Slot already released");
                }
            }
            Err(message) => {
                error!(worker = %worker, process = %handle, error = %message, "Worker failed");
                if let Err(e) = ctx.mark_crashed(worker, Utc::now()) {
                    debug!(worker = %worker, error = %e, "Slot already released");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stopping = true;
        info!(running = self.processes.running_count(), "Stopping workers");
        self.processes.terminate_all();

        let deadline = tokio::time::sleep(SHUTDOWN_TIMEOUT);
        tokio::pin!(deadline);

        while self.processes.running_count() > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining = self.processes.running_count(), "Workers did not stop in time");
                    break;
                }
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        info!("Supervisor stopped");
    }
}

async fn run_worker(
    shared: &Shared,
    worker: WorkerRef,
    desc: WorkerDescriptor,
    handle: ProcessHandle,
    stop: &Notify,
) -> Result<()> {
    shared.ctx.attach(worker, desc.worker_type(), handle)?;

    match desc.kind {
        WorkerKind::Manager => run_manager(shared, desc.dboid, stop).await,
        WorkerKind::Apply(_) => run_apply(shared, worker, desc.dboid, stop).await,
        WorkerKind::Sync(sync) => run_sync(shared, worker, desc.dboid, sync, stop).await,
    }
}

async fn run_manager(shared: &Shared, dboid: Oid, stop: &Notify) -> Result<()> {
    let manager = Manager::new(Arc::clone(&shared.ctx), dboid, shared.settings.restart_delay);
    let mut ticker = tokio::time::interval(shared.settings.naptime);
    info!(dboid, "Manager started");

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = ticker.tick() => {}
            _ = shared.manager_wake.notified() => {}
        }

        // Sync workers clear their table and release their slot under the
        // write lock, so a tick never sees one without the other.
        let subscriptions = shared.subscriptions.read();
        manager.tick(&subscriptions, Utc::now());
    }

    info!(dboid, "Manager stopped");
    Ok(())
}

async fn run_apply(shared: &Shared, worker: WorkerRef, dboid: Oid, stop: &Notify) -> Result<()> {
    let negotiated = &shared.settings.negotiated;
    let mut session =
        ApplySession::new(Arc::clone(&shared.ctx), worker, negotiated, MemorySink::new())?;

    if let Some(events) = &shared.settings.stream {
        let mut output = OutputSession::new(Arc::clone(&shared.ctx), dboid, negotiated);

        'replay: for event in events.iter() {
            for frame in output.encode(event)? {
                if let ApplyProgress::StopReached(lsn) = session.apply(&frame)? {
                    info!(worker = %worker, stop_lsn = %format_lsn(lsn), "Reached replay stop position");
                    break 'replay;
                }
            }
            tokio::task::yield_now().await;
        }

        info!(
            worker = %worker,
            last_commit = %session.last_commit_lsn().map(format_lsn).unwrap_or_default(),
            "Apply worker caught up"
        );
    }

    stop.notified().await;
    Ok(())
}

async fn run_sync(
    shared: &Shared,
    worker: WorkerRef,
    dboid: Oid,
    sync: SyncWorker,
    stop: &Notify,
) -> Result<()> {
    let subid = sync.apply.subid;
    info!(worker = %worker, subid, table = %format!("{}.{}", sync.nspname, sync.relname), "Starting initial copy");

    tokio::select! {
        _ = stop.notified() => return Ok(()),
        _ = tokio::time::sleep(shared.settings.sync_copy_time) => {}
    }

    {
        let mut subscriptions = shared.subscriptions.write();
        if let Some(sub) = subscriptions.iter_mut().find(|s| s.id == subid) {
            sub.pending_sync
                .retain(|(nspname, relname)| !sync.matches(nspname, relname));
        }
        shared.ctx.detach(worker)?;
    }
    if let Some(apply) = shared.ctx.apply_find(dboid, subid) {
        shared.ctx.set_sync_pending(apply.worker_ref(), true)?;
    }
    shared.ctx.subscription_changed(dboid, Some(subid), false);

    info!(worker = %worker, subid, "Finished initial copy");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use logrep_core::{
        ChangeKind, ColumnDesc, Datum, RelationDesc, ReplicaIdentity, RowImage, StatsCounter, StatsKey,
        TxnHandle,
    };
    use logrep_proto::{negotiate, ServerCapabilities, StartupParams};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn settings(stream: Option<Vec<ChangeEvent>>) -> WorkerSettings {
        WorkerSettings {
            naptime: Duration::from_millis(10),
            restart_delay: Duration::from_millis(50),
            sync_copy_time: Duration::from_millis(30),
            negotiated: negotiate(&StartupParams::default(), &ServerCapabilities::default())
                .unwrap(),
            stream: stream.map(Arc::new),
        }
    }

    fn start(
        subscriptions: Vec<Subscription>,
        settings: WorkerSettings,
    ) -> (
        Arc<ReplicationContext>,
        Arc<RwLock<Vec<Subscription>>>,
        oneshot::Sender<()>,
        JoinHandle<Result<()>>,
    ) {
        let config = ContextConfig {
            max_workers: 4,
            ..Default::default()
        };
        let supervisor = Supervisor::new(&config, subscriptions, settings);
        let ctx = Arc::clone(supervisor.context());
        let subs = Arc::clone(supervisor.subscriptions());
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(supervisor.run(async {
            rx.await.ok();
        }));
        (ctx, subs, tx, task)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn users() -> RelationDesc {
        RelationDesc {
            relid: 16384,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: vec![ColumnDesc::new("id", 23).key(), ColumnDesc::new("email", 25)],
        }
    }

    fn txn() -> TxnHandle {
        TxnHandle {
            xid: 900,
            final_lsn: 0x1_0000_0028,
            commit_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            origin: None,
        }
    }

    fn insert(new: Option<RowImage>) -> ChangeEvent {
        ChangeEvent::Change {
            kind: ChangeKind::Insert,
            relation: users(),
            old: None,
            new,
        }
    }

    #[tokio::test]
    async fn test_supervisor_runs_subscription_workers() {
        let mut sub = Subscription::new(42, "orders", 7);
        sub.pending_sync = vec![("shop".to_string(), "orders".to_string())];
        let (ctx, subs, tx, task) = start(vec![sub], settings(None));

        wait_for("manager and apply worker", || {
            ctx.manager_find(7).is_some() && ctx.apply_find(7, 42).is_some()
        })
        .await;

        // The sync worker finishes its copy and is not restarted.
        wait_for("initial copy", || subs.read()[0].pending_sync.is_empty()).await;
        wait_for("sync worker released", || ctx.sync_find_all(7, 42).is_empty()).await;
        let apply = ctx.apply_find(7, 42).unwrap();
        assert!(apply.apply().unwrap().sync_pending);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(ctx.workers().iter().all(|w| w.is_free()));
    }

    #[tokio::test]
    async fn test_finished_sync_releases_slot_with_table() {
        let mut sub = Subscription::new(42, "orders", 7);
        sub.pending_sync = vec![("shop".to_string(), "orders".to_string())];
        let (ctx, subs, tx, task) = start(vec![sub], settings(None));

        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let (pending, syncs) = {
                let guard = subs.read();
                (guard[0].pending_sync.len(), ctx.sync_find_all(7, 42))
            };
            seen.extend(syncs.iter().map(|w| w.worker_ref()));
            if pending == 0 {
                assert!(syncs.is_empty(), "sync worker outlived its table");
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(subs.read()[0].pending_sync.is_empty());

        // A few more manager passes must not start another copy.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.sync_find_all(7, 42).is_empty());
        assert!(seen.len() <= 1);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabling_subscription_stops_apply_worker() {
        let (ctx, subs, tx, task) = start(vec![Subscription::new(42, "orders", 7)], settings(None));
        wait_for("apply worker", || ctx.apply_find(7, 42).is_some()).await;

        subs.write()[0].enabled = false;
        ctx.subscription_changed(7, Some(42), false);
        wait_for("apply worker stopped", || ctx.apply_find(7, 42).is_none()).await;
        assert!(ctx.manager_find(7).is_some());

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_apply_worker_replays_stream() {
        let row = RowImage::new(vec![Datum::text("1"), Datum::text("ada@example.com")]);
        let stream = vec![
            ChangeEvent::Begin(txn()),
            insert(Some(row)),
            ChangeEvent::Commit {
                txn: txn(),
                commit_lsn: 0x1_0000_0040,
            },
        ];
        let (ctx, _, tx, task) = start(vec![Subscription::new(42, "orders", 7)], settings(Some(stream)));

        let key = StatsKey::subscriber(7, 42, 16384);
        wait_for("applied insert", || ctx.stats().get(&key).is_some()).await;
        assert_eq!(ctx.stats().get(&key).unwrap().get(StatsCounter::Insert), 1);
        wait_for("commit recorded", || {
            ctx.apply_find(7, 42)
                .and_then(|w| w.apply().and_then(|a| a.last_ts))
                .is_some()
        })
        .await;

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_apply_worker_is_restarted() {
        // An insert without a row image makes every apply attempt fail.
        let stream = vec![ChangeEvent::Begin(txn()), insert(None)];
        let (ctx, _, tx, task) = start(vec![Subscription::new(42, "orders", 7)], settings(Some(stream)));

        let mut first = None;
        for _ in 0..200 {
            first = ctx
                .workers()
                .into_iter()
                .find(|w| w.crashed_at().is_some())
                .map(|w| w.worker_ref());
            if first.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let first = first.expect("no crash recorded");

        wait_for("replacement worker", || {
            ctx.apply_find(7, 42)
                .map_or(false, |w| w.worker_ref() != first)
        })
        .await;

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
