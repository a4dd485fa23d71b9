pub mod context;
pub mod error;
pub mod lsn;
pub mod manager;
pub mod process;
pub mod stats;
pub mod types;
pub mod worker;

pub use context::{ContextConfig, ReplicationContext};
pub use error::{Error, Result};
pub use lsn::{format_lsn, from_pg_micros, parse_lsn, to_pg_micros};
pub use manager::{ensure_manager, Manager, ReconcileReport, Subscription};
pub use process::{MockProcesses, ProcessControl, ProcessHandle};
pub use stats::{
    stats_max_entries, StatsCounter, StatsKey, StatsSnapshot, StatsTable, NUM_COUNTERS,
};
pub use types::{
    ChangeEvent, ChangeKind, ColumnDesc, Datum, Lsn, Oid, OriginInfo, RelationDesc,
    ReplicaIdentity, RepOriginId, RowImage, TxnHandle, INVALID_OID,
};
pub use worker::{
    worker_type_name, ApplyWorker, SyncWorker, Worker, WorkerDescriptor, WorkerKind, WorkerRef,
    WorkerSlot, WorkerType,
};
