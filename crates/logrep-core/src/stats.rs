//! Per-relation replication counters.
//!
//! Entries are keyed by (database, subscription, relation) and created on
//! first use. The table lock only guards the map structure; counters are
//! bumped under each entry's own mutex, so workers replicating different
//! relations never wait on each other. Lock order is always table, then
//! entry.
//!
//! The table is bounded. Once full, increments for unknown keys are
//! dropped and [`StatsTable::is_full`] stays set until the next prune or
//! reset.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::types::{ChangeKind, Oid};

/// Number of counters kept per entry.
pub const NUM_COUNTERS: usize = 5;

/// Entries allowed per configured worker when no explicit bound is set.
pub const ENTRIES_PER_WORKER: usize = 1000;

/// Kind of counter within an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsCounter {
    Insert = 0,
    Update,
    Delete,
    Conflict,
    /// Duplicate change avoided.
    Dca,
}

impl StatsCounter {
    pub const ALL: [StatsCounter; NUM_COUNTERS] = [
        StatsCounter::Insert,
        StatsCounter::Update,
        StatsCounter::Delete,
        StatsCounter::Conflict,
        StatsCounter::Dca,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatsCounter::Insert => "n_tup_ins",
            StatsCounter::Update => "n_tup_upd",
            StatsCounter::Delete => "n_tup_del",
            StatsCounter::Conflict => "n_conflict",
            StatsCounter::Dca => "n_dca",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl From<ChangeKind> for StatsCounter {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => StatsCounter::Insert,
            ChangeKind::Update => StatsCounter::Update,
            ChangeKind::Delete => StatsCounter::Delete,
        }
    }
}

/// Identity of one counter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatsKey {
    pub dboid: Oid,
    /// `None` for the sending side's own counters.
    pub subid: Option<Oid>,
    pub relid: Oid,
}

impl StatsKey {
    /// Counters of the sending side.
    pub fn sender(dboid: Oid, relid: Oid) -> Self {
        Self {
            dboid,
            subid: None,
            relid,
        }
    }

    /// Counters of a subscription's apply side.
    pub fn subscriber(dboid: Oid, subid: Oid, relid: Oid) -> Self {
        Self {
            dboid,
            subid: Some(subid),
            relid,
        }
    }
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subid {
            Some(subid) => write!(f, "db {} sub {} rel {}", self.dboid, subid, self.relid),
            None => write!(f, "db {} sender rel {}", self.dboid, self.relid),
        }
    }
}

/// One row of counters with its own lock.
#[derive(Debug)]
pub struct StatsEntry {
    key: StatsKey,
    counters: Mutex<[i64; NUM_COUNTERS]>,
}

impl StatsEntry {
    fn new(key: StatsKey) -> Self {
        Self {
            key,
            counters: Mutex::new([0; NUM_COUNTERS]),
        }
    }

    pub fn key(&self) -> StatsKey {
        self.key
    }

    fn add(&self, counter: StatsCounter, delta: i64) {
        let mut counters = self.counters.lock();
        counters[counter.index()] = counters[counter.index()].saturating_add(delta);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            key: self.key,
            counters: *self.counters.lock(),
        }
    }
}

/// Copy of an entry's counters.
///
/// Copies of different entries are not taken atomically with each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub key: StatsKey,
    pub counters: [i64; NUM_COUNTERS],
}

impl StatsSnapshot {
    pub fn get(&self, counter: StatsCounter) -> i64 {
        self.counters[counter.index()]
    }
}

/// Default capacity: an explicit bound, or `ENTRIES_PER_WORKER` per worker
/// when the configured value is negative.
pub fn stats_max_entries(configured: i64, nworkers: usize) -> usize {
    if configured < 0 {
        ENTRIES_PER_WORKER * nworkers
    } else {
        configured as usize
    }
}

/// Bounded table of [`StatsEntry`] rows.
#[derive(Debug)]
pub struct StatsTable {
    entries: RwLock<HashMap<StatsKey, Arc<StatsEntry>>>,
    max_entries: usize,
    hash_full: AtomicBool,
    prune_interval: Option<Duration>,
    last_prune: Mutex<Option<DateTime<Utc>>>,
}

impl StatsTable {
    /// Create a table holding at most `max_entries` keys. A zero or absent
    /// prune interval disables periodic pruning.
    pub fn new(max_entries: usize, prune_interval: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            hash_full: AtomicBool::new(false),
            prune_interval: prune_interval.filter(|d| !d.is_zero()),
            last_prune: Mutex::new(None),
        }
    }

    /// Add `delta` to one counter of `key`, creating the entry if needed.
    ///
    /// Never fails: when the table is full and `key` is new, the increment
    /// is dropped and the full flag is raised.
    pub fn increment(&self, key: StatsKey, counter: StatsCounter, delta: i64) {
        let existing = self.entries.read().get(&key).cloned();
        if let Some(entry) = existing {
            entry.add(counter, delta);
            return;
        }

        let entry = {
            let mut entries = self.entries.write();
            // Another worker may have created it between the two locks.
            match entries.get(&key) {
                Some(entry) => Arc::clone(entry),
                None => {
                    if entries.len() >= self.max_entries {
                        drop(entries);
                        self.mark_full(key);
                        return;
                    }
                    debug!(key = %key, "Creating stats entry");
                    let entry = Arc::new(StatsEntry::new(key));
                    entries.insert(key, Arc::clone(&entry));
                    entry
                }
            }
        };

        entry.add(counter, delta);
    }

    fn mark_full(&self, key: StatsKey) {
        if !self.hash_full.swap(true, Ordering::Relaxed) {
            warn!(
                key = %key,
                max_entries = self.max_entries,
                "Stats table is full, dropping counters for new relations"
            );
        }
    }

    /// Whether increments have been dropped since the last prune or reset.
    pub fn is_full(&self) -> bool {
        self.hash_full.load(Ordering::Relaxed)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of one entry's counters.
    pub fn get(&self, key: &StatsKey) -> Option<StatsSnapshot> {
        let entry = self.entries.read().get(key).cloned();
        entry.map(|e| e.snapshot())
    }

    /// Copies of all entries, ordered by key.
    pub fn snapshot(&self) -> Vec<StatsSnapshot> {
        let entries: Vec<Arc<StatsEntry>> = self.entries.read().values().cloned().collect();
        let mut result: Vec<StatsSnapshot> = entries.iter().map(|e| e.snapshot()).collect();
        result.sort_by_key(|s| s.key);
        result
    }

    /// Remove every entry for which `keep` returns false and clear the full
    /// flag. Returns the number of removed entries.
    pub fn prune<F>(&self, now: DateTime<Utc>, mut keep: F) -> usize
    where
        F: FnMut(&StatsKey) -> bool,
    {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|key, _| keep(key));
            before - entries.len()
        };

        self.hash_full.store(false, Ordering::Relaxed);
        *self.last_prune.lock() = Some(now);

        info!(removed, remaining = self.len(), "Pruned stats table");
        removed
    }

    /// Prune when the configured interval has elapsed since the last prune.
    /// Returns the number of removed entries, or `None` if no prune was due.
    pub fn maybe_prune<F>(&self, now: DateTime<Utc>, keep: F) -> Option<usize>
    where
        F: FnMut(&StatsKey) -> bool,
    {
        let interval = self.prune_interval?;
        let due = match *self.last_prune.lock() {
            None => true,
            Some(last) => (now - last).to_std().map_or(false, |elapsed| elapsed >= interval),
        };

        if due {
            Some(self.prune(now, keep))
        } else {
            None
        }
    }

    pub fn last_prune(&self) -> Option<DateTime<Utc>> {
        *self.last_prune.lock()
    }

    /// Drop every entry and clear the full flag.
    pub fn reset(&self) {
        self.entries.write().clear();
        self.hash_full.store(false, Ordering::Relaxed);
        info!("Reset stats table");
    }
}
