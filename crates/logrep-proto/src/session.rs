//! Sending and receiving ends of a replication session.
//!
//! [`OutputSession`] turns change-capture events into protocol frames on
//! the sender. [`ApplySession`] consumes frames in an apply or sync worker
//! and writes rows through a [`RowSink`]. Both count rows in the shared
//! stats table.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use logrep_core::{
    ChangeEvent, ChangeKind, Datum, Error as CoreError, Lsn, Oid, RelationDesc,
    ReplicationContext, RowImage, StatsCounter, StatsKey, WorkerRef, WorkerType,
};
use tracing::{debug, info, trace};

use crate::decode::{BeginMessage, DecodedMessage, Decoder, OriginMessage};
use crate::error::{ProtoError, ProtoResult};
use crate::proto::negotiate::Negotiated;
use crate::proto::ProtoApi;

/// Encodes one sender's change stream.
pub struct OutputSession {
    api: Arc<dyn ProtoApi>,
    ctx: Arc<ReplicationContext>,
    dboid: Oid,
    forward_origins: bool,
    column_filters: HashMap<Oid, Vec<usize>>,
    /// Relation definitions already sent, by relid.
    sent: HashMap<Oid, RelationDesc>,
}

impl OutputSession {
    pub fn new(ctx: Arc<ReplicationContext>, dboid: Oid, negotiated: &Negotiated) -> Self {
        Self {
            api: negotiated.api(),
            ctx,
            dboid,
            forward_origins: negotiated.forward_changeset_origins,
            column_filters: HashMap::new(),
            sent: HashMap::new(),
        }
    }

    /// Only replicate the given attribute indexes of a relation.
    pub fn with_column_filter(mut self, relid: Oid, columns: Vec<usize>) -> Self {
        self.column_filters.insert(relid, columns);
        self
    }

    /// Startup reply frame for the negotiated session.
    pub fn startup_message(&self, negotiated: &Negotiated) -> ProtoResult<Bytes> {
        let mut out = BytesMut::new();
        self.api
            .write_startup_message(&mut out, &negotiated.reply_params())?;
        Ok(out.freeze())
    }

    /// Forget that a relation was sent, so its definition goes out again
    /// before its next row.
    pub fn invalidate(&mut self, relid: Oid) {
        self.sent.remove(&relid);
    }

    /// Encode one event. A change may produce a relation frame ahead of the
    /// row frame; a begin may be followed by an origin frame.
    pub fn encode(&mut self, event: &ChangeEvent) -> ProtoResult<Vec<Bytes>> {
        let mut frames = Vec::new();

        match event {
            ChangeEvent::Begin(txn) => {
                frames.push(self.frame(|api, out| api.write_begin(out, txn))?);
                if let Some(origin) = txn.origin.as_ref().filter(|_| self.forward_origins) {
                    frames.push(
                        self.frame(|api, out| api.write_origin(out, &origin.name, origin.lsn))?,
                    );
                }
            }
            ChangeEvent::Commit { txn, commit_lsn } => {
                frames.push(self.frame(|api, out| api.write_commit(out, txn, *commit_lsn))?);
            }
            ChangeEvent::Change {
                kind,
                relation,
                old,
                new,
            } => {
                let columns = self.column_filters.get(&relation.relid).cloned();
                let columns = columns.as_deref();

                let needs_rel = self.sent.get(&relation.relid) != Some(relation);
                if needs_rel {
                    debug!(relation = %relation.qualified_name(), "Sending relation definition");
                    frames.push(self.frame(|api, out| api.write_rel(out, relation, columns))?);
                }

                let row = match kind {
                    ChangeKind::Insert => {
                        let new = required(new.as_ref(), "insert", "new")?;
                        self.frame(|api, out| api.write_insert(out, relation, new, columns))?
                    }
                    ChangeKind::Update => {
                        let new = required(new.as_ref(), "update", "new")?;
                        self.frame(|api, out| {
                            api.write_update(out, relation, old.as_ref(), new, columns)
                        })?
                    }
                    ChangeKind::Delete => {
                        let old = required(old.as_ref(), "delete", "old")?;
                        self.frame(|api, out| api.write_delete(out, relation, old, columns))?
                    }
                };
                frames.push(row);

                // The relation only counts as sent once its row frame exists.
                if needs_rel {
                    self.sent.insert(relation.relid, relation.clone());
                }

                self.ctx.stats().increment(
                    StatsKey::sender(self.dboid, relation.relid),
                    StatsCounter::from(*kind),
                    1,
                );
            }
        }

        Ok(frames)
    }

    fn frame<F>(&self, write: F) -> ProtoResult<Bytes>
    where
        F: FnOnce(&dyn ProtoApi, &mut BytesMut) -> ProtoResult<()>,
    {
        let mut out = BytesMut::new();
        write(self.api.as_ref(), &mut out)?;
        Ok(out.freeze())
    }
}

fn required<'a>(row: Option<&'a RowImage>, kind: &str, image: &str) -> ProtoResult<&'a RowImage> {
    row.ok_or_else(|| ProtoError::InvalidEvent(format!("{} without {} row", kind, image)))
}

/// Result of applying one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The local row disagreed with the incoming change.
    Conflict,
    /// The change was already present locally.
    DuplicateSkipped,
}

/// Local table storage written by apply workers.
pub trait RowSink {
    fn insert(&mut self, rel: &RelationDesc, new: &RowImage) -> ProtoResult<ApplyOutcome>;

    fn update(
        &mut self,
        rel: &RelationDesc,
        old: Option<&RowImage>,
        new: &RowImage,
    ) -> ProtoResult<ApplyOutcome>;

    fn delete(&mut self, rel: &RelationDesc, old: &RowImage) -> ProtoResult<ApplyOutcome>;
}

/// Whether the apply loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyProgress {
    Continue,
    /// The worker's replay stop position was reached at this commit.
    StopReached(Lsn),
}

/// Applies one subscription's stream on behalf of a registered worker.
pub struct ApplySession<S> {
    ctx: Arc<ReplicationContext>,
    worker: WorkerRef,
    dboid: Oid,
    subid: Oid,
    replay_stop_lsn: Option<Lsn>,
    decoder: Decoder,
    sink: S,
    txn: Option<BeginMessage>,
    remote_origin: Option<OriginMessage>,
    last_commit_lsn: Option<Lsn>,
}

impl<S: RowSink> ApplySession<S> {
    /// Bind a session to an apply or sync worker's slot.
    pub fn new(
        ctx: Arc<ReplicationContext>,
        worker: WorkerRef,
        negotiated: &Negotiated,
        sink: S,
    ) -> ProtoResult<Self> {
        let current = ctx.resolve(worker)?;
        let apply = current.apply().ok_or(CoreError::WorkerTypeMismatch {
            slot: worker.slot(),
            expected: WorkerType::Apply,
            found: current.worker_type(),
        })?;

        Ok(Self {
            dboid: current.dboid(),
            subid: apply.subid,
            replay_stop_lsn: apply.replay_stop_lsn,
            ctx,
            worker,
            decoder: Decoder::new(negotiated.proto_format),
            sink,
            txn: None,
            remote_origin: None,
            last_commit_lsn: None,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// End position of the last applied commit.
    pub fn last_commit_lsn(&self) -> Option<Lsn> {
        self.last_commit_lsn
    }

    /// Whether the replay stop position has already been passed.
    pub fn is_stopped(&self) -> bool {
        match (self.replay_stop_lsn, self.last_commit_lsn) {
            (Some(stop), Some(last)) => last >= stop,
            _ => false,
        }
    }

    /// Decode and apply one frame.
    pub fn apply(&mut self, frame: &[u8]) -> ProtoResult<ApplyProgress> {
        if let (true, Some(last)) = (self.is_stopped(), self.last_commit_lsn) {
            trace!(worker = %self.worker, "Replay already stopped, ignoring frame");
            return Ok(ApplyProgress::StopReached(last));
        }

        match self.decoder.decode(frame)? {
            DecodedMessage::Startup { params, .. } => {
                debug!(worker = %self.worker, params = params.len(), "Received startup reply");
            }
            DecodedMessage::Relation(rel) => {
                debug!(worker = %self.worker, relation = %rel.qualified_name(), "Received relation");
            }
            DecodedMessage::Begin(begin) => {
                trace!(worker = %self.worker, xid = begin.xid, "Begin remote transaction");
                self.txn = Some(begin);
            }
            DecodedMessage::Origin(origin) => {
                self.remote_origin = Some(origin);
            }
            DecodedMessage::Insert { relid, new } => {
                self.apply_row(relid, ChangeKind::Insert, |sink, rel| sink.insert(rel, &new))?;
            }
            DecodedMessage::Update { relid, old, new } => {
                self.apply_row(relid, ChangeKind::Update, |sink, rel| {
                    sink.update(rel, old.as_ref(), &new)
                })?;
            }
            DecodedMessage::Delete { relid, old } => {
                self.apply_row(relid, ChangeKind::Delete, |sink, rel| sink.delete(rel, &old))?;
            }
            DecodedMessage::Commit(commit) => {
                let begin = self.txn.take().ok_or_else(|| {
                    ProtoError::Decode("commit without a begin".to_string())
                })?;
                self.ctx.record_commit(self.worker, commit.commit_time)?;
                self.last_commit_lsn = Some(commit.end_lsn);
                let origin = self.remote_origin.take();

                trace!(
                    worker = %self.worker,
                    xid = begin.xid,
                    origin = ?origin.map(|o| o.origin_name),
                    "Committed remote transaction"
                );

                if self.is_stopped() {
                    info!(
                        worker = %self.worker,
                        end_lsn = %logrep_core::format_lsn(commit.end_lsn),
                        "Reached replay stop position"
                    );
                    return Ok(ApplyProgress::StopReached(commit.end_lsn));
                }
            }
        }

        Ok(ApplyProgress::Continue)
    }

    fn apply_row<F>(&mut self, relid: Oid, kind: ChangeKind, write: F) -> ProtoResult<()>
    where
        F: FnOnce(&mut S, &RelationDesc) -> ProtoResult<ApplyOutcome>,
    {
        if self.txn.is_none() {
            return Err(ProtoError::Decode(format!(
                "{} outside of a transaction",
                kind.as_str()
            )));
        }

        let rel = self.decoder.relations().require(relid)?;
        let outcome = write(&mut self.sink, rel)?;

        let counter = match outcome {
            ApplyOutcome::Applied => StatsCounter::from(kind),
            ApplyOutcome::Conflict => {
                debug!(worker = %self.worker, relation = %rel.qualified_name(), op = kind.as_str(), "Conflict");
                StatsCounter::Conflict
            }
            ApplyOutcome::DuplicateSkipped => StatsCounter::Dca,
        };

        self.ctx.stats().increment(
            StatsKey::subscriber(self.dboid, self.subid, relid),
            counter,
            1,
        );
        Ok(())
    }
}

/// In-memory [`RowSink`] keyed by the relation's key columns.
///
/// Conflicts resolve as "incoming change wins".
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: HashMap<Oid, Vec<RowImage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, relid: Oid) -> &[RowImage] {
        self.tables.get(&relid).map(Vec::as_slice).unwrap_or(&[])
    }

    fn position(&self, rel: &RelationDesc, probe: &RowImage) -> Option<usize> {
        let key = key_of(rel, probe);
        self.rows(rel.relid)
            .iter()
            .position(|row| key_of(rel, row) == key)
    }
}

/// Values of the key columns, or of every column when the relation has no
/// key.
fn key_of<'a>(rel: &RelationDesc, row: &'a RowImage) -> Vec<&'a Datum> {
    let has_key = rel.columns.iter().any(|c| c.is_key);
    rel.columns
        .iter()
        .zip(&row.values)
        .filter(|(col, _)| col.is_key || !has_key)
        .map(|(_, value)| value)
        .collect()
}

/// Fill unchanged values of `new` from the stored row.
fn merge_unchanged(stored: &RowImage, new: &RowImage) -> RowImage {
    new.values
        .iter()
        .zip(&stored.values)
        .map(|(n, s)| match n {
            Datum::Unchanged => s.clone(),
            other => other.clone(),
        })
        .collect()
}

impl RowSink for MemorySink {
    fn insert(&mut self, rel: &RelationDesc, new: &RowImage) -> ProtoResult<ApplyOutcome> {
        match self.position(rel, new) {
            Some(i) => {
                let rows = self.tables.entry(rel.relid).or_default();
                if &rows[i] == new {
                    Ok(ApplyOutcome::DuplicateSkipped)
                } else {
                    rows[i] = new.clone();
                    Ok(ApplyOutcome::Conflict)
                }
            }
            None => {
                self.tables.entry(rel.relid).or_default().push(new.clone());
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn update(
        &mut self,
        rel: &RelationDesc,
        old: Option<&RowImage>,
        new: &RowImage,
    ) -> ProtoResult<ApplyOutcome> {
        match self.position(rel, old.unwrap_or(new)) {
            Some(i) => {
                let rows = self.tables.entry(rel.relid).or_default();
                let merged = merge_unchanged(&rows[i], new);
                if rows[i] == merged {
                    return Ok(ApplyOutcome::DuplicateSkipped);
                }
                rows[i] = merged;
                Ok(ApplyOutcome::Applied)
            }
            None => {
                self.tables.entry(rel.relid).or_default().push(new.clone());
                Ok(ApplyOutcome::Conflict)
            }
        }
    }

    fn delete(&mut self, rel: &RelationDesc, old: &RowImage) -> ProtoResult<ApplyOutcome> {
        match self.position(rel, old) {
            Some(i) => {
                self.tables.entry(rel.relid).or_default().remove(i);
                Ok(ApplyOutcome::Applied)
            }
            None => Ok(ApplyOutcome::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::negotiate::{negotiate, ServerCapabilities, StartupParams};
    use crate::proto::test_support::*;
    use crate::proto::ProtoFormat;
    use logrep_core::{ContextConfig, MockProcesses, WorkerDescriptor};

    fn context() -> Arc<ReplicationContext> {
        Arc::new(ReplicationContext::new(
            &ContextConfig::default(),
            Arc::new(MockProcesses::new()),
        ))
    }

    fn negotiated(format: ProtoFormat, forward: bool) -> Negotiated {
        let params = StartupParams {
            proto_format: format,
            forward_changeset_origins: forward,
            ..Default::default()
        };
        negotiate(&params, &ServerCapabilities::default()).unwrap()
    }

    fn insert(id: &str, name: &str) -> ChangeEvent {
        ChangeEvent::Change {
            kind: ChangeKind::Insert,
            relation: users(),
            old: None,
            new: Some(row(id, Some(name))),
        }
    }

    #[test]
    fn test_relation_sent_once_per_definition() {
        let ctx = context();
        let mut session = OutputSession::new(ctx, 7, &negotiated(ProtoFormat::Native, false));

        let frames = session.encode(&insert("1", "a")).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], b'R');
        assert_eq!(frames[1][0], b'I');

        assert_eq!(session.encode(&insert("2", "b")).unwrap().len(), 1);

        let mut changed = users();
        changed.columns.pop();
        let event = ChangeEvent::Change {
            kind: ChangeKind::Insert,
            relation: changed,
            old: None,
            new: Some(RowImage::new(vec![Datum::text("3"), Datum::Null])),
        };
        assert_eq!(session.encode(&event).unwrap().len(), 2);

        session.invalidate(16384);
        assert_eq!(session.encode(&event).unwrap().len(), 2);
    }

    #[test]
    fn test_origin_forwarded_only_when_negotiated() {
        let begin = ChangeEvent::Begin(txn());

        let mut plain = OutputSession::new(context(), 7, &negotiated(ProtoFormat::Native, false));
        assert_eq!(plain.encode(&begin).unwrap().len(), 1);

        let mut forwarding =
            OutputSession::new(context(), 7, &negotiated(ProtoFormat::Native, true));
        let frames = forwarding.encode(&begin).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][0], b'O');
    }

    #[test]
    fn test_output_counts_sent_rows() {
        let ctx = context();
        let mut session =
            OutputSession::new(Arc::clone(&ctx), 7, &negotiated(ProtoFormat::Json, false));

        session.encode(&insert("1", "a")).unwrap();
        session.encode(&insert("2", "b")).unwrap();
        session
            .encode(&ChangeEvent::Change {
                kind: ChangeKind::Delete,
                relation: users(),
                old: Some(row("1", Some("a"))),
                new: None,
            })
            .unwrap();

        let stats = ctx.stats().get(&StatsKey::sender(7, 16384)).unwrap();
        assert_eq!(stats.get(StatsCounter::Insert), 2);
        assert_eq!(stats.get(StatsCounter::Delete), 1);
    }

    #[test]
    fn test_missing_row_image() {
        let mut session = OutputSession::new(context(), 7, &negotiated(ProtoFormat::Native, false));
        let event = ChangeEvent::Change {
            kind: ChangeKind::Delete,
            relation: users(),
            old: None,
            new: None,
        };
        assert!(matches!(
            session.encode(&event),
            Err(ProtoError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_apply_session_requires_apply_worker() {
        let ctx = context();
        let manager = ctx.register(WorkerDescriptor::manager(7)).unwrap();
        let result = ApplySession::new(
            ctx,
            manager,
            &negotiated(ProtoFormat::Native, false),
            MemorySink::new(),
        );
        assert!(matches!(
            result,
            Err(ProtoError::Core(CoreError::WorkerTypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_row_outside_transaction() {
        let ctx = context();
        let worker = ctx.register(WorkerDescriptor::apply(7, 42)).unwrap();
        let negotiated = negotiated(ProtoFormat::Native, false);
        let mut output = OutputSession::new(Arc::clone(&ctx), 7, &negotiated);
        let mut apply = ApplySession::new(ctx, worker, &negotiated, MemorySink::new()).unwrap();

        let frames = output.encode(&insert("1", "a")).unwrap();
        apply.apply(&frames[0]).unwrap();
        assert!(matches!(apply.apply(&frames[1]), Err(ProtoError::Decode(_))));
    }

    #[test]
    fn test_relation_resent_after_failed_encode() {
        let ctx = context();
        let worker = ctx.register(WorkerDescriptor::apply(7, 42)).unwrap();
        let negotiated = negotiated(ProtoFormat::Native, false);
        let mut output = OutputSession::new(Arc::clone(&ctx), 7, &negotiated);
        let mut apply = ApplySession::new(ctx, worker, &negotiated, MemorySink::new()).unwrap();

        let short = ChangeEvent::Change {
            kind: ChangeKind::Insert,
            relation: users(),
            old: None,
            new: Some(RowImage::new(vec![Datum::text("1")])),
        };
        assert!(matches!(
            output.encode(&short),
            Err(ProtoError::RowShape {
                expected: 3,
                found: 1,
                ..
            })
        ));

        let mut frames = output.encode(&ChangeEvent::Begin(txn())).unwrap();
        let change = output.encode(&insert("1", "a")).unwrap();
        assert_eq!(change.len(), 2);
        assert_eq!(change[0][0], b'R');
        frames.extend(change);

        for frame in &frames {
            apply.apply(frame).unwrap();
        }
        assert_eq!(apply.sink().rows(16384), &[row("1", Some("a"))]);
    }

    #[test]
    fn test_memory_sink_outcomes() {
        let rel = users();
        let mut sink = MemorySink::new();

        assert_eq!(sink.insert(&rel, &row("1", Some("a"))).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            sink.insert(&rel, &row("1", Some("a"))).unwrap(),
            ApplyOutcome::DuplicateSkipped
        );
        assert_eq!(sink.insert(&rel, &row("1", Some("b"))).unwrap(), ApplyOutcome::Conflict);
        assert_eq!(sink.rows(16384), &[row("1", Some("b"))]);

        let mut partial = row("1", Some("c"));
        partial.values[2] = Datum::Unchanged;
        assert_eq!(sink.update(&rel, None, &partial).unwrap(), ApplyOutcome::Applied);
        assert_eq!(sink.rows(16384), &[row("1", Some("c"))]);

        assert_eq!(sink.delete(&rel, &row("2", None)).unwrap(), ApplyOutcome::Conflict);
        assert_eq!(sink.delete(&rel, &row("1", None)).unwrap(), ApplyOutcome::Applied);
        assert!(sink.rows(16384).is_empty());
    }
}
