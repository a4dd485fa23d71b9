use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog object identifier (database, subscription, relation).
pub type Oid = u32;

/// Log sequence number: monotonic position in the upstream change log.
pub type Lsn = u64;

/// Replication origin identifier.
pub type RepOriginId = u16;

/// Placeholder for "no object".
pub const INVALID_OID: Oid = 0;

/// A single column value in a row image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datum {
    Null,
    /// TOASTed value that did not change and was not sent.
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl Datum {
    pub fn text(s: impl Into<String>) -> Self {
        Datum::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

/// A full row image, one datum per relation column in attribute order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage {
    pub values: Vec<Datum>,
}

impl RowImage {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<Datum> for RowImage {
    fn from_iter<I: IntoIterator<Item = Datum>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Which old-row columns the upstream logs for updates and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaIdentity {
    /// Primary key or unique index.
    #[default]
    Default,
    Nothing,
    /// All columns.
    Full,
    Index,
}

impl ReplicaIdentity {
    pub fn as_byte(self) -> u8 {
        match self {
            ReplicaIdentity::Default => b'd',
            ReplicaIdentity::Nothing => b'n',
            ReplicaIdentity::Full => b'f',
            ReplicaIdentity::Index => b'i',
        }
    }
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

/// Column metadata as resolved by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: Oid,
    #[serde(default = "default_type_modifier")]
    pub type_modifier: i32,
    /// Part of the replica identity key.
    #[serde(default)]
    pub is_key: bool,
}

fn default_type_modifier() -> i32 {
    -1
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
            type_modifier: -1,
            is_key: false,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }
}

/// Table handle: a relation with its resolved column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDesc {
    pub relid: Oid,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnDesc>,
}

impl RelationDesc {
    /// Qualified "schema.table" name for logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// Upstream origin of a replicated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginInfo {
    pub name: String,
    pub lsn: Lsn,
}

/// Transaction handle shared by the begin and commit events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnHandle {
    pub xid: u32,
    /// LSN of the commit record.
    pub final_lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginInfo>,
}

/// The type of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// An event produced by the change-capture collaborator.
///
/// Within one transaction events arrive as begin, changes, commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Begin(TxnHandle),
    Change {
        kind: ChangeKind,
        relation: RelationDesc,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<RowImage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new: Option<RowImage>,
    },
    Commit {
        txn: TxnHandle,
        /// End position of the commit record.
        commit_lsn: Lsn,
    },
}
