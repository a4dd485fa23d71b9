//! Change-stream protocol writers.
//!
//! A [`ProtoApi`] implementation is picked once per session during the
//! startup handshake and shared read-only for the rest of it. Both formats
//! emit exactly one message per call.

pub mod json;
pub mod native;
pub mod negotiate;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use logrep_core::{Datum, Lsn, RelationDesc, RowImage, TxnHandle};

use crate::error::{ProtoError, ProtoResult};

pub use json::JsonProto;
pub use native::NativeProto;

/// Native protocol version, the greatest one this build speaks.
pub const PROTO_VERSION_NUM: u32 = 1;

/// Oldest protocol version still supported.
pub const PROTO_MIN_VERSION_NUM: u32 = 1;

/// Flat key/value startup parameters.
pub const STARTUP_PARAMS_FORMAT_FLAT: u32 = 1;

/// Flat key/value startup reply.
pub const STARTUP_REPLY_FORMAT_FLAT: u8 = 1;

/// Wire encoding of the change stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtoFormat {
    #[default]
    Native,
    Json,
}

impl ProtoFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtoFormat::Native => "native",
            ProtoFormat::Json => "json",
        }
    }
}

impl fmt::Display for ProtoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtoFormat {
    type Err = ProtoError;

    fn from_str(s: &str) -> ProtoResult<Self> {
        match s.to_lowercase().as_str() {
            "native" => Ok(ProtoFormat::Native),
            "json" => Ok(ProtoFormat::Json),
            _ => Err(ProtoError::UnknownProtoFormat(s.to_string())),
        }
    }
}

/// Serializers for every message of the change stream.
///
/// `columns` restricts relation and row messages to the listed attribute
/// indexes, in the listed order. `None` sends every column.
pub trait ProtoApi: Send + Sync {
    fn format(&self) -> ProtoFormat;

    fn write_startup_message(&self, out: &mut BytesMut, params: &[(String, String)])
        -> ProtoResult<()>;

    fn write_rel(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()>;

    fn write_begin(&self, out: &mut BytesMut, txn: &TxnHandle) -> ProtoResult<()>;

    /// `end_lsn` is the position just past the commit record.
    fn write_commit(&self, out: &mut BytesMut, txn: &TxnHandle, end_lsn: Lsn) -> ProtoResult<()>;

    fn write_origin(&self, out: &mut BytesMut, origin: &str, origin_lsn: Lsn) -> ProtoResult<()>;

    fn write_insert(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        new: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()>;

    fn write_update(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        old: Option<&RowImage>,
        new: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()>;

    fn write_delete(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        old: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()>;
}

/// Writer for a negotiated format.
pub fn init_api(format: ProtoFormat) -> Arc<dyn ProtoApi> {
    match format {
        ProtoFormat::Native => Arc::new(NativeProto),
        ProtoFormat::Json => Arc::new(JsonProto),
    }
}

/// Resolve a column filter against a relation.
pub(crate) fn selected_columns(
    rel: &RelationDesc,
    columns: Option<&[usize]>,
) -> ProtoResult<Vec<usize>> {
    let natts = rel.columns.len();
    match columns {
        None => Ok((0..natts).collect()),
        Some(columns) => {
            if let Some(&index) = columns.iter().find(|&&i| i >= natts) {
                return Err(ProtoError::UnknownColumn {
                    relation: rel.qualified_name(),
                    index,
                    natts,
                });
            }
            Ok(columns.to_vec())
        }
    }
}

/// Pick the filtered values of a row, checking its width first.
pub(crate) fn project_row<'a>(
    rel: &RelationDesc,
    row: &'a RowImage,
    columns: &[usize],
) -> ProtoResult<Vec<&'a Datum>> {
    if row.len() != rel.columns.len() {
        return Err(ProtoError::RowShape {
            relation: rel.qualified_name(),
            expected: rel.columns.len(),
            found: row.len(),
        });
    }
    Ok(columns.iter().map(|&i| &row.values[i]).collect())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use logrep_core::{ColumnDesc, OriginInfo, ReplicaIdentity};

    use super::*;

    pub fn users() -> RelationDesc {
        RelationDesc {
            relid: 16384,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: vec![
                ColumnDesc::new("id", 23).key(),
                ColumnDesc::new("name", 25),
                ColumnDesc::new("avatar", 17),
            ],
        }
    }

    pub fn row(id: &str, name: Option<&str>) -> RowImage {
        RowImage::new(vec![
            Datum::text(id),
            name.map_or(Datum::Null, Datum::text),
            Datum::Binary(vec![0xca, 0xfe]),
        ])
    }

    pub fn txn() -> TxnHandle {
        TxnHandle {
            xid: 731,
            final_lsn: 0x1_0000_0028,
            commit_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            origin: Some(OriginInfo {
                name: "node_a".to_string(),
                lsn: 0x2_0000_0010,
            }),
        }
    }
}
