//! Decoder for both wire formats.
//!
//! Decoding is stateful: relation messages are cached so later row
//! messages can be resolved (JSON rows are keyed by column name and need
//! the relation to restore column order).

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use logrep_core::{
    from_pg_micros, parse_lsn, ColumnDesc, Datum, Lsn, Oid, RelationDesc, ReplicaIdentity,
    RowImage,
};

use crate::error::{ProtoError, ProtoResult};
use crate::proto::json::{row_from_json, JsonMessage};
use crate::proto::native::ATTR_FLAG_KEY;
use crate::proto::{ProtoFormat, STARTUP_REPLY_FORMAT_FLAT};
use crate::relation_cache::RelationCache;

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    Startup {
        reply_format: u8,
        params: Vec<(String, String)>,
    },
    Relation(RelationDesc),
    Begin(BeginMessage),
    Commit(CommitMessage),
    Origin(OriginMessage),
    Insert {
        relid: Oid,
        new: RowImage,
    },
    Update {
        relid: Oid,
        old: Option<RowImage>,
        new: RowImage,
    },
    Delete {
        relid: Oid,
        old: RowImage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginMessage {
    pub final_lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMessage {
    pub origin_lsn: Lsn,
    pub origin_name: String,
}

/// Decoder for one session's message stream.
#[derive(Debug)]
pub struct Decoder {
    format: ProtoFormat,
    relations: RelationCache,
}

impl Decoder {
    pub fn new(format: ProtoFormat) -> Self {
        Self {
            format,
            relations: RelationCache::new(),
        }
    }

    pub fn format(&self) -> ProtoFormat {
        self.format
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    /// Decode one message.
    pub fn decode(&mut self, data: &[u8]) -> ProtoResult<DecodedMessage> {
        let msg = match self.format {
            ProtoFormat::Native => decode_native(data)?,
            ProtoFormat::Json => self.decode_json(data)?,
        };

        if let DecodedMessage::Relation(rel) = &msg {
            self.relations.update(rel.clone());
        }

        Ok(msg)
    }

    fn decode_json(&self, data: &[u8]) -> ProtoResult<DecodedMessage> {
        let msg: JsonMessage = serde_json::from_slice(data)?;

        Ok(match msg {
            JsonMessage::Startup { params } => DecodedMessage::Startup {
                reply_format: STARTUP_REPLY_FORMAT_FLAT,
                params: params.into_iter().collect(),
            },
            JsonMessage::Relation {
                relid,
                namespace,
                name,
                columns,
            } => DecodedMessage::Relation(RelationDesc {
                relid,
                namespace,
                name,
                replica_identity: ReplicaIdentity::Default,
                columns: columns
                    .into_iter()
                    .map(|c| ColumnDesc {
                        name: c.name,
                        type_oid: c.type_oid,
                        type_modifier: c.typmod,
                        is_key: c.key,
                    })
                    .collect(),
            }),
            JsonMessage::Begin {
                xid,
                final_lsn,
                commit_time,
            } => DecodedMessage::Begin(BeginMessage {
                final_lsn: parse_lsn(&final_lsn)?,
                commit_time,
                xid,
            }),
            JsonMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time,
            } => DecodedMessage::Commit(CommitMessage {
                flags: 0,
                commit_lsn: parse_lsn(&commit_lsn)?,
                end_lsn: parse_lsn(&end_lsn)?,
                commit_time,
            }),
            JsonMessage::Origin {
                origin_name,
                origin_lsn,
            } => DecodedMessage::Origin(OriginMessage {
                origin_lsn: parse_lsn(&origin_lsn)?,
                origin_name,
            }),
            JsonMessage::Insert { relid, newtuple } => {
                let rel = self.relations.require(relid)?;
                DecodedMessage::Insert {
                    relid,
                    new: row_from_json(rel, &newtuple)?,
                }
            }
            JsonMessage::Update {
                relid,
                oldtuple,
                newtuple,
            } => {
                let rel = self.relations.require(relid)?;
                DecodedMessage::Update {
                    relid,
                    old: oldtuple.map(|o| row_from_json(rel, &o)).transpose()?,
                    new: row_from_json(rel, &newtuple)?,
                }
            }
            JsonMessage::Delete { relid, oldtuple } => {
                let rel = self.relations.require(relid)?;
                DecodedMessage::Delete {
                    relid,
                    old: row_from_json(rel, &oldtuple)?,
                }
            }
        })
    }
}

fn decode_native(data: &[u8]) -> ProtoResult<DecodedMessage> {
    let (&msg_type, payload) = data
        .split_first()
        .ok_or_else(|| ProtoError::Decode("empty message".into()))?;
    let mut cursor = Cursor::new(payload);

    match msg_type {
        b'S' => decode_startup(&mut cursor),
        b'B' => decode_begin(&mut cursor),
        b'C' => decode_commit(&mut cursor),
        b'O' => decode_origin(&mut cursor),
        b'R' => decode_relation(&mut cursor),
        b'I' => decode_insert(&mut cursor),
        b'U' => decode_update(&mut cursor),
        b'D' => decode_delete(&mut cursor),
        other => Err(ProtoError::Decode(format!(
            "unknown message type: {} (0x{:02X})",
            other as char, other
        ))),
    }
}

fn decode_startup(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let reply_format = cursor.read_u8()?;
    let end = cursor.get_ref().len() as u64;

    let mut params = Vec::new();
    while cursor.position() < end {
        let key = read_cstr(cursor)?;
        let value = read_cstr(cursor)?;
        params.push((key, value));
    }

    Ok(DecodedMessage::Startup {
        reply_format,
        params,
    })
}

fn decode_begin(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let final_lsn = cursor.read_u64::<BigEndian>()?;
    let commit_time = read_timestamp(cursor)?;
    let xid = cursor.read_u32::<BigEndian>()?;

    Ok(DecodedMessage::Begin(BeginMessage {
        final_lsn,
        commit_time,
        xid,
    }))
}

fn decode_commit(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let flags = cursor.read_u8()?;
    let commit_lsn = cursor.read_u64::<BigEndian>()?;
    let end_lsn = cursor.read_u64::<BigEndian>()?;
    let commit_time = read_timestamp(cursor)?;

    Ok(DecodedMessage::Commit(CommitMessage {
        flags,
        commit_lsn,
        end_lsn,
        commit_time,
    }))
}

fn decode_origin(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let origin_lsn = cursor.read_u64::<BigEndian>()?;
    let len = cursor.read_u8()?;
    let origin_name = read_sized_cstr(cursor, usize::from(len))?;

    Ok(DecodedMessage::Origin(OriginMessage {
        origin_lsn,
        origin_name,
    }))
}

fn decode_relation(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let relid = cursor.read_u32::<BigEndian>()?;
    let len = cursor.read_u8()?;
    let namespace = read_sized_cstr(cursor, usize::from(len))?;
    let len = cursor.read_u8()?;
    let name = read_sized_cstr(cursor, usize::from(len))?;

    expect_marker(cursor, b'A')?;
    let natts = read_natts(cursor)?;

    let mut columns = Vec::with_capacity(natts);
    for _ in 0..natts {
        expect_marker(cursor, b'C')?;
        let flags = cursor.read_u8()?;
        expect_marker(cursor, b'N')?;
        let len = cursor.read_i16::<BigEndian>()?;
        let len = usize::try_from(len)
            .map_err(|_| ProtoError::Decode(format!("negative name length {}", len)))?;
        let col_name = read_sized_cstr(cursor, len)?;
        let type_oid = cursor.read_u32::<BigEndian>()?;
        let type_modifier = cursor.read_i32::<BigEndian>()?;

        columns.push(ColumnDesc {
            name: col_name,
            type_oid,
            type_modifier,
            is_key: flags & ATTR_FLAG_KEY != 0,
        });
    }

    Ok(DecodedMessage::Relation(RelationDesc {
        relid,
        namespace,
        name,
        replica_identity: ReplicaIdentity::Default,
        columns,
    }))
}

fn decode_insert(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let relid = cursor.read_u32::<BigEndian>()?;
    expect_marker(cursor, b'N')?;
    let new = decode_tuple(cursor)?;

    Ok(DecodedMessage::Insert { relid, new })
}

fn decode_update(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let relid = cursor.read_u32::<BigEndian>()?;

    let (old, new) = match cursor.read_u8()? {
        b'K' | b'O' => {
            let old = decode_tuple(cursor)?;
            expect_marker(cursor, b'N')?;
            (Some(old), decode_tuple(cursor)?)
        }
        b'N' => (None, decode_tuple(cursor)?),
        other => {
            return Err(ProtoError::Decode(format!(
                "unexpected tuple type in update: '{}'",
                other as char
            )));
        }
    };

    Ok(DecodedMessage::Update { relid, old, new })
}

fn decode_delete(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DecodedMessage> {
    let _flags = cursor.read_u8()?;
    let relid = cursor.read_u32::<BigEndian>()?;

    let tuple_type = cursor.read_u8()?;
    if tuple_type != b'K' && tuple_type != b'O' {
        return Err(ProtoError::Decode(format!(
            "expected 'K' or 'O' for delete tuple, got '{}'",
            tuple_type as char
        )));
    }

    let old = decode_tuple(cursor)?;
    Ok(DecodedMessage::Delete { relid, old })
}

fn decode_tuple(cursor: &mut Cursor<&[u8]>) -> ProtoResult<RowImage> {
    expect_marker(cursor, b'T')?;
    let natts = read_natts(cursor)?;
    let mut values = Vec::with_capacity(natts);

    for _ in 0..natts {
        let value = match cursor.read_u8()? {
            b'n' => Datum::Null,
            b'u' => Datum::Unchanged,
            b't' => {
                let buf = read_value(cursor)?;
                let text = String::from_utf8(buf)
                    .map_err(|e| ProtoError::Decode(format!("invalid UTF-8 text value: {}", e)))?;
                Datum::Text(text)
            }
            b'b' => Datum::Binary(read_value(cursor)?),
            other => {
                return Err(ProtoError::Decode(format!(
                    "unknown column value type: '{}' (0x{:02X})",
                    other as char, other
                )));
            }
        };
        values.push(value);
    }

    Ok(RowImage::new(values))
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> ProtoResult<Vec<u8>> {
    let len = cursor.read_i32::<BigEndian>()?;
    let len = usize::try_from(len)
        .map_err(|_| ProtoError::Decode(format!("negative value length {}", len)))?;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_natts(cursor: &mut Cursor<&[u8]>) -> ProtoResult<usize> {
    let natts = cursor.read_i16::<BigEndian>()?;
    usize::try_from(natts).map_err(|_| ProtoError::Decode(format!("negative column count {}", natts)))
}

fn read_timestamp(cursor: &mut Cursor<&[u8]>) -> ProtoResult<DateTime<Utc>> {
    let micros = cursor.read_i64::<BigEndian>()?;
    from_pg_micros(micros).ok_or_else(|| ProtoError::Decode(format!("timestamp out of range: {}", micros)))
}

fn expect_marker(cursor: &mut Cursor<&[u8]>, expected: u8) -> ProtoResult<()> {
    let found = cursor.read_u8()?;
    if found != expected {
        return Err(ProtoError::Decode(format!(
            "expected '{}', got '{}'",
            expected as char, found as char
        )));
    }
    Ok(())
}

/// Read a string whose length, including the NUL terminator, is known.
fn read_sized_cstr(cursor: &mut Cursor<&[u8]>, len: usize) -> ProtoResult<String> {
    if len == 0 {
        return Err(ProtoError::Decode("zero-length name".into()));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    if buf.pop() != Some(0) {
        return Err(ProtoError::Decode("name is not NUL-terminated".into()));
    }
    String::from_utf8(buf).map_err(|e| ProtoError::Decode(format!("invalid UTF-8 name: {}", e)))
}

/// Read a null-terminated string.
fn read_cstr(cursor: &mut Cursor<&[u8]>) -> ProtoResult<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| ProtoError::Decode(format!("invalid UTF-8 string: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::test_support::*;
    use crate::proto::{init_api, NativeProto, ProtoApi};
    use bytes::BytesMut;
    use chrono::TimeZone;

    #[test]
    fn test_decode_native_insert() {
        let mut out = BytesMut::new();
        NativeProto
            .write_insert(&mut out, &users(), &row("1", Some("ada")), None)
            .unwrap();

        let mut decoder = Decoder::new(ProtoFormat::Native);
        let msg = decoder.decode(&out).unwrap();
        assert_eq!(
            msg,
            DecodedMessage::Insert {
                relid: 16384,
                new: row("1", Some("ada")),
            }
        );
    }

    #[test]
    fn test_decode_native_relation_updates_cache() {
        let mut out = BytesMut::new();
        NativeProto.write_rel(&mut out, &users(), None).unwrap();

        let mut decoder = Decoder::new(ProtoFormat::Native);
        let msg = decoder.decode(&out).unwrap();
        assert_eq!(msg, DecodedMessage::Relation(users()));
        assert_eq!(decoder.relations().get(16384), Some(&users()));
    }

    #[test]
    fn test_decode_begin_keeps_timestamp() {
        let mut out = BytesMut::new();
        NativeProto.write_begin(&mut out, &txn()).unwrap();

        let mut decoder = Decoder::new(ProtoFormat::Native);
        match decoder.decode(&out).unwrap() {
            DecodedMessage::Begin(begin) => {
                assert_eq!(begin.xid, 731);
                assert_eq!(begin.final_lsn, txn().final_lsn);
                assert_eq!(begin.commit_time, txn().commit_time);
            }
            other => panic!("expected begin, got {:?}", other),
        }
    }

    #[test]
    fn test_formats_agree_on_commit_time() {
        let mut txn = txn();
        txn.commit_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        let decoded: Vec<_> = [ProtoFormat::Native, ProtoFormat::Json]
            .into_iter()
            .map(|format| {
                let api = init_api(format);
                let mut decoder = Decoder::new(format);
                let mut begin = BytesMut::new();
                api.write_begin(&mut begin, &txn).unwrap();
                let mut commit = BytesMut::new();
                api.write_commit(&mut commit, &txn, 0x1_0000_0058).unwrap();
                (decoder.decode(&begin).unwrap(), decoder.decode(&commit).unwrap())
            })
            .collect();

        assert_eq!(decoded[0], decoded[1]);
        match &decoded[1].1 {
            DecodedMessage::Commit(commit) => {
                assert_eq!(commit.commit_time.timestamp_subsec_nanos(), 123_456_000);
            }
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn test_json_rows_need_relation() {
        let api = init_api(ProtoFormat::Json);
        let mut decoder = Decoder::new(ProtoFormat::Json);

        let mut insert = BytesMut::new();
        api.write_insert(&mut insert, &users(), &row("1", None), None)
            .unwrap();
        assert!(matches!(
            decoder.decode(&insert),
            Err(ProtoError::RelationNotFound(16384))
        ));

        let mut rel = BytesMut::new();
        api.write_rel(&mut rel, &users(), None).unwrap();
        decoder.decode(&rel).unwrap();

        let msg = decoder.decode(&insert).unwrap();
        assert_eq!(
            msg,
            DecodedMessage::Insert {
                relid: 16384,
                new: row("1", None),
            }
        );
    }

    #[test]
    fn test_json_invalid_lsn() {
        let mut decoder = Decoder::new(ProtoFormat::Json);
        let data = br#"{"action":"O","origin_name":"a","origin_lsn":"nope"}"#;
        assert!(matches!(
            decoder.decode(data),
            Err(ProtoError::Core(logrep_core::Error::InvalidLsn(_)))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut decoder = Decoder::new(ProtoFormat::Native);
        let err = decoder.decode(b"Zxyz").unwrap_err();
        assert!(matches!(err, ProtoError::Decode(msg) if msg.contains("unknown message type")));
        assert!(matches!(decoder.decode(b""), Err(ProtoError::Decode(_))));
    }

    #[test]
    fn test_truncated_message() {
        let mut out = BytesMut::new();
        NativeProto.write_begin(&mut out, &txn()).unwrap();

        let mut decoder = Decoder::new(ProtoFormat::Native);
        let err = decoder.decode(&out[..out.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn test_decode_startup() {
        let mut out = BytesMut::new();
        let params = vec![
            ("proto_version".to_string(), "1".to_string()),
            ("encoding".to_string(), "UTF8".to_string()),
        ];
        NativeProto.write_startup_message(&mut out, &params).unwrap();

        let mut decoder = Decoder::new(ProtoFormat::Native);
        assert_eq!(
            decoder.decode(&out).unwrap(),
            DecodedMessage::Startup {
                reply_format: STARTUP_REPLY_FORMAT_FLAT,
                params,
            }
        );
    }
}
