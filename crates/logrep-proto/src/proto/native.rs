//! Native binary format writer. All integers are big-endian.

use bytes::{BufMut, BytesMut};
use logrep_core::{to_pg_micros, Datum, Lsn, RelationDesc, ReplicaIdentity, RowImage, TxnHandle};

use super::{project_row, selected_columns, ProtoApi, ProtoFormat, STARTUP_REPLY_FORMAT_FLAT};
use crate::error::{ProtoError, ProtoResult};

/// Column flag: part of the replica identity key.
pub const ATTR_FLAG_KEY: u8 = 1;

/// Writer for the native binary format.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProto;

impl ProtoApi for NativeProto {
    fn format(&self) -> ProtoFormat {
        ProtoFormat::Native
    }

    fn write_startup_message(
        &self,
        out: &mut BytesMut,
        params: &[(String, String)],
    ) -> ProtoResult<()> {
        for (key, value) in params {
            check_cstr(key)?;
            check_cstr(value)?;
        }

        out.put_u8(b'S');
        out.put_u8(STARTUP_REPLY_FORMAT_FLAT);
        for (key, value) in params {
            put_cstr(out, key);
            put_cstr(out, value);
        }
        Ok(())
    }

    fn write_rel(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let nspname_len = short_name_len(&rel.namespace)?;
        let relname_len = short_name_len(&rel.name)?;
        let attname_lens = columns
            .iter()
            .map(|&i| {
                let name = &rel.columns[i].name;
                check_cstr(name)?;
                i16::try_from(name.len() + 1).map_err(|_| ProtoError::NameTooLong(name.clone()))
            })
            .collect::<ProtoResult<Vec<_>>>()?;

        out.put_u8(b'R');
        out.put_u8(0);
        out.put_u32(rel.relid);
        out.put_u8(nspname_len);
        put_cstr(out, &rel.namespace);
        out.put_u8(relname_len);
        put_cstr(out, &rel.name);

        out.put_u8(b'A');
        out.put_i16(natts(columns.len())?);
        for (&i, len) in columns.iter().zip(attname_lens) {
            let col = &rel.columns[i];
            out.put_u8(b'C');
            out.put_u8(if col.is_key { ATTR_FLAG_KEY } else { 0 });
            out.put_u8(b'N');
            out.put_i16(len);
            put_cstr(out, &col.name);
            out.put_u32(col.type_oid);
            out.put_i32(col.type_modifier);
        }
        Ok(())
    }

    fn write_begin(&self, out: &mut BytesMut, txn: &TxnHandle) -> ProtoResult<()> {
        out.put_u8(b'B');
        out.put_u8(0);
        out.put_u64(txn.final_lsn);
        out.put_i64(to_pg_micros(txn.commit_time));
        out.put_u32(txn.xid);
        Ok(())
    }

    fn write_commit(&self, out: &mut BytesMut, txn: &TxnHandle, end_lsn: Lsn) -> ProtoResult<()> {
        out.put_u8(b'C');
        out.put_u8(0);
        out.put_u64(txn.final_lsn);
        out.put_u64(end_lsn);
        out.put_i64(to_pg_micros(txn.commit_time));
        Ok(())
    }

    fn write_origin(&self, out: &mut BytesMut, origin: &str, origin_lsn: Lsn) -> ProtoResult<()> {
        let len = short_name_len(origin)?;

        out.put_u8(b'O');
        out.put_u8(0);
        out.put_u64(origin_lsn);
        out.put_u8(len);
        put_cstr(out, origin);
        Ok(())
    }

    fn write_insert(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        new: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let new = project_row(rel, new, &columns)?;

        out.put_u8(b'I');
        out.put_u8(0);
        out.put_u32(rel.relid);
        out.put_u8(b'N');
        put_tuple(out, &new)
    }

    fn write_update(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        old: Option<&RowImage>,
        new: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let old = old.map(|o| project_row(rel, o, &columns)).transpose()?;
        let new = project_row(rel, new, &columns)?;

        out.put_u8(b'U');
        out.put_u8(0);
        out.put_u32(rel.relid);
        if let Some(old) = old {
            out.put_u8(old_tuple_marker(rel));
            put_tuple(out, &old)?;
        }
        out.put_u8(b'N');
        put_tuple(out, &new)
    }

    fn write_delete(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        old: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let old = project_row(rel, old, &columns)?;

        out.put_u8(b'D');
        out.put_u8(0);
        out.put_u32(rel.relid);
        out.put_u8(old_tuple_marker(rel));
        put_tuple(out, &old)
    }
}

/// `O` carries the full old row, `K` only the replica identity key.
fn old_tuple_marker(rel: &RelationDesc) -> u8 {
    if rel.replica_identity == ReplicaIdentity::Full {
        b'O'
    } else {
        b'K'
    }
}

fn put_tuple(out: &mut BytesMut, values: &[&Datum]) -> ProtoResult<()> {
    out.put_u8(b'T');
    out.put_i16(natts(values.len())?);
    for value in values {
        match value {
            Datum::Null => out.put_u8(b'n'),
            Datum::Unchanged => out.put_u8(b'u'),
            Datum::Text(s) => {
                out.put_u8(b't');
                out.put_i32(value_len(s.len())?);
                out.put_slice(s.as_bytes());
            }
            Datum::Binary(b) => {
                out.put_u8(b'b');
                out.put_i32(value_len(b.len())?);
                out.put_slice(b);
            }
        }
    }
    Ok(())
}

fn natts(len: usize) -> ProtoResult<i16> {
    i16::try_from(len).map_err(|_| ProtoError::Unrepresentable(format!("{} columns", len)))
}

fn value_len(len: usize) -> ProtoResult<i32> {
    i32::try_from(len)
        .map_err(|_| ProtoError::Unrepresentable(format!("value of {} bytes", len)))
}

/// Length byte of a short name, counting the NUL terminator.
fn short_name_len(name: &str) -> ProtoResult<u8> {
    check_cstr(name)?;
    u8::try_from(name.len() + 1).map_err(|_| ProtoError::NameTooLong(name.to_string()))
}

/// Strings go out NUL-terminated, so they cannot contain a NUL themselves.
fn check_cstr(s: &str) -> ProtoResult<()> {
    if s.contains('\0') {
        return Err(ProtoError::Unrepresentable(format!("string with a NUL byte: {:?}", s)));
    }
    Ok(())
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}
