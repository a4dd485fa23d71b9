//! JSON format: one object per message, tagged by `"action"`.
//!
//! Rows are objects keyed by column name. Unchanged TOAST values are left
//! out, binary values are sent as `{"binary": "<hex>"}`.

use std::collections::BTreeMap;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use logrep_core::{
    format_lsn, from_pg_micros, to_pg_micros, Datum, Lsn, Oid, RelationDesc, RowImage, TxnHandle,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{project_row, selected_columns, ProtoApi, ProtoFormat};
use crate::error::{ProtoError, ProtoResult};

/// Wire shape of every JSON message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum JsonMessage {
    #[serde(rename = "S")]
    Startup { params: BTreeMap<String, String> },

    #[serde(rename = "R")]
    Relation {
        relid: Oid,
        namespace: String,
        name: String,
        columns: Vec<JsonColumn>,
    },

    #[serde(rename = "B")]
    Begin {
        xid: u32,
        final_lsn: String,
        commit_time: DateTime<Utc>,
    },

    #[serde(rename = "C")]
    Commit {
        commit_lsn: String,
        end_lsn: String,
        commit_time: DateTime<Utc>,
    },

    #[serde(rename = "O")]
    Origin {
        origin_name: String,
        origin_lsn: String,
    },

    #[serde(rename = "I")]
    Insert {
        relid: Oid,
        newtuple: Map<String, Value>,
    },

    #[serde(rename = "U")]
    Update {
        relid: Oid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oldtuple: Option<Map<String, Value>>,
        newtuple: Map<String, Value>,
    },

    #[serde(rename = "D")]
    Delete {
        relid: Oid,
        oldtuple: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonColumn {
    pub name: String,
    pub type_oid: Oid,
    #[serde(default = "default_typmod")]
    pub typmod: i32,
    #[serde(default)]
    pub key: bool,
}

fn default_typmod() -> i32 {
    -1
}

/// Writer for the JSON format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProto;

impl JsonProto {
    fn write(&self, out: &mut BytesMut, msg: &JsonMessage) -> ProtoResult<()> {
        let json = serde_json::to_vec(msg)?;
        out.extend_from_slice(&json);
        Ok(())
    }
}

impl ProtoApi for JsonProto {
    fn format(&self) -> ProtoFormat {
        ProtoFormat::Json
    }

    fn write_startup_message(
        &self,
        out: &mut BytesMut,
        params: &[(String, String)],
    ) -> ProtoResult<()> {
        let params = params.iter().cloned().collect();
        self.write(out, &JsonMessage::Startup { params })
    }

    fn write_rel(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?
            .into_iter()
            .map(|i| {
                let col = &rel.columns[i];
                JsonColumn {
                    name: col.name.clone(),
                    type_oid: col.type_oid,
                    typmod: col.type_modifier,
                    key: col.is_key,
                }
            })
            .collect();

        self.write(
            out,
            &JsonMessage::Relation {
                relid: rel.relid,
                namespace: rel.namespace.clone(),
                name: rel.name.clone(),
                columns,
            },
        )
    }

    fn write_begin(&self, out: &mut BytesMut, txn: &TxnHandle) -> ProtoResult<()> {
        self.write(
            out,
            &JsonMessage::Begin {
                xid: txn.xid,
                final_lsn: format_lsn(txn.final_lsn),
                commit_time: wire_time(txn.commit_time)?,
            },
        )
    }

    fn write_commit(&self, out: &mut BytesMut, txn: &TxnHandle, end_lsn: Lsn) -> ProtoResult<()> {
        self.write(
            out,
            &JsonMessage::Commit {
                commit_lsn: format_lsn(txn.final_lsn),
                end_lsn: format_lsn(end_lsn),
                commit_time: wire_time(txn.commit_time)?,
            },
        )
    }

    fn write_origin(&self, out: &mut BytesMut, origin: &str, origin_lsn: Lsn) -> ProtoResult<()> {
        self.write(
            out,
            &JsonMessage::Origin {
                origin_name: origin.to_string(),
                origin_lsn: format_lsn(origin_lsn),
            },
        )
    }

    fn write_insert(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        new: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let newtuple = row_to_json(rel, new, &columns)?;
        self.write(
            out,
            &JsonMessage::Insert {
                relid: rel.relid,
                newtuple,
            },
        )
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
        let oldtuple = old.map(|o| row_to_json(rel, o, &columns)).transpose()?;
        let newtuple = row_to_json(rel, new, &columns)?;
        self.write(
            out,
            &JsonMessage::Update {
                relid: rel.relid,
                oldtuple,
                newtuple,
            },
        )
    }

    fn write_delete(
        &self,
        out: &mut BytesMut,
        rel: &RelationDesc,
        old: &RowImage,
        columns: Option<&[usize]>,
    ) -> ProtoResult<()> {
        let columns = selected_columns(rel, columns)?;
        let oldtuple = row_to_json(rel, old, &columns)?;
        self.write(
            out,
            &JsonMessage::Delete {
                relid: rel.relid,
                oldtuple,
            },
        )
    }
}

fn row_to_json(
    rel: &RelationDesc,
    row: &RowImage,
    columns: &[usize],
) -> ProtoResult<Map<String, Value>> {
    let values = project_row(rel, row, columns)?;
    let mut map = Map::new();

    for (&i, datum) in columns.iter().zip(values) {
        let value = match datum {
            Datum::Unchanged => continue,
            Datum::Null => Value::Null,
            Datum::Text(s) => Value::String(s.clone()),
            Datum::Binary(b) => serde_json::json!({ "binary": hex::encode(b) }),
        };
        map.insert(rel.columns[i].name.clone(), value);
    }

    Ok(map)
}

/// Rebuild a positional row from a JSON row, following the column order
/// of the cached relation. Columns missing from the object were unchanged.
pub(crate) fn row_from_json(rel: &RelationDesc, row: &Map<String, Value>) -> ProtoResult<RowImage> {
    if let Some(unknown) = row
        .keys()
        .find(|k| !rel.columns.iter().any(|c| &c.name == *k))
    {
        return Err(ProtoError::Decode(format!(
            "column '{}' not in relation {}",
            unknown,
            rel.qualified_name()
        )));
    }

    rel.columns
        .iter()
        .map(|col| match row.get(&col.name) {
            None => Ok(Datum::Unchanged),
            Some(value) => datum_from_json(value),
        })
        .collect::<ProtoResult<Vec<_>>>()
        .map(RowImage::new)
}

fn datum_from_json(value: &Value) -> ProtoResult<Datum> {
    match value {
        Value::Null => Ok(Datum::Null),
        Value::String(s) => Ok(Datum::Text(s.clone())),
        Value::Object(obj) => {
            let encoded = obj
                .get("binary")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtoError::Decode(format!("unexpected column value: {}", value)))?;
            let bytes = hex::decode(encoded)
                .map_err(|e| ProtoError::Decode(format!("invalid binary value: {}", e)))?;
            Ok(Datum::Binary(bytes))
        }
        // Numbers and booleans from hand-written streams keep their text form.
        other => Ok(Datum::Text(other.to_string())),
    }
}

/// Timestamps carry microsecond precision, the same as the native format.
fn wire_time(ts: DateTime<Utc>) -> ProtoResult<DateTime<Utc>> {
    from_pg_micros(to_pg_micros(ts))
        .ok_or_else(|| ProtoError::Unrepresentable(format!("timestamp {}", ts)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn parse(out: &BytesMut) -> Value {
        serde_json::from_slice(out).unwrap()
    }

    #[test]
    fn test_begin_and_commit() {
        let mut out = BytesMut::new();
        JsonProto.write_begin(&mut out, &txn()).unwrap();
        let begin = parse(&out);
        assert_eq!(begin["action"], "B");
        assert_eq!(begin["xid"], 731);
        assert_eq!(begin["final_lsn"], "1/28");

        let mut out = BytesMut::new();
        JsonProto.write_commit(&mut out, &txn(), 0x1_0000_0040).unwrap();
        let commit = parse(&out);
        assert_eq!(commit["action"], "C");
        assert_eq!(commit["commit_lsn"], "1/28");
        assert_eq!(commit["end_lsn"], "1/40");
    }

    #[test]
    fn test_relation_message() {
        let mut out = BytesMut::new();
        JsonProto.write_rel(&mut out, &users(), Some(&[0])).unwrap();
        let rel = parse(&out);

        assert_eq!(rel["action"], "R");
        assert_eq!(rel["namespace"], "public");
        assert_eq!(rel["columns"].as_array().unwrap().len(), 1);
        assert_eq!(rel["columns"][0]["name"], "id");
        assert_eq!(rel["columns"][0]["key"], true);
    }

    #[test]
    fn test_row_values() {
        let mut row = row("7", None);
        row.values[2] = Datum::Unchanged;

        let mut out = BytesMut::new();
        JsonProto.write_insert(&mut out, &users(), &row, None).unwrap();
        let insert = parse(&out);

        assert_eq!(insert["action"], "I");
        assert_eq!(insert["newtuple"]["id"], "7");
        assert!(insert["newtuple"]["name"].is_null());
        assert!(insert["newtuple"].get("avatar").is_none());
    }

    #[test]
    fn test_binary_value() {
        let mut out = BytesMut::new();
        JsonProto
            .write_delete(&mut out, &users(), &row("1", Some("x")), None)
            .unwrap();
        let delete = parse(&out);
        assert_eq!(delete["oldtuple"]["avatar"]["binary"], "cafe");
    }

    #[test]
    fn test_row_from_json() {
        let rel = users();
        let map = serde_json::json!({
            "id": "1",
            "name": null,
            "avatar": {"binary": "00ff"}
        });
        let row = row_from_json(&rel, map.as_object().unwrap()).unwrap();
        assert_eq!(
            row.values,
            vec![Datum::text("1"), Datum::Null, Datum::Binary(vec![0, 255])]
        );

        let map = serde_json::json!({ "id": 5 });
        let row = row_from_json(&rel, map.as_object().unwrap()).unwrap();
        assert_eq!(
            row.values,
            vec![Datum::text("5"), Datum::Unchanged, Datum::Unchanged]
        );

        let map = serde_json::json!({ "email": "a@b" });
        assert!(matches!(
            row_from_json(&rel, map.as_object().unwrap()),
            Err(ProtoError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_column_filter() {
        let mut out = BytesMut::new();
        let err = JsonProto
            .write_insert(&mut out, &users(), &row("1", None), Some(&[9]))
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnknownColumn { index: 9, .. }));
        assert!(out.is_empty());
    }
}
