//! Relation metadata seen on the receiving side.
//!
//! The sender transmits a relation message before the first row of each
//! relation and again whenever its definition changes. Row messages only
//! carry the relation id, resolved through this cache.

use std::collections::HashMap;

use logrep_core::{Oid, RelationDesc};

use crate::error::{ProtoError, ProtoResult};

#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<Oid, RelationDesc>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a relation definition.
    pub fn update(&mut self, rel: RelationDesc) {
        self.relations.insert(rel.relid, rel);
    }

    pub fn get(&self, relid: Oid) -> Option<&RelationDesc> {
        self.relations.get(&relid)
    }

    /// Like [`get`](Self::get), failing with `RelationNotFound`.
    pub fn require(&self, relid: Oid) -> ProtoResult<&RelationDesc> {
        self.get(relid).ok_or(ProtoError::RelationNotFound(relid))
    }

    /// Drop everything, e.g. on reconnect.
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
