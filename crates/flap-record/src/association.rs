//! Association link sets.
//!
//! A relation `owner.R` keeps, per owner id, the set of linked target ids at
//! `owner:I:R_ids`. Many-to-many relations also keep the mirror set on the
//! target side under the inverse relation name, and both sides are written in
//! one batch.

use std::collections::{BTreeMap, BTreeSet};

use flap_kv::{KvBackend, KvOp};
use tracing::debug;

use crate::error::{RecordError, RecordResult};
use crate::keys::KeySpace;
use crate::schema::{AssociationDef, SchemaRegistry};

pub struct AssociationManager<'a> {
    backend: &'a dyn KvBackend,
    keys: &'a KeySpace,
    schema: &'a SchemaRegistry,
}

impl<'a> AssociationManager<'a> {
    pub fn new(backend: &'a dyn KvBackend, keys: &'a KeySpace, schema: &'a SchemaRegistry) -> Self {
        Self {
            backend,
            keys,
            schema,
        }
    }

    /// Add `target_ids` to `class:owner_id`'s `relation`.
    ///
    /// Both the owner and every target must exist.
    pub fn link(
        &self,
        class: &str,
        owner_id: &str,
        relation: &str,
        target_ids: &[&str],
    ) -> RecordResult<()> {
        let assoc = self.schema.association(class, relation)?;
        self.require_present(&assoc.owner, &[owner_id])?;
        self.require_present(&assoc.target, target_ids)?;

        let ops = self.link_ops(assoc, owner_id, target_ids, KvOp::sadd);
        self.backend.apply(&ops)?;
        debug!(class, id = owner_id, relation, targets = target_ids.len(), "linked");
        Ok(())
    }

    /// Remove `target_ids` from `class:owner_id`'s `relation`. Neither record
    /// is touched; ids that were not linked are ignored.
    pub fn unlink(
        &self,
        class: &str,
        owner_id: &str,
        relation: &str,
        target_ids: &[&str],
    ) -> RecordResult<()> {
        let assoc = self.schema.association(class, relation)?;
        let ops = self.link_ops(assoc, owner_id, target_ids, KvOp::srem);
        self.backend.apply(&ops)?;
        debug!(class, id = owner_id, relation, targets = target_ids.len(), "unlinked");
        Ok(())
    }

    fn link_ops(
        &self,
        assoc: &AssociationDef,
        owner_id: &str,
        target_ids: &[&str],
        op: fn(String, String) -> KvOp,
    ) -> Vec<KvOp> {
        let owner_key = self.keys.link(&assoc.owner, owner_id, &assoc.name);
        let mut ops: Vec<KvOp> = target_ids
            .iter()
            .map(|t| op(owner_key.clone(), t.to_string()))
            .collect();
        if let (true, Some(inverse)) = (assoc.is_symmetric(), &assoc.inverse) {
            ops.extend(target_ids.iter().map(|t| {
                op(self.keys.link(&assoc.target, t, inverse), owner_id.to_string())
            }));
        }
        ops
    }

    /// Target ids linked from one owner.
    pub fn ids_for(
        &self,
        class: &str,
        owner_id: &str,
        relation: &str,
    ) -> RecordResult<BTreeSet<String>> {
        let assoc = self.schema.association(class, relation)?;
        Ok(self
            .backend
            .smembers(&self.keys.link(&assoc.owner, owner_id, &assoc.name))?)
    }

    /// Target ids for several owners in one round-trip.
    pub fn bulk_ids_for(
        &self,
        class: &str,
        owner_ids: &[&str],
        relation: &str,
    ) -> RecordResult<BTreeMap<String, BTreeSet<String>>> {
        let assoc = self.schema.association(class, relation)?;
        let keys: Vec<String> = owner_ids
            .iter()
            .map(|id| self.keys.link(&assoc.owner, id, &assoc.name))
            .collect();
        let sets = self.backend.smembers_batch(&keys)?;
        Ok(owner_ids
            .iter()
            .map(|id| id.to_string())
            .zip(sets)
            .collect())
    }

    /// Ops removing every link that mentions `class:id`, on either side.
    pub fn on_destroy(&self, class: &str, id: &str) -> RecordResult<Vec<KvOp>> {
        let mut ops = Vec::new();

        for assoc in self.schema.associations_of(class) {
            let key = self.keys.link(class, id, &assoc.name);
            // The mirror entries of symmetric relations are found from this
            // side; the registered inverse cleans up our own set later.
            if let (true, Some(inverse)) = (assoc.is_symmetric(), &assoc.inverse) {
                for target in self.backend.smembers(&key)? {
                    ops.push(KvOp::srem(self.keys.link(&assoc.target, &target, inverse), id));
                }
            }
            ops.push(KvOp::del(key));
        }

        // One-to-many relations carry no back-pointer, so every owner set has
        // to be checked.
        for assoc in self.schema.associations_targeting(class) {
            if assoc.is_symmetric() {
                continue;
            }
            let owners = self.backend.smembers(&self.keys.ids(&assoc.owner))?;
            for owner in owners {
                let key = self.keys.link(&assoc.owner, &owner, &assoc.name);
                if self.backend.sismember(&key, id)? {
                    ops.push(KvOp::srem(key, id));
                }
            }
        }

        Ok(ops)
    }

    fn require_present(&self, class: &str, ids: &[&str]) -> RecordResult<()> {
        let ids_key = self.keys.ids(class);
        let mut missing = Vec::new();
        for id in ids {
            if !self.backend.sismember(&ids_key, id)? {
                missing.push(id.to_string());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RecordError::NotFound {
                class: class.to_string(),
                ids: missing,
            })
        }
    }
}
