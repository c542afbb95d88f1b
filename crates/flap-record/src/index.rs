//! Secondary index maintenance.
//!
//! Index state is derived from attribute values. The manager never writes on
//! its own: [`IndexManager::on_save`] and [`IndexManager::on_destroy`] return
//! the ops needed to reconcile the indexes, and the caller folds them into the
//! same atomic batch as the attribute write.

use std::collections::{BTreeMap, BTreeSet};

use flap_kv::{KvBackend, KvOp};
use flap_types::{Attributes, Value};

use crate::error::{RecordError, RecordResult};
use crate::keys::KeySpace;
use crate::schema::{AttributeDef, ClassDef};

/// Raw attribute hash as stored in the backend.
pub type RawAttributes = BTreeMap<String, String>;

/// Equality, sortable, and unique index access for one store.
pub struct IndexManager<'a> {
    backend: &'a dyn KvBackend,
    keys: &'a KeySpace,
}

impl<'a> IndexManager<'a> {
    pub fn new(backend: &'a dyn KvBackend, keys: &'a KeySpace) -> Self {
        Self { backend, keys }
    }

    /// Ops moving `id` from the entries of its old values to those of its
    /// new values. Only attributes whose encoded value changed produce ops.
    pub fn on_save(
        &self,
        class: &ClassDef,
        id: &str,
        old: Option<&RawAttributes>,
        new: &Attributes,
    ) -> RecordResult<Vec<KvOp>> {
        let mut ops = Vec::new();
        let mut rank = None;

        for attr in class.attributes().filter(|a| a.indexed || a.unique) {
            let before = old.and_then(|raw| raw.get(&attr.name)).map(String::as_str);
            let after = new.get(&attr.name).map(Value::encode);
            if before == after.as_deref() {
                continue;
            }

            if attr.indexed {
                if let Some(value) = before {
                    ops.push(KvOp::srem(self.keys.index_set(class.name(), &attr.name, value), id));
                }
                if let Some(value) = &after {
                    ops.push(KvOp::sadd(self.keys.index_set(class.name(), &attr.name, value), id));
                }
            }

            if attr.sortable {
                let previous = match before {
                    Some(value) => {
                        let key = self.keys.index_sorted(class.name(), &attr.name, value);
                        let score = self.backend.zscore(&key, id)?;
                        ops.push(KvOp::zrem(key, id));
                        score
                    }
                    None => None,
                };
                if let Some(value) = &after {
                    let score = match previous.or(rank) {
                        Some(score) => score,
                        None => self.backend.incr(&self.keys.rank(class.name()))?,
                    };
                    rank = Some(score);
                    ops.push(KvOp::zadd(
                        self.keys.index_sorted(class.name(), &attr.name, value),
                        id,
                        score,
                    ));
                }
            }

            if attr.unique {
                let key = self.keys.unique(class.name(), &attr.name);
                if let Some(value) = before {
                    ops.push(KvOp::hdel(key.clone(), value));
                }
                if let Some(value) = after {
                    ops.push(KvOp::hset(key, value, id));
                }
            }
        }

        Ok(ops)
    }

    /// Ops removing `id` from every index entry its stored values occupy.
    pub fn on_destroy(
        &self,
        class: &ClassDef,
        id: &str,
        raw: &RawAttributes,
    ) -> RecordResult<Vec<KvOp>> {
        let mut ops = Vec::new();
        for attr in class.attributes().filter(|a| a.indexed || a.unique) {
            let Some(value) = raw.get(&attr.name) else {
                continue;
            };
            if attr.indexed {
                ops.push(KvOp::srem(self.keys.index_set(class.name(), &attr.name, value), id));
            }
            if attr.sortable {
                ops.push(KvOp::zrem(self.keys.index_sorted(class.name(), &attr.name, value), id));
            }
            if attr.unique {
                let key = self.keys.unique(class.name(), &attr.name);
                // Another record may have claimed the value since.
                if self.backend.hget(&key, value)?.as_deref() == Some(id) {
                    ops.push(KvOp::hdel(key, value));
                }
            }
        }
        Ok(ops)
    }

    /// Ids currently holding `value` for `attribute`.
    pub fn lookup(
        &self,
        class: &ClassDef,
        attribute: &str,
        value: &Value,
    ) -> RecordResult<BTreeSet<String>> {
        let attr = self.indexed_attribute(class, attribute)?;
        value.expect_type(attr.attr_type)?;
        let encoded = value.encode();

        if attr.indexed {
            return Ok(self
                .backend
                .smembers(&self.keys.index_set(class.name(), attribute, &encoded))?);
        }
        let owner = self
            .backend
            .hget(&self.keys.unique(class.name(), attribute), &encoded)?;
        Ok(owner.into_iter().collect())
    }

    /// Union of [`lookup`](Self::lookup) over several candidate values.
    pub fn lookup_any(
        &self,
        class: &ClassDef,
        attribute: &str,
        values: &[Value],
    ) -> RecordResult<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for value in values {
            ids.extend(self.lookup(class, attribute, value)?);
        }
        Ok(ids)
    }

    /// Returns `true` if `value` is already claimed by a record other than
    /// `excluding_id`.
    pub fn unique_check(
        &self,
        class: &ClassDef,
        attribute: &str,
        value: &Value,
        excluding_id: Option<&str>,
    ) -> RecordResult<bool> {
        let key = self.keys.unique(class.name(), attribute);
        let owner = self.backend.hget(&key, &value.encode())?;
        Ok(match owner {
            Some(owner) => excluding_id != Some(owner.as_str()),
            None => false,
        })
    }

    /// Creation ranks of the ids holding `encoded` in a sortable index.
    pub fn ranks(
        &self,
        class: &ClassDef,
        attribute: &str,
        encoded: &str,
    ) -> RecordResult<BTreeMap<String, i64>> {
        let key = self.keys.index_sorted(class.name(), attribute, encoded);
        Ok(self.backend.zrange(&key)?.into_iter().collect())
    }

    fn indexed_attribute<'c>(
        &self,
        class: &'c ClassDef,
        attribute: &str,
    ) -> RecordResult<&'c AttributeDef> {
        let attr = class
            .attribute_def(attribute)
            .ok_or_else(|| RecordError::UnknownAttribute {
                class: class.name().to_string(),
                attribute: attribute.to_string(),
            })?;
        if !attr.indexed && !attr.unique {
            return Err(RecordError::UnindexedAttribute {
                class: class.name().to_string(),
                attribute: attribute.to_string(),
            });
        }
        Ok(attr)
    }
}
