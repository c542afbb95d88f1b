//! In-memory record with dirty tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flap_types::{Attributes, Value};

use crate::error::{RecordError, RecordResult};
use crate::schema::ClassDef;

/// Lifecycle phase of a [`Record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, never saved. May be invalid.
    Unsaved,
    /// Backed by storage.
    Persisted,
    /// Removed from storage. Terminal.
    Destroyed,
}

/// Old and new value of one changed attribute. `None` means unset.
pub type Change = (Option<Value>, Option<Value>);

/// One instance of a class.
///
/// Setters only touch the in-memory copy; nothing reaches the backend until
/// the record is saved through a [`RecordStore`](crate::RecordStore).
#[derive(Clone)]
pub struct Record {
    class: Arc<ClassDef>,
    id: Option<String>,
    attrs: Attributes,
    persisted: Attributes,
    phase: Phase,
}

impl Record {
    pub(crate) fn new(class: Arc<ClassDef>, id: Option<String>) -> Self {
        let attrs = class.defaults();
        Self {
            class,
            id,
            attrs,
            persisted: Attributes::new(),
            phase: Phase::Unsaved,
        }
    }

    pub(crate) fn loaded(class: Arc<ClassDef>, id: String, attrs: Attributes) -> Self {
        Self {
            class,
            id: Some(id),
            persisted: attrs.clone(),
            attrs,
            phase: Phase::Persisted,
        }
    }

    pub fn class(&self) -> &ClassDef {
        &self.class
    }

    pub fn class_name(&self) -> &str {
        self.class.name()
    }

    pub(crate) fn class_def(&self) -> Arc<ClassDef> {
        Arc::clone(&self.class)
    }

    /// The record id. Unsaved records may not have one yet.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_persisted(&self) -> bool {
        self.phase == Phase::Persisted
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase == Phase::Destroyed
    }

    /// Set the id of an unsaved record.
    pub fn set_id(&mut self, id: impl Into<String>) -> RecordResult<()> {
        self.ensure_live()?;
        if self.phase == Phase::Persisted {
            return Err(RecordError::Schema(format!(
                "cannot change the id of persisted {} record",
                self.class_name()
            )));
        }
        self.id = Some(id.into());
        Ok(())
    }

    pub fn get(&self, name: &str) -> RecordResult<Option<&Value>> {
        self.ensure_live()?;
        self.ensure_declared(name)?;
        Ok(self.attrs.get(name))
    }

    /// Set an attribute in memory. Type conformance is checked at save.
    ///
    /// The value is kept at stored precision, so timestamps lose any
    /// sub-second part here rather than on the way to the backend.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> RecordResult<()> {
        self.ensure_live()?;
        self.ensure_declared(name)?;
        self.attrs.insert(name.to_string(), value.into().canonical());
        Ok(())
    }

    pub fn unset(&mut self, name: &str) -> RecordResult<()> {
        self.ensure_live()?;
        self.ensure_declared(name)?;
        self.attrs.remove(name);
        Ok(())
    }

    /// Current in-memory attributes.
    pub fn attributes(&self) -> RecordResult<&Attributes> {
        self.ensure_live()?;
        Ok(&self.attrs)
    }

    pub fn get_str(&self, name: &str) -> RecordResult<Option<&str>> {
        Ok(self.get(name)?.and_then(Value::as_str))
    }

    pub fn get_bool(&self, name: &str) -> RecordResult<Option<bool>> {
        Ok(self.get(name)?.and_then(Value::as_bool))
    }

    pub fn get_i64(&self, name: &str) -> RecordResult<Option<i64>> {
        Ok(self.get(name)?.and_then(Value::as_i64))
    }

    pub fn get_timestamp(&self, name: &str) -> RecordResult<Option<DateTime<Utc>>> {
        Ok(self.get(name)?.and_then(Value::as_timestamp))
    }

    pub fn get_json(&self, name: &str) -> RecordResult<Option<&serde_json::Value>> {
        Ok(self.get(name)?.and_then(Value::as_json))
    }

    /// Names of attributes that differ from the last load or save, sorted.
    pub fn changed(&self) -> Vec<String> {
        self.changes().into_keys().collect()
    }

    /// `(old, new)` for every attribute that differs from the last load or
    /// save.
    pub fn changes(&self) -> BTreeMap<String, Change> {
        let mut out = BTreeMap::new();
        for attr in self.class.attributes() {
            let old = self.persisted.get(&attr.name);
            let new = self.attrs.get(&attr.name);
            if old != new {
                out.insert(attr.name.clone(), (old.cloned(), new.cloned()));
            }
        }
        out
    }

    pub fn is_dirty(&self) -> bool {
        self.persisted != self.attrs
    }

    pub(crate) fn ensure_live(&self) -> RecordResult<()> {
        if self.phase == Phase::Destroyed {
            return Err(RecordError::DestroyedRecordAccess {
                class: self.class_name().to_string(),
                id: self.id.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn ensure_declared(&self, name: &str) -> RecordResult<()> {
        if self.class.attribute_def(name).is_none() {
            return Err(RecordError::UnknownAttribute {
                class: self.class_name().to_string(),
                attribute: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn raw_attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Mark the in-memory state as what storage now holds.
    pub(crate) fn mark_persisted(&mut self, id: String) {
        self.id = Some(id);
        self.persisted = self.attrs.clone();
        self.phase = Phase::Persisted;
    }

    pub(crate) fn reload(&mut self, attrs: Attributes) {
        self.persisted = attrs.clone();
        self.attrs = attrs;
        self.phase = Phase::Persisted;
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.phase = Phase::Destroyed;
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("class", &self.class.name())
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("attrs", &self.attrs)
            .finish()
    }
}
