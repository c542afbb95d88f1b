use std::collections::BTreeSet;

use chrono::{FixedOffset, Offset, Utc};
use flap_record::{AttrType, ClassDef, Record, RecordResult, RecordStore};

use crate::model::{model, Model};
use crate::validators::{parse_timezone, Timezone};

/// Someone notifications are sent to.
#[derive(Clone, Debug)]
pub struct Contact {
    record: Record,
}

model!(Contact, "contact");

impl Contact {
    pub const RULES: &'static str = "rules";

    pub fn class_def() -> ClassDef {
        ClassDef::new(Self::CLASS)
            .attribute("first_name", AttrType::String)
            .attribute("last_name", AttrType::String)
            .attribute("email", AttrType::String)
            .attribute("timezone", AttrType::String)
            .required("first_name")
            .required("last_name")
            .validator(Timezone)
    }

    pub fn first_name(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("first_name")
    }

    pub fn last_name(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("last_name")
    }

    pub fn email(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("email")
    }

    pub fn set_name(&mut self, first: &str, last: &str) -> RecordResult<()> {
        self.record.set("first_name", first)?;
        self.record.set("last_name", last)
    }

    pub fn set_email(&mut self, email: &str) -> RecordResult<()> {
        self.record.set("email", email)
    }

    pub fn set_timezone(&mut self, timezone: &str) -> RecordResult<()> {
        self.record.set("timezone", timezone)
    }

    /// The contact's offset, defaulting to UTC when unset or unparseable.
    pub fn time_zone(&self) -> RecordResult<FixedOffset> {
        let parsed = self.record.get_str("timezone")?.and_then(parse_timezone);
        Ok(parsed.unwrap_or_else(|| Utc.fix()))
    }

    pub fn rule_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::RULES)
    }
}
