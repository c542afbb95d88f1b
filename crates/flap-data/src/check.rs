use std::collections::BTreeSet;

use flap_record::{AttrType, ClassDef, Record, RecordResult, RecordStore};

use crate::model::{model, Model};

/// A monitored check.
#[derive(Clone, Debug)]
pub struct Check {
    record: Record,
}

model!(Check, "check");

impl Check {
    pub const TAGS: &'static str = "tags";
    pub const UNSCHEDULED_MAINTENANCES: &'static str = "unscheduled_maintenances";

    pub fn class_def() -> ClassDef {
        ClassDef::new(Self::CLASS)
            .attribute("name", AttrType::String)
            .attribute("enabled", AttrType::Boolean)
            .unique("name")
            .sortable("name")
            .indexed("enabled")
            .default_value("enabled", false)
            .required("name")
    }

    pub fn name(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("name")
    }

    pub fn set_name(&mut self, name: &str) -> RecordResult<()> {
        self.record.set("name", name)
    }

    pub fn enabled(&self) -> RecordResult<bool> {
        Ok(self.record.get_bool("enabled")?.unwrap_or(false))
    }

    pub fn set_enabled(&mut self, enabled: bool) -> RecordResult<()> {
        self.record.set("enabled", enabled)
    }

    pub fn tag_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::TAGS)
    }

    pub fn unscheduled_maintenance_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::UNSCHEDULED_MAINTENANCES)
    }
}
