use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use flap_record::{AttrType, ClassDef, Record, RecordResult, RecordStore, Value};
use serde_json::Value as Json;

use crate::error::DataError;
use crate::model::{model, Model};
use crate::validators::{string_list, EntitiesOrTags, StringList, TimeRestrictions};

/// Alert severity a rule distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Critical,
}

impl FromStr for Severity {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(DataError::UnknownSeverity(s.to_string())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

/// A notification rule: which events reach a contact, through which media,
/// and when.
#[derive(Clone, Debug)]
pub struct Rule {
    record: Record,
}

model!(Rule, "rule");

impl Rule {
    pub const TAGS: &'static str = "tags";

    pub fn class_def() -> ClassDef {
        ClassDef::new(Self::CLASS)
            .attribute("entities", AttrType::Json)
            .attribute("entity_tags", AttrType::Json)
            .attribute("time_restrictions", AttrType::Json)
            .attribute("warning_media", AttrType::Json)
            .attribute("critical_media", AttrType::Json)
            .attribute("warning_blackhole", AttrType::Boolean)
            .attribute("critical_blackhole", AttrType::Boolean)
            .default_value("warning_blackhole", false)
            .default_value("critical_blackhole", false)
            .validator(StringList::new("entities"))
            .validator(StringList::new("entity_tags"))
            .validator(EntitiesOrTags)
            .validator(TimeRestrictions)
            .validator(StringList::new("warning_media"))
            .validator(StringList::new("critical_media"))
    }

    fn list(&self, attribute: &str) -> RecordResult<Vec<String>> {
        Ok(self
            .record
            .get_json(attribute)?
            .and_then(string_list)
            .unwrap_or_default())
    }

    fn set_list(&mut self, attribute: &str, items: &[&str]) -> RecordResult<()> {
        self.record.set(attribute, Json::from(items.to_vec()))
    }

    pub fn entities(&self) -> RecordResult<Vec<String>> {
        self.list("entities")
    }

    pub fn set_entities(&mut self, entities: &[&str]) -> RecordResult<()> {
        self.set_list("entities", entities)
    }

    pub fn entity_tags(&self) -> RecordResult<Vec<String>> {
        self.list("entity_tags")
    }

    pub fn set_entity_tags(&mut self, tags: &[&str]) -> RecordResult<()> {
        self.set_list("entity_tags", tags)
    }

    /// Raw time restriction objects, for the schedule evaluator.
    pub fn time_restrictions(&self) -> RecordResult<Vec<Json>> {
        Ok(match self.record.get_json("time_restrictions")? {
            Some(Json::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    pub fn set_time_restrictions(&mut self, restrictions: Vec<Json>) -> RecordResult<()> {
        self.record.set("time_restrictions", Json::Array(restrictions))
    }

    pub fn set_media(&mut self, severity: Severity, media: &[&str]) -> RecordResult<()> {
        self.set_list(media_attribute(severity), media)
    }

    pub fn set_blackhole(&mut self, severity: Severity, blackhole: bool) -> RecordResult<()> {
        self.record.set(blackhole_attribute(severity), blackhole)
    }

    /// Whether the rule applies to `event_id` (`entity:check`) on an entity
    /// carrying `entity_tags`.
    ///
    /// A rule with neither entities nor entity tags matches everything. A
    /// rule with entity tags matches when all of them are among
    /// `entity_tags`.
    pub fn match_entity(&self, event_id: &str, entity_tags: &[&str]) -> RecordResult<bool> {
        let entities = self.entities()?;
        let tags = self.entity_tags()?;
        if entities.is_empty() && tags.is_empty() {
            return Ok(true);
        }

        let entity = event_id.split(':').next().unwrap_or(event_id);
        if entities.iter().any(|e| e == entity) {
            return Ok(true);
        }

        let present: BTreeSet<&str> = entity_tags.iter().copied().collect();
        Ok(!tags.is_empty() && tags.iter().all(|t| present.contains(t.as_str())))
    }

    /// Whether notifications of `severity` are swallowed.
    pub fn blackhole(&self, severity: Severity) -> RecordResult<bool> {
        Ok(self
            .record
            .get_bool(blackhole_attribute(severity))?
            .unwrap_or(false))
    }

    /// Media to notify through for `severity`; `None` when never set.
    pub fn media_for_severity(&self, severity: Severity) -> RecordResult<Option<Vec<String>>> {
        Ok(self
            .record
            .get(media_attribute(severity))?
            .and_then(Value::as_json)
            .and_then(string_list))
    }

    pub fn tag_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::TAGS)
    }
}

fn media_attribute(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "warning_media",
        Severity::Critical => "critical_media",
    }
}

fn blackhole_attribute(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "warning_blackhole",
        Severity::Critical => "critical_blackhole",
    }
}
