use chrono::{DateTime, Utc};
use flap_record::{AttrType, ClassDef, Record, RecordResult};

use crate::model::{model, Model};
use crate::validators::EndAfterStart;

/// An ad-hoc maintenance window suppressing a check's alerts.
#[derive(Clone, Debug)]
pub struct UnscheduledMaintenance {
    record: Record,
}

model!(UnscheduledMaintenance, "unscheduled_maintenance");

impl UnscheduledMaintenance {
    pub fn class_def() -> ClassDef {
        ClassDef::new(Self::CLASS)
            .attribute("start_time", AttrType::Timestamp)
            .attribute("end_time", AttrType::Timestamp)
            .attribute("summary", AttrType::String)
            .sortable("start_time")
            .required("start_time")
            .required("end_time")
            .validator(EndAfterStart)
    }

    pub fn start_time(&self) -> RecordResult<Option<DateTime<Utc>>> {
        self.record.get_timestamp("start_time")
    }

    pub fn end_time(&self) -> RecordResult<Option<DateTime<Utc>>> {
        self.record.get_timestamp("end_time")
    }

    pub fn summary(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("summary")
    }

    pub fn set_window(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> RecordResult<()> {
        self.record.set("start_time", start)?;
        self.record.set("end_time", end)
    }

    pub fn set_summary(&mut self, summary: &str) -> RecordResult<()> {
        self.record.set("summary", summary)
    }

    /// Whether `at` falls inside the window.
    pub fn covers(&self, at: DateTime<Utc>) -> RecordResult<bool> {
        Ok(match (self.start_time()?, self.end_time()?) {
            (Some(start), Some(end)) => start <= at && at < end,
            _ => false,
        })
    }
}
