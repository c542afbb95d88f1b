use std::collections::BTreeSet;

use flap_record::{Record, RecordResult, RecordStore};

use crate::error::{DataError, DataResult};

/// Typed view over a [`Record`] of one class.
///
/// Implementors supply the class name and the wrapping; lookup, save, and
/// destroy come for free.
pub trait Model: Sized {
    /// Class name in the schema.
    const CLASS: &'static str;

    /// Wrap a record already known to be of [`Self::CLASS`].
    fn wrap(record: Record) -> Self;

    fn record(&self) -> &Record;

    fn record_mut(&mut self) -> &mut Record;

    fn into_record(self) -> Record;

    /// Wrap a record, checking its class.
    fn from_record(record: Record) -> DataResult<Self> {
        if record.class_name() != Self::CLASS {
            return Err(DataError::WrongClass {
                expected: Self::CLASS,
                actual: record.class_name().to_string(),
            });
        }
        Ok(Self::wrap(record))
    }

    /// A new unsaved instance with class defaults applied.
    fn build(store: &RecordStore, id: Option<&str>) -> RecordResult<Self> {
        Ok(Self::wrap(store.new_record(Self::CLASS, id)?))
    }

    fn find(store: &RecordStore, id: &str) -> RecordResult<Option<Self>> {
        Ok(store.find_by_id(Self::CLASS, id)?.map(Self::wrap))
    }

    fn find_strict(store: &RecordStore, id: &str) -> RecordResult<Self> {
        store.find_by_id_strict(Self::CLASS, id).map(Self::wrap)
    }

    fn find_many(store: &RecordStore, ids: &[&str]) -> RecordResult<Vec<Self>> {
        Ok(store
            .find_by_ids(Self::CLASS, ids)?
            .into_iter()
            .map(Self::wrap)
            .collect())
    }

    fn id(&self) -> Option<&str> {
        self.record().id()
    }

    fn save(&mut self, store: &RecordStore) -> RecordResult<()> {
        store.save(self.record_mut())
    }

    fn refresh(&mut self, store: &RecordStore) -> RecordResult<()> {
        store.refresh(self.record_mut())
    }

    fn destroy(&mut self, store: &RecordStore) -> RecordResult<()> {
        store.destroy(self.record_mut())
    }

    /// Ids linked through `relation`. Empty for unsaved records.
    fn linked_ids(&self, store: &RecordStore, relation: &str) -> RecordResult<BTreeSet<String>> {
        match self.id() {
            Some(id) if self.record().is_persisted() => store.ids_for(Self::CLASS, id, relation),
            _ => Ok(BTreeSet::new()),
        }
    }
}

/// Implements [`Model`] for a newtype over [`Record`].
macro_rules! model {
    ($ty:ident, $class:expr) => {
        impl $crate::model::Model for $ty {
            const CLASS: &'static str = $class;

            fn wrap(record: flap_record::Record) -> Self {
                Self { record }
            }

            fn record(&self) -> &flap_record::Record {
                &self.record
            }

            fn record_mut(&mut self) -> &mut flap_record::Record {
                &mut self.record
            }

            fn into_record(self) -> flap_record::Record {
                self.record
            }
        }
    };
}

pub(crate) use model;
