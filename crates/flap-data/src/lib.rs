//! Flapjack monitoring data on the indexed record store.
//!
//! Declares the platform's record classes and how they relate:
//!
//! | Class                     | Associations                                        |
//! |---------------------------|-----------------------------------------------------|
//! | [`Check`]                 | `tags` (many-to-many), `unscheduled_maintenances`   |
//! | [`Tag`]                   | `checks`, `rules` (many-to-many)                    |
//! | [`Contact`]               | `rules`                                             |
//! | [`Rule`]                  | `tags` (many-to-many)                               |
//! | [`UnscheduledMaintenance`]| none                                                |
//!
//! Typed wrappers implement [`Model`] over a [`flap_record::Record`].
//! [`compound`] holds the creates that span classes and [`jsonapi`] the
//! presenter used by the HTTP gateway.

pub mod check;
pub mod compound;
pub mod contact;
pub mod error;
pub mod jsonapi;
pub mod maintenance;
pub mod model;
pub mod rule;
pub mod tag;
pub mod validators;

pub use check::Check;
pub use compound::{create_check_with_tags, create_tag};
pub use contact::Contact;
pub use error::{DataError, DataResult};
pub use jsonapi::{as_jsonapi, Pagination};
pub use maintenance::UnscheduledMaintenance;
pub use model::Model;
pub use rule::{Rule, Severity};
pub use tag::Tag;

use flap_record::{RecordResult, SchemaRegistry};

/// The schema for every monitoring class.
pub fn schema() -> RecordResult<SchemaRegistry> {
    SchemaRegistry::builder()
        .class(Check::class_def())
        .class(Tag::class_def())
        .class(Contact::class_def())
        .class(Rule::class_def())
        .class(UnscheduledMaintenance::class_def())
        .has_and_belongs_to_many(Check::CLASS, Check::TAGS, Tag::CLASS, Tag::CHECKS)
        .has_many(
            Check::CLASS,
            Check::UNSCHEDULED_MAINTENANCES,
            UnscheduledMaintenance::CLASS,
        )
        .has_and_belongs_to_many(Tag::CLASS, Tag::RULES, Rule::CLASS, Rule::TAGS)
        .has_many(Contact::CLASS, Contact::RULES, Rule::CLASS)
        .build()
}

#[cfg(test)]
pub(crate) fn test_store() -> flap_record::RecordStore {
    use std::sync::Arc;

    let schema = match schema() {
        Ok(schema) => schema,
        Err(e) => panic!("schema: {e}"),
    };
    flap_record::RecordStore::new(
        Arc::new(flap_kv::InMemoryKv::new()),
        schema,
        flap_record::StoreConfig::default(),
    )
}
