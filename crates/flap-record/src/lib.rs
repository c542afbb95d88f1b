//! Indexed record store for Flapjack.
//!
//! Gives typed, validated, queryable, relationship-aware persistence on top
//! of a [`flap_kv::KvBackend`]. Each class is declared once as a static
//! [`ClassDef`]; records of that class live in attribute hashes, and every
//! secondary index and association link set is derived state reconciled in
//! the same atomic batch as the attribute write.
//!
//! # Components
//!
//! - [`SchemaRegistry`] -- classes, attribute types, index flags, validators,
//!   and [`AssociationDef`]s
//! - [`KeySpace`] -- deterministic backend key layout
//! - [`IndexManager`] -- equality, sortable, and unique indexes
//! - [`AssociationManager`] -- one-to-many and many-to-many link sets
//! - [`Query`] -- lazy intersect/union/sort/page pipelines
//! - [`RecordStore`] -- record lifecycle and the cross-class lock
//!
//! # Design Rules
//!
//! 1. Attributes are only written through [`RecordStore::save`] and removed
//!    through [`RecordStore::destroy`]; both reconcile indexes and links in
//!    the same batch.
//! 2. Validation runs every validator and reports every violation.
//! 3. A unique collision is a validation failure, never an overwrite.
//! 4. Compound operations spanning classes run under
//!    [`RecordStore::with_lock`].
//! 5. Backend failures propagate unchanged; the store never retries.

pub mod association;
pub mod config;
pub mod error;
pub mod index;
pub mod keys;
pub mod lock;
pub mod query;
pub mod record;
pub mod schema;
pub mod store;
pub mod validation;

pub use association::AssociationManager;
pub use config::StoreConfig;
pub use error::{RecordError, RecordResult};
pub use index::{IndexManager, RawAttributes};
pub use keys::KeySpace;
pub use lock::LockGuard;
pub use query::{Filter, Query};
pub use record::{Change, Phase, Record};
pub use schema::{
    AssociationDef, AttributeDef, Cardinality, ClassDef, SchemaBuilder, SchemaRegistry,
    ID_ATTRIBUTE,
};
pub use store::RecordStore;
pub use validation::{FnValidator, Presence, ValidationErrors, Validator, Violation, ViolationKind};

// Re-export the value layer so downstream crates need one import.
pub use flap_types::{AttrType, Attributes, Value};
