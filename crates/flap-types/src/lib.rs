//! Foundation types for Flapjack records.
//!
//! Every attribute persisted by the record store has one of a small set of
//! semantic types. This crate defines those types and the canonical encoding
//! of each value to and from the backend's primitive string form. Every other
//! Flapjack crate depends on `flap-types`.
//!
//! # Key Types
//!
//! - [`AttrType`] -- Semantic type of an attribute (string, boolean, integer, timestamp, JSON)
//! - [`Value`] -- A typed attribute value
//! - [`Attributes`] -- Attribute name to value mapping for one record

pub mod error;
pub mod value;

pub use error::TypeError;
pub use value::{AttrType, Attributes, Value};
