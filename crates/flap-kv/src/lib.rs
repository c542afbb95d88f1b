//! Key-value backend contract for the Flapjack record store.
//!
//! The record store never talks to a storage engine directly. Everything it
//! persists (attribute hashes, id sets, index sets, sorted indexes, link sets,
//! lock keys) goes through the [`KvBackend`] trait, whose primitives mirror a
//! Redis-style data-structure server.
//!
//! # Backends
//!
//! - [`InMemoryKv`] -- `RwLock`-guarded maps for tests and embedding
//!
//! # Design Rules
//!
//! 1. Every multi-key mutation goes through [`KvBackend::apply`] or
//!    [`KvBackend::apply_if`], which are atomic: readers observe all of a
//!    batch or none of it.
//! 2. A read-modify-write guards the state it read with [`KvGuard`]s, so a
//!    batch built from stale reads is refused instead of applied.
//! 3. Empty hashes, sets, and sorted sets cease to exist.
//! 4. Lock keys carry a TTL and are only released by the token that set them.
//! 5. Transport failures surface as [`KvError::Unavailable`]; the backend
//!    never retries on the caller's behalf.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{KvError, KvResult};
pub use memory::InMemoryKv;
pub use traits::{KvBackend, KvGuard, KvOp};
