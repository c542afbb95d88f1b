use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::KvResult;

/// A single mutation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvOp {
    /// Set a field in a hash.
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// Remove a field from a hash.
    HDel { key: String, field: String },
    /// Remove a key of any kind.
    Del { key: String },
    /// Add a member to a set.
    SAdd { key: String, member: String },
    /// Remove a member from a set.
    SRem { key: String, member: String },
    /// Add or re-score a member of a sorted set.
    ZAdd {
        key: String,
        member: String,
        score: i64,
    },
    /// Remove a member from a sorted set.
    ZRem { key: String, member: String },
}

impl KvOp {
    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        KvOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        KvOp::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        KvOp::Del { key: key.into() }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: i64) -> Self {
        KvOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    /// The key this op touches.
    pub fn key(&self) -> &str {
        match self {
            KvOp::HSet { key, .. }
            | KvOp::HDel { key, .. }
            | KvOp::Del { key }
            | KvOp::SAdd { key, .. }
            | KvOp::SRem { key, .. }
            | KvOp::ZAdd { key, .. }
            | KvOp::ZRem { key, .. } => key,
        }
    }
}

/// A precondition on current state, checked by [`KvBackend::apply_if`]
/// under the same atomicity as the batch it guards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvGuard {
    /// The hash at `key` holds exactly `fields`. An empty map means the key
    /// does not exist.
    HashEquals {
        key: String,
        fields: BTreeMap<String, String>,
    },
    /// `member` is in the set at `key` exactly when `present` is true.
    SetMember {
        key: String,
        member: String,
        present: bool,
    },
}

impl KvGuard {
    pub fn hash_equals(key: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        KvGuard::HashEquals {
            key: key.into(),
            fields,
        }
    }

    pub fn set_member(key: impl Into<String>, member: impl Into<String>, present: bool) -> Self {
        KvGuard::SetMember {
            key: key.into(),
            member: member.into(),
            present,
        }
    }

    /// The key this guard watches.
    pub fn key(&self) -> &str {
        match self {
            KvGuard::HashEquals { key, .. } | KvGuard::SetMember { key, .. } => key,
        }
    }
}

/// Data-structure key-value backend.
///
/// All implementations must satisfy these invariants:
/// - [`apply_if`](Self::apply_if) is atomic. Its guards are checked and its
///   batch applied with no other write in between; either every op becomes
///   visible to other callers or none does, and no reader sees a
///   half-applied batch.
/// - Reads of an absent key return the empty value of the expected kind
///   (empty map, empty set, `None`).
/// - Hashes, sets, and sorted sets that become empty are removed.
/// - Transport failures are propagated as errors, never silently retried.
pub trait KvBackend: Send + Sync {
    /// All fields of a hash. Empty if the key does not exist.
    fn hgetall(&self, key: &str) -> KvResult<BTreeMap<String, String>>;

    /// A single hash field.
    fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    /// Members of a set. Empty if the key does not exist.
    fn smembers(&self, key: &str) -> KvResult<BTreeSet<String>>;

    /// Whether `member` belongs to the set at `key`.
    fn sismember(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Cardinality of a set.
    fn scard(&self, key: &str) -> KvResult<usize>;

    /// Score of a sorted-set member.
    fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>>;

    /// All sorted-set members in ascending score order (ties by member).
    fn zrange(&self, key: &str) -> KvResult<Vec<(String, i64)>>;

    /// Whether a key of any kind exists.
    fn exists(&self, key: &str) -> KvResult<bool>;

    /// Atomically increment an integer counter, returning the new value.
    fn incr(&self, key: &str) -> KvResult<i64>;

    /// Apply `ops` atomically if every guard holds at apply time.
    ///
    /// Returns `false`, writing nothing, when a guard fails. On Redis this is
    /// WATCH on the guarded keys followed by MULTI/EXEC.
    fn apply_if(&self, guards: &[KvGuard], ops: &[KvOp]) -> KvResult<bool>;

    /// Apply a batch of mutations atomically.
    fn apply(&self, ops: &[KvOp]) -> KvResult<()> {
        self.apply_if(&[], ops).map(|_| ())
    }

    /// Set `key` to `token` with an expiry, only if the key is absent (or
    /// expired). Returns `true` if the key was set.
    fn set_nx_px(&self, key: &str, token: &str, ttl: Duration) -> KvResult<bool>;

    /// Delete `key` only if it currently holds `token`. Returns `true` if
    /// the key was deleted.
    fn del_if_eq(&self, key: &str, token: &str) -> KvResult<bool>;

    /// All live keys starting with `prefix`, sorted.
    ///
    /// Intended for diagnostics and tests; production paths never scan.
    fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>>;

    /// Read several hashes in one round-trip.
    ///
    /// Default implementation calls `hgetall()` for each key. Backends may
    /// override for better performance.
    fn hgetall_batch(&self, keys: &[String]) -> KvResult<Vec<BTreeMap<String, String>>> {
        keys.iter().map(|k| self.hgetall(k)).collect()
    }

    /// Read several sets in one round-trip.
    ///
    /// Default implementation calls `smembers()` for each key.
    fn smembers_batch(&self, keys: &[String]) -> KvResult<Vec<BTreeSet<String>>> {
        keys.iter().map(|k| self.smembers(k)).collect()
    }
}
