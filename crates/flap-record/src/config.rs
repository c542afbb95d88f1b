use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`RecordStore`](crate::RecordStore).
///
/// Durations serialize as integer milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Optional prefix for every key, e.g. `"flapjack"`.
    pub namespace: Option<String>,
    /// Maximum time to wait for a cross-class lock.
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    /// Pause between lock acquisition attempts.
    #[serde(with = "millis")]
    pub lock_retry_interval: Duration,
    /// Expiry placed on lock keys, so a crashed holder cannot wedge a scope.
    #[serde(with = "millis")]
    pub lock_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            lock_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(10),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Default configuration with keys under `namespace`.
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
