//! Cross-class lock.
//!
//! One lock key per class (`C::lock`), set with `SET NX PX` semantics and a
//! per-acquisition token. Keys are always taken in sorted class order, so two
//! callers with overlapping scopes cannot deadlock; a caller that cannot get
//! every key within the bounded wait gives back what it holds and fails.

use std::thread;
use std::time::Instant;

use flap_kv::KvBackend;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{RecordError, RecordResult};
use crate::keys::KeySpace;

/// Held lock over a set of classes. Released on drop.
pub struct LockGuard<'a> {
    backend: &'a dyn KvBackend,
    classes: Vec<String>,
    held: Vec<String>,
    token: String,
}

impl LockGuard<'_> {
    /// Classes covered by this lock, sorted.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        for key in self.held.iter().rev() {
            match self.backend.del_if_eq(key, &self.token) {
                Ok(true) => debug!(key = %key, "lock released"),
                Ok(false) => warn!(key = %key, "lock expired before release"),
                Err(e) => warn!(key = %key, error = %e, "failed to release lock"),
            }
        }
    }
}

/// Block until every class in `classes` is locked, or the configured wait
/// elapses.
pub(crate) fn acquire<'a>(
    backend: &'a dyn KvBackend,
    keys: &KeySpace,
    config: &StoreConfig,
    classes: &[&str],
) -> RecordResult<LockGuard<'a>> {
    let mut names: Vec<String> = classes.iter().map(|c| c.to_string()).collect();
    names.sort();
    names.dedup();

    let mut guard = LockGuard {
        backend,
        held: Vec::with_capacity(names.len()),
        token: Uuid::now_v7().to_string(),
        classes: names,
    };

    let started = Instant::now();
    let mut waited = false;
    for class in guard.classes.clone() {
        let key = keys.lock(&class);
        loop {
            if backend.set_nx_px(&key, &guard.token, config.lock_ttl)? {
                guard.held.push(key);
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= config.lock_timeout {
                warn!(classes = ?guard.classes, waited_ms = elapsed.as_millis() as u64, "lock timeout");
                return Err(RecordError::LockTimeout {
                    classes: guard.classes.clone(),
                    waited: elapsed,
                });
            }
            if !waited {
                debug!(class = %class, "waiting for lock");
                waited = true;
            }
            thread::sleep(config.lock_retry_interval);
        }
    }

    debug!(classes = ?guard.classes, "lock acquired");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use flap_kv::InMemoryKv;

    fn quick() -> StoreConfig {
        StoreConfig {
            lock_timeout: Duration::from_millis(50),
            lock_retry_interval: Duration::from_millis(5),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn guard_holds_and_releases() {
        let kv = InMemoryKv::new();
        let keys = KeySpace::default();
        {
            let guard = acquire(&kv, &keys, &quick(), &["tag", "check", "tag"]).unwrap();
            assert_eq!(guard.classes(), ["check".to_string(), "tag".to_string()]);
            assert!(kv.exists("check::lock").unwrap());
            assert!(kv.exists("tag::lock").unwrap());
        }
        assert!(!kv.exists("check::lock").unwrap());
        assert!(!kv.exists("tag::lock").unwrap());
    }

    #[test]
    fn overlapping_scope_times_out_and_gives_back_partial_holds() {
        let kv = InMemoryKv::new();
        let keys = KeySpace::default();
        let _held = acquire(&kv, &keys, &quick(), &["tag"]).unwrap();

        let err = acquire(&kv, &keys, &quick(), &["check", "tag"])
            .err()
            .unwrap();
        match err {
            RecordError::LockTimeout { classes, waited } => {
                assert_eq!(classes, vec!["check", "tag"]);
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
        // "check" was taken and must have been handed back.
        assert!(!kv.exists("check::lock").unwrap());
    }

    #[test]
    fn disjoint_scopes_do_not_contend() {
        let kv = InMemoryKv::new();
        let keys = KeySpace::default();
        let _a = acquire(&kv, &keys, &quick(), &["check"]).unwrap();
        let _b = acquire(&kv, &keys, &quick(), &["contact"]).unwrap();
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let kv = InMemoryKv::new();
        let keys = KeySpace::default();
        let config = StoreConfig {
            lock_timeout: Duration::from_secs(2),
            ..quick()
        };
        let guard = acquire(&kv, &keys, &config, &["check"]).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| acquire(&kv, &keys, &config, &["check"]).map(|_| ()));
            thread::sleep(Duration::from_millis(20));
            drop(guard);
            assert!(waiter.join().unwrap().is_ok());
        });
    }

    #[test]
    fn expired_lock_is_not_released_by_its_old_holder() {
        let kv = InMemoryKv::new();
        let keys = KeySpace::default();
        let config = StoreConfig {
            lock_ttl: Duration::from_millis(10),
            ..quick()
        };
        let stale = acquire(&kv, &keys, &config, &["check"]).unwrap();
        thread::sleep(Duration::from_millis(20));
        let fresh = acquire(&kv, &keys, &quick(), &["check"]).unwrap();
        drop(stale);
        assert!(kv.exists("check::lock").unwrap());
        drop(fresh);
        assert!(!kv.exists("check::lock").unwrap());
    }
}
