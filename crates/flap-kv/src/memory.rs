use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::error::{KvError, KvResult};
use crate::traits::{KvBackend, KvGuard, KvOp};

#[derive(Clone, Debug)]
enum Entry {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, i64>),
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        match self {
            Entry::Str { expires_at, .. } => expires_at.map_or(true, |at| at > now),
            Entry::Hash(h) => !h.is_empty(),
            Entry::Set(s) => !s.is_empty(),
            Entry::ZSet(z) => !z.is_empty(),
        }
    }
}

/// In-memory, HashMap-based key-value backend.
///
/// Intended for tests and embedding. All keys live behind a single `RwLock`,
/// so a batch applied under the write lock is atomic with respect to every
/// reader. Lock keys expire lazily when next touched.
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryKv {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a transport outage: while set, every call fails with
    /// [`KvError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys_with_prefix("").map(|k| k.len()).unwrap_or(0)
    }

    /// Returns `true` if no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> KvResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("backend marked unavailable".into()));
        }
        Ok(())
    }

    fn read(&self) -> KvResult<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.check_available()?;
        self.entries
            .read()
            .map_err(|e| KvError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> KvResult<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.check_available()?;
        self.entries
            .write()
            .map_err(|e| KvError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn live<'a>(map: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        map.get(key).filter(|e| e.is_live(Instant::now()))
    }

    fn hash_of<'a>(
        map: &'a HashMap<String, Entry>,
        key: &str,
    ) -> KvResult<Option<&'a BTreeMap<String, String>>> {
        match Self::live(map, key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    fn set_of<'a>(
        map: &'a HashMap<String, Entry>,
        key: &str,
    ) -> KvResult<Option<&'a BTreeSet<String>>> {
        match Self::live(map, key) {
            None => Ok(None),
            Some(Entry::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    fn holds(map: &HashMap<String, Entry>, guard: &KvGuard) -> KvResult<bool> {
        match guard {
            KvGuard::HashEquals { key, fields } => Ok(match Self::hash_of(map, key)? {
                Some(hash) => hash == fields,
                None => fields.is_empty(),
            }),
            KvGuard::SetMember {
                key,
                member,
                present,
            } => Ok(Self::set_of(map, key)?.is_some_and(|s| s.contains(member)) == *present),
        }
    }

    fn zset_of<'a>(
        map: &'a HashMap<String, Entry>,
        key: &str,
    ) -> KvResult<Option<&'a BTreeMap<String, i64>>> {
        match Self::live(map, key) {
            None => Ok(None),
            Some(Entry::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key, "sorted set")),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> KvError {
    KvError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// Apply one op to a scratch copy of the touched keys.
fn apply_op(scratch: &mut HashMap<String, Option<Entry>>, op: &KvOp) -> KvResult<()> {
    let key = op.key();
    let slot = scratch
        .get_mut(key)
        .ok_or_else(|| KvError::Unavailable(format!("key {key} missing from batch scratch")))?;

    match op {
        KvOp::Del { .. } => *slot = None,
        KvOp::HSet { field, value, .. } => {
            match slot.get_or_insert_with(|| Entry::Hash(BTreeMap::new())) {
                Entry::Hash(h) => {
                    h.insert(field.clone(), value.clone());
                }
                _ => return Err(wrong_type(key, "hash")),
            }
        }
        KvOp::HDel { field, .. } => match slot {
            None => {}
            Some(Entry::Hash(h)) => {
                h.remove(field);
            }
            Some(_) => return Err(wrong_type(key, "hash")),
        },
        KvOp::SAdd { member, .. } => {
            match slot.get_or_insert_with(|| Entry::Set(BTreeSet::new())) {
                Entry::Set(s) => {
                    s.insert(member.clone());
                }
                _ => return Err(wrong_type(key, "set")),
            }
        }
        KvOp::SRem { member, .. } => match slot {
            None => {}
            Some(Entry::Set(s)) => {
                s.remove(member);
            }
            Some(_) => return Err(wrong_type(key, "set")),
        },
        KvOp::ZAdd { member, score, .. } => {
            match slot.get_or_insert_with(|| Entry::ZSet(BTreeMap::new())) {
                Entry::ZSet(z) => {
                    z.insert(member.clone(), *score);
                }
                _ => return Err(wrong_type(key, "sorted set")),
            }
        }
        KvOp::ZRem { member, .. } => match slot {
            None => {}
            Some(Entry::ZSet(z)) => {
                z.remove(member);
            }
            Some(_) => return Err(wrong_type(key, "sorted set")),
        },
    }
    Ok(())
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackend for InMemoryKv {
    fn hgetall(&self, key: &str) -> KvResult<BTreeMap<String, String>> {
        let map = self.read()?;
        Ok(Self::hash_of(&map, key)?.cloned().unwrap_or_default())
    }

    fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let map = self.read()?;
        Ok(Self::hash_of(&map, key)?.and_then(|h| h.get(field).cloned()))
    }

    fn smembers(&self, key: &str) -> KvResult<BTreeSet<String>> {
        let map = self.read()?;
        Ok(Self::set_of(&map, key)?.cloned().unwrap_or_default())
    }

    fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let map = self.read()?;
        Ok(Self::set_of(&map, key)?.is_some_and(|s| s.contains(member)))
    }

    fn scard(&self, key: &str) -> KvResult<usize> {
        let map = self.read()?;
        Ok(Self::set_of(&map, key)?.map_or(0, BTreeSet::len))
    }

    fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>> {
        let map = self.read()?;
        Ok(Self::zset_of(&map, key)?.and_then(|z| z.get(member).copied()))
    }

    fn zrange(&self, key: &str) -> KvResult<Vec<(String, i64)>> {
        let map = self.read()?;
        let mut members: Vec<(String, i64)> = Self::zset_of(&map, key)?
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|(am, a), (bm, b)| a.cmp(b).then_with(|| am.cmp(bm)));
        Ok(members)
    }

    fn exists(&self, key: &str) -> KvResult<bool> {
        let map = self.read()?;
        Ok(Self::live(&map, key).is_some())
    }

    fn incr(&self, key: &str) -> KvResult<i64> {
        let mut map = self.write()?;
        let now = Instant::now();
        let current = match map.get(key).filter(|e| e.is_live(now)) {
            None => 0,
            Some(Entry::Str { value, .. }) => value
                .parse::<i64>()
                .map_err(|_| KvError::NotAnInteger(key.to_string()))?,
            Some(_) => return Err(wrong_type(key, "string")),
        };
        let next = current + 1;
        map.insert(
            key.to_string(),
            Entry::Str {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    fn apply_if(&self, guards: &[KvGuard], ops: &[KvOp]) -> KvResult<bool> {
        let mut map = self.write()?;
        let now = Instant::now();

        for guard in guards {
            if !Self::holds(&map, guard)? {
                tracing::trace!(key = guard.key(), ops = ops.len(), "guard failed, batch skipped");
                return Ok(false);
            }
        }

        // Stage every touched key so a failing op leaves the store untouched.
        let mut scratch: HashMap<String, Option<Entry>> = HashMap::new();
        for op in ops {
            let key = op.key();
            if !scratch.contains_key(key) {
                let current = map.get(key).filter(|e| e.is_live(now)).cloned();
                scratch.insert(key.to_string(), current);
            }
        }
        for op in ops {
            apply_op(&mut scratch, op)?;
        }

        for (key, entry) in scratch {
            match entry.filter(|e| e.is_live(now)) {
                Some(e) => {
                    map.insert(key, e);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        tracing::trace!(ops = ops.len(), "batch applied");
        Ok(true)
    }

    fn set_nx_px(&self, key: &str, token: &str, ttl: Duration) -> KvResult<bool> {
        let mut map = self.write()?;
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry::Str {
                value: token.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    fn del_if_eq(&self, key: &str, token: &str) -> KvResult<bool> {
        let mut map = self.write()?;
        let now = Instant::now();
        let holds = matches!(
            map.get(key).filter(|e| e.is_live(now)),
            Some(Entry::Str { value, .. }) if value == token
        );
        if holds {
            map.remove(key);
        }
        Ok(holds)
    }

    fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let map = self.read()?;
        let now = Instant::now();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn hgetall_batch(&self, keys: &[String]) -> KvResult<Vec<BTreeMap<String, String>>> {
        let map = self.read()?;
        keys.iter()
            .map(|k| Ok(Self::hash_of(&map, k)?.cloned().unwrap_or_default()))
            .collect()
    }

    fn smembers_batch(&self, keys: &[String]) -> KvResult<Vec<BTreeSet<String>>> {
        let map = self.read()?;
        keys.iter()
            .map(|k| Ok(Self::set_of(&map, k)?.cloned().unwrap_or_default()))
            .collect()
    }
}

impl std::fmt::Debug for InMemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKv")
            .field("key_count", &self.len())
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}
