use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flap_kv::{KvBackend, KvGuard, KvOp};
use flap_types::Attributes;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::association::AssociationManager;
use crate::config::StoreConfig;
use crate::error::{RecordError, RecordResult};
use crate::index::{IndexManager, RawAttributes};
use crate::keys::KeySpace;
use crate::lock;
use crate::query::{Filter, Query};
use crate::record::Record;
use crate::schema::{check_name, ClassDef, SchemaRegistry};
use crate::validation::{ValidationErrors, Violation};

/// Reads and batch builds a write may go through before another writer's
/// interference is reported as [`RecordError::WriteConflict`].
const WRITE_ATTEMPTS: usize = 8;

/// Handle to an indexed record store.
///
/// Every operation goes through the injected backend; the store keeps no
/// state of its own besides the frozen schema and its configuration, so it
/// can be shared freely across threads.
pub struct RecordStore {
    backend: Arc<dyn KvBackend>,
    schema: Arc<SchemaRegistry>,
    keys: KeySpace,
    config: StoreConfig,
}

impl RecordStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        schema: impl Into<Arc<SchemaRegistry>>,
        config: StoreConfig,
    ) -> Self {
        Self {
            backend,
            schema: schema.into(),
            keys: KeySpace::new(config.namespace.clone()),
            config,
        }
    }

    pub fn backend(&self) -> &dyn KvBackend {
        self.backend.as_ref()
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn index(&self) -> IndexManager<'_> {
        IndexManager::new(self.backend.as_ref(), &self.keys)
    }

    fn associations(&self) -> AssociationManager<'_> {
        AssociationManager::new(self.backend.as_ref(), &self.keys, &self.schema)
    }

    // ----------------------------------------------------------------
    // Lookup
    // ----------------------------------------------------------------

    /// A fresh unsaved record with the class defaults applied.
    pub fn new_record(&self, class: &str, id: Option<&str>) -> RecordResult<Record> {
        let class = self.schema.class(class)?;
        Ok(Record::new(class, id.map(str::to_string)))
    }

    pub fn exists(&self, class: &str, id: &str) -> RecordResult<bool> {
        self.schema.class(class)?;
        Ok(self.backend.sismember(&self.keys.ids(class), id)?)
    }

    pub fn find_by_id(&self, class: &str, id: &str) -> RecordResult<Option<Record>> {
        let class = self.schema.class(class)?;
        Ok(self.hydrate(&class, &[id.to_string()])?.pop().flatten())
    }

    /// Like [`find_by_id`](Self::find_by_id), but a miss is
    /// [`RecordError::NotFound`].
    pub fn find_by_id_strict(&self, class: &str, id: &str) -> RecordResult<Record> {
        self.find_by_id(class, id)?
            .ok_or_else(|| RecordError::NotFound {
                class: class.to_string(),
                ids: vec![id.to_string()],
            })
    }

    /// Records for every id, in the order given. Any miss fails the whole
    /// lookup with the list of missing ids.
    pub fn find_by_ids(&self, class: &str, ids: &[&str]) -> RecordResult<Vec<Record>> {
        let class_def = self.schema.class(class)?;
        let wanted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let loaded = self.hydrate(&class_def, &wanted)?;

        let mut records = Vec::with_capacity(loaded.len());
        let mut missing = Vec::new();
        for (id, record) in wanted.into_iter().zip(loaded) {
            match record {
                Some(record) => records.push(record),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            return Err(RecordError::NotFound {
                class: class.to_string(),
                ids: missing,
            });
        }
        Ok(records)
    }

    /// Load records in bulk: one id-set read plus one batched hash read.
    pub(crate) fn hydrate(
        &self,
        class: &Arc<ClassDef>,
        ids: &[String],
    ) -> RecordResult<Vec<Option<Record>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let members = self.backend.smembers(&self.keys.ids(class.name()))?;
        let hash_keys: Vec<String> = ids
            .iter()
            .map(|id| self.keys.attrs(class.name(), id))
            .collect();
        let hashes = self.backend.hgetall_batch(&hash_keys)?;

        ids.iter()
            .zip(hashes)
            .map(|(id, raw)| {
                if !members.contains(id) {
                    return Ok(None);
                }
                let attrs = decode(class, id, &raw)?;
                Ok(Some(Record::loaded(Arc::clone(class), id.clone(), attrs)))
            })
            .collect()
    }

    // ----------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------

    /// Every record of `class`, as a query to refine.
    pub fn query(&self, class: &str) -> RecordResult<Query<'_>> {
        Ok(Query::new(self, self.schema.class(class)?))
    }

    pub fn intersect(&self, class: &str, filter: Filter) -> RecordResult<Query<'_>> {
        Ok(self.query(class)?.intersect(filter))
    }

    pub fn union(&self, class: &str, filter: Filter) -> RecordResult<Query<'_>> {
        Ok(self.query(class)?.union(filter))
    }

    pub fn sort(&self, class: &str, attribute: &str) -> RecordResult<Query<'_>> {
        Ok(self.query(class)?.sort(attribute))
    }

    pub fn count(&self, class: &str) -> RecordResult<usize> {
        self.schema.class(class)?;
        Ok(self.backend.scard(&self.keys.ids(class))?)
    }

    pub fn all(&self, class: &str) -> RecordResult<Vec<Record>> {
        self.query(class)?.all()
    }

    /// Records linked from `class:owner_id` through `relation`, as a query
    /// over the target class.
    pub fn associated(&self, class: &str, owner_id: &str, relation: &str) -> RecordResult<Query<'_>> {
        let assoc = self.schema.association(class, relation)?.clone();
        let target = self.schema.class(&assoc.target)?;
        Ok(Query::associated(self, target, assoc, owner_id))
    }

    // ----------------------------------------------------------------
    // Associations
    // ----------------------------------------------------------------

    pub fn link(&self, class: &str, owner_id: &str, relation: &str, target_ids: &[&str]) -> RecordResult<()> {
        self.associations().link(class, owner_id, relation, target_ids)
    }

    pub fn unlink(&self, class: &str, owner_id: &str, relation: &str, target_ids: &[&str]) -> RecordResult<()> {
        self.associations().unlink(class, owner_id, relation, target_ids)
    }

    pub fn ids_for(&self, class: &str, owner_id: &str, relation: &str) -> RecordResult<BTreeSet<String>> {
        self.associations().ids_for(class, owner_id, relation)
    }

    pub fn bulk_ids_for(
        &self,
        class: &str,
        owner_ids: &[&str],
        relation: &str,
    ) -> RecordResult<BTreeMap<String, BTreeSet<String>>> {
        self.associations().bulk_ids_for(class, owner_ids, relation)
    }

    // ----------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------

    /// Run every check `save` would run and return all violations.
    pub fn validate(&self, record: &Record) -> RecordResult<ValidationErrors> {
        record.ensure_live()?;
        self.violations(record, record.id())
    }

    fn violations(&self, record: &Record, id: Option<&str>) -> RecordResult<ValidationErrors> {
        let class = record.class();
        let attrs = record.raw_attributes();
        let mut errors = ValidationErrors::new();

        // Ids are spliced into keys, so they follow the schema naming rules.
        if let Some(Err(reason)) = id.map(check_name) {
            errors.push(Violation::custom("id_format", Some("id"), reason));
        }

        for (name, value) in attrs {
            if let Some(def) = class.attribute_def(name) {
                if let Err(e) = value.expect_type(def.attr_type) {
                    errors.push(Violation::type_mismatch(name, e.to_string()));
                }
            }
        }

        for validator in class.validators() {
            errors.extend(validator.validate(id.unwrap_or_default(), attrs));
        }

        let index = self.index();
        let owner = if record.is_persisted() { id } else { None };
        for def in class.unique_attributes() {
            let Some(value) = attrs.get(&def.name) else {
                continue;
            };
            if value.attr_type() == def.attr_type
                && index.unique_check(class, &def.name, value, owner)?
            {
                errors.push(Violation::unique(&def.name, "has already been taken"));
            }
        }

        if let (false, Some(id)) = (record.is_persisted(), id) {
            if self.backend.sismember(&self.keys.ids(class.name()), id)? {
                errors.push(Violation::unique("id", "has already been taken"));
            }
        }

        Ok(errors)
    }

    /// Validate and persist `record`.
    ///
    /// New records get a UUID v7 id if they have none. The attribute write,
    /// the id-set insert, and every index update go to the backend as one
    /// batch, guarded by the stored state the batch was built from. If
    /// another writer changed that state in between, the record is
    /// validated and the batch rebuilt against the fresh state. A persisted
    /// record with no changes is left alone.
    pub fn save(&self, record: &mut Record) -> RecordResult<()> {
        record.ensure_live()?;
        let is_new = !record.is_persisted();
        if !is_new && !record.is_dirty() {
            return Ok(());
        }

        let class = record.class_def();
        let id = match record.id() {
            Some(id) => id.to_string(),
            None => Uuid::now_v7().to_string(),
        };
        let attrs_key = self.keys.attrs(class.name(), &id);
        let ids_key = self.keys.ids(class.name());

        for attempt in 1..=WRITE_ATTEMPTS {
            let errors = self.violations(record, Some(id.as_str()))?;
            if !errors.is_empty() {
                info!(class = class.name(), id = %id, errors = %errors, "validation error");
                return Err(RecordError::ValidationFailed(errors));
            }

            let old = if is_new {
                None
            } else {
                if !self.backend.sismember(&ids_key, &id)? {
                    return Err(RecordError::NotFound {
                        class: class.name().to_string(),
                        ids: vec![id],
                    });
                }
                Some(self.backend.hgetall(&attrs_key)?)
            };

            let ops = self.save_ops(&class, &id, old.as_ref(), record.raw_attributes(), is_new)?;
            let guards = [
                KvGuard::set_member(ids_key.clone(), id.clone(), !is_new),
                KvGuard::hash_equals(attrs_key.clone(), old.unwrap_or_default()),
            ];
            if self.backend.apply_if(&guards, &ops)? {
                debug!(class = class.name(), id = %id, new = is_new, ops = ops.len(), attempt, "saved");
                record.mark_persisted(id);
                return Ok(());
            }
            debug!(class = class.name(), id = %id, attempt, "record changed underneath save, retrying");
        }

        Err(RecordError::WriteConflict {
            class: class.name().to_string(),
            id,
            attempts: WRITE_ATTEMPTS,
        })
    }

    fn save_ops(
        &self,
        class: &ClassDef,
        id: &str,
        old: Option<&RawAttributes>,
        new: &Attributes,
        is_new: bool,
    ) -> RecordResult<Vec<KvOp>> {
        let attrs_key = self.keys.attrs(class.name(), id);
        let mut ops = Vec::new();
        for (name, value) in new {
            let encoded = value.encode();
            let unchanged = old
                .and_then(|raw| raw.get(name))
                .is_some_and(|prev| *prev == encoded);
            if !unchanged {
                ops.push(KvOp::hset(attrs_key.clone(), name.clone(), encoded));
            }
        }
        if let Some(raw) = old {
            for name in raw.keys().filter(|name| !new.contains_key(*name)) {
                ops.push(KvOp::hdel(attrs_key.clone(), name.clone()));
            }
        }
        if is_new {
            ops.push(KvOp::sadd(self.keys.ids(class.name()), id));
        }
        ops.extend(self.index().on_save(class, id, old, new)?);
        Ok(ops)
    }

    /// Reload a persisted record, discarding in-memory edits.
    pub fn refresh(&self, record: &mut Record) -> RecordResult<()> {
        record.ensure_live()?;
        let id = self.persisted_id(record)?;
        let class = record.class_def();

        if !self.backend.sismember(&self.keys.ids(class.name()), &id)? {
            return Err(RecordError::NotFound {
                class: class.name().to_string(),
                ids: vec![id],
            });
        }
        let raw = self.backend.hgetall(&self.keys.attrs(class.name(), &id))?;
        record.reload(decode(&class, &id, &raw)?);
        Ok(())
    }

    /// Remove the record, its index entries, and every association link that
    /// mentions it, in one batch guarded like [`save`](Self::save).
    pub fn destroy(&self, record: &mut Record) -> RecordResult<()> {
        record.ensure_live()?;
        let id = self.persisted_id(record)?;
        let class = record.class_def();
        let attrs_key = self.keys.attrs(class.name(), &id);
        let ids_key = self.keys.ids(class.name());

        for attempt in 1..=WRITE_ATTEMPTS {
            let listed = self.backend.sismember(&ids_key, &id)?;
            let raw = self.backend.hgetall(&attrs_key)?;
            let mut ops = vec![
                KvOp::del(attrs_key.clone()),
                KvOp::srem(ids_key.clone(), id.clone()),
            ];
            ops.extend(self.index().on_destroy(&class, &id, &raw)?);
            ops.extend(self.associations().on_destroy(class.name(), &id)?);

            let guards = [
                KvGuard::set_member(ids_key.clone(), id.clone(), listed),
                KvGuard::hash_equals(attrs_key.clone(), raw),
            ];
            if self.backend.apply_if(&guards, &ops)? {
                debug!(class = class.name(), id = %id, ops = ops.len(), attempt, "destroyed");
                record.mark_destroyed();
                return Ok(());
            }
            debug!(class = class.name(), id = %id, attempt, "record changed underneath destroy, retrying");
        }

        Err(RecordError::WriteConflict {
            class: class.name().to_string(),
            id,
            attempts: WRITE_ATTEMPTS,
        })
    }

    fn persisted_id(&self, record: &Record) -> RecordResult<String> {
        match (record.is_persisted(), record.id()) {
            (true, Some(id)) => Ok(id.to_string()),
            _ => Err(RecordError::Unsaved {
                class: record.class_name().to_string(),
            }),
        }
    }

    // ----------------------------------------------------------------
    // Locking
    // ----------------------------------------------------------------

    /// Run `body` while holding the cross-class lock on `classes`.
    ///
    /// The lock is released on every exit path, including an error or panic
    /// inside `body`. It is not reentrant: locking an overlapping scope from
    /// inside `body` waits for the outer lock and times out.
    pub fn with_lock<T, E, F>(&self, classes: &[&str], body: F) -> Result<T, E>
    where
        F: FnOnce(&RecordStore) -> Result<T, E>,
        E: From<RecordError>,
    {
        for class in classes {
            self.schema.class(class)?;
        }
        let _guard = lock::acquire(self.backend.as_ref(), &self.keys, &self.config, classes)?;
        body(self)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Decode a stored hash by the class schema. Fields the schema no longer
/// declares are skipped.
fn decode(class: &ClassDef, id: &str, raw: &RawAttributes) -> RecordResult<Attributes> {
    let mut attrs = Attributes::new();
    for (name, encoded) in raw {
        match class.attribute_def(name) {
            Some(def) => {
                attrs.insert(name.clone(), def.attr_type.decode(encoded)?);
            }
            None => trace!(class = class.name(), id, field = %name, "skipping undeclared field"),
        }
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use chrono::DateTime;
    use flap_kv::{InMemoryKv, KvError, KvResult};
    use flap_types::{AttrType, Value};

    use crate::validation::{FnValidator, ViolationKind};

    fn widget() -> ClassDef {
        ClassDef::define(
            "widget",
            &[("name", AttrType::String), ("enabled", AttrType::Boolean)],
            &["enabled"],
            &["name"],
        )
        .default_value("enabled", false)
        .required("name")
    }

    fn schema() -> SchemaRegistry {
        SchemaRegistry::builder()
            .class(widget())
            .class(
                ClassDef::new("part")
                    .attribute("label", AttrType::String)
                    .attribute("weight", AttrType::Integer)
                    .attribute("inspected_at", AttrType::Timestamp)
                    .indexed("weight")
                    .validator(FnValidator::new("positive_weight", |_, attrs| {
                        match attrs.get("weight").and_then(Value::as_i64) {
                            Some(w) if w <= 0 => vec![Violation::custom(
                                "positive_weight",
                                Some("weight"),
                                "must be positive",
                            )],
                            _ => Vec::new(),
                        }
                    })),
            )
            .has_and_belongs_to_many("widget", "parts", "part", "widgets")
            .has_many("part", "spares", "widget")
            .build()
            .unwrap()
    }

    fn setup() -> (Arc<InMemoryKv>, RecordStore) {
        let kv = Arc::new(InMemoryKv::new());
        let store = RecordStore::new(kv.clone(), schema(), StoreConfig::default());
        (kv, store)
    }

    fn save_widget(store: &RecordStore, id: &str, name: &str, enabled: bool) -> RecordResult<Record> {
        let mut record = store.new_record("widget", Some(id))?;
        record.set("name", name)?;
        record.set("enabled", enabled)?;
        store.save(&mut record)?;
        Ok(record)
    }

    // ----------------------------------------------------------------
    // Save / find
    // ----------------------------------------------------------------

    #[test]
    fn save_then_find_round_trips() {
        let (kv, store) = setup();
        save_widget(&store, "a", "x", true).unwrap();

        let found = store.find_by_id("widget", "a").unwrap().unwrap();
        assert_eq!(found.get_str("name").unwrap(), Some("x"));
        assert_eq!(found.get_bool("enabled").unwrap(), Some(true));
        assert!(found.changed().is_empty());

        assert_eq!(kv.hget("widget:a:attrs", "enabled").unwrap().as_deref(), Some("true"));
        assert!(kv.sismember("widget::ids", "a").unwrap());
        assert!(store.exists("widget", "a").unwrap());
        assert!(store.find_by_id("widget", "b").unwrap().is_none());
    }

    #[test]
    fn generated_ids_are_assigned_on_success() {
        let (_kv, store) = setup();
        let mut record = store.new_record("widget", None).unwrap();
        assert!(store.save(&mut record).is_err());
        assert_eq!(record.id(), None);

        record.set("name", "gen").unwrap();
        store.save(&mut record).unwrap();
        let id = record.id().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(store.exists("widget", &id).unwrap());
    }

    #[test]
    fn default_lands_in_the_false_index() {
        let (_kv, store) = setup();
        let mut record = store.new_record("widget", Some("d")).unwrap();
        record.set("name", "defaulted").unwrap();
        store.save(&mut record).unwrap();
        let q = store.intersect("widget", Filter::new().eq("enabled", false)).unwrap();
        assert_eq!(q.ids().unwrap(), vec!["d"]);
    }

    #[test]
    fn strict_lookups_list_missing_ids() {
        let (_kv, store) = setup();
        save_widget(&store, "a", "x", true).unwrap();
        match store.find_by_ids("widget", &["a", "b", "c"]).unwrap_err() {
            RecordError::NotFound { class, ids } => {
                assert_eq!(class, "widget");
                assert_eq!(ids, vec!["b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            store.find_by_id_strict("widget", "b"),
            Err(RecordError::NotFound { .. })
        ));
        assert_eq!(store.find_by_ids("widget", &["a"]).unwrap().len(), 1);
    }

    #[test]
    fn update_moves_index_entries_and_removes_unset_fields() {
        let (kv, store) = setup();
        let mut record = save_widget(&store, "a", "x", true).unwrap();

        record.set("enabled", false).unwrap();
        record.set("name", "y").unwrap();
        store.save(&mut record).unwrap();

        assert!(!kv.exists("widget::by_enabled:set:true").unwrap());
        assert!(kv.sismember("widget::by_enabled:set:false", "a").unwrap());
        assert_eq!(kv.hget("widget::by_name:unique", "x").unwrap(), None);
        assert_eq!(kv.hget("widget::by_name:unique", "y").unwrap().as_deref(), Some("a"));

        let mut part = store.new_record("part", Some("p")).unwrap();
        part.set("label", "bolt").unwrap();
        part.set("weight", 3_i64).unwrap();
        store.save(&mut part).unwrap();
        part.unset("weight").unwrap();
        store.save(&mut part).unwrap();
        assert_eq!(kv.hget("part:p:attrs", "weight").unwrap(), None);
        assert!(!kv.exists("part::by_weight:set:3").unwrap());
    }

    #[test]
    fn timestamps_round_trip_at_stored_precision() {
        let (_kv, store) = setup();
        let at = DateTime::parse_from_rfc3339("2023-11-14T22:13:20.500Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let mut part = store.new_record("part", Some("p")).unwrap();
        part.set("inspected_at", at).unwrap();
        part.set("weight", 1_i64).unwrap();
        store.save(&mut part).unwrap();

        let found = store.find_by_id_strict("part", "p").unwrap();
        assert_eq!(found.attributes().unwrap(), part.attributes().unwrap());
        assert_eq!(
            found.get_timestamp("inspected_at").unwrap(),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert!(!part.is_dirty());

        // A raw sub-second value is trimmed on set, so it is not a change.
        part.set("inspected_at", Value::Timestamp(at)).unwrap();
        assert!(part.changed().is_empty());
    }

    #[test]
    fn ids_must_be_usable_in_keys() {
        let (kv, store) = setup();
        for id in ["", ":by_name:set", "a b", "ns/x"] {
            let err = save_widget(&store, id, &format!("w{}", id.len()), true).unwrap_err();
            let errors = err.validation_errors().unwrap();
            assert_eq!(errors.on("id").len(), 1, "id {id:?}");
        }
        assert!(kv.keys_with_prefix("widget").unwrap().is_empty());
        save_widget(&store, "w-1", "ok", true).unwrap();
    }

    #[test]
    fn resaving_own_unique_value_is_allowed() {
        let (_kv, store) = setup();
        let mut record = save_widget(&store, "a", "x", true).unwrap();
        record.set("enabled", false).unwrap();
        store.save(&mut record).unwrap();
        // No changes: nothing to do.
        store.save(&mut record).unwrap();
    }

    // ----------------------------------------------------------------
    // Validation
    // ----------------------------------------------------------------

    #[test]
    fn unique_collision_is_a_validation_failure() {
        let (_kv, store) = setup();
        save_widget(&store, "a", "x", true).unwrap();

        let err = save_widget(&store, "b", "x", true).unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(err.validation_errors().unwrap().on("name"), vec!["has already been taken"]);

        let q = store.intersect("widget", Filter::new().eq("enabled", true)).unwrap();
        assert_eq!(q.count().unwrap(), 1);
        assert!(store.find_by_id("widget", "a").unwrap().is_some());
        assert!(!store.exists("widget", "b").unwrap());
    }

    #[test]
    fn taken_id_is_a_validation_failure() {
        let (_kv, store) = setup();
        save_widget(&store, "a", "x", true).unwrap();
        let err = save_widget(&store, "a", "other", true).unwrap_err();
        assert_eq!(err.validation_errors().unwrap().on("id"), vec!["has already been taken"]);
        let kept = store.find_by_id_strict("widget", "a").unwrap();
        assert_eq!(kept.get_str("name").unwrap(), Some("x"));
    }

    #[test]
    fn every_violation_is_reported() {
        let (_kv, store) = setup();
        let mut part = store.new_record("part", Some("p")).unwrap();
        part.set("weight", -1_i64).unwrap();
        store.save(&mut part).unwrap_err();

        let mut widget = store.new_record("widget", Some("w")).unwrap();
        widget.set("enabled", "yes").unwrap();
        let errors = store.validate(&widget).unwrap();
        let kinds: Vec<&ViolationKind> = errors.iter().map(|v| &v.kind).collect();
        assert_eq!(kinds, vec![&ViolationKind::Type, &ViolationKind::Required]);

        let err = store.save(&mut widget).unwrap_err();
        assert_eq!(err.validation_errors().unwrap().len(), 2);
        assert_eq!(widget.phase(), crate::record::Phase::Unsaved);
    }

    #[test]
    fn custom_validator_runs_on_save() {
        let (_kv, store) = setup();
        let mut part = store.new_record("part", Some("p")).unwrap();
        part.set("weight", 0_i64).unwrap();
        let err = store.save(&mut part).unwrap_err();
        let violation = err.validation_errors().unwrap().iter().next().unwrap().clone();
        assert_eq!(violation.kind, ViolationKind::Custom("positive_weight".into()));
        assert_eq!(violation.to_string(), "weight must be positive");
    }

    // ----------------------------------------------------------------
    // Refresh / destroy
    // ----------------------------------------------------------------

    #[test]
    fn refresh_discards_edits() {
        let (_kv, store) = setup();
        let mut record = save_widget(&store, "a", "x", true).unwrap();
        record.set("name", "edited").unwrap();
        assert_eq!(record.changed(), vec!["name"]);

        store.refresh(&mut record).unwrap();
        assert_eq!(record.get_str("name").unwrap(), Some("x"));
        assert!(record.changes().is_empty());

        let mut unsaved = store.new_record("widget", Some("u")).unwrap();
        assert!(matches!(store.refresh(&mut unsaved), Err(RecordError::Unsaved { .. })));
    }

    #[test]
    fn refresh_sees_concurrent_writes() {
        let (_kv, store) = setup();
        let mut mine = save_widget(&store, "a", "x", true).unwrap();
        let mut theirs = store.find_by_id_strict("widget", "a").unwrap();
        theirs.set("enabled", false).unwrap();
        store.save(&mut theirs).unwrap();

        store.refresh(&mut mine).unwrap();
        assert_eq!(mine.get_bool("enabled").unwrap(), Some(false));
    }

    #[test]
    fn destroy_is_terminal() {
        let (_kv, store) = setup();
        let mut record = save_widget(&store, "a", "x", true).unwrap();
        store.destroy(&mut record).unwrap();
        assert!(record.is_destroyed());
        assert!(matches!(
            store.destroy(&mut record),
            Err(RecordError::DestroyedRecordAccess { .. })
        ));
        assert!(matches!(
            store.save(&mut record),
            Err(RecordError::DestroyedRecordAccess { .. })
        ));
        assert!(!store.exists("widget", "a").unwrap());

        // The unique value is free again.
        save_widget(&store, "b", "x", true).unwrap();
    }

    #[test]
    fn destroy_leaves_no_record_state_behind() {
        let (kv, store) = setup();
        let mut widget = save_widget(&store, "w", "x", true).unwrap();
        let mut part = store.new_record("part", Some("p")).unwrap();
        part.set("weight", 2_i64).unwrap();
        store.save(&mut part).unwrap();
        store.link("widget", "w", "parts", &["p"]).unwrap();
        store.link("part", "p", "spares", &["w"]).unwrap();

        store.destroy(&mut widget).unwrap();
        assert!(kv.keys_with_prefix("widget:").unwrap().is_empty());
        assert!(store.ids_for("part", "p", "widgets").unwrap().is_empty());
        assert!(store.ids_for("part", "p", "spares").unwrap().is_empty());

        store.destroy(&mut part).unwrap();
        assert!(kv.keys_with_prefix("part:").unwrap().is_empty());
    }

    #[test]
    fn unavailable_backend_propagates_and_leaves_state() {
        let (kv, store) = setup();
        let mut record = save_widget(&store, "a", "x", true).unwrap();
        record.set("enabled", false).unwrap();

        kv.set_unavailable(true);
        let err = store.save(&mut record).unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(matches!(err, RecordError::Backend(KvError::Unavailable(_))));
        kv.set_unavailable(false);

        assert!(record.is_dirty());
        let stored = store.find_by_id_strict("widget", "a").unwrap();
        assert_eq!(stored.get_bool("enabled").unwrap(), Some(true));
    }

    // ----------------------------------------------------------------
    // Concurrent writers
    // ----------------------------------------------------------------

    type Hook = Box<dyn FnOnce() + Send>;

    /// Runs `hook` once, right after the first `hgetall` of `key` returns,
    /// so another writer lands between a read and the batch built from it.
    struct Interleaved {
        inner: Arc<InMemoryKv>,
        key: String,
        hook: Mutex<Option<Hook>>,
    }

    impl Interleaved {
        fn new(inner: Arc<InMemoryKv>, key: &str, hook: impl FnOnce() + Send + 'static) -> Self {
            Self {
                inner,
                key: key.to_string(),
                hook: Mutex::new(Some(Box::new(hook))),
            }
        }
    }

    impl KvBackend for Interleaved {
        fn hgetall(&self, key: &str) -> KvResult<BTreeMap<String, String>> {
            let hash = self.inner.hgetall(key)?;
            if key == self.key {
                let hook = self.hook.lock().unwrap().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            Ok(hash)
        }
        fn hgetall_batch(&self, keys: &[String]) -> KvResult<Vec<BTreeMap<String, String>>> {
            self.inner.hgetall_batch(keys)
        }
        fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
            self.inner.hget(key, field)
        }
        fn smembers(&self, key: &str) -> KvResult<BTreeSet<String>> {
            self.inner.smembers(key)
        }
        fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
            self.inner.sismember(key, member)
        }
        fn scard(&self, key: &str) -> KvResult<usize> {
            self.inner.scard(key)
        }
        fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>> {
            self.inner.zscore(key, member)
        }
        fn zrange(&self, key: &str) -> KvResult<Vec<(String, i64)>> {
            self.inner.zrange(key)
        }
        fn exists(&self, key: &str) -> KvResult<bool> {
            self.inner.exists(key)
        }
        fn incr(&self, key: &str) -> KvResult<i64> {
            self.inner.incr(key)
        }
        fn apply_if(&self, guards: &[KvGuard], ops: &[KvOp]) -> KvResult<bool> {
            self.inner.apply_if(guards, ops)
        }
        fn set_nx_px(&self, key: &str, token: &str, ttl: Duration) -> KvResult<bool> {
            self.inner.set_nx_px(key, token, ttl)
        }
        fn del_if_eq(&self, key: &str, token: &str) -> KvResult<bool> {
            self.inner.del_if_eq(key, token)
        }
        fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
            self.inner.keys_with_prefix(prefix)
        }
    }

    fn save_part(store: &RecordStore, id: &str, weight: i64) {
        let mut part = match store.find_by_id("part", id).unwrap() {
            Some(part) => part,
            None => store.new_record("part", Some(id)).unwrap(),
        };
        part.set("weight", weight).unwrap();
        store.save(&mut part).unwrap();
    }

    /// A store whose next read of `part:p:attrs` lets another store move
    /// the part to `weight`.
    fn racing_store(kv: &Arc<InMemoryKv>, weight: i64) -> RecordStore {
        let other = Arc::clone(kv);
        let backend = Interleaved::new(Arc::clone(kv), "part:p:attrs", move || {
            let store = RecordStore::new(other, schema(), StoreConfig::default());
            save_part(&store, "p", weight);
        });
        RecordStore::new(Arc::new(backend), schema(), StoreConfig::default())
    }

    #[test]
    fn save_racing_another_update_keeps_one_index_entry() {
        let (kv, store) = setup();
        save_part(&store, "p", 1);

        let racing = racing_store(&kv, 3);
        let mut mine = racing.find_by_id_strict("part", "p").unwrap();
        mine.set("weight", 2_i64).unwrap();
        racing.save(&mut mine).unwrap();

        assert_eq!(kv.hget("part:p:attrs", "weight").unwrap().as_deref(), Some("2"));
        assert_eq!(
            kv.keys_with_prefix("part::by_weight").unwrap(),
            vec!["part::by_weight:set:2".to_string()]
        );
        assert!(kv.sismember("part::by_weight:set:2", "p").unwrap());
        assert!(!mine.is_dirty());
    }

    #[test]
    fn destroy_racing_an_update_leaves_no_index_entry() {
        let (kv, store) = setup();
        save_part(&store, "p", 1);

        let racing = racing_store(&kv, 3);
        let mut mine = racing.find_by_id_strict("part", "p").unwrap();
        racing.destroy(&mut mine).unwrap();

        assert!(mine.is_destroyed());
        assert!(kv.keys_with_prefix("part:").unwrap().is_empty());
    }

    // ----------------------------------------------------------------
    // Associations through the store
    // ----------------------------------------------------------------

    #[test]
    fn link_and_associated_query() {
        let (_kv, store) = setup();
        save_widget(&store, "w", "x", true).unwrap();
        for (id, weight) in [("p1", 1_i64), ("p2", 5)] {
            let mut part = store.new_record("part", Some(id)).unwrap();
            part.set("weight", weight).unwrap();
            store.save(&mut part).unwrap();
        }
        store.link("widget", "w", "parts", &["p1", "p2"]).unwrap();

        let heavy = store
            .associated("widget", "w", "parts")
            .unwrap()
            .intersect(Filter::new().eq("weight", 5_i64))
            .ids()
            .unwrap();
        assert_eq!(heavy, vec!["p2"]);
        assert_eq!(store.ids_for("part", "p1", "widgets").unwrap().len(), 1);

        store.unlink("part", "p1", "widgets", &["w"]).unwrap();
        assert_eq!(
            store.ids_for("widget", "w", "parts").unwrap(),
            BTreeSet::from(["p2".to_string()])
        );
        assert!(store.exists("part", "p1").unwrap());
    }

    // ----------------------------------------------------------------
    // Locking
    // ----------------------------------------------------------------

    #[test]
    fn with_lock_check_then_insert_admits_one_writer() {
        let kv = Arc::new(InMemoryKv::new());
        let config = StoreConfig {
            lock_timeout: Duration::from_secs(5),
            ..StoreConfig::default()
        };
        let store = RecordStore::new(kv, schema(), config);
        let barrier = Barrier::new(2);

        let results: Vec<RecordResult<()>> = thread::scope(|s| {
            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|id| {
                    let store = &store;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        store.with_lock(&["widget"], |store| {
                            let taken = store
                                .intersect("widget", Filter::new().eq("name", "shared"))?
                                .exists()?;
                            thread::sleep(Duration::from_millis(20));
                            let saved = save_widget(store, id, "shared", true).map(|_| ());
                            assert_eq!(taken, saved.is_err());
                            saved
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let failed = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(failed.is_unique_violation());
        assert_eq!(store.count("widget").unwrap(), 1);
    }

    #[test]
    fn with_lock_releases_after_error() {
        let (kv, store) = setup();
        let result: RecordResult<()> = store.with_lock(&["widget", "part"], |_| {
            Err(RecordError::Schema("boom".into()))
        });
        assert!(result.is_err());
        assert!(!kv.exists("widget::lock").unwrap());
        assert!(!kv.exists("part::lock").unwrap());

        assert!(matches!(
            store.with_lock(&["gadget"], |_| Ok::<_, RecordError>(())),
            Err(RecordError::UnknownClass(_))
        ));
    }

    // ----------------------------------------------------------------
    // Index consistency property
    // ----------------------------------------------------------------

    mod property {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Action {
            Save { id: u8, weight: i64 },
            Destroy { id: u8 },
        }

        fn arb_action() -> impl Strategy<Value = Action> {
            prop_oneof![
                (0u8..4, 1i64..4).prop_map(|(id, weight)| Action::Save { id, weight }),
                (0u8..4).prop_map(|id| Action::Destroy { id }),
            ]
        }

        proptest! {
            #[test]
            fn index_entries_track_current_values(actions in prop::collection::vec(arb_action(), 1..40)) {
                let (kv, store) = setup();
                let mut expected: BTreeMap<String, i64> = BTreeMap::new();

                for action in actions {
                    match action {
                        Action::Save { id, weight } => {
                            let id = format!("p{id}");
                            let mut record = match store.find_by_id("part", &id).unwrap() {
                                Some(record) => record,
                                None => store.new_record("part", Some(id.as_str())).unwrap(),
                            };
                            record.set("weight", weight).unwrap();
                            store.save(&mut record).unwrap();
                            expected.insert(id, weight);
                        }
                        Action::Destroy { id } => {
                            let id = format!("p{id}");
                            if let Some(mut record) = store.find_by_id("part", &id).unwrap() {
                                store.destroy(&mut record).unwrap();
                            }
                            expected.remove(&id);
                        }
                    }
                }

                for weight in 1i64..4 {
                    let key = format!("part::by_weight:set:{weight}");
                    let actual = kv.smembers(&key).unwrap();
                    let wanted: BTreeSet<String> = expected
                        .iter()
                        .filter(|(_, w)| **w == weight)
                        .map(|(id, _)| id.clone())
                        .collect();
                    prop_assert_eq!(actual, wanted);
                }
                prop_assert_eq!(store.count("part").unwrap(), expected.len());
            }
        }
    }
}
