//! Seeding a store from a JSON fixture file.
//!
//! The file maps class names to arrays of objects. Each object holds an
//! optional `id`, attribute values, and an optional `links` object mapping
//! relation names to target ids:
//!
//! ```json
//! { "check": [ { "id": "c1", "name": "PING", "links": { "tags": ["t1"] } } ] }
//! ```
//!
//! Records are saved first and linked in a second pass, so links may point
//! at records that appear later in the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use flap_record::{Record, RecordError, RecordStore};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

const LINKS: &str = "links";

/// A record or link the fixture could not apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub class: String,
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of [`seed`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadReport {
    /// Saved records per class.
    pub saved: BTreeMap<String, usize>,
    pub links: usize,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    fn fail(&mut self, class: &str, id: Option<&str>, reason: impl ToString) {
        self.failures.push(LoadFailure {
            class: class.to_string(),
            id: id.map(str::to_string),
            reason: reason.to_string(),
        });
    }
}

pub fn read(path: &Path) -> anyhow::Result<Json> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading fixtures {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fixtures {}", path.display()))
}

/// Save every fixture record, then apply every link.
///
/// Records that fail validation and links that name missing records are
/// reported, not fatal. Malformed files, unknown classes, and backend
/// failures abort the load.
pub fn seed(store: &RecordStore, fixtures: &Json) -> anyhow::Result<LoadReport> {
    let classes = fixtures
        .as_object()
        .context("fixture root must be an object keyed by class")?;
    let mut report = LoadReport::default();
    let mut pending = Vec::new();

    for (class, items) in classes {
        store.schema().class(class)?;
        let items = items
            .as_array()
            .with_context(|| format!("fixtures for {class} must be an array"))?;
        let mut saved = 0;

        for item in items {
            let object = item
                .as_object()
                .with_context(|| format!("fixture entry for {class} must be an object"))?;
            let id = object.get("id").and_then(Json::as_str);

            let mut record = match build(store, class, id, object) {
                Ok(record) => record,
                Err(reason) => {
                    report.fail(class, id, reason);
                    continue;
                }
            };
            match store.save(&mut record) {
                Ok(()) => saved += 1,
                Err(e) if e.validation_errors().is_some() => {
                    report.fail(class, id, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if let (Some(id), Some(links)) = (record.id(), object.get(LINKS)) {
                pending.push((class.as_str(), id.to_string(), links));
            }
        }
        debug!(class = %class, saved, "fixture records saved");
        report.saved.insert(class.clone(), saved);
    }

    for (class, owner, links) in pending {
        let Some(links) = links.as_object() else {
            report.fail(class, Some(owner.as_str()), "links must be an object");
            continue;
        };
        for (relation, targets) in links {
            let targets: Vec<&str> = targets
                .as_array()
                .map(|ids| ids.iter().filter_map(Json::as_str).collect())
                .unwrap_or_default();
            match store.link(class, &owner, relation, &targets) {
                Ok(()) => report.links += targets.len(),
                Err(e) if e.is_backend_unavailable() => return Err(e.into()),
                Err(e) => report.fail(class, Some(owner.as_str()), e),
            }
        }
    }

    info!(
        records = report.saved.values().sum::<usize>(),
        links = report.links,
        failures = report.failures.len(),
        "fixtures loaded"
    );
    Ok(report)
}

fn build(
    store: &RecordStore,
    class: &str,
    id: Option<&str>,
    object: &Map<String, Json>,
) -> Result<Record, String> {
    let mut record = store.new_record(class, id).map_err(|e| e.to_string())?;
    for (name, json) in object {
        if name == "id" || name == LINKS || json.is_null() {
            continue;
        }
        let attr_type = record
            .class()
            .attribute_def(name)
            .map(|def| def.attr_type)
            .ok_or_else(|| {
                RecordError::UnknownAttribute {
                    class: class.to_string(),
                    attribute: name.clone(),
                }
                .to_string()
            })?;
        let value = attr_type
            .from_json(json)
            .map_err(|e| format!("{name}: {e}"))?;
        record.set(name, value).map_err(|e| e.to_string())?;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use flap_data::{Check, Model, Rule, Tag};
    use flap_kv::InMemoryKv;
    use flap_record::StoreConfig;
    use serde_json::json;

    fn store() -> RecordStore {
        RecordStore::new(
            Arc::new(InMemoryKv::new()),
            flap_data::schema().unwrap(),
            StoreConfig::default(),
        )
    }

    #[test]
    fn sample_fixture_loads() {
        let store = store();
        let fixtures: Json = serde_json::from_str(include_str!("../fixtures/sample.json")).unwrap();
        let report = seed(&store, &fixtures).unwrap();

        assert_eq!(report.saved["check"], 3);
        assert_eq!(report.saved["rule"], 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id.as_deref(), Some("broken"));

        let check = Check::find_strict(&store, "foo-app-01-ping").unwrap();
        assert_eq!(check.tag_ids(&store).unwrap().len(), 2);
        let prod = Tag::find_by_name(&store, "prod").unwrap().unwrap();
        assert!(prod.check_ids(&store).unwrap().contains("db-01-disk"));

        let rule = Rule::find_strict(&store, "critical-prod").unwrap();
        assert!(rule.tag_ids(&store).unwrap().contains("prod"));
    }

    #[test]
    fn links_to_missing_records_are_reported() {
        let store = store();
        let report = seed(
            &store,
            &json!({ "tag": [ { "id": "t1", "name": "web", "links": { "checks": ["nope"] } } ] }),
        )
        .unwrap();
        assert_eq!(report.saved["tag"], 1);
        assert_eq!(report.links, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("nope"));
    }

    #[test]
    fn unknown_attributes_and_bad_types_skip_the_record() {
        let store = store();
        let report = seed(
            &store,
            &json!({ "check": [
                { "id": "a", "name": "A", "colour": "red" },
                { "id": "b", "name": "B", "enabled": "yes" },
                { "id": "c", "name": "C" },
            ] }),
        )
        .unwrap();
        assert_eq!(report.saved["check"], 1);
        assert_eq!(report.failures.len(), 2);
        assert!(store.exists("check", "c").unwrap());
    }

    #[test]
    fn unknown_class_aborts() {
        let store = store();
        assert!(seed(&store, &json!({ "widget": [] })).is_err());
        assert!(seed(&store, &json!([])).is_err());
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "tag": [ {{ "id": "t", "name": "db" }} ] }}"#).unwrap();
        let fixtures = read(file.path()).unwrap();
        let report = seed(&store(), &fixtures).unwrap();
        assert_eq!(report.saved["tag"], 1);
    }
}
