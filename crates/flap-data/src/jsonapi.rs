//! JSON-API rendering of records for the HTTP gateway.

use std::collections::{BTreeMap, BTreeSet};

use flap_record::{Query, Record, RecordResult, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

/// Page metadata for a listing response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub total_count: usize,
}

impl Pagination {
    pub fn new(page: usize, per_page: usize, total_count: usize) -> Self {
        let total_pages = if per_page == 0 {
            0
        } else {
            total_count.div_ceil(per_page)
        };
        Self {
            page,
            per_page,
            total_pages,
            total_count,
        }
    }

    /// Metadata for `query` paged at `page` of `per_page`.
    pub fn for_query(query: &Query<'_>, page: usize, per_page: usize) -> RecordResult<Self> {
        Ok(Self::new(page, per_page, query.total_count()?))
    }
}

/// Render `records` of `class` as JSON-API resource objects.
///
/// Each object carries `id`, the requested attributes (all declared ones
/// when `fields` is `None`, unset ones as `null`), and a `links` object with
/// the ids of every association of the class. Links are read with one bulk
/// lookup per association. With `unwrap` and exactly one record, the object
/// itself is returned instead of an array.
pub fn as_jsonapi(
    store: &RecordStore,
    class: &str,
    records: &[Record],
    fields: Option<&[&str]>,
    unwrap: bool,
) -> RecordResult<Json> {
    if records.is_empty() {
        return Ok(Json::Array(Vec::new()));
    }
    let class_def = store.schema().class(class)?;

    let ids: Vec<&str> = records.iter().filter_map(Record::id).collect();
    let mut links: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for assoc in store.schema().associations_of(class) {
        links.insert(assoc.name.clone(), store.bulk_ids_for(class, &ids, &assoc.name)?);
    }

    let mut data = Vec::with_capacity(records.len());
    for record in records {
        let id = record.id().unwrap_or_default();
        let mut object = Map::new();
        object.insert("id".into(), Json::String(id.to_string()));

        for attr in class_def.attributes() {
            if fields.is_some_and(|f| !f.contains(&attr.name.as_str())) {
                continue;
            }
            let value = record.get(&attr.name)?.map_or(Json::Null, |v| v.to_json());
            object.insert(attr.name.clone(), value);
        }

        let record_links: Map<String, Json> = links
            .iter()
            .map(|(relation, by_owner)| {
                let linked: Vec<&String> = by_owner
                    .get(id)
                    .map(|set| set.iter().collect())
                    .unwrap_or_default();
                (relation.clone(), json!(linked))
            })
            .collect();
        object.insert("links".into(), Json::Object(record_links));
        data.push(Json::Object(object));
    }

    if unwrap && data.len() == 1 {
        return Ok(data.remove(0));
    }
    Ok(Json::Array(data))
}

/// Top-level key for a class's resources, e.g. `checks`.
pub fn resource_key(class: &str) -> String {
    format!("{class}s")
}

/// A full listing document: `{ "<resources>": [...], "meta": { "pagination": ... } }`.
pub fn document(
    store: &RecordStore,
    class: &str,
    records: &[Record],
    fields: Option<&[&str]>,
    pagination: Option<Pagination>,
) -> RecordResult<Json> {
    let mut doc = Map::new();
    doc.insert(resource_key(class), as_jsonapi(store, class, records, fields, false)?);
    if let Some(pagination) = pagination {
        doc.insert("meta".into(), json!({ "pagination": pagination }));
    }
    Ok(Json::Object(doc))
}
