//! Lazy, chainable queries over a class.
//!
//! A [`Query`] is a description: building one issues no backend reads.
//! Every terminal ([`ids`](Query::ids), [`count`](Query::count),
//! [`all`](Query::all), ...) re-runs the lookups against current state, so a
//! query can be evaluated repeatedly and is never a snapshot cursor.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flap_types::Value;

use crate::error::{RecordError, RecordResult};
use crate::record::Record;
use crate::schema::{AssociationDef, AttributeDef, ClassDef, ID_ATTRIBUTE};
use crate::store::RecordStore;

/// A conjunction of attribute conditions.
///
/// Each condition is "attribute is one of these values". Conditions on
/// different attributes are AND'd; values for one attribute are OR'd. The
/// pseudo-attribute `id` matches record ids directly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Vec<Value>)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `attribute == value`
    pub fn eq(self, attribute: &str, value: impl Into<Value>) -> Self {
        self.any_of(attribute, [value])
    }

    /// `attribute in values`
    pub fn any_of<V: Into<Value>>(
        mut self,
        attribute: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        match self.conditions.iter_mut().find(|(a, _)| a == attribute) {
            // Repeating an attribute narrows it to the common values.
            Some((_, existing)) => existing.retain(|v| values.contains(v)),
            None => self.conditions.push((attribute.to_string(), values)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.conditions.iter().map(|(a, v)| (a.as_str(), v.as_slice()))
    }
}

#[derive(Clone, Debug)]
enum Scope {
    All,
    Association {
        assoc: AssociationDef,
        owner_id: String,
    },
}

#[derive(Clone, Debug)]
enum Step {
    Intersect(Filter),
    Union(Filter),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

/// A lazy pipeline of set operations over one class's ids.
#[derive(Clone)]
pub struct Query<'s> {
    store: &'s RecordStore,
    class: Arc<ClassDef>,
    scope: Scope,
    steps: Vec<Step>,
    sort: Option<(String, Direction)>,
    page: Option<(usize, usize)>,
}

impl<'s> Query<'s> {
    pub(crate) fn new(store: &'s RecordStore, class: Arc<ClassDef>) -> Self {
        Self {
            store,
            class,
            scope: Scope::All,
            steps: Vec::new(),
            sort: None,
            page: None,
        }
    }

    pub(crate) fn associated(
        store: &'s RecordStore,
        class: Arc<ClassDef>,
        assoc: AssociationDef,
        owner_id: &str,
    ) -> Self {
        Self {
            scope: Scope::Association {
                assoc,
                owner_id: owner_id.to_string(),
            },
            ..Self::new(store, class)
        }
    }

    pub fn class(&self) -> &ClassDef {
        &self.class
    }

    /// Keep only ids matching every condition of `filter`.
    pub fn intersect(mut self, filter: Filter) -> Self {
        self.steps.push(Step::Intersect(filter));
        self
    }

    /// Add the ids in scope that match `filter`.
    ///
    /// A union with nothing before it starts from the empty set, so
    /// `query(c).union(f)` is exactly the ids matching `f`.
    pub fn union(mut self, filter: Filter) -> Self {
        self.steps.push(Step::Union(filter));
        self
    }

    /// Order by a sortable attribute: typed value, then creation rank, then
    /// id. Records without the attribute come last.
    pub fn sort(mut self, attribute: &str) -> Self {
        self.sort = Some((attribute.to_string(), Direction::Ascending));
        self
    }

    /// Exact reverse of [`sort`](Self::sort).
    pub fn sort_desc(mut self, attribute: &str) -> Self {
        self.sort = Some((attribute.to_string(), Direction::Descending));
        self
    }

    /// 1-based page of `per_page` ids. Page 0 or a zero page size is empty.
    pub fn page(mut self, number: usize, per_page: usize) -> Self {
        self.page = Some((number, per_page));
        self
    }

    // ----------------------------------------------------------------
    // Terminals
    // ----------------------------------------------------------------

    /// Matching ids, ordered and paged.
    pub fn ids(&self) -> RecordResult<Vec<String>> {
        let matched = self.evaluate()?;
        let ordered = match &self.sort {
            Some((attribute, direction)) => self.order(matched, attribute, *direction)?,
            None => matched.into_iter().collect(),
        };
        Ok(match self.page {
            Some((number, per_page)) => paginate(ordered, number, per_page),
            None => ordered,
        })
    }

    /// Number of ids [`ids`](Self::ids) would return, without hydration.
    pub fn count(&self) -> RecordResult<usize> {
        match self.page {
            Some(_) => Ok(self.ids()?.len()),
            None => self.total_count(),
        }
    }

    /// Number of matching ids ignoring any page.
    pub fn total_count(&self) -> RecordResult<usize> {
        Ok(self.evaluate()?.len())
    }

    /// Hydrate every matching record in one bulk read.
    pub fn all(&self) -> RecordResult<Vec<Record>> {
        let ids = self.ids()?;
        Ok(self
            .store
            .hydrate(&self.class, &ids)?
            .into_iter()
            .flatten()
            .collect())
    }

    pub fn first(&self) -> RecordResult<Option<Record>> {
        let Some(id) = self.ids()?.into_iter().next() else {
            return Ok(None);
        };
        Ok(self.store.hydrate(&self.class, &[id])?.pop().flatten())
    }

    pub fn exists(&self) -> RecordResult<bool> {
        Ok(!self.evaluate()?.is_empty())
    }

    /// Records for `ids`, each of which must be in this query's result.
    pub fn find_by_ids(&self, ids: &[&str]) -> RecordResult<Vec<Record>> {
        let matched = self.evaluate()?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !matched.contains(**id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(self.not_found(missing));
        }

        let wanted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let loaded = self.store.hydrate(&self.class, &wanted)?;
        let mut records = Vec::with_capacity(loaded.len());
        let mut vanished = Vec::new();
        for (id, record) in wanted.into_iter().zip(loaded) {
            match record {
                Some(record) => records.push(record),
                None => vanished.push(id),
            }
        }
        if !vanished.is_empty() {
            return Err(self.not_found(vanished));
        }
        Ok(records)
    }

    /// Ids linked through `relation` from every record in the result.
    pub fn associated_ids_for(
        &self,
        relation: &str,
    ) -> RecordResult<BTreeMap<String, BTreeSet<String>>> {
        let ids = self.ids()?;
        let owners: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.store.bulk_ids_for(self.class.name(), &owners, relation)
    }

    // ----------------------------------------------------------------
    // Evaluation
    // ----------------------------------------------------------------

    fn evaluate(&self) -> RecordResult<BTreeSet<String>> {
        let scope = self.scope_ids()?;
        let mut current = match self.steps.first() {
            Some(Step::Union(_)) => BTreeSet::new(),
            _ => scope.clone(),
        };
        for step in &self.steps {
            match step {
                Step::Intersect(filter) if filter.is_empty() => {}
                Step::Intersect(filter) => {
                    let matched = self.matching(filter)?;
                    current.retain(|id| matched.contains(id));
                }
                Step::Union(filter) if filter.is_empty() => current.extend(scope.iter().cloned()),
                Step::Union(filter) => {
                    let matched = self.matching(filter)?;
                    current.extend(matched.into_iter().filter(|id| scope.contains(id)));
                }
            }
        }
        Ok(current)
    }

    fn scope_ids(&self) -> RecordResult<BTreeSet<String>> {
        let backend = self.store.backend();
        let keys = self.store.keys();
        let all = backend.smembers(&keys.ids(self.class.name()))?;
        match &self.scope {
            Scope::All => Ok(all),
            Scope::Association { assoc, owner_id } => {
                let linked = backend.smembers(&keys.link(&assoc.owner, owner_id, &assoc.name))?;
                Ok(linked.intersection(&all).cloned().collect())
            }
        }
    }

    fn matching(&self, filter: &Filter) -> RecordResult<BTreeSet<String>> {
        let index = self.store.index();
        let mut result: Option<BTreeSet<String>> = None;
        for (attribute, values) in filter.conditions() {
            let ids = if attribute == ID_ATTRIBUTE {
                values.iter().map(Value::encode).collect()
            } else {
                index.lookup_any(&self.class, attribute, values)?
            };
            result = Some(match result {
                Some(acc) => acc.intersection(&ids).cloned().collect(),
                None => ids,
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        Ok(result.unwrap_or_default())
    }

    fn order(
        &self,
        ids: BTreeSet<String>,
        attribute: &str,
        direction: Direction,
    ) -> RecordResult<Vec<String>> {
        let attr = self.sortable_attribute(attribute)?;
        let backend = self.store.backend();
        let keys = self.store.keys();
        let index = self.store.index();

        let ids: Vec<String> = ids.into_iter().collect();
        let hash_keys: Vec<String> = ids
            .iter()
            .map(|id| keys.attrs(self.class.name(), id))
            .collect();
        let hashes = backend.hgetall_batch(&hash_keys)?;

        let mut ranks: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        let mut rows = Vec::with_capacity(ids.len());
        for (id, hash) in ids.into_iter().zip(hashes) {
            let encoded = hash.get(&attr.name).cloned();
            let value = match &encoded {
                Some(raw) => Some(attr.attr_type.decode(raw)?),
                None => None,
            };
            let rank = match &encoded {
                Some(raw) => {
                    if !ranks.contains_key(raw) {
                        ranks.insert(raw.clone(), index.ranks(&self.class, &attr.name, raw)?);
                    }
                    ranks.get(raw).and_then(|r| r.get(&id)).copied()
                }
                None => None,
            };
            rows.push((value, rank, id));
        }

        rows.sort_by(|a, b| {
            compare_missing_last(&a.0, &b.0, Value::sort_cmp)
                .then_with(|| compare_missing_last(&a.1, &b.1, Ord::cmp))
                .then_with(|| a.2.cmp(&b.2))
        });
        if direction == Direction::Descending {
            rows.reverse();
        }
        Ok(rows.into_iter().map(|(_, _, id)| id).collect())
    }

    fn sortable_attribute(&self, attribute: &str) -> RecordResult<&AttributeDef> {
        let attr = self
            .class
            .attribute_def(attribute)
            .ok_or_else(|| RecordError::UnknownAttribute {
                class: self.class.name().to_string(),
                attribute: attribute.to_string(),
            })?;
        if !attr.sortable {
            return Err(RecordError::UnsortableAttribute {
                class: self.class.name().to_string(),
                attribute: attribute.to_string(),
            });
        }
        Ok(attr)
    }

    fn not_found(&self, ids: Vec<String>) -> RecordError {
        RecordError::NotFound {
            class: self.class.name().to_string(),
            ids,
        }
    }
}

impl std::fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("class", &self.class.name())
            .field("scope", &self.scope)
            .field("steps", &self.steps)
            .field("sort", &self.sort)
            .field("page", &self.page)
            .finish()
    }
}

fn compare_missing_last<T>(a: &Option<T>, b: &Option<T>, cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn paginate(ids: Vec<String>, number: usize, per_page: usize) -> Vec<String> {
    if number == 0 || per_page == 0 {
        return Vec::new();
    }
    ids.into_iter()
        .skip((number - 1).saturating_mul(per_page))
        .take(per_page)
        .collect()
}
