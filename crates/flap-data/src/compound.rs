//! Multi-class creates that must look atomic to other writers.
//!
//! Each helper takes the cross-class lock on every class it reads for
//! uniqueness or writes, checks that the id and unique names are free, then
//! saves and links.

use flap_record::{Filter, RecordError, RecordStore};
use tracing::debug;

use crate::check::Check;
use crate::error::{DataError, DataResult};
use crate::model::Model;
use crate::tag::Tag;

/// Create a tag whose name no other tag holds.
pub fn create_tag(store: &RecordStore, id: Option<&str>, name: &str) -> DataResult<Tag> {
    store.with_lock(&[Tag::CLASS], |store| {
        ensure_id_free(store, Tag::CLASS, id)?;
        if Tag::find_by_name(store, name)?.is_some() {
            return Err(conflict(Tag::CLASS, "name", name));
        }
        let mut tag = Tag::build(store, id)?;
        tag.set_name(name)?;
        tag.save(store)?;
        Ok(tag)
    })
}

/// Create a check and link it to the named tags, creating any tag that does
/// not exist yet.
pub fn create_check_with_tags(
    store: &RecordStore,
    id: Option<&str>,
    name: &str,
    enabled: bool,
    tag_names: &[&str],
) -> DataResult<Check> {
    store.with_lock(&[Check::CLASS, Tag::CLASS], |store| {
        ensure_id_free(store, Check::CLASS, id)?;
        let taken = store
            .intersect(Check::CLASS, Filter::new().eq("name", name))?
            .exists()?;
        if taken {
            return Err(conflict(Check::CLASS, "name", name));
        }

        let mut check = Check::build(store, id)?;
        check.set_name(name)?;
        check.set_enabled(enabled)?;
        let errors = store.validate(check.record())?;
        if !errors.is_empty() {
            return Err(RecordError::ValidationFailed(errors).into());
        }

        let mut tag_ids = Vec::with_capacity(tag_names.len());
        for tag_name in tag_names {
            let tag = match Tag::find_by_name(store, tag_name)? {
                Some(tag) => tag,
                None => {
                    let mut tag = Tag::build(store, None)?;
                    tag.set_name(tag_name)?;
                    tag.save(store)?;
                    debug!(tag = %tag_name, "created tag for check");
                    tag
                }
            };
            if let Some(tag_id) = tag.id() {
                tag_ids.push(tag_id.to_string());
            }
        }

        check.save(store)?;
        if let Some(check_id) = check.id() {
            let targets: Vec<&str> = tag_ids.iter().map(String::as_str).collect();
            store.link(Check::CLASS, check_id, Check::TAGS, &targets)?;
        }
        Ok(check)
    })
}

fn ensure_id_free(store: &RecordStore, class: &'static str, id: Option<&str>) -> DataResult<()> {
    match id {
        Some(id) if store.exists(class, id)? => Err(conflict(class, "id", id)),
        _ => Ok(()),
    }
}

fn conflict(class: &'static str, attribute: &'static str, value: &str) -> DataError {
    DataError::Conflict {
        class,
        attribute,
        value: value.to_string(),
    }
}
