//! Request semantics over plain document vectors.
//!
//! Every function here works on a [`Collections`] map and nothing else, so
//! the same code serves the live store, session workspaces and commit replay.

use std::collections::HashMap;

use bson::{Bson, Document, oid::ObjectId};

use mondoc_core::{
    error::{OdmError, OdmResult},
    evaluator::{DocumentEvaluator, compare_by_keys, group_documents, project_document, sort_documents, values_equal},
    path::{get_path, get_path_mut, lookup_all, set_path, unset_path},
    query::{ElementFilter, ElementLocator, Expr, GroupSpec, Query, Update, UpdateOp, UpdateOutcome},
};

/// Collection name to documents, in insertion order.
pub type Collections = HashMap<String, Vec<Document>>;

fn documents<'a>(store: &'a Collections, collection: &str) -> &'a [Document] {
    store
        .get(collection)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn skip_take<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Keeps only the array elements matching each element filter.
fn filter_elements(document: &mut Document, filters: &[ElementFilter]) -> OdmResult<()> {
    for filter in filters {
        let Some(Bson::Array(items)) = get_path(document, &filter.field) else {
            continue;
        };

        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let matched = match item {
                Bson::Document(element) => DocumentEvaluator::matches(element, Some(&filter.filter))?,
                _ => false,
            };
            if matched {
                kept.push(item.clone());
            }
        }

        set_path(document, &filter.field, Bson::Array(kept))?;
    }
    Ok(())
}

pub fn find(store: &Collections, collection: &str, query: &Query) -> OdmResult<Vec<Document>> {
    let mut matched = DocumentEvaluator::filter_documents(documents(store, collection), query.filter.as_ref())?;
    sort_documents(&mut matched, &query.sort);

    let mut page = skip_take(matched, query.offset, query.limit);
    for document in page.iter_mut() {
        filter_elements(document, &query.element_filters)?;
        if let Some(projection) = &query.projection {
            *document = project_document(document, projection)?;
        }
    }

    Ok(page)
}

pub fn count(store: &Collections, collection: &str, filter: Option<&Expr>) -> OdmResult<u64> {
    let mut total = 0;
    for document in documents(store, collection) {
        if DocumentEvaluator::matches(document, filter)? {
            total += 1;
        }
    }
    Ok(total)
}

pub fn distinct(store: &Collections, collection: &str, field: &str, filter: Option<&Expr>) -> OdmResult<Vec<Bson>> {
    let mut values: Vec<Bson> = Vec::new();

    for document in documents(store, collection) {
        if !DocumentEvaluator::matches(document, filter)? {
            continue;
        }

        for value in lookup_all(document, field) {
            let candidates = match value {
                Bson::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            };
            for candidate in candidates {
                if !values.iter().any(|seen| values_equal(seen, candidate)) {
                    values.push(candidate.clone());
                }
            }
        }
    }

    Ok(values)
}

pub fn group(store: &Collections, collection: &str, query: &Query, spec: &GroupSpec) -> OdmResult<Vec<Document>> {
    let matched = DocumentEvaluator::filter_documents(documents(store, collection), query.filter.as_ref())?;
    let mut rows = group_documents(matched.iter(), spec)?;

    if !query.sort.is_empty() {
        rows.sort_by(|left, right| compare_by_keys(left, right, &query.sort));
    }

    Ok(skip_take(rows, query.offset, query.limit))
}

fn duplicate_key(collection: &str, id: &Bson) -> OdmError {
    OdmError::operation(
        "insert",
        format!("E11000 duplicate key error collection: {collection} index: _id_ dup key: {{ _id: {id} }}"),
    )
}

/// Inserts all of `new` or nothing.
pub fn insert(store: &mut Collections, collection: &str, new: Vec<Document>) -> OdmResult<()> {
    let existing = store
        .entry(collection.to_string())
        .or_default();

    let mut prepared: Vec<Document> = Vec::with_capacity(new.len());
    for mut document in new {
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert("_id", id.clone());
                id
            }
        };

        let taken = existing
            .iter()
            .chain(prepared.iter())
            .any(|other| other.get("_id").is_some_and(|other| values_equal(other, &id)));
        if taken {
            return Err(duplicate_key(collection, &id));
        }

        prepared.push(document);
    }

    existing.extend(prepared);
    Ok(())
}

fn element_has_id(element: &Bson, id: &Bson) -> bool {
    match element {
        Bson::Document(element) => element
            .get("_id")
            .is_some_and(|value| values_equal(value, id)),
        _ => false,
    }
}

fn array_at<'a>(document: &'a mut Document, field: &str) -> OdmResult<Option<&'a mut Vec<Bson>>> {
    match get_path_mut(document, field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Array(items)) => Ok(Some(items)),
        Some(_) => Err(OdmError::operation(
            "update",
            format!("the field `{field}` must be an array"),
        )),
    }
}

fn apply_op(document: &mut Document, op: &UpdateOp) -> OdmResult<()> {
    match op {
        UpdateOp::Set(field, value) => set_path(document, field, value.clone()),
        UpdateOp::Unset(field) => {
            unset_path(document, field);
            Ok(())
        }
        UpdateOp::Push(field, value) => match array_at(document, field)? {
            Some(items) => {
                items.push(value.clone());
                Ok(())
            }
            None => set_path(document, field, Bson::Array(vec![value.clone()])),
        },
        UpdateOp::SetElement { field, locator, value } => match locator {
            ElementLocator::Index(index) => set_path(document, &format!("{field}.{index}"), value.clone()),
            ElementLocator::Id(id) => {
                if let Some(slot) = array_at(document, field)?.and_then(|items| items.iter_mut().find(|item| element_has_id(item, id))) {
                    *slot = value.clone();
                }
                Ok(())
            }
        },
        UpdateOp::PullElement { field, locator } => {
            if let Some(items) = array_at(document, field)? {
                match locator {
                    ElementLocator::Index(index) => {
                        if *index < items.len() {
                            items.remove(*index);
                        }
                    }
                    ElementLocator::Id(id) => items.retain(|item| !element_has_id(item, id)),
                }
            }
            Ok(())
        }
    }
}

/// Applies `update` to the first match, or to every match when `multi`.
///
/// Each document is updated as a whole: if any modification fails the
/// document is left untouched and the error is returned.
pub fn update(
    store: &mut Collections,
    collection: &str,
    filter: Option<&Expr>,
    update: &Update,
    multi: bool,
) -> OdmResult<UpdateOutcome> {
    if update.is_empty() {
        return Err(OdmError::operation("update", "update contains no modifications"));
    }

    let effective = match (filter.cloned(), update.required_filter()) {
        (Some(filter), Some(required)) => Some(filter.and(required)),
        (filter, required) => filter.or(required),
    };

    let mut outcome = UpdateOutcome::default();
    let Some(existing) = store.get_mut(collection) else {
        return Ok(outcome);
    };

    for document in existing.iter_mut() {
        if !DocumentEvaluator::matches(document, effective.as_ref())? {
            continue;
        }
        outcome.matched += 1;

        let mut changed = document.clone();
        for op in &update.ops {
            apply_op(&mut changed, op)?;
        }
        if changed != *document {
            *document = changed;
            outcome.modified += 1;
        }

        if !multi {
            break;
        }
    }

    Ok(outcome)
}

/// Removes the first match, or every match when `multi`.
pub fn delete(store: &mut Collections, collection: &str, filter: Option<&Expr>, multi: bool) -> OdmResult<u64> {
    let Some(existing) = store.get_mut(collection) else {
        return Ok(0);
    };

    let mut doomed = Vec::new();
    for (index, document) in existing.iter().enumerate() {
        if DocumentEvaluator::matches(document, filter)? {
            doomed.push(index);
            if !multi {
                break;
            }
        }
    }

    for index in doomed.iter().rev() {
        existing.remove(*index);
    }
    Ok(doomed.len() as u64)
}
