//! Dotted-path access into BSON documents.
//!
//! Paths use the store's dot notation: `address.city` walks into embedded
//! documents and a numeric segment such as `items.2` indexes into an array.

use bson::{Bson, Document};

use crate::error::{OdmError, OdmResult};

/// Returns the value at `path`, walking documents and indexing arrays.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = step(current, segment)?;
    }

    Some(current)
}

fn step<'a>(value: &'a Bson, segment: &str) -> Option<&'a Bson> {
    match value {
        Bson::Document(doc) => doc.get(segment),
        Bson::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    }
}

/// Returns every value reachable at `path`, fanning out over arrays of
/// embedded documents the way the store's query engine does.
///
/// An empty result means the path is absent from the document.
pub fn lookup_all<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments = path.split('.').collect::<Vec<_>>();
    let mut found = Vec::new();

    if let Some(first) = document.get(segments[0]) {
        collect(first, &segments[1..], &mut found);
    }

    found
}

fn collect<'a>(value: &'a Bson, rest: &[&str], found: &mut Vec<&'a Bson>) {
    let Some((segment, tail)) = rest.split_first() else {
        found.push(value);
        return;
    };

    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(*segment) {
                collect(next, tail, found);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect(next, tail, found);
                }
            }

            for item in items {
                if let Bson::Document(doc) = item {
                    if let Some(next) = doc.get(*segment) {
                        collect(next, tail, found);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Sets the value at `path`, creating intermediate documents as needed.
///
/// Numeric segments index into existing arrays; writing past the end pads the
/// array with nulls.
pub fn set_path(document: &mut Document, path: &str, value: Bson) -> OdmResult<()> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    let Some(rest) = rest else {
        document.insert(head, value);
        return Ok(());
    };

    if !document.contains_key(head) || matches!(document.get(head), Some(Bson::Null)) {
        document.insert(head, Document::new());
    }

    match document.get_mut(head) {
        Some(child) => set_in_value(child, rest, value, path),
        None => Err(path_error(path)),
    }
}

fn set_in_value(target: &mut Bson, path: &str, value: Bson, full: &str) -> OdmResult<()> {
    match target {
        Bson::Document(doc) => set_path(doc, path, value),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let index = head.parse::<usize>().map_err(|_| path_error(full))?;

            while items.len() <= index {
                items.push(Bson::Null);
            }

            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if matches!(items[index], Bson::Null) {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in_value(&mut items[index], rest, value, full)
                }
            }
        }
        _ => Err(path_error(full)),
    }
}

/// Removes the value at `path`, returning it if it was present.
pub fn unset_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.rsplit_once('.') {
        None => document.remove(path),
        Some((parent, last)) => match get_path_mut(document, parent)? {
            Bson::Document(doc) => doc.remove(last),
            Bson::Array(items) => {
                let index = last.parse::<usize>().ok()?;
                let slot = items.get_mut(index)?;
                Some(std::mem::replace(slot, Bson::Null))
            }
            _ => None,
        },
    }
}

/// Mutable counterpart of [`get_path`].
pub fn get_path_mut<'a>(document: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let mut segments = path.split('.');
    let mut current = document.get_mut(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(doc) => doc.get_mut(segment)?,
            Bson::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn path_error(path: &str) -> OdmError {
    OdmError::operation("set", format!("cannot traverse `{path}` through a non-container value"))
}
