//! Querying and editing documents embedded in a parent record.
//!
//! Embedded documents travel inside their parent, so nothing here reads from
//! the store. [`EmbeddedQuery`] filters, sorts and slices an in-memory
//! snapshot of one embedded field with the same [`FilterDsl`] the model query
//! builder uses, evaluated with the same semantics the in-memory store uses.
//! Switching a collection between embedded and referenced modeling therefore
//! does not change which documents a predicate selects.
//!
//! [`EmbeddedField`] is the mutable side. New elements are appended locally
//! and persisted by the parent's next save; an addressed element
//! ([`EmbeddedRef`]) saves or deletes itself with a single-element update of
//! the owning document, leaving its siblings untouched:
//!
//! ```ignore
//! let mut user = User::find_or_fail(&db, id).await?;
//!
//! let berlin = user
//!     .embedded::<Address>("addresses")?
//!     .where_eq("city", "Berlin")
//!     .get_indexed()?;
//!
//! if let Some((position, _)) = berlin.first() {
//!     let mut addresses = user.embedded_mut::<Address>("addresses")?;
//!     let mut address = addresses.at(*position)?;
//!     address.set(Address { city: "Munich".into(), ..address.get()? })?;
//!     address.save(&db).await?;
//! }
//! ```

use std::{fmt, marker::PhantomData};

use bson::{Bson, Document};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    conditions::{Conditions, FilterDsl},
    connection::Executor,
    error::{OdmError, OdmResult},
    evaluator::{DocumentEvaluator, compare_by_keys, compare_values, values_equal},
    hooks::{HookEvent, HookFlow},
    model::Model,
    page::{Page, PaginationParams},
    path::{get_path, lookup_all},
    query::{ElementLocator, Sort, SortDirection, Update, validate_field_path},
    record::{DeleteOutcome, Record, SaveOutcome, filter_criterion, from_attributes, to_attributes},
    schema::{Cardinality, EmbeddedDef},
};

/// A type stored as an embedded document.
pub trait EmbeddedDoc: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> EmbeddedDoc for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Summary statistics of one field over the filtered elements.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStats {
    /// Number of filtered elements.
    pub count: usize,
    /// Sum of the numeric values.
    pub sum: f64,
    /// Mean of the numeric values, `None` if there are none.
    pub avg: Option<f64>,
    pub min: Option<Bson>,
    pub max: Option<Bson>,
}

/// A single-use query over the elements of one embedded field.
///
/// Elements are labelled with their position in the parent's loaded array;
/// [`EmbeddedQuery::get_indexed`] returns those positions for use with
/// [`EmbeddedField::at`].
pub struct EmbeddedQuery<E> {
    items: Vec<(usize, Document)>,
    conditions: Conditions,
    search: Option<(String, Option<Vec<String>>)>,
    sorts: Vec<Sort>,
    skip: Option<usize>,
    limit: Option<usize>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for EmbeddedQuery<E> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            conditions: self.conditions.clone(),
            search: self.search.clone(),
            sorts: self.sorts.clone(),
            skip: self.skip,
            limit: self.limit,
            _marker: PhantomData,
        }
    }
}

impl<E> fmt::Debug for EmbeddedQuery<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedQuery")
            .field("items", &self.items.len())
            .field("conditions", &self.conditions)
            .field("search", &self.search)
            .field("sorts", &self.sorts)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<E> FilterDsl for EmbeddedQuery<E> {
    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.conditions
    }
}

fn contains_term(value: &Bson, term: &str) -> bool {
    match value {
        Bson::String(s) => s.to_lowercase().contains(term),
        Bson::Array(items) => items.iter().any(|v| contains_term(v, term)),
        Bson::Document(document) => document.values().any(|v| contains_term(v, term)),
        _ => false,
    }
}

impl<E: EmbeddedDoc> EmbeddedQuery<E> {
    /// A query over `items`, each labelled with its position.
    pub fn from_items(items: Vec<(usize, Document)>) -> Self {
        Self {
            items,
            conditions: Conditions::new(),
            search: None,
            sorts: Vec::new(),
            skip: None,
            limit: None,
            _marker: PhantomData,
        }
    }

    /// Case-insensitive substring match over every string value.
    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some((term.into(), None));
        self
    }

    /// Case-insensitive substring match over the given fields.
    pub fn search_in(mut self, term: impl Into<String>, fields: &[&str]) -> Self {
        for field in fields {
            if let Err(error) = validate_field_path(field) {
                self.conditions.fail(error);
            }
        }
        self.search = Some((term.into(), Some(fields.iter().map(ToString::to_string).collect())));
        self
    }

    /// Sorts by `field`; `direction` is `asc` or `desc`.
    pub fn order_by(mut self, field: &str, direction: &str) -> Self {
        match validate_field_path(field).and_then(|_| SortDirection::parse(direction)) {
            Ok(direction) => self.sorts.push(Sort {
                field: field.to_string(),
                direction,
            }),
            Err(error) => self.conditions.fail(error),
        }
        self
    }

    pub fn order_by_asc(self, field: &str) -> Self {
        self.order_by(field, "asc")
    }

    pub fn order_by_desc(self, field: &str) -> Self {
        self.order_by(field, "desc")
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Alias of [`EmbeddedQuery::skip`].
    pub fn offset(self, offset: usize) -> Self {
        self.skip(offset)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `skip((page - 1) * per_page).limit(per_page)`.
    pub fn for_page(mut self, page: usize, per_page: usize) -> Self {
        if page < 1 || per_page < 1 {
            self.conditions
                .fail(OdmError::operation("for_page", "page and per_page must be at least 1"));
            return self;
        }
        self.skip((page - 1) * per_page).limit(per_page)
    }

    /// Filter, search and sort, without slicing.
    fn matching(&self) -> OdmResult<Vec<(usize, Document)>> {
        self.conditions.check()?;
        let filter = self.conditions.to_expr();

        let mut matched = Vec::new();
        for (position, document) in &self.items {
            if DocumentEvaluator::matches(document, filter.as_ref())? && self.matches_search(document) {
                matched.push((*position, document.clone()));
            }
        }

        // stable: ties keep array order
        if !self.sorts.is_empty() {
            matched.sort_by(|a, b| compare_by_keys(&a.1, &b.1, &self.sorts));
        }
        Ok(matched)
    }

    fn matches_search(&self, document: &Document) -> bool {
        let Some((term, fields)) = &self.search else {
            return true;
        };
        let term = term.to_lowercase();

        match fields {
            Some(fields) => fields
                .iter()
                .any(|field| lookup_all(document, field).into_iter().any(|v| contains_term(v, &term))),
            None => document.values().any(|v| contains_term(v, &term)),
        }
    }

    pub(crate) fn into_filtered(self) -> OdmResult<Vec<(usize, Document)>> {
        Ok(self
            .matching()?
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// The matching elements.
    pub fn get(self) -> OdmResult<Vec<E>> {
        self.into_filtered()?
            .into_iter()
            .map(|(_, document)| from_attributes(document))
            .collect()
    }

    /// The matching elements with their positions in the parent array.
    pub fn get_indexed(self) -> OdmResult<Vec<(usize, E)>> {
        self.into_filtered()?
            .into_iter()
            .map(|(position, document)| Ok((position, from_attributes(document)?)))
            .collect()
    }

    pub fn first(self) -> OdmResult<Option<E>> {
        Ok(self.limit(1).get()?.into_iter().next())
    }

    /// Number of matching elements. Ignores `skip` and `limit`.
    pub fn count(&self) -> OdmResult<usize> {
        Ok(self.matching()?.len())
    }

    pub fn exists(&self) -> OdmResult<bool> {
        Ok(self.count()? > 0)
    }

    /// One page of the matching elements. Ignores `skip` and `limit`.
    pub fn paginate(&self, page: u64, per_page: u64) -> OdmResult<Page<E>> {
        let items = self
            .matching()?
            .into_iter()
            .map(|(_, document)| from_attributes(document))
            .collect::<OdmResult<Vec<E>>>()?;

        PaginationParams::new(page, per_page).paginate(items)
    }

    /// Distinct values of `field` in first-seen order. Array values
    /// contribute their elements. Ignores `skip` and `limit`.
    pub fn distinct(&self, field: &str) -> OdmResult<Vec<Bson>> {
        validate_field_path(field)?;
        let mut values: Vec<Bson> = Vec::new();

        for (_, document) in self.matching()? {
            for value in lookup_all(&document, field) {
                let candidates = match value {
                    Bson::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for candidate in candidates {
                    if !values.iter().any(|v| values_equal(v, &candidate)) {
                        values.push(candidate);
                    }
                }
            }
        }
        Ok(values)
    }

    /// Matching elements grouped by the value of `field`, in first-seen
    /// order. Elements without the field group under `null`.
    pub fn group_by(&self, field: &str) -> OdmResult<Vec<(Bson, Vec<E>)>> {
        validate_field_path(field)?;
        let mut groups: Vec<(Bson, Vec<E>)> = Vec::new();

        for (_, document) in self.matching()? {
            let key = get_path(&document, field).cloned().unwrap_or(Bson::Null);
            let item: E = from_attributes(document)?;

            match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
                Some((_, members)) => members.push(item),
                None => groups.push((key, vec![item])),
            }
        }
        Ok(groups)
    }

    /// Statistics of `field` over the matching elements. Ignores `skip` and
    /// `limit`.
    pub fn aggregate(&self, field: &str) -> OdmResult<AggregateStats> {
        validate_field_path(field)?;
        let matched = self.matching()?;

        let mut sum = 0.0;
        let mut numeric = 0usize;
        let mut min: Option<Bson> = None;
        let mut max: Option<Bson> = None;

        for (_, document) in &matched {
            let Some(value) = get_path(document, field).filter(|v| !matches!(v, Bson::Null)) else {
                continue;
            };

            match value {
                Bson::Int32(n) => sum += f64::from(*n),
                Bson::Int64(n) => sum += *n as f64,
                Bson::Double(n) => sum += n,
                _ => {}
            }
            if matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
                numeric += 1;
            }

            if min.as_ref().is_none_or(|m| compare_values(value, m).is_lt()) {
                min = Some(value.clone());
            }
            if max.as_ref().is_none_or(|m| compare_values(value, m).is_gt()) {
                max = Some(value.clone());
            }
        }

        Ok(AggregateStats {
            count: matched.len(),
            sum,
            avg: (numeric > 0).then(|| sum / numeric as f64),
            min,
            max,
        })
    }
}

/// Mutable access to one embedded field of a record.
pub struct EmbeddedField<'r, M, E> {
    record: &'r mut Record<M>,
    def: &'static EmbeddedDef,
    _marker: PhantomData<fn() -> E>,
}

impl<'r, M: Model, E: EmbeddedDoc> EmbeddedField<'r, M, E> {
    pub(crate) fn new(record: &'r mut Record<M>, def: &'static EmbeddedDef) -> Self {
        Self {
            record,
            def,
            _marker: PhantomData,
        }
    }

    /// A query over the current elements.
    pub fn query(&self) -> OdmResult<EmbeddedQuery<E>> {
        self.record.embedded(&self.def.name)
    }

    pub fn items(&self) -> OdmResult<Vec<E>> {
        self.query()?.get()
    }

    pub fn len(&self) -> OdmResult<usize> {
        Ok(self.record.embedded_items(&self.def.name)?.len())
    }

    pub fn is_empty(&self) -> OdmResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends `item` (or sets it, for single fields) on the parent record
    /// without writing to the store. Returns the new element's position.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if the field was loaded through a
    /// filter.
    pub fn create(&mut self, item: E) -> OdmResult<usize> {
        let field = self.def.name.as_str();
        if self.record.partial.contains_key(field) {
            return Err(OdmError::operation(
                "embedded.create",
                format!("`{field}` was loaded through a filter; reload it in full before adding elements"),
            ));
        }

        let element = Bson::Document(to_attributes(&item)?);
        match self.def.cardinality {
            Cardinality::Single => {
                self.record.set_attribute(field, element)?;
                Ok(0)
            }
            Cardinality::Many => {
                let mut attributes = self.record.attributes()?;
                let position = match attributes.get_mut(field) {
                    Some(Bson::Array(items)) => {
                        items.push(element);
                        items.len() - 1
                    }
                    _ => {
                        attributes.insert(field, vec![element]);
                        0
                    }
                };
                self.record.model = from_attributes(attributes)?;
                Ok(position)
            }
        }
    }

    /// Addresses the element at `position`.
    pub fn at(&mut self, position: usize) -> OdmResult<EmbeddedRef<'_, M, E>> {
        let len = self.len()?;
        if position >= len {
            return Err(OdmError::operation(
                "embedded.at",
                format!("`{}` has {len} elements, no position {position}", self.def.name),
            ));
        }

        Ok(EmbeddedRef {
            record: &mut *self.record,
            def: self.def,
            position,
            _marker: PhantomData,
        })
    }
}

/// One addressed element of an embedded field.
pub struct EmbeddedRef<'a, M, E> {
    record: &'a mut Record<M>,
    def: &'static EmbeddedDef,
    position: usize,
    _marker: PhantomData<fn() -> E>,
}

fn element_of(document: &Document, def: &EmbeddedDef, position: usize) -> Option<Bson> {
    match (def.cardinality, document.get(&def.name)) {
        (Cardinality::Single, Some(Bson::Null) | None) => None,
        (Cardinality::Single, Some(value)) => Some(value.clone()),
        (Cardinality::Many, Some(Bson::Array(items))) => items.get(position).cloned(),
        (Cardinality::Many, _) => None,
    }
}

fn stored_len(document: &Document, field: &str) -> usize {
    match document.get(field) {
        Some(Bson::Array(items)) => items.len(),
        _ => 0,
    }
}

impl<M: Model, E: EmbeddedDoc> EmbeddedRef<'_, M, E> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn get(&self) -> OdmResult<E> {
        let attributes = self.record.attributes()?;
        match element_of(&attributes, self.def, self.position) {
            Some(Bson::Document(document)) => from_attributes(document),
            _ => Err(OdmError::operation(
                "embedded.get",
                format!("`{}` has no element at {}", self.def.name, self.position),
            )),
        }
    }

    /// Replaces the element on the parent record, locally.
    pub fn set(&mut self, item: E) -> OdmResult<()> {
        let element = Bson::Document(to_attributes(&item)?);
        match self.def.cardinality {
            Cardinality::Single => self.record.set_attribute(&self.def.name, element),
            Cardinality::Many => self
                .record
                .set_attribute(&format!("{}.{}", self.def.name, self.position), element),
        }
    }

    /// `true` if the element differs from its persisted value, or is new.
    pub fn is_dirty(&self) -> OdmResult<bool> {
        let current = element_of(&self.record.attributes()?, self.def, self.position);
        let original = element_of(&self.record.original, self.def, self.position);

        Ok(match (current, original) {
            (Some(current), Some(original)) => !values_equal(&current, &original),
            (None, None) => false,
            _ => true,
        })
    }

    /// Locates the persisted element in the stored array.
    fn locator(&self) -> OdmResult<ElementLocator> {
        let field = &self.def.name;
        let original = element_of(&self.record.original, self.def, self.position);

        if let Some(Bson::Document(document)) = &original {
            if let Some(id) = document.get("_id") {
                return Ok(ElementLocator::Id(id.clone()));
            }
        }

        self.record
            .store_index(field, self.position)
            .map(ElementLocator::Index)
            .ok_or_else(|| {
                OdmError::operation(
                    "embedded.save",
                    format!("element {} of `{field}` has no `_id` and its stored position is unknown", self.position),
                )
            })
    }

    async fn write<X: Executor + ?Sized>(&mut self, executor: &X, update: Update) -> OdmResult<()> {
        let schema = M::schema();
        let (connection, _, session) = self.record.target(executor)?;
        let filter = self.record.identity_filter()?;

        debug!(collection = schema.collection(), field = %self.def.name, position = self.position, "update embedded element");
        let outcome = connection
            .backend()
            .update_documents(schema.collection(), Some(&filter), &update, false, session.as_ref())
            .await?;

        if outcome.matched == 0 {
            return Err(OdmError::not_found(schema.model_name(), filter_criterion(&filter)));
        }
        Ok(())
    }

    fn ensure_persisted(&self, operation: &str) -> OdmResult<()> {
        if !self.record.persisted || self.record.deleted {
            return Err(OdmError::operation(
                operation,
                "the parent record is not persisted; save the parent instead",
            ));
        }
        Ok(())
    }

    /// Writes this element to the parent document.
    ///
    /// Single fields are rewritten whole. In array fields a new element is
    /// appended and an existing one is replaced in place, addressed by its
    /// `_id` when it has one and by its stored position otherwise. The
    /// parent's save and update hooks run around the write.
    pub async fn save<X: Executor + ?Sized>(&mut self, executor: &X) -> OdmResult<SaveOutcome> {
        self.ensure_persisted("embedded.save")?;
        if !self.is_dirty()? {
            return Ok(SaveOutcome::Unchanged);
        }

        let hooks = M::schema().hooks();
        if hooks.run_record(HookEvent::BeforeSave, self.record).await? == HookFlow::Abort
            || hooks.run_record(HookEvent::BeforeUpdate, self.record).await? == HookFlow::Abort
        {
            return Ok(SaveOutcome::Aborted);
        }

        let schema = M::schema();
        let field = self.def.name.clone();
        let column = schema.column_path(&field);
        let current = element_of(&self.record.attributes()?, self.def, self.position);

        let update = match (self.def.cardinality, current.clone()) {
            (Cardinality::Single, Some(value)) => {
                let value = schema.field(&field).map_or(value.clone(), |f| f.prepare(value));
                Update::new().set(column, value)
            }
            (Cardinality::Single, None) => Update::new().unset(column),
            (Cardinality::Many, None) => {
                return Err(OdmError::operation(
                    "embedded.save",
                    format!("`{field}` has no element at {}", self.position),
                ));
            }
            (Cardinality::Many, Some(value)) => {
                let persisted = stored_len(&self.record.original, &field);
                if self.position > persisted {
                    return Err(OdmError::operation(
                        "embedded.save",
                        format!("save the new elements of `{field}` in order, starting at {persisted}"),
                    ));
                }
                if self.position == persisted {
                    Update::new().push(column, value)
                } else {
                    Update::new().set_element(column, self.locator()?, value)
                }
            }
        };

        self.write(executor, update).await?;

        match (self.def.cardinality, current) {
            (Cardinality::Single, Some(value)) => {
                self.record.original.insert(field, value);
            }
            (Cardinality::Single, None) => {
                self.record.original.remove(&field);
            }
            (Cardinality::Many, Some(value)) => match self.record.original.get_mut(&field) {
                Some(Bson::Array(items)) if self.position < items.len() => items[self.position] = value,
                Some(Bson::Array(items)) => items.push(value),
                _ => {
                    self.record.original.insert(field, vec![value]);
                }
            },
            (Cardinality::Many, None) => {}
        }

        hooks.run_record(HookEvent::AfterUpdate, self.record).await?;
        hooks.run_record(HookEvent::AfterSave, self.record).await?;
        Ok(SaveOutcome::Updated)
    }

    /// Removes this element from the parent document.
    ///
    /// Elements that were never persisted are only removed locally.
    pub async fn delete<X: Executor + ?Sized>(self, executor: &X) -> OdmResult<DeleteOutcome> {
        let mut this = self;
        let field = this.def.name.clone();
        let stored = match this.def.cardinality {
            Cardinality::Single => this.record.original.get(&field).is_some_and(|v| *v != Bson::Null),
            Cardinality::Many => this.position < stored_len(&this.record.original, &field),
        };

        if stored {
            this.ensure_persisted("embedded.delete")?;

            let hooks = M::schema().hooks();
            if hooks.run_record(HookEvent::BeforeSave, this.record).await? == HookFlow::Abort
                || hooks.run_record(HookEvent::BeforeUpdate, this.record).await? == HookFlow::Abort
            {
                return Ok(DeleteOutcome::Aborted);
            }

            let column = M::schema().column_path(&field);
            let update = match this.def.cardinality {
                Cardinality::Single => Update::new().unset(column),
                Cardinality::Many => Update::new().pull_element(column, this.locator()?),
            };
            let removed_index = this.record.store_index(&field, this.position);

            this.write(executor, update).await?;
            this.remove_locally(removed_index)?;

            hooks.run_record(HookEvent::AfterUpdate, this.record).await?;
            hooks.run_record(HookEvent::AfterSave, this.record).await?;
        } else {
            this.remove_locally(None)?;
        }

        Ok(DeleteOutcome::Deleted)
    }

    fn remove_locally(&mut self, removed_index: Option<usize>) -> OdmResult<()> {
        let field = self.def.name.as_str();
        let mut attributes = self.record.attributes()?;

        match self.def.cardinality {
            Cardinality::Single => {
                attributes.remove(field);
                self.record.original.remove(field);
            }
            Cardinality::Many => {
                if let Some(Bson::Array(items)) = attributes.get_mut(field) {
                    if self.position < items.len() {
                        items.remove(self.position);
                    }
                }
                if let Some(Bson::Array(items)) = self.record.original.get_mut(field) {
                    if self.position < items.len() {
                        items.remove(self.position);
                    }
                }
                if let Some(Some(indices)) = self.record.partial.get_mut(field) {
                    if self.position < indices.len() {
                        indices.remove(self.position);
                    }
                    if let Some(removed) = removed_index {
                        for index in indices.iter_mut().filter(|i| **i > removed) {
                            *index -= 1;
                        }
                    }
                }
            }
        }

        self.record.model = from_attributes(attributes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        price: f64,
        #[serde(default)]
        tags: Vec<String>,
    }

    fn items() -> Vec<(usize, Document)> {
        vec![
            doc! { "name": "Apple", "price": 1.5, "tags": ["fruit", "red"] },
            doc! { "name": "Banana", "price": 0.5, "tags": ["fruit"] },
            doc! { "name": "Carrot", "price": 0.75, "tags": ["vegetable"] },
            doc! { "name": "Durian", "price": 9.0, "tags": ["fruit"] },
        ]
        .into_iter()
        .enumerate()
        .collect()
    }

    fn query() -> EmbeddedQuery<Item> {
        EmbeddedQuery::from_items(items())
    }

    fn names(items: Vec<Item>) -> Vec<String> {
        items.into_iter().map(|i| i.name).collect()
    }

    #[test]
    fn filters_sorts_and_slices() {
        let found = query()
            .where_array_contains("tags", "fruit")
            .where_op("price", "<", 5)
            .order_by_desc("price")
            .get()
            .unwrap();
        assert_eq!(names(found), vec!["Apple", "Banana"]);

        let page = query().order_by_asc("price").skip(1).limit(2).get().unwrap();
        assert_eq!(names(page), vec!["Carrot", "Apple"]);
    }

    #[test]
    fn get_indexed_reports_array_positions() {
        let found = query().where_like("name", "%an%").get_indexed().unwrap();
        let positions = found.iter().map(|(p, _)| *p).collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 3]);

        let found = query().where_ilike("name", "%A%").get_indexed().unwrap();
        let positions = found.iter().map(|(p, _)| *p).collect::<Vec<_>>();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn search_is_case_insensitive() {
        assert_eq!(names(query().search("VEG").get().unwrap()), vec!["Carrot"]);
        assert_eq!(names(query().search_in("BAN", &["name"]).get().unwrap()), vec!["Banana"]);
    }

    #[test]
    fn count_ignores_slicing() {
        let q = query().where_array_contains("tags", "fruit").limit(1);
        assert_eq!(q.count().unwrap(), 3);
        assert!(q.exists().unwrap());
        assert!(!query().where_eq("name", "Eggplant").exists().unwrap());
    }

    #[test]
    fn aggregates_over_the_filtered_subset() {
        let stats = query().where_array_contains("tags", "fruit").aggregate("price").unwrap();

        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, 11.0);
        assert_eq!(stats.avg, Some(11.0 / 3.0));
        assert_eq!(stats.min, Some(Bson::Double(0.5)));
        assert_eq!(stats.max, Some(Bson::Double(9.0)));
    }

    #[test]
    fn distinct_and_group_by() {
        assert_eq!(
            query().distinct("tags").unwrap(),
            vec![
                Bson::String("fruit".into()),
                Bson::String("red".into()),
                Bson::String("vegetable".into())
            ]
        );

        let groups = query().group_by("tags").unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(names(groups[1].1.clone()), vec!["Banana", "Durian"]);
    }

    #[test]
    fn paginates_matching_elements() {
        let page = query().paginate(2, 3).unwrap();
        assert_eq!(names(page.data), vec!["Durian"]);
        assert_eq!(page.meta.total, 4);
        assert_eq!(page.meta.last_page, 2);
        assert!(page.meta.has_prev);
    }

    #[test]
    fn defers_invalid_input_to_the_terminal() {
        assert!(query().order_by("price", "sideways").get().is_err());
        assert!(query().where_op("price", "~", 1).count().is_err());
        assert!(query().for_page(0, 10).get().is_err());
    }
}
