//! Model instances with persistence state.
//!
//! A [`Record`] owns a model value together with the snapshot of its last
//! persisted attributes and its lifecycle flags. It dereferences to the model,
//! so fields are read and assigned directly:
//!
//! ```ignore
//! let mut user = User::find_or_fail(&db, id).await?;
//! user.name = "Ada".into();
//! assert_eq!(user.dirty_fields()?, vec!["name"]);
//! user.save(&db).await?;
//! assert!(!user.is_dirty()?);
//! ```
//!
//! The dirty set is never stored: it is derived on demand by comparing the
//! current attributes with the snapshot, by value. `save` dispatches to an
//! insert for new records and to an update of the dirty fields for persisted
//! ones; an update with nothing dirty issues no write and runs no hooks.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
};

use bson::{Bson, Document, de::deserialize_from_bson, oid::ObjectId, ser::serialize_to_bson};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer, de::DeserializeOwned};
use tracing::{debug, trace};

use crate::{
    backend::SessionId,
    connection::{Connection, Executor, resolve, session_of},
    embedded::{EmbeddedDoc, EmbeddedField, EmbeddedQuery},
    error::{OdmError, OdmResult},
    evaluator::values_equal,
    hooks::{HookEvent, HookFlow},
    model::Model,
    path::set_path,
    query::{Expr, Filter, Query, Update},
    relations::RelationLoad,
    schema::{Cardinality, EmbeddedDef, FieldDef},
    serialize::{SerializeOptions, bson_to_json},
    transaction::TransactionClient,
};

/// Serializes a value into an attribute document.
pub fn to_attributes<T: Serialize>(value: &T) -> OdmResult<Document> {
    match serialize_to_bson(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(OdmError::Serialization(format!(
            "expected a document, got {other}"
        ))),
    }
}

/// Deserializes an attribute document into a value.
pub fn from_attributes<T: DeserializeOwned>(attributes: Document) -> OdmResult<T> {
    Ok(deserialize_from_bson(Bson::Document(attributes))?)
}

/// Result of [`Record::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
    /// Nothing was dirty; no write was issued.
    Unchanged,
    /// A before-hook aborted; no write was issued.
    Aborted,
}

/// Result of [`Record::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// A before-hook aborted; no write was issued.
    Aborted,
}

/// A loaded related record of any model type.
pub trait RelatedRecord: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> OdmResult<serde_json::Value>;
    fn clone_boxed(&self) -> Box<dyn RelatedRecord>;
}

impl<M: Model> RelatedRecord for Record<M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> OdmResult<serde_json::Value> {
        Record::to_json(self)
    }

    fn clone_boxed(&self) -> Box<dyn RelatedRecord> {
        Box::new(self.clone())
    }
}

/// Records attached by relation loading.
#[derive(Debug)]
pub enum LoadedRelation {
    One(Option<Box<dyn RelatedRecord>>),
    Many(Vec<Box<dyn RelatedRecord>>),
}

impl Clone for LoadedRelation {
    fn clone(&self) -> Self {
        match self {
            LoadedRelation::One(record) => LoadedRelation::One(record.as_ref().map(|r| r.clone_boxed())),
            LoadedRelation::Many(records) => LoadedRelation::Many(records.iter().map(|r| r.clone_boxed()).collect()),
        }
    }
}

impl LoadedRelation {
    fn to_json(&self) -> OdmResult<serde_json::Value> {
        match self {
            LoadedRelation::One(None) => Ok(serde_json::Value::Null),
            LoadedRelation::One(Some(record)) => record.to_json(),
            LoadedRelation::Many(records) => records
                .iter()
                .map(|r| r.to_json())
                .collect::<OdmResult<Vec<_>>>()
                .map(serde_json::Value::Array),
        }
    }
}

/// A model instance with its persisted snapshot and lifecycle flags.
pub struct Record<M> {
    pub(crate) model: M,
    pub(crate) original: Document,
    pub(crate) persisted: bool,
    pub(crate) local: bool,
    pub(crate) deleted: bool,
    pub(crate) transaction: Option<TransactionClient>,
    pub(crate) relations: HashMap<String, LoadedRelation>,
    /// Embedded fields loaded through a filter, with the stored index of
    /// each surviving element when known.
    pub(crate) partial: HashMap<String, Option<Vec<usize>>>,
}

impl<M: Clone> Clone for Record<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            original: self.original.clone(),
            persisted: self.persisted,
            local: self.local,
            deleted: self.deleted,
            transaction: self.transaction.clone(),
            relations: self.relations.clone(),
            partial: self.partial.clone(),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Record<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.model)
            .field("persisted", &self.persisted)
            .field("deleted", &self.deleted)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<M> Deref for Record<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M> DerefMut for Record<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

impl<M: Model> Serialize for Record<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

fn timestamp(now: DateTime<Utc>, current: Option<&Bson>) -> Bson {
    match current {
        Some(Bson::String(_)) => Bson::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => Bson::DateTime(bson::DateTime::from_chrono(now)),
    }
}

/// Top-level keys whose values differ between `attributes` and `original`.
fn diff_keys(attributes: &Document, original: &Document) -> Vec<String> {
    let mut keys = attributes
        .iter()
        .filter(|(key, value)| !original.get(key.as_str()).is_some_and(|o| values_equal(o, value)))
        .map(|(key, _)| key.clone())
        .collect::<Vec<_>>();

    keys.extend(
        original
            .keys()
            .filter(|key| !attributes.contains_key(key.as_str()))
            .cloned(),
    );
    keys
}

impl<M: Model> Record<M> {
    /// Wraps a new, not yet persisted model.
    pub fn new(model: M) -> Self {
        Self {
            model,
            original: Document::new(),
            persisted: false,
            local: true,
            deleted: false,
            transaction: None,
            relations: HashMap::new(),
            partial: HashMap::new(),
        }
    }

    /// Builds a persisted record from a stored document.
    pub fn hydrate(stored: Document, transaction: Option<TransactionClient>) -> OdmResult<Self> {
        let model: M = from_attributes(M::schema().from_stored(stored))?;
        let original = to_attributes(&model)?;

        Ok(Self {
            model,
            original,
            persisted: true,
            local: false,
            deleted: false,
            transaction,
            relations: HashMap::new(),
            partial: HashMap::new(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// `true` once the record has been written to or read from the store,
    /// and until it is deleted.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// `true` for records built locally and never written.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The current attributes, keyed by logical field name.
    pub fn attributes(&self) -> OdmResult<Document> {
        to_attributes(&self.model)
    }

    /// The attributes as of the last write or read.
    pub fn original(&self) -> &Document {
        &self.original
    }

    /// The changed attributes with their current values. Removed attributes
    /// appear as `null`.
    pub fn dirty(&self) -> OdmResult<Document> {
        let attributes = self.attributes()?;

        Ok(diff_keys(&attributes, &self.original)
            .into_iter()
            .map(|key| {
                let value = attributes.get(&key).cloned().unwrap_or(Bson::Null);
                (key, value)
            })
            .collect())
    }

    pub fn dirty_fields(&self) -> OdmResult<Vec<String>> {
        Ok(diff_keys(&self.attributes()?, &self.original))
    }

    pub fn is_dirty(&self) -> OdmResult<bool> {
        Ok(!self.dirty_fields()?.is_empty())
    }

    /// Merges `attributes` into the model without touching the snapshot.
    /// Keys may be dotted paths.
    pub fn fill(&mut self, attributes: Document) -> OdmResult<&mut Self> {
        let mut current = self.attributes()?;
        for (key, value) in attributes {
            set_path(&mut current, &key, value)?;
        }
        self.model = from_attributes(current)?;
        Ok(self)
    }

    /// Same as [`Record::fill`], for chaining into `save`.
    pub fn merge(&mut self, attributes: Document) -> OdmResult<&mut Self> {
        self.fill(attributes)
    }

    pub(crate) fn set_attribute(&mut self, path: &str, value: Bson) -> OdmResult<()> {
        let mut current = self.attributes()?;
        set_path(&mut current, path, value)?;
        self.model = from_attributes(current)?;
        Ok(())
    }

    /// Binds the record to a transaction used by later saves and deletes.
    pub fn use_transaction(&mut self, transaction: TransactionClient) -> &mut Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn transaction(&self) -> Option<&TransactionClient> {
        self.transaction.as_ref()
    }

    /// The primary key value, if set.
    pub fn id(&self) -> Option<Bson> {
        let primary = M::schema().primary_key();

        self.attributes()
            .ok()
            .and_then(|attributes| attributes.get(primary).cloned())
            .or_else(|| self.original.get(primary).cloned())
            .filter(|id| *id != Bson::Null)
    }

    /// Filter matching this record's stored document.
    pub(crate) fn identity_filter(&self) -> OdmResult<Expr> {
        let schema = M::schema();
        let primary = schema.primary_key();

        let id = self
            .original
            .get(primary)
            .cloned()
            .or_else(|| self.id())
            .ok_or_else(|| OdmError::operation("identify", format!("{} has no primary key value", schema.model_name())))?;
        let id = match schema.field(primary) {
            Some(field) => field.prepare(id),
            None => id,
        };

        Ok(Filter::eq(schema.primary_column(), id))
    }

    pub(crate) fn target<E: Executor + ?Sized>(&self, executor: &E) -> OdmResult<(Connection, Option<TransactionClient>, Option<SessionId>)> {
        let (connection, transaction) = resolve(executor, M::schema().connection(), self.transaction.as_ref())?;
        let session = session_of(transaction.as_ref())?;
        Ok((connection, transaction, session))
    }

    fn ensure_not_partial(&self, fields: &[String]) -> OdmResult<()> {
        match fields.iter().find(|f| self.partial.contains_key(f.as_str())) {
            Some(field) => Err(OdmError::operation(
                "save",
                format!("`{field}` was loaded through a filter and cannot be rewritten as a whole; save its elements instead"),
            )),
            None => Ok(()),
        }
    }

    /// Inserts a new record or writes the dirty fields of a persisted one.
    ///
    /// # Errors
    ///
    /// - [`OdmError::Operation`] if the record was deleted or a filtered
    ///   embedded field would be rewritten;
    /// - [`OdmError::Validation`] if a declared rule is violated;
    /// - [`OdmError::NotFound`] if the stored document disappeared;
    /// - any store or transaction error.
    pub async fn save<E: Executor + ?Sized>(&mut self, executor: &E) -> OdmResult<SaveOutcome> {
        if self.deleted {
            return Err(OdmError::operation("save", "record was deleted"));
        }

        let (connection, _, session) = self.target(executor)?;

        if self.persisted {
            self.update(&connection, session).await
        } else {
            self.insert(&connection, session).await
        }
    }

    async fn insert(&mut self, connection: &Connection, session: Option<SessionId>) -> OdmResult<SaveOutcome> {
        let schema = M::schema();
        let hooks = schema.hooks();

        if hooks.run_record(HookEvent::BeforeSave, self).await? == HookFlow::Abort
            || hooks.run_record(HookEvent::BeforeCreate, self).await? == HookFlow::Abort
        {
            return Ok(SaveOutcome::Aborted);
        }

        let now = Utc::now();
        let mut attributes = self.attributes()?;
        for field in schema.fields() {
            let current = attributes.get(field.name());
            let unset = current.is_none_or(|v| *v == Bson::Null);
            if field.is_auto_update() || (field.is_auto_create() && unset) {
                let value = timestamp(now, current);
                attributes.insert(field.name(), value);
            }
        }

        let primary = schema.primary_key();
        match attributes.get(primary) {
            None | Some(Bson::Null) => {
                attributes.insert(primary, ObjectId::new());
            }
            Some(Bson::String(id)) if id.is_empty() => {
                attributes.insert(primary, ObjectId::new().to_hex());
            }
            _ => {}
        }

        schema.validate(&attributes)?;
        let model: M = from_attributes(attributes.clone())?;

        debug!(collection = schema.collection(), session = session.is_some(), "insert record");
        connection
            .backend()
            .insert_documents(schema.collection(), vec![schema.to_stored(&attributes)], session.as_ref())
            .await?;

        self.model = model;
        self.persisted = true;
        self.local = false;
        self.original = self.attributes()?;
        if !self.original.contains_key(primary) {
            if let Some(id) = attributes.get(primary) {
                self.original.insert(primary, id.clone());
            }
        }

        hooks.run_record(HookEvent::AfterCreate, self).await?;
        hooks.run_record(HookEvent::AfterSave, self).await?;
        Ok(SaveOutcome::Created)
    }

    async fn update(&mut self, connection: &Connection, session: Option<SessionId>) -> OdmResult<SaveOutcome> {
        let schema = M::schema();
        let hooks = schema.hooks();

        let dirty = self.dirty_fields()?;
        if dirty.is_empty() {
            trace!(collection = schema.collection(), "record is clean, skipping update");
            return Ok(SaveOutcome::Unchanged);
        }
        self.ensure_not_partial(&dirty)?;

        if hooks.run_record(HookEvent::BeforeSave, self).await? == HookFlow::Abort
            || hooks.run_record(HookEvent::BeforeUpdate, self).await? == HookFlow::Abort
        {
            return Ok(SaveOutcome::Aborted);
        }

        let now = Utc::now();
        let mut attributes = self.attributes()?;
        let mut stamped = false;
        for field in schema.fields().iter().filter(|f| f.is_auto_update()) {
            let value = timestamp(now, attributes.get(field.name()));
            attributes.insert(field.name(), value);
            stamped = true;
        }

        schema.validate(&attributes)?;
        if stamped {
            self.model = from_attributes(attributes)?;
            attributes = self.attributes()?;
        }

        let dirty = diff_keys(&attributes, &self.original);
        self.ensure_not_partial(&dirty)?;
        if dirty.is_empty() {
            return Ok(SaveOutcome::Unchanged);
        }
        trace!(collection = schema.collection(), fields = ?dirty, "dirty fields");

        let update = dirty
            .iter()
            .fold(Update::new(), |update, key| match attributes.get(key) {
                Some(value) => {
                    let value = schema
                        .field(key)
                        .map_or(value.clone(), |f| f.prepare(value.clone()));
                    update.set(schema.column_path(key), value)
                }
                None => update.unset(schema.column_path(key)),
            });

        let filter = self.identity_filter()?;
        debug!(collection = schema.collection(), session = session.is_some(), "update record");
        let outcome = connection
            .backend()
            .update_documents(schema.collection(), Some(&filter), &update, false, session.as_ref())
            .await?;

        if outcome.matched == 0 {
            return Err(OdmError::not_found(schema.model_name(), filter_criterion(&filter)));
        }

        self.original = attributes;

        hooks.run_record(HookEvent::AfterUpdate, self).await?;
        hooks.run_record(HookEvent::AfterSave, self).await?;
        Ok(SaveOutcome::Updated)
    }

    /// Deletes the stored document.
    ///
    /// The attributes are kept; the record is flagged deleted and can no
    /// longer be saved.
    ///
    /// # Errors
    ///
    /// [`OdmError::Operation`] for records that were never persisted or are
    /// already deleted, [`OdmError::NotFound`] if the stored document is gone.
    pub async fn delete<E: Executor + ?Sized>(&mut self, executor: &E) -> OdmResult<DeleteOutcome> {
        if self.deleted {
            return Err(OdmError::operation("delete", "record was already deleted"));
        }
        if !self.persisted {
            return Err(OdmError::operation("delete", "record was never persisted"));
        }

        let schema = M::schema();
        let hooks = schema.hooks();
        let (connection, _, session) = self.target(executor)?;

        if hooks.run_record(HookEvent::BeforeDelete, self).await? == HookFlow::Abort {
            return Ok(DeleteOutcome::Aborted);
        }

        let filter = self.identity_filter()?;
        debug!(collection = schema.collection(), session = session.is_some(), "delete record");
        let deleted = connection
            .backend()
            .delete_documents(schema.collection(), Some(&filter), false, session.as_ref())
            .await?;

        if deleted == 0 {
            return Err(OdmError::not_found(schema.model_name(), filter_criterion(&filter)));
        }

        self.deleted = true;
        self.persisted = false;

        hooks.run_record(HookEvent::AfterDelete, self).await?;
        Ok(DeleteOutcome::Deleted)
    }

    /// Reloads the attributes from the store, discarding local changes,
    /// filtered embedded views and loaded relations.
    pub async fn refresh<E: Executor + ?Sized>(&mut self, executor: &E) -> OdmResult<()> {
        let schema = M::schema();
        let (connection, transaction, session) = self.target(executor)?;
        let filter = self.identity_filter()?;

        let stored = connection
            .backend()
            .find_documents(schema.collection(), &Query::new().filter(filter.clone()).limit(1), session.as_ref())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OdmError::not_found(schema.model_name(), filter_criterion(&filter)))?;

        let fresh = Record::<M>::hydrate(stored, transaction.or_else(|| self.transaction.clone()))?;
        self.model = fresh.model;
        self.original = fresh.original;
        self.partial.clear();
        self.relations.clear();
        Ok(())
    }

    /// Loads one relation onto this record.
    pub async fn load<E: Executor + ?Sized>(&mut self, executor: &E, relation: &str) -> OdmResult<()> {
        let (connection, transaction, _) = self.target(executor)?;

        RelationLoad::<M>::new(relation)
            .load(&connection, transaction.as_ref(), std::slice::from_mut(self))
            .await
    }

    pub fn is_loaded(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub(crate) fn set_relation(&mut self, relation: &str, loaded: LoadedRelation) {
        self.relations.insert(relation.to_string(), loaded);
    }

    /// The record loaded for a `has_one` or `belongs_to` relation.
    pub fn related_one<R: Model>(&self, relation: &str) -> Option<&Record<R>> {
        match self.relations.get(relation)? {
            LoadedRelation::One(Some(record)) => record.as_any().downcast_ref::<Record<R>>(),
            _ => None,
        }
    }

    /// The records loaded for a `has_many` relation.
    pub fn related_many<R: Model>(&self, relation: &str) -> Vec<&Record<R>> {
        match self.relations.get(relation) {
            Some(LoadedRelation::Many(records)) => records
                .iter()
                .filter_map(|r| r.as_any().downcast_ref::<Record<R>>())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Renders the record as JSON.
    pub fn serialize(&self, options: &SerializeOptions) -> OdmResult<serde_json::Value> {
        let schema = M::schema();
        let attributes = self.attributes()?;
        let mut out = serde_json::Map::new();

        for (key, value) in &attributes {
            let field = schema.field(key);
            if !options.wants(key, field.is_some_and(FieldDef::is_hidden)) {
                continue;
            }

            let name = field.map_or(key.as_str(), FieldDef::serialized_name);
            let json = match field.and_then(FieldDef::serializer) {
                Some(serializer) => serializer(value),
                None => bson_to_json(value),
            };
            out.insert(name.to_string(), json);
        }

        if options.computed {
            for (name, compute) in schema.computed() {
                if options.wants(name, false) {
                    out.insert(name.to_string(), compute(&self.model));
                }
            }
        }

        let mut relations = self.relations.iter().collect::<Vec<_>>();
        relations.sort_by(|a, b| a.0.cmp(b.0));
        for (name, loaded) in relations {
            if options.wants(name, false) {
                out.insert(name.clone(), loaded.to_json()?);
            }
        }

        Ok(serde_json::Value::Object(out))
    }

    /// Renders the record as JSON with default options.
    pub fn to_json(&self) -> OdmResult<serde_json::Value> {
        self.serialize(&SerializeOptions::default())
    }

    pub(crate) fn embedded_def(&self, field: &str) -> OdmResult<&'static EmbeddedDef> {
        let schema = M::schema();
        schema.embedded(field).ok_or_else(|| {
            OdmError::operation(
                "embedded",
                format!("`{field}` is not an embedded field of {}", schema.model_name()),
            )
        })
    }

    /// Stored index of the element at `position` of an embedded field.
    pub(crate) fn store_index(&self, field: &str, position: usize) -> Option<usize> {
        match self.partial.get(field) {
            None => Some(position),
            Some(Some(indices)) => indices.get(position).copied(),
            Some(None) => None,
        }
    }

    /// The elements of an embedded field, labelled with their position in the
    /// loaded array.
    pub(crate) fn embedded_items(&self, field: &str) -> OdmResult<Vec<(usize, Document)>> {
        let def = self.embedded_def(field)?;
        let attributes = self.attributes()?;

        match (attributes.get(field), def.cardinality) {
            (None | Some(Bson::Null), _) => Ok(Vec::new()),
            (Some(Bson::Document(document)), Cardinality::Single) => Ok(vec![(0, document.clone())]),
            (Some(Bson::Array(items)), Cardinality::Many) => items
                .iter()
                .enumerate()
                .map(|(position, item)| match item {
                    Bson::Document(document) => Ok((position, document.clone())),
                    other => Err(OdmError::Serialization(format!(
                        "element {position} of `{field}` is not a document: {other}"
                    ))),
                })
                .collect(),
            (Some(other), _) => Err(OdmError::Serialization(format!(
                "`{field}` does not hold embedded documents: {other}"
            ))),
        }
    }

    /// A query over the elements of an embedded field.
    pub fn embedded<E: EmbeddedDoc>(&self, field: &str) -> OdmResult<EmbeddedQuery<E>> {
        Ok(EmbeddedQuery::from_items(self.embedded_items(field)?))
    }

    /// A mutable handle on an embedded field.
    pub fn embedded_mut<E: EmbeddedDoc>(&mut self, field: &str) -> OdmResult<EmbeddedField<'_, M, E>> {
        let def = self.embedded_def(field)?;
        Ok(EmbeddedField::new(self, def))
    }
}

/// Human-readable criterion for not-found errors.
pub(crate) fn filter_criterion(filter: &Expr) -> String {
    crate::compile::compile_filter(Some(filter))
        .map(|document| document.to_string())
        .unwrap_or_else(|_| format!("{filter:?}"))
}
