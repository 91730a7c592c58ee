//! Per-model metadata: fields, primary key, embedded fields, relations,
//! computed values and hooks.
//!
//! A [`Schema`] is built once per model type with a [`SchemaBuilder`] and is
//! immutable afterwards. `#[derive(Model)]` generates the builder calls and
//! keeps the result in a `OnceLock`; hand-written models do the same:
//!
//! ```ignore
//! impl Model for User {
//!     fn schema() -> &'static Schema<Self> {
//!         static SCHEMA: OnceLock<Schema<User>> = OnceLock::new();
//!         SCHEMA.get_or_init(|| {
//!             SchemaBuilder::new("User", "users")
//!                 .primary_key(FieldDef::new("id"))
//!                 .field(FieldDef::new("email").with_rule(Rule::Required))
//!                 .field(FieldDef::new("age").with_rule(Rule::range(18, 120)))
//!                 .relation(RelationDef::has_many::<Post>("posts"))
//!                 .build()
//!         })
//!     }
//! }
//! ```
//!
//! Field names used throughout the mapper are *logical* names (the names the
//! model serializes with). Each field may be stored under a different
//! *column*; the primary key is stored under `_id` unless told otherwise.

use std::{any::TypeId, fmt, sync::Arc};

use bson::{Bson, Document};
use futures::future::BoxFuture;
use regex::Regex;

use crate::{
    builder::QueryBuilder,
    error::{OdmError, OdmResult},
    evaluator::values_equal,
    hooks::{FetchHook, HookEvent, HookFlow, Hooks, QueryHook, RecordHook},
    model::Model,
    record::Record,
    relations::{RelatedFetcher, fetch_related},
};

type Transform = Arc<dyn Fn(Bson) -> Bson + Send + Sync>;
type JsonTransform = Arc<dyn Fn(&Bson) -> serde_json::Value + Send + Sync>;
type Computed<M> = Arc<dyn Fn(&M) -> serde_json::Value + Send + Sync>;

/// One declared field.
#[derive(Clone, Default)]
pub struct FieldDef {
    name: String,
    column: Option<String>,
    prepare: Option<Transform>,
    consume: Option<Transform>,
    serializer: Option<JsonTransform>,
    serialize_as: Option<String>,
    hidden: bool,
    auto_create: bool,
    auto_update: bool,
    rules: Vec<Rule>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Stores the field under `column` instead of its logical name.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Transform applied to the value on its way into the store.
    pub fn with_prepare(mut self, prepare: impl Fn(Bson) -> Bson + Send + Sync + 'static) -> Self {
        self.prepare = Some(Arc::new(prepare));
        self
    }

    /// Transform applied to the stored value when a record is hydrated.
    pub fn with_consume(mut self, consume: impl Fn(Bson) -> Bson + Send + Sync + 'static) -> Self {
        self.consume = Some(Arc::new(consume));
        self
    }

    /// Custom JSON rendering used by record serialization.
    pub fn with_serializer(mut self, serializer: impl Fn(&Bson) -> serde_json::Value + Send + Sync + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// External key used by record serialization.
    pub fn with_serialized_name(mut self, name: impl Into<String>) -> Self {
        self.serialize_as = Some(name.into());
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Left out of serialization unless explicitly included.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Set to the current time when the record is created.
    pub fn auto_create(mut self) -> Self {
        self.auto_create = true;
        self
    }

    /// Set to the current time on every write.
    pub fn auto_update(mut self) -> Self {
        self.auto_update = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    pub fn serialized_name(&self) -> &str {
        self.serialize_as.as_deref().unwrap_or(&self.name)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_auto_create(&self) -> bool {
        self.auto_create
    }

    pub fn is_auto_update(&self) -> bool {
        self.auto_update
    }

    pub fn prepare(&self, value: Bson) -> Bson {
        match &self.prepare {
            Some(prepare) => prepare(value),
            None => value,
        }
    }

    pub fn consume(&self, value: Bson) -> Bson {
        match &self.consume {
            Some(consume) => consume(value),
            None => value,
        }
    }

    pub(crate) fn serializer(&self) -> Option<&JsonTransform> {
        self.serializer.as_ref()
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("column", &self.column())
            .field("serialize_as", &self.serialize_as)
            .field("hidden", &self.hidden)
            .field("auto_create", &self.auto_create)
            .field("auto_update", &self.auto_update)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

/// A validation constraint on one field.
#[derive(Clone)]
pub enum Rule {
    /// Present and not null.
    Required,
    /// Numeric bounds, inclusive. Null or absent values pass.
    Range { min: Option<f64>, max: Option<f64> },
    /// Minimum length of a string (in characters) or array.
    MinLength(usize),
    /// Maximum length of a string (in characters) or array.
    MaxLength(usize),
    /// The string matches the pattern.
    Pattern(Regex),
    /// The value equals one of the listed values.
    OneOf(Vec<Bson>),
    Custom {
        name: String,
        check: Arc<dyn Fn(&Bson) -> bool + Send + Sync>,
    },
}

impl Rule {
    pub fn range(min: impl Into<f64>, max: impl Into<f64>) -> Self {
        Rule::Range {
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    pub fn min(min: impl Into<f64>) -> Self {
        Rule::Range {
            min: Some(min.into()),
            max: None,
        }
    }

    pub fn max(max: impl Into<f64>) -> Self {
        Rule::Range {
            min: None,
            max: Some(max.into()),
        }
    }

    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if `pattern` is not a valid regex.
    pub fn pattern(pattern: &str) -> OdmResult<Self> {
        Regex::new(pattern)
            .map(Rule::Pattern)
            .map_err(|e| OdmError::operation("rule", e.to_string()))
    }

    pub fn custom(name: impl Into<String>, check: impl Fn(&Bson) -> bool + Send + Sync + 'static) -> Self {
        Rule::Custom {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// The name reported in validation errors, e.g. `range(18, 120)`.
    pub fn name(&self) -> String {
        match self {
            Rule::Required => "required".to_string(),
            Rule::Range {
                min: Some(min),
                max: Some(max),
            } => format!("range({min}, {max})"),
            Rule::Range { min: Some(min), .. } => format!("min({min})"),
            Rule::Range { max: Some(max), .. } => format!("max({max})"),
            Rule::Range { .. } => "range".to_string(),
            Rule::MinLength(len) => format!("min_length({len})"),
            Rule::MaxLength(len) => format!("max_length({len})"),
            Rule::Pattern(regex) => format!("pattern({})", regex.as_str()),
            Rule::OneOf(values) => format!(
                "one_of({})",
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Rule::Custom { name, .. } => name.clone(),
        }
    }

    /// Returns `true` if `value` satisfies the rule.
    pub fn check(&self, value: Option<&Bson>) -> bool {
        let value = match value {
            None | Some(Bson::Null) => {
                return match self {
                    Rule::Required => false,
                    Rule::Custom { check, .. } => check(&Bson::Null),
                    _ => true,
                };
            }
            Some(value) => value,
        };

        match self {
            Rule::Required => true,
            Rule::Range { min, max } => match number(value) {
                Some(n) => min.is_none_or(|min| n >= min) && max.is_none_or(|max| n <= max),
                None => false,
            },
            Rule::MinLength(len) => length(value).is_some_and(|l| l >= *len),
            Rule::MaxLength(len) => length(value).is_some_and(|l| l <= *len),
            Rule::Pattern(regex) => matches!(value, Bson::String(s) if regex.is_match(s)),
            Rule::OneOf(values) => values.iter().any(|v| values_equal(v, value)),
            Rule::Custom { check, .. } => check(value),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn length(value: &Bson) -> Option<usize> {
    match value {
        Bson::String(s) => Some(s.chars().count()),
        Bson::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// How many embedded documents a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one embedded document, or absent.
    Single,
    /// An ordered array of embedded documents.
    Many,
}

/// A field holding embedded documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedDef {
    pub name: String,
    pub cardinality: Cardinality,
}

impl EmbeddedDef {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::Single,
        }
    }

    pub fn many(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::Many,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
}

/// A reference to documents of another model.
///
/// Keys are logical field names. Unless set explicitly they default to:
///
/// - `belongs_to`: local `{target}_id`, foreign the target's primary key;
/// - `has_one` / `has_many`: local the owner's primary key, foreign
///   `{owner}_id`,
///
/// where `{target}` and `{owner}` are the snake-cased model names.
#[derive(Clone)]
pub struct RelationDef {
    name: String,
    kind: RelationKind,
    target: TypeId,
    target_model: fn() -> &'static str,
    target_primary: fn() -> &'static str,
    fetcher: RelatedFetcher,
    local_key: Option<String>,
    foreign_key: Option<String>,
}

fn model_name_of<R: Model>() -> &'static str {
    R::schema().model_name()
}

fn primary_key_of<R: Model>() -> &'static str {
    R::schema().primary_key()
}

impl RelationDef {
    fn new<R: Model>(name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: TypeId::of::<R>(),
            target_model: model_name_of::<R>,
            target_primary: primary_key_of::<R>,
            fetcher: fetch_related::<R>,
            local_key: None,
            foreign_key: None,
        }
    }

    pub fn has_one<R: Model>(name: impl Into<String>) -> Self {
        Self::new::<R>(name, RelationKind::HasOne)
    }

    pub fn has_many<R: Model>(name: impl Into<String>) -> Self {
        Self::new::<R>(name, RelationKind::HasMany)
    }

    pub fn belongs_to<R: Model>(name: impl Into<String>) -> Self {
        Self::new::<R>(name, RelationKind::BelongsTo)
    }

    pub fn with_local_key(mut self, key: impl Into<String>) -> Self {
        self.local_key = Some(key.into());
        self
    }

    pub fn with_foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn target(&self) -> TypeId {
        self.target
    }

    pub fn target_model(&self) -> &'static str {
        (self.target_model)()
    }

    pub(crate) fn fetcher(&self) -> RelatedFetcher {
        self.fetcher
    }

    /// Returns `(local, foreign)` keys for an owner with the given model name
    /// and primary key.
    pub fn keys(&self, owner_model: &str, owner_primary: &str) -> (String, String) {
        let (local, foreign) = match self.kind {
            RelationKind::BelongsTo => (
                format!("{}_id", snake_case(self.target_model())),
                (self.target_primary)().to_string(),
            ),
            RelationKind::HasOne | RelationKind::HasMany => {
                (owner_primary.to_string(), format!("{}_id", snake_case(owner_model)))
            }
        };

        (
            self.local_key.clone().unwrap_or(local),
            self.foreign_key.clone().unwrap_or(foreign),
        )
    }
}

impl fmt::Debug for RelationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("local_key", &self.local_key)
            .field("foreign_key", &self.foreign_key)
            .finish_non_exhaustive()
    }
}

/// `UserProfile` -> `user_profile`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);

    for (i, ch) in name.char_indices() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }

    out
}

/// Immutable metadata of one model type.
pub struct Schema<M> {
    model_name: String,
    collection: String,
    connection: Option<String>,
    primary: String,
    fields: Vec<FieldDef>,
    embedded: Vec<EmbeddedDef>,
    relations: Vec<RelationDef>,
    computed: Vec<(String, Computed<M>)>,
    hooks: Hooks<M>,
}

impl<M> fmt::Debug for Schema<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("model_name", &self.model_name)
            .field("collection", &self.collection)
            .field("connection", &self.connection)
            .field("primary", &self.primary)
            .field("fields", &self.fields)
            .field("embedded", &self.embedded)
            .field("relations", &self.relations)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl<M> Schema<M> {
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Name of the connection this model is bound to, if any.
    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// Logical name of the primary key.
    pub fn primary_key(&self) -> &str {
        &self.primary
    }

    /// Stored name of the primary key.
    pub fn primary_column(&self) -> &str {
        self.field(&self.primary)
            .map(FieldDef::column)
            .unwrap_or("_id")
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn embedded(&self, name: &str) -> Option<&EmbeddedDef> {
        self.embedded.iter().find(|e| e.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn computed(&self) -> impl Iterator<Item = (&str, &Computed<M>)> {
        self.computed
            .iter()
            .map(|(name, f)| (name.as_str(), f))
    }

    pub fn hooks(&self) -> &Hooks<M> {
        &self.hooks
    }

    /// Maps a logical path to its stored path. Only the first segment is
    /// mapped; nested segments are stored as-is.
    pub fn column_path(&self, path: &str) -> String {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let column = self.field(head).map_or(head, FieldDef::column);
        match rest {
            Some(rest) => format!("{column}.{rest}"),
            None => column.to_string(),
        }
    }

    fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column() == column)
    }

    /// Converts logical attributes into the stored document.
    pub fn to_stored(&self, attributes: &Document) -> Document {
        attributes
            .iter()
            .map(|(key, value)| match self.field(key) {
                Some(field) => (field.column().to_string(), field.prepare(value.clone())),
                None => (key.clone(), value.clone()),
            })
            .collect()
    }

    /// Converts a stored document back into logical attributes.
    pub fn from_stored(&self, stored: Document) -> Document {
        stored
            .into_iter()
            .map(|(key, value)| match self.field_by_column(&key) {
                Some(field) => (field.name.clone(), field.consume(value)),
                None => (key, value),
            })
            .collect()
    }

    /// Checks every declared rule against `attributes`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for the first field that violates one
    /// or more rules, naming all of that field's violated rules.
    pub fn validate(&self, attributes: &Document) -> OdmResult<()> {
        for field in &self.fields {
            let value = attributes.get(&field.name);
            let violated = field
                .rules
                .iter()
                .filter(|rule| !rule.check(value))
                .map(Rule::name)
                .collect::<Vec<_>>();

            if !violated.is_empty() {
                return Err(OdmError::Validation {
                    field: field.name.clone(),
                    value: value.cloned().unwrap_or(Bson::Null),
                    rules: violated,
                });
            }
        }
        Ok(())
    }
}

/// Builds a [`Schema`].
pub struct SchemaBuilder<M> {
    schema: Schema<M>,
}

impl<M> SchemaBuilder<M> {
    pub fn new(model_name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            schema: Schema {
                model_name: model_name.into(),
                collection: collection.into(),
                connection: None,
                primary: "_id".to_string(),
                fields: Vec::new(),
                embedded: Vec::new(),
                relations: Vec::new(),
                computed: Vec::new(),
                hooks: Hooks::default(),
            },
        }
    }

    /// Binds the model to a named connection.
    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.schema.connection = Some(name.into());
        self
    }

    /// Declares the primary key, replacing any earlier declaration. The key is
    /// stored under `_id` unless the field names another column.
    pub fn primary_key(mut self, mut field: FieldDef) -> Self {
        if field.column.is_none() {
            field.column = Some("_id".to_string());
        }
        self.schema.primary = field.name.clone();
        self.upsert_field(field);
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.upsert_field(field);
        self
    }

    fn upsert_field(&mut self, field: FieldDef) {
        match self.schema.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.schema.fields.push(field),
        }
    }

    /// Adjusts an already declared field, declaring it if needed.
    pub fn configure_field(mut self, name: &str, configure: impl FnOnce(FieldDef) -> FieldDef) -> Self {
        let position = self.schema.fields.iter().position(|f| f.name == name);
        match position {
            Some(index) => {
                let field = std::mem::take(&mut self.schema.fields[index]);
                self.schema.fields[index] = configure(field);
            }
            None => self.schema.fields.push(configure(FieldDef::new(name))),
        }
        self
    }

    pub fn rule(self, field: &str, rule: Rule) -> Self {
        self.configure_field(field, |f| f.with_rule(rule))
    }

    pub fn embedded(mut self, embedded: EmbeddedDef) -> Self {
        self.schema.embedded.retain(|e| e.name != embedded.name);
        self.schema.embedded.push(embedded);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.schema.relations.retain(|r| r.name != relation.name);
        self.schema.relations.push(relation);
        self
    }

    /// Adds a computed value included in serialization.
    pub fn computed(mut self, name: impl Into<String>, compute: impl Fn(&M) -> serde_json::Value + Send + Sync + 'static) -> Self {
        self.schema.computed.push((name.into(), Arc::new(compute)));
        self
    }

    fn record_hook<F>(mut self, event: HookEvent, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        let hook: RecordHook<M> = Arc::new(hook);
        self.schema.hooks.add_record(event, hook);
        self
    }

    fn query_hook<F>(mut self, event: HookEvent, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut QueryBuilder<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        let hook: QueryHook<M> = Arc::new(hook);
        self.schema.hooks.add_query(event, hook);
        self
    }

    pub fn before_save<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::BeforeSave, hook)
    }

    pub fn before_create<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::BeforeCreate, hook)
    }

    pub fn after_create<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::AfterCreate, hook)
    }

    pub fn before_update<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::BeforeUpdate, hook)
    }

    pub fn after_update<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::AfterUpdate, hook)
    }

    pub fn after_save<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::AfterSave, hook)
    }

    pub fn before_delete<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::BeforeDelete, hook)
    }

    pub fn after_delete<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::AfterDelete, hook)
    }

    /// Runs on the record returned by a single-record read.
    pub fn after_find<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.record_hook(HookEvent::AfterFind, hook)
    }

    /// Runs on the builder before a single-record read.
    pub fn before_find<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut QueryBuilder<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.query_hook(HookEvent::BeforeFind, hook)
    }

    /// Runs on the builder before a multi-record read.
    pub fn before_fetch<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut QueryBuilder<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        self.query_hook(HookEvent::BeforeFetch, hook)
    }

    /// Runs on the records returned by a multi-record read.
    pub fn after_fetch<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut Vec<Record<M>>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync + 'static,
    {
        let hook: FetchHook<M> = Arc::new(hook);
        self.schema.hooks.add_fetch(hook);
        self
    }

    pub fn build(self) -> Schema<M> {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    struct Plain;

    fn schema() -> Schema<Plain> {
        SchemaBuilder::new("UserProfile", "profiles")
            .primary_key(FieldDef::new("id"))
            .field(FieldDef::new("email").with_column("mail").with_rule(Rule::Required))
            .field(FieldDef::new("age"))
            .rule("age", Rule::range(18, 120))
            .field(FieldDef::new("name").with_prepare(|v| match v {
                Bson::String(s) => Bson::String(s.trim().to_string()),
                other => other,
            }))
            .build()
    }

    #[test]
    fn columns_map_both_ways() {
        let schema = schema();
        assert_eq!(schema.primary_column(), "_id");
        assert_eq!(schema.column_path("email"), "mail");
        assert_eq!(schema.column_path("address.city"), "address.city");

        let stored = schema.to_stored(&doc! { "id": 1, "email": "a@b.c", "name": " Ada " });
        assert_eq!(stored, doc! { "_id": 1, "mail": "a@b.c", "name": "Ada" });
        assert_eq!(
            schema.from_stored(stored),
            doc! { "id": 1, "email": "a@b.c", "name": "Ada" }
        );
    }

    #[test]
    fn validation_reports_field_value_and_rules() {
        let schema = schema();
        let error = schema
            .validate(&doc! { "email": "x", "name": "John", "age": 17 })
            .unwrap_err();

        match error {
            OdmError::Validation { field, value, rules } => {
                assert_eq!(field, "age");
                assert_eq!(value, Bson::Int32(17));
                assert_eq!(rules, vec!["range(18, 120)".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(schema.validate(&doc! { "email": "x", "age": 30 }).is_ok());
        assert!(schema.validate(&doc! { "age": 30 }).is_err());
    }

    #[test]
    fn rules_skip_absent_values_except_required() {
        assert!(Rule::range(1, 2).check(None));
        assert!(Rule::MaxLength(3).check(Some(&Bson::Null)));
        assert!(!Rule::Required.check(Some(&Bson::Null)));
        assert!(!Rule::MinLength(2).check(Some(&Bson::String("a".into()))));
        assert!(Rule::pattern("^a+$").unwrap().check(Some(&Bson::String("aaa".into()))));
        assert!(Rule::OneOf(vec![Bson::Int32(1)]).check(Some(&Bson::Int64(1))));
    }

    #[test]
    fn snake_cases_model_names() {
        assert_eq!(snake_case("UserProfile"), "user_profile");
        assert_eq!(snake_case("post"), "post");
    }
}
