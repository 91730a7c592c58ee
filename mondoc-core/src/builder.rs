//! The fluent query builder bound to a model.
//!
//! A [`QueryBuilder`] accumulates conditions, ordering, slicing, projection,
//! grouping, relation loads and embedded filters, then runs once through one
//! of its terminal methods. Field names are logical model names; the builder
//! maps them to stored columns through the model's [`Schema`](crate::schema::Schema).
//!
//! Invalid field paths, operators and operator/value combinations do not
//! panic and do not reach the store: they are recorded while the chain is
//! built and returned by the terminal method.
//!
//! # Example
//!
//! ```ignore
//! use mondoc::prelude::*;
//!
//! let page = User::query()
//!     .where_eq("status", "active")
//!     .or_where_eq("role", "admin")
//!     .order_by("created_at", "desc")
//!     .load("posts")
//!     .paginate(&db, 1, 10)
//!     .await?;
//!
//! let adults = User::query()
//!     .where_op("age", ">=", 18)
//!     .where_group(|g| g.where_eq("country", "DE").or_where_eq("country", "AT"))
//!     .count(&db)
//!     .await?;
//! ```

use std::{fmt, sync::Arc};

use bson::{Bson, Document};
use chrono::Utc;
use tracing::{debug, trace};

use crate::{
    compile::compile_filter,
    conditions::{ConditionGroup, Conditions, Connector, FieldResolver, FilterDsl},
    connection::{Connection, Executor, resolve, session_of},
    embedded::{EmbeddedDoc, EmbeddedQuery},
    error::{OdmError, OdmResult},
    hooks::{HookEvent, HookFlow},
    model::Model,
    page::{Page, PaginationParams},
    query::{
        Accumulator, AccumulatorKind, Expr, Filter, GroupSpec, IntoOperator, Projection, Query, Sort, SortDirection,
        Update, validate_field_path,
    },
    record::Record,
    relations::RelationLoad,
    schema::Cardinality,
    transaction::TransactionClient,
};

type ElementFilter = Arc<dyn Fn(Vec<(usize, Document)>) -> OdmResult<Vec<(usize, Document)>> + Send + Sync>;

/// How an embedded field is narrowed when records are fetched.
#[derive(Clone)]
enum EmbedSpec {
    /// The field as stored.
    Whole(String),
    /// Filtered in memory after the read.
    InMemory { field: String, apply: ElementFilter },
    /// Filtered by the store; paths in `filter` are relative to the element.
    Pushdown { field: String, filter: Expr },
}

impl fmt::Debug for EmbedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedSpec::Whole(field) => f.debug_tuple("Whole").field(field).finish(),
            EmbedSpec::InMemory { field, .. } => f.debug_struct("InMemory").field("field", field).finish_non_exhaustive(),
            EmbedSpec::Pushdown { field, filter } => f
                .debug_struct("Pushdown")
                .field("field", field)
                .field("filter", filter)
                .finish(),
        }
    }
}

fn resolve_column<M: Model>(field: &str) -> String {
    M::schema().column_path(field)
}

/// A single-use query over the collection of `M`.
pub struct QueryBuilder<M> {
    conditions: Conditions,
    sorts: Vec<Sort>,
    projection: Option<Projection>,
    skip: Option<usize>,
    limit: Option<usize>,
    group_keys: Vec<String>,
    accumulators: Vec<Accumulator>,
    having: ConditionGroup,
    loads: Vec<RelationLoad<M>>,
    embeds: Vec<EmbedSpec>,
    transaction: Option<TransactionClient>,
}

impl<M> Clone for QueryBuilder<M> {
    fn clone(&self) -> Self {
        Self {
            conditions: self.conditions.clone(),
            sorts: self.sorts.clone(),
            projection: self.projection.clone(),
            skip: self.skip,
            limit: self.limit,
            group_keys: self.group_keys.clone(),
            accumulators: self.accumulators.clone(),
            having: self.having.clone(),
            loads: self.loads.clone(),
            embeds: self.embeds.clone(),
            transaction: self.transaction.clone(),
        }
    }
}

impl<M> fmt::Debug for QueryBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("conditions", &self.conditions)
            .field("sorts", &self.sorts)
            .field("projection", &self.projection)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("group_keys", &self.group_keys)
            .field("accumulators", &self.accumulators)
            .field("loads", &self.loads)
            .field("embeds", &self.embeds)
            .field("transaction", &self.transaction.as_ref().map(TransactionClient::id))
            .finish()
    }
}

impl<M: Model> Default for QueryBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> FilterDsl for QueryBuilder<M> {
    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.conditions
    }

    fn field_resolver(&self) -> FieldResolver {
        resolve_column::<M>
    }
}

impl<M: Model> QueryBuilder<M> {
    pub fn new() -> Self {
        Self {
            conditions: Conditions::new(),
            sorts: Vec::new(),
            projection: None,
            skip: None,
            limit: None,
            group_keys: Vec::new(),
            accumulators: Vec::new(),
            having: ConditionGroup::plain(),
            loads: Vec::new(),
            embeds: Vec::new(),
            transaction: None,
        }
    }

    fn fail(mut self, error: OdmError) -> Self {
        self.conditions.fail(error);
        self
    }

    fn column(&mut self, field: &str) -> Option<String> {
        match validate_field_path(field) {
            Ok(()) => Some(M::schema().column_path(field)),
            Err(error) => {
                self.conditions.fail(error);
                None
            }
        }
    }

    /// Sorts by `field`. `direction` is `asc`/`desc` (any case) or `1`/`-1`.
    pub fn order_by(mut self, field: &str, direction: &str) -> Self {
        let Some(column) = self.column(field) else {
            return self;
        };

        match SortDirection::parse(direction) {
            Ok(direction) => {
                self.sorts.push(Sort {
                    field: column,
                    direction,
                });
                self
            }
            Err(error) => self.fail(error),
        }
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

    /// Alias of [`QueryBuilder::skip`].
    pub fn offset(self, offset: usize) -> Self {
        self.skip(offset)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `skip((page - 1) * per_page).limit(per_page)`.
    pub fn for_page(self, page: usize, per_page: usize) -> Self {
        if page < 1 || per_page < 1 {
            return self.fail(OdmError::operation("for_page", "page and per_page must be at least 1"));
        }
        match (page - 1).checked_mul(per_page) {
            Some(offset) => self.skip(offset).limit(per_page),
            None => self.fail(OdmError::operation("for_page", format!("page {page} of size {per_page} is out of range"))),
        }
    }

    /// Returns only `fields` (and the primary key). Cannot be combined with
    /// [`QueryBuilder::deselect`].
    ///
    /// Records are still deserialized into `M`, so fields left out must be
    /// optional or defaulted in the model; see [`QueryBuilder::fetch_documents`]
    /// for raw access.
    pub fn select(mut self, fields: &[&str]) -> Self {
        let mut columns = match self.projection.take() {
            None => Vec::new(),
            Some(Projection::Include(columns)) => columns,
            Some(exclude @ Projection::Exclude(_)) => {
                self.projection = Some(exclude);
                return self.fail(OdmError::operation("select", "select cannot be combined with deselect"));
            }
        };

        for field in fields {
            if let Some(column) = self.column(field) {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }

        let primary = M::schema().primary_column().to_string();
        if !columns.contains(&primary) {
            columns.insert(0, primary);
        }

        self.projection = Some(Projection::Include(columns));
        self
    }

    /// Returns everything except `fields`. Cannot be combined with
    /// [`QueryBuilder::select`].
    pub fn deselect(mut self, fields: &[&str]) -> Self {
        let mut columns = match self.projection.take() {
            None => Vec::new(),
            Some(Projection::Exclude(columns)) => columns,
            Some(include @ Projection::Include(_)) => {
                self.projection = Some(include);
                return self.fail(OdmError::operation("deselect", "deselect cannot be combined with select"));
            }
        };

        for field in fields {
            if let Some(column) = self.column(field) {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }

        self.projection = Some(Projection::Exclude(columns));
        self
    }

    /// Groups matched documents by `fields`; read the rows with
    /// [`QueryBuilder::groups`].
    pub fn group_by(mut self, fields: &[&str]) -> Self {
        for field in fields {
            if let Some(column) = self.column(field) {
                self.group_keys.push(column);
            }
        }
        self
    }

    fn accumulate(mut self, kind: AccumulatorKind, field: &str) -> Self {
        if let Some(column) = self.column(field) {
            self.accumulators
                .push(Accumulator::new(kind, column));
        }
        self
    }

    /// Adds `sum_<field>` to each group row.
    pub fn with_sum(self, field: &str) -> Self {
        self.accumulate(AccumulatorKind::Sum, field)
    }

    /// Adds `avg_<field>` to each group row.
    pub fn with_avg(self, field: &str) -> Self {
        self.accumulate(AccumulatorKind::Avg, field)
    }

    /// Adds `min_<field>` to each group row.
    pub fn with_min(self, field: &str) -> Self {
        self.accumulate(AccumulatorKind::Min, field)
    }

    /// Adds `max_<field>` to each group row.
    pub fn with_max(self, field: &str) -> Self {
        self.accumulate(AccumulatorKind::Max, field)
    }

    /// Filters group rows. `field` names a row key such as `count`,
    /// `sum_total` or a group key.
    pub fn having(mut self, field: &str, op: impl IntoOperator, value: impl Into<Bson>) -> Self {
        self.having = self.having.where_op(field, op, value);
        self
    }

    /// Loads a declared relation onto the fetched records with one batched
    /// query.
    pub fn load(mut self, relation: &str) -> Self {
        if M::schema().relation(relation).is_none() {
            return self.fail(unknown_relation::<M>(relation));
        }
        self.loads.push(RelationLoad::new(relation));
        self
    }

    /// Like [`QueryBuilder::load`], letting `constrain` shape the related
    /// query.
    pub fn load_with<R, F>(mut self, relation: &str, constrain: F) -> Self
    where
        R: Model,
        F: Fn(QueryBuilder<R>) -> QueryBuilder<R> + Send + Sync + 'static,
    {
        if M::schema().relation(relation).is_none() {
            return self.fail(unknown_relation::<M>(relation));
        }
        self.loads
            .push(RelationLoad::constrained::<R, F>(relation, constrain));
        self
    }

    fn embedded_field(&mut self, field: &str) -> Option<Cardinality> {
        match M::schema().embedded(field) {
            Some(def) => Some(def.cardinality),
            None => {
                self.conditions.fail(OdmError::operation(
                    "embed",
                    format!("`{field}` is not an embedded field of {}", M::schema().model_name()),
                ));
                None
            }
        }
    }

    /// Returns the embedded field as stored. Embedded documents travel with
    /// their parent, so this issues no extra query.
    pub fn embed(mut self, field: &str) -> Self {
        if self.embedded_field(field).is_some() {
            self.embeds.push(EmbedSpec::Whole(field.to_string()));
        }
        self
    }

    /// Narrows the embedded field in memory after the read. The fetched
    /// records remember which stored elements survived, so element saves
    /// still address the right element.
    pub fn embed_with<E, F>(mut self, field: &str, filter: F) -> Self
    where
        E: EmbeddedDoc,
        F: Fn(EmbeddedQuery<E>) -> EmbeddedQuery<E> + Send + Sync + 'static,
    {
        if self.embedded_field(field).is_some() {
            let apply: ElementFilter = Arc::new(move |items| filter(EmbeddedQuery::from_items(items)).into_filtered());
            self.embeds.push(EmbedSpec::InMemory {
                field: field.to_string(),
                apply,
            });
        }
        self
    }

    /// Narrows an embedded array in the store: only matching elements are
    /// returned. Paths in the group are relative to the element. Every filter
    /// operator is supported; sorting, slicing and search are in-memory only
    /// (see [`QueryBuilder::embed_with`]).
    pub fn embed_pushdown(mut self, field: &str, build: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        match self.embedded_field(field) {
            Some(Cardinality::Many) => {}
            Some(Cardinality::Single) => {
                return self.fail(OdmError::operation(
                    "embed",
                    format!("`{field}` holds a single document; only arrays can be filtered by the store"),
                ));
            }
            None => return self,
        }

        let group = build(ConditionGroup::plain()).into_conditions();
        if let Some(error) = group.error() {
            return self.fail(error.clone());
        }

        self.embeds.push(match group.to_expr() {
            Some(filter) => EmbedSpec::Pushdown {
                field: field.to_string(),
                filter,
            },
            None => EmbedSpec::Whole(field.to_string()),
        });
        self
    }

    /// Runs every operation of this builder, and binds every fetched record,
    /// to `transaction`.
    pub fn use_transaction(mut self, transaction: TransactionClient) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// The store-independent query this builder describes.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded while the chain was built.
    pub fn to_query(&self) -> OdmResult<Query> {
        self.conditions.check()?;

        let mut query = Query {
            filter: self.conditions.to_expr(),
            sort: self.sorts.clone(),
            projection: self.projection.clone(),
            offset: self.skip,
            limit: self.limit,
            element_filters: Vec::new(),
        };

        for embed in &self.embeds {
            if let EmbedSpec::Pushdown { field, filter } = embed {
                query = query.filter_elements(M::schema().column_path(field), filter.clone());
            }
        }
        Ok(query)
    }

    /// The compiled native filter document.
    pub fn to_filter(&self) -> OdmResult<Document> {
        self.conditions.check()?;
        compile_filter(self.conditions.to_expr().as_ref())
    }

    fn group_spec(&self) -> OdmResult<Option<GroupSpec>> {
        if self.group_keys.is_empty() && self.accumulators.is_empty() {
            return Ok(None);
        }

        let having = self.having.clone().into_conditions();
        having.check()?;

        Ok(Some(GroupSpec {
            keys: self.group_keys.clone(),
            accumulators: self.accumulators.clone(),
            having: having.to_expr(),
        }))
    }

    fn target<E: Executor + ?Sized>(&self, executor: &E) -> OdmResult<(Connection, Option<TransactionClient>)> {
        resolve(executor, M::schema().connection(), self.transaction.as_ref())
    }

    fn where_key(self, id: Bson) -> Self {
        let schema = M::schema();
        let id = match schema.field(schema.primary_key()) {
            Some(field) => field.prepare(id),
            None => id,
        };
        self.push_expr(Connector::And, Filter::eq(schema.primary_column(), id))
    }

    /// Runs the query and hydrates every matching document.
    ///
    /// Runs the `before_fetch` and `after_fetch` hooks, then loads the
    /// requested relations.
    ///
    /// # Errors
    ///
    /// Returns a recorded build error, a hook error, or a store error.
    pub async fn fetch<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Vec<Record<M>>> {
        let (connection, transaction) = self.target(executor)?;
        self.fetch_with(&connection, transaction).await
    }

    /// Alias of [`QueryBuilder::fetch`].
    pub async fn all<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Vec<Record<M>>> {
        self.fetch(executor).await
    }

    pub(crate) async fn fetch_with(
        mut self,
        connection: &Connection,
        transaction: Option<TransactionClient>,
    ) -> OdmResult<Vec<Record<M>>> {
        let hooks = M::schema().hooks();
        if hooks
            .run_query(HookEvent::BeforeFetch, &mut self)
            .await?
            == HookFlow::Abort
        {
            return Ok(Vec::new());
        }

        let mut records = self.read(connection, transaction).await?;
        hooks.run_fetch(&mut records).await?;
        Ok(records)
    }

    async fn read(&self, connection: &Connection, transaction: Option<TransactionClient>) -> OdmResult<Vec<Record<M>>> {
        let schema = M::schema();
        let query = self.to_query()?;
        let session = session_of(transaction.as_ref())?;

        debug!(collection = schema.collection(), session = session.is_some(), "find records");
        trace!(filter = ?query.filter, sort = ?query.sort, skip = ?query.offset, limit = ?query.limit, "compiled query");

        let documents = connection
            .backend()
            .find_documents(schema.collection(), &query, session.as_ref())
            .await?;

        let mut records = documents
            .into_iter()
            .map(|document| Record::hydrate(document, self.transaction.clone()))
            .collect::<OdmResult<Vec<_>>>()?;

        for embed in &self.embeds {
            for record in records.iter_mut() {
                apply_embed(embed, record)?;
            }
        }

        for load in &self.loads {
            load.load(connection, transaction.as_ref(), &mut records)
                .await?;
        }

        Ok(records)
    }

    /// The first matching record, if any.
    ///
    /// Runs the `before_find` hooks on the builder and the `after_find` hooks
    /// on the record.
    pub async fn first<E: Executor + ?Sized>(mut self, executor: &E) -> OdmResult<Option<Record<M>>> {
        let (connection, transaction) = self.target(executor)?;
        let hooks = M::schema().hooks();

        if hooks
            .run_query(HookEvent::BeforeFind, &mut self)
            .await?
            == HookFlow::Abort
        {
            return Ok(None);
        }

        self.limit = Some(1);
        let Some(mut record) = self
            .read(&connection, transaction)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        hooks
            .run_record(HookEvent::AfterFind, &mut record)
            .await?;
        Ok(Some(record))
    }

    /// Like [`QueryBuilder::first`], failing with [`OdmError::NotFound`]
    /// carrying the compiled filter.
    pub async fn first_or_fail<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Record<M>> {
        let criterion = self.to_filter()?.to_string();

        self.first(executor)
            .await?
            .ok_or_else(|| OdmError::not_found(M::schema().model_name(), criterion))
    }

    /// The record with primary key `id`, within the current conditions.
    pub async fn find<E, K>(self, executor: &E, id: K) -> OdmResult<Option<Record<M>>>
    where
        E: Executor + ?Sized,
        K: Into<Bson> + Send,
    {
        self.where_key(id.into()).first(executor).await
    }

    /// Like [`QueryBuilder::find`], failing with [`OdmError::NotFound`].
    pub async fn find_or_fail<E, K>(self, executor: &E, id: K) -> OdmResult<Record<M>>
    where
        E: Executor + ?Sized,
        K: Into<Bson> + Send,
    {
        self.where_key(id.into())
            .first_or_fail(executor)
            .await
    }

    /// Number of matching documents. Only the count travels back.
    pub async fn count<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<u64> {
        let (connection, transaction) = self.target(executor)?;
        self.conditions.check()?;
        let filter = self.conditions.to_expr();
        let session = session_of(transaction.as_ref())?;

        debug!(collection = M::schema().collection(), "count records");
        connection
            .backend()
            .count_documents(M::schema().collection(), filter.as_ref(), session.as_ref())
            .await
    }

    /// Whether any document matches. Reads at most one primary key.
    pub async fn exists<E: Executor + ?Sized>(mut self, executor: &E) -> OdmResult<bool> {
        self.projection = Some(Projection::Include(vec![M::schema().primary_column().to_string()]));
        self.embeds.clear();
        self.skip = None;

        Ok(!self
            .limit(1)
            .raw(executor)
            .await?
            .is_empty())
    }

    /// One page of matching records plus the total count.
    ///
    /// Outside a transaction the count and the read run concurrently; inside
    /// one they run in sequence on the transaction's session.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if `page` or `per_page` is below 1, or
    /// if the page starts beyond the addressable range.
    pub async fn paginate<E: Executor + ?Sized>(mut self, executor: &E, page: u64, per_page: u64) -> OdmResult<Page<Record<M>>> {
        let params = PaginationParams::new(page, per_page);
        params.validate()?;

        let (connection, transaction) = self.target(executor)?;
        let hooks = M::schema().hooks();
        if hooks
            .run_query(HookEvent::BeforeFetch, &mut self)
            .await?
            == HookFlow::Abort
        {
            return Ok(Page::new(Vec::new(), 0, params));
        }

        self.conditions.check()?;
        let filter = self.conditions.to_expr();
        let session = session_of(transaction.as_ref())?;

        self.skip = Some(usize::try_from(params.offset()).unwrap_or(usize::MAX));
        self.limit = Some(usize::try_from(per_page).unwrap_or(usize::MAX));

        let count = connection
            .backend()
            .count_documents(M::schema().collection(), filter.as_ref(), session.as_ref());

        let (total, mut records) = if session.is_some() {
            let total = count.await?;
            (total, self.read(&connection, transaction).await?)
        } else {
            futures::try_join!(count, self.read(&connection, transaction))?
        };

        hooks.run_fetch(&mut records).await?;
        Ok(Page::new(records, total, params))
    }

    /// Sets `values` on every matching document and returns the number of
    /// documents matched, whether or not they changed. Keys are logical
    /// paths; `auto_update` fields are stamped. Runs no record hooks.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] for empty updates, invalid paths or
    /// attempts to change the primary key.
    pub async fn update<E: Executor + ?Sized>(self, executor: &E, values: Document) -> OdmResult<u64> {
        let schema = M::schema();
        let (connection, transaction) = self.target(executor)?;
        self.conditions.check()?;

        if values.is_empty() {
            return Err(OdmError::operation("update", "nothing to update"));
        }

        let mut update = Update::new();
        for (path, value) in values {
            validate_field_path(&path)?;
            let column = schema.column_path(&path);
            let head = path.split('.').next().unwrap_or(&path);
            let column_head = column.split('.').next().unwrap_or(&column);
            if head == schema.primary_key() || column_head == schema.primary_column() {
                return Err(OdmError::operation("update", "the primary key cannot be updated"));
            }

            let value = match schema.field(&path) {
                Some(field) => field.prepare(value),
                None => value,
            };
            update = update.set(column, value);
        }

        let now = bson::DateTime::from_chrono(Utc::now());
        for field in schema.fields().iter().filter(|f| f.is_auto_update()) {
            update = update.set(field.column(), now);
        }

        let filter = self.conditions.to_expr();
        let session = session_of(transaction.as_ref())?;

        debug!(collection = schema.collection(), "bulk update");
        let outcome = connection
            .backend()
            .update_documents(schema.collection(), filter.as_ref(), &update, true, session.as_ref())
            .await?;
        Ok(outcome.matched)
    }

    /// Deletes every matching document and returns how many were removed.
    /// Runs no record hooks.
    pub async fn delete<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<u64> {
        let (connection, transaction) = self.target(executor)?;
        self.conditions.check()?;
        let filter = self.conditions.to_expr();
        let session = session_of(transaction.as_ref())?;

        debug!(collection = M::schema().collection(), "bulk delete");
        connection
            .backend()
            .delete_documents(M::schema().collection(), filter.as_ref(), true, session.as_ref())
            .await
    }

    /// Primary keys of the matching documents.
    pub async fn ids<E: Executor + ?Sized>(mut self, executor: &E) -> OdmResult<Vec<Bson>> {
        let schema = M::schema();
        let primary = schema.primary_column().to_string();
        self.projection = Some(Projection::Include(vec![primary.clone()]));

        Ok(self
            .raw(executor)
            .await?
            .into_iter()
            .filter_map(|mut document| document.remove(&primary))
            .map(|id| match schema.field(schema.primary_key()) {
                Some(field) => field.consume(id),
                None => id,
            })
            .collect())
    }

    /// Distinct values of `field` among the matching documents.
    pub async fn distinct<E: Executor + ?Sized>(self, executor: &E, field: &str) -> OdmResult<Vec<Bson>> {
        validate_field_path(field)?;
        let (connection, transaction) = self.target(executor)?;
        self.conditions.check()?;
        let filter = self.conditions.to_expr();
        let session = session_of(transaction.as_ref())?;

        connection
            .backend()
            .distinct_values(
                M::schema().collection(),
                &M::schema().column_path(field),
                filter.as_ref(),
                session.as_ref(),
            )
            .await
    }

    /// Grouped rows as configured by [`QueryBuilder::group_by`] and the
    /// `with_*` accumulators. Group keys appear under their stored paths with
    /// dots replaced by underscores.
    pub async fn groups<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Vec<Document>> {
        let group = self
            .group_spec()?
            .ok_or_else(|| OdmError::operation("groups", "call group_by or a with_* accumulator first"))?;
        let (connection, transaction) = self.target(executor)?;
        let query = self.to_query()?;
        let session = session_of(transaction.as_ref())?;

        debug!(collection = M::schema().collection(), keys = ?group.keys, "group records");
        connection
            .backend()
            .group_documents(M::schema().collection(), &query, &group, session.as_ref())
            .await
    }

    /// Matching documents as logical attribute documents, without hydrating
    /// records or running hooks.
    pub async fn fetch_documents<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Vec<Document>> {
        let schema = M::schema();
        Ok(self
            .raw(executor)
            .await?
            .into_iter()
            .map(|document| schema.from_stored(document))
            .collect())
    }

    async fn raw<E: Executor + ?Sized>(self, executor: &E) -> OdmResult<Vec<Document>> {
        let (connection, transaction) = self.target(executor)?;
        let query = self.to_query()?;
        let session = session_of(transaction.as_ref())?;

        connection
            .backend()
            .find_documents(M::schema().collection(), &query, session.as_ref())
            .await
    }
}

fn unknown_relation<M: Model>(relation: &str) -> OdmError {
    OdmError::operation(
        "load",
        format!("`{relation}` is not a relation of {}", M::schema().model_name()),
    )
}

fn apply_embed<M: Model>(embed: &EmbedSpec, record: &mut Record<M>) -> OdmResult<()> {
    match embed {
        EmbedSpec::Whole(_) => Ok(()),
        EmbedSpec::Pushdown { field, .. } => {
            record.partial.insert(field.clone(), None);
            Ok(())
        }
        EmbedSpec::InMemory { field, apply } => {
            let cardinality = record.embedded_def(field)?.cardinality;
            let kept = apply(record.embedded_items(field)?)?;
            let positions = kept.iter().map(|(position, _)| *position).collect();

            let value = match cardinality {
                Cardinality::Many => Bson::Array(
                    kept.into_iter()
                        .map(|(_, document)| Bson::Document(document))
                        .collect(),
                ),
                Cardinality::Single => kept
                    .into_iter()
                    .next()
                    .map_or(Bson::Null, |(_, document)| Bson::Document(document)),
            };

            record.set_attribute(field, value)?;
            record.original = record.attributes()?;
            record.partial.insert(field.clone(), Some(positions));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use bson::{doc, oid::ObjectId};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        query::FieldOp,
        schema::{EmbeddedDef, FieldDef, RelationDef, Schema, SchemaBuilder},
    };

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<ObjectId>,
        name: String,
        age: i32,
        #[serde(default)]
        tags: Vec<Bson>,
    }

    impl Model for Account {
        fn schema() -> &'static Schema<Self> {
            static SCHEMA: OnceLock<Schema<Account>> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                SchemaBuilder::new("Account", "accounts")
                    .primary_key(FieldDef::new("_id"))
                    .field(FieldDef::new("name").with_column("full_name"))
                    .field(FieldDef::new("age"))
                    .embedded(EmbeddedDef::many("tags"))
                    .relation(RelationDef::has_many::<Account>("children"))
                    .build()
            })
        }
    }

    fn query() -> QueryBuilder<Account> {
        QueryBuilder::new()
    }

    #[test]
    fn both_alphabets_compile_to_the_same_filter() {
        for (symbol, keyword) in [("=", "eq"), ("!=", "ne"), (">", "gt"), (">=", "gte"), ("<", "lt"), ("<=", "lte")] {
            assert_eq!(
                query().where_op("age", symbol, 18).to_filter().unwrap(),
                query().where_op("age", keyword, 18).to_filter().unwrap(),
            );
        }
        assert_eq!(
            query().where_op("age", ">=", 18).to_filter().unwrap(),
            doc! { "age": { "$gte": 18 } }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = query()
            .where_eq("age", 1)
            .or_where_eq("age", 2)
            .where_eq("name", "x")
            .to_query()
            .unwrap()
            .filter
            .unwrap();

        assert_eq!(
            expr,
            Expr::Or(vec![
                Expr::field("age", FieldOp::Eq, 1),
                Expr::And(vec![Expr::field("age", FieldOp::Eq, 2), Expr::field("full_name", FieldOp::Eq, "x")]),
            ])
        );
    }

    #[test]
    fn maps_logical_names_to_columns() {
        let query = query()
            .where_like("name", "Ada%")
            .order_by("name", "DESC")
            .select(&["name"])
            .to_query()
            .unwrap();

        assert_eq!(query.sort[0].field, "full_name");
        assert_eq!(query.projection, Some(Projection::Include(vec!["_id".into(), "full_name".into()])));
    }

    #[test]
    fn for_page_and_offset() {
        let query = query().for_page(3, 20).to_query().unwrap();
        assert_eq!((query.offset, query.limit), (Some(40), Some(20)));

        let query = QueryBuilder::<Account>::new().offset(5).to_query().unwrap();
        assert_eq!(query.offset, Some(5));

        assert!(QueryBuilder::<Account>::new().for_page(usize::MAX, 2).to_query().is_err());
        assert!(QueryBuilder::<Account>::new().for_page(0, 2).to_query().is_err());
    }

    #[test]
    fn build_errors_surface_at_the_terminal() {
        assert!(query().where_op("age", "~=", 1).to_query().is_err());
        assert!(query().where_eq("bad..path", 1).to_query().is_err());
        assert!(query().where_op("age", "in", 1).to_query().is_err());
        assert!(query().select(&["name"]).deselect(&["age"]).to_query().is_err());
        assert!(query().order_by("age", "up").to_query().is_err());
        assert!(query().load("parents").to_query().is_err());
        assert!(query().embed("name").to_query().is_err());
        assert!(query().load("children").embed("tags").to_query().is_ok());
    }

    #[test]
    fn pushdown_becomes_an_element_filter() {
        let query = query()
            .embed_pushdown("tags", |g| g.where_eq("label", "red"))
            .to_query()
            .unwrap();

        assert_eq!(query.element_filters.len(), 1);
        assert_eq!(query.element_filters[0].field, "tags");
        assert_eq!(query.element_filters[0].filter, Expr::field("label", FieldOp::Eq, "red"));
    }

    #[test]
    fn groups_need_a_grouping() {
        assert!(query().group_spec().unwrap().is_none());

        let spec = query()
            .group_by(&["age"])
            .with_sum("age")
            .having("count", ">", 1)
            .group_spec()
            .unwrap()
            .unwrap();
        assert_eq!(spec.keys, vec!["age".to_string()]);
        assert_eq!(spec.accumulators[0].alias, "sum_age");
        assert_eq!(spec.having, Some(Expr::field("count", FieldOp::Gt, 1)));
    }
}
