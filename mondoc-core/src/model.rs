//! The model trait and its static entry points.
//!
//! A model is a plain serde type plus a [`Schema`]. Instances are wrapped in a
//! [`Record`], which tracks the persisted snapshot and lifecycle flags;
//! [`ModelExt`] supplies the static entry points (`query`, `find`, `create`,
//! ...) to every model.
//!
//! # Example
//!
//! ```ignore
//! use mondoc::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Model)]
//! #[mondoc(collection = "users")]
//! pub struct User {
//!     #[mondoc(primary)]
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<ObjectId>,
//!     pub name: String,
//!     pub age: i32,
//! }
//!
//! let mut user = User::create(&db, User { id: None, name: "Ada".into(), age: 36 }).await?;
//! user.age = 37;
//! user.save(&db).await?;
//!
//! let adults = User::query().where_op("age", ">=", 18).fetch(&db).await?;
//! ```

use std::fmt::Debug;

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    builder::QueryBuilder,
    conditions::FilterDsl,
    connection::Executor,
    error::{OdmError, OdmResult},
    record::{Record, to_attributes},
    schema::Schema,
};

/// A type persisted as documents of one collection.
pub trait Model: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// The schema of this model, built once.
    fn schema() -> &'static Schema<Self>;
}

/// Static operations available on every [`Model`].
#[async_trait]
pub trait ModelExt: Model {
    /// A new query builder over this model's collection.
    fn query() -> QueryBuilder<Self> {
        QueryBuilder::new()
    }

    async fn all<E>(executor: &E) -> OdmResult<Vec<Record<Self>>>
    where
        E: Executor + ?Sized,
    {
        Self::query().fetch(executor).await
    }

    async fn first<E>(executor: &E) -> OdmResult<Option<Record<Self>>>
    where
        E: Executor + ?Sized,
    {
        Self::query().first(executor).await
    }

    /// Looks a record up by primary key.
    async fn find<E, K>(executor: &E, id: K) -> OdmResult<Option<Record<Self>>>
    where
        E: Executor + ?Sized,
        K: Into<Bson> + Send,
    {
        Self::query().find(executor, id).await
    }

    /// Like [`ModelExt::find`], failing with [`OdmError::NotFound`].
    async fn find_or_fail<E, K>(executor: &E, id: K) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
        K: Into<Bson> + Send,
    {
        Self::query().find_or_fail(executor, id).await
    }

    async fn find_by<E, V>(executor: &E, field: &str, value: V) -> OdmResult<Option<Record<Self>>>
    where
        E: Executor + ?Sized,
        V: Into<Bson> + Send,
    {
        Self::query()
            .where_eq(field, value)
            .first(executor)
            .await
    }

    async fn find_by_or_fail<E, V>(executor: &E, field: &str, value: V) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
        V: Into<Bson> + Send,
    {
        Self::query()
            .where_eq(field, value)
            .first_or_fail(executor)
            .await
    }

    /// Looks several records up by primary key.
    async fn find_many<E, K>(executor: &E, ids: Vec<K>) -> OdmResult<Vec<Record<Self>>>
    where
        E: Executor + ?Sized,
        K: Into<Bson> + Send,
    {
        Self::query()
            .where_in(Self::schema().primary_key(), ids)
            .fetch(executor)
            .await
    }

    /// Persists `model` as a new record.
    ///
    /// If a before-hook aborts, the returned record is not persisted.
    async fn create<E>(executor: &E, model: Self) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
    {
        let mut record = Record::new(model);
        record.save(executor).await?;
        Ok(record)
    }

    /// Creates each model in turn, stopping at the first error.
    async fn create_many<E>(executor: &E, models: Vec<Self>) -> OdmResult<Vec<Record<Self>>>
    where
        E: Executor + ?Sized,
    {
        let mut records = Vec::with_capacity(models.len());
        for model in models {
            records.push(Self::create(executor, model).await?);
        }
        Ok(records)
    }

    /// Returns the first record matching `conditions`, or a new unsaved
    /// record built from `defaults` and `conditions`.
    async fn first_or_new<E>(executor: &E, conditions: Document, defaults: Self) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
    {
        if let Some(found) = where_all_eq(&conditions)?.first(executor).await? {
            return Ok(found);
        }

        let mut record = Record::new(defaults);
        record.fill(conditions)?;
        Ok(record)
    }

    /// Like [`ModelExt::first_or_new`], saving the new record.
    async fn first_or_create<E>(executor: &E, conditions: Document, defaults: Self) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
    {
        let mut record = Self::first_or_new(executor, conditions, defaults).await?;
        if !record.is_persisted() {
            record.save(executor).await?;
        }
        Ok(record)
    }

    /// Updates the first record matching `conditions` with the attributes of
    /// `values` (primary key excluded), or creates `values` merged with
    /// `conditions`.
    async fn update_or_create<E>(executor: &E, conditions: Document, values: Self) -> OdmResult<Record<Self>>
    where
        E: Executor + ?Sized,
    {
        let existing = where_all_eq::<Self>(&conditions)?.first(executor).await?;

        let mut record = match existing {
            Some(mut found) => {
                let mut attributes = to_attributes(&values)?;
                attributes.remove(Self::schema().primary_key());
                found.fill(attributes)?;
                found
            }
            None => {
                let mut record = Record::new(values);
                record.fill(conditions)?;
                record
            }
        };

        record.save(executor).await?;
        Ok(record)
    }
}

impl<M: Model> ModelExt for M {}

fn where_all_eq<M: Model>(conditions: &Document) -> OdmResult<QueryBuilder<M>> {
    if conditions.is_empty() {
        return Err(OdmError::operation(
            "first_or_new",
            "at least one condition is required",
        ));
    }

    Ok(conditions
        .iter()
        .fold(QueryBuilder::<M>::new(), |builder, (field, value)| {
            builder.where_eq(field, value.clone())
        }))
}
