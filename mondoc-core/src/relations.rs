//! Batched loading of related records.
//!
//! Loading a relation onto a batch of parents costs exactly one extra query:
//! the local key values of every parent are collected, the related model is
//! queried once with `where_in(foreign_key, values)`, and each result is
//! attached to the parents whose local key matches. The related query runs on
//! the parent's connection and joins the parent's transaction.
//!
//! ```ignore
//! let users = User::query()
//!     .load("profile")
//!     .load_with::<Post>("posts", |posts| posts.where_eq("published", true).order_by_desc("created_at"))
//!     .fetch(&db)
//!     .await?;
//!
//! for user in &users {
//!     let posts = user.related_many::<Post>("posts");
//! }
//! ```

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use bson::Bson;
use futures::future::BoxFuture;
use tracing::debug;

use crate::{
    builder::QueryBuilder,
    conditions::FilterDsl,
    connection::Connection,
    error::{OdmError, OdmResult},
    model::Model,
    path::get_path,
    record::{LoadedRelation, Record, RelatedRecord},
    schema::RelationKind,
    transaction::TransactionClient,
};

/// Related records keyed by their foreign key value.
pub type Related = Vec<(Bson, Box<dyn RelatedRecord>)>;

/// Fetches the records of one related model whose `foreign` key is one of
/// `keys`.
pub type RelatedFetcher = for<'a> fn(&'a Connection, Option<&'a TransactionClient>, &'a str, Vec<Bson>) -> BoxFuture<'a, OdmResult<Related>>;

type ConstrainedFetch = Arc<
    dyn for<'a> Fn(&'a Connection, Option<&'a TransactionClient>, &'a str, Vec<Bson>) -> BoxFuture<'a, OdmResult<Related>>
        + Send
        + Sync,
>;

fn constrained_fetch<F>(fetch: F) -> ConstrainedFetch
where
    F: for<'a> Fn(&'a Connection, Option<&'a TransactionClient>, &'a str, Vec<Bson>) -> BoxFuture<'a, OdmResult<Related>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(fetch)
}

async fn fetch_keyed<R: Model>(
    builder: QueryBuilder<R>,
    connection: &Connection,
    transaction: Option<&TransactionClient>,
    foreign: &str,
    keys: Vec<Bson>,
) -> OdmResult<Related> {
    let records = builder
        .where_in(foreign, keys)
        .fetch_with(connection, transaction.cloned())
        .await?;

    records
        .into_iter()
        .map(|record| {
            let key = get_path(&record.attributes()?, foreign)
                .cloned()
                .unwrap_or(Bson::Null);
            Ok((key, Box::new(record) as Box<dyn RelatedRecord>))
        })
        .collect()
}

/// Unconstrained fetch of `R` records, stored on every [`RelationDef`](crate::schema::RelationDef).
pub(crate) fn fetch_related<'a, R: Model>(
    connection: &'a Connection,
    transaction: Option<&'a TransactionClient>,
    foreign: &'a str,
    keys: Vec<Bson>,
) -> BoxFuture<'a, OdmResult<Related>> {
    Box::pin(fetch_keyed(QueryBuilder::<R>::new(), connection, transaction, foreign, keys))
}

/// Key used to match local and foreign values. Numbers compare by value.
fn match_key(value: &Bson) -> Option<String> {
    match value {
        Bson::Null | Bson::Undefined => None,
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Some((*n as i64).to_string()),
        other => Some(other.to_string()),
    }
}

/// A relation to load onto fetched records.
pub struct RelationLoad<M> {
    relation: String,
    constrained: Option<(TypeId, ConstrainedFetch)>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for RelationLoad<M> {
    fn clone(&self) -> Self {
        Self {
            relation: self.relation.clone(),
            constrained: self.constrained.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> fmt::Debug for RelationLoad<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationLoad")
            .field("relation", &self.relation)
            .field("constrained", &self.constrained.is_some())
            .finish()
    }
}

impl<M: Model> RelationLoad<M> {
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            constrained: None,
            _marker: PhantomData,
        }
    }

    /// Loads `relation`, letting `constrain` filter, sort or limit the
    /// related query. `R` must be the relation's target model.
    pub fn constrained<R, F>(relation: impl Into<String>, constrain: F) -> Self
    where
        R: Model,
        F: Fn(QueryBuilder<R>) -> QueryBuilder<R> + Send + Sync + 'static,
    {
        let constrain = Arc::new(constrain);
        let fetch = constrained_fetch(move |connection, transaction, foreign, keys| {
            let builder = constrain(QueryBuilder::<R>::new());
            Box::pin(fetch_keyed(builder, connection, transaction, foreign, keys))
        });

        Self {
            relation: relation.into(),
            constrained: Some((TypeId::of::<R>(), fetch)),
            _marker: PhantomData,
        }
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Loads the relation onto `records` with one query.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if the relation is not declared on `M`
    /// or a constrained load names the wrong target model.
    pub async fn load(
        &self,
        connection: &Connection,
        transaction: Option<&TransactionClient>,
        records: &mut [Record<M>],
    ) -> OdmResult<()> {
        let schema = M::schema();
        let def = schema.relation(&self.relation).ok_or_else(|| {
            OdmError::operation(
                "load",
                format!("`{}` is not a relation of {}", self.relation, schema.model_name()),
            )
        })?;

        if let Some((target, _)) = &self.constrained {
            if *target != def.target() {
                return Err(OdmError::operation(
                    "load",
                    format!("`{}` relates {} to {}", self.relation, schema.model_name(), def.target_model()),
                ));
            }
        }

        let (local, foreign) = def.keys(schema.model_name(), schema.primary_key());

        let mut locals = Vec::with_capacity(records.len());
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for record in records.iter() {
            let value = get_path(&record.attributes()?, &local).cloned();
            let key = value.as_ref().and_then(match_key);
            if let (Some(value), Some(key)) = (value, key.clone()) {
                if seen.insert(key) {
                    keys.push(value);
                }
            }
            locals.push(key);
        }

        let mut related: HashMap<String, Vec<Box<dyn RelatedRecord>>> = HashMap::new();
        if !keys.is_empty() {
            debug!(relation = %self.relation, keys = keys.len(), "load relation");
            let fetched = match &self.constrained {
                Some((_, fetch)) => fetch(connection, transaction, &foreign, keys).await?,
                None => (def.fetcher())(connection, transaction, &foreign, keys).await?,
            };
            for (value, record) in fetched {
                if let Some(key) = match_key(&value) {
                    related.entry(key).or_default().push(record);
                }
            }
        }

        for (record, key) in records.iter_mut().zip(locals) {
            let matches = key.and_then(|key| related.get(&key));
            let loaded = match def.kind() {
                RelationKind::HasMany => LoadedRelation::Many(
                    matches
                        .map(|m| m.iter().map(|r| r.clone_boxed()).collect())
                        .unwrap_or_default(),
                ),
                RelationKind::HasOne | RelationKind::BelongsTo => {
                    LoadedRelation::One(matches.and_then(|m| m.first()).map(|r| r.clone_boxed()))
                }
            };
            record.set_relation(&self.relation, loaded);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;

    #[test]
    fn numbers_match_across_widths() {
        assert_eq!(match_key(&Bson::Int32(7)), match_key(&Bson::Int64(7)));
        assert_eq!(match_key(&Bson::Double(7.0)), match_key(&Bson::Int32(7)));
        assert_ne!(match_key(&Bson::Double(7.5)), match_key(&Bson::Int32(7)));
        assert_eq!(match_key(&Bson::Null), None);

        let id = ObjectId::new();
        assert_eq!(match_key(&Bson::ObjectId(id)), match_key(&Bson::ObjectId(id)));
    }
}
