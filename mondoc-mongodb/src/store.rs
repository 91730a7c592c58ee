//! The MongoDB store backend.
//!
//! Requests are compiled with [`mondoc_core::compile`] and dispatched on the
//! official async driver. Transactions map one [`SessionId`] onto one driver
//! [`ClientSession`] with an open transaction; the session sits behind its own
//! mutex because the driver needs exclusive access to it for every operation.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mea::mutex::Mutex;
use mongodb::{
    Client, ClientSession, Collection as MongoCollection,
    options::{ClientOptions, FindOptions, UpdateModifications},
};
use tracing::{debug, info};

use mondoc_core::{
    backend::{SessionId, StoreBackend, StoreBackendBuilder},
    compile::{
        UpdateDocument, compile_filter, compile_find_pipeline, compile_group, compile_projection, compile_sort,
        compile_update, saturating_i64,
    },
    config::ConnectionConfig,
    error::{OdmError, OdmResult, TransactionPhase},
    query::{Expr, GroupSpec, Query, Update, UpdateOutcome},
};

use crate::error::map_driver_error;

type SharedSession = Arc<Mutex<ClientSession>>;

/// Options of a plain find. Queries with embedded-array filters go through
/// [`compile_find_pipeline`] instead.
pub fn find_options(query: &Query) -> FindOptions {
    let mut options = FindOptions::default();

    options.sort = compile_sort(&query.sort);
    options.skip = query.offset.map(|skip| saturating_i64(skip).unsigned_abs());
    options.limit = query.limit.map(saturating_i64);
    options.projection = query.projection.as_ref().map(compile_projection);

    options
}

pub fn modifications(update: UpdateDocument) -> UpdateModifications {
    match update {
        UpdateDocument::Operators(document) => UpdateModifications::Document(document),
        UpdateDocument::Pipeline(pipeline) => UpdateModifications::Pipeline(pipeline),
    }
}

/// A [`StoreBackend`] backed by a MongoDB deployment.
///
/// Transactions require a replica set or sharded cluster.
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    name: String,
    client: Client,
    database: String,
    sessions: Arc<Mutex<HashMap<SessionId, SharedSession>>>,
}

impl MongoDbStore {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            name: String::from("mongodb"),
            client,
            database: database.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Names the connection in error messages.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(collection_name)
    }

    fn error(&self, operation: &str) -> impl Fn(mongodb::error::Error) -> OdmError + '_ {
        let operation = operation.to_string();
        move |error| map_driver_error(&self.name, &operation, error)
    }

    async fn session(&self, id: &SessionId) -> OdmResult<SharedSession> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| {
                OdmError::transaction(
                    TransactionPhase::Use,
                    format!("session {id} is not active on connection `{}`", self.name),
                )
            })
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        let collection = self.get_collection(collection);

        match session {
            Some(id) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                let mut cursor = collection
                    .aggregate(pipeline)
                    .session(&mut *session)
                    .await
                    .map_err(self.error("aggregate"))?;

                cursor
                    .stream(&mut *session)
                    .try_collect()
                    .await
                    .map_err(self.error("aggregate"))
            }
            None => collection
                .aggregate(pipeline)
                .await
                .map_err(self.error("aggregate"))?
                .try_collect()
                .await
                .map_err(self.error("aggregate")),
        }
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find_documents(
        &self,
        collection: &str,
        query: &Query,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        debug!(collection, session = session.is_some(), "mongodb find");

        if !query.element_filters.is_empty() {
            return self
                .aggregate(collection, compile_find_pipeline(query)?, session)
                .await;
        }

        let filter = compile_filter(query.filter.as_ref())?;
        let options = find_options(query);
        let collection = self.get_collection(collection);

        match session {
            Some(id) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                let mut cursor = collection
                    .find(filter)
                    .with_options(options)
                    .session(&mut *session)
                    .await
                    .map_err(self.error("find"))?;

                cursor
                    .stream(&mut *session)
                    .try_collect()
                    .await
                    .map_err(self.error("find"))
            }
            None => collection
                .find(filter)
                .with_options(options)
                .await
                .map_err(self.error("find"))?
                .try_collect()
                .await
                .map_err(self.error("find")),
        }
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        debug!(collection, session = session.is_some(), "mongodb count");
        let filter = compile_filter(filter)?;
        let collection = self.get_collection(collection);

        match session {
            Some(id) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                collection
                    .count_documents(filter)
                    .session(&mut *session)
                    .await
            }
            None => collection.count_documents(filter).await,
        }
        .map_err(self.error("count"))
    }

    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>> {
        debug!(collection, field, session = session.is_some(), "mongodb distinct");
        let filter = compile_filter(filter)?;
        let collection = self.get_collection(collection);

        match session {
            Some(id) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                collection
                    .distinct(field, filter)
                    .session(&mut *session)
                    .await
            }
            None => collection.distinct(field, filter).await,
        }
        .map_err(self.error("distinct"))
    }

    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        debug!(collection, keys = ?group.keys, session = session.is_some(), "mongodb group");
        self.aggregate(collection, compile_group(query, group)?, session)
            .await
    }

    async fn insert_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        debug!(collection, count = documents.len(), session = session.is_some(), "mongodb insert");
        let collection = self.get_collection(collection);

        match session {
            Some(id) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                collection
                    .insert_many(documents)
                    .session(&mut *session)
                    .await
            }
            None => collection.insert_many(documents).await,
        }
        .map_err(self.error("insert"))?;

        Ok(())
    }

    async fn update_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        update: &Update,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<UpdateOutcome> {
        let compiled = compile_update(filter, update)?;
        debug!(collection, multi, session = session.is_some(), "mongodb update");

        let collection = self.get_collection(collection);
        let update = modifications(compiled.update);

        let result = match (session, multi) {
            (Some(id), multi) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                if multi {
                    collection
                        .update_many(compiled.filter, update)
                        .session(&mut *session)
                        .await
                } else {
                    collection
                        .update_one(compiled.filter, update)
                        .session(&mut *session)
                        .await
                }
            }
            (None, true) => collection.update_many(compiled.filter, update).await,
            (None, false) => collection.update_one(compiled.filter, update).await,
        }
        .map_err(self.error("update"))?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    async fn delete_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        let filter = compile_filter(filter)?;
        debug!(collection, multi, session = session.is_some(), "mongodb delete");

        let collection = self.get_collection(collection);
        let result = match (session, multi) {
            (Some(id), multi) => {
                let session = self.session(id).await?;
                let mut session = session.lock().await;
                if multi {
                    collection
                        .delete_many(filter)
                        .session(&mut *session)
                        .await
                } else {
                    collection
                        .delete_one(filter)
                        .session(&mut *session)
                        .await
                }
            }
            (None, true) => collection.delete_many(filter).await,
            (None, false) => collection.delete_one(filter).await,
        }
        .map_err(self.error("delete"))?;

        Ok(result.deleted_count)
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(self.error("start_session"))?;
        session
            .start_transaction()
            .await
            .map_err(|error| OdmError::transaction_caused_by(TransactionPhase::Begin, map_driver_error(&self.name, "start_transaction", error)))?;

        let id = SessionId::new();
        self.sessions
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(session)));

        info!(connection = %self.name, session = %id, "mongodb transaction started");
        Ok(id)
    }

    async fn commit_transaction(&self, id: &SessionId) -> OdmResult<()> {
        let session = self.session(id).await?;
        session
            .lock()
            .await
            .commit_transaction()
            .await
            .map_err(self.error("commit_transaction"))?;

        self.sessions.lock().await.remove(id);
        info!(connection = %self.name, session = %id, "mongodb transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self, id: &SessionId) -> OdmResult<()> {
        let session = self.session(id).await?;
        let result = session
            .lock()
            .await
            .abort_transaction()
            .await
            .map_err(self.error("abort_transaction"));

        // The session cannot be reused after an abort attempt either way.
        self.sessions.lock().await.remove(id);
        info!(connection = %self.name, session = %id, "mongodb transaction aborted");
        result
    }

    async fn create_collection(&self, name: &str) -> OdmResult<()> {
        self.client
            .database(&self.database)
            .create_collection(name)
            .await
            .map_err(self.error("create_collection"))?;

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        self.get_collection(name)
            .drop()
            .await
            .map_err(self.error("drop_collection"))?;

        Ok(())
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        let mut names = self
            .client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(self.error("list_collections"))?;

        names.sort();
        Ok(names)
    }

    async fn shutdown(&self) -> OdmResult<()> {
        self.sessions.lock().await.clear();
        self.client.clone().shutdown().await;

        Ok(())
    }
}

/// Builds a [`MongoDbStore`] from a connection string or a
/// [`ConnectionConfig`].
///
/// # Example
///
/// ```ignore
/// use mondoc_core::backend::StoreBackendBuilder;
/// use mondoc_mongodb::MongoDbStore;
///
/// let store = MongoDbStore::builder("mongodb://localhost:27017/?replicaSet=rs0", "app")
///     .build()
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct MongoDbStoreBuilder {
    name: String,
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            name: String::from("mongodb"),
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }

    /// Takes address, credentials, database and driver options from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Connection`] if the config has no address.
    pub fn from_config(name: &str, config: &ConnectionConfig) -> OdmResult<Self> {
        Ok(Self {
            name: name.to_string(),
            dsn: config.connection_string(name)?,
            database: config.database.clone(),
        })
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    /// Parses the connection string and creates the client. The driver
    /// connects lazily, so an unreachable server surfaces on first use.
    async fn build(self) -> OdmResult<Self::Backend> {
        let options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|error| map_driver_error(&self.name, "connect", error))?;
        let client = Client::with_options(options).map_err(|error| map_driver_error(&self.name, "connect", error))?;

        info!(connection = %self.name, database = %self.database, "mongodb client created");
        Ok(MongoDbStore::new(client, self.database).with_name(self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use mondoc_core::query::{ElementLocator, Filter, Projection, SortDirection};

    #[test]
    fn find_options_follow_the_query() {
        let query = Query::new()
            .filter(Filter::eq("status", "open"))
            .sort("total", SortDirection::Desc)
            .offset(20)
            .limit(10)
            .project(Projection::Include(vec!["total".into()]));

        let options = find_options(&query);
        assert_eq!(options.sort, Some(doc! { "total": -1 }));
        assert_eq!(options.skip, Some(20));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.projection, Some(doc! { "total": 1 }));
    }

    #[test]
    fn unbounded_limits_stay_positive() {
        let options = find_options(&Query::new().offset(usize::MAX).limit(usize::MAX));

        assert_eq!(options.limit, Some(i64::MAX));
        assert_eq!(options.skip, Some(i64::MAX as u64));
    }

    #[test]
    fn positional_removal_becomes_a_pipeline() {
        let update = Update::new().pull_element("lines", ElementLocator::Index(2));
        let compiled = compile_update(None, &update).unwrap();

        assert!(matches!(modifications(compiled.update), UpdateModifications::Pipeline(stages) if stages.len() == 1));
    }

    #[test]
    fn config_builds_the_connection_string() {
        let config = ConnectionConfig::mongodb("mongodb://db.internal:27017", "app").with_option("maxPoolSize", 5);
        let builder = MongoDbStoreBuilder::from_config("main", &config).unwrap();

        assert_eq!(builder.dsn(), "mongodb://db.internal:27017?maxPoolSize=5");
        assert_eq!(builder.database, "app");
    }
}
