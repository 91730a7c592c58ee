//! In-memory storage implementation for document stores.
//!
//! Collections are insertion-ordered document vectors behind an async-aware
//! read-write lock. Transactions get a snapshot workspace: reads and writes
//! inside the session see the snapshot plus the session's own writes, while
//! other sessions see nothing until commit. Commit replays the session's write
//! log against the live collections and swaps the result in only if every
//! write succeeds.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use mea::rwlock::RwLock;
use tracing::{debug, info};

use mondoc_core::{
    backend::{SessionId, StoreBackend, StoreBackendBuilder},
    error::{OdmError, OdmResult, TransactionPhase},
    query::{Expr, GroupSpec, Query, Update, UpdateOutcome},
};

use crate::apply::{self, Collections};

/// A write recorded by a session, replayed on commit.
#[derive(Debug, Clone)]
enum Write {
    Insert {
        collection: String,
        documents: Vec<Document>,
    },
    Update {
        collection: String,
        filter: Option<Expr>,
        update: Update,
        multi: bool,
    },
    Delete {
        collection: String,
        filter: Option<Expr>,
        multi: bool,
    },
}

enum Applied {
    Inserted,
    Updated(UpdateOutcome),
    Deleted(u64),
}

impl Write {
    fn apply(&self, store: &mut Collections) -> OdmResult<Applied> {
        match self {
            Write::Insert { collection, documents } => {
                apply::insert(store, collection, documents.clone())?;
                Ok(Applied::Inserted)
            }
            Write::Update {
                collection,
                filter,
                update,
                multi,
            } => apply::update(store, collection, filter.as_ref(), update, *multi).map(Applied::Updated),
            Write::Delete {
                collection,
                filter,
                multi,
            } => apply::delete(store, collection, filter.as_ref(), *multi).map(Applied::Deleted),
        }
    }
}

#[derive(Debug)]
struct Session {
    workspace: Collections,
    log: Vec<Write>,
}

fn unknown_session(session: &SessionId) -> OdmError {
    OdmError::transaction(
        TransactionPhase::Use,
        format!("session {session} is not active on this store"),
    )
}

/// Thread-safe in-memory document storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, so
/// every clone shares the same collections and sessions.
///
/// Queries scan all documents in a collection (no indexing). The store is
/// meant for development and tests.
///
/// # Example
///
/// ```ignore
/// use mondoc_memory::InMemoryStore;
/// use mondoc_core::{backend::StoreBackend, query::{Filter, Query}};
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.insert_documents("users", vec![doc! { "name": "Alice", "age": 30 }], None).await?;
///
/// let adults = store
///     .find_documents("users", &Query::new().filter(Filter::gte("age", 18)), None)
///     .await?;
/// assert_eq!(adults.len(), 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    store: Arc<RwLock<Collections>>,
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Number of open sessions.
    pub async fn open_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn read<T>(&self, session: Option<&SessionId>, read: impl FnOnce(&Collections) -> OdmResult<T> + Send) -> OdmResult<T> {
        match session {
            Some(id) => {
                let sessions = self.sessions.read().await;
                let session = sessions
                    .get(id)
                    .ok_or_else(|| unknown_session(id))?;
                read(&session.workspace)
            }
            None => read(&*self.store.read().await),
        }
    }

    async fn write(&self, session: Option<&SessionId>, write: Write) -> OdmResult<Applied> {
        match session {
            Some(id) => {
                let mut sessions = self.sessions.write().await;
                let session = sessions
                    .get_mut(id)
                    .ok_or_else(|| unknown_session(id))?;
                let applied = write.apply(&mut session.workspace)?;
                session.log.push(write);
                Ok(applied)
            }
            None => write.apply(&mut *self.store.write().await),
        }
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find_documents(
        &self,
        collection: &str,
        query: &Query,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        debug!(collection, session = session.is_some(), "memory find");
        self.read(session, |store| apply::find(store, collection, query))
            .await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        debug!(collection, session = session.is_some(), "memory count");
        self.read(session, |store| apply::count(store, collection, filter))
            .await
    }

    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>> {
        self.read(session, |store| apply::distinct(store, collection, field, filter))
            .await
    }

    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        self.read(session, |store| apply::group(store, collection, query, group))
            .await
    }

    async fn insert_documents(
        &self,
        collection: &str,
        mut documents: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<()> {
        // Ids are fixed before logging so a replayed insert keeps them.
        for document in documents.iter_mut() {
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
        }

        debug!(collection, count = documents.len(), session = session.is_some(), "memory insert");
        let write = Write::Insert {
            collection: collection.to_string(),
            documents,
        };
        self.write(session, write).await?;
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
        debug!(collection, multi, session = session.is_some(), "memory update");
        let write = Write::Update {
            collection: collection.to_string(),
            filter: filter.cloned(),
            update: update.clone(),
            multi,
        };

        match self.write(session, write).await? {
            Applied::Updated(outcome) => Ok(outcome),
            _ => Ok(UpdateOutcome::default()),
        }
    }

    async fn delete_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        debug!(collection, multi, session = session.is_some(), "memory delete");
        let write = Write::Delete {
            collection: collection.to_string(),
            filter: filter.cloned(),
            multi,
        };

        match self.write(session, write).await? {
            Applied::Deleted(removed) => Ok(removed),
            _ => Ok(0),
        }
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        let workspace = self.store.read().await.clone();
        let id = SessionId::new();

        self.sessions.write().await.insert(
            id,
            Session {
                workspace,
                log: Vec::new(),
            },
        );

        info!(session = %id, "memory transaction started");
        Ok(id)
    }

    async fn commit_transaction(&self, session: &SessionId) -> OdmResult<()> {
        let mut sessions = self.sessions.write().await;
        let log = &sessions
            .get(session)
            .ok_or_else(|| unknown_session(session))?
            .log;

        let mut store = self.store.write().await;
        let mut replayed = store.clone();
        for write in log {
            write.apply(&mut replayed)?;
        }
        *store = replayed;

        sessions.remove(session);
        info!(session = %session, "memory transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self, session: &SessionId) -> OdmResult<()> {
        self.sessions
            .write()
            .await
            .remove(session)
            .ok_or_else(|| unknown_session(session))?;

        info!(session = %session, "memory transaction aborted");
        Ok(())
    }

    async fn create_collection(&self, name: &str) -> OdmResult<()> {
        self.store
            .write()
            .await
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        self.store.write().await.remove(name);
        Ok(())
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        let mut names = self
            .store
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();

        names.sort();
        Ok(names)
    }

    async fn shutdown(&self) -> OdmResult<()> {
        self.sessions.write().await.clear();
        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances, optionally seeded
/// with documents.
///
/// # Example
///
/// ```ignore
/// use mondoc_memory::InMemoryStore;
/// use mondoc_core::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .seed("users", vec![doc! { "name": "Alice" }])
///     .build()
///     .await?;
/// ```
#[derive(Default, Debug)]
pub struct InMemoryStoreBuilder {
    seed: Vec<(String, Vec<Document>)>,
}

impl InMemoryStoreBuilder {
    pub fn seed(mut self, collection: impl Into<String>, documents: Vec<Document>) -> Self {
        self.seed.push((collection.into(), documents));
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds the store and inserts the seed documents.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if the seed contains duplicate `_id`s.
    async fn build(self) -> OdmResult<Self::Backend> {
        let store = InMemoryStore::new();
        {
            let mut collections = store.store.write().await;
            for (collection, documents) in self.seed {
                apply::insert(&mut collections, &collection, documents)?;
            }
        }
        Ok(store)
    }
}
