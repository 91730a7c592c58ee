//! Storage backend abstraction for the mapper.
//!
//! This module defines the traits that abstract over document store
//! implementations, allowing the mapper to run against MongoDB or an
//! in-process store with the same semantics.
//!
//! # Overview
//!
//! The [`StoreBackend`] trait provides a unified async interface for every
//! request the mapper issues: reads, counts, distinct values, grouping,
//! inserts, filtered updates and deletes, transaction control and collection
//! administration. Requests are expressed with the structured types of
//! [`crate::query`]; each backend translates them to its native form.
//!
//! Every operation optionally runs inside a transaction, identified by a
//! [`SessionId`] previously returned from
//! [`StoreBackend::start_transaction`].
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`DynStoreBackend`]: A trait for dynamic dispatch over backend implementations
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use mondoc_core::{backend::StoreBackend, query::{Filter, Query}};
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert_documents("users", vec![doc! { "name": "Alice", "age": 30 }], None).await?;
//!
//! let adults = backend
//!     .find_documents("users", &Query::new().filter(Filter::gte("age", 18)), None)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{any::Any, fmt, fmt::Debug};
use uuid::Uuid;

use crate::{
    error::OdmResult,
    query::{Expr, GroupSpec, Query, Update, UpdateOutcome},
};

/// Identifies an open transaction on one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Abstract interface for document storage backends.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from
/// multiple async tasks.
///
/// # Sessions
///
/// When `session` is `Some`, the operation runs inside that transaction: its
/// writes are invisible to other sessions until committed, and its reads
/// observe its own writes. Passing an unknown or finished session is an
/// error.
///
/// # Error Handling
///
/// Operations return [`OdmResult<T>`](crate::error::OdmResult). Native errors
/// are mapped to [`OdmError::Connection`](crate::error::OdmError::Connection)
/// or [`OdmError::Operation`](crate::error::OdmError::Operation), keeping any
/// labels the driver reports.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Queries documents in a collection.
    ///
    /// The filter, sort, skip, limit, element filters and projection of the
    /// [`Query`] are applied in that order.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection to query
    /// * `query` - Filters, sorting, pagination and projection
    /// * `session` - The transaction to run in, if any
    async fn find_documents(
        &self,
        collection: &str,
        query: &Query,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>>;

    /// Counts the documents matching `filter`, ignoring pagination.
    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<u64>;

    /// Returns the distinct values of `field` among the documents matching
    /// `filter`. Array values contribute their elements.
    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>>;

    /// Groups the documents matched by `query` and returns one row per group.
    ///
    /// See [`GroupSpec`] for the shape of each row. The query's sort, skip
    /// and limit apply to the grouped rows.
    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>>;

    /// Inserts new documents into a collection.
    ///
    /// Documents without an `_id` are assigned one. Inserting a document whose
    /// `_id` already exists fails with a duplicate key error.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection. Created automatically if it doesn't exist.
    /// * `documents` - The documents to insert
    /// * `session` - The transaction to run in, if any
    async fn insert_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<()>;

    /// Applies `update` to the documents matching `filter`.
    ///
    /// Only the first match is updated unless `multi` is set.
    async fn update_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        update: &Update,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<UpdateOutcome>;

    /// Deletes the documents matching `filter` and returns how many were
    /// removed. Only the first match is removed unless `multi` is set.
    async fn delete_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<u64>;

    /// Opens a session and starts a transaction on it.
    async fn start_transaction(&self) -> OdmResult<SessionId>;

    /// Commits the transaction.
    ///
    /// On failure the session stays open so the caller may still abort it.
    async fn commit_transaction(&self, session: &SessionId) -> OdmResult<()>;

    /// Aborts the transaction and discards its writes.
    async fn abort_transaction(&self, session: &SessionId) -> OdmResult<()>;

    /// Creates a new, empty collection.
    async fn create_collection(&self, name: &str) -> OdmResult<()>;

    /// Drops a collection and all its documents.
    ///
    /// # Warning
    ///
    /// This operation is irreversible.
    async fn drop_collection(&self, name: &str) -> OdmResult<()>;

    /// Lists the names of all collections in the store.
    async fn list_collections(&self) -> OdmResult<Vec<String>>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external
    /// connections should override this.
    async fn shutdown(&self) -> OdmResult<()> {
        Ok(())
    }
}

/// Object-safe mirror of [`StoreBackend`], implemented for every backend.
///
/// Connections hold their backend as `Arc<dyn DynStoreBackend>` so one
/// registry can hold backends of different types.
#[async_trait]
pub trait DynStoreBackend: Send + Sync + Debug {
    async fn find_documents(
        &self,
        collection: &str,
        query: &Query,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>>;
    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<u64>;
    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>>;
    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>>;
    async fn insert_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<()>;
    async fn update_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        update: &Update,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<UpdateOutcome>;
    async fn delete_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<u64>;
    async fn start_transaction(&self) -> OdmResult<SessionId>;
    async fn commit_transaction(&self, session: &SessionId) -> OdmResult<()>;
    async fn abort_transaction(&self, session: &SessionId) -> OdmResult<()>;
    async fn create_collection(&self, name: &str) -> OdmResult<()>;
    async fn drop_collection(&self, name: &str) -> OdmResult<()>;
    async fn list_collections(&self) -> OdmResult<Vec<String>>;
    async fn shutdown(&self) -> OdmResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

#[async_trait]
impl<B: StoreBackend + Send + Sync + 'static> DynStoreBackend for B {
    async fn find_documents(
        &self,
        collection: &str,
        query: &Query,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        StoreBackend::find_documents(self, collection, query, session)
            .await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        StoreBackend::count_documents(self, collection, filter, session)
            .await
    }

    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::distinct_values(self, collection, field, filter, session)
            .await
    }

    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        StoreBackend::group_documents(self, collection, query, group, session)
            .await
    }

    async fn insert_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&SessionId>,
    ) -> OdmResult<()> {
        StoreBackend::insert_documents(self, collection, documents, session)
            .await
    }

    async fn update_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        update: &Update,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<UpdateOutcome> {
        StoreBackend::update_documents(self, collection, filter, update, multi, session)
            .await
    }

    async fn delete_documents(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        multi: bool,
        session: Option<&SessionId>,
    ) -> OdmResult<u64> {
        StoreBackend::delete_documents(self, collection, filter, multi, session)
            .await
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        StoreBackend::start_transaction(self).await
    }

    async fn commit_transaction(&self, session: &SessionId) -> OdmResult<()> {
        StoreBackend::commit_transaction(self, session).await
    }

    async fn abort_transaction(&self, session: &SessionId) -> OdmResult<()> {
        StoreBackend::abort_transaction(self, session).await
    }

    async fn create_collection(&self, name: &str) -> OdmResult<()> {
        StoreBackend::create_collection(self, name).await
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        StoreBackend::drop_collection(self, name).await
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        StoreBackend::list_collections(self).await
    }

    async fn shutdown(&self) -> OdmResult<()> {
        StoreBackend::shutdown(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Factory for backend instances, used when building connections from
/// configuration.
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> OdmResult<Self::Backend>;
}
