//! Raw, schemaless access to a collection.
//!
//! A [`RawCollection`] issues requests directly against the backend with
//! plain BSON documents: no schema mapping, no hooks, no validation. It is
//! obtained from a [`Connection`], a [`Database`](crate::connection::Database)
//! or a [`TransactionClient`]; in the last case every request carries the
//! transaction's session.
//!
//! # Example
//!
//! ```ignore
//! use mondoc::query::{Filter, Query, Update};
//! use bson::doc;
//!
//! let audit = trx.collection("audit_log");
//! audit.insert(vec![doc! { "action": "transfer", "amount": 40 }]).await?;
//!
//! let recent = audit
//!     .find(Query::new().filter(Filter::eq("action", "transfer")).limit(10))
//!     .await?;
//! ```

use bson::{Bson, Document, oid::ObjectId};
use tracing::debug;

use crate::{
    backend::SessionId,
    connection::Connection,
    error::OdmResult,
    query::{Expr, GroupSpec, Query, Update, UpdateOutcome},
    transaction::TransactionClient,
};

/// A collection handle bound to a connection and, optionally, a transaction.
#[derive(Debug, Clone)]
pub struct RawCollection {
    name: String,
    connection: Connection,
    transaction: Option<TransactionClient>,
}

impl RawCollection {
    pub(crate) fn new(name: &str, connection: Connection, transaction: Option<TransactionClient>) -> Self {
        Self {
            name: name.to_string(),
            connection,
            transaction,
        }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn session(&self) -> OdmResult<Option<SessionId>> {
        self.transaction
            .as_ref()
            .map(TransactionClient::session)
            .transpose()
    }

    /// Inserts documents and returns their `_id`s, generating missing ones.
    ///
    /// # Errors
    ///
    /// Returns an [`OdmError`](crate::error::OdmError) if the transaction is
    /// no longer active or the store rejects the insert.
    pub async fn insert(&self, mut documents: Vec<Document>) -> OdmResult<Vec<Bson>> {
        let session = self.session()?;

        let ids = documents
            .iter_mut()
            .map(|document| match document.get("_id") {
                Some(id) if *id != Bson::Null => id.clone(),
                _ => {
                    let id = Bson::ObjectId(ObjectId::new());
                    document.insert("_id", id.clone());
                    id
                }
            })
            .collect::<Vec<_>>();

        debug!(collection = %self.name, count = documents.len(), session = session.is_some(), "raw insert");
        self.connection
            .backend()
            .insert_documents(&self.name, documents, session.as_ref())
            .await?;

        Ok(ids)
    }

    /// Queries documents in the collection.
    pub async fn find(&self, query: Query) -> OdmResult<Vec<Document>> {
        let session = self.session()?;

        debug!(collection = %self.name, session = session.is_some(), "raw find");
        self.connection
            .backend()
            .find_documents(&self.name, &query, session.as_ref())
            .await
    }

    /// Returns the first document matching `filter`.
    pub async fn find_one(&self, filter: Expr) -> OdmResult<Option<Document>> {
        Ok(self
            .find(Query::new().filter(filter).limit(1))
            .await?
            .into_iter()
            .next())
    }

    pub async fn count(&self, filter: Option<Expr>) -> OdmResult<u64> {
        let session = self.session()?;

        debug!(collection = %self.name, session = session.is_some(), "raw count");
        self.connection
            .backend()
            .count_documents(&self.name, filter.as_ref(), session.as_ref())
            .await
    }

    pub async fn distinct(&self, field: &str, filter: Option<Expr>) -> OdmResult<Vec<Bson>> {
        let session = self.session()?;

        debug!(collection = %self.name, field, session = session.is_some(), "raw distinct");
        self.connection
            .backend()
            .distinct_values(&self.name, field, filter.as_ref(), session.as_ref())
            .await
    }

    pub async fn group(&self, query: Query, group: GroupSpec) -> OdmResult<Vec<Document>> {
        let session = self.session()?;

        debug!(collection = %self.name, session = session.is_some(), "raw group");
        self.connection
            .backend()
            .group_documents(&self.name, &query, &group, session.as_ref())
            .await
    }

    /// Applies `update` to every document matching `filter`.
    pub async fn update_many(&self, filter: Option<Expr>, update: Update) -> OdmResult<UpdateOutcome> {
        self.update(filter, update, true).await
    }

    /// Applies `update` to the first document matching `filter`.
    pub async fn update_one(&self, filter: Expr, update: Update) -> OdmResult<UpdateOutcome> {
        self.update(Some(filter), update, false).await
    }

    async fn update(&self, filter: Option<Expr>, update: Update, multi: bool) -> OdmResult<UpdateOutcome> {
        let session = self.session()?;

        debug!(collection = %self.name, multi, session = session.is_some(), "raw update");
        self.connection
            .backend()
            .update_documents(&self.name, filter.as_ref(), &update, multi, session.as_ref())
            .await
    }

    /// Deletes every document matching `filter` and returns the count.
    pub async fn delete_many(&self, filter: Option<Expr>) -> OdmResult<u64> {
        let session = self.session()?;

        debug!(collection = %self.name, session = session.is_some(), "raw delete");
        self.connection
            .backend()
            .delete_documents(&self.name, filter.as_ref(), true, session.as_ref())
            .await
    }

    pub async fn delete_one(&self, filter: Expr) -> OdmResult<u64> {
        let session = self.session()?;

        debug!(collection = %self.name, session = session.is_some(), "raw delete");
        self.connection
            .backend()
            .delete_documents(&self.name, Some(&filter), false, session.as_ref())
            .await
    }

    /// Drops the collection.
    pub async fn drop(&self) -> OdmResult<()> {
        self.connection
            .backend()
            .drop_collection(&self.name)
            .await
    }
}
