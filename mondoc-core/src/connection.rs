//! The connection registry and the execution contexts built on it.
//!
//! A [`Connection`] is a named, shared handle on one backend. A [`Database`]
//! registers several connections and resolves a default plus named
//! alternates. Models that declare a connection name are routed to it; all
//! others use the default.
//!
//! Operations take an [`Executor`]: a [`Database`], a [`Connection`] or a
//! [`TransactionClient`]. The executor resolves the connection for a model and
//! exposes the active transaction, which is how one session is threaded
//! through models, query builders and raw collections.
//!
//! # Example
//!
//! ```ignore
//! use mondoc::{connection::Database, memory::InMemoryStore};
//!
//! let db = Database::builder()
//!     .connection("main", InMemoryStore::new())
//!     .connection("reports", InMemoryStore::new())
//!     .default_connection("main")
//!     .build()?;
//!
//! let users = User::query().where_eq("status", "active").fetch(&db).await?;
//! ```

use std::{collections::HashMap, future::Future, sync::Arc};

use crate::{
    backend::{DynStoreBackend, SessionId, StoreBackend},
    collection::RawCollection,
    error::{OdmError, OdmResult, TransactionPhase},
    transaction::{TransactionClient, run_managed},
};

/// A named handle on one store backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    name: Arc<str>,
    backend: Arc<dyn DynStoreBackend>,
}

impl Connection {
    pub fn new<B>(name: impl AsRef<str>, backend: B) -> Self
    where
        B: StoreBackend + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            backend: Arc::new(backend),
        }
    }

    /// Wraps an already shared backend.
    pub fn from_shared(name: impl AsRef<str>, backend: Arc<dyn DynStoreBackend>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn DynStoreBackend {
        self.backend.as_ref()
    }

    /// Returns the backend as its concrete type, if it is a `B`.
    pub fn downcast_backend<B: StoreBackend + 'static>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref::<B>()
    }

    /// A raw, schemaless view of a collection on this connection.
    pub fn collection(&self, name: &str) -> RawCollection {
        RawCollection::new(name, self.clone(), None)
    }

    /// Starts a transaction to be committed or rolled back by the caller.
    pub async fn begin_transaction(&self) -> OdmResult<TransactionClient> {
        TransactionClient::begin(self).await
    }

    /// Runs `callback` in a transaction that commits on `Ok` and rolls back
    /// on `Err`.
    pub async fn transaction<F, Fut, T>(&self, callback: F) -> OdmResult<T>
    where
        F: FnOnce(TransactionClient) -> Fut,
        Fut: Future<Output = OdmResult<T>>,
    {
        run_managed(self, callback).await
    }

    pub async fn shutdown(&self) -> OdmResult<()> {
        self.backend.shutdown().await
    }
}

#[derive(Debug)]
struct DatabaseInner {
    default: String,
    connections: HashMap<String, Connection>,
}

/// Registry of named connections with a default. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// A registry holding only `connection`, which becomes the default.
    pub fn single(connection: Connection) -> Self {
        let default = connection.name().to_string();
        Self {
            inner: Arc::new(DatabaseInner {
                connections: HashMap::from([(default.clone(), connection)]),
                default,
            }),
        }
    }

    /// Resolves a connection by name, or the default one.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Connection`] if no connection has that name.
    pub fn connection(&self, name: Option<&str>) -> OdmResult<Connection> {
        let name = name.unwrap_or(&self.inner.default);

        self.inner
            .connections
            .get(name)
            .cloned()
            .ok_or_else(|| OdmError::connection(name, "connection is not registered"))
    }

    pub fn default_connection(&self) -> OdmResult<Connection> {
        self.connection(None)
    }

    pub fn connection_names(&self) -> Vec<&str> {
        let mut names = self
            .inner
            .connections
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// A raw collection on the default connection.
    pub fn collection(&self, name: &str) -> OdmResult<RawCollection> {
        Ok(self.default_connection()?.collection(name))
    }

    /// Starts a manual transaction on the default connection.
    pub async fn begin_transaction(&self) -> OdmResult<TransactionClient> {
        self.default_connection()?
            .begin_transaction()
            .await
    }

    /// Runs a managed transaction on the default connection.
    pub async fn transaction<F, Fut, T>(&self, callback: F) -> OdmResult<T>
    where
        F: FnOnce(TransactionClient) -> Fut,
        Fut: Future<Output = OdmResult<T>>,
    {
        let connection = self.default_connection()?;
        run_managed(&connection, callback).await
    }

    /// Shuts every connection down, returning the first failure.
    pub async fn shutdown(&self) -> OdmResult<()> {
        let mut first_error = None;

        for connection in self.inner.connections.values() {
            if let Err(e) = connection.shutdown().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builder for [`Database`].
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    default: Option<String>,
    connections: Vec<Connection>,
}

impl DatabaseBuilder {
    /// Registers a backend under `name`. The first registered connection is
    /// the default unless [`DatabaseBuilder::default_connection`] says otherwise.
    pub fn connection<B>(mut self, name: impl AsRef<str>, backend: B) -> Self
    where
        B: StoreBackend + 'static,
    {
        self.connections.push(Connection::new(name, backend));
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`OdmError::Connection`] if no connection was registered or the
    /// default names an unknown connection.
    pub fn build(self) -> OdmResult<Database> {
        let default = match (self.default, self.connections.first()) {
            (Some(default), _) => default,
            (None, Some(first)) => first.name().to_string(),
            (None, None) => return Err(OdmError::connection("default", "no connection registered")),
        };

        let connections = self
            .connections
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect::<HashMap<_, _>>();

        if !connections.contains_key(&default) {
            return Err(OdmError::connection(&default, "default connection is not registered"));
        }

        Ok(Database {
            inner: Arc::new(DatabaseInner { default, connections }),
        })
    }
}

/// Something operations can run through.
///
/// `connection` is the name a model declares, if any.
pub trait Executor: Send + Sync {
    /// Resolves the connection an operation must run on.
    fn connection_for(&self, connection: Option<&str>) -> OdmResult<Connection>;

    /// The transaction operations must join, if any.
    fn transaction(&self) -> Option<&TransactionClient> {
        None
    }
}

impl Executor for Database {
    fn connection_for(&self, connection: Option<&str>) -> OdmResult<Connection> {
        self.connection(connection)
    }
}

impl Executor for Connection {
    fn connection_for(&self, connection: Option<&str>) -> OdmResult<Connection> {
        match connection {
            Some(name) if name != self.name() => Err(OdmError::connection(
                name,
                format!("model is bound to `{name}` but was run on `{}`", self.name()),
            )),
            _ => Ok(self.clone()),
        }
    }
}

impl Executor for TransactionClient {
    fn connection_for(&self, connection: Option<&str>) -> OdmResult<Connection> {
        match connection {
            Some(name) if name != self.connection().name() => Err(OdmError::transaction(
                TransactionPhase::Use,
                format!(
                    "model is bound to `{name}` but the transaction runs on `{}`",
                    self.connection().name()
                ),
            )),
            _ => Ok(self.connection().clone()),
        }
    }

    fn transaction(&self) -> Option<&TransactionClient> {
        Some(self)
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn connection_for(&self, connection: Option<&str>) -> OdmResult<Connection> {
        (**self).connection_for(connection)
    }

    fn transaction(&self) -> Option<&TransactionClient> {
        (**self).transaction()
    }
}

/// Picks the connection and transaction an operation runs with: the
/// executor's transaction, then a transaction bound to the record or
/// builder, then the executor's own connection.
pub(crate) fn resolve<E: Executor + ?Sized>(
    executor: &E,
    connection: Option<&str>,
    bound: Option<&TransactionClient>,
) -> OdmResult<(Connection, Option<TransactionClient>)> {
    if let Some(trx) = executor.transaction().or(bound) {
        return Ok((trx.connection_for(connection)?, Some(trx.clone())));
    }
    Ok((executor.connection_for(connection)?, None))
}

/// The session of `transaction`, failing fast if it is no longer active.
pub(crate) fn session_of(transaction: Option<&TransactionClient>) -> OdmResult<Option<SessionId>> {
    transaction
        .map(TransactionClient::session)
        .transpose()
}
