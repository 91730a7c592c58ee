//! Multi-statement transactions bound to one backend session.
//!
//! A [`TransactionClient`] wraps exactly one session and moves through
//! `Active -> Committed` or `Active -> Aborted`. Both end states are terminal:
//! every operation routed through a terminal client fails fast with
//! [`OdmError::Transaction`] in the [`TransactionPhase::Use`] phase.
//!
//! Two forms are offered:
//!
//! - the managed form, [`Connection::transaction`](crate::connection::Connection::transaction)
//!   or [`Database::transaction`](crate::connection::Database::transaction),
//!   which commits when the callback returns `Ok` and rolls back when it
//!   returns `Err`, handing the original error back to the caller;
//! - the manual form, `begin_transaction()`, where the caller commits or rolls
//!   back explicitly.
//!
//! The client implements [`Executor`](crate::connection::Executor), so it can
//! be passed wherever a database or connection is accepted; every operation
//! issued through it carries its session.
//!
//! # Example
//!
//! ```ignore
//! let total = db
//!     .transaction(|trx| async move {
//!         let mut order = Order::create(&trx, order).await?;
//!         Stock::query().where_eq("sku", "a-1").update(doc! { "reserved": true }).await?;
//!         order.status = "reserved".into();
//!         order.save(&trx).await?;
//!         Ok(order.total)
//!     })
//!     .await?;
//! ```
//!
//! Retrying is left to the caller; [`OdmError::is_transient`] and
//! [`OdmError::is_unknown_commit_result`] tell whether it is worth it.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tracing::{info, warn};

use crate::{
    backend::SessionId,
    collection::RawCollection,
    connection::Connection,
    error::{OdmError, OdmResult, TransactionPhase},
};

/// Lifecycle state of a [`TransactionClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Active,
            1 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Active => 0,
            TransactionState::Committed => 1,
            TransactionState::Aborted => 2,
        }
    }
}

#[derive(Debug)]
struct TransactionInner {
    id: SessionId,
    connection: Connection,
    state: AtomicU8,
}

/// Handle on one open transaction. Clones share the same session and state.
#[derive(Debug, Clone)]
pub struct TransactionClient {
    inner: Arc<TransactionInner>,
}

impl TransactionClient {
    /// Starts a transaction on `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Transaction`] in the [`TransactionPhase::Begin`]
    /// phase, wrapping the store error.
    pub async fn begin(connection: &Connection) -> OdmResult<Self> {
        let id = connection
            .backend()
            .start_transaction()
            .await
            .map_err(|e| OdmError::transaction_caused_by(TransactionPhase::Begin, e))?;

        info!(connection = connection.name(), session = %id, "transaction started");

        Ok(Self {
            inner: Arc::new(TransactionInner {
                id,
                connection: connection.clone(),
                state: AtomicU8::new(TransactionState::Active.as_u8()),
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The connection this transaction runs on.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns the session every operation of this transaction must carry.
    ///
    /// # Errors
    ///
    /// Fails with [`TransactionPhase::Use`] once the transaction has been
    /// committed or rolled back.
    pub fn session(&self) -> OdmResult<SessionId> {
        match self.state() {
            TransactionState::Active => Ok(self.inner.id),
            state => Err(OdmError::transaction(
                TransactionPhase::Use,
                format!("transaction {} is already {}", self.inner.id, state_name(state)),
            )),
        }
    }

    /// A raw collection whose operations run inside this transaction.
    pub fn collection(&self, name: &str) -> RawCollection {
        RawCollection::new(name, self.inner.connection.clone(), Some(self.clone()))
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Fails with [`TransactionPhase::Commit`] if the client is not active or
    /// the store rejects the commit. A rejected commit leaves the client
    /// active so the caller may retry it or roll back.
    pub async fn commit(&self) -> OdmResult<()> {
        self.ensure_active(TransactionPhase::Commit)?;

        self.inner
            .connection
            .backend()
            .commit_transaction(&self.inner.id)
            .await
            .map_err(|e| OdmError::transaction_caused_by(TransactionPhase::Commit, e))?;

        self.inner
            .state
            .store(TransactionState::Committed.as_u8(), Ordering::Release);
        info!(connection = self.inner.connection.name(), session = %self.inner.id, "transaction committed");
        Ok(())
    }

    /// Rolls the transaction back, discarding its writes.
    ///
    /// # Errors
    ///
    /// Fails with [`TransactionPhase::Rollback`] if the client is not active or
    /// the store rejects the abort.
    pub async fn rollback(&self) -> OdmResult<()> {
        self.ensure_active(TransactionPhase::Rollback)?;

        self.inner
            .connection
            .backend()
            .abort_transaction(&self.inner.id)
            .await
            .map_err(|e| OdmError::transaction_caused_by(TransactionPhase::Rollback, e))?;

        self.inner
            .state
            .store(TransactionState::Aborted.as_u8(), Ordering::Release);
        info!(connection = self.inner.connection.name(), session = %self.inner.id, "transaction rolled back");
        Ok(())
    }

    fn ensure_active(&self, phase: TransactionPhase) -> OdmResult<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(OdmError::transaction(
                phase,
                format!("transaction {} is already {}", self.inner.id, state_name(state)),
            )),
        }
    }
}

fn state_name(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Active => "active",
        TransactionState::Committed => "committed",
        TransactionState::Aborted => "aborted",
    }
}

/// Runs `callback` inside a new transaction on `connection`.
///
/// Commits when the callback returns `Ok` and the client is still active.
/// When the callback returns `Err`, the transaction is rolled back and the
/// original error is returned; if the rollback itself fails, a
/// [`TransactionPhase::Rollback`] error is returned whose source is the
/// original error.
pub(crate) async fn run_managed<F, Fut, T>(connection: &Connection, callback: F) -> OdmResult<T>
where
    F: FnOnce(TransactionClient) -> Fut,
    Fut: Future<Output = OdmResult<T>>,
{
    let client = TransactionClient::begin(connection).await?;

    match callback(client.clone()).await {
        Ok(value) => {
            if client.is_active() {
                client.commit().await?;
            }
            Ok(value)
        }
        Err(error) => {
            if !client.is_active() {
                return Err(error);
            }

            warn!(
                connection = connection.name(),
                session = %client.id(),
                error = %error,
                "rolling back transaction after error"
            );

            match client.rollback().await {
                Ok(()) => Err(error),
                Err(rollback_error) => Err(OdmError::Transaction {
                    phase: TransactionPhase::Rollback,
                    message: rollback_error.to_string(),
                    source: Some(Box::new(error)),
                }),
            }
        }
    }
}
