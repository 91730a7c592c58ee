//! A typed object-document mapper for MongoDB-style document stores.
//!
//! This crate is the primary entry point for users of mondoc. It re-exports
//! the core types from the sub-crates, the `Model` derive and the storage
//! backends, and builds connection registries from configuration.
//!
//! # Features
//!
//! - **Typed models** - Plain serde structs with a derived schema, dirty tracking and lifecycle hooks
//! - **Fluent queries** - Filters in two operator alphabets, grouping, pagination and batched relation loads
//! - **Embedded documents** - The same filter surface over embedded arrays, plus element-level writes
//! - **Transactions** - Managed and manual transactions threaded through models, queries and raw collections
//! - **Multiple backends** - An in-memory store for development and tests, MongoDB for production
//!
//! # Quick Start
//!
//! ```ignore
//! use mondoc::{prelude::*, memory::InMemoryStore};
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
//! #[tokio::main]
//! async fn main() -> OdmResult<()> {
//!     let db = Database::builder()
//!         .connection("main", InMemoryStore::new())
//!         .build()?;
//!
//!     let mut ada = User::create(&db, User { id: None, name: "Ada".into(), age: 36 }).await?;
//!     ada.age = 37;
//!     ada.save(&db).await?;
//!
//!     let adults = User::query()
//!         .where_op("age", ">=", 18)
//!         .order_by("name", "asc")
//!         .paginate(&db, 1, 20)
//!         .await?;
//!
//!     println!("{} adults", adults.meta.total);
//!     db.shutdown().await
//! }
//! ```
//!
//! # Transactions
//!
//! ```ignore
//! db.transaction(|trx| async move {
//!     let mut order = Order::find_or_fail(&trx, order_id).await?;
//!     order.status = "paid".into();
//!     order.save(&trx).await?;
//!
//!     Invoice::create(&trx, Invoice::for_order(&order)).await?;
//!     Ok(())
//! })
//! .await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - `mongodb` - Persistent MongoDB backend (requires the `mongodb` feature)

pub mod prelude;

use tracing::info;

pub use mondoc_core::{
    backend, builder, collection, compile, conditions, config, connection, embedded, error, evaluator, hooks, model,
    page, path, query, record, relations, schema, serialize, transaction,
};
pub use mondoc_macros::Model;

// Re-export the value crates models are written against
pub use bson;
pub use serde_json;

/// Attribute macro for implementing [`backend::StoreBackend`] on custom stores.
pub use async_trait::async_trait;

use mondoc_core::{
    config::{ConnectionConfig, Driver, OdmConfig},
    connection::{Connection, Database},
    error::OdmResult,
};

/// In-memory storage backend implementations.
pub mod memory {
    pub use mondoc_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use mondoc_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}

/// Builds a [`Database`] with one connection per configured entry.
///
/// In-memory connections are created empty. MongoDB connections need the
/// `mongodb` feature; the driver connects lazily, so an unreachable server
/// surfaces on first use.
///
/// # Errors
///
/// Returns [`OdmError::Connection`](error::OdmError::Connection) if the default connection is not
/// configured, a MongoDB entry has no address, or a MongoDB connection is
/// configured without the `mongodb` feature.
///
/// ```ignore
/// let config = OdmConfig::new("main")
///     .with_connection("main", ConnectionConfig::memory("app"));
/// let db = mondoc::connect(&config).await?;
/// ```
pub async fn connect(config: &OdmConfig) -> OdmResult<Database> {
    config.validate()?;

    let mut builder = Database::builder().default_connection(config.default.clone());
    for (name, connection) in &config.connections {
        info!(connection = %name, driver = ?connection.driver, database = %connection.database, "registering connection");
        builder = builder.with_connection(open(name, connection).await?);
    }

    builder.build()
}

async fn open(name: &str, config: &ConnectionConfig) -> OdmResult<Connection> {
    match config.driver {
        Driver::Memory => Ok(Connection::new(name, memory::InMemoryStore::new())),
        #[cfg(feature = "mongodb")]
        Driver::Mongodb => {
            use mondoc_core::backend::StoreBackendBuilder;

            let store = mongodb::MongoDbStoreBuilder::from_config(name, config)?
                .build()
                .await?;
            Ok(Connection::new(name, store))
        }
        #[cfg(not(feature = "mongodb"))]
        Driver::Mongodb => Err(mondoc_core::error::OdmError::connection(
            name,
            "MongoDB connections need the `mongodb` feature",
        )),
    }
}
