//! MongoDB backend implementation for mondoc.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend`
//! trait on top of the official async driver. Filters, updates and
//! aggregations are compiled by `mondoc_core::compile`; this crate only
//! dispatches them and maps driver errors.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! mondoc = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to MongoDB Atlas or self-hosted MongoDB
//! - **Native queries** - Filters, projections, grouping and embedded filters run server-side
//! - **Transactions** - Each transaction owns one driver session (replica set or sharded cluster required)
//! - **Error labels** - Driver labels such as `TransientTransactionError` are preserved
//!
//! # Example
//!
//! ```ignore
//! use mondoc::{backend::StoreBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017/?replicaSet=rs0", "my_database")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as mondoc_mongodb;

pub mod error;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
