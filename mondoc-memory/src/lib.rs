//! In-memory document storage backend for mondoc.
//!
//! This crate provides a thread-safe, in-memory implementation of the
//! `StoreBackend` trait. It evaluates filters with the same evaluator the
//! embedded sub-builder uses and supports transactions through snapshot
//! sessions, which makes it the store of choice for development and tests.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Full query support** - Filtering, sorting, pagination, projection, grouping and embedded filters
//! - **Transactions** - Snapshot-isolated sessions committed atomically
//!
//! # Quick Start
//!
//! ```ignore
//! use mondoc::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> OdmResult<()> {
//!     let db = Database::builder()
//!         .connection("main", InMemoryStore::new())
//!         .build()?;
//!
//!     let users = User::query().where_eq("active", true).fetch(&db).await?;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as mondoc_memory;

pub mod apply;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
