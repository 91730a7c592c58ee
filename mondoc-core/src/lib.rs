//! A typed object-document mapper for MongoDB-style document stores.
//!
//! This crate is the core of the mondoc project and provides:
//!
//! - **Models and records** ([`model`], [`record`]) - The model trait, static entry points and dirty tracking
//! - **Schemas** ([`schema`]) - Field mapping, validation rules, embedded fields, relations and hooks
//! - **Query builder** ([`builder`], [`conditions`]) - Fluent filters, ordering, paging, grouping and loads
//! - **Query model and compiler** ([`query`], [`compile`], [`evaluator`]) - Store-independent queries, their native filter form and an in-memory evaluator
//! - **Embedded documents** ([`embedded`]) - In-memory queries and element-level writes on embedded arrays
//! - **Relations** ([`relations`]) - Batched loading of related records
//! - **Connections and transactions** ([`connection`], [`transaction`]) - The connection registry and session coordination
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing different storage backends
//! - **Error handling** ([`error`]) - Error kinds, labels and result types
//!
//! # Example
//!
//! ```ignore
//! use mondoc::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Model)]
//! #[mondoc(collection = "users")]
//! pub struct User {
//!     #[mondoc(primary)]
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<ObjectId>,
//!     pub name: String,
//! }
//!
//! let db = Database::builder()
//!     .connection("main", InMemoryStore::new())
//!     .build()?;
//!
//! let ada = User::create(&db, User { id: None, name: "Ada".into() }).await?;
//! let found = User::query().where_eq("name", "Ada").first_or_fail(&db).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as mondoc_core;

pub mod backend;
pub mod builder;
pub mod collection;
pub mod compile;
pub mod conditions;
pub mod config;
pub mod connection;
pub mod embedded;
pub mod error;
pub mod evaluator;
pub mod hooks;
pub mod model;
pub mod page;
pub mod path;
pub mod query;
pub mod record;
pub mod relations;
pub mod schema;
pub mod serialize;
pub mod transaction;
