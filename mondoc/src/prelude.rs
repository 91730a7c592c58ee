//! Convenient re-exports of commonly used types from mondoc.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use mondoc::prelude::*;
//! ```
//!
//! This provides access to:
//! - The `Model` derive, model traits and records
//! - Query builders, filters and pagination
//! - Schemas, validation rules, relations and hooks
//! - Connections, transactions and raw collections
//! - Error types and the BSON/serde names models are written with

pub use mondoc_core::{
    backend::{DynStoreBackend, SessionId, StoreBackend, StoreBackendBuilder},
    builder::QueryBuilder,
    collection::RawCollection,
    conditions::{Condition, ConditionGroup, Connector, FilterDsl},
    config::{ConnectionConfig, Driver, OdmConfig},
    connection::{Connection, Database, DatabaseBuilder, Executor},
    embedded::{AggregateStats, EmbeddedDoc, EmbeddedField, EmbeddedQuery, EmbeddedRef},
    error::{ErrorKind, OdmError, OdmResult, TransactionPhase},
    hooks::{HookEvent, HookFlow},
    model::{Model, ModelExt},
    page::{Page, PageMeta, PaginationParams},
    query::{Expr, Filter, FieldOp, Query, Sort, SortDirection, Update},
    record::{DeleteOutcome, Record, SaveOutcome},
    relations::RelationLoad,
    schema::{Cardinality, FieldDef, RelationDef, RelationKind, Rule, Schema, SchemaBuilder},
    serialize::SerializeOptions,
    transaction::{TransactionClient, TransactionState},
};
pub use mondoc_macros::Model;

pub use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
pub use serde::{Deserialize, Serialize};
