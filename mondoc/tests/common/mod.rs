#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use mondoc::{
    async_trait,
    backend::{SessionId, StoreBackend},
    memory::InMemoryStore,
    prelude::*,
    query::{GroupSpec, UpdateOutcome},
};

/// Wraps the in-memory store and counts the calls that reach it.
#[derive(Debug, Clone, Default)]
pub struct CountingStore {
    inner: InMemoryStore,
    finds: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    fail_abort: Arc<AtomicBool>,
    fail_insert: Arc<AtomicBool>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following abort fail.
    pub fn fail_aborts(&self) {
        self.fail_abort.store(true, Ordering::SeqCst);
    }

    /// Makes inserts fail until [`CountingStore::allow_inserts`].
    pub fn fail_inserts(&self) {
        self.fail_insert.store(true, Ordering::SeqCst);
    }

    pub fn allow_inserts(&self) {
        self.fail_insert.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreBackend for CountingStore {
    async fn find_documents(&self, collection: &str, query: &Query, session: Option<&SessionId>) -> OdmResult<Vec<Document>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        StoreBackend::find_documents(&self.inner, collection, query, session)
            .await
    }

    async fn count_documents(&self, collection: &str, filter: Option<&Expr>, session: Option<&SessionId>) -> OdmResult<u64> {
        StoreBackend::count_documents(&self.inner, collection, filter, session)
            .await
    }

    async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Expr>,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Bson>> {
        StoreBackend::distinct_values(&self.inner, collection, field, filter, session)
            .await
    }

    async fn group_documents(
        &self,
        collection: &str,
        query: &Query,
        group: &GroupSpec,
        session: Option<&SessionId>,
    ) -> OdmResult<Vec<Document>> {
        StoreBackend::group_documents(&self.inner, collection, query, group, session)
            .await
    }

    async fn insert_documents(&self, collection: &str, documents: Vec<Document>, session: Option<&SessionId>) -> OdmResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(OdmError::operation("insert", "not primary"));
        }
        StoreBackend::insert_documents(&self.inner, collection, documents, session)
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
        self.writes.fetch_add(1, Ordering::SeqCst);
        StoreBackend::update_documents(&self.inner, collection, filter, update, multi, session)
            .await
    }

    async fn delete_documents(&self, collection: &str, filter: Option<&Expr>, multi: bool, session: Option<&SessionId>) -> OdmResult<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        StoreBackend::delete_documents(&self.inner, collection, filter, multi, session)
            .await
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        StoreBackend::start_transaction(&self.inner).await
    }

    async fn commit_transaction(&self, session: &SessionId) -> OdmResult<()> {
        StoreBackend::commit_transaction(&self.inner, session).await
    }

    async fn abort_transaction(&self, session: &SessionId) -> OdmResult<()> {
        if self.fail_abort.load(Ordering::SeqCst) {
            return Err(OdmError::operation("abortTransaction", "connection reset"));
        }
        StoreBackend::abort_transaction(&self.inner, session).await
    }

    async fn create_collection(&self, name: &str) -> OdmResult<()> {
        StoreBackend::create_collection(&self.inner, name).await
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        StoreBackend::drop_collection(&self.inner, name).await
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        StoreBackend::list_collections(&self.inner).await
    }
}

/// A database with one counting connection named `main`.
pub fn database() -> (Database, CountingStore) {
    let store = CountingStore::new();
    let db = Database::single(Connection::new("main", store.clone()));
    (db, store)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Model)]
#[mondoc(collection = "people", configure = "person_schema")]
pub struct Person {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub age: i32,
    #[mondoc(hidden)]
    #[serde(default)]
    pub password: String,
}

fn person_schema(builder: SchemaBuilder<Person>) -> SchemaBuilder<Person> {
    builder
        .rule("age", Rule::range(18, 120))
        .before_save(|record| Box::pin(async move { Ok(HookFlow::from(record.name != "blocked")) }))
}

impl Person {
    pub fn new(name: &str, age: i32) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
#[mondoc(collection = "authors", configure = "author_schema")]
pub struct Author {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
}

fn author_schema(builder: SchemaBuilder<Author>) -> SchemaBuilder<Author> {
    builder.relation(RelationDef::has_many::<Post>("posts"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
#[mondoc(collection = "posts", configure = "post_schema")]
pub struct Post {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub author_id: ObjectId,
    pub title: String,
}

fn post_schema(builder: SchemaBuilder<Post>) -> SchemaBuilder<Post> {
    builder.relation(RelationDef::belongs_to::<Author>("author"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub zip: String,
    pub floor: i32,
}

impl Address {
    pub fn new(city: &str, zip: &str, floor: i32) -> Self {
        Self {
            city: city.to_string(),
            zip: zip.to_string(),
            floor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Model)]
#[mondoc(collection = "customers")]
pub struct Customer {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    #[mondoc(embedded)]
    #[serde(default)]
    pub addresses: Vec<Address>,
}

/// The same shape as [`Address`], stored in its own collection.
#[derive(Debug, Clone, Serialize, Deserialize, Model)]
#[mondoc(collection = "addresses")]
pub struct StoredAddress {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub city: String,
    pub zip: String,
    pub floor: i32,
}

pub fn addresses() -> Vec<Address> {
    vec![
        Address::new("Oslo", "0150", 3),
        Address::new("Bergen", "5003", 1),
        Address::new("Oslo", "0182", 7),
        Address::new("Trondheim", "7010", 2),
    ]
}
