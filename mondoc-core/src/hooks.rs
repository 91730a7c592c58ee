//! Lifecycle hooks run around model operations.
//!
//! Each operation kind runs its hooks in a fixed order:
//!
//! | operation | order |
//! |-----------|-------|
//! | create    | `before_save`, `before_create`, write, `after_create`, `after_save` |
//! | update    | `before_save`, `before_update`, write, `after_update`, `after_save` |
//! | delete    | `before_delete`, write, `after_delete` |
//! | find      | `before_find`, read, `after_find` |
//! | fetch     | `before_fetch`, read, `after_fetch` |
//!
//! Hooks registered for the same event run in registration order. A
//! before-hook returning [`HookFlow::Abort`] stops the pipeline before the
//! store is touched and the operation resolves as a successful no-op. A hook
//! returning an error stops the pipeline and the error propagates.

use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use tracing::warn;

use crate::{builder::QueryBuilder, error::OdmResult, record::Record};

/// The events hooks can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeSave,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    AfterSave,
    BeforeDelete,
    AfterDelete,
    BeforeFind,
    AfterFind,
    BeforeFetch,
    AfterFetch,
}

impl HookEvent {
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            HookEvent::BeforeSave
                | HookEvent::BeforeCreate
                | HookEvent::BeforeUpdate
                | HookEvent::BeforeDelete
                | HookEvent::BeforeFind
                | HookEvent::BeforeFetch
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookEvent::BeforeSave => "before_save",
            HookEvent::BeforeCreate => "before_create",
            HookEvent::AfterCreate => "after_create",
            HookEvent::BeforeUpdate => "before_update",
            HookEvent::AfterUpdate => "after_update",
            HookEvent::AfterSave => "after_save",
            HookEvent::BeforeDelete => "before_delete",
            HookEvent::AfterDelete => "after_delete",
            HookEvent::BeforeFind => "before_find",
            HookEvent::AfterFind => "after_find",
            HookEvent::BeforeFetch => "before_fetch",
            HookEvent::AfterFetch => "after_fetch",
        })
    }
}

/// What a hook tells the pipeline to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    /// Stop here. Only meaningful for before-hooks.
    Abort,
}

impl From<bool> for HookFlow {
    fn from(proceed: bool) -> Self {
        if proceed { HookFlow::Continue } else { HookFlow::Abort }
    }
}

/// A hook over one record.
pub type RecordHook<M> =
    Arc<dyn for<'a> Fn(&'a mut Record<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync>;

/// A hook over the query about to run.
pub type QueryHook<M> =
    Arc<dyn for<'a> Fn(&'a mut QueryBuilder<M>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync>;

/// A hook over a fetched batch.
pub type FetchHook<M> =
    Arc<dyn for<'a> Fn(&'a mut Vec<Record<M>>) -> BoxFuture<'a, OdmResult<HookFlow>> + Send + Sync>;

/// The hooks registered for one model.
pub struct Hooks<M> {
    record: HashMap<HookEvent, Vec<RecordHook<M>>>,
    query: HashMap<HookEvent, Vec<QueryHook<M>>>,
    fetch: Vec<FetchHook<M>>,
}

impl<M> Default for Hooks<M> {
    fn default() -> Self {
        Self {
            record: HashMap::new(),
            query: HashMap::new(),
            fetch: Vec::new(),
        }
    }
}

impl<M> fmt::Debug for Hooks<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events = self
            .record
            .iter()
            .map(|(event, hooks)| (event.to_string(), hooks.len()))
            .chain(
                self.query
                    .iter()
                    .map(|(event, hooks)| (event.to_string(), hooks.len())),
            )
            .collect::<Vec<_>>();
        if !self.fetch.is_empty() {
            events.push((HookEvent::AfterFetch.to_string(), self.fetch.len()));
        }
        events.sort();

        f.debug_struct("Hooks").field("events", &events).finish()
    }
}

impl<M> Hooks<M> {
    pub(crate) fn add_record(&mut self, event: HookEvent, hook: RecordHook<M>) {
        self.record.entry(event).or_default().push(hook);
    }

    pub(crate) fn add_query(&mut self, event: HookEvent, hook: QueryHook<M>) {
        self.query.entry(event).or_default().push(hook);
    }

    pub(crate) fn add_fetch(&mut self, hook: FetchHook<M>) {
        self.fetch.push(hook);
    }

    /// Number of hooks registered for `event`.
    pub fn count(&self, event: HookEvent) -> usize {
        match event {
            HookEvent::AfterFetch => self.fetch.len(),
            HookEvent::BeforeFind | HookEvent::BeforeFetch => self.query.get(&event).map_or(0, Vec::len),
            _ => self.record.get(&event).map_or(0, Vec::len),
        }
    }

    /// Runs the record hooks of `event` in registration order.
    pub async fn run_record(&self, event: HookEvent, record: &mut Record<M>) -> OdmResult<HookFlow> {
        for hook in self.record.get(&event).into_iter().flatten() {
            if hook(record).await? == HookFlow::Abort && event.is_before() {
                warn!(hook = %event, "hook aborted the operation");
                return Ok(HookFlow::Abort);
            }
        }
        Ok(HookFlow::Continue)
    }

    /// Runs the query hooks of `event` in registration order.
    pub async fn run_query(&self, event: HookEvent, builder: &mut QueryBuilder<M>) -> OdmResult<HookFlow> {
        for hook in self.query.get(&event).into_iter().flatten() {
            if hook(builder).await? == HookFlow::Abort && event.is_before() {
                warn!(hook = %event, "hook aborted the operation");
                return Ok(HookFlow::Abort);
            }
        }
        Ok(HookFlow::Continue)
    }

    /// Runs the `after_fetch` hooks.
    pub async fn run_fetch(&self, records: &mut Vec<Record<M>>) -> OdmResult<()> {
        for hook in &self.fetch {
            hook(records).await?;
        }
        Ok(())
    }
}
