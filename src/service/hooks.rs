//! Lifecycle hooks. Every (entity, verb) pair has one optional slot per stage; an empty slot
//! is a no-op. Junction hooks are registered under the junction's `through` identifier.

use crate::error::AppError;
use crate::service::retry::UnitOfWork;
use crate::store::Row;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied key/value bag threaded through every stage of one operation.
/// Hooks read it; only a patch returned in a [`HookOutcome`] changes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HookContext(Map<String, Value>);

impl HookContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn merge(&mut self, patch: Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k, v);
        }
    }
}

impl From<Map<String, Value>> for HookContext {
    fn from(m: Map<String, Value>) -> Self {
        HookContext(m)
    }
}

/// What a pre or post hook hands back: optionally a replacement value and a context patch.
#[derive(Clone, Debug, PartialEq)]
pub struct HookOutcome<T> {
    pub replace: Option<T>,
    pub context: Option<Map<String, Value>>,
}

impl<T> HookOutcome<T> {
    /// Leave the value and context untouched.
    pub fn keep() -> Self {
        HookOutcome {
            replace: None,
            context: None,
        }
    }

    pub fn replace(value: T) -> Self {
        HookOutcome {
            replace: Some(value),
            context: None,
        }
    }

    pub fn with_context(mut self, patch: Map<String, Value>) -> Self {
        self.context = Some(patch);
        self
    }
}

impl<T> Default for HookOutcome<T> {
    fn default() -> Self {
        Self::keep()
    }
}

/// Runs inside the transaction before the operation. May rewrite the input, which is then
/// validated again against the same rules as the original.
#[async_trait]
pub trait PreHook<I>: Send + Sync {
    async fn call(&self, input: &I, ctx: &HookContext, uow: &mut UnitOfWork) -> Result<HookOutcome<I>, AppError>;
}

/// Runs inside the transaction after the operation. May rewrite the result.
#[async_trait]
pub trait PostHook<I, O>: Send + Sync {
    async fn call(&self, input: &I, output: &O, ctx: &HookContext, uow: &mut UnitOfWork) -> Result<HookOutcome<O>, AppError>;
}

/// Runs after commit, outside any transaction. Errors are logged and dropped.
#[async_trait]
pub trait AfterHook<I, O>: Send + Sync {
    async fn call(&self, input: &I, output: &O, ctx: &HookContext) -> Result<(), AppError>;
}

pub struct VerbHooks<I, O> {
    pub pre: Option<Arc<dyn PreHook<I>>>,
    pub post: Option<Arc<dyn PostHook<I, O>>>,
    pub after: Option<Arc<dyn AfterHook<I, O>>>,
}

impl<I, O> Default for VerbHooks<I, O> {
    fn default() -> Self {
        VerbHooks {
            pre: None,
            post: None,
            after: None,
        }
    }
}

impl<I, O> Clone for VerbHooks<I, O> {
    fn clone(&self) -> Self {
        VerbHooks {
            pre: self.pre.clone(),
            post: self.post.clone(),
            after: self.after.clone(),
        }
    }
}

impl<I, O> fmt::Debug for VerbHooks<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbHooks")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

impl<I, O> VerbHooks<I, O> {
    pub fn pre(&mut self, hook: impl PreHook<I> + 'static) -> &mut Self {
        self.pre = Some(Arc::new(hook));
        self
    }

    pub fn post(&mut self, hook: impl PostHook<I, O> + 'static) -> &mut Self {
        self.post = Some(Arc::new(hook));
        self
    }

    pub fn after(&mut self, hook: impl AfterHook<I, O> + 'static) -> &mut Self {
        self.after = Some(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.post.is_none() && self.after.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateInput {
    pub id: Value,
    pub data: Row,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteInput {
    pub id: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOneInput {
    pub id: Value,
    /// Relationship names to load alongside the row.
    pub include: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListQuery {
    /// Exact-match filters by column (camelCase keys accepted).
    pub filters: Row,
    pub include: Vec<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One junction row in canonical orientation: `source_id` always belongs to the entity that
/// first declared the `through`, whichever side the call came from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JunctionLink {
    pub source_id: Value,
    pub target_id: Value,
    /// Payload columns.
    pub extra: Row,
}

#[derive(Clone, Debug, Default)]
pub struct EntityHooks {
    pub create: VerbHooks<Row, Row>,
    pub update: VerbHooks<UpdateInput, Row>,
    pub delete: VerbHooks<DeleteInput, Row>,
    pub find_one: VerbHooks<FindOneInput, Row>,
    pub find_many: VerbHooks<ListQuery, Vec<Row>>,
}

impl EntityHooks {
    fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.update.is_empty()
            && self.delete.is_empty()
            && self.find_one.is_empty()
            && self.find_many.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct JunctionHooks {
    pub add: VerbHooks<JunctionLink, Row>,
    pub remove: VerbHooks<JunctionLink, Row>,
}

/// All registered hooks, by entity name and by junction `through`.
#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    entities: HashMap<String, EntityHooks>,
    junctions: HashMap<String, JunctionHooks>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_mut(&mut self, name: &str) -> &mut EntityHooks {
        self.entities.entry(name.to_string()).or_default()
    }

    pub fn junction_mut(&mut self, through: &str) -> &mut JunctionHooks {
        self.junctions.entry(through.to_string()).or_default()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityHooks> {
        self.entities.get(name)
    }

    pub fn junction(&self, through: &str) -> Option<&JunctionHooks> {
        self.junctions.get(through)
    }

    /// Entity names and `through` identifiers with hooks that match nothing in `known`.
    pub(crate) fn unmatched<'a>(
        &'a self,
        entity_known: impl Fn(&str) -> bool + 'a,
        junction_known: impl Fn(&str) -> bool + 'a,
    ) -> Vec<&'a str> {
        let mut out: Vec<&str> = self
            .entities
            .iter()
            .filter(|(name, hooks)| !hooks.is_empty() && !entity_known(name))
            .map(|(name, _)| name.as_str())
            .chain(
                self.junctions
                    .keys()
                    .filter(|t| !junction_known(t))
                    .map(|t| t.as_str()),
            )
            .collect();
        out.sort_unstable();
        out
    }
}
