//! Runtime services: validation, row operations, lifecycle hooks, junction links and the
//! transactional retry loop they all run under.

mod crud;
pub mod hooks;
mod junction;
mod pipeline;
pub mod retry;
mod validation;

pub use crud::CrudService;
pub use hooks::{
    AfterHook, DeleteInput, EntityHooks, FindOneInput, HookContext, HookOutcome, HookRegistry, JunctionHooks,
    JunctionLink, ListQuery, PostHook, PreHook, UpdateInput, VerbHooks,
};
pub use junction::JunctionManager;
pub use pipeline::HookPipeline;
pub use retry::{dispatch_after, run_in_transaction, AfterHookDispatch, AfterJob, TransactionOptions, UnitOfWork};
pub use validation::{RequestValidator, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
