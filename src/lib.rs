//! relforge: compile a declarative entity model into a relational schema and run hooked,
//! transactional CRUD and many-to-many operations against it.

pub mod case;
pub mod config;
pub mod error;
pub mod migration;
pub mod service;
pub mod sql;
pub mod state;
pub mod store;

pub use case::{DefaultNaming, NamingStrategy};
pub use config::{
    load_sources, resolve, resolve_with, validate, validate_with, ModelDocument, ResolvedEntity, ResolvedSchema,
};
pub use error::{AppError, ConfigError, Diagnostic, Diagnostics};
pub use migration::{plan_migrations, MigrationPlan, MigrationStep};
pub use service::{
    run_in_transaction, AfterHookDispatch, HookContext, HookOutcome, HookPipeline, HookRegistry, JunctionManager,
    TransactionOptions, UnitOfWork,
};
pub use state::Runtime;
pub use store::{MemoryStore, PgStore, PgStoreOptions, Row, Store, StoreTx};
