//! PostgreSQL store. Every transaction runs at SERIALIZABLE so concurrent writers surface
//! as SQLSTATE 40001, which the retry controller understands.

use super::{Condition, Row, Selection, Store, StoreTx};
use crate::config::TableSpec;
use crate::error::{AppError, ConfigError};
use crate::sql::{self, PgBindValue, QueryBuf};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Transaction};

#[derive(Clone, Debug, PartialEq)]
pub struct PgStoreOptions {
    pub database_url: String,
    /// Schema the entity tables live in.
    pub schema: String,
    pub max_connections: u32,
}

impl PgStoreOptions {
    /// `DATABASE_URL` (required), `RELFORGE_PG_SCHEMA` (default `public`),
    /// `RELFORGE_PG_MAX_CONNECTIONS` (default 5).
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Load("DATABASE_URL is not set".into()))?;
        let schema = std::env::var("RELFORGE_PG_SCHEMA").unwrap_or_else(|_| "public".into());
        let max_connections = match std::env::var("RELFORGE_PG_MAX_CONNECTIONS") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::Load(format!("RELFORGE_PG_MAX_CONNECTIONS: not a number: {}", v)))?,
            Err(_) => 5,
        };
        Ok(PgStoreOptions {
            database_url,
            schema,
            max_connections,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        PgStore {
            pool,
            schema: schema.into(),
        }
    }

    pub async fn connect(opts: &PgStoreOptions) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .connect(&opts.database_url)
            .await?;
        Ok(Self::new(pool, opts.schema.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

impl PgTx {
    async fn fetch(&mut self, q: &QueryBuf) -> Result<Vec<Row>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from(p));
        }
        let rows = query.fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert(&mut self, table: &TableSpec, row: Row) -> Result<Row, AppError> {
        let q = sql::insert(&self.schema, table, &row);
        self.fetch(&q)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Store(format!("insert into {} returned no row", table.name)))
    }

    async fn update(&mut self, table: &TableSpec, conditions: &[Condition], changes: Row) -> Result<Vec<Row>, AppError> {
        let q = sql::update(&self.schema, table, conditions, &changes);
        self.fetch(&q).await
    }

    async fn delete(&mut self, table: &TableSpec, conditions: &[Condition]) -> Result<Vec<Row>, AppError> {
        let q = sql::delete(&self.schema, table, conditions);
        self.fetch(&q).await
    }

    async fn select(&mut self, table: &TableSpec, selection: &Selection) -> Result<Vec<Row>, AppError> {
        let q = sql::select(&self.schema, table, selection);
        self.fetch(&q).await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn row_to_map(row: &PgRow) -> Row {
    use sqlx::Column;
    use sqlx::Row as _;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
