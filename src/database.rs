//! Connection gateway.
//!
//! Every call acquires one pooled connection and gives it back when the call
//! returns, whatever the outcome. Values only ever reach PostgreSQL as bound
//! parameters of a [`Statement`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Decode, FromRow, PgExecutor, PgPool, Postgres, Row, Transaction, Type};

use crate::config::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_SIZE, Postgres as PostgresConfig,
};
use crate::error::Result;

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    NullableText(Option<String>),
    BigInt(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    NullableTimestamp(Option<DateTime<Utc>>),
    TextArray(Vec<String>),
    BigIntArray(Vec<i64>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        Self::NullableText(value)
    }
}

impl From<Option<&str>> for Value {
    fn from(value: Option<&str>) -> Self {
        Self::NullableText(value.map(str::to_owned))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::BigInt(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Option<DateTime<Utc>>> for Value {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        Self::NullableTimestamp(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<Vec<i64>> for Value {
    fn from(value: Vec<i64>) -> Self {
        Self::BigIntArray(value)
    }
}

/// SQL text with its positional parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone)]
pub struct Statement {
    sql: &'static str,
    params: Vec<Value>,
}

impl Statement {
    /// Create a new [`Statement`].
    pub fn new(sql: &'static str) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    fn prepare(&self) -> Query<'_, Postgres, PgArguments> {
        tracing::trace!(sql = self.sql, params = self.params.len(), "executing statement");

        self.params
            .iter()
            .fold(sqlx::query(self.sql), |query, value| match value {
                Value::Text(v) => query.bind(v.as_str()),
                Value::NullableText(v) => query.bind(v.as_deref()),
                Value::BigInt(v) => query.bind(*v),
                Value::Bool(v) => query.bind(*v),
                Value::Timestamp(v) => query.bind(*v),
                Value::NullableTimestamp(v) => query.bind(*v),
                Value::TextArray(v) => query.bind(v.as_slice()),
                Value::BigIntArray(v) => query.bind(v.as_slice()),
            })
    }
}

async fn fetch_scalar<'c, E, T>(executor: E, stmt: &Statement) -> Result<Option<T>>
where
    E: PgExecutor<'c>,
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    match stmt.prepare().fetch_optional(executor).await? {
        Some(row) => Ok(Some(row.try_get(0)?)),
        None => Ok(None),
    }
}

async fn fetch_rows<'c, E>(executor: E, stmt: &Statement) -> Result<Vec<PgRow>>
where
    E: PgExecutor<'c>,
{
    Ok(stmt.prepare().fetch_all(executor).await?)
}

fn map_rows<T>(rows: Vec<PgRow>) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    Ok(rows
        .iter()
        .map(|row| T::from_row(row))
        .collect::<std::result::Result<Vec<_>, _>>()?)
}

async fn execute<'c, E>(executor: E, stmt: &Statement) -> Result<u64>
where
    E: PgExecutor<'c>,
{
    Ok(stmt.prepare().execute(executor).await?.rows_affected())
}

/// Pooled PostgreSQL access.
#[derive(Clone, Debug)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let postgres = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .acquire_timeout(Duration::from_secs(
                config
                    .acquire_timeout_secs
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            ))
            .connect(&url)
            .await?;

        tracing::info!(address = %config.address, "postgres connected");

        Ok(Self { postgres })
    }

    /// Wrap an existing pool.
    pub fn from_pool(postgres: PgPool) -> Self {
        Self { postgres }
    }

    /// Create or upgrade the schema.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!().run(&self.postgres).await?;
        Ok(())
    }

    /// First column of the first row, `None` when no row matches.
    pub async fn scalar<T>(&self, stmt: Statement) -> Result<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    {
        let mut conn = self.postgres.acquire().await?;
        fetch_scalar(&mut *conn, &stmt).await
    }

    /// Every row matching `stmt`.
    pub async fn query(&self, stmt: Statement) -> Result<Vec<PgRow>> {
        let mut conn = self.postgres.acquire().await?;
        fetch_rows(&mut *conn, &stmt).await
    }

    /// Every row matching `stmt`, mapped onto `T`.
    pub async fn query_as<T>(&self, stmt: Statement) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        map_rows(self.query(stmt).await?)
    }

    /// Execute `stmt` and return the number of affected rows.
    pub async fn non_query(&self, stmt: Statement) -> Result<u64> {
        let mut conn = self.postgres.acquire().await?;
        execute(&mut *conn, &stmt).await
    }

    /// Open a transaction on a dedicated connection.
    pub async fn begin(&self) -> Result<Batch> {
        Ok(Batch {
            tx: self.postgres.begin().await?,
        })
    }
}

/// Statements sharing one transaction.
///
/// Dropping a [`Batch`] without [`Batch::commit`] rolls it back.
pub struct Batch {
    tx: Transaction<'static, Postgres>,
}

impl Batch {
    pub async fn scalar<T>(&mut self, stmt: Statement) -> Result<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    {
        fetch_scalar(&mut *self.tx, &stmt).await
    }

    pub async fn query(&mut self, stmt: Statement) -> Result<Vec<PgRow>> {
        fetch_rows(&mut *self.tx, &stmt).await
    }

    pub async fn query_as<T>(&mut self, stmt: Statement) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        map_rows(self.query(stmt).await?)
    }

    pub async fn non_query(&mut self, stmt: Statement) -> Result<u64> {
        execute(&mut *self.tx, &stmt).await
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
