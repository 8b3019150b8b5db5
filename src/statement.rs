//! Statement wrapper around an open Postgres transaction
//!
//! Every statement is logged. When a plan cost budget is configured, and the
//! context has not switched the check off, the statement is first run through
//! `EXPLAIN (FORMAT JSON)` on the same transaction and refused if the planner
//! estimate is over budget. Without a budget there is no extra round-trip.
//!
//! ```ignore
//! transactor
//!     .transact(&ctx, |ctx, tx| Box::pin(async move {
//!         let row = tx
//!             .fetch_one(&ctx, "SELECT balance FROM accounts WHERE id = $1", &[id.into()])
//!             .await?;
//!         Ok(row.try_get::<i64, _>("balance")?)
//!     }))
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, Postgres, Row, Transaction};

use crate::constants::LOG_TARGET;
use crate::context::TxContext;
use crate::error::{Error, Result};
use crate::plan;

/// A bound statement argument. Kept as a value so it can be logged.
#[derive(Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    IntArray(Vec<i64>),
}

impl Arg {
    fn bind<'q>(
        &'q self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Arg::Bool(v) => query.bind(*v),
            Arg::Int(v) => query.bind(*v),
            Arg::Float(v) => query.bind(*v),
            Arg::Text(v) => query.bind(v.as_str()),
            Arg::Json(v) => query.bind(sqlx::types::Json(v)),
            Arg::Timestamp(v) => query.bind(*v),
            Arg::Bytes(v) => query.bind(v.as_slice()),
            Arg::IntArray(v) => query.bind(v.as_slice()),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Bool(v) => write!(f, "{v}"),
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Float(v) => write!(f, "{v}"),
            Arg::Text(v) => write!(f, "{v:?}"),
            Arg::Json(v) => write!(f, "{v}"),
            Arg::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Arg::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Arg::IntArray(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v.into())
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(v: serde_json::Value) -> Self {
        Arg::Json(v)
    }
}

impl From<DateTime<Utc>> for Arg {
    fn from(v: DateTime<Utc>) -> Self {
        Arg::Timestamp(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(v)
    }
}

impl From<Vec<i64>> for Arg {
    fn from(v: Vec<i64>) -> Self {
        Arg::IntArray(v)
    }
}

impl From<&[i64]> for Arg {
    fn from(v: &[i64]) -> Self {
        Arg::IntArray(v.to_vec())
    }
}

fn build<'q>(sql: &'q str, args: &'q [Arg]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), |query, arg| arg.bind(query))
}

/// How statements run through a [`PgTx`] are logged and checked
#[derive(Debug, Clone, Copy)]
pub struct StatementConfig {
    /// `None` disables the EXPLAIN check entirely
    pub max_plan_cost: Option<f64>,
    pub log_level: log::Level,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            max_plan_cost: None,
            log_level: log::Level::Debug,
        }
    }
}

impl StatementConfig {
    /// Budget to check statements run under `ctx` against, if any
    fn plan_budget(&self, ctx: &TxContext) -> Option<f64> {
        self.max_plan_cost.filter(|_| !ctx.cost_check_disabled())
    }
}

/// An open Postgres transaction plus the statement checks above.
///
/// Once committed or rolled back, every operation fails with [`Error::TxDone`].
/// Dropping an unconcluded `PgTx` rolls the transaction back.
pub struct PgTx {
    inner: Option<Transaction<'static, Postgres>>,
    config: StatementConfig,
}

impl PgTx {
    pub fn new(tx: Transaction<'static, Postgres>, config: StatementConfig) -> Self {
        Self {
            inner: Some(tx),
            config,
        }
    }

    pub fn config(&self) -> &StatementConfig {
        &self.config
    }

    /// Whether the transaction has already been committed or rolled back
    pub fn is_done(&self) -> bool {
        self.inner.is_none()
    }

    fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.inner.as_mut().ok_or(Error::TxDone)
    }

    fn log(&self, sql: &str, args: &[Arg]) {
        log::log!(
            target: LOG_TARGET,
            self.config.log_level,
            "sql: {} args: {:?}",
            sql,
            args
        );
    }

    async fn check_plan_cost(&mut self, ctx: &TxContext, sql: &str, args: &[Arg]) -> Result<()> {
        let Some(budget) = self.config.plan_budget(ctx) else {
            return Ok(());
        };

        let explain_sql = format!("EXPLAIN (FORMAT JSON) {sql}");
        let conn = self.conn()?;
        let row = bounded(ctx, build(&explain_sql, args).fetch_one(&mut **conn)).await?;
        let explain: serde_json::Value = row.try_get(0)?;

        let cost = plan::enforce(budget, sql, &explain)?;
        log::trace!(target: LOG_TARGET, "plan cost {cost} within budget {budget}");
        Ok(())
    }

    pub async fn execute(
        &mut self,
        ctx: &TxContext,
        sql: &str,
        args: &[Arg],
    ) -> Result<PgQueryResult> {
        self.log(sql, args);
        self.check_plan_cost(ctx, sql, args).await?;
        let conn = self.conn()?;
        bounded(ctx, build(sql, args).execute(&mut **conn)).await
    }

    pub async fn fetch_all(&mut self, ctx: &TxContext, sql: &str, args: &[Arg]) -> Result<Vec<PgRow>> {
        self.log(sql, args);
        self.check_plan_cost(ctx, sql, args).await?;
        let conn = self.conn()?;
        bounded(ctx, build(sql, args).fetch_all(&mut **conn)).await
    }

    pub async fn fetch_one(&mut self, ctx: &TxContext, sql: &str, args: &[Arg]) -> Result<PgRow> {
        self.log(sql, args);
        self.check_plan_cost(ctx, sql, args).await?;
        let conn = self.conn()?;
        bounded(ctx, build(sql, args).fetch_one(&mut **conn)).await
    }

    pub async fn fetch_optional(
        &mut self,
        ctx: &TxContext,
        sql: &str,
        args: &[Arg],
    ) -> Result<Option<PgRow>> {
        self.log(sql, args);
        self.check_plan_cost(ctx, sql, args).await?;
        let conn = self.conn()?;
        bounded(ctx, build(sql, args).fetch_optional(&mut **conn)).await
    }

    pub async fn fetch_all_as<T>(&mut self, ctx: &TxContext, sql: &str, args: &[Arg]) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        let rows = self.fetch_all(ctx, sql, args).await?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(Error::from))
            .collect()
    }

    pub async fn fetch_one_as<T>(&mut self, ctx: &TxContext, sql: &str, args: &[Arg]) -> Result<T>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        let row = self.fetch_one(ctx, sql, args).await?;
        Ok(T::from_row(&row)?)
    }

    pub async fn fetch_optional_as<T>(
        &mut self,
        ctx: &TxContext,
        sql: &str,
        args: &[Arg],
    ) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        let row = self.fetch_optional(ctx, sql, args).await?;
        Ok(row.map(|row| T::from_row(&row)).transpose()?)
    }

    /// Run several `;`-separated statements in one round-trip over the simple
    /// query protocol. Batches cannot be explained, so they are refused while
    /// a plan budget applies to `ctx`.
    pub(crate) async fn execute_batch(&mut self, ctx: &TxContext, sql: &str) -> Result<()> {
        self.log(sql, &[]);
        if let Some(budget) = self.config.plan_budget(ctx) {
            return Err(Error::Plan(format!(
                "batch cannot be checked against plan cost budget {budget}"
            )));
        }
        let conn = self.conn()?;
        bounded(ctx, sqlx::Executor::execute(&mut **conn, sqlx::raw_sql(sql))).await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.inner.take().ok_or(Error::TxDone)?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let tx = self.inner.take().ok_or(Error::TxDone)?;
        tx.rollback().await?;
        Ok(())
    }
}

// Deadline enforcement for a single statement.
async fn bounded<T, F>(ctx: &TxContext, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
            .map_err(Error::from),
        None => fut.await.map_err(Error::from),
    }
}
