//! Error types for transactional execution

use std::borrow::Cow;

use thiserror::Error;

use crate::config::IsolationLevel;

/// Result type for transactional operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the engine, its drivers, and transactional bodies
#[derive(Error, Debug)]
pub enum Error {
    /// Errors reported by sqlx, including coded Postgres errors
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A coded database error that did not come through sqlx
    #[error("database error {code}: {message}")]
    Database { code: String, message: String },

    /// Opening the transaction (or running its setup) failed
    #[error("begin transaction: {0}")]
    Begin(#[source] Box<Error>),

    /// The transaction handle was already committed or rolled back
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// A transactional call was made from inside another one
    #[error("already in transaction scope: pass the open transaction down instead of starting a new one")]
    NestedTransaction,

    /// The driver only allows serializable transactions
    #[error("isolation level {requested} not allowed: driver requires serializable")]
    IsolationPolicy { requested: IsolationLevel },

    /// Serialization conflicts persisted through every allowed attempt
    #[error("serialization failure retries exceeded after {attempts} attempts: {source}")]
    RetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The body failed and the rollback that followed failed too
    #[error("{source} (rollback also failed: {rollback})")]
    Rollback {
        #[source]
        source: Box<Error>,
        rollback: Box<Error>,
    },

    /// The planner estimated a statement above the configured budget
    #[error(
        "query plan cost {cost} exceeds budget {budget} for statement: {statement}\nplan: {plan}"
    )]
    PlanCostExceeded {
        budget: f64,
        cost: f64,
        statement: String,
        plan: String,
    },

    /// EXPLAIN output could not be interpreted
    #[error("unexpected query plan: {0}")]
    Plan(String),

    /// The context deadline elapsed while a statement was running
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Anything else a transactional body wants to fail with
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Other(err.into())
    }

    /// Build a coded database error, mostly for drivers that do not speak sqlx.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE code of the underlying database error, if there is one.
    ///
    /// Looks through a failed attempt's rollback wrapper, but not through
    /// `Begin` or `RetriesExceeded`: those are never retried.
    pub fn sqlstate(&self) -> Option<Cow<'_, str>> {
        match self {
            Error::Sqlx(sqlx::Error::Database(db)) => db.code(),
            Error::Database { code, .. } => Some(Cow::Borrowed(code.as_str())),
            Error::Rollback { source, .. } => source.sqlstate(),
            _ => None,
        }
    }
}
