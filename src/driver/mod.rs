//! Driver abstraction
//!
//! A driver knows how to open, commit and roll back one kind of transaction
//! handle, and which failures are worth retrying. The retry loop in
//! [`crate::Transactor`] is written against this trait only.

pub mod postgres;

use async_trait::async_trait;

use crate::context::TxContext;
use crate::error::{Error, Result};

pub use postgres::{PgDriver, PreCommitHook};

#[async_trait]
pub trait Driver: Send + Sync {
    /// Open transaction handle. Must roll back when dropped unconcluded.
    type Tx: Send;

    /// Open a transaction with the driver's isolation and access mode.
    async fn begin_tx(&self, ctx: &TxContext) -> Result<Self::Tx>;

    async fn commit_tx(&self, ctx: &TxContext, tx: &mut Self::Tx) -> Result<()>;

    /// Roll back. Returns the "already done" error if the handle was concluded.
    async fn rollback_tx(&self, ctx: &TxContext, tx: &mut Self::Tx) -> Result<()>;

    /// SQLSTATE codes that restart the whole transaction
    fn serialization_failure_codes(&self) -> &[String];

    /// Total attempts allowed per call
    fn serialization_failure_max_retries(&self) -> u32;

    /// Whether `err` is the handle's "transaction already concluded" error
    fn is_tx_done(&self, err: &Error) -> bool {
        matches!(err, Error::TxDone)
    }
}
