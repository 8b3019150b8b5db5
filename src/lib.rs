//! Retrying serializable transactions for Postgres
//!
//! Application code describes a unit of work once; the [`Transactor`] opens
//! the transaction, runs the work, commits, and transparently re-runs
//! everything when Postgres reports a serialization failure (`40001`).
//!
//! ```ignore
//! use transactor::{PgDriver, PgDriverConfig, Transactor, TxContext};
//!
//! let transactor = Transactor::new(PgDriver::with_config(pool, PgDriverConfig::from_env()));
//! let ctx = TxContext::new().with_timeout(Duration::from_secs(5));
//!
//! transactor
//!     .run(&ctx, |ctx, tx| Box::pin(async move {
//!         tx.execute(&ctx, "UPDATE counters SET value = value + 1 WHERE id = $1", &[1.into()])
//!             .await?;
//!         Ok(())
//!     }))
//!     .await?;
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod driver;
pub mod error;
pub mod plan;
pub mod setup;
pub mod statement;
pub mod transactor;

pub use config::{AccessMode, IsolationLevel, PgDriverConfig};
pub use context::TxContext;
pub use driver::{Driver, PgDriver, PreCommitHook};
pub use error::{Error, Result};
pub use setup::{BeginHook, claims_hook};
pub use statement::{Arg, PgTx, StatementConfig};
pub use transactor::Transactor;
