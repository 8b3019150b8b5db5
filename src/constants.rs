//! Engine defaults

use std::time::Duration;

/// Postgres `serialization_failure`
pub const SERIALIZATION_FAILURE_CODE: &str = "40001";

/// Default attempt bound, matching CockroachDB's client retry default
pub const DEFAULT_MAX_RETRIES: u32 = 50;

/// Added on top of the caller's remaining deadline when setting `statement_timeout`
pub const DEFAULT_STATEMENT_TIMEOUT_GRACE: Duration = Duration::from_secs(20);

/// Postgres setting that carries authenticated claims into RLS policies
pub const DEFAULT_CLAIMS_SETTING: &str = "request.jwt.claims";

/// Log target for every record this crate emits
pub const LOG_TARGET: &str = "transactor";

/// Largest `statement_timeout` Postgres accepts, in milliseconds
pub const MAX_STATEMENT_TIMEOUT_MS: u128 = i32::MAX as u128;
