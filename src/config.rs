//! Driver configuration
//!
//! Defaults are production-safe: serializable read-write transactions, no plan
//! cost checks, sequential scans allowed. Test suites usually turn on
//! `max_plan_cost` together with `disable_seqscan`.

use std::env;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_STATEMENT_TIMEOUT_GRACE, SERIALIZATION_FAILURE_CODE,
};

/// Transaction isolation level
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        }
    }
}

/// Configuration for [`crate::PgDriver`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgDriverConfig {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
    /// Reject any transaction that would not run serializable
    pub require_serializable: bool,
    /// SQLSTATE codes that restart the whole transaction
    pub serialization_failure_codes: Vec<String>,
    /// Total attempts allowed per call
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub statement_timeout_grace: Duration,
    /// Planner cost ceiling per statement; `None` disables EXPLAIN checks
    pub max_plan_cost: Option<f64>,
    pub disable_seqscan: bool,
    pub statement_log_level: log::Level,
}

impl Default for PgDriverConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            access_mode: AccessMode::ReadWrite,
            require_serializable: true,
            serialization_failure_codes: vec![SERIALIZATION_FAILURE_CODE.to_string()],
            max_retries: DEFAULT_MAX_RETRIES,
            statement_timeout_grace: DEFAULT_STATEMENT_TIMEOUT_GRACE,
            max_plan_cost: None,
            disable_seqscan: false,
            statement_log_level: log::Level::Debug,
        }
    }
}

impl PgDriverConfig {
    /// Defaults overridden by `TRANSACTOR_*` environment variables.
    /// Unparseable or out-of-range values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: max_retries().unwrap_or(defaults.max_retries),
            statement_timeout_grace: timeout_grace_secs()
                .map(Duration::from_secs)
                .unwrap_or(defaults.statement_timeout_grace),
            max_plan_cost: max_plan_cost(),
            disable_seqscan: disable_seqscan().unwrap_or(defaults.disable_seqscan),
            statement_log_level: statement_log_level().unwrap_or(defaults.statement_log_level),
            ..defaults
        }
    }

    /// Set the planner cost ceiling. Zero, negative or non-finite disables it.
    pub fn with_max_plan_cost(mut self, cost: f64) -> Self {
        self.max_plan_cost = positive_cost(cost);
        self
    }

    pub(crate) fn effective_max_plan_cost(&self) -> Option<f64> {
        self.max_plan_cost.and_then(positive_cost)
    }
}

fn positive_cost(cost: f64) -> Option<f64> {
    (cost.is_finite() && cost > 0.0).then_some(cost)
}

fn max_retries() -> Option<u32> {
    env::var("TRANSACTOR_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
}

fn timeout_grace_secs() -> Option<u64> {
    env::var("TRANSACTOR_TIMEOUT_GRACE_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
}

fn max_plan_cost() -> Option<f64> {
    env::var("TRANSACTOR_MAX_PLAN_COST")
        .ok()
        .and_then(|s| s.parse().ok())
        .and_then(positive_cost)
}

fn disable_seqscan() -> Option<bool> {
    env::var("TRANSACTOR_DISABLE_SEQSCAN")
        .ok()
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        })
}

fn statement_log_level() -> Option<log::Level> {
    env::var("TRANSACTOR_STATEMENT_LOG_LEVEL")
        .ok()
        .and_then(|s| s.parse().ok())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
