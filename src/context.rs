//! Request-scoped execution context
//!
//! A `TxContext` travels by value down the call chain of one request. It
//! carries the caller's deadline and settings, plus the per-attempt state the
//! retry loop hands to a transactional body. Cloning is cheap.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{AccessMode, IsolationLevel};

#[derive(Debug, Clone, Default)]
pub struct TxContext {
    deadline: Option<Instant>,
    attempt: Option<u32>,
    cost_check_disabled: bool,
    isolation: Option<IsolationLevel>,
    access_mode: Option<AccessMode>,
    settings: Arc<BTreeMap<String, serde_json::Value>>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now. A timeout too large to represent leaves
    /// the context without a deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Attach a caller-defined setting, e.g. the authenticated principal's claims.
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.settings).insert(key.into(), value);
        self
    }

    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }

    /// Override the driver's isolation level for transactions started from this context.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn with_access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = Some(access_mode);
        self
    }

    pub fn access_mode(&self) -> Option<AccessMode> {
        self.access_mode
    }

    /// Child context whose statements skip the plan cost check.
    pub fn without_cost_check(&self) -> Self {
        Self {
            cost_check_disabled: true,
            ..self.clone()
        }
    }

    pub fn cost_check_disabled(&self) -> bool {
        self.cost_check_disabled
    }

    /// 1-based attempt number of the enclosing transaction, if any.
    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    pub fn in_transaction(&self) -> bool {
        self.attempt.is_some()
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            ..self.clone()
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}
