//! sqlx Postgres driver
//!
//! Transactions come from a `PgPool`, are wrapped in [`PgTx`] straight away,
//! and then get their isolation level and the setup batch before any caller
//! code sees them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::PgPool;
use tokio::time::Instant;

use super::Driver;
use crate::config::{IsolationLevel, PgDriverConfig};
use crate::context::TxContext;
use crate::error::{Error, Result};
use crate::setup::{self, BeginHook, SetupOptions};
use crate::statement::{PgTx, StatementConfig};

/// Runs right before commit; an error aborts the commit.
pub type PreCommitHook =
    Arc<dyn for<'t> Fn(&'t TxContext, &'t mut PgTx) -> BoxFuture<'t, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
    config: PgDriverConfig,
    begin_hook: Option<BeginHook>,
    pre_commit_hook: Option<PreCommitHook>,
}

impl PgDriver {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PgDriverConfig::default())
    }

    pub fn with_config(pool: PgPool, config: PgDriverConfig) -> Self {
        Self {
            pool,
            config,
            begin_hook: None,
            pre_commit_hook: None,
        }
    }

    pub fn begin_hook(mut self, hook: BeginHook) -> Self {
        self.begin_hook = Some(hook);
        self
    }

    pub fn pre_commit_hook(mut self, hook: PreCommitHook) -> Self {
        self.pre_commit_hook = Some(hook);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PgDriverConfig {
        &self.config
    }

    fn statement_config(&self) -> StatementConfig {
        StatementConfig {
            max_plan_cost: self.config.effective_max_plan_cost(),
            log_level: self.config.statement_log_level,
        }
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            statement_timeout_grace: self.config.statement_timeout_grace,
            disable_seqscan: self.config.disable_seqscan,
        }
    }

    fn isolation_for(&self, ctx: &TxContext) -> Result<IsolationLevel> {
        let isolation = ctx.isolation().unwrap_or(self.config.isolation);
        if self.config.require_serializable && isolation != IsolationLevel::Serializable {
            return Err(Error::IsolationPolicy {
                requested: isolation,
            });
        }
        Ok(isolation)
    }
}

#[async_trait]
impl Driver for PgDriver {
    type Tx = PgTx;

    async fn begin_tx(&self, ctx: &TxContext) -> Result<PgTx> {
        if self.pool.is_closed() {
            return Err(sqlx::Error::PoolClosed.into());
        }
        let isolation = self.isolation_for(ctx)?;
        let access_mode = ctx.access_mode().unwrap_or(self.config.access_mode);

        let tx = self.pool.begin().await?;
        let mut tx = PgTx::new(tx, self.statement_config());

        // Setup statements are logged like any other, but never explained.
        let unchecked = ctx.without_cost_check();
        let set_transaction = format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {}",
            isolation.as_sql(),
            access_mode.as_sql()
        );
        tx.execute(&unchecked, &set_transaction, &[]).await?;

        let batch = setup::setup_batch(
            ctx,
            self.begin_hook.as_ref(),
            self.setup_options(),
            Instant::now(),
        )?;
        if let Some(batch) = batch {
            tx.execute_batch(&unchecked, &batch).await?;
        }

        Ok(tx)
    }

    async fn commit_tx(&self, ctx: &TxContext, tx: &mut PgTx) -> Result<()> {
        if tx.is_done() {
            return Err(Error::TxDone);
        }
        if let Some(hook) = &self.pre_commit_hook {
            hook(ctx, tx).await?;
        }
        tx.commit().await
    }

    async fn rollback_tx(&self, _ctx: &TxContext, tx: &mut PgTx) -> Result<()> {
        tx.rollback().await
    }

    fn serialization_failure_codes(&self) -> &[String] {
        &self.config.serialization_failure_codes
    }

    fn serialization_failure_max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

impl std::fmt::Debug for PgDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDriver")
            .field("config", &self.config)
            .field("begin_hook", &self.begin_hook.is_some())
            .field("pre_commit_hook", &self.pre_commit_hook.is_some())
            .finish_non_exhaustive()
    }
}
