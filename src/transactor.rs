//! Retrying transaction execution
//!
//! `Transactor::transact` runs a body inside a fresh transaction, commits it,
//! and restarts the whole thing from `begin` when the database reports a
//! serialization conflict. No state from a failed attempt survives into the
//! next one: every attempt gets a new handle and a new context.
//!
//! Calling `transact` from inside a body fails with
//! [`Error::NestedTransaction`]; pass the open handle down instead.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::constants::LOG_TARGET;
use crate::context::TxContext;
use crate::driver::Driver;
use crate::error::{Error, Result};

pub struct Transactor<D> {
    driver: Arc<D>,
}

impl<D> Clone for Transactor<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
        }
    }
}

impl<D: Driver> Transactor<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run `body` transactionally and return its value.
    ///
    /// The body may run several times; it receives the attempt's context
    /// (with [`TxContext::attempt`] set) and exclusive use of the handle.
    pub async fn transact<U, F>(&self, ctx: &TxContext, mut body: F) -> Result<U>
    where
        U: Send,
        F: for<'t> FnMut(TxContext, &'t mut D::Tx) -> BoxFuture<'t, Result<U>> + Send,
    {
        if ctx.in_transaction() {
            return Err(Error::NestedTransaction);
        }

        let max_attempts = self.driver.serialization_failure_max_retries().max(1);
        let mut attempt = 1;
        loop {
            let err = match self.attempt(ctx, attempt, &mut body).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(code) = self.retryable_code(&err) else {
                return Err(err);
            };
            if attempt >= max_attempts {
                log::warn!(
                    target: LOG_TARGET,
                    "giving up after {attempt} attempts, last serialization failure {code}"
                );
                return Err(Error::RetriesExceeded {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            log::warn!(
                target: LOG_TARGET,
                "serialization failure {code} on attempt {attempt}, retrying"
            );
            attempt += 1;
        }
    }

    /// Run `body` transactionally, discarding any value.
    pub async fn run<F>(&self, ctx: &TxContext, body: F) -> Result<()>
    where
        F: for<'t> FnMut(TxContext, &'t mut D::Tx) -> BoxFuture<'t, Result<()>> + Send,
    {
        self.transact(ctx, body).await
    }

    fn retryable_code(&self, err: &Error) -> Option<String> {
        let code = err.sqlstate()?;
        self.driver
            .serialization_failure_codes()
            .iter()
            .any(|retryable| *retryable == code)
            .then(|| code.into_owned())
    }

    async fn attempt<U, F>(&self, ctx: &TxContext, attempt: u32, body: &mut F) -> Result<U>
    where
        U: Send,
        F: for<'t> FnMut(TxContext, &'t mut D::Tx) -> BoxFuture<'t, Result<U>> + Send,
    {
        let driver = &*self.driver;
        let ctx = ctx.for_attempt(attempt);

        let mut tx = driver
            .begin_tx(&ctx)
            .await
            .map_err(|err| Error::Begin(Box::new(err)))?;

        let outcome = AssertUnwindSafe(body(ctx.clone(), &mut tx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                match driver.rollback_tx(&ctx, &mut tx).await {
                    Ok(()) => {}
                    Err(err) if driver.is_tx_done(&err) => {}
                    Err(err) => log::error!(
                        target: LOG_TARGET,
                        "rollback after panic on attempt {attempt} failed: {err}"
                    ),
                }
                log::error!(
                    target: LOG_TARGET,
                    "transaction body panicked on attempt {attempt}, rolled back"
                );
                drop(tx);
                std::panic::resume_unwind(panic);
            }
        };

        match result {
            Ok(value) => match driver.commit_tx(&ctx, &mut tx).await {
                Ok(()) => Ok(value),
                Err(err) if driver.is_tx_done(&err) => {
                    log::debug!(
                        target: LOG_TARGET,
                        "transaction concluded by its body on attempt {attempt}"
                    );
                    Ok(value)
                }
                Err(err) => Err(self.roll_back(&ctx, attempt, &mut tx, err).await),
            },
            Err(err) => Err(self.roll_back(&ctx, attempt, &mut tx, err).await),
        }
    }

    /// Roll back after `err` ended the attempt. A handle that is already
    /// concluded is fine; any other rollback failure is folded into the error.
    async fn roll_back(&self, ctx: &TxContext, attempt: u32, tx: &mut D::Tx, err: Error) -> Error {
        match self.driver.rollback_tx(ctx, tx).await {
            Ok(()) => err,
            Err(rollback) if self.driver.is_tx_done(&rollback) => {
                log::debug!(
                    target: LOG_TARGET,
                    "rollback skipped on attempt {attempt}: {rollback}"
                );
                err
            }
            Err(rollback) => Error::Rollback {
                source: Box::new(err),
                rollback: Box::new(rollback),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONFLICT: &str = "40001";

    #[derive(Default)]
    struct Counters {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    struct MockDriver {
        counters: Arc<Counters>,
        codes: Vec<String>,
        max_retries: u32,
        fail_begin: bool,
        fail_rollback: bool,
        fail_commit_with: Option<&'static str>,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                counters: Arc::default(),
                codes: vec![CONFLICT.to_string()],
                max_retries: 50,
                fail_begin: false,
                fail_rollback: false,
                fail_commit_with: None,
            }
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.counters.begins.load(Ordering::SeqCst),
                self.counters.commits.load(Ordering::SeqCst),
                self.counters.rollbacks.load(Ordering::SeqCst),
            )
        }
    }

    struct MockTx {
        done: bool,
    }

    impl MockTx {
        fn conclude(&mut self) {
            self.done = true;
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        type Tx = MockTx;

        async fn begin_tx(&self, _ctx: &TxContext) -> Result<MockTx> {
            if self.fail_begin {
                return Err(Error::database(CONFLICT, "too many connections"));
            }
            self.counters.begins.fetch_add(1, Ordering::SeqCst);
            Ok(MockTx { done: false })
        }

        async fn commit_tx(&self, _ctx: &TxContext, tx: &mut MockTx) -> Result<()> {
            if tx.done {
                return Err(Error::TxDone);
            }
            if let Some(code) = self.fail_commit_with {
                return Err(Error::database(code, "commit failed"));
            }
            tx.done = true;
            self.counters.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback_tx(&self, _ctx: &TxContext, tx: &mut MockTx) -> Result<()> {
            if tx.done {
                return Err(Error::TxDone);
            }
            if self.fail_rollback {
                return Err(Error::other("connection reset"));
            }
            tx.done = true;
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn serialization_failure_codes(&self) -> &[String] {
            &self.codes
        }

        fn serialization_failure_max_retries(&self) -> u32 {
            self.max_retries
        }
    }

    fn conflict() -> Error {
        Error::database(CONFLICT, "could not serialize access due to concurrent update")
    }

    #[tokio::test]
    async fn success_commits_once() {
        let transactor = Transactor::new(MockDriver::new());
        let value = transactor
            .transact(&TxContext::new(), |ctx, _tx| {
                Box::pin(async move { Ok(ctx.attempt()) })
            })
            .await
            .expect("transact");

        assert_eq!(value, Some(1));
        assert_eq!(transactor.driver().counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn non_retryable_failure_rolls_back_once() {
        let transactor = Transactor::new(MockDriver::new());
        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| {
                Box::pin(async move { Err(Error::other("insufficient funds")) })
            })
            .await
            .expect_err("body failure");

        assert_eq!(err.to_string(), "insufficient funds");
        assert_eq!(transactor.driver().counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let transactor = Transactor::new(MockDriver::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = transactor
            .transact(&TxContext::new(), |ctx, _tx| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    let attempt = ctx.attempt().expect("attempt set");
                    seen.lock().unwrap().push(attempt);
                    if attempt < 4 {
                        return Err(conflict());
                    }
                    Ok("done")
                })
            })
            .await
            .expect("eventually commits");

        assert_eq!(result, "done");
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(transactor.driver().counts(), (4, 1, 3));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut driver = MockDriver::new();
        driver.max_retries = 3;
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| {
                Box::pin(async move { Err(conflict()) })
            })
            .await
            .expect_err("retries exceeded");

        match &err {
            Error::RetriesExceeded { attempts, source } => {
                assert_eq!(*attempts, 3);
                assert_eq!(source.sqlstate().as_deref(), Some(CONFLICT));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transactor.driver().counts(), (3, 0, 3));
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let mut driver = MockDriver::new();
        driver.max_retries = 0;
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| {
                Box::pin(async move { Err(conflict()) })
            })
            .await
            .expect_err("retries exceeded");

        assert!(matches!(err, Error::RetriesExceeded { attempts: 1, .. }));
        assert_eq!(transactor.driver().counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn unlisted_codes_are_not_retried() {
        let transactor = Transactor::new(MockDriver::new());
        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| {
                Box::pin(async move { Err(Error::database("40P01", "deadlock detected")) })
            })
            .await
            .expect_err("deadlock");

        assert_eq!(err.sqlstate().as_deref(), Some("40P01"));
        assert_eq!(transactor.driver().counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn commit_conflicts_are_retried() {
        let mut driver = MockDriver::new();
        driver.max_retries = 2;
        driver.fail_commit_with = Some(CONFLICT);
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| Box::pin(async move { Ok(()) }))
            .await
            .expect_err("commit keeps failing");

        assert!(matches!(err, Error::RetriesExceeded { attempts: 2, .. }));
        assert_eq!(transactor.driver().counts(), (2, 0, 2));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_the_handle() {
        let mut driver = MockDriver::new();
        driver.fail_commit_with = Some("P0001");
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| Box::pin(async move { Ok(()) }))
            .await
            .expect_err("commit fails");

        assert_eq!(err.sqlstate().as_deref(), Some("P0001"));
        assert_eq!(transactor.driver().counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn failed_commit_and_failed_rollback_are_combined() {
        let mut driver = MockDriver::new();
        driver.fail_commit_with = Some("P0001");
        driver.fail_rollback = true;
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| Box::pin(async move { Ok(()) }))
            .await
            .expect_err("commit fails");

        match &err {
            Error::Rollback { source, rollback } => {
                assert_eq!(source.sqlstate().as_deref(), Some("P0001"));
                assert!(rollback.to_string().contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transactor.driver().counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn body_may_conclude_the_transaction_itself() {
        let transactor = Transactor::new(MockDriver::new());
        transactor
            .run(&TxContext::new(), |_ctx, tx| {
                Box::pin(async move {
                    tx.conclude();
                    Ok(())
                })
            })
            .await
            .expect("already-done commit is success");

        assert_eq!(transactor.driver().counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn double_rollback_is_not_an_error() {
        let transactor = Transactor::new(MockDriver::new());
        let err = transactor
            .run(&TxContext::new(), |_ctx, tx| {
                Box::pin(async move {
                    tx.conclude();
                    Err(Error::other("validation failed"))
                })
            })
            .await
            .expect_err("body failure");

        assert!(matches!(err, Error::Other(_)));
    }

    #[tokio::test]
    async fn rollback_failure_is_combined_and_still_retryable() {
        let mut driver = MockDriver::new();
        driver.fail_rollback = true;
        driver.max_retries = 2;
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| {
                Box::pin(async move { Err(conflict()) })
            })
            .await
            .expect_err("fails");

        match err {
            Error::RetriesExceeded { source, .. } => {
                assert!(matches!(*source, Error::Rollback { .. }));
                assert!(source.to_string().contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transactor.driver().counts().0, 2);
    }

    #[tokio::test]
    async fn begin_failure_is_not_retried() {
        let mut driver = MockDriver::new();
        driver.fail_begin = true;
        let transactor = Transactor::new(driver);

        let err = transactor
            .run(&TxContext::new(), |_ctx, _tx| Box::pin(async move { Ok(()) }))
            .await
            .expect_err("begin fails");

        assert!(matches!(err, Error::Begin(_)));
        assert_eq!(transactor.driver().counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn nested_transact_is_rejected() {
        let transactor = Transactor::new(MockDriver::new());
        let inner = transactor.clone();

        let nested = transactor
            .transact(&TxContext::new(), move |ctx, _tx| {
                let inner = inner.clone();
                Box::pin(async move {
                    let result = inner
                        .run(&ctx, |_ctx, _tx| Box::pin(async move { Ok(()) }))
                        .await;
                    Ok(matches!(result, Err(Error::NestedTransaction)))
                })
            })
            .await
            .expect("outer commits");

        assert!(nested);
        assert_eq!(transactor.driver().counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn panic_rolls_back_and_resumes() {
        let transactor = Transactor::new(MockDriver::new());

        let outcome = AssertUnwindSafe(transactor.run(&TxContext::new(), |_ctx, _tx| {
            Box::pin(async move {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            })
        }))
        .catch_unwind()
        .await;

        let payload = outcome.expect_err("panic propagates");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(transactor.driver().counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_transactor() {
        let transactor = Transactor::new(MockDriver::new());
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..8u32 {
            let transactor = transactor.clone();
            tasks.spawn(async move {
                transactor
                    .transact(&TxContext::new(), move |ctx, _tx| {
                        Box::pin(async move {
                            // Odd callers conflict once.
                            if i % 2 == 1 && ctx.attempt() == Some(1) {
                                return Err(conflict());
                            }
                            Ok(ctx.attempt().unwrap_or_default())
                        })
                    })
                    .await
            });
        }

        let mut attempts = 0;
        while let Some(result) = tasks.join_next().await {
            attempts += result.expect("join").expect("transact");
        }

        assert_eq!(attempts, 4 + 4 * 2);
        assert_eq!(transactor.driver().counts(), (12, 8, 4));
    }
}
