//! Session setup run at the start of every transaction
//!
//! One batch, in order: begin-hook statements, the statement timeout derived
//! from the context deadline, then the sequential scan hint.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::constants::MAX_STATEMENT_TIMEOUT_MS;
use crate::context::TxContext;
use crate::error::{Error, Result};

/// Appends setup SQL for a freshly opened transaction.
pub type BeginHook = Arc<dyn Fn(&TxContext, &mut Vec<String>) -> Result<()> + Send + Sync>;

/// Driver-level knobs that shape the setup batch
#[derive(Debug, Clone, Copy)]
pub struct SetupOptions {
    pub statement_timeout_grace: Duration,
    pub disable_seqscan: bool,
}

/// Ordered setup statements for one transaction. `now` anchors the deadline math.
pub fn setup_statements(
    ctx: &TxContext,
    hook: Option<&BeginHook>,
    options: SetupOptions,
    now: Instant,
) -> Result<Vec<String>> {
    let mut statements = Vec::new();

    if let Some(hook) = hook {
        hook(ctx, &mut statements)?;
    }

    if let Some(remaining) = ctx.remaining(now) {
        let timeout = remaining.saturating_add(options.statement_timeout_grace);
        let millis = ceil_millis(timeout).min(MAX_STATEMENT_TIMEOUT_MS);
        statements.push(format!("SET LOCAL statement_timeout = {millis}"));
    }

    if options.disable_seqscan {
        statements.push("SET LOCAL enable_seqscan = off".to_string());
    }

    Ok(statements)
}

/// Setup statements joined into one simple-protocol batch; `None` when empty.
pub fn setup_batch(
    ctx: &TxContext,
    hook: Option<&BeginHook>,
    options: SetupOptions,
    now: Instant,
) -> Result<Option<String>> {
    let statements = setup_statements(ctx, hook, options, now)?;
    if statements.is_empty() {
        return Ok(None);
    }
    Ok(Some(statements.join(";\n")))
}

fn ceil_millis(d: Duration) -> u128 {
    let millis = d.as_millis();
    if d.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    }
}

/// Quote a string as a Postgres literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Begin hook that copies the context setting `key` into the Postgres setting
/// `pg_setting` as JSON, so RLS policies can read it with
/// `current_setting('<pg_setting>', true)::jsonb`. Does nothing when the
/// context has no such setting.
pub fn claims_hook(pg_setting: impl Into<String>, key: impl Into<String>) -> BeginHook {
    let pg_setting = pg_setting.into();
    let key = key.into();
    Arc::new(move |ctx: &TxContext, statements: &mut Vec<String>| -> Result<()> {
        let Some(claims) = ctx.setting(&key) else {
            return Ok(());
        };
        if !is_setting_name(&pg_setting) {
            return Err(Error::other(format!(
                "invalid setting name for claims: {pg_setting}"
            )));
        }
        let json = serde_json::to_string(claims).map_err(Error::other)?;
        statements.push(format!(
            "SET LOCAL {} = {}",
            pg_setting,
            quote_literal(&json)
        ));
        Ok(())
    })
}

// Custom settings are dotted identifiers, e.g. `request.jwt.claims`.
fn is_setting_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
}
