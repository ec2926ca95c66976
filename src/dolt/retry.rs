//! Retry classification and bounded backoff for SQL operations.
//!
//! Concurrent writers contend on the server's optimistic locks; the server
//! also degrades into read-only mode under write stress. Both present as
//! error text. The substrings below are documented capabilities of the
//! dolt binary's stable output, centralized here so no other module
//! pattern-matches tool prose.

use std::time::Duration;

use crate::error::TownError;

/// Substrings identifying transient, retry-safe failures.
const RETRYABLE: &[&str] = &[
    "database is read only",
    "cannot update manifest",
    "optimistic lock",
    "serialization failure",
    "lock wait timeout",
    "try restarting transaction",
];

/// Whether the error text marks a transient failure worth retrying.
pub fn is_retryable_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RETRYABLE.iter().any(|needle| lower.contains(needle))
}

/// Whether `err` is a transient subprocess failure.
pub fn is_retryable(err: &TownError) -> bool {
    err.subprocess_text()
        .is_some_and(|text| is_retryable_text(&text))
}

/// Whether the error text marks the server's read-only degradation.
///
/// Matches any spelling of `read only` with at most one separator
/// character, case-insensitive.
pub fn is_read_only_text(text: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)read.?only").expect("static regex"))
        .is_match(text)
}

/// Whether `err` reports the read-only condition.
pub fn is_read_only(err: &TownError) -> bool {
    err.subprocess_text()
        .is_some_and(|text| is_read_only_text(&text))
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Backoff policy: `attempts` tries, delays `base · 2^(n-1)` capped at `cap`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

/// Policy for a single statement.
pub const STATEMENT_POLICY: RetryPolicy = RetryPolicy {
    attempts: 5,
    base: Duration::from_millis(500),
    cap: Duration::from_secs(15),
};

/// Policy for a multi-statement script. Scripts retried under this policy
/// must be idempotent; the caller owns that guarantee.
pub const SCRIPT_POLICY: RetryPolicy = RetryPolicy {
    attempts: 3,
    base: Duration::from_millis(500),
    cap: Duration::from_secs(8),
};

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.base * factor).min(self.cap)
    }
}

/// Run `op` under `policy`, retrying transient failures with backoff.
/// Non-transient failures surface immediately.
pub fn with_retry<T>(
    policy: RetryPolicy,
    mut op: impl FnMut() -> Result<T, TownError>,
) -> Result<T, TownError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts && is_retryable(&err) => {
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run `op` under `policy`; if every retry exhausts on a read-only error,
/// invoke `recover` (a server restart) and try once more.
pub fn with_recovery<T>(
    policy: RetryPolicy,
    mut op: impl FnMut() -> Result<T, TownError>,
    recover: impl FnOnce() -> Result<(), TownError>,
) -> Result<T, TownError> {
    match with_retry(policy, &mut op) {
        Ok(value) => Ok(value),
        Err(err) if is_read_only(&err) => {
            tracing::warn!(%err, "write path exhausted retries read-only; restarting server");
            recover()?;
            op()
        }
        Err(err) => Err(err),
    }
}
