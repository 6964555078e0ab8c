//! Resilient query execution
//!
//! [`QueryExecutor`] is the single path from request handlers to the
//! database. It retries transient connection failures with linear backoff
//! and surfaces everything else on the first attempt.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{DbError, Result};
use crate::pool::Pool;
use crate::value::{QueryResult, Row, SqlValue};

/// Retry bound and backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Attempt `n` waits `n * base_delay` before attempt `n + 1`
    pub base_delay: Duration,
    /// Optional wall-clock budget; a retry whose backoff would cross it is
    /// not started
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Runs statements against the pool with retry on transient errors
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: Pool,
    policy: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(pool: Pool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute one statement.
    ///
    /// Transient errors (from acquiring a connection or from the query) are
    /// retried up to `max_attempts`; the connection that failed is evicted so
    /// the retry runs on a fresh one. Any other error, including
    /// [`DbError::AcquisitionTimeout`], is returned immediately. When retries
    /// run out the last transient error is returned as-is.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.attempt(sql, params).await {
                Ok(rows) => {
                    return Ok(QueryResult {
                        rows,
                        attempts: attempt,
                    })
                }
                Err(err) => err,
            };

            warn!(
                attempt,
                max_attempts,
                transient = err.is_transient(),
                error = %err,
                "query attempt failed"
            );

            if !err.is_transient() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.policy.backoff(attempt);
            if let Some(deadline) = self.policy.deadline {
                if started.elapsed() + delay > deadline {
                    warn!(
                        attempt,
                        deadline_ms = deadline.as_millis() as u64,
                        "retry deadline reached, giving up"
                    );
                    return Err(err);
                }
            }

            info!(delay_ms = delay.as_millis() as u64, "retrying query");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut conn = self.pool.acquire().await?;
        conn.query(sql, params).await
    }

    /// Execute and return the first row, failing when there is none.
    pub async fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> Result<Row> {
        self.fetch_optional(sql, params)
            .await?
            .ok_or_else(|| DbError::fatal("query returned no rows"))
    }

    /// Execute and return the first row, if any.
    pub async fn fetch_optional(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        let result = self.execute(sql, params).await?;
        Ok(result.into_rows().into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn policy_builder() {
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(10))
            .with_deadline(Some(Duration::from_secs(1)));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff(3), Duration::from_millis(30));
        assert_eq!(policy.deadline, Some(Duration::from_secs(1)));
    }
}
