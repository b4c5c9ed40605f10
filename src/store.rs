//! Storage-layer error and bounded retry
//!
//! Every trait-backed store (ledger, obligations, trades) reports failures
//! as `StoreError`. Transient failures are retried locally a bounded number
//! of times; anything else is surfaced to the caller unchanged.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Storage failure
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether a retry of the same operation may succeed
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Backoff between attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Run `op` up to `attempts` times while it fails with a transient error.
///
/// `attempts` of 0 is treated as 1.
pub async fn with_retry<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Storage operation failed, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = with_retry(3, "test", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Database("connection reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = with_retry(3, "test", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Database("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corrupt_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = with_retry(5, "test", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Corrupt("bad asset".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
