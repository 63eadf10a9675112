//! Database transaction utilities
//!
//! Aggregate writes run in a serializable transaction. Serialization failures and lock
//! timeouts surface as [`AppError::is_lock_contention`]; [`retry_on_contention`] replays the
//! whole unit of work once before giving up.

use std::future::Future;

use keystone_core::{AppError, AppResult};
use sqlx::{PgPool, Postgres, Transaction};

/// Begin a transaction at SERIALIZABLE isolation.
pub async fn begin_serializable(pool: &PgPool) -> AppResult<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to begin database transaction");
        AppError::Database(e)
    })?;

    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to set transaction isolation level");
            AppError::Database(e)
        })?;

    Ok(tx)
}

/// Commit, mapping the error the same way as statement failures.
pub async fn commit(tx: Transaction<'static, Postgres>) -> AppResult<()> {
    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to commit database transaction");
        AppError::from(e)
    })
}

/// Run `unit` and, if it fails on lock contention, run it exactly once more.
///
/// `unit` must open and commit its own transaction so that the replay starts clean.
pub async fn retry_on_contention<T, F, Fut>(operation: &'static str, unit: F) -> AppResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match unit().await {
        Err(e) if e.is_lock_contention() => {
            tracing::warn!(operation, error = %e, "Lock contention, retrying transaction once");
            unit().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn non_contention_errors_are_not_retried() {
        let calls = &AtomicUsize::new(0);
        let result: AppResult<()> = retry_on_contention("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::InvalidInput("bad".to_string()))
        })
        .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_runs_once() {
        let calls = &AtomicUsize::new(0);
        let value = retry_on_contention("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
