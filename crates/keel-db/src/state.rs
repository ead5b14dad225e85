//! PostgreSQL implementation of the stack state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::stack::{StackState, StateLock};
use keel_core::state::{StateLease, StateStore};
use keel_core::{Result, RunId};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    stack: String,
    lock_id: Option<String>,
    lock_holder: Option<String>,
    lock_run_id: Option<Uuid>,
    locked_at: Option<DateTime<Utc>>,
}

impl LockRow {
    fn into_lock(self) -> Option<StateLock> {
        match (self.lock_id, self.lock_holder, self.lock_run_id, self.locked_at) {
            (Some(lock_id), Some(holder), Some(run_id), Some(acquired_at)) => Some(StateLock {
                lock_id,
                stack: self.stack,
                run_id: RunId::from(run_id),
                holder,
                acquired_at,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    version: i64,
    lock_id: Option<String>,
}

fn to_db_version(version: u64) -> DbResult<i64> {
    i64::try_from(version).map_err(|_| DbError::InvalidData(format!("version {version} out of range")))
}

fn lock_conflict(lock: &StateLock) -> DbError {
    DbError::Conflict(format!(
        "stack '{}' is locked by {} (run {}, since {})",
        lock.stack, lock.holder, lock.run_id, lock.acquired_at
    ))
}

/// Why a conditional save touched no row.
fn save_rejection(stack: &str, lease_id: &str, row: Option<VersionRow>, offered: u64) -> DbError {
    match row {
        Some(row) if row.lock_id.as_deref() != Some(lease_id) => DbError::Conflict(format!(
            "cannot save stack '{stack}' without holding its lock"
        )),
        Some(row) => DbError::Conflict(format!(
            "stale state for stack '{stack}': stored version {}, saving from version {offered}",
            row.version
        )),
        None => DbError::Conflict(format!(
            "cannot save stack '{stack}' without holding its lock"
        )),
    }
}

/// Stack state in a `stack_state` table. Locks are taken with a
/// conditional update so only one run can win.
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_row(&self, stack: &str) -> DbResult<Option<LockRow>> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT stack, lock_id, lock_holder, lock_run_id, locked_at
            FROM stack_state
            WHERE stack = $1
            "#,
        )
        .bind(stack)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn try_lock(&self, lease: &StateLease) -> DbResult<StateLease> {
        let lock = lease.lock();
        sqlx::query(
            r#"
            INSERT INTO stack_state (stack)
            VALUES ($1)
            ON CONFLICT (stack) DO NOTHING
            "#,
        )
        .bind(&lock.stack)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE stack_state
            SET lock_id = $2, lock_holder = $3, lock_run_id = $4, locked_at = $5
            WHERE stack = $1 AND lock_id IS NULL
            "#,
        )
        .bind(&lock.stack)
        .bind(&lock.lock_id)
        .bind(&lock.holder)
        .bind(lock.run_id.as_uuid())
        .bind(lock.acquired_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(stack = %lock.stack, holder = %lock.holder, "Acquired stack lock");
            return Ok(lease.clone());
        }

        match self.lock_row(&lock.stack).await?.and_then(LockRow::into_lock) {
            Some(held) => Err(lock_conflict(&held)),
            None => Err(DbError::Conflict(format!(
                "stack '{}' was locked concurrently",
                lock.stack
            ))),
        }
    }

    async fn release(&self, lease: &StateLease) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stack_state
            SET lock_id = NULL, lock_holder = NULL, lock_run_id = NULL, locked_at = NULL
            WHERE stack = $1 AND lock_id = $2
            "#,
        )
        .bind(lease.stack())
        .bind(lease.lock_id())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Conflict(format!(
                "lease on stack '{}' is no longer held",
                lease.stack()
            )));
        }
        Ok(())
    }

    async fn clear_lock(&self, stack: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stack_state
            SET lock_id = NULL, lock_holder = NULL, lock_run_id = NULL, locked_at = NULL
            WHERE stack = $1 AND lock_id IS NOT NULL
            "#,
        )
        .bind(stack)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_state(&self, stack: &str) -> DbResult<Option<StackState>> {
        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
            r#"
            SELECT state_json FROM stack_state WHERE stack = $1
            "#,
        )
        .bind(stack)
        .fetch_optional(&self.pool)
        .await?;

        match row.and_then(|(json,)| json) {
            Some(json) => serde_json::from_value(json)
                .map(Some)
                .map_err(|e| DbError::InvalidData(format!("state of stack '{stack}': {e}"))),
            None => Ok(None),
        }
    }

    async fn save_state(&self, lease: &StateLease, state: &StackState) -> DbResult<StackState> {
        let mut saved = state.clone();
        saved.version = state.version + 1;
        saved.updated_at = Utc::now();
        let json = serde_json::to_value(&saved)
            .map_err(|e| DbError::InvalidData(format!("state of stack '{}': {e}", lease.stack())))?;

        let result = sqlx::query(
            r#"
            UPDATE stack_state
            SET state_json = $3, version = $4, updated_at = NOW()
            WHERE stack = $1 AND lock_id = $2 AND version = $5
            "#,
        )
        .bind(lease.stack())
        .bind(lease.lock_id())
        .bind(&json)
        .bind(to_db_version(saved.version)?)
        .bind(to_db_version(state.version)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let row = sqlx::query_as::<_, VersionRow>(
                r#"
                SELECT version, lock_id FROM stack_state WHERE stack = $1
                "#,
            )
            .bind(lease.stack())
            .fetch_optional(&self.pool)
            .await?;
            let err = save_rejection(lease.stack(), lease.lock_id(), row, state.version);
            warn!(stack = %lease.stack(), error = %err, "Rejected state save");
            return Err(err);
        }

        debug!(stack = %lease.stack(), version = saved.version, "Saved stack state");
        Ok(saved)
    }

    async fn stack_names(&self) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stack FROM stack_state
            WHERE state_json IS NOT NULL
            ORDER BY stack
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(stack,)| stack).collect())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn lock(&self, stack: &str, run_id: RunId, holder: &str) -> Result<StateLease> {
        let lease = StateLease::request(stack, run_id, holder);
        Ok(self.try_lock(&lease).await?)
    }

    async fn unlock(&self, lease: StateLease) -> Result<()> {
        Ok(self.release(&lease).await?)
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        let cleared = self.clear_lock(stack).await?;
        if cleared {
            info!(stack, "Force-unlocked stack");
        }
        Ok(cleared)
    }

    async fn current_lock(&self, stack: &str) -> Result<Option<StateLock>> {
        Ok(self.lock_row(stack).await?.and_then(LockRow::into_lock))
    }

    async fn load(&self, stack: &str) -> Result<Option<StackState>> {
        Ok(self.load_state(stack).await?)
    }

    async fn save(&self, lease: &StateLease, state: &StackState) -> Result<StackState> {
        Ok(self.save_state(lease, state).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.stack_names().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(lock_id: Option<&str>) -> LockRow {
        LockRow {
            stack: "database".into(),
            lock_id: lock_id.map(String::from),
            lock_holder: lock_id.map(|_| "ops@laptop".to_string()),
            lock_run_id: lock_id.map(|_| Uuid::now_v7()),
            locked_at: lock_id.map(|_| Utc::now()),
        }
    }

    #[test]
    fn test_lock_row_conversion() {
        assert!(row(None).into_lock().is_none());

        let lock = row(Some("abc")).into_lock().unwrap();
        assert_eq!(lock.lock_id, "abc");
        assert_eq!(lock.stack, "database");
        assert!(lock_conflict(&lock).to_string().contains("ops@laptop"));
    }

    #[test]
    fn test_save_rejection_reasons() {
        let not_held = save_rejection(
            "database",
            "mine",
            Some(VersionRow {
                version: 3,
                lock_id: Some("theirs".into()),
            }),
            3,
        );
        assert!(not_held.to_string().contains("without holding its lock"));

        let stale = save_rejection(
            "database",
            "mine",
            Some(VersionRow {
                version: 4,
                lock_id: Some("mine".into()),
            }),
            3,
        );
        assert!(stale.to_string().contains("stored version 4, saving from version 3"));

        let missing = save_rejection("database", "mine", None, 0);
        assert!(matches!(missing, DbError::Conflict(_)));
    }

    #[test]
    fn test_version_range() {
        assert_eq!(to_db_version(7).unwrap(), 7);
        assert!(to_db_version(u64::MAX).is_err());
    }
}
