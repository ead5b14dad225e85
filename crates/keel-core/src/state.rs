//! State store abstraction.
//!
//! Every mutating run holds an exclusive [`StateLease`] on its stack for its
//! whole duration. Saves are rejected unless the caller holds the lease and
//! has seen the latest version.

use async_trait::async_trait;
use chrono::Utc;

use crate::stack::{StackState, StateLock};
use crate::{Result, RunId};

/// Proof of holding the exclusive lock on one stack's state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateLease {
    lock: StateLock,
}

impl StateLease {
    /// A fresh lease request; stores decide whether it is granted.
    pub fn request(stack: &str, run_id: RunId, holder: &str) -> Self {
        Self {
            lock: StateLock {
                lock_id: uuid::Uuid::now_v7().to_string(),
                stack: stack.to_string(),
                run_id,
                holder: holder.to_string(),
                acquired_at: Utc::now(),
            },
        }
    }

    pub fn from_lock(lock: StateLock) -> Self {
        Self { lock }
    }

    pub fn stack(&self) -> &str {
        &self.lock.stack
    }

    pub fn lock_id(&self) -> &str {
        &self.lock.lock_id
    }

    pub fn lock(&self) -> &StateLock {
        &self.lock
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Acquire the exclusive lease, failing with `Conflict` if held.
    async fn lock(&self, stack: &str, run_id: RunId, holder: &str) -> Result<StateLease>;

    /// Release a lease. Releasing a lease that is no longer held is an error.
    async fn unlock(&self, lease: StateLease) -> Result<()>;

    /// Break any lock on the stack. Returns whether one was held.
    async fn force_unlock(&self, stack: &str) -> Result<bool>;

    async fn current_lock(&self, stack: &str) -> Result<Option<StateLock>>;

    async fn load(&self, stack: &str) -> Result<Option<StackState>>;

    /// Persist `state`, whose `version` must equal the stored version (0
    /// when nothing is stored). Returns the saved state with the version
    /// incremented.
    async fn save(&self, lease: &StateLease, state: &StackState) -> Result<StackState>;

    async fn list(&self) -> Result<Vec<String>>;
}
