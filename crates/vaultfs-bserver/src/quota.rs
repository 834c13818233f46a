//! Per-user usage accounting for the local block stores.
//!
//! Every live reference charges its writer the block's ciphertext length.
//! With a limit configured, a charge that would exceed it is rejected before
//! any state changes.

use std::collections::HashMap;

use crate::block::UserId;
use crate::error::{BlockServerError, BlockServerResult};

/// Bytes charged to each user.
#[derive(Debug, Clone, Default)]
pub struct QuotaLedger {
    usage: HashMap<UserId, u64>,
    limit: Option<u64>,
}

impl QuotaLedger {
    /// Create a ledger; `limit` applies to every user.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            usage: HashMap::new(),
            limit,
        }
    }

    /// Bytes currently charged to `user`.
    pub fn used(&self, user: &str) -> u64 {
        self.usage.get(user).copied().unwrap_or(0)
    }

    /// Fail with `QuotaExceeded` if charging `bytes` would put `user` over
    /// the limit.
    pub fn check(&self, user: &str, bytes: u64) -> BlockServerResult<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        let used = self.used(user);
        if used.saturating_add(bytes) > limit {
            tracing::warn!(user = %user, used, bytes, limit, "quota exceeded");
            return Err(BlockServerError::QuotaExceeded {
                user: user.to_string(),
                used,
                limit,
            });
        }
        Ok(())
    }

    /// Record `bytes` against `user`. Does not check the limit.
    pub fn charge(&mut self, user: &str, bytes: u64) {
        let used = self.usage.entry(user.to_string()).or_insert(0);
        *used = used.saturating_add(bytes);
    }

    /// Return `bytes` to `user`.
    pub fn refund(&mut self, user: &str, bytes: u64) {
        if let Some(used) = self.usage.get_mut(user) {
            *used = used.saturating_sub(bytes);
            if *used == 0 {
                self.usage.remove(user);
            }
        }
    }

    /// Drop all usage, keeping the limit.
    pub fn clear(&mut self) {
        self.usage.clear();
    }
}
