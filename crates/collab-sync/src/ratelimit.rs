//! Per-connection token buckets, one per action type.
//!
//! Buckets live in process memory only. A connection is served by exactly one
//! node, so no cross-node coordination is needed; state is rebuilt from empty
//! after a restart.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimit;
use crate::protocol::ActionType;
use crate::{SyncError, SyncResult};

#[derive(Debug, Clone)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    limit: u32,
    refill_interval: Duration,
}

impl Bucket {
    fn full(limit: RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.limit,
            last_refill: now,
            limit: limit.limit,
            refill_interval: limit.refill_interval(),
        }
    }

    /// Add whole intervals' worth of tokens and advance the refill mark by
    /// exactly those intervals, so partial intervals are never lost
    fn refill(&mut self, now: Instant) {
        if self.refill_interval.is_zero() {
            self.tokens = self.limit;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(self.limit as u128);
        self.tokens = (self.tokens as u128 + added).min(self.limit as u128) as u32;
        let steps = u32::try_from(intervals).unwrap_or(u32::MAX);
        self.last_refill += self.refill_interval * steps;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    limits: HashMap<ActionType, RateLimit>,
    buckets: DashMap<(String, ActionType), Bucket>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<ActionType, RateLimit>) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
        }
    }

    /// Admit or reject one action for a connection
    pub fn check(&self, connection_id: &str, action: ActionType) -> SyncResult<()> {
        self.check_at(connection_id, action, Instant::now())
    }

    pub fn check_at(&self, connection_id: &str, action: ActionType, now: Instant) -> SyncResult<()> {
        let Some(limit) = self.limits.get(&action).copied() else {
            return Ok(());
        };

        let admitted = self
            .buckets
            .entry((connection_id.to_string(), action))
            .or_insert_with(|| Bucket::full(limit, now))
            .try_take(now);

        if admitted {
            Ok(())
        } else {
            debug!(
                "Rate limited {} for connection {}",
                action.as_str(),
                connection_id
            );
            Err(SyncError::RateLimited {
                action: action.as_str().to_string(),
            })
        }
    }

    /// Drop all buckets of a closed connection
    pub fn forget(&self, connection_id: &str) {
        self.buckets.retain(|(conn, _), _| conn != connection_id);
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }
}
