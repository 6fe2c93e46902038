use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Temporary ban on new entries for a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairLock {
    pub pair: String,
    pub lock_time: DateTime<Utc>,
    pub lock_end_time: DateTime<Utc>,
    pub reason: Option<String>,
}

impl PairLock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.lock_end_time
    }
}

/// Pair locks of one engine instance, oldest first per pair
#[derive(Debug, Clone, Default)]
pub struct PairLocks {
    locks: BTreeMap<String, Vec<PairLock>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `pair` from `now` for `minutes`
    pub fn lock_pair(
        &mut self,
        pair: &str,
        now: DateTime<Utc>,
        minutes: i64,
        reason: Option<&str>,
    ) -> PairLock {
        let lock = PairLock {
            pair: pair.to_string(),
            lock_time: now,
            lock_end_time: now + Duration::minutes(minutes),
            reason: reason.map(str::to_string),
        };
        tracing::info!(
            "🔒 Locking {} until {} ({})",
            pair,
            lock.lock_end_time,
            reason.unwrap_or("no reason")
        );
        self.locks.entry(pair.to_string()).or_default().push(lock.clone());
        lock
    }

    pub fn is_pair_locked(&self, pair: &str, now: DateTime<Utc>) -> bool {
        self.locks
            .get(pair)
            .is_some_and(|locks| locks.iter().any(|l| l.is_active(now)))
    }

    /// End all active locks for `pair` at `now`
    pub fn unlock_pair(&mut self, pair: &str, now: DateTime<Utc>) {
        if let Some(locks) = self.locks.get_mut(pair) {
            for lock in locks.iter_mut().filter(|l| l.is_active(now)) {
                lock.lock_end_time = now;
            }
        }
    }

    /// All locks ever set, ordered by pair then lock time
    pub fn all_locks(&self) -> Vec<PairLock> {
        self.locks.values().flatten().cloned().collect()
    }
}
