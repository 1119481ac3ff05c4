//! Consecutive-failure lockout for operator authentication.
//!
//! The state transitions are pure functions over `LockoutState` plus a
//! timestamp; [`LockoutEngine`] applies them under the config store's lock so
//! every change lands on disk atomically with the rest of the config.

use crate::config::ConfigStore;
use chrono::{DateTime, TimeDelta, Utc};
use p2prd_protocol::LockoutState;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_ATTEMPTS: u32 = 5;

pub fn lockout_window() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// Register one failed attempt. The threshold failure converts the counter
/// into a lock: `failed_attempts` resets to 0 and `locked_until` is armed, so
/// the persisted counter never reaches `MAX_ATTEMPTS`.
pub fn apply_failure(state: &mut LockoutState, now: DateTime<Utc>) {
    state.failed_attempts += 1;
    if state.failed_attempts >= MAX_ATTEMPTS {
        state.failed_attempts = 0;
        state.locked_until = Some(now + lockout_window());
    }
}

/// Successful authentication clears both fields.
pub fn apply_success(state: &mut LockoutState) {
    state.failed_attempts = 0;
    state.locked_until = None;
}

/// Remaining lock duration, or `None` when not locked. An expired
/// `locked_until` counts as not locked.
pub fn remaining_lock(state: &LockoutState, now: DateTime<Utc>) -> Option<TimeDelta> {
    let until = state.locked_until?;
    let left = until - now;
    (left > TimeDelta::zero()).then_some(left)
}

/// Clear an elapsed lock in place. Returns true if anything changed.
pub fn clear_if_expired(state: &mut LockoutState, now: DateTime<Utc>) -> bool {
    if state.locked_until.is_some() && remaining_lock(state, now).is_none() {
        state.locked_until = None;
        state.failed_attempts = 0;
        return true;
    }
    false
}

/// Persistent lockout operations bound to the config store.
#[derive(Clone)]
pub struct LockoutEngine {
    store: Arc<ConfigStore>,
}

impl LockoutEngine {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Record a failure. Returns the retry delay in milliseconds when this
    /// failure armed the lock.
    pub fn register_failure(&self) -> Option<u64> {
        let now = Utc::now();
        let updated = self
            .store
            .update(|c| apply_failure(&mut c.lockout, now))
            .map_err(|e| warn!("Failed to persist lockout state: {e:#}"))
            .ok()?;
        let remaining = remaining_lock(&updated.lockout, now)?;
        warn!(
            retry_after_ms = remaining.num_milliseconds(),
            "Authentication locked out after repeated failures"
        );
        Some(remaining.num_milliseconds().max(0) as u64)
    }

    pub fn register_success(&self) {
        if let Err(e) = self.store.update(|c| apply_success(&mut c.lockout)) {
            warn!("Failed to clear lockout state: {e:#}");
        }
    }

    /// Active lock check. Opportunistically clears an expired lock so the
    /// persisted state self-heals without waiting for the next auth success.
    pub fn is_locked(&self) -> Option<u64> {
        let now = Utc::now();
        let state = self.store.snapshot().lockout;
        if let Some(left) = remaining_lock(&state, now) {
            return Some(left.num_milliseconds().max(0) as u64);
        }
        if state.locked_until.is_some() {
            info!("Lockout window elapsed, clearing");
            let _ = self
                .store
                .update(|c| {
                    clear_if_expired(&mut c.lockout, now);
                })
                .map_err(|e| warn!("Failed to clear expired lockout: {e:#}"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn under_threshold_never_locks() {
        let mut state = LockoutState::default();
        for i in 1..MAX_ATTEMPTS {
            apply_failure(&mut state, at(0));
            assert_eq!(state.failed_attempts, i);
            assert!(remaining_lock(&state, at(0)).is_none());
        }
    }

    #[test]
    fn threshold_failure_arms_lock_and_resets_counter() {
        let mut state = LockoutState::default();
        for _ in 0..MAX_ATTEMPTS {
            apply_failure(&mut state, at(0));
        }
        assert_eq!(state.failed_attempts, 0);
        assert_eq!(state.locked_until, Some(at(0) + lockout_window()));
        assert_eq!(
            remaining_lock(&state, at(0)),
            Some(lockout_window())
        );
    }

    #[test]
    fn lock_counts_down_and_expires() {
        let mut state = LockoutState::default();
        for _ in 0..MAX_ATTEMPTS {
            apply_failure(&mut state, at(0));
        }
        // Partway through the window the remainder has shrunk by the elapsed time.
        assert_eq!(
            remaining_lock(&state, at(120)),
            Some(lockout_window() - TimeDelta::seconds(120))
        );
        // Just past the window it reads as unlocked.
        assert!(remaining_lock(&state, at(301)).is_none());
    }

    #[test]
    fn expired_lock_self_heals() {
        let mut state = LockoutState::default();
        for _ in 0..MAX_ATTEMPTS {
            apply_failure(&mut state, at(0));
        }
        assert!(!clear_if_expired(&mut state, at(299)));
        assert!(state.locked_until.is_some());
        assert!(clear_if_expired(&mut state, at(301)));
        assert!(state.locked_until.is_none());
        assert_eq!(state.failed_attempts, 0);
    }

    #[test]
    fn success_clears_everything() {
        let mut state = LockoutState::default();
        apply_failure(&mut state, at(0));
        apply_failure(&mut state, at(1));
        apply_success(&mut state);
        assert_eq!(state, LockoutState::default());
    }

    #[test]
    fn failures_after_expiry_restart_the_count() {
        let mut state = LockoutState::default();
        for _ in 0..MAX_ATTEMPTS {
            apply_failure(&mut state, at(0));
        }
        clear_if_expired(&mut state, at(400));
        apply_failure(&mut state, at(400));
        assert_eq!(state.failed_attempts, 1);
        assert!(state.locked_until.is_none());
    }
}
