//! Attempt counter that throttles unprivileged booking creation and admin
//! token guessing.
//!
//! One `RateLimiter` is created per process and shared (`Arc`) by every
//! connection handler, so all workers see the same counters. The clock is
//! passed in by the caller.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::limits::MAX_RATE_LIMIT_KEYS;
use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub max_attempts: u32,
    pub window_ms: Ms,
    pub lockout_ms: Ms,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_ms: 10 * 60_000,
            lockout_ms: 15 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_ms: Ms },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Ms,
    attempts: u32,
    locked_until: Option<Ms>,
}

impl Window {
    fn fresh(now: Ms) -> Self {
        Self {
            started_at: now,
            attempts: 0,
            locked_until: None,
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt for `key`. Once more than `max_attempts` land inside
    /// one window the key is locked for `lockout_ms`; when the lockout ends
    /// counting restarts from zero.
    pub fn check(&self, key: &str, policy: &RatePolicy, now: Ms) -> RateDecision {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::fresh(now));
        let w = entry.value_mut();

        if let Some(until) = w.locked_until {
            if now < until {
                return RateDecision::Limited {
                    retry_after_ms: until - now,
                };
            }
            *w = Window::fresh(now);
        }

        if now - w.started_at >= policy.window_ms {
            *w = Window::fresh(now);
        }

        w.attempts += 1;
        if w.attempts > policy.max_attempts {
            let until = now + policy.lockout_ms;
            w.locked_until = Some(until);
            return RateDecision::Limited {
                retry_after_ms: policy.lockout_ms,
            };
        }
        RateDecision::Allowed {
            remaining: policy.max_attempts - w.attempts,
        }
    }

    /// Time left on `key`'s lockout, without counting an attempt.
    pub fn locked_for(&self, key: &str, now: Ms) -> Option<Ms> {
        let w = self.windows.get(key)?;
        w.locked_until.filter(|&until| now < until).map(|until| until - now)
    }

    /// Drop keys whose window and lockout have both lapsed. Returns how many were removed.
    pub fn sweep(&self, policy: &RatePolicy, now: Ms) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| match w.locked_until {
            Some(until) => now < until,
            None => now - w.started_at < policy.window_ms,
        });
        if self.windows.len() > MAX_RATE_LIMIT_KEYS {
            // Still over budget: keep only locked keys.
            self.windows.retain(|_, w| w.locked_until.is_some());
        }
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
