// File: portal-sync/src/rate_limiter.rs
// Purpose: Fixed-window request limiting with a full-window block on violation

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{to_std, Clock};
use crate::config::RateLimitConfig;
use crate::error::{Result, SyncError};

/// At most `max_requests` calls per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn chrono_window(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

/// Answer to a single `check`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Calls left in the current window
    pub remaining: u32,
    /// Time until the window resets or the block lifts
    pub reset_in: Duration,
}

#[derive(Debug, Clone)]
struct WindowState {
    count: u32,
    window_start: DateTime<Utc>,
    window: ChronoDuration,
    blocked_until: Option<DateTime<Utc>>,
}

impl WindowState {
    fn fresh(now: DateTime<Utc>, rule: &RateLimitRule) -> Self {
        Self {
            count: 0,
            window_start: now,
            window: rule.chrono_window(),
            blocked_until: None,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => now - self.window_start >= self.window,
        }
    }
}

/// Per-key request limiter
///
/// Exceeding a limit blocks the key for one whole window counted from the
/// violation, even if the current window would have reset sooner. Calls made
/// while blocked are refused without extending the block.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    rules: RateLimitConfig,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_rules(clock, RateLimitConfig::default())
    }

    /// Limiter that knows the named rules (`login`, `export`, ...)
    pub fn with_rules(clock: Arc<dyn Clock>, rules: RateLimitConfig) -> Self {
        Self {
            clock,
            rules,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one call against `key`
    pub fn check(&self, key: &str, rule: RateLimitRule) -> RateLimitDecision {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let state = windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState::fresh(now, &rule));

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_in: to_std(until - now),
                };
            }
        }
        // The rule in force decides when the window ends
        state.window = rule.chrono_window();
        if state.is_stale(now) {
            *state = WindowState::fresh(now, &rule);
        }

        state.count += 1;
        if state.count > rule.max_requests {
            state.blocked_until = Some(now + rule.chrono_window());
            tracing::warn!("Rate limit exceeded for '{}', blocked for {}ms", key, rule.window_ms);
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_in: rule.window(),
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: rule.max_requests - state.count,
            reset_in: to_std(state.window_start + state.window - now),
        }
    }

    /// Like `check`, but a refusal is an error
    pub fn enforce(&self, key: &str, rule: RateLimitRule) -> Result<RateLimitDecision> {
        let decision = self.check(key, rule);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(SyncError::RateLimitExceeded {
                key: key.to_string(),
                reset_in: decision.reset_in,
            })
        }
    }

    /// Check a call against a named rule, keyed per subject (user, address)
    pub fn check_named(&self, name: &str, subject: &str) -> Result<RateLimitDecision> {
        let rule = self
            .rules
            .rule(name)
            .ok_or_else(|| SyncError::Validation(format!("unknown rate limit '{}'", name)))?;
        Ok(self.check(&format!("{}:{}", name, subject), rule))
    }

    pub fn enforce_named(&self, name: &str, subject: &str) -> Result<RateLimitDecision> {
        let rule = self
            .rules
            .rule(name)
            .ok_or_else(|| SyncError::Validation(format!("unknown rate limit '{}'", name)))?;
        self.enforce(&format!("{}:{}", name, subject), rule)
    }

    /// Forget a key, lifting any block (e.g. after a successful login)
    pub fn reset(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    /// Drop keys whose window and block have both run out
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, state| !state.is_stale(now));
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn dispose(&self) {
        self.windows.lock().clear();
    }
}
