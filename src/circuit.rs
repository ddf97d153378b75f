//! Per-provider circuit breaker.
//!
//! Tracks health per `(cli_key, provider_id)` pair. State moves lazily:
//! there is no background timer, an OPEN circuit closes on the first access
//! at or after `open_until`. A short cooldown window (set after stream
//! errors) skips a provider without affecting the OPEN state machine.
//! All entry points take `now_unix` explicitly so tests control the clock.

use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_DURATION_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration_secs: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration_secs: DEFAULT_OPEN_DURATION_SECS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &crate::config::GatewaySettings) -> Self {
        Self {
            failure_threshold: settings.circuit_breaker_failure_threshold,
            open_duration_secs: i64::from(settings.circuit_breaker_open_duration_minutes) * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_until: Option<i64>,
    pub cooldown_until: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CircuitTransition {
    pub prev_state: CircuitState,
    pub next_state: CircuitState,
    pub reason: &'static str,
    pub snapshot: CircuitSnapshot,
}

#[derive(Debug, Clone)]
pub struct CircuitChange {
    pub before: CircuitSnapshot,
    pub after: CircuitSnapshot,
    pub transition: Option<CircuitTransition>,
}

#[derive(Debug, Clone)]
pub struct CircuitCheck {
    pub allow: bool,
    pub after: CircuitSnapshot,
    pub transition: Option<CircuitTransition>,
}

#[derive(Debug, Clone)]
struct ProviderHealth {
    state: CircuitState,
    failure_count: u32,
    open_until: Option<i64>,
    cooldown_until: Option<i64>,
    updated_at: i64,
}

impl ProviderHealth {
    fn closed(now_unix: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            open_until: None,
            cooldown_until: None,
            updated_at: now_unix,
        }
    }
}

type CircuitKey = (String, i64);

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    health: Mutex<HashMap<CircuitKey, ProviderHealth>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            health: Mutex::new(HashMap::new()),
        }
    }

    fn key(cli_key: &str, provider_id: i64) -> CircuitKey {
        (cli_key.to_string(), provider_id)
    }

    pub fn snapshot(&self, cli_key: &str, provider_id: i64, now_unix: i64) -> CircuitSnapshot {
        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));
        self.snapshot_from_health(entry)
    }

    /// Gate check before an attempt. Expires a stale OPEN state in place and
    /// reports the transition so the caller can emit a circuit event.
    pub fn should_allow(&self, cli_key: &str, provider_id: i64, now_unix: i64) -> CircuitCheck {
        let mut transition: Option<CircuitTransition> = None;

        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));

        if let Some(until) = entry.cooldown_until {
            if now_unix >= until {
                entry.cooldown_until = None;
            }
        }

        if entry.state == CircuitState::Open {
            let expired = entry.open_until.map(|t| now_unix >= t).unwrap_or(true);
            if expired {
                let prev = entry.state;
                entry.state = CircuitState::Closed;
                entry.failure_count = 0;
                entry.open_until = None;
                entry.updated_at = now_unix;

                transition = Some(CircuitTransition {
                    prev_state: prev,
                    next_state: entry.state,
                    reason: "OPEN_EXPIRED",
                    snapshot: self.snapshot_from_health(entry),
                });
            }
        }

        let after = self.snapshot_from_health(entry);
        let cooldown_active = entry.cooldown_until.map(|t| now_unix < t).unwrap_or(false);
        let allow = entry.state != CircuitState::Open && !cooldown_active;

        CircuitCheck {
            allow,
            after,
            transition,
        }
    }

    /// A success in CLOSED clears the failure streak and any cooldown.
    /// A success while OPEN changes nothing: only expiry or reset closes it.
    pub fn record_success(&self, cli_key: &str, provider_id: i64, now_unix: i64) -> CircuitChange {
        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));

        let before = self.snapshot_from_health(entry);

        if entry.state == CircuitState::Closed {
            entry.cooldown_until = None;
            if entry.failure_count != 0 {
                entry.failure_count = 0;
                entry.updated_at = now_unix;
            }
        }

        let after = self.snapshot_from_health(entry);
        CircuitChange {
            before,
            after,
            transition: None,
        }
    }

    pub fn record_failure(&self, cli_key: &str, provider_id: i64, now_unix: i64) -> CircuitChange {
        let mut transition: Option<CircuitTransition> = None;

        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));

        let before = self.snapshot_from_health(entry);

        if entry.state == CircuitState::Closed {
            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.updated_at = now_unix;

            if entry.failure_count >= self.config.failure_threshold {
                let prev = entry.state;
                entry.state = CircuitState::Open;
                entry.open_until = Some(now_unix.saturating_add(self.config.open_duration_secs));

                transition = Some(CircuitTransition {
                    prev_state: prev,
                    next_state: entry.state,
                    reason: "FAILURE_THRESHOLD_REACHED",
                    snapshot: self.snapshot_from_health(entry),
                });
            }
        }

        let after = self.snapshot_from_health(entry);
        CircuitChange {
            before,
            after,
            transition,
        }
    }

    /// Extends (never shortens) the cooldown window for a provider. Used
    /// after mid-stream errors where a failed attempt was already relayed to
    /// the client and retrying the same provider immediately would be wasted.
    pub fn trigger_cooldown(
        &self,
        cli_key: &str,
        provider_id: i64,
        now_unix: i64,
        cooldown_secs: i64,
    ) -> CircuitSnapshot {
        let cooldown_secs = cooldown_secs.max(0);
        if provider_id <= 0 || cooldown_secs == 0 {
            return self.snapshot(cli_key, provider_id, now_unix);
        }

        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));

        let next_until = now_unix.saturating_add(cooldown_secs);
        entry.cooldown_until = Some(match entry.cooldown_until {
            Some(existing) => existing.max(next_until),
            None => next_until,
        });
        entry.updated_at = now_unix;

        self.snapshot_from_health(entry)
    }

    /// Manual reset back to a clean CLOSED state.
    pub fn reset(&self, cli_key: &str, provider_id: i64, now_unix: i64) -> CircuitSnapshot {
        if provider_id <= 0 {
            return CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                failure_threshold: self.config.failure_threshold,
                open_until: None,
                cooldown_until: None,
            };
        }

        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(Self::key(cli_key, provider_id))
            .or_insert_with(|| ProviderHealth::closed(now_unix));

        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.open_until = None;
        entry.cooldown_until = None;
        entry.updated_at = now_unix;

        self.snapshot_from_health(entry)
    }

    fn snapshot_from_health(&self, health: &ProviderHealth) -> CircuitSnapshot {
        CircuitSnapshot {
            state: health.state,
            failure_count: health.failure_count,
            failure_threshold: self.config.failure_threshold,
            open_until: health.open_until,
            cooldown_until: health.cooldown_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn closed_to_open_after_threshold() {
        let cb = breaker();
        let now = 1_000;
        for i in 1..=DEFAULT_FAILURE_THRESHOLD {
            let change = cb.record_failure("claude", 1, now + i as i64);
            if i < DEFAULT_FAILURE_THRESHOLD {
                assert_eq!(change.after.state, CircuitState::Closed);
            } else {
                let t = change.transition.expect("transition at threshold");
                assert_eq!(t.reason, "FAILURE_THRESHOLD_REACHED");
            }
        }

        let snap = cb.snapshot("claude", 1, now + 100);
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.open_until.is_some());
    }

    #[test]
    fn open_expires_to_closed_on_access() {
        let cb = breaker();
        let now = 1_000;
        for i in 1..=DEFAULT_FAILURE_THRESHOLD {
            cb.record_failure("claude", 1, now + i as i64);
        }

        let snap = cb.snapshot("claude", 1, now + 10);
        assert_eq!(snap.state, CircuitState::Open);
        let open_until = snap.open_until.expect("open_until");

        let check = cb.should_allow("claude", 1, open_until - 1);
        assert!(!check.allow);
        assert!(check.transition.is_none());

        let check = cb.should_allow("claude", 1, open_until);
        assert!(check.allow);
        assert_eq!(check.after.state, CircuitState::Closed);
        assert_eq!(
            check.transition.expect("OPEN_EXPIRED transition").reason,
            "OPEN_EXPIRED"
        );
    }

    #[test]
    fn success_clears_failure_count_and_cooldown() {
        let cb = breaker();
        let now = 1_000;
        cb.record_failure("claude", 1, now);
        cb.trigger_cooldown("claude", 1, now, 30);

        cb.record_success("claude", 1, now + 2);
        let after = cb.snapshot("claude", 1, now + 3);
        assert_eq!(after.failure_count, 0);
        assert_eq!(after.state, CircuitState::Closed);
        assert!(after.cooldown_until.is_none());
    }

    #[test]
    fn cooldown_skips_without_opening() {
        let cb = breaker();
        let now = 1_000;
        let snap = cb.trigger_cooldown("claude", 1, now, 30);
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.cooldown_until, Some(now + 30));

        assert!(!cb.should_allow("claude", 1, now + 29).allow);
        assert!(cb.should_allow("claude", 1, now + 30).allow);
    }

    #[test]
    fn cooldown_never_shortens() {
        let cb = breaker();
        let now = 1_000;
        cb.trigger_cooldown("claude", 1, now, 60);
        let snap = cb.trigger_cooldown("claude", 1, now + 1, 10);
        assert_eq!(snap.cooldown_until, Some(now + 60));
    }

    #[test]
    fn failures_are_scoped_per_cli_key() {
        let cb = breaker();
        let now = 1_000;
        for i in 1..=DEFAULT_FAILURE_THRESHOLD {
            cb.record_failure("claude", 1, now + i as i64);
        }

        assert_eq!(
            cb.snapshot("claude", 1, now + 10).state,
            CircuitState::Open
        );
        assert_eq!(
            cb.snapshot("codex", 1, now + 10).state,
            CircuitState::Closed
        );
    }

    #[test]
    fn reset_clears_open_and_cooldown() {
        let cb = breaker();
        let now = 1_000;
        for i in 1..=DEFAULT_FAILURE_THRESHOLD {
            cb.record_failure("claude", 1, now + i as i64);
        }
        cb.trigger_cooldown("claude", 1, now + 6, 30);

        let reset = cb.reset("claude", 1, now + 20);
        assert_eq!(reset.state, CircuitState::Closed);
        assert_eq!(reset.failure_count, 0);
        assert!(reset.open_until.is_none());
        assert!(reset.cooldown_until.is_none());

        assert!(cb.should_allow("claude", 1, now + 21).allow);
    }
}
