//! Shared resilience utilities for external calls.
//!
//! Token-bucket rate limiting, a three-state circuit breaker, and the
//! retry policies used around the SMS gateway and LLM clients. State is
//! explicit and constructor-injected; nothing here is a module global.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Token-bucket limiter for a named resource: at most `max_calls`
/// within any sliding `period`.
#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    max_calls: usize,
    period: Duration,
    calls: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, max_calls: usize, period: Duration) -> Self {
        Self {
            name,
            max_calls: max_calls.max(1),
            period,
            calls: Arc::new(Mutex::new(VecDeque::with_capacity(max_calls.max(1)))),
        }
    }

    /// Limiter sized from a messages-per-second budget.
    pub fn per_second(name: &'static str, messages_per_second: f64) -> Self {
        // Sub-1/s budgets widen the window instead of rounding to zero.
        if messages_per_second >= 1.0 {
            Self::new(name, messages_per_second.floor() as usize, Duration::from_secs(1))
        } else {
            let period = Duration::from_secs_f64(1.0 / messages_per_second.max(0.01));
            Self::new(name, 1, period)
        }
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= self.period {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a call may run right now.
    pub fn can_proceed(&self) -> bool {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        self.prune(&mut calls, now);
        calls.len() < self.max_calls
    }

    /// Time until the next slot frees up (zero when a slot is open).
    pub fn wait_time(&self) -> Duration {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        self.prune(&mut calls, now);
        if calls.len() < self.max_calls {
            return Duration::ZERO;
        }
        match calls.front() {
            Some(front) => self.period.saturating_sub(now.duration_since(*front)),
            None => Duration::ZERO,
        }
    }

    /// Consume a token.
    pub fn record_call(&self) {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        self.prune(&mut calls, now);
        calls.push_back(now);
    }

    /// Wait (bounded) for a slot, then consume it.
    pub async fn acquire(&self, max_wait: Duration) {
        if !self.can_proceed() {
            let wait = self.wait_time().min(max_wait);
            if !wait.is_zero() {
                debug!(limiter = self.name, wait_ms = wait.as_millis() as u64, "rate limit wait");
                tokio::time::sleep(wait).await;
            }
        }
        self.record_call();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker per named external service.
///
/// closed → open after `failure_threshold` consecutive failures;
/// open → half-open after `recovery_timeout`; the next call is a probe.
/// Probe success closes the circuit, probe failure re-opens it with a
/// fresh timer.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    debug!(breaker = self.name, "circuit half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            debug!(breaker = self.name, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = self.name, "probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

/// Backoff policy for retried external calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
    pub randomized: bool,
}

impl RetryPolicy {
    /// General transient failures: 1s base, 10s cap, 3 attempts.
    pub fn general() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            randomized: false,
        }
    }

    /// Rate-limit responses: random exponential, 5 attempts, 60s cap.
    pub fn rate_limit() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            randomized: true,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        if self.randomized {
            let max_secs = exp.as_secs_f64().max(0.001);
            let jittered = rand::thread_rng().gen_range(0.0..max_secs);
            Duration::from_secs_f64(jittered)
        } else {
            exp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_under_limit() {
        let limiter = RateLimiter::new("test", 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.can_proceed());
            limiter.record_call();
        }
        assert!(!limiter.can_proceed());
        assert!(limiter.wait_time() > Duration::ZERO);
    }

    #[test]
    fn rate_limiter_per_second_sizing() {
        let fast = RateLimiter::per_second("fast", 5.0);
        assert_eq!(fast.max_calls, 5);
        let slow = RateLimiter::per_second("slow", 0.5);
        assert_eq!(slow.max_calls, 1);
        assert_eq!(slow.period, Duration::from_secs(2));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_millis(50));
        assert!(breaker.can_execute());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn breaker_half_open_probe() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(15));
        // Recovery timeout elapsed: probe allowed.
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Probe failure re-opens with fresh timer.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn retry_policy_delays() {
        let policy = RetryPolicy::general();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));

        let rl = RetryPolicy::rate_limit();
        for attempt in 1..=5 {
            assert!(rl.delay_for(attempt) <= Duration::from_secs(60));
        }
    }
}
