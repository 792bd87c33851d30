//! Per-agent circuit breaker.
//!
//! Counts processed messages and failures; once enough messages have been
//! seen and the failure rate crosses the threshold, the breaker opens and
//! the host stops dispatching. It closes again a fixed cooldown after the
//! last open, resetting the observation window.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Messages processed before the failure rate is evaluated.
    pub min_processed: u64,
    /// Failure rate (0..1] at which the breaker opens.
    pub failure_rate: f64,
    /// Time after the last open before the breaker auto-closes.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_processed: 10,
            failure_rate: 0.5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    processed: u64,
    failures: u64,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker. All operations are brief and lock-bound;
/// no await happens under the lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Record a successfully handled message.
    pub fn record_success(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.processed += 1;
        }
    }

    /// Record a failed message. Returns `true` if this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.processed += 1;
        state.failures += 1;

        if state.opened_at.is_some() {
            return false;
        }
        if state.processed > self.config.min_processed
            && state.failures as f64 / state.processed as f64 > self.config.failure_rate
        {
            state.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Whether dispatch is currently suppressed. Auto-closes once the
    /// cooldown since the last open has elapsed, resetting the window.
    pub fn is_open(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.config.cooldown => {
                *state = BreakerState::default();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Current failure rate over the observation window.
    pub fn failure_rate(&self) -> f64 {
        let Ok(state) = self.state.lock() else {
            return 0.0;
        };
        if state.processed == 0 {
            0.0
        } else {
            state.failures as f64 / state.processed as f64
        }
    }
}
