//! Per-agent circuit breakers
//!
//! Consulted by callers before delivering to an agent that has been failing;
//! message validation and routing never touch breaker state.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure-tracking state machine for one agent
///
/// Opens after `threshold` consecutive failures, moves to half-open on the
/// first send attempt after `cooldown`, and closes on any success.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a send may be attempted at `now`
    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    /// Record a failure; returns true when this failure opened the circuit
    pub fn record_failure_at(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);

        let should_open =
            self.state == CircuitState::HalfOpen || self.failures >= self.threshold;
        if should_open && self.state != CircuitState::Open {
            self.state = CircuitState::Open;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }
}

/// Shared map of breakers keyed by agent id
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            threshold,
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn should_send(&self, agent_id: &str) -> bool {
        match self.lock().get_mut(agent_id) {
            Some(breaker) => breaker.allow_at(Instant::now()),
            None => true,
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown));
        if breaker.record_failure_at(Instant::now()) {
            metrics().record_circuit_opened();
            warn!(
                agent_id = %agent_id,
                failures = breaker.failures(),
                "Circuit opened"
            );
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(breaker) = self.lock().get_mut(agent_id) {
            if breaker.state() != CircuitState::Closed {
                info!(agent_id = %agent_id, "Circuit closed");
            }
            breaker.record_success();
        }
    }

    pub fn state(&self, agent_id: &str) -> CircuitState {
        self.lock()
            .get(agent_id)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    pub fn open_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count()
    }
}
