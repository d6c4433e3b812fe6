//! Circuit breaking per (model, provider).
//!
//! Failure tracking follows the classic three-state machine: closed circuits
//! open once `max_failures` consecutive failures accumulate, an open circuit
//! admits a single probe (half-open) after `reset_timeout_ms`, and the probe's
//! outcome either re-closes or re-opens the circuit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Time an open circuit waits before admitting a probe.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl Circuit {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }
}

/// Registry of circuits keyed by (model, provider).
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    circuits: Mutex<HashMap<(String, String), Circuit>>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn key(model: &str, provider: &str) -> (String, String) {
        (model.to_string(), provider.to_string())
    }

    /// Whether a dispatch to this model/provider should be attempted.
    ///
    /// An open circuit past its reset timeout transitions to half-open and
    /// admits exactly this one probe; within the timeout the answer is no.
    pub fn should_attempt(&self, model: &str, provider: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(Self::key(model, provider))
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_millis(self.cfg.reset_timeout_ms) {
                    info!(model, provider, "circuit half-open, admitting probe");
                    circuit.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Milliseconds until an open circuit admits a probe; 0 when closed.
    pub fn retry_after_ms(&self, model: &str, provider: &str) -> u64 {
        let circuits = self.circuits.lock();
        match circuits.get(&Self::key(model, provider)) {
            Some(circuit) if circuit.state == CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                self.cfg.reset_timeout_ms.saturating_sub(elapsed)
            }
            _ => 0,
        }
    }

    /// Record a successful dispatch. Returns `(previous, new)` state.
    pub fn record_success(&self, model: &str, provider: &str) -> (CircuitState, CircuitState) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(Self::key(model, provider))
            .or_insert_with(Circuit::new);
        let previous = circuit.state;

        circuit.failure_count = 0;
        circuit.state = CircuitState::Closed;
        if previous != CircuitState::Closed {
            info!(model, provider, "circuit closed after successful probe");
        }
        (previous, circuit.state)
    }

    /// Record a failed dispatch. Returns `(previous, new)` state.
    pub fn record_failure(&self, model: &str, provider: &str) -> (CircuitState, CircuitState) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(Self::key(model, provider))
            .or_insert_with(Circuit::new);
        let previous = circuit.state;

        circuit.failure_count += 1;
        circuit.last_failure = Some(Instant::now());

        match previous {
            CircuitState::HalfOpen => {
                warn!(model, provider, "probe failed, circuit re-opened");
                circuit.state = CircuitState::Open;
            }
            CircuitState::Closed if circuit.failure_count >= self.cfg.max_failures => {
                warn!(
                    model,
                    provider,
                    failures = circuit.failure_count,
                    "failure threshold reached, circuit opened"
                );
                circuit.state = CircuitState::Open;
            }
            _ => {}
        }
        (previous, circuit.state)
    }

    /// Current state of one circuit.
    pub fn state(&self, model: &str, provider: &str) -> CircuitState {
        let circuits = self.circuits.lock();
        circuits
            .get(&Self::key(model, provider))
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32, reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            max_failures,
            reset_timeout_ms,
        })
    }

    #[test]
    fn test_opens_after_max_failures() {
        let cb = breaker(3, 60_000);
        for _ in 0..2 {
            cb.record_failure("gpt-4", "openai");
            assert_eq!(cb.state("gpt-4", "openai"), CircuitState::Closed);
        }
        let (prev, new) = cb.record_failure("gpt-4", "openai");
        assert_eq!(prev, CircuitState::Closed);
        assert_eq!(new, CircuitState::Open);
        assert!(!cb.should_attempt("gpt-4", "openai"));
        assert!(cb.retry_after_ms("gpt-4", "openai") > 0);
    }

    #[test]
    fn test_half_open_probe_after_timeout_then_close_on_success() {
        let cb = breaker(1, 10);
        cb.record_failure("gpt-4", "openai");
        assert!(!cb.should_attempt("gpt-4", "openai"));

        std::thread::sleep(Duration::from_millis(20));

        // Exactly one probe is admitted.
        assert!(cb.should_attempt("gpt-4", "openai"));
        assert_eq!(cb.state("gpt-4", "openai"), CircuitState::HalfOpen);

        let (prev, new) = cb.record_success("gpt-4", "openai");
        assert_eq!(prev, CircuitState::HalfOpen);
        assert_eq!(new, CircuitState::Closed);
        assert!(cb.should_attempt("gpt-4", "openai"));
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure("gpt-4", "openai");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt("gpt-4", "openai"));

        let (prev, new) = cb.record_failure("gpt-4", "openai");
        assert_eq!(prev, CircuitState::HalfOpen);
        assert_eq!(new, CircuitState::Open);
        assert!(!cb.should_attempt("gpt-4", "openai"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure("gpt-4", "openai");
        cb.record_failure("gpt-4", "openai");
        cb.record_success("gpt-4", "openai");

        // Streak restarts; two more failures stay under the threshold.
        cb.record_failure("gpt-4", "openai");
        cb.record_failure("gpt-4", "openai");
        assert_eq!(cb.state("gpt-4", "openai"), CircuitState::Closed);
    }

    #[test]
    fn test_circuits_keyed_by_model_and_provider() {
        let cb = breaker(1, 60_000);
        cb.record_failure("gpt-4", "openai");
        assert_eq!(cb.state("gpt-4", "openai"), CircuitState::Open);
        assert_eq!(cb.state("gpt-4", "azure"), CircuitState::Closed);
        assert_eq!(cb.state("gpt-3.5-turbo", "openai"), CircuitState::Closed);
    }
}
