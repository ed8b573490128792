//! Three-state circuit breakers for outbound call sites.
//!
//! Each named site (embedding, artifact, catalog) gets its own breaker.
//! Closed counts consecutive failures; Open short-circuits until the
//! cool-down elapses; HalfOpen admits a bounded number of trial calls where
//! the first success closes the circuit and any failure re-opens it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::RouterError;

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { admitted: u32 },
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    state: Mutex<State>,
    entered_at: Mutex<Instant>,
    trips: AtomicU64,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            entered_at: Mutex::new(Instant::now()),
            trips: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make a call through this breaker. `Err(CircuitOpen)` means the
    /// callee must not be invoked. Callers report the outcome afterwards via
    /// `record_success` / `record_failure`.
    pub fn admit(&self) -> Result<(), RouterError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                if Instant::now() >= *until {
                    *state = State::HalfOpen { admitted: 1 };
                    self.note_transition();
                    tracing::debug!(breaker = %self.name, "cool-down elapsed, half-open probe admitted");
                    Ok(())
                } else {
                    Err(RouterError::CircuitOpen(self.name.clone()))
                }
            }
            State::HalfOpen { admitted } => {
                if *admitted < self.cfg.half_open_probes {
                    *admitted += 1;
                    Ok(())
                } else {
                    Err(RouterError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::Closed { .. } => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
            State::HalfOpen { .. } | State::Open { .. } => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
                self.note_transition();
                tracing::info!(breaker = %self.name, "circuit closed");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.cfg.failure_threshold {
                    *state = State::Open {
                        until: Instant::now() + self.cfg.cool_down,
                    };
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    self.note_transition();
                    tracing::warn!(breaker = %self.name, "circuit opened");
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open {
                    until: Instant::now() + self.cfg.cool_down,
                };
                self.trips.fetch_add(1, Ordering::Relaxed);
                self.note_transition();
                tracing::warn!(breaker = %self.name, "half-open probe failed, circuit re-opened");
            }
            State::Open { .. } => {}
        }
    }

    pub fn state_name(&self) -> &'static str {
        let state = self.state.lock().unwrap();
        match &*state {
            State::Closed { .. } => "closed",
            State::Open { until } => {
                // Report half_open once the cool-down has lapsed even if no
                // probe has been admitted yet; observers see the state a call
                // would encounter.
                if Instant::now() >= *until {
                    "half_open"
                } else {
                    "open"
                }
            }
            State::HalfOpen { .. } => "half_open",
        }
    }

    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn time_in_state(&self) -> Duration {
        self.entered_at.lock().unwrap().elapsed()
    }

    fn note_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        *self.entered_at.lock().unwrap() = Instant::now();
    }
}

/// The fixed set of breakers the plugin wires at startup. Shared as `Arc`s
/// because each guarded client owns a handle to its breaker.
pub struct CircuitBreakers {
    pub embedding: std::sync::Arc<CircuitBreaker>,
    pub artifact: std::sync::Arc<CircuitBreaker>,
    pub catalog: std::sync::Arc<CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            embedding: std::sync::Arc::new(CircuitBreaker::new("embedding", cfg)),
            artifact: std::sync::Arc::new(CircuitBreaker::new("artifact", cfg)),
            catalog: std::sync::Arc::new(CircuitBreaker::new("catalog", cfg)),
        }
    }

    pub fn all(&self) -> [&CircuitBreaker; 3] {
        [&self.embedding, &self.artifact, &self.catalog]
    }
}
