//! Per-backend circuit breaker.
//!
//! State machine:
//!
//! ```text
//!   Closed ──(threshold consecutive failures)──> Open
//!   Open ──(cooldown elapsed, CAS winner)──> HalfOpen (single probe)
//!   HalfOpen ──(probe success)──> Closed
//!   HalfOpen ──(probe failure)──> Open (cooldown restarts)
//! ```
//!
//! While Open, calls fail fast without touching the network. The Open to
//! HalfOpen transition is a compare-and-swap, so under concurrency exactly
//! one caller wins the probe slot; everyone else keeps failing fast until
//! the probe resolves.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// What the gate decided for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed; proceed normally.
    Proceed,
    /// Cooldown elapsed and this caller won the single probe slot.
    Probe,
    /// Circuit open (or a probe is in flight); fail fast, no network call.
    FailFast,
}

/// Observable counters for one circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub trips: u64,
    pub resets: u64,
    pub calls_short_circuited: u64,
    pub probes_attempted: u64,
    pub probes_succeeded: u64,
}

/// Lock-free circuit breaker for one backend tier.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` when the circuit last opened.
    last_trip_time_ms: AtomicU64,
    /// Reference instant for computing elapsed time.
    epoch: Instant,
    trip_count: AtomicU64,
    reset_count: AtomicU64,
    short_circuit_count: AtomicU64,
    probe_count: AtomicU64,
    probe_success_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            cooldown,
            state: AtomicU32::new(CircuitState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            last_trip_time_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            trip_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            short_circuit_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            probe_success_count: AtomicU64::new(0),
        }
    }

    /// Gate one prospective call through the state machine.
    pub fn check(&self) -> CircuitDecision {
        match self.current_state() {
            CircuitState::Closed => CircuitDecision::Proceed,

            CircuitState::Open => {
                let elapsed_ms = self.elapsed_ms();
                let trip_time = self.last_trip_time_ms.load(Ordering::Acquire);

                if elapsed_ms.saturating_sub(trip_time) >= self.cooldown.as_millis() as u64 {
                    // Exactly one caller wins the Open -> HalfOpen transition.
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u32,
                            CircuitState::HalfOpen as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.probe_count.fetch_add(1, Ordering::Relaxed);
                        info!(
                            backend = %self.name,
                            "Circuit cooldown elapsed; admitting probe call"
                        );
                        CircuitDecision::Probe
                    } else {
                        self.short_circuit_count.fetch_add(1, Ordering::Relaxed);
                        CircuitDecision::FailFast
                    }
                } else {
                    self.short_circuit_count.fetch_add(1, Ordering::Relaxed);
                    CircuitDecision::FailFast
                }
            }

            // A probe is already in flight; hold everyone else back until
            // it resolves.
            CircuitState::HalfOpen => {
                self.short_circuit_count.fetch_add(1, Ordering::Relaxed);
                CircuitDecision::FailFast
            }
        }
    }

    /// Record the outcome of a call that was admitted by [`check`].
    ///
    /// [`check`]: CircuitBreaker::check
    pub fn record_outcome(&self, success: bool) {
        match self.current_state() {
            CircuitState::Closed => {
                if success {
                    self.consecutive_failures.store(0, Ordering::Release);
                } else {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= self.failure_threshold {
                        self.trip();
                    }
                }
            }

            CircuitState::HalfOpen => {
                if success {
                    self.probe_success_count.fetch_add(1, Ordering::Relaxed);
                    self.reset();
                } else {
                    self.state
                        .store(CircuitState::Open as u32, Ordering::Release);
                    self.last_trip_time_ms
                        .store(self.elapsed_ms(), Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    warn!(backend = %self.name, "Probe call failed; circuit re-opened");
                }
            }

            // Outcomes may land after a concurrent trip; nothing to do.
            CircuitState::Open => {}
        }
    }

    /// Return an admitted probe slot without recording an outcome, for
    /// when a budget or rate-limit gate stops the call before it reaches
    /// the network. The trip time is left untouched, so the next caller
    /// is admitted as a probe immediately.
    pub fn cancel_probe(&self) {
        let _ = self.state.compare_exchange(
            CircuitState::HalfOpen as u32,
            CircuitState::Open as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn current_state(&self) -> CircuitState {
        CircuitState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.current_state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Time left until an open circuit admits a probe, if currently open.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        if !self.is_open() {
            return None;
        }
        let elapsed_since_trip = self
            .elapsed_ms()
            .saturating_sub(self.last_trip_time_ms.load(Ordering::Acquire));
        let cooldown_ms = self.cooldown.as_millis() as u64;
        Some(Duration::from_millis(
            cooldown_ms.saturating_sub(elapsed_since_trip),
        ))
    }

    /// Snapshot of observable counters.
    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            trips: self.trip_count.load(Ordering::Relaxed),
            resets: self.reset_count.load(Ordering::Relaxed),
            calls_short_circuited: self.short_circuit_count.load(Ordering::Relaxed),
            probes_attempted: self.probe_count.load(Ordering::Relaxed),
            probes_succeeded: self.probe_success_count.load(Ordering::Relaxed),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn trip(&self) {
        self.state
            .store(CircuitState::Open as u32, Ordering::Release);
        self.last_trip_time_ms
            .store(self.elapsed_ms(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            backend = %self.name,
            threshold = self.failure_threshold,
            cooldown_secs = self.cooldown.as_secs(),
            "Circuit opened after consecutive failures"
        );
    }

    fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u32, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.reset_count.fetch_add(1, Ordering::Relaxed);
        info!(backend = %self.name, "Probe succeeded; circuit closed");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .field("trips", &self.trip_count.load(Ordering::Relaxed))
            .field("resets", &self.reset_count.load(Ordering::Relaxed))
            .finish()
    }
}
