use parking_lot::Mutex;

use crate::telemetry::metrics::{Metrics, OutcomeLabels, ServiceLabels, TransitionLabels};
use crate::types::agent::CircuitBreakerSpec;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	Open { opened_at: Instant },
	HalfOpen { in_flight: u32, successes: u32 },
}

impl State {
	pub fn name(&self) -> &'static str {
		match self {
			State::Closed => "closed",
			State::Open { .. } => "open",
			State::HalfOpen { .. } => "halfOpen",
		}
	}

	fn gauge(&self) -> i64 {
		match self {
			State::Closed => 0,
			State::HalfOpen { .. } => 1,
			State::Open { .. } => 2,
		}
	}
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
	consecutive_failures: u32,
	consecutive_successes: u32,
	total_requests: u64,
	total_failures: u64,
}

#[derive(Debug)]
struct Inner {
	state: State,
	counters: Counters,
}

/// Three-state protection around one service's upstream calls. Transitions
/// happen under a short per-breaker lock; the forwarder reports the final
/// outcome of each request, not individual attempts.
pub struct CircuitBreaker {
	service: String,
	spec: CircuitBreakerSpec,
	inner: Mutex<Inner>,
	metrics: Arc<Metrics>,
}

/// Admission through the breaker. Dropping an unrecorded permit releases a
/// half-open probe slot without counting as either outcome, which keeps the
/// budget correct when a client goes away mid-probe.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
	breaker: &'a CircuitBreaker,
	half_open: bool,
	recorded: bool,
}

impl Drop for BreakerPermit<'_> {
	fn drop(&mut self) {
		if self.recorded || !self.half_open {
			return;
		}
		let mut inner = self.breaker.inner.lock();
		if let State::HalfOpen { in_flight, .. } = &mut inner.state {
			*in_flight = in_flight.saturating_sub(1);
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
	pub state: &'static str,
	pub consecutive_failures: u32,
	pub consecutive_successes: u32,
	pub total_requests: u64,
	pub total_failures: u64,
}

impl CircuitBreaker {
	pub fn new(service: String, spec: CircuitBreakerSpec, metrics: Arc<Metrics>) -> CircuitBreaker {
		metrics
			.breaker_state
			.get_or_create(&ServiceLabels {
				service: service.clone(),
			})
			.set(0);
		CircuitBreaker {
			service,
			spec,
			inner: Mutex::new(Inner {
				state: State::Closed,
				counters: Counters::default(),
			}),
			metrics,
		}
	}

	pub fn state(&self) -> State {
		self.inner.lock().state
	}

	pub fn stats(&self) -> BreakerStats {
		let inner = self.inner.lock();
		BreakerStats {
			state: inner.state.name(),
			consecutive_failures: inner.counters.consecutive_failures,
			consecutive_successes: inner.counters.consecutive_successes,
			total_requests: inner.counters.total_requests,
			total_failures: inner.counters.total_failures,
		}
	}

	/// Ask to pass one request through. `Err` carries the seconds a client
	/// should wait before trying again.
	pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, u64> {
		let mut inner = self.inner.lock();
		match inner.state {
			State::Closed => Ok(self.permit(false)),
			State::Open { opened_at } => {
				let elapsed = opened_at.elapsed();
				if elapsed >= self.spec.open_duration {
					self.transition(
						&mut inner,
						State::HalfOpen {
							in_flight: 1,
							successes: 0,
						},
					);
					Ok(self.permit(true))
				} else {
					self.short_circuited();
					let remaining = self.spec.open_duration - elapsed;
					Err((remaining.as_secs_f64().ceil() as u64).max(1))
				}
			},
			State::HalfOpen {
				ref mut in_flight, ..
			} => {
				if *in_flight < self.spec.probe_budget {
					*in_flight += 1;
					Ok(self.permit(true))
				} else {
					self.short_circuited();
					Err(1)
				}
			},
		}
	}

	/// Report the final outcome of a permitted request. A failure is an
	/// upstream 5xx, a transport error, or a deadline expiry; 4xx responses
	/// are successes here.
	pub fn record(&self, mut permit: BreakerPermit<'_>, success: bool) {
		permit.recorded = true;
		let mut inner = self.inner.lock();
		if permit.half_open {
			if let State::HalfOpen { in_flight, .. } = &mut inner.state {
				*in_flight = in_flight.saturating_sub(1);
			}
		}
		inner.counters.total_requests += 1;
		if success {
			inner.counters.consecutive_failures = 0;
			inner.counters.consecutive_successes += 1;
			let close = if let State::HalfOpen { successes, .. } = &mut inner.state {
				*successes += 1;
				*successes >= self.spec.required_successes()
			} else {
				false
			};
			if close {
				self.transition(&mut inner, State::Closed);
				inner.counters = Counters::default();
			}
			self.outcome("success");
		} else {
			inner.counters.total_failures += 1;
			inner.counters.consecutive_successes = 0;
			inner.counters.consecutive_failures += 1;
			match inner.state {
				State::HalfOpen { .. } => {
					// Back to Open with a fresh timer
					self.transition(
						&mut inner,
						State::Open {
							opened_at: Instant::now(),
						},
					);
				},
				State::Closed if inner.counters.consecutive_failures >= self.spec.failure_threshold => {
					self.transition(
						&mut inner,
						State::Open {
							opened_at: Instant::now(),
						},
					);
				},
				_ => {},
			}
			self.outcome("failure");
		}
	}

	/// Admin reset: back to Closed with counters zeroed.
	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		if !matches!(inner.state, State::Closed) {
			self.transition(&mut inner, State::Closed);
		}
		inner.counters = Counters::default();
	}

	fn permit(&self, half_open: bool) -> BreakerPermit<'_> {
		BreakerPermit {
			breaker: self,
			half_open,
			recorded: false,
		}
	}

	fn transition(&self, inner: &mut Inner, to: State) {
		let from = inner.state;
		debug!(
			service = %self.service,
			from = from.name(),
			to = to.name(),
			"circuit breaker transition"
		);
		self
			.metrics
			.breaker_transitions
			.get_or_create(&TransitionLabels {
				service: self.service.clone(),
				from: from.name(),
				to: to.name(),
			})
			.inc();
		self
			.metrics
			.breaker_state
			.get_or_create(&ServiceLabels {
				service: self.service.clone(),
			})
			.set(to.gauge());
		inner.state = to;
	}

	fn short_circuited(&self) {
		self.outcome("shortCircuit");
	}

	fn outcome(&self, outcome: &'static str) {
		self
			.metrics
			.breaker_outcomes
			.get_or_create(&OutcomeLabels {
				service: self.service.clone(),
				outcome,
			})
			.inc();
	}
}

impl Debug for CircuitBreaker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CircuitBreaker")
			.field("service", &self.service)
			.field("state", &self.state().name())
			.finish()
	}
}
