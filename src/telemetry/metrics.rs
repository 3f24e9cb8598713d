use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TrafficLabels {
	pub service: String,
	pub method: String,
	pub status: u32,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
	pub service: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RateLimitLabels {
	pub decision: &'static str,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
	pub service: String,
	pub from: &'static str,
	pub to: &'static str,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
	pub service: String,
	pub outcome: &'static str,
}

type DurationHistogram = Family<ServiceLabels, Histogram, fn() -> Histogram>;

fn duration_histogram() -> Histogram {
	Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<TrafficLabels, Counter>,
	pub request_duration: DurationHistogram,
	pub rate_limit_decisions: Family<RateLimitLabels, Counter>,
	/// Closed=0, HalfOpen=1, Open=2
	pub breaker_state: Family<ServiceLabels, Gauge>,
	pub breaker_transitions: Family<TransitionLabels, Counter>,
	pub breaker_outcomes: Family<OutcomeLabels, Counter>,
	pub upstream_retries: Family<ServiceLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"requests",
			"The total number of HTTP requests processed",
			requests.clone(),
		);
		let request_duration: DurationHistogram =
			Family::new_with_constructor(duration_histogram as fn() -> Histogram);
		registry.register(
			"request_duration_seconds",
			"End to end request latency",
			request_duration.clone(),
		);
		let rate_limit_decisions = Family::default();
		registry.register(
			"rate_limit_decisions",
			"Rate limiter outcomes",
			rate_limit_decisions.clone(),
		);
		let breaker_state = Family::default();
		registry.register(
			"circuit_breaker_state",
			"Circuit breaker state (0 closed, 1 half-open, 2 open)",
			breaker_state.clone(),
		);
		let breaker_transitions = Family::default();
		registry.register(
			"circuit_breaker_transitions",
			"Circuit breaker state transitions",
			breaker_transitions.clone(),
		);
		let breaker_outcomes = Family::default();
		registry.register(
			"circuit_breaker_outcomes",
			"Requests observed by circuit breakers",
			breaker_outcomes.clone(),
		);
		let upstream_retries = Family::default();
		registry.register(
			"upstream_retries",
			"Retried upstream attempts after transport errors",
			upstream_retries.clone(),
		);
		Metrics {
			requests,
			request_duration,
			rate_limit_decisions,
			breaker_state,
			breaker_transitions,
			breaker_outcomes,
			upstream_retries,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metrics_register_and_encode() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics
			.requests
			.get_or_create(&TrafficLabels {
				service: "users".to_string(),
				method: "GET".to_string(),
				status: 200,
			})
			.inc();
		metrics
			.breaker_state
			.get_or_create(&ServiceLabels {
				service: "users".to_string(),
			})
			.set(2);
		let mut out = String::new();
		prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
		assert!(out.contains("requests_total"));
		assert!(out.contains("circuit_breaker_state"));
	}
}
