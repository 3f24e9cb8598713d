use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::agent::{EndpointSpec, LbPolicy, Target};
use crate::*;

/// Consecutive transport failures before an endpoint is taken out of
/// rotation. The active prober (or an operator reload) re-admits it.
const TRANSPORT_FAILURE_THRESHOLD: u32 = 3;

/// One upstream instance with its live state. Owned by the balancer of its
/// service; health and the active-connection count are plain atomics so
/// updates from breaker outcomes never block the hot path.
pub struct Endpoint {
	target: Target,
	weight: u32,
	healthy: AtomicBool,
	active: AtomicU64,
	transport_failures: AtomicU32,
}

impl Endpoint {
	pub fn target(&self) -> &Target {
		&self.target
	}

	pub fn weight(&self) -> u32 {
		self.weight
	}

	pub fn is_healthy(&self) -> bool {
		self.healthy.load(Ordering::Acquire)
	}

	pub fn active_connections(&self) -> u64 {
		self.active.load(Ordering::Relaxed)
	}

	/// Count one failed connect/write/read. Returns true when the strike
	/// budget is exhausted and the endpoint leaves rotation.
	pub fn record_transport_failure(&self) -> bool {
		let strikes = self.transport_failures.fetch_add(1, Ordering::AcqRel) + 1;
		if strikes >= TRANSPORT_FAILURE_THRESHOLD {
			self.healthy.store(false, Ordering::Release);
			true
		} else {
			false
		}
	}

	pub fn record_transport_success(&self) {
		self.transport_failures.store(0, Ordering::Relaxed);
	}
}

impl Debug for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Endpoint")
			.field("target", &self.target.to_string())
			.field("healthy", &self.is_healthy())
			.field("active", &self.active_connections())
			.finish()
	}
}

enum PolicyState {
	RoundRobin { next: AtomicUsize },
	WeightedRoundRobin { current: Mutex<Vec<i64>> },
	LeastConnections,
	Random { rng: Mutex<SmallRng> },
}

/// Selects a healthy endpoint per the service's policy. An unhealthy
/// endpoint is excluded until re-marked healthy; callers must `release`
/// what they were handed once the upstream call settles.
pub struct LoadBalancer {
	endpoints: Vec<Arc<Endpoint>>,
	policy: PolicyState,
}

impl LoadBalancer {
	pub fn new(specs: &[EndpointSpec], policy: LbPolicy) -> anyhow::Result<LoadBalancer> {
		let endpoints = specs
			.iter()
			.map(|s| {
				Ok(Arc::new(Endpoint {
					target: Target::parse(s.url())?,
					weight: s.weight().max(1),
					healthy: AtomicBool::new(true),
					active: AtomicU64::new(0),
					transport_failures: AtomicU32::new(0),
				}))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;
		let policy = match policy {
			LbPolicy::RoundRobin => PolicyState::RoundRobin {
				next: AtomicUsize::new(0),
			},
			LbPolicy::WeightedRoundRobin => PolicyState::WeightedRoundRobin {
				current: Mutex::new(vec![0; endpoints.len()]),
			},
			LbPolicy::LeastConnections => PolicyState::LeastConnections,
			LbPolicy::Random => PolicyState::Random {
				// Independent PRNG per service to avoid contention
				rng: Mutex::new(SmallRng::from_os_rng()),
			},
		};
		Ok(LoadBalancer { endpoints, policy })
	}

	pub fn endpoints(&self) -> &[Arc<Endpoint>] {
		&self.endpoints
	}

	pub fn any_healthy(&self) -> bool {
		self.endpoints.iter().any(|e| e.is_healthy())
	}

	pub fn next_target(&self) -> Option<Arc<Endpoint>> {
		let selected = match &self.policy {
			PolicyState::RoundRobin { next } => self.round_robin(next),
			PolicyState::WeightedRoundRobin { current } => self.smooth_weighted(current),
			PolicyState::LeastConnections => self.least_connections(),
			PolicyState::Random { rng } => self.random(rng),
		}?;
		selected.active.fetch_add(1, Ordering::AcqRel);
		Some(selected)
	}

	pub fn release(&self, ep: &Endpoint) {
		let _ = ep
			.active
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
				Some(v.saturating_sub(1))
			});
	}

	pub fn mark_healthy(&self, ep: &Endpoint) {
		ep.transport_failures.store(0, Ordering::Relaxed);
		ep.healthy.store(true, Ordering::Release);
	}

	pub fn mark_unhealthy(&self, ep: &Endpoint) {
		ep.healthy.store(false, Ordering::Release);
	}

	fn round_robin(&self, next: &AtomicUsize) -> Option<Arc<Endpoint>> {
		let n = self.endpoints.len();
		if n == 0 {
			return None;
		}
		// The counter advances past unhealthy entries, keeping selection
		// deterministic over the healthy subset.
		for _ in 0..n {
			let idx = next.fetch_add(1, Ordering::Relaxed) % n;
			let ep = &self.endpoints[idx];
			if ep.is_healthy() {
				return Some(ep.clone());
			}
		}
		None
	}

	/// Classical smooth weighted round robin: every healthy endpoint gains
	/// its weight, the leader is picked, and the leader pays back the total.
	fn smooth_weighted(&self, current: &Mutex<Vec<i64>>) -> Option<Arc<Endpoint>> {
		let mut current = current.lock();
		let mut total: i64 = 0;
		let mut best: Option<usize> = None;
		for (i, ep) in self.endpoints.iter().enumerate() {
			if !ep.is_healthy() {
				continue;
			}
			current[i] += ep.weight as i64;
			total += ep.weight as i64;
			match best {
				Some(b) if current[b] >= current[i] => {},
				_ => best = Some(i),
			}
		}
		let best = best?;
		current[best] -= total;
		Some(self.endpoints[best].clone())
	}

	fn least_connections(&self) -> Option<Arc<Endpoint>> {
		self
			.endpoints
			.iter()
			.filter(|e| e.is_healthy())
			.min_by_key(|e| e.active_connections())
			.cloned()
	}

	fn random(&self, rng: &Mutex<SmallRng>) -> Option<Arc<Endpoint>> {
		let healthy: Vec<&Arc<Endpoint>> = self.endpoints.iter().filter(|e| e.is_healthy()).collect();
		if healthy.is_empty() {
			return None;
		}
		let idx = rng.lock().random_range(0..healthy.len());
		Some(healthy[idx].clone())
	}
}

impl Debug for LoadBalancer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LoadBalancer")
			.field("endpoints", &self.endpoints)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn balancer(urls: &[&str], policy: LbPolicy) -> LoadBalancer {
		let specs: Vec<EndpointSpec> = urls
			.iter()
			.map(|u| EndpointSpec::Url(u.to_string()))
			.collect();
		LoadBalancer::new(&specs, policy).unwrap()
	}

	fn take(lb: &LoadBalancer) -> String {
		let ep = lb.next_target().unwrap();
		let authority = ep.target().authority.to_string();
		lb.release(&ep);
		authority
	}

	#[test]
	fn round_robin_is_fair() {
		let lb = balancer(&["http://a:1", "http://b:1", "http://c:1"], LbPolicy::RoundRobin);
		let mut counts = std::collections::HashMap::new();
		for _ in 0..30 {
			*counts.entry(take(&lb)).or_insert(0) += 1;
		}
		assert_eq!(counts["a:1"], 10);
		assert_eq!(counts["b:1"], 10);
		assert_eq!(counts["c:1"], 10);
	}

	#[test]
	fn round_robin_excludes_unhealthy_until_remarked() {
		let lb = balancer(&["http://a:1", "http://b:1"], LbPolicy::RoundRobin);
		let b = lb.endpoints()[1].clone();
		lb.mark_unhealthy(&b);
		for _ in 0..10 {
			assert_eq!(take(&lb), "a:1");
		}
		lb.mark_healthy(&b);
		let mut seen_b = false;
		for _ in 0..2 {
			seen_b |= take(&lb) == "b:1";
		}
		assert!(seen_b, "endpoint must be eligible immediately");
	}

	#[test]
	fn no_healthy_endpoint_yields_none() {
		let lb = balancer(&["http://a:1"], LbPolicy::RoundRobin);
		lb.mark_unhealthy(&lb.endpoints()[0].clone());
		assert!(lb.next_target().is_none());
		assert!(!lb.any_healthy());
	}

	#[test]
	fn smooth_weighted_distribution_is_exact() {
		let specs = vec![
			EndpointSpec::Weighted {
				url: "http://a:1".to_string(),
				weight: 5,
			},
			EndpointSpec::Weighted {
				url: "http://b:1".to_string(),
				weight: 1,
			},
			EndpointSpec::Weighted {
				url: "http://c:1".to_string(),
				weight: 1,
			},
		];
		let lb = LoadBalancer::new(&specs, LbPolicy::WeightedRoundRobin).unwrap();
		// Any sum-of-weights consecutive picks hit each endpoint weight times
		for _round in 0..3 {
			let mut counts = std::collections::HashMap::new();
			for _ in 0..7 {
				*counts.entry(take(&lb)).or_insert(0) += 1;
			}
			assert_eq!(counts["a:1"], 5);
			assert_eq!(counts["b:1"], 1);
			assert_eq!(counts["c:1"], 1);
		}
	}

	#[test]
	fn smooth_weighted_interleaves() {
		let specs = vec![
			EndpointSpec::Weighted {
				url: "http://a:1".to_string(),
				weight: 2,
			},
			EndpointSpec::Weighted {
				url: "http://b:1".to_string(),
				weight: 1,
			},
		];
		let lb = LoadBalancer::new(&specs, LbPolicy::WeightedRoundRobin).unwrap();
		// The smooth algorithm never fires all of an endpoint's share back to back
		assert_eq!(take(&lb), "a:1");
		assert_eq!(take(&lb), "b:1");
		assert_eq!(take(&lb), "a:1");
	}

	#[test]
	fn least_connections_tracks_active() {
		let lb = balancer(&["http://a:1", "http://b:1"], LbPolicy::LeastConnections);
		let first = lb.next_target().unwrap();
		assert_eq!(first.target().authority.as_str(), "a:1");
		// a is busy, so b wins
		let second = lb.next_target().unwrap();
		assert_eq!(second.target().authority.as_str(), "b:1");
		// Release a; tie breaks by insertion order
		lb.release(&first);
		let third = lb.next_target().unwrap();
		assert_eq!(third.target().authority.as_str(), "a:1");
	}

	#[test]
	fn least_connections_ignores_unhealthy() {
		let lb = balancer(&["http://a:1", "http://b:1"], LbPolicy::LeastConnections);
		let b = lb.endpoints()[1].clone();
		lb.mark_unhealthy(&b);
		for _ in 0..100 {
			let ep = lb.next_target().unwrap();
			assert_eq!(ep.target().authority.as_str(), "a:1");
			lb.release(&ep);
		}
		assert_eq!(b.active_connections(), 0);
	}

	#[test]
	fn random_only_returns_healthy() {
		let lb = balancer(
			&["http://a:1", "http://b:1", "http://c:1"],
			LbPolicy::Random,
		);
		let c = lb.endpoints()[2].clone();
		lb.mark_unhealthy(&c);
		for _ in 0..50 {
			let authority = take(&lb);
			assert_ne!(authority, "c:1");
		}
	}

	#[test]
	fn transport_strikes_take_an_endpoint_out() {
		let lb = balancer(&["http://a:1"], LbPolicy::RoundRobin);
		let a = lb.endpoints()[0].clone();
		assert!(!a.record_transport_failure());
		assert!(!a.record_transport_failure());
		assert!(a.is_healthy());
		assert!(a.record_transport_failure());
		assert!(!a.is_healthy());
		// A probe re-admits it and clears the strikes
		lb.mark_healthy(&a);
		assert!(a.is_healthy());
		assert!(!a.record_transport_failure());
	}

	#[test]
	fn transport_success_clears_strikes() {
		let lb = balancer(&["http://a:1"], LbPolicy::RoundRobin);
		let a = lb.endpoints()[0].clone();
		a.record_transport_failure();
		a.record_transport_failure();
		a.record_transport_success();
		assert!(!a.record_transport_failure());
		assert!(a.is_healthy());
	}

	#[test]
	fn release_never_underflows() {
		let lb = balancer(&["http://a:1"], LbPolicy::RoundRobin);
		let a = lb.endpoints()[0].clone();
		lb.release(&a);
		assert_eq!(a.active_connections(), 0);
	}
}
