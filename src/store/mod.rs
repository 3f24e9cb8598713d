use std::collections::HashMap;

use arc_swap::ArcSwap;

use crate::http::cors::Cors;
use crate::http::jwt::Authn;
use crate::http::ratelimit::Limits;
use crate::proxy::circuitbreaker::CircuitBreaker;
use crate::proxy::loadbalancer::LoadBalancer;
use crate::types::agent::{
	HealthCheckSpec, ObservabilitySpec, RouteAuth, ServiceName, ServiceSpec,
};
use crate::*;

/// Per-service runtime built during snapshot compile: the balancer owns the
/// endpoints, the breaker guards them.
pub struct ServiceRuntime {
	pub name: ServiceName,
	pub spec: ServiceSpec,
	pub timeout: Option<Duration>,
	pub retries: u8,
	pub auth: Option<RouteAuth>,
	pub balancer: LoadBalancer,
	pub breaker: Option<CircuitBreaker>,
}

impl Debug for ServiceRuntime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceRuntime")
			.field("name", &self.name)
			.field("balancer", &self.balancer)
			.finish()
	}
}

/// Immutable bundle of everything the pipeline consults. Constructed
/// off-line, published atomically, never mutated in place.
pub struct ConfigSnapshot {
	pub version: u64,
	pub services: HashMap<ServiceName, Arc<ServiceRuntime>>,
	pub limits: Limits,
	pub authn: Option<Arc<Authn>>,
	pub cors: Option<Cors>,
	pub health_check: Option<HealthCheckSpec>,
	pub observability: ObservabilitySpec,
}

impl ConfigSnapshot {
	pub fn service(&self, name: &str) -> Option<&Arc<ServiceRuntime>> {
		self.services.get(name)
	}
}

/// The single atomically-swapped pointer behind dynamic configuration.
#[derive(Clone)]
pub struct Stores {
	snapshot: Arc<ArcSwap<ConfigSnapshot>>,
}

impl Stores {
	pub fn new(initial: ConfigSnapshot) -> Stores {
		Stores {
			snapshot: Arc::new(ArcSwap::from_pointee(initial)),
		}
	}

	/// Capture-then-dereference: a request takes the pointer once at entry
	/// and keeps that snapshot for its whole lifetime, so a mid-flight swap
	/// never changes what it observes.
	pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
		self.snapshot.load_full()
	}

	pub fn publish(&self, snapshot: ConfigSnapshot) {
		info!(version = snapshot.version, "configuration published");
		self.snapshot.store(Arc::new(snapshot));
	}
}

impl Debug for Stores {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Stores")
			.field("version", &self.snapshot.load().version)
			.finish()
	}
}
