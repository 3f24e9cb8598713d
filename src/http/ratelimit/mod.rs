pub mod distributed;

use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::http::jwt::Claims;
use crate::http::{HeaderMap, x_headers};
use crate::types::agent::{DistributedSpec, RateLimitAlgorithm, RateLimitRule, RateLimitSpec};
use crate::*;

/// Outcome of consulting the limiter for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
	pub allowed: bool,
	pub limit: u64,
	pub remaining: u64,
	pub reset_after: Duration,
}

impl Decision {
	/// Whole seconds for a `Retry-After` header, never less than 1.
	pub fn retry_after_secs(&self) -> u64 {
		(self.reset_after.as_secs_f64().ceil() as u64).max(1)
	}
}

const SHARD_COUNT: usize = 16;

fn shard_index(key: &str) -> usize {
	let mut h = DefaultHasher::new();
	key.hash(&mut h);
	h.finish() as usize % SHARD_COUNT
}

struct Slot<T> {
	state: T,
	last_seen: Instant,
}

/// Key-partitioned state map. Contention is per shard, and the sweeper takes
/// the same shard lock as decisions, so eviction cannot race a decision for
/// the same key.
struct Sharded<T> {
	shards: [Mutex<HashMap<String, Slot<T>>>; SHARD_COUNT],
}

impl<T> Sharded<T> {
	fn new() -> Sharded<T> {
		Sharded {
			shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
		}
	}

	fn with<R>(&self, key: &str, init: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> R {
		let mut shard = self.shards[shard_index(key)].lock();
		let slot = shard.entry(key.to_string()).or_insert_with(|| Slot {
			state: init(),
			last_seen: Instant::now(),
		});
		slot.last_seen = Instant::now();
		f(&mut slot.state)
	}

	fn sweep(&self, idle: Duration) -> usize {
		let now = Instant::now();
		let mut evicted = 0;
		for shard in &self.shards {
			let mut shard = shard.lock();
			let before = shard.len();
			shard.retain(|_, slot| now.duration_since(slot.last_seen) < idle);
			evicted += before - shard.len();
		}
		evicted
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.shards.iter().map(|s| s.lock().len()).sum()
	}
}

struct Bucket {
	tokens: f64,
	last: Instant,
}

struct WindowLog {
	hits: VecDeque<Instant>,
}

struct FixedWindow {
	index: u64,
	count: u64,
}

enum Algorithm {
	TokenBucket(Sharded<Bucket>),
	SlidingWindow(Sharded<WindowLog>),
	FixedWindow(Sharded<FixedWindow>),
	Distributed(distributed::RemoteLimiter),
}

impl Algorithm {
	fn name(&self) -> &'static str {
		match self {
			Algorithm::TokenBucket(_) => "tokenBucket",
			Algorithm::SlidingWindow(_) => "slidingWindow",
			Algorithm::FixedWindow(_) => "fixedWindow",
			Algorithm::Distributed(_) => "distributed",
		}
	}
}

/// One limiter instance per rule, chosen once at construction. All callers
/// for a given key observe serialized state updates.
pub struct RateLimit {
	rule: RateLimitRule,
	algorithm: Algorithm,
}

impl Debug for RateLimit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RateLimit")
			.field("algorithm", &self.algorithm.name())
			.finish()
	}
}

/// Token buckets hold `burst` tokens (the whole burst is available
/// instantly) and refill at `requests / window`. The window algorithms count
/// up to `requests + burst` per window.
fn bucket_capacity(rule: &RateLimitRule) -> u64 {
	if rule.burst > 0 { rule.burst } else { rule.requests }
}

fn window_capacity(rule: &RateLimitRule) -> u64 {
	rule.requests + rule.burst
}

impl RateLimit {
	pub fn new(
		rule: RateLimitRule,
		algorithm: RateLimitAlgorithm,
		distributed: Option<&DistributedSpec>,
	) -> anyhow::Result<RateLimit> {
		let algorithm = match algorithm {
			RateLimitAlgorithm::TokenBucket => Algorithm::TokenBucket(Sharded::new()),
			RateLimitAlgorithm::SlidingWindow => Algorithm::SlidingWindow(Sharded::new()),
			RateLimitAlgorithm::FixedWindow => Algorithm::FixedWindow(Sharded::new()),
			RateLimitAlgorithm::Distributed => {
				let spec = distributed
					.ok_or_else(|| anyhow::anyhow!("distributed rate limiting requires a shared store"))?;
				Algorithm::Distributed(distributed::RemoteLimiter::new(spec, &rule)?)
			},
		};
		Ok(RateLimit { rule, algorithm })
	}

	pub fn rule(&self) -> &RateLimitRule {
		&self.rule
	}

	pub async fn allow(&self, key: &str) -> Decision {
		match &self.algorithm {
			Algorithm::TokenBucket(state) => {
				let rule = self.rule;
				state.with(
					key,
					|| Bucket {
						tokens: bucket_capacity(&rule) as f64,
						last: Instant::now(),
					},
					|b| check_bucket(&rule, b),
				)
			},
			Algorithm::SlidingWindow(state) => {
				let rule = self.rule;
				state.with(
					key,
					|| WindowLog {
						hits: VecDeque::new(),
					},
					|l| check_log(&rule, l),
				)
			},
			Algorithm::FixedWindow(state) => {
				let rule = self.rule;
				state.with(
					key,
					|| FixedWindow { index: 0, count: 0 },
					|w| check_fixed(&rule, w),
				)
			},
			Algorithm::Distributed(remote) => remote.allow(key, &self.rule).await,
		}
	}

	/// Evict keys idle for more than ten windows.
	pub fn sweep(&self) -> usize {
		let idle = self.rule.window.saturating_mul(10);
		match &self.algorithm {
			Algorithm::TokenBucket(state) => state.sweep(idle),
			Algorithm::SlidingWindow(state) => state.sweep(idle),
			Algorithm::FixedWindow(state) => state.sweep(idle),
			Algorithm::Distributed(remote) => remote.sweep(idle),
		}
	}
}

fn check_bucket(rule: &RateLimitRule, b: &mut Bucket) -> Decision {
	let rate = rule.requests as f64 / rule.window.as_secs_f64();
	let capacity = bucket_capacity(rule) as f64;
	let now = Instant::now();
	// Monotonic clock: duration_since saturates to zero, so drift cannot
	// produce a negative refill.
	let elapsed = now.duration_since(b.last);
	b.tokens = (b.tokens + elapsed.as_secs_f64() * rate).min(capacity);
	b.last = now;
	if b.tokens >= 1.0 {
		b.tokens -= 1.0;
		Decision {
			allowed: true,
			limit: capacity as u64,
			remaining: b.tokens as u64,
			reset_after: Duration::ZERO,
		}
	} else {
		Decision {
			allowed: false,
			limit: capacity as u64,
			remaining: 0,
			reset_after: Duration::from_secs_f64((1.0 - b.tokens) / rate),
		}
	}
}

fn check_log(rule: &RateLimitRule, l: &mut WindowLog) -> Decision {
	let now = Instant::now();
	let capacity = window_capacity(rule);
	loop {
		match l.hits.front() {
			Some(front) if now.duration_since(*front) >= rule.window => {
				l.hits.pop_front();
			},
			_ => break,
		}
	}
	if (l.hits.len() as u64) < capacity {
		l.hits.push_back(now);
		Decision {
			allowed: true,
			limit: capacity,
			remaining: capacity - l.hits.len() as u64,
			reset_after: Duration::ZERO,
		}
	} else {
		let oldest = *l.hits.front().expect("log at capacity is non-empty");
		Decision {
			allowed: false,
			limit: capacity,
			remaining: 0,
			reset_after: rule.window.saturating_sub(now.duration_since(oldest)),
		}
	}
}

fn now_unix_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}

fn check_fixed(rule: &RateLimitRule, w: &mut FixedWindow) -> Decision {
	let now_ms = now_unix_ms();
	let window_ms = (rule.window.as_millis() as u64).max(1);
	let index = now_ms / window_ms;
	if w.index != index {
		w.index = index;
		w.count = 0;
	}
	let capacity = window_capacity(rule);
	let reset_after = Duration::from_millis((index + 1) * window_ms - now_ms);
	if w.count < capacity {
		w.count += 1;
		Decision {
			allowed: true,
			limit: capacity,
			remaining: capacity - w.count,
			reset_after,
		}
	} else {
		Decision {
			allowed: false,
			limit: capacity,
			remaining: 0,
			reset_after,
		}
	}
}

/// The string a request's limiter state is partitioned by, in priority
/// order: known identity, then API key, then remote address. Each scope gets
/// its own namespace so an identity can never collide with an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitKey {
	key: String,
	subject: Option<String>,
}

impl LimitKey {
	pub fn derive(claims: Option<&Claims>, headers: &HeaderMap, peer: IpAddr) -> LimitKey {
		if let Some(claims) = claims {
			return LimitKey {
				key: format!("identity:{}", claims.subject),
				subject: Some(claims.subject.clone()),
			};
		}
		if let Some(api_key) = headers.get(x_headers::X_API_KEY) {
			let mut h = DefaultHasher::new();
			api_key.as_bytes().hash(&mut h);
			return LimitKey {
				key: format!("apikey:{}", hex::encode(h.finish().to_be_bytes())),
				subject: None,
			};
		}
		LimitKey {
			key: format!("ip:{peer}"),
			subject: None,
		}
	}

	pub fn as_str(&self) -> &str {
		&self.key
	}

	pub fn subject(&self) -> Option<&str> {
		self.subject.as_deref()
	}
}

/// The compiled rule set for a snapshot. Rule resolution is explicit:
/// an identity-scoped rule overrides a service-scoped rule overrides the
/// default.
#[derive(Debug, Default)]
pub struct Limits {
	default: Option<Arc<RateLimit>>,
	per_identity: HashMap<String, Arc<RateLimit>>,
	per_service: HashMap<String, Arc<RateLimit>>,
}

impl Limits {
	pub fn new(spec: &RateLimitSpec) -> anyhow::Result<Limits> {
		let distributed = spec.distributed.as_ref();
		let build = |rule: &RateLimitRule| -> anyhow::Result<Arc<RateLimit>> {
			Ok(Arc::new(RateLimit::new(
				*rule,
				spec.algorithm,
				distributed,
			)?))
		};
		let default = spec.default.as_ref().map(&build).transpose()?;
		let per_identity = spec
			.per_identity
			.iter()
			.map(|(k, v)| Ok((k.clone(), build(v)?)))
			.collect::<anyhow::Result<_>>()?;
		let per_service = spec
			.per_service
			.iter()
			.map(|(k, v)| Ok((k.clone(), build(v)?)))
			.collect::<anyhow::Result<_>>()?;
		Ok(Limits {
			default,
			per_identity,
			per_service,
		})
	}

	pub fn is_empty(&self) -> bool {
		self.default.is_none() && self.per_identity.is_empty() && self.per_service.is_empty()
	}

	/// Resolve the applicable rule and consult it. None means no rule covers
	/// this request.
	pub async fn check(&self, key: &LimitKey, service: Option<&str>) -> Option<Decision> {
		if let Some(subject) = key.subject() {
			if let Some(rule) = self.per_identity.get(subject) {
				return Some(rule.allow(key.as_str()).await);
			}
		}
		if let Some(service) = service {
			if let Some(rule) = self.per_service.get(service) {
				// Service limits partition per caller within the service scope
				let scoped = format!("service:{service}:{}", key.as_str());
				return Some(rule.allow(&scoped).await);
			}
		}
		match &self.default {
			Some(rule) => Some(rule.allow(key.as_str()).await),
			None => None,
		}
	}

	pub fn sweep(&self) -> usize {
		let mut evicted = 0;
		if let Some(d) = &self.default {
			evicted += d.sweep();
		}
		for rl in self.per_identity.values() {
			evicted += rl.sweep();
		}
		for rl in self.per_service.values() {
			evicted += rl.sweep();
		}
		evicted
	}
}
