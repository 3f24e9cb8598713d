use rand::Rng;
use redis::aio::ConnectionManager;

use super::{Bucket, Decision, Sharded, bucket_capacity, check_bucket, now_unix_ms, window_capacity};
use crate::types::agent::{DistributedSpec, RateLimitRule};
use crate::*;

/// Atomic script on the shared store: trim entries older than the trailing
/// window, read cardinality, conditionally insert, report the remaining
/// budget and when the oldest entry expires. Runs as one unit on the server.
const LIMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]
redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  allowed = 1
  count = count + 1
end
redis.call('PEXPIRE', key, window * 10)
local reset = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = (tonumber(oldest[2]) + window) - now
end
return {allowed, limit - count, reset}
"#;

/// Rate limiting coordinated through a shared key-value store, so every
/// gateway instance draws from the same budget. Store outages either deny
/// (fail-closed) or fall through to a local emergency bucket capped at ten
/// times the nominal limit (fail-open, the default).
pub(super) struct RemoteLimiter {
	client: redis::Client,
	manager: tokio::sync::OnceCell<ConnectionManager>,
	script: redis::Script,
	fail_open: bool,
	key_prefix: String,
	emergency_rule: RateLimitRule,
	emergency: Sharded<Bucket>,
}

impl RemoteLimiter {
	pub(super) fn new(spec: &DistributedSpec, rule: &RateLimitRule) -> anyhow::Result<RemoteLimiter> {
		let client = redis::Client::open(spec.url.as_str())?;
		let emergency_rule = RateLimitRule {
			requests: rule.requests.saturating_mul(10),
			window: rule.window,
			burst: rule.burst.saturating_mul(10),
		};
		Ok(RemoteLimiter {
			client,
			manager: tokio::sync::OnceCell::new(),
			script: redis::Script::new(LIMIT_SCRIPT),
			fail_open: spec.fail_open,
			key_prefix: spec.key_prefix.clone(),
			emergency_rule,
			emergency: Sharded::new(),
		})
	}

	pub(super) async fn allow(&self, key: &str, rule: &RateLimitRule) -> Decision {
		match self.check_remote(key, rule).await {
			Ok(decision) => decision,
			Err(err) => {
				warn!(%err, "shared store unavailable for rate limiting");
				if self.fail_open {
					self.check_emergency(key)
				} else {
					Decision {
						allowed: false,
						limit: window_capacity(rule),
						remaining: 0,
						reset_after: rule.window,
					}
				}
			},
		}
	}

	async fn check_remote(
		&self,
		key: &str,
		rule: &RateLimitRule,
	) -> Result<Decision, redis::RedisError> {
		let mut conn = self
			.manager
			.get_or_try_init(|| ConnectionManager::new(self.client.clone()))
			.await?
			.clone();
		let now = now_unix_ms();
		let window_ms = (rule.window.as_millis() as u64).max(1);
		let limit = window_capacity(rule);
		// Members must be unique even when two entries share a millisecond
		let member = format!("{now}-{:08x}", rand::rng().random::<u32>());
		let (allowed, remaining, reset_ms): (i64, i64, i64) = self
			.script
			.key(format!("{}{}", self.key_prefix, key))
			.arg(window_ms)
			.arg(limit)
			.arg(now)
			.arg(member)
			.invoke_async(&mut conn)
			.await?;
		Ok(Decision {
			allowed: allowed == 1,
			limit,
			remaining: remaining.max(0) as u64,
			reset_after: Duration::from_millis(reset_ms.max(0) as u64),
		})
	}

	fn check_emergency(&self, key: &str) -> Decision {
		let rule = self.emergency_rule;
		self.emergency.with(
			key,
			|| Bucket {
				tokens: bucket_capacity(&rule) as f64,
				last: Instant::now(),
			},
			|b| check_bucket(&rule, b),
		)
	}

	pub(super) fn sweep(&self, idle: Duration) -> usize {
		self.emergency.sweep(idle)
	}
}
