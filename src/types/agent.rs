use std::collections::HashMap;
use std::str::FromStr;

use ::http::Uri;
use ::http::uri::{Authority, Scheme};
use anyhow::anyhow;
use secrecy::SecretString;

use crate::*;

pub type ServiceName = String;

/// A parsed upstream address: scheme plus authority. Paths on endpoint URLs
/// are rejected at validation time; the inbound path is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
	pub scheme: Scheme,
	pub authority: Authority,
}

impl Target {
	pub fn parse(raw: &str) -> anyhow::Result<Target> {
		let uri = Uri::try_from(raw)?;
		let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
		if scheme != Scheme::HTTP {
			return Err(anyhow!("unsupported endpoint scheme {scheme} for {raw}"));
		}
		let authority = uri
			.authority()
			.cloned()
			.ok_or_else(|| anyhow!("endpoint {raw} has no authority"))?;
		match uri.path() {
			"" | "/" => {},
			p => return Err(anyhow!("endpoint {raw} must not carry a path (got {p})")),
		}
		Ok(Target { scheme, authority })
	}
}

impl Display for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}://{}", self.scheme, self.authority)
	}
}

impl Serialize for Target {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

/// One upstream entry in a service spec. Accepts either a bare URL or a
/// `{url, weight}` pair for weighted round robin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
	Url(String),
	Weighted { url: String, weight: u32 },
}

impl EndpointSpec {
	pub fn url(&self) -> &str {
		match self {
			EndpointSpec::Url(u) => u,
			EndpointSpec::Weighted { url, .. } => url,
		}
	}
	pub fn weight(&self) -> u32 {
		match self {
			EndpointSpec::Url(_) => 1,
			EndpointSpec::Weighted { weight, .. } => *weight,
		}
	}
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LbPolicy {
	#[default]
	RoundRobin,
	WeightedRoundRobin,
	LeastConnections,
	Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitBreakerSpec {
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub failure_threshold: u32,
	#[serde(with = "serde_dur")]
	pub open_duration: Duration,
	#[serde(default = "default_probe_budget")]
	pub probe_budget: u32,
	/// Successes needed in HalfOpen to close again. Defaults to the probe budget.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub required_successes: Option<u32>,
}

impl CircuitBreakerSpec {
	pub fn required_successes(&self) -> u32 {
		self.required_successes.unwrap_or(self.probe_budget)
	}
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleMatch {
	/// The caller must hold at least one of the listed roles.
	#[default]
	AnyOf,
	/// The caller must hold every listed role.
	AllOf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteAuth {
	#[serde(default)]
	pub required: bool,
	#[serde(default, skip_serializing_if = "is_default")]
	pub roles: Vec<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub role_match: RoleMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
	pub endpoints: Vec<EndpointSpec>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub lb_policy: LbPolicy,
	#[serde(
		default,
		skip_serializing_if = "Option::is_none",
		with = "serde_dur_option"
	)]
	pub timeout: Option<Duration>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub retries: u8,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub circuit_breaker: Option<CircuitBreakerSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth: Option<RouteAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitRule {
	pub requests: u64,
	#[serde(with = "serde_dur")]
	pub window: Duration,
	#[serde(default, skip_serializing_if = "is_default")]
	pub burst: u64,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitAlgorithm {
	#[default]
	TokenBucket,
	SlidingWindow,
	FixedWindow,
	Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DistributedSpec {
	pub url: String,
	/// On shared-store outage: fall through to a local emergency limiter
	/// (true) or deny (false).
	#[serde(default = "default_true")]
	pub fail_open: bool,
	#[serde(default = "default_key_prefix")]
	pub key_prefix: String,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitSpec {
	#[serde(default, skip_serializing_if = "is_default")]
	pub algorithm: RateLimitAlgorithm,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default: Option<RateLimitRule>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub per_identity: HashMap<String, RateLimitRule>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub per_service: HashMap<ServiceName, RateLimitRule>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub distributed: Option<DistributedSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserSpec {
	pub username: String,
	#[serde(skip_serializing)]
	pub password: SecretString,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthSpec {
	#[serde(skip_serializing)]
	pub secret: SecretString,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub issuer: Option<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub audiences: Vec<String>,
	#[serde(default = "default_admin_role")]
	pub admin_role: String,
	#[serde(default = "default_token_ttl", with = "serde_dur")]
	pub token_ttl: Duration,
	#[serde(default)]
	pub users: Vec<UserSpec>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeMode {
	#[default]
	Tcp,
	Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckSpec {
	#[serde(default = "default_probe_interval", with = "serde_dur")]
	pub interval: Duration,
	#[serde(default, skip_serializing_if = "is_default")]
	pub mode: ProbeMode,
	#[serde(default = "default_health_path")]
	pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObservabilitySpec {
	#[serde(default = "default_true")]
	pub access_log: bool,
}

impl Default for ObservabilitySpec {
	fn default() -> Self {
		ObservabilitySpec { access_log: true }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CorsSpec {
	#[serde(default)]
	pub allow_credentials: bool,
	#[serde(default, skip_serializing_if = "is_default")]
	pub allow_origins: Vec<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub allow_methods: Vec<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub allow_headers: Vec<String>,
	#[serde(
		default,
		skip_serializing_if = "Option::is_none",
		with = "serde_dur_option"
	)]
	pub max_age: Option<Duration>,
}

fn default_true() -> bool {
	true
}

fn default_probe_budget() -> u32 {
	1
}

fn default_admin_role() -> String {
	"admin".to_string()
}

fn default_token_ttl() -> Duration {
	Duration::from_secs(3600)
}

fn default_probe_interval() -> Duration {
	Duration::from_secs(10)
}

fn default_health_path() -> String {
	"/health".to_string()
}

fn default_key_prefix() -> String {
	"edgegate:rl:".to_string()
}

impl FromStr for Target {
	type Err = anyhow::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Target::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn target_parsing() {
		let t = Target::parse("http://127.0.0.1:8081").unwrap();
		assert_eq!(t.authority.as_str(), "127.0.0.1:8081");
		assert!(Target::parse("https://a:1").is_err());
		assert!(Target::parse("http://a:1/path").is_err());
		assert!(Target::parse("not a url").is_err());
	}

	#[test]
	fn endpoint_spec_forms() {
		let plain: EndpointSpec = serde_yaml::from_str("http://a:1").unwrap();
		assert_eq!(plain.url(), "http://a:1");
		assert_eq!(plain.weight(), 1);
		let weighted: EndpointSpec = serde_yaml::from_str("{url: 'http://b:1', weight: 5}").unwrap();
		assert_eq!(weighted.url(), "http://b:1");
		assert_eq!(weighted.weight(), 5);
	}

	#[test]
	fn service_spec_defaults() {
		let svc: ServiceSpec = serde_yaml::from_str("endpoints: ['http://a:1']").unwrap();
		assert_eq!(svc.lb_policy, LbPolicy::RoundRobin);
		assert_eq!(svc.retries, 0);
		assert!(svc.timeout.is_none());
		assert!(svc.circuit_breaker.is_none());
	}
}
