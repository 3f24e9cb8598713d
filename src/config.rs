use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, bail};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use secrecy::ExposeSecret;

use crate::http::cors::Cors;
use crate::http::jwt::Authn;
use crate::http::ratelimit::Limits;
use crate::proxy::circuitbreaker::CircuitBreaker;
use crate::proxy::loadbalancer::LoadBalancer;
use crate::store::{ConfigSnapshot, ServiceRuntime, Stores};
use crate::telemetry::metrics::Metrics;
use crate::types::agent::{RateLimitAlgorithm, RateLimitRule, ServiceSpec, Target};
use crate::*;

/// On-disk configuration shape. Everything here can change on reload except
/// the bind address, which is fixed for the process lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
	#[serde(default)]
	pub services: HashMap<String, ServiceSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<types::agent::RateLimitSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth: Option<types::agent::AuthSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cors: Option<types::agent::CorsSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub health_check: Option<types::agent::HealthCheckSpec>,
	#[serde(default)]
	pub observability: types::agent::ObservabilitySpec,
}

/// Static process configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
	pub address: SocketAddr,
	pub config_path: Option<PathBuf>,
	pub raw: RawConfig,
}

pub fn parse_config(contents: &str) -> anyhow::Result<RawConfig> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("configuration is not valid YAML")?;
	validate(&raw)?;
	Ok(raw)
}

pub fn load(path: &PathBuf) -> anyhow::Result<Config> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read configuration at {}", path.display()))?;
	let raw = parse_config(&contents)?;
	let host: IpAddr = raw
		.host
		.as_deref()
		.unwrap_or("0.0.0.0")
		.parse()
		.context("host is not a valid IP address")?;
	let port = raw.port.unwrap_or(8080);
	Ok(Config {
		address: SocketAddr::from((host, port)),
		config_path: Some(path.clone()),
		raw,
	})
}

/// Validation is total: a snapshot either passes every check here and
/// compiles, or the previous snapshot stays active.
pub fn validate(raw: &RawConfig) -> anyhow::Result<()> {
	if raw.port == Some(0) {
		bail!("server port must be within 1..=65535");
	}
	for (name, svc) in &raw.services {
		if svc.endpoints.is_empty() {
			bail!("service {name} must have at least one endpoint");
		}
		for ep in &svc.endpoints {
			Target::parse(ep.url()).with_context(|| format!("service {name}"))?;
		}
		if let Some(cb) = &svc.circuit_breaker {
			if cb.failure_threshold == 0 {
				bail!("service {name}: circuit breaker failure threshold must be positive");
			}
			if cb.open_duration.is_zero() {
				bail!("service {name}: circuit breaker open duration must be positive");
			}
			if cb.probe_budget == 0 {
				bail!("service {name}: circuit breaker probe budget must be positive");
			}
		}
	}
	if let Some(rl) = &raw.rate_limit {
		let check_rule = |scope: &str, rule: &RateLimitRule| -> anyhow::Result<()> {
			if rule.requests == 0 {
				bail!("rate limit rule {scope} must permit a positive number of requests");
			}
			if rule.window.is_zero() {
				bail!("rate limit rule {scope} must have a positive window");
			}
			Ok(())
		};
		if let Some(rule) = &rl.default {
			check_rule("default", rule)?;
		}
		for (id, rule) in &rl.per_identity {
			check_rule(&format!("identity {id}"), rule)?;
		}
		for (svc, rule) in &rl.per_service {
			check_rule(&format!("service {svc}"), rule)?;
			if !raw.services.contains_key(svc) {
				bail!("rate limit rule targets unknown service {svc}");
			}
		}
		if rl.algorithm == RateLimitAlgorithm::Distributed {
			match &rl.distributed {
				Some(d) if !d.url.is_empty() => {},
				_ => bail!("distributed rate limiting requires a shared store url"),
			}
		}
	}
	let protected = raw
		.services
		.values()
		.any(|s| s.auth.as_ref().is_some_and(|a| a.required));
	if protected {
		match &raw.auth {
			Some(auth) if !auth.secret.expose_secret().is_empty() => {},
			_ => bail!("a non-empty signing secret is required when protected routes exist"),
		}
	}
	Ok(())
}

/// Build the runtime snapshot off-line. Nothing the hot path reads is
/// constructed lazily after this point.
pub fn compile(
	raw: &RawConfig,
	metrics: Arc<Metrics>,
	version: u64,
) -> anyhow::Result<ConfigSnapshot> {
	let mut services = HashMap::with_capacity(raw.services.len());
	for (name, spec) in &raw.services {
		let balancer = LoadBalancer::new(&spec.endpoints, spec.lb_policy)
			.with_context(|| format!("service {name}"))?;
		let breaker = match &spec.circuit_breaker {
			Some(cb) if cb.enabled => Some(CircuitBreaker::new(
				name.clone(),
				cb.clone(),
				metrics.clone(),
			)),
			_ => None,
		};
		services.insert(
			name.clone(),
			Arc::new(ServiceRuntime {
				name: name.clone(),
				spec: spec.clone(),
				timeout: spec.timeout,
				retries: spec.retries,
				auth: spec.auth.clone(),
				balancer,
				breaker,
			}),
		);
	}
	let limits = match &raw.rate_limit {
		Some(spec) => Limits::new(spec)?,
		None => Limits::default(),
	};
	let authn = raw.auth.as_ref().map(|a| Arc::new(Authn::new(a)));
	let cors = raw.cors.as_ref().map(Cors::try_from).transpose()?;
	Ok(ConfigSnapshot {
		version,
		services,
		limits,
		authn,
		cors,
		health_check: raw.health_check.clone(),
		observability: raw.observability.clone(),
	})
}

/// Watch the config file and republish on change. Invalid snapshots are
/// rejected; the active snapshot stays as it was.
pub fn spawn_watcher(
	path: PathBuf,
	stores: Stores,
	metrics: Arc<Metrics>,
	initial_version: u64,
) -> anyhow::Result<RecommendedWatcher> {
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		match res {
			Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
				let _ = tx.send(());
			},
			Ok(_) => {},
			Err(err) => warn!(%err, "configuration watch error"),
		}
	})?;
	watcher.watch(&path, RecursiveMode::NonRecursive)?;

	let version = AtomicU64::new(initial_version);
	tokio::spawn(async move {
		while rx.recv().await.is_some() {
			// Editors fire bursts of events; settle, then drain
			tokio::time::sleep(Duration::from_millis(200)).await;
			while rx.try_recv().is_ok() {}
			let next = version.fetch_add(1, Ordering::Relaxed) + 1;
			match reload(&path, metrics.clone(), next) {
				Ok(snapshot) => stores.publish(snapshot),
				Err(err) => {
					warn!(%err, "rejecting configuration change, keeping the previous snapshot");
				},
			}
		}
	});
	Ok(watcher)
}

fn reload(path: &PathBuf, metrics: Arc<Metrics>, version: u64) -> anyhow::Result<ConfigSnapshot> {
	let contents = std::fs::read_to_string(path)?;
	let raw = parse_config(&contents)?;
	compile(&raw, metrics, version)
}
