use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::proxy::gateway::Gateway;
use crate::proxy::loadbalancer::Endpoint;
use crate::store::Stores;
use crate::telemetry::metrics::Metrics;
use crate::types::agent::{HealthCheckSpec, ProbeMode};
use crate::*;

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let snapshot = config::compile(&cfg.raw, metrics.clone(), 1)?;
	let stores = Stores::new(snapshot);
	let registry = Arc::new(registry);
	let management = management::router(stores.clone(), registry);

	let cfg = Arc::new(cfg);
	let shutdown = CancellationToken::new();
	let inputs = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		stores: stores.clone(),
		metrics: metrics.clone(),
		upstream: client::Client::new(),
		management,
		shutdown: shutdown.clone(),
	});

	// Keep the watcher alive for the process lifetime
	let _watcher = match &cfg.config_path {
		Some(path) => Some(config::spawn_watcher(
			path.clone(),
			stores.clone(),
			metrics.clone(),
			1,
		)?),
		None => None,
	};

	spawn_sweeper(stores.clone(), shutdown.clone());
	spawn_prober(stores.clone(), shutdown.clone());

	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			shutdown_signal().await;
			info!("shutdown signal received, draining");
			shutdown.cancel();
		});
	}

	let listener = TcpListener::bind(cfg.address).await?;
	Gateway::new(inputs).run(listener).await
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		let term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
		match term {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {},
					_ = term.recv() => {},
				}
			},
			Err(_) => {
				let _ = tokio::signal::ctrl_c().await;
			},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

/// Evicts limiter keys idle beyond their retention. The sweep locks the
/// same shards as decisions, so it cannot race one.
fn spawn_sweeper(stores: Stores, shutdown: CancellationToken) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(30));
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = interval.tick() => {
					let evicted = stores.snapshot().limits.sweep();
					if evicted > 0 {
						debug!(evicted, "swept idle rate limit keys");
					}
				}
				_ = shutdown.cancelled() => return,
			}
		}
	});
}

/// Optional active probing: re-marks endpoint health on an interval. This
/// is the recovery path for endpoints taken out by breaker outcomes.
fn spawn_prober(stores: Stores, shutdown: CancellationToken) {
	tokio::spawn(async move {
		let prober_client = client::Client::new();
		loop {
			let interval = match stores.snapshot().health_check.as_ref() {
				Some(hc) => hc.interval,
				// Nothing configured now; a reload may add it
				None => Duration::from_secs(5),
			};
			tokio::select! {
				_ = tokio::time::sleep(interval) => {},
				_ = shutdown.cancelled() => return,
			}
			let snapshot = stores.snapshot();
			let Some(hc) = snapshot.health_check.clone() else {
				continue;
			};
			for svc in snapshot.services.values() {
				for ep in svc.balancer.endpoints() {
					let healthy = probe(&prober_client, &hc, ep).await;
					if healthy != ep.is_healthy() {
						info!(
							service = %svc.name,
							endpoint = %ep.target(),
							healthy,
							"probe changed endpoint health"
						);
					}
					if healthy {
						svc.balancer.mark_healthy(ep);
					} else {
						svc.balancer.mark_unhealthy(ep);
					}
				}
			}
		}
	});
}

async fn probe(client: &client::Client, hc: &HealthCheckSpec, ep: &Endpoint) -> bool {
	let timeout = Duration::from_secs(1);
	match hc.mode {
		ProbeMode::Tcp => {
			let authority = &ep.target().authority;
			let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
			matches!(
				tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
				Ok(Ok(_))
			)
		},
		ProbeMode::Http => {
			let uri = format!("{}{}", ep.target(), hc.path);
			let Ok(req) = ::http::Request::builder().uri(uri).body(http::Body::empty()) else {
				return false;
			};
			match tokio::time::timeout(timeout, client.call(req)).await {
				Ok(Ok(resp)) => resp.status().is_success(),
				_ => false,
			}
		},
	}
}
