pub mod app;
pub mod client;
pub mod config;
pub mod http;
pub mod management;
pub mod proxy;
pub mod serdes;
pub mod store;
pub mod telemetry;
pub mod types;

// Shared prelude. Modules pull this in with `use crate::*;`.
pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, SocketAddr};
pub use std::pin::Pin;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::serdes::{is_default, serde_dur, serde_dur_option};

/// Everything the proxy needs to process a request. Built once at startup;
/// the dynamic parts live behind `stores`.
#[derive(Clone)]
pub struct ProxyInputs {
	pub cfg: Arc<config::Config>,
	pub stores: store::Stores,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	pub upstream: client::Client,
	pub management: axum::Router,
	/// Cancelled when a drain starts; outstanding upstream calls abort
	/// within a bounded grace once it fires.
	pub shutdown: tokio_util::sync::CancellationToken,
}
