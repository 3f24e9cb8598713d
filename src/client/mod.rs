use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::*;

/// Pooled upstream HTTP client shared by every forwarded request.
#[derive(Clone)]
pub struct Client {
	client: legacy::Client<HttpConnector, http::Body>,
}

impl Client {
	pub fn new() -> Client {
		let mut connector = HttpConnector::new();
		connector.set_nodelay(true);
		connector.set_connect_timeout(Some(Duration::from_secs(5)));
		let client = legacy::Client::builder(TokioExecutor::new())
			.pool_idle_timeout(Duration::from_secs(90))
			.pool_max_idle_per_host(32)
			.build(connector);
		Client { client }
	}

	/// Issue the rewritten request. Response bodies stream; nothing here
	/// buffers them.
	pub async fn call(&self, req: http::Request) -> Result<http::Response, legacy::Error> {
		let resp = self.client.request(req).await?;
		Ok(resp.map(http::Body::new))
	}
}

impl Default for Client {
	fn default() -> Self {
		Self::new()
	}
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}
