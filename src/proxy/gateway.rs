use std::convert::Infallible;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::proxy::httpproxy::{ConnectionInfo, HTTPProxy};
use crate::*;

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;

/// How long connections get to flush after a drain starts. Upstream calls
/// are already aborted within one second of the drain signal; this only
/// covers writing out the responses.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct Gateway {
	inputs: Arc<ProxyInputs>,
}

impl Gateway {
	pub fn new(inputs: Arc<ProxyInputs>) -> Gateway {
		Gateway { inputs }
	}

	/// Accept loop: one task per connection, cooperative drain on shutdown.
	pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
		let shutdown = self.inputs.shutdown.clone();
		let mut connections = JoinSet::new();
		let proxy = HTTPProxy::new(self.inputs.clone());
		info!(address = %listener.local_addr()?, "gateway listening");
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(accepted) => accepted,
						Err(err) => {
							warn!(%err, "failed to accept connection");
							continue;
						},
					};
					let proxy = proxy.clone();
					let shutdown = shutdown.clone();
					connections.spawn(async move {
						serve_connection(stream, peer, proxy, shutdown).await;
					});
				}
				Some(res) = connections.join_next() => {
					if let Err(err) = res {
						debug!("connection task failed: {err}");
					}
				}
				_ = shutdown.cancelled() => break,
			}
		}
		info!("stopped accepting connections; draining");
		let drained = async {
			while connections.join_next().await.is_some() {}
		};
		if tokio::time::timeout(DRAIN_GRACE, drained).await.is_err() {
			warn!("drain grace period expired; aborting remaining connections");
			connections.abort_all();
		}
		Ok(())
	}
}

async fn serve_connection(
	stream: TcpStream,
	peer: SocketAddr,
	proxy: HTTPProxy,
	shutdown: CancellationToken,
) {
	let _ = stream.set_nodelay(true);
	debug!(%peer, "connection opened");
	let connection = ConnectionInfo { peer, tls: false };
	let service = hyper::service::service_fn(move |req| {
		let proxy = proxy.clone();
		async move { Ok::<_, Infallible>(proxy.proxy(connection, req).await) }
	});
	let builder = auto::Builder::new(TokioExecutor::new());
	let conn = builder.serve_connection(TokioIo::new(stream), service);
	tokio::pin!(conn);
	tokio::select! {
		res = conn.as_mut() => {
			if let Err(err) = res {
				debug!(%peer, "connection closed: {err}");
			}
		}
		_ = shutdown.cancelled() => {
			// Suggests clients go away (GOAWAY / connection: close), then
			// lets outstanding requests finish
			conn.as_mut().graceful_shutdown();
			let _ = conn.as_mut().await;
		}
	}
	debug!(%peer, "connection completed");
}
