use std::panic::AssertUnwindSafe;
use std::time::{SystemTime, UNIX_EPOCH};

use ::http::header;
use futures_util::FutureExt;
use rand::Rng;
use tower::util::ServiceExt;

use crate::http::jwt::{Authn, Claims, TokenError};
use crate::http::ratelimit::LimitKey;
use crate::http::timeout::BodyTimeout;
use crate::http::{
	Body, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, retry, split_service_path,
	x_headers,
};
use crate::proxy::ProxyError;
use crate::proxy::circuitbreaker::BreakerPermit;
use crate::proxy::loadbalancer::Endpoint;
use crate::store::{ConfigSnapshot, ServiceRuntime};
use crate::telemetry::log::{LogBody, RequestLog};
use crate::telemetry::metrics::{RateLimitLabels, ServiceLabels, TrafficLabels};
use crate::*;

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;

/// How long an outstanding upstream call may keep running once a drain
/// starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connection-level attributes captured at accept time.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
	pub peer: SocketAddr,
	pub tls: bool,
}

#[derive(Clone)]
pub struct HTTPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
}

impl HTTPProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> HTTPProxy {
		HTTPProxy { inputs }
	}

	pub async fn proxy(
		&self,
		connection: ConnectionInfo,
		req: ::http::Request<hyper::body::Incoming>,
	) -> Response {
		self.handle(connection, req.map(Body::new)).await
	}

	/// The pipeline. Stage order is fixed: id assignment, access-log
	/// capture, panic barrier, metrics timer, CORS preflight, rate limit,
	/// identity, role check, proxy dispatch. A stage that produces a
	/// response short-circuits everything after it.
	pub async fn handle(&self, connection: ConnectionInfo, mut req: Request) -> Response {
		let snapshot = self.inputs.stores.snapshot();
		let id = request_id(req.headers());
		if let Ok(hv) = HeaderValue::from_str(&id) {
			req.headers_mut().insert(x_headers::X_REQUEST_ID, hv);
		}
		let mut log = RequestLog::new(
			id.clone(),
			connection.peer.ip(),
			req.method().clone(),
			req.uri().path().to_string(),
			snapshot.observability.access_log,
		);
		let origin = req.headers().get(header::ORIGIN).cloned();

		let ret = AssertUnwindSafe(self.handle_internal(&snapshot, connection, req, &mut log))
			.catch_unwind()
			.await
			.unwrap_or(Err(ProxyError::Internal));
		if let Err(err) = &ret {
			log.error = Some(err.to_string());
		}
		let mut resp = ret.unwrap_or_else(|err| err.into_response());

		if let Ok(hv) = HeaderValue::from_str(&id) {
			resp.headers_mut().insert(x_headers::X_REQUEST_ID, hv);
		}
		resp
			.headers_mut()
			.insert(x_headers::X_GATEWAY, HeaderValue::from_static(http::GATEWAY_NAME));
		if let Some(cors) = &snapshot.cors {
			cors.apply(origin.as_ref(), &mut resp);
		}

		log.status = Some(resp.status().as_u16());
		let service = log.service.clone().unwrap_or_default();
		self
			.inputs
			.metrics
			.requests
			.get_or_create(&TrafficLabels {
				service: service.clone(),
				method: log.method.to_string(),
				status: resp.status().as_u16() as u32,
			})
			.inc();
		self
			.inputs
			.metrics
			.request_duration
			.get_or_create(&ServiceLabels { service })
			.observe(log.start().elapsed().as_secs_f64());

		// The log record rides the body so the access log covers streaming
		resp.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn handle_internal(
		&self,
		snapshot: &Arc<ConfigSnapshot>,
		connection: ConnectionInfo,
		req: Request,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		if let Some(cors) = &snapshot.cors {
			if let Some(resp) = cors.preflight(&req) {
				return Ok(resp);
			}
		}

		// Best-effort identity extraction. Verification failures only fail
		// the request on protected routes, but a known identity feeds the
		// rate-limit key first.
		let identity: Result<Option<Claims>, TokenError> = match &snapshot.authn {
			Some(authn) => authn.extract(&req),
			None => Ok(None),
		};
		let known_claims: Option<&Claims> = identity.as_ref().ok().and_then(|o| o.as_ref());

		let path = req.uri().path().to_string();
		if is_reserved(&path) {
			if path == "/admin" || path.starts_with("/admin/") {
				let authn = snapshot.authn.as_ref().ok_or(ProxyError::Forbidden)?;
				let claims = match &identity {
					Ok(Some(claims)) => claims,
					Ok(None) => return Err(TokenError::Missing.into()),
					Err(err) => return Err(err.clone().into()),
				};
				if !claims.has_role(authn.admin_role()) {
					return Err(ProxyError::Forbidden);
				}
			}
			return Ok(self.management(req).await);
		}

		let Some((service_name, rest_path)) = split_service_path(&path) else {
			return Err(ProxyError::ServiceNotFound);
		};
		let service = snapshot
			.service(service_name)
			.ok_or(ProxyError::ServiceNotFound)?
			.clone();
		log.service = Some(service.name.clone());

		let key = LimitKey::derive(known_claims, req.headers(), connection.peer.ip());
		if let Some(decision) = snapshot.limits.check(&key, Some(service_name)).await {
			self
				.inputs
				.metrics
				.rate_limit_decisions
				.get_or_create(&RateLimitLabels {
					decision: if decision.allowed { "allowed" } else { "limited" },
				})
				.inc();
			if !decision.allowed {
				debug!(key = key.as_str(), "rate limit exceeded");
				return Err(ProxyError::RateLimitExceeded {
					limit: decision.limit,
					remaining: decision.remaining,
					retry_after_secs: decision.retry_after_secs(),
				});
			}
		}

		if let Some(auth) = &service.auth {
			if auth.required {
				let claims = match &identity {
					Ok(Some(claims)) => claims,
					Ok(None) => return Err(TokenError::Missing.into()),
					Err(err) => return Err(err.clone().into()),
				};
				if !Authn::authorize(claims, auth) {
					return Err(ProxyError::Forbidden);
				}
			}
		}

		self
			.forward(connection, &service, &rest_path, req, log)
			.await
	}

	async fn management(&self, req: Request) -> Response {
		match self.inputs.management.clone().oneshot(req).await {
			Ok(resp) => resp,
			Err(never) => match never {},
		}
	}

	/// Dispatch to an upstream, retrying transport errors for idempotent
	/// methods only. Retries live here rather than in the pipeline because
	/// only the forwarder knows whether body bytes were already sent; the
	/// breaker sees each attempt's outcome as it settles.
	async fn forward(
		&self,
		connection: ConnectionInfo,
		service: &ServiceRuntime,
		rest_path: &str,
		req: Request,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let deadline = service
			.timeout
			.map(|t| tokio::time::Instant::now() + t);
		let (mut head, body) = req.into_parts();
		rewrite_request(&mut head, &connection);

		let attempts = if service.retries > 0 && retry::is_idempotent(&head.method) {
			service.retries as usize + 1
		} else {
			1
		};
		if attempts == 1 {
			return self
				.attempt(service, &head, rest_path, body, deadline, log, 0)
				.await;
		}

		match retry::try_buffer(body, retry::MAX_BUFFERED_BYTES).await {
			Ok(bytes) => {
				for n in 0..attempts {
					let body = Body::from(bytes.clone());
					let res = self
						.attempt(service, &head, rest_path, body, deadline, log, n)
						.await;
					match res {
						Err(err) if err.is_retryable() && n + 1 < attempts => {
							debug!(attempt = n, %err, "retrying after transport error");
							self
								.inputs
								.metrics
								.upstream_retries
								.get_or_create(&ServiceLabels {
									service: service.name.clone(),
								})
								.inc();
							log.retry_attempt = Some((n + 1) as u8);
						},
						other => return other,
					}
				}
				unreachable!("the attempt loop always returns")
			},
			Err(streaming) => {
				debug!("request body too large to buffer for replay, disabling retries");
				self
					.attempt(service, &head, rest_path, streaming, deadline, log, 0)
					.await
			},
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn attempt(
		&self,
		service: &ServiceRuntime,
		head: &::http::request::Parts,
		rest_path: &str,
		body: Body,
		deadline: Option<tokio::time::Instant>,
		log: &mut RequestLog,
		attempt: usize,
	) -> Result<Response, ProxyError> {
		let endpoint = service
			.balancer
			.next_target()
			.ok_or(ProxyError::NoHealthyEndpoints)?;
		log.endpoint = Some(endpoint.target().to_string());

		let permit = match &service.breaker {
			Some(breaker) => match breaker.try_acquire() {
				Ok(permit) => Some(permit),
				Err(retry_after_secs) => {
					service.balancer.release(&endpoint);
					return Err(ProxyError::BreakerOpen { retry_after_secs });
				},
			},
			None => None,
		};

		let mut out = ::http::Request::from_parts(head.clone(), body);
		if attempt > 0 {
			if let Ok(hv) = HeaderValue::from_str(&attempt.to_string()) {
				out
					.headers_mut()
					.insert(HeaderName::from_static("x-retry-attempt"), hv);
			}
		}
		let path_and_query = match head.uri.query() {
			Some(q) => format!("{rest_path}?{q}"),
			None => rest_path.to_string(),
		};
		*out.uri_mut() = Uri::builder()
			.scheme(endpoint.target().scheme.clone())
			.authority(endpoint.target().authority.clone())
			.path_and_query(path_and_query)
			.build()
			.map_err(|e| ProxyError::Processing(e.into()))?;

		// Cancellation of the inbound request drops this future, and the
		// outbound call with it. A drain grants in-flight calls at most
		// SHUTDOWN_GRACE before they are aborted too.
		let shutdown = self.inputs.shutdown.clone();
		let upstream = self.inputs.upstream.clone();
		let call = async move {
			let call = upstream.call(out);
			tokio::pin!(call);
			tokio::select! {
				result = &mut call => Some(result),
				_ = shutdown.cancelled() => tokio::time::timeout(SHUTDOWN_GRACE, call).await.ok(),
			}
		};
		let result = match deadline {
			Some(d) => match tokio::time::timeout_at(d, call).await {
				Ok(result) => result,
				Err(_) => {
					// Expired before response headers arrived
					self.settle(service, &endpoint, permit, false);
					return Err(ProxyError::RequestTimeout);
				},
			},
			None => call.await,
		};
		let result = match result {
			Some(result) => result,
			None => {
				// Aborted by the drain grace
				self.settle(service, &endpoint, permit, false);
				return Err(ProxyError::RequestTimeout);
			},
		};

		let mut resp = match result {
			Ok(resp) => resp,
			Err(err) => {
				// Repeated transport failures take the endpoint out of
				// rotation; the active prober re-admits it once it answers.
				if endpoint.record_transport_failure() {
					info!(endpoint = %endpoint.target(), "endpoint removed from rotation");
				}
				self.settle(service, &endpoint, permit, false);
				return Err(ProxyError::UpstreamCallFailed(err));
			},
		};
		endpoint.record_transport_success();

		let success = !resp.status().is_server_error();
		self.settle(service, &endpoint, permit, success);

		strip_hop_by_hop(resp.headers_mut());
		resp.headers_mut().remove(header::SERVER);

		// Past this point the status is committed; an expiring deadline
		// truncates the body instead of replacing the response.
		Ok(match deadline {
			Some(d) => BodyTimeout::Deadline(d).apply(resp),
			None => resp,
		})
	}

	fn settle<'a>(
		&self,
		service: &'a ServiceRuntime,
		endpoint: &Arc<Endpoint>,
		permit: Option<BreakerPermit<'a>>,
		success: bool,
	) {
		if let (Some(permit), Some(breaker)) = (permit, &service.breaker) {
			breaker.record(permit, success);
		}
		service.balancer.release(endpoint);
	}
}

fn is_reserved(path: &str) -> bool {
	path == "/health"
		|| path == "/metrics"
		|| path.starts_with("/auth/")
		|| path == "/admin"
		|| path.starts_with("/admin/")
}

/// Honor an inbound id from a trusted edge, otherwise mint one.
fn request_id(headers: &HeaderMap) -> String {
	if let Some(existing) = headers
		.get(x_headers::X_REQUEST_ID)
		.and_then(|v| v.to_str().ok())
	{
		if !existing.is_empty() {
			return existing.to_string();
		}
	}
	format!("{:032x}", rand::rng().random::<u128>())
}

// Hop-by-hop headers. These are removed when sent to the backend.
// As of RFC 7230, hop-by-hop headers are required to appear in the
// Connection header field. These are the headers defined by the
// obsoleted RFC 2616 (section 13.5.1) and are used for backward
// compatibility.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
	let addr = peer.to_string();
	let value = match headers
		.get(x_headers::X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
	{
		Some(existing) => format!("{existing}, {addr}"),
		None => addr,
	};
	if let Ok(hv) = HeaderValue::from_str(&value) {
		headers.insert(x_headers::X_FORWARDED_FOR, hv);
	}
}

/// The rewrite shared by every attempt: forwarded headers on, hop-by-hop
/// headers off. The authority is set per attempt once an endpoint is known.
fn rewrite_request(head: &mut ::http::request::Parts, connection: &ConnectionInfo) {
	let original_host = head
		.uri
		.authority()
		.map(|a| a.to_string())
		.or_else(|| {
			head
				.headers
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
				.map(str::to_string)
		});
	strip_hop_by_hop(&mut head.headers);
	head.headers.remove(header::HOST);
	append_forwarded_for(&mut head.headers, connection.peer.ip());
	if let Some(host) = original_host {
		if let Ok(hv) = HeaderValue::from_str(&host) {
			head.headers.insert(x_headers::X_FORWARDED_HOST, hv);
		}
	}
	head.headers.insert(
		x_headers::X_FORWARDED_PROTO,
		HeaderValue::from_static(if connection.tls { "https" } else { "http" }),
	);
	head
		.headers
		.insert(x_headers::X_GATEWAY, HeaderValue::from_static(http::GATEWAY_NAME));
	let now_ms = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis();
	if let Ok(hv) = HeaderValue::from_str(&now_ms.to_string()) {
		head.headers.insert(x_headers::X_GATEWAY_TIME, hv);
	}
}
