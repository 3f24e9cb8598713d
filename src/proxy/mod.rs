pub mod circuitbreaker;
pub mod gateway;
pub mod httpproxy;
pub mod loadbalancer;

use crate::http::jwt::TokenError;
use crate::http::{Body, HeaderValue, Response, StatusCode, x_headers};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("authentication failure: {0}")]
	InvalidCredential(#[from] TokenError),
	#[error("role check failed")]
	Forbidden,
	#[error("rate limit exceeded")]
	RateLimitExceeded {
		limit: u64,
		remaining: u64,
		retry_after_secs: u64,
	},
	#[error("no route for request path")]
	ServiceNotFound,
	#[error("no healthy upstream endpoints")]
	NoHealthyEndpoints,
	#[error("circuit breaker is open")]
	BreakerOpen { retry_after_secs: u64 },
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(hyper_util::client::legacy::Error),
	#[error("request timeout")]
	RequestTimeout,
	#[error("invalid request")]
	InvalidRequest,
	#[error("internal error")]
	Internal,
	#[error("processing failed: {0}")]
	Processing(#[from] anyhow::Error),
}

impl ProxyError {
	/// Only transport-level failures are eligible for another attempt; the
	/// forwarder additionally gates on method idempotency and body replay.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProxyError::UpstreamCallFailed(_))
	}

	pub fn into_response(self) -> Response {
		let code = match &self {
			ProxyError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
			ProxyError::Forbidden => StatusCode::FORBIDDEN,
			ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::ServiceNotFound => StatusCode::NOT_FOUND,
			ProxyError::NoHealthyEndpoints => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let msg = self.to_string();
		let mut rb = ::http::Response::builder()
			.status(code)
			.header(::http::header::CONTENT_TYPE, "text/plain");

		// Apply per-error headers
		match &self {
			ProxyError::RateLimitExceeded {
				limit,
				remaining,
				retry_after_secs,
			} => {
				if let Ok(hv) = HeaderValue::try_from(limit.to_string()) {
					rb = rb.header(x_headers::X_RATELIMIT_LIMIT, hv);
				}
				if let Ok(hv) = HeaderValue::try_from(remaining.to_string()) {
					rb = rb.header(x_headers::X_RATELIMIT_REMAINING, hv);
				}
				if let Ok(hv) = HeaderValue::try_from(retry_after_secs.to_string()) {
					rb = rb.header(::http::header::RETRY_AFTER, hv);
				}
			},
			ProxyError::BreakerOpen { retry_after_secs } => {
				if let Ok(hv) = HeaderValue::try_from(retry_after_secs.to_string()) {
					rb = rb.header(::http::header::RETRY_AFTER, hv);
				}
			},
			_ => {},
		}
		rb.body(Body::from(msg)).expect("static response must build")
	}
}
