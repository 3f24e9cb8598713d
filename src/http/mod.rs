pub mod cors;
pub mod jwt;
pub mod ratelimit;
pub mod retry;
pub mod timeout;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};

pub mod x_headers {
	use http::HeaderName;

	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_GATEWAY: HeaderName = HeaderName::from_static("x-gateway");
	pub const X_GATEWAY_TIME: HeaderName = HeaderName::from_static("x-gateway-time");
	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
	pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
	pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
	pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
	pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
	pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
}

/// Value of the `X-Gateway` header in both directions.
pub const GATEWAY_NAME: &str = "edgegate";

/// Splits `/svc/rest/of/path` into the service selector and the path
/// remainder that is forwarded upstream verbatim.
pub fn split_service_path(path: &str) -> Option<(&str, String)> {
	let trimmed = path.strip_prefix('/')?;
	if trimmed.is_empty() {
		return None;
	}
	match trimmed.split_once('/') {
		Some((svc, rest)) => Some((svc, format!("/{rest}"))),
		None => Some((trimmed, "/".to_string())),
	}
}
