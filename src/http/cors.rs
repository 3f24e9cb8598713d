use std::str::FromStr;

use ::http::{HeaderValue, Method, StatusCode, header};

use crate::http::{Body, Request, Response};
use crate::types::agent::CorsSpec;
use crate::*;

#[derive(Default, Debug, Clone)]
enum WildcardOrList<T> {
	#[default]
	None,
	Wildcard,
	List(Vec<T>),
}

impl<T: FromStr> TryFrom<Vec<String>> for WildcardOrList<T> {
	type Error = T::Err;

	fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
		if value.contains(&"*".to_string()) {
			Ok(WildcardOrList::Wildcard)
		} else if value.is_empty() {
			Ok(WildcardOrList::None)
		} else {
			let vec: Vec<T> = value
				.into_iter()
				.map(|v| T::from_str(&v))
				.collect::<Result<_, _>>()?;
			Ok(WildcardOrList::List(vec))
		}
	}
}

impl<T: ToString> WildcardOrList<T> {
	fn to_header_value(&self) -> Option<HeaderValue> {
		match self {
			WildcardOrList::None => None,
			WildcardOrList::Wildcard => Some(HeaderValue::from_static("*")),
			WildcardOrList::List(list) => {
				let value = list
					.iter()
					.map(|item| item.to_string())
					.collect::<Vec<_>>()
					.join(",");
				HeaderValue::from_str(&value).ok()
			},
		}
	}
}

/// Gateway-level CORS policy. The pipeline short-circuits preflights here;
/// simple requests get the allow headers appended on the way out.
#[derive(Debug, Clone)]
pub struct Cors {
	allow_credentials: bool,
	allow_origins: WildcardOrList<String>,
	allow_methods: WildcardOrList<Method>,
	allow_headers: WildcardOrList<http::HeaderName>,
	max_age: Option<HeaderValue>,
}

impl TryFrom<&CorsSpec> for Cors {
	type Error = anyhow::Error;
	fn try_from(value: &CorsSpec) -> Result<Self, Self::Error> {
		Ok(Cors {
			allow_credentials: value.allow_credentials,
			allow_origins: WildcardOrList::try_from(value.allow_origins.clone())
				.map_err(|_| anyhow::anyhow!("invalid allowOrigins"))?,
			allow_methods: WildcardOrList::try_from(value.allow_methods.clone())?,
			allow_headers: WildcardOrList::try_from(value.allow_headers.clone())?,
			max_age: value
				.max_age
				.and_then(|d| HeaderValue::from_str(&d.as_secs().to_string()).ok()),
		})
	}
}

impl Cors {
	fn origin_allowed(&self, origin: &HeaderValue) -> Option<HeaderValue> {
		match &self.allow_origins {
			WildcardOrList::None => None,
			WildcardOrList::Wildcard => {
				if self.allow_credentials {
					// The wildcard is not valid together with credentials; echo instead
					Some(origin.clone())
				} else {
					Some(HeaderValue::from_static("*"))
				}
			},
			WildcardOrList::List(list) => {
				let o = origin.to_str().ok()?;
				list.iter().any(|a| a == o).then(|| origin.clone())
			},
		}
	}

	/// Terminal response for a CORS preflight, or None if this request is not
	/// one (or its origin is not allowed, which falls through to routing).
	pub fn preflight(&self, req: &Request) -> Option<Response> {
		if req.method() != Method::OPTIONS {
			return None;
		}
		let origin = req.headers().get(header::ORIGIN)?;
		req
			.headers()
			.get(header::ACCESS_CONTROL_REQUEST_METHOD)?;
		let allow_origin = self.origin_allowed(origin)?;

		let mut rb = ::http::Response::builder()
			.status(StatusCode::NO_CONTENT)
			.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
		if let Some(methods) = self.allow_methods.to_header_value() {
			rb = rb.header(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
		}
		if let Some(headers) = self.allow_headers.to_header_value() {
			rb = rb.header(header::ACCESS_CONTROL_ALLOW_HEADERS, headers);
		}
		if let Some(max_age) = &self.max_age {
			rb = rb.header(header::ACCESS_CONTROL_MAX_AGE, max_age);
		}
		if self.allow_credentials {
			rb = rb.header(
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				HeaderValue::from_static("true"),
			);
		}
		Some(rb.body(Body::empty()).expect("static response must build"))
	}

	/// Append allow headers to a non-preflight response.
	pub fn apply(&self, origin: Option<&HeaderValue>, resp: &mut Response) {
		let Some(origin) = origin else { return };
		let Some(allow_origin) = self.origin_allowed(origin) else {
			return;
		};
		let headers = resp.headers_mut();
		headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
		if self.allow_credentials {
			headers.insert(
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				HeaderValue::from_static("true"),
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> Cors {
		Cors::try_from(&CorsSpec {
			allow_credentials: false,
			allow_origins: vec!["https://app.example.com".to_string()],
			allow_methods: vec!["GET".to_string(), "POST".to_string()],
			allow_headers: vec!["content-type".to_string()],
			max_age: Some(Duration::from_secs(600)),
		})
		.unwrap()
	}

	fn preflight_req(origin: &str) -> Request {
		::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("http://gw/users/x")
			.header(header::ORIGIN, origin)
			.header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn preflight_short_circuits() {
		let resp = policy()
			.preflight(&preflight_req("https://app.example.com"))
			.unwrap();
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"https://app.example.com"
		);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET,POST"
		);
	}

	#[test]
	fn unknown_origin_falls_through() {
		assert!(
			policy()
				.preflight(&preflight_req("https://evil.example.com"))
				.is_none()
		);
	}

	#[test]
	fn plain_options_is_not_preflight() {
		let req = ::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("http://gw/users/x")
			.body(Body::empty())
			.unwrap();
		assert!(policy().preflight(&req).is_none());
	}
}
