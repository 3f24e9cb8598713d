use http_body_util::BodyExt;
use prometheus_client::registry::Registry;
use wiremock::matchers::{any, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::{self, RawConfig};
use crate::http::StatusCode;
use crate::store::Stores;
use crate::telemetry::metrics::Metrics;

fn build_proxy(yaml: &str) -> (HTTPProxy, Stores, Arc<Metrics>) {
	let raw: RawConfig = config::parse_config(yaml).unwrap();
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let snapshot = config::compile(&raw, metrics.clone(), 1).unwrap();
	let stores = Stores::new(snapshot);
	let management = crate::management::router(stores.clone(), Arc::new(registry));
	let cfg = Arc::new(config::Config {
		address: "127.0.0.1:0".parse().unwrap(),
		config_path: None,
		raw,
	});
	let inputs = Arc::new(ProxyInputs {
		cfg,
		stores: stores.clone(),
		metrics: metrics.clone(),
		upstream: client::Client::new(),
		management,
		shutdown: tokio_util::sync::CancellationToken::new(),
	});
	(HTTPProxy::new(inputs), stores, metrics)
}

fn conn() -> ConnectionInfo {
	ConnectionInfo {
		peer: "1.2.3.4:55555".parse().unwrap(),
		tls: false,
	}
}

fn get(uri: &str) -> Request {
	::http::Request::builder()
		.method("GET")
		.uri(uri)
		.header("host", "gw.example.com")
		.body(Body::empty())
		.unwrap()
}

async fn body_string(resp: Response) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn round_robin_alternates_upstreams() {
	let a = MockServer::start().await;
	let b = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_body_string("a"))
		.mount(&a)
		.await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_body_string("b"))
		.mount(&b)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		r#"
services:
  u:
    endpoints: ["{}", "{}"]
"#,
		a.uri(),
		b.uri()
	));

	for expected in ["a", "b", "a"] {
		let resp = proxy.handle(conn(), get("/u/x")).await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_string(resp).await, expected);
	}
}

#[tokio::test]
async fn path_remainder_is_forwarded_verbatim() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/profile/42"))
		.respond_with(ResponseTemplate::new(200).set_body_string("found"))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		"services:\n  users:\n    endpoints: [\"{}\"]\n",
		upstream.uri()
	));

	let resp = proxy.handle(conn(), get("/users/profile/42?x=1")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, "found");
}

#[tokio::test]
async fn forwarded_headers_are_set() {
	let upstream = MockServer::start().await;
	Mock::given(header("x-gateway", "edgegate"))
		.and(header("x-forwarded-proto", "http"))
		.and(header("x-forwarded-for", "1.2.3.4"))
		.and(header("x-forwarded-host", "gw.example.com"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		upstream.uri()
	));

	let resp = proxy.handle(conn(), get("/u/anything")).await;
	// The mock only matches when every forwarded header is present
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.headers().get(x_headers::X_REQUEST_ID).is_some());
	assert_eq!(resp.headers().get(x_headers::X_GATEWAY).unwrap(), "edgegate");
}

#[tokio::test]
async fn response_server_header_is_stripped() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).insert_header("server", "upstream-v1"))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		upstream.uri()
	));

	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert!(resp.headers().get(header::SERVER).is_none());
}

#[tokio::test]
async fn unknown_service_is_404() {
	let (proxy, _, _) = build_proxy("services:\n  u:\n    endpoints: [\"http://127.0.0.1:1\"]\n");
	let resp = proxy.handle(conn(), get("/nope/x")).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	let resp = proxy.handle(conn(), get("/")).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_bucket_burst_then_429_with_retry_after() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		r#"
services:
  u:
    endpoints: ["{}"]
rateLimit:
  default:
    requests: 5
    window: 1s
    burst: 5
"#,
		upstream.uri()
	));

	for _ in 0..5 {
		let resp = proxy.handle(conn(), get("/u/x")).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}
	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
	assert_eq!(resp.headers().get(x_headers::X_RATELIMIT_LIMIT).unwrap(), "5");
	assert_eq!(
		resp.headers().get(x_headers::X_RATELIMIT_REMAINING).unwrap(),
		"0"
	);
}

#[tokio::test]
async fn protected_route_rejects_anonymous_without_upstream_call() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		r#"
services:
  api:
    endpoints: ["{}"]
    auth:
      required: true
auth:
  secret: "sekrit"
"#,
		upstream.uri()
	));

	let resp = proxy.handle(conn(), get("/api/profile")).await;
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	upstream.verify().await;
}

#[tokio::test]
async fn protected_route_accepts_token_and_checks_roles() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200))
		.mount(&upstream)
		.await;
	let (proxy, stores, _) = build_proxy(&format!(
		r#"
services:
  api:
    endpoints: ["{}"]
    auth:
      required: true
      roles: ["ops", "admin"]
auth:
  secret: "sekrit"
  users:
    - username: alice
      password: wonderland
      roles: ["admin"]
    - username: bob
      password: builder
      roles: ["viewer"]
"#,
		upstream.uri()
	));
	let authn = stores.snapshot().authn.clone().unwrap();

	let alice = authn.login("alice", "wonderland").unwrap();
	let mut req = get("/api/profile");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {alice}").parse().unwrap(),
	);
	assert_eq!(proxy.handle(conn(), req).await.status(), StatusCode::OK);

	// Bob authenticates fine but holds none of the required roles
	let bob = authn.login("bob", "builder").unwrap();
	let mut req = get("/api/profile");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {bob}").parse().unwrap(),
	);
	assert_eq!(proxy.handle(conn(), req).await.status(), StatusCode::FORBIDDEN);

	// A garbage token is a credential failure, not a role failure
	let mut req = get("/api/profile");
	req
		.headers_mut()
		.insert(header::AUTHORIZATION, "Bearer junk".parse().unwrap());
	assert_eq!(
		proxy.handle(conn(), req).await.status(),
		StatusCode::UNAUTHORIZED
	);
}

#[tokio::test]
async fn breaker_trips_short_circuits_and_recovers() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(500))
		.up_to_n_times(3)
		.mount(&upstream)
		.await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		r#"
services:
  u:
    endpoints: ["{}"]
    circuitBreaker:
      failureThreshold: 3
      openDuration: 200ms
      probeBudget: 1
"#,
		upstream.uri()
	));

	// Three 5xx responses flow through and trip the breaker
	for _ in 0..3 {
		let resp = proxy.handle(conn(), get("/u/x")).await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
	// Short-circuit while open: no upstream call, Retry-After hint
	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert!(resp.headers().get(header::RETRY_AFTER).is_some());

	// After the open duration one probe goes through; it succeeds and the
	// breaker closes for everyone
	tokio::time::sleep(Duration::from_millis(250)).await;
	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn transport_errors_retry_idempotent_methods_only() {
	// Nothing listens on these ports; every call is a transport error
	let (proxy, _, metrics) = build_proxy(
		r#"
services:
  u:
    endpoints: ["http://127.0.0.1:1", "http://127.0.0.1:2"]
    retries: 2
"#,
	);

	let resp = proxy.handle(conn(), get("/u/x")).await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
	let retries = metrics
		.upstream_retries
		.get_or_create(&ServiceLabels {
			service: "u".to_string(),
		})
		.get();
	assert_eq!(retries, 2, "GET should use every retry");

	let req = ::http::Request::builder()
		.method("POST")
		.uri("/u/submit")
		.header("host", "gw.example.com")
		.body(Body::from("payload"))
		.unwrap();
	let resp = proxy.handle(conn(), req).await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
	let retries_after_post = metrics
		.upstream_retries
		.get_or_create(&ServiceLabels {
			service: "u".to_string(),
		})
		.get();
	assert_eq!(retries_after_post, 2, "POST must not retry");
}

#[tokio::test]
async fn slow_upstream_times_out_with_504() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		r#"
services:
  u:
    endpoints: ["{}"]
    timeout: 100ms
"#,
		upstream.uri()
	));

	let start = std::time::Instant::now();
	let resp = proxy.handle(conn(), get("/u/slow")).await;
	assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
	assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn shutdown_aborts_outstanding_upstream_calls_within_grace() {
	let upstream = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
		.mount(&upstream)
		.await;
	// No service timeout: only the drain signal can end this call
	let (proxy, _, _) = build_proxy(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		upstream.uri()
	));
	let shutdown = proxy.inputs.shutdown.clone();

	let started = std::time::Instant::now();
	let request = {
		let proxy = proxy.clone();
		tokio::spawn(async move { proxy.handle(conn(), get("/u/slow")).await })
	};
	tokio::time::sleep(Duration::from_millis(50)).await;
	shutdown.cancel();

	let resp = request.await.unwrap();
	assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
	assert!(
		started.elapsed() < Duration::from_secs(3),
		"the call must be aborted within the drain grace"
	);
}

#[tokio::test]
async fn cors_preflight_short_circuits_before_routing() {
	let (proxy, _, _) = build_proxy(
		r#"
services:
  u:
    endpoints: ["http://127.0.0.1:1"]
cors:
  allowOrigins: ["*"]
  allowMethods: ["GET", "POST"]
"#,
	);

	let req = ::http::Request::builder()
		.method("OPTIONS")
		.uri("/u/x")
		.header("host", "gw.example.com")
		.header(header::ORIGIN, "https://app.example.com")
		.header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
		.body(Body::empty())
		.unwrap();
	let resp = proxy.handle(conn(), req).await;
	// The only endpoint is dead, so reaching upstream would be a 502
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	assert_eq!(
		resp
			.headers()
			.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
			.unwrap(),
		"*"
	);
}

#[tokio::test]
async fn reserved_health_and_metrics_paths_answer_locally() {
	let (proxy, _, _) = build_proxy("services:\n  u:\n    endpoints: [\"http://127.0.0.1:1\"]\n");
	let resp = proxy.handle(conn(), get("/health")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let body = body_string(resp).await;
	assert!(body.contains("\"u\""));

	let resp = proxy.handle(conn(), get("/metrics")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_requires_the_admin_role() {
	let (proxy, stores, _) = build_proxy(
		r#"
services:
  u:
    endpoints: ["http://127.0.0.1:1"]
auth:
  secret: "sekrit"
  users:
    - username: root
      password: toor
      roles: ["admin"]
    - username: bob
      password: builder
      roles: ["viewer"]
"#,
	);
	let authn = stores.snapshot().authn.clone().unwrap();

	assert_eq!(
		proxy.handle(conn(), get("/admin/breakers")).await.status(),
		StatusCode::UNAUTHORIZED
	);

	let bob = authn.login("bob", "builder").unwrap();
	let mut req = get("/admin/breakers");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {bob}").parse().unwrap(),
	);
	assert_eq!(proxy.handle(conn(), req).await.status(), StatusCode::FORBIDDEN);

	let root = authn.login("root", "toor").unwrap();
	let mut req = get("/admin/breakers");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {root}").parse().unwrap(),
	);
	assert_eq!(proxy.handle(conn(), req).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn hot_swap_routes_new_requests_to_new_snapshot() {
	let old = MockServer::start().await;
	let new = MockServer::start().await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_body_string("old"))
		.mount(&old)
		.await;
	Mock::given(any())
		.respond_with(ResponseTemplate::new(200).set_body_string("new"))
		.mount(&new)
		.await;
	let (proxy, stores, metrics) = build_proxy(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		old.uri()
	));

	assert_eq!(body_string(proxy.handle(conn(), get("/u/x")).await).await, "old");

	let raw: RawConfig = config::parse_config(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		new.uri()
	))
	.unwrap();
	stores.publish(config::compile(&raw, metrics, 2).unwrap());

	assert_eq!(body_string(proxy.handle(conn(), get("/u/x")).await).await, "new");
}

#[tokio::test]
async fn request_id_is_honored_or_minted() {
	let upstream = MockServer::start().await;
	Mock::given(header("x-request-id", "abc-123"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&upstream)
		.await;
	let (proxy, _, _) = build_proxy(&format!(
		"services:\n  u:\n    endpoints: [\"{}\"]\n",
		upstream.uri()
	));

	let mut req = get("/u/x");
	req
		.headers_mut()
		.insert(x_headers::X_REQUEST_ID, "abc-123".parse().unwrap());
	let resp = proxy.handle(conn(), req).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get(x_headers::X_REQUEST_ID).unwrap(), "abc-123");

	let resp = proxy.handle(conn(), get("/metrics")).await;
	let minted = resp.headers().get(x_headers::X_REQUEST_ID).unwrap();
	assert_eq!(minted.to_str().unwrap().len(), 32);
}
