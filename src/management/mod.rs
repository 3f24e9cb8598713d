use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use headers::HeaderMapExt;
use headers::authorization::Bearer;
use prometheus_client::registry::Registry;
use serde_json::json;

use crate::http::StatusCode;
use crate::store::Stores;
use crate::*;

/// Reserved-prefix endpoints: liveness, metrics exposition, the thin
/// identity layer, and the admin surface. The pipeline delegates here after
/// its own stages (notably the admin role check) have run.
#[derive(Clone)]
struct App {
	stores: Stores,
	registry: Arc<Registry>,
}

pub fn router(stores: Stores, registry: Arc<Registry>) -> Router {
	let app = App { stores, registry };
	Router::new()
		.route("/health", get(health))
		.route("/metrics", get(metrics_handler))
		.route("/auth/login", post(login))
		.route("/auth/refresh", post(refresh))
		.route("/auth/logout", post(logout))
		.route("/admin/config", get(admin_config))
		.route("/admin/breakers", get(admin_breakers))
		.route("/admin/breakers/{service}/reset", post(admin_reset_breaker))
		.with_state(app)
}

/// Liveness: always 200, with per-service health derived from endpoint
/// state.
async fn health(State(app): State<App>) -> impl IntoResponse {
	let snapshot = app.stores.snapshot();
	let services: BTreeMap<&str, &str> = snapshot
		.services
		.iter()
		.map(|(name, svc)| {
			let state = if svc.balancer.any_healthy() {
				"healthy"
			} else {
				"unhealthy"
			};
			(name.as_str(), state)
		})
		.collect();
	Json(json!({
		"status": "ok",
		"services": services,
	}))
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	match prometheus_client::encoding::text::encode(&mut buffer, &app.registry) {
		Ok(_) => Ok(buffer),
		Err(e) => {
			error!("error encoding metrics: {:?}", e);
			Err(StatusCode::INTERNAL_SERVER_ERROR)
		},
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
	username: String,
	password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
	token: String,
	token_type: &'static str,
	expires_in: u64,
}

async fn login(
	State(app): State<App>,
	Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, StatusCode> {
	let snapshot = app.stores.snapshot();
	let Some(authn) = &snapshot.authn else {
		return Err(StatusCode::NOT_IMPLEMENTED);
	};
	match authn.login(&body.username, &body.password) {
		Some(token) => Ok(Json(TokenResponse {
			token,
			token_type: "Bearer",
			expires_in: authn.token_ttl().as_secs(),
		})),
		None => Err(StatusCode::UNAUTHORIZED),
	}
}

async fn refresh(
	State(app): State<App>,
	headers: http::HeaderMap,
) -> Result<Json<TokenResponse>, StatusCode> {
	let snapshot = app.stores.snapshot();
	let Some(authn) = &snapshot.authn else {
		return Err(StatusCode::NOT_IMPLEMENTED);
	};
	let Some(headers::Authorization(bearer)) =
		headers.typed_get::<headers::Authorization<Bearer>>()
	else {
		return Err(StatusCode::UNAUTHORIZED);
	};
	match authn.refresh(bearer.token()) {
		Ok(token) => Ok(Json(TokenResponse {
			token,
			token_type: "Bearer",
			expires_in: authn.token_ttl().as_secs(),
		})),
		Err(_) => Err(StatusCode::UNAUTHORIZED),
	}
}

/// Tokens are stateless, so logout is an acknowledgement.
async fn logout() -> StatusCode {
	StatusCode::NO_CONTENT
}

async fn admin_config(State(app): State<App>) -> impl IntoResponse {
	let snapshot = app.stores.snapshot();
	let services: BTreeMap<_, _> = snapshot
		.services
		.iter()
		.map(|(name, svc)| (name.clone(), svc.spec.clone()))
		.collect();
	Json(json!({
		"version": snapshot.version,
		"services": services,
		"observability": snapshot.observability,
	}))
}

async fn admin_breakers(State(app): State<App>) -> impl IntoResponse {
	let snapshot = app.stores.snapshot();
	let breakers: BTreeMap<_, _> = snapshot
		.services
		.iter()
		.filter_map(|(name, svc)| svc.breaker.as_ref().map(|b| (name.clone(), b.stats())))
		.collect();
	Json(breakers)
}

async fn admin_reset_breaker(
	State(app): State<App>,
	Path(service): Path<String>,
) -> StatusCode {
	let snapshot = app.stores.snapshot();
	match snapshot.service(&service).and_then(|s| s.breaker.as_ref()) {
		Some(breaker) => {
			breaker.reset();
			info!(service = %service, "circuit breaker reset");
			StatusCode::NO_CONTENT
		},
		None => StatusCode::NOT_FOUND,
	}
}
