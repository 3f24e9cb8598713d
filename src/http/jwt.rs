use std::time::{SystemTime, UNIX_EPOCH};

use headers::authorization::Bearer;
use headers::{Authorization, HeaderMapExt};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};

use crate::http::{Request, header};
use crate::types::agent::{AuthSpec, RoleMatch, RouteAuth, UserSpec};
use crate::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
	#[error("no bearer credential found")]
	Missing,

	#[error("the credential is malformed: {0}")]
	InvalidFormat(String),

	#[error("the credential signature is invalid")]
	InvalidSignature,

	#[error("the credential is expired")]
	Expired,
}

/// Identity attached to a request after successful verification.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
	pub subject: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	pub roles: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expiry: Option<u64>,
	#[serde(skip_serializing_if = "Map::is_empty")]
	pub attributes: Map<String, Value>,
}

impl Claims {
	pub fn has_role(&self, role: &str) -> bool {
		self.roles.iter().any(|r| r == role)
	}
}

/// The signing-key collaborator. The pipeline only ever sees this trait;
/// algorithms and key handling stay behind it.
pub trait TokenVerifier: Send + Sync {
	fn verify(&self, token: &str) -> Result<Claims, TokenError>;
}

struct HsVerifier {
	decoding: DecodingKey,
	validation: Validation,
}

impl TokenVerifier for HsVerifier {
	fn verify(&self, token: &str) -> Result<Claims, TokenError> {
		let data = decode::<Map<String, Value>>(token, &self.decoding, &self.validation).map_err(
			|error| {
				debug!(?error, "token failed validation");
				match error.kind() {
					jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
					jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
					_ => TokenError::InvalidFormat(error.to_string()),
				}
			},
		)?;
		claims_from_map(data.claims)
	}
}

fn claims_from_map(mut inner: Map<String, Value>) -> Result<Claims, TokenError> {
	let Some(Value::String(subject)) = inner.remove("sub") else {
		return Err(TokenError::InvalidFormat("missing sub claim".to_string()));
	};
	let display_name = match inner.remove("name") {
		Some(Value::String(n)) => Some(n),
		_ => None,
	};
	let roles = match inner.remove("roles") {
		Some(Value::Array(rs)) => rs
			.into_iter()
			.filter_map(|r| match r {
				Value::String(s) => Some(s),
				_ => None,
			})
			.collect(),
		_ => vec![],
	};
	let expiry = inner.get("exp").and_then(Value::as_u64);
	Ok(Claims {
		subject,
		display_name,
		roles,
		expiry,
		attributes: inner,
	})
}

/// Bearer extraction plus token issuance for the thin `/auth` endpoints.
pub struct Authn {
	verifier: Arc<dyn TokenVerifier>,
	encoding: EncodingKey,
	issuer: Option<String>,
	audiences: Vec<String>,
	admin_role: String,
	token_ttl: Duration,
	users: Vec<UserSpec>,
}

impl Debug for Authn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Authn").finish()
	}
}

impl Authn {
	pub fn new(spec: &AuthSpec) -> Authn {
		let mut validation = Validation::default();
		if !spec.audiences.is_empty() {
			validation.set_audience(spec.audiences.as_slice());
		}
		if let Some(iss) = &spec.issuer {
			validation.set_issuer(&[iss]);
		}
		let secret = spec.secret.expose_secret().as_bytes();
		Authn {
			verifier: Arc::new(HsVerifier {
				decoding: DecodingKey::from_secret(secret),
				validation,
			}),
			encoding: EncodingKey::from_secret(secret),
			issuer: spec.issuer.clone(),
			audiences: spec.audiences.clone(),
			admin_role: spec.admin_role.clone(),
			token_ttl: spec.token_ttl,
			users: spec.users.clone(),
		}
	}

	pub fn admin_role(&self) -> &str {
		&self.admin_role
	}

	pub fn token_ttl(&self) -> Duration {
		self.token_ttl
	}

	/// Pull the bearer credential off the request, if any. A missing header
	/// yields `Ok(None)`; a present but unusable one is an error so protected
	/// routes can distinguish the failure kinds.
	pub fn extract(&self, req: &Request) -> Result<Option<Claims>, TokenError> {
		if !req.headers().contains_key(header::AUTHORIZATION) {
			return Ok(None);
		}
		let Some(Authorization(bearer)) = req.headers().typed_get::<Authorization<Bearer>>() else {
			return Err(TokenError::InvalidFormat(
				"authorization scheme is not Bearer".to_string(),
			));
		};
		self.verifier.verify(bearer.token()).map(Some)
	}

	pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
		self.verifier.verify(token)
	}

	/// Role gate for a route. `AnyOf` needs one matching role, `AllOf` needs
	/// every listed role. An empty role list only requires authentication.
	pub fn authorize(claims: &Claims, auth: &RouteAuth) -> bool {
		if auth.roles.is_empty() {
			return true;
		}
		match auth.role_match {
			RoleMatch::AnyOf => auth.roles.iter().any(|r| claims.has_role(r)),
			RoleMatch::AllOf => auth.roles.iter().all(|r| claims.has_role(r)),
		}
	}

	pub fn login(&self, username: &str, password: &str) -> Option<String> {
		let user = self
			.users
			.iter()
			.find(|u| u.username == username && u.password.expose_secret() == password)?;
		Some(self.issue(
			&user.username,
			user.display_name.as_deref(),
			&user.roles,
		))
	}

	pub fn refresh(&self, token: &str) -> Result<String, TokenError> {
		let claims = self.verify(token)?;
		Ok(self.issue(
			&claims.subject,
			claims.display_name.as_deref(),
			&claims.roles,
		))
	}

	fn issue(&self, subject: &str, display_name: Option<&str>, roles: &[String]) -> String {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		let mut claims = Map::new();
		claims.insert("sub".to_string(), json!(subject));
		claims.insert("iat".to_string(), json!(now));
		claims.insert("exp".to_string(), json!(now + self.token_ttl.as_secs()));
		claims.insert("roles".to_string(), json!(roles));
		if let Some(name) = display_name {
			claims.insert("name".to_string(), json!(name));
		}
		if let Some(iss) = &self.issuer {
			claims.insert("iss".to_string(), json!(iss));
		}
		if let Some(aud) = self.audiences.first() {
			claims.insert("aud".to_string(), json!(aud));
		}
		encode(&Header::default(), &claims, &self.encoding)
			.expect("HS256 encoding of a JSON map cannot fail")
	}
}
