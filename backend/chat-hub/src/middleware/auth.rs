use crate::error::HubError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Validate an HS256 token and return the user id in `sub`.
pub fn verify_jwt(secret: &str, token: &str) -> Result<Uuid, HubError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "jwt rejected");
        HubError::Unauthorized
    })?;

    Uuid::parse_str(&data.claims.sub).map_err(|_| HubError::Unauthorized)
}

/// Mint a token for `user_id`. Used by tooling and tests.
pub fn issue_jwt(secret: &str, user_id: Uuid, ttl: Duration) -> Result<String, HubError> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| HubError::Config(format!("jwt encode: {}", e)))
}

/// Token from `?token=` or, failing that, `Authorization: Bearer`.
pub fn token_from_request(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    query_token
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.trim().to_string())
        })
}

/// Guard for `/internal/*`: the caller must present the shared internal
/// token.
pub async fn internal_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, HubError> {
    if state.config.internal_token.is_empty() {
        tracing::warn!(path = %req.uri().path(), "internal token not configured, refusing internal request");
        return Err(HubError::Unauthorized);
    }

    let presented = req
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(HubError::Unauthorized)?;

    if !internal_token_matches(presented, &state.config.internal_token) {
        return Err(HubError::Unauthorized);
    }

    Ok(next.run(req).await)
}

/// Constant-time comparison of a presented internal token.
fn internal_token_matches(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}
