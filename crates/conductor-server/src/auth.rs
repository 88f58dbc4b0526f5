//! Bearer-token authentication.
//!
//! Tokens are HMAC-SHA256 signed, keyed by `JWT_SECRET`.
//! Format: `cnd_tk_<claims_hex>_<hmac_hex>` where `claims_hex` is the
//! hex-encoded claims JSON and the MAC is computed over those bytes.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use conductor_core::audit::Severity;
use conductor_core::orchestrator::Actor;

use crate::routes::{AppError, AppState};

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify conductor bearer tokens.
const TOKEN_PREFIX: &str = "cnd_tk_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid token claims: {0}")]
    InvalidClaims(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,
}

/// The identity a bearer token carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: String,
    pub permissions: Vec<String>,
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Actor {
            user_id: claims.user_id,
            organization_id: claims.organization_id,
            role: claims.role,
            permissions: claims.permissions,
        }
    }
}

/// Sign a token for the given claims.
pub fn issue_token(secret: &str, claims: &Claims) -> String {
    let payload = serde_json::to_vec(claims).expect("claims always serialize");
    let mac = compute_hmac(secret.as_bytes(), &payload);
    format!(
        "{TOKEN_PREFIX}{}_{}",
        hex::encode(&payload),
        hex::encode(mac)
    )
}

/// Validate a token and extract its claims.
///
/// Parses the format, recomputes the HMAC over the claims bytes, verifies
/// it in constant time, and only then deserializes the claims.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    let (payload_hex, mac_hex) = rest.split_once('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore between claims and hmac".to_string())
    })?;

    let payload = hex::decode(payload_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in claims: {e}")))?;
    let provided_mac = hex::decode(mac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    verify_hmac_constant_time(secret.as_bytes(), &payload, &provided_mac)?;

    serde_json::from_slice(&payload).map_err(|e| TokenError::InvalidClaims(e.to_string()))
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using the `hmac` crate's constant-time comparison.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::HmacMismatch)
}

/// Extractor for authenticated routes: validates the `Authorization:
/// Bearer` header and yields the actor. Failures are audited and answered
/// with 401.
pub struct AuthContext(pub Actor);

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
            state
                .audit
                .security_event(
                    None,
                    None,
                    "auth.missing_token",
                    Severity::Low,
                    serde_json::json!({ "path": parts.uri.path() }),
                    None,
                )
                .await;
            return Err(AppError::unauthorized("missing bearer token"));
        };

        match validate_token(&state.config.jwt_secret, token) {
            Ok(claims) => Ok(AuthContext(claims.into())),
            Err(e) => {
                state
                    .audit
                    .security_event(
                        None,
                        None,
                        "auth.invalid_token",
                        Severity::Medium,
                        serde_json::json!({
                            "path": parts.uri.path(),
                            "reason": e.to_string(),
                        }),
                        None,
                    )
                    .await;
                Err(AppError::unauthorized("invalid bearer token"))
            }
        }
    }
}
