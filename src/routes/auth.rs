use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::AppState;

/// Access token claims issued by the platform's auth service.
///
/// The user id arrives as `id`, `_id` or `sub` depending on which service
/// minted the token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub underscore_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

impl Claims {
    fn subject(self) -> Option<String> {
        self.id
            .or(self.underscore_id)
            .or(self.sub)
            .filter(|id| !id.trim().is_empty())
    }
}

/// The authenticated caller. Its id is the recipient identity that scopes
/// every read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Option<String>,
}

pub struct AuthUser(pub Principal);

/// Decode and validate a JWT, returning the caller identity.
fn decode_principal(secret: &str, token: &str) -> Result<Principal, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    let role = token_data.claims.role.clone();
    let id = token_data.claims.subject().ok_or_else(|| {
        tracing::debug!("Token carries no user id");
        AppError::Unauthorized
    })?;
    Ok(Principal { id, role })
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
            tracing::debug!("Authorization header doesn't start with 'Bearer '");
            return Err(AppError::Unauthorized);
        }

        let token = auth_header[7..].trim();
        if token.is_empty() {
            tracing::debug!("Empty bearer token in Authorization header");
            return Err(AppError::Unauthorized);
        }

        let principal = decode_principal(&state.config.jwt.secret, token)?;
        tracing::debug!(
            "Authenticated caller: {} (role: {})",
            principal.id,
            principal.role.as_deref().unwrap_or("none")
        );
        Ok(AuthUser(principal))
    }
}

/// Sign a token the way the auth service does.
#[cfg(test)]
pub fn issue_token(secret: &str, user_id: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        id: Some(user_id.to_string()),
        underscore_id: None,
        sub: None,
        role: Some("student".to_string()),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn accepts_id_variants() {
        let p = decode_principal(SECRET, &issue_token(SECRET, "u1")).unwrap();
        assert_eq!(p.id, "u1");
        assert_eq!(p.role.as_deref(), Some("student"));

        let mongo = sign(serde_json::json!({ "_id": "64ab", "role": "admin", "exp": exp() }));
        assert_eq!(decode_principal(SECRET, &mongo).unwrap().id, "64ab");

        let standard = sign(serde_json::json!({ "sub": "u9", "exp": exp() }));
        let p = decode_principal(SECRET, &standard).unwrap();
        assert_eq!(p.id, "u9");
        assert!(p.role.is_none());
    }

    #[test]
    fn rejects_bad_tokens() {
        assert!(matches!(
            decode_principal("other-secret", &issue_token(SECRET, "u1")),
            Err(AppError::Jwt(_))
        ));

        let no_id = sign(serde_json::json!({ "role": "student", "exp": exp() }));
        assert!(matches!(
            decode_principal(SECRET, &no_id),
            Err(AppError::Unauthorized)
        ));

        let expired = sign(serde_json::json!({ "id": "u1", "exp": 1_000 }));
        assert!(decode_principal(SECRET, &expired).is_err());
    }
}
