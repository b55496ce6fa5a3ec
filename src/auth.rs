use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use http::{header, request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::errors::ServiceError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Role {
    Customer,
    StoreOwner,
    Courier,
}

/// Principal extracted from a verified bearer token. Ownership checks against
/// orders/couriers/notifications use these claims directly; there are no
/// cross-service ownership lookups.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub roles: HashSet<Role>,
    pub store_id: Option<Uuid>,
}

impl AuthenticatedUser {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn require_role(&self, role: Role) -> Result<(), ServiceError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!("requires role {}", role)))
        }
    }

    /// Store owners carry the store they manage as a token claim.
    pub fn require_store(&self) -> Result<Uuid, ServiceError> {
        self.require_role(Role::StoreOwner)?;
        self.store_id
            .ok_or_else(|| ServiceError::Forbidden("token carries no store claim".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ClientRoles {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
    #[serde(default)]
    resource_access: HashMap<String, ClientRoles>,
    #[serde(default)]
    store_id: Option<Uuid>,
}

/// Verifies bearer tokens with either a shared HMAC secret or an RSA public
/// key, selected by configuration.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    client_id: String,
}

impl JwtVerifier {
    pub fn from_config(cfg: &JwtConfig) -> Result<Self, ServiceError> {
        match cfg.algorithm.as_str() {
            "HS256" => {
                let secret = cfg.hmac_secret.as_deref().ok_or_else(|| {
                    ServiceError::Internal("jwt.hmac_secret required for HS256".into())
                })?;
                Ok(Self::hmac(secret, &cfg.client_id))
            }
            "RS256" => {
                let pem = cfg.rsa_public_key_pem.as_deref().ok_or_else(|| {
                    ServiceError::Internal("jwt.rsa_public_key_pem required for RS256".into())
                })?;
                Self::rsa_pem(pem.as_bytes(), &cfg.client_id)
            }
            other => Err(ServiceError::Internal(format!(
                "unsupported jwt algorithm {}",
                other
            ))),
        }
    }

    pub fn hmac(secret: &str, client_id: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            client_id: client_id.to_string(),
        }
    }

    pub fn rsa_pem(pem: &[u8], client_id: &str) -> Result<Self, ServiceError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| ServiceError::Internal(format!("invalid RSA public key: {}", e)))?;
        Ok(Self {
            key,
            validation: Validation::new(Algorithm::RS256),
            client_id: client_id.to_string(),
        })
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, ServiceError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {}", e)))?;
        let claims = data.claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("token subject is not a user id".into()))?;

        let roles = claims
            .resource_access
            .get(&self.client_id)
            .map(|client| {
                client
                    .roles
                    .iter()
                    .filter_map(|r| Role::from_str(r).ok())
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();

        Ok(AuthenticatedUser {
            user_id,
            roles,
            store_id: claims.store_id,
        })
    }
}

/// Pulls the token out of an `Authorization: Bearer ...` header.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    Arc<JwtVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".into()))?;
        verifier.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("sign")
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn verifies_roles_and_store_claim() {
        let verifier = JwtVerifier::hmac(SECRET, "platter");
        let user_id = Uuid::new_v4();
        let store_id = Uuid::new_v4();
        let token = token(json!({
            "sub": user_id.to_string(),
            "exp": far_future(),
            "resource_access": { "platter": { "roles": ["STORE_OWNER", "ignored-role"] } },
            "store_id": store_id.to_string(),
        }));

        let user = verifier.verify(&token).expect("valid token");
        assert_eq!(user.user_id, user_id);
        assert!(user.has_role(Role::StoreOwner));
        assert!(!user.has_role(Role::Customer));
        assert_eq!(user.require_store().expect("store claim"), store_id);
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::hmac("other-secret", "platter");
        let token = token(json!({
            "sub": Uuid::new_v4().to_string(),
            "exp": far_future(),
        }));
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!(Role::from_str("customer").unwrap(), Role::Customer);
        assert_eq!(Role::from_str("STORE_OWNER").unwrap(), Role::StoreOwner);
        assert!(Role::from_str("admin").is_err());
    }
}
