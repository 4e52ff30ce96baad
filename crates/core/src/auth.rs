//! Authentication: API keys hashed SHA-256, looked up by hash;
//! portal JWTs verified against a shared secret.

use crate::error::{CoreError, CoreResult};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

pub const API_KEY_PREFIX: &str = "bxb_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub key_hash: String,
    pub status: ApiKeyStatus,
    pub expires_at: Option<OffsetDateTime>,
}

pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ApiKeyManager {
    pool: PgPool,
}

impl ApiKeyManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolves an `Authorization: Bearer <key>` value into its tenant,
    /// rejecting revoked or expired keys.
    pub async fn authenticate(&self, raw_key: &str) -> CoreResult<Uuid> {
        if !raw_key.starts_with(API_KEY_PREFIX) {
            return Err(CoreError::Validation("api key missing bxb_ prefix".into()));
        }

        let key_hash = hash_api_key(raw_key);
        let api_key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, organization_id, key_hash, status, expires_at FROM api_keys WHERE key_hash = $1",
        )
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound("api key not recognized".into()))?;

        if api_key.status != ApiKeyStatus::Active {
            return Err(CoreError::InvalidState("api key is revoked".into()));
        }
        if let Some(expires_at) = api_key.expires_at {
            if OffsetDateTime::now_utc() >= expires_at {
                return Err(CoreError::InvalidState("api key has expired".into()));
            }
        }

        Ok(api_key.organization_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalClaims {
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: i64,
}

pub const PORTAL_TOKEN_LIFETIME_HOURS: i64 = 12;

/// Verifies a portal JWT against the shared secret, rejecting anything
/// not of `type: "portal"`.
pub fn verify_portal_token(token: &str, secret: &str) -> CoreResult<PortalClaims> {
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let claims = decode::<PortalClaims>(token, &decoding_key, &Validation::default())
        .map_err(|e| CoreError::Validation(format!("invalid portal token: {e}")))?
        .claims;

    if claims.token_type != "portal" {
        return Err(CoreError::Validation("token type is not portal".into()));
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_distinct() {
        let a = hash_api_key("bxb_abc123");
        let b = hash_api_key("bxb_abc123");
        let c = hash_api_key("bxb_xyz789");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
