use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::models::auth::{Claims, CookieSet, Role};
use crate::queries;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::DbConn;

/// Entropy of a password-reset token, before URL-safe encoding.
const RESET_TOKEN_BYTES: usize = 48;

/// Payload common to the access/refresh pair of one session.
#[derive(Debug, Clone)]
pub struct TokenPayload {
    pub phone: String,
    pub jti: String,
    pub active_role: Role,
    pub accounts: serde_json::Value,
}

impl TokenPayload {
    fn claims(&self, lifetime: Duration) -> Claims {
        let now = Utc::now();
        Claims {
            phone: self.phone.clone(),
            jti: self.jti.clone(),
            active_role: self.active_role.to_string(),
            accounts: self.accounts.clone(),
            role: self.active_role.to_string(),
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
        }
    }

    /// The account id the active role maps to.
    pub fn user_id(&self) -> Result<Uuid> {
        self.accounts
            .get(self.active_role.to_string())
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                Error::Authentication(format!(
                    "no account id for role {} in token payload",
                    self.active_role
                ))
            })
    }
}

fn algorithm(config: &AuthConfig) -> Result<Algorithm> {
    config
        .algorithm
        .parse()
        .map_err(|_| Error::Internal(format!("unsupported JWT algorithm '{}'", config.algorithm)))
}

fn sign(config: &AuthConfig, claims: &Claims) -> Result<String> {
    encode(
        &Header::new(algorithm(config)?),
        claims,
        &EncodingKey::from_secret(config.secret_key.expose_secret().as_ref()),
    )
    .map_err(|e| Error::Internal(format!("failed to sign JWT: {}", e)))
}

/// Mints a short-lived access token.
pub fn create_access_token(config: &AuthConfig, payload: &TokenPayload) -> Result<String> {
    sign(
        config,
        &payload.claims(Duration::minutes(config.access_token_expire_minutes)),
    )
}

/// Mints a long-lived refresh token.
pub fn create_refresh_token(config: &AuthConfig, payload: &TokenPayload) -> Result<String> {
    sign(
        config,
        &payload.claims(Duration::days(config.refresh_token_expire_days)),
    )
}

/// Decodes and verifies a token, distinguishing expiry from other failures.
pub fn decode_token(config: &AuthConfig, token: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret_key.expose_secret().as_ref()),
        &Validation::new(algorithm(config)?),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            Error::Authentication("token expired".to_string())
        }
        _ => Error::InvalidToken(format!("invalid token: {}", e)),
    })?;

    Ok(data.claims)
}

/// Persists a freshly minted refresh token's jti.
pub async fn store_refresh_token(
    conn: &mut DbConn,
    config: &AuthConfig,
    payload: &TokenPayload,
) -> Result<()> {
    let jti = Uuid::parse_str(&payload.jti)
        .map_err(|_| Error::Internal(format!("jti is not a UUID: {}", payload.jti)))?;
    let expires_at = Utc::now() + Duration::days(config.refresh_token_expire_days);
    queries::auth::store_refresh_token(conn, jti, payload.user_id()?, payload.active_role, expires_at)
        .await
}

/// Checks a refresh jti against the database: present, not revoked, not
/// expired, and the referenced entity still exists.
pub async fn verify_refresh_record(conn: &mut DbConn, jti: Uuid) -> Result<()> {
    let Some(record) = queries::auth::get_valid_refresh_token(conn, jti).await? else {
        return Err(Error::InvalidToken("refresh token unknown or revoked".into()));
    };

    let role: Role = record
        .role
        .parse()
        .map_err(|_| Error::InvalidToken(format!("unknown role '{}' on refresh token", record.role)))?;
    if !queries::auth::entity_exists(conn, role, record.user_id).await? {
        tracing::warn!(jti = %jti, role = %record.role, "refresh token references a missing entity");
        return Err(Error::InvalidToken("refresh token references a missing entity".into()));
    }

    Ok(())
}

/// Rotates a refresh token.
///
/// Verifies the presented token and its database record, mints a new jti and
/// access/refresh pair, copies every `user_accounts` link from the old jti to
/// the new one (conflict-ignore), and revokes the old jti last. Returns the
/// cookie values to set.
pub async fn rotate_refresh(
    conn: &mut DbConn,
    config: &AuthConfig,
    refresh_token: &str,
) -> Result<CookieSet> {
    let old = decode_token(config, refresh_token)?;

    let old_jti = Uuid::parse_str(&old.jti)
        .map_err(|_| Error::InvalidToken("refresh token carries a malformed jti".into()))?;
    let active_role: Role = old
        .active_role
        .parse()
        .map_err(|_| Error::InvalidToken(format!("unknown role '{}'", old.active_role)))?;

    verify_refresh_record(conn, old_jti).await?;

    let new_jti = Uuid::new_v4();
    let payload = TokenPayload {
        phone: old.phone.clone(),
        jti: new_jti.to_string(),
        active_role,
        accounts: old.accounts.clone(),
    };

    let access_token = create_access_token(config, &payload)?;
    let refresh_token = create_refresh_token(config, &payload)?;
    store_refresh_token(conn, config, &payload).await?;

    let copied =
        queries::auth::copy_user_accounts(conn, &old.jti, &new_jti.to_string()).await?;
    tracing::debug!(old_jti = %old_jti, new_jti = %new_jti, copied, "account links carried over");

    // Revocation failure must not orphan the freshly stored pair
    if let Err(e) = queries::auth::revoke_refresh_token(conn, old_jti).await {
        tracing::warn!(jti = %old_jti, error = %e, "failed to revoke rotated refresh token");
    }

    Ok(CookieSet {
        access_token,
        refresh_token,
        role: active_role.to_string(),
    })
}

/// Generates a password-reset token: 48 random bytes, URL-safe encoded.
/// Only the SHA-256 hex of the token is ever persisted.
pub fn generate_reset_token() -> (String, String) {
    let mut bytes = [0u8; RESET_TOKEN_BYTES];
    rand::rng().fill(&mut bytes[..]);
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_reset_token(&token);
    (token, hash)
}

pub fn hash_reset_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Issues a reset token for a phone, replacing any previous one, and returns
/// the raw token for the mail collaborator. The database only sees the hash.
pub async fn issue_reset_token(
    conn: &mut DbConn,
    config: &AuthConfig,
    user_phone: &str,
) -> Result<String> {
    let (token, hash) = generate_reset_token();
    let expires_at = Utc::now() + Duration::seconds(config.reset_token_ttl_secs);
    queries::auth::replace_reset_token(conn, user_phone, &hash, expires_at).await?;
    Ok(token)
}

/// Resolves a presented reset token to the phone it was issued for.
pub async fn verify_reset_token(conn: &mut DbConn, token: &str) -> Result<String> {
    let hash = hash_reset_token(token);
    queries::auth::find_valid_reset_token(conn, &hash)
        .await?
        .ok_or_else(|| Error::InvalidToken("reset token unknown or expired".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig {
            secret_key: SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            ..AuthConfig::default()
        }
    }

    fn payload() -> TokenPayload {
        let id = Uuid::now_v7();
        TokenPayload {
            phone: "+77010000000".into(),
            jti: Uuid::new_v4().to_string(),
            active_role: Role::Business,
            accounts: serde_json::json!({
                "business": id.to_string(),
                "main_user": id.to_string(),
            }),
        }
    }

    #[test]
    fn access_token_round_trips() {
        let cfg = config();
        let p = payload();
        let token = create_access_token(&cfg, &p).unwrap();
        let claims = decode_token(&cfg, &token).unwrap();
        assert_eq!(claims.jti, p.jti);
        assert_eq!(claims.active_role, "business");
        assert_eq!(claims.role, "business");
    }

    #[test]
    fn refresh_outlives_access() {
        let cfg = config();
        let p = payload();
        let access = decode_token(&cfg, &create_access_token(&cfg, &p).unwrap()).unwrap();
        let refresh = decode_token(&cfg, &create_refresh_token(&cfg, &p).unwrap()).unwrap();
        assert!(refresh.exp > access.exp);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let cfg = config();
        let token = create_access_token(&cfg, &payload()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(decode_token(&cfg, &tampered).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let cfg = config();
        let token = create_access_token(&cfg, &payload()).unwrap();
        let mut other = config();
        other.secret_key = SecretString::from("fedcba9876543210fedcba9876543210".to_string());
        assert!(matches!(decode_token(&other, &token), Err(Error::InvalidToken(_))));
    }

    #[test]
    fn reset_token_is_url_safe_and_only_hash_is_derived() {
        let (token, hash) = generate_reset_token();
        assert!(token.len() >= 64, "48 bytes must encode to 64 chars");
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(hash.len(), 64, "sha256 hex");
        assert_eq!(hash, hash_reset_token(&token));
        assert_ne!(token, hash);
    }

    #[test]
    fn reset_tokens_are_unique() {
        let (a, _) = generate_reset_token();
        let (b, _) = generate_reset_token();
        assert_ne!(a, b);
    }

    #[test]
    fn payload_user_id_resolves_active_role() {
        let p = payload();
        assert!(p.user_id().is_ok());

        let broken = TokenPayload {
            accounts: serde_json::json!({}),
            ..p
        };
        assert!(broken.user_id().is_err());
    }
}
