use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// The role a token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Business,
}

/// Claims carried by both access and refresh JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub phone: String,
    pub jti: String,
    pub active_role: String,
    /// Map of role -> account id, plus the `main_user` entry.
    pub accounts: serde_json::Value,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn account_for(&self, role: &str) -> Option<Uuid> {
        self.accounts
            .get(role)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn main_user(&self) -> Option<Uuid> {
        self.account_for("main_user")
    }
}

/// A refresh-token row. Valid iff not revoked, not expired, and the
/// referenced entity still exists.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub jti: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// The freshly minted cookie values returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct CookieSet {
    pub access_token: String,
    pub refresh_token: String,
    pub role: String,
}
