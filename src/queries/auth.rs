use crate::{
    error::{Error, Result},
    models::auth::{RefreshTokenRecord, Role},
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::DbConn;

/// Stores a freshly minted refresh token.
pub async fn store_refresh_token(
    conn: &mut DbConn,
    jti: Uuid,
    user_id: Uuid,
    role: Role,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO auth.refresh_tokens (jti, user_id, role, expires_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(jti)
    .bind(user_id)
    .bind(role.to_string())
    .bind(expires_at)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Marks a refresh token as revoked.
pub async fn revoke_refresh_token(conn: &mut DbConn, jti: Uuid) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE auth.refresh_tokens SET revoked = TRUE WHERE jti = $1
        "#,
    )
    .bind(jti)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?
    .rows_affected();

    Ok(rows_affected)
}

/// Fetches a refresh token that is neither revoked nor expired.
pub async fn get_valid_refresh_token(conn: &mut DbConn, jti: Uuid) -> Result<Option<RefreshTokenRecord>> {
    let record = sqlx::query_as::<_, RefreshTokenRecord>(
        r#"
        SELECT jti, user_id, role, expires_at, revoked
        FROM auth.refresh_tokens
        WHERE jti = $1 AND revoked = FALSE AND expires_at > now()
        "#,
    )
    .bind(jti)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(record)
}

/// Checks that the entity a refresh token references still exists.
pub async fn entity_exists(conn: &mut DbConn, role: Role, user_id: Uuid) -> Result<bool> {
    let sql = match role {
        Role::User => "SELECT 1 FROM role.users WHERE user_id = $1",
        Role::Business => "SELECT 1 FROM role.businesses WHERE business_id = $1",
    };

    let row: Option<(i32,)> = sqlx::query_as(sql)
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(Error::Sqlx)?;

    Ok(row.is_some())
}

/// Copies every account link from the old session jti to the new one.
/// Conflicts (links already copied by a concurrent refresh) are ignored.
pub async fn copy_user_accounts(conn: &mut DbConn, old_jti: &str, new_jti: &str) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO auth.user_accounts (
            main_user_id, account_type, account_id, session_jti)
        SELECT main_user_id, account_type, account_id, $1
        FROM auth.user_accounts
        WHERE session_jti = $2
        ON CONFLICT (main_user_id, account_type, account_id, session_jti) DO NOTHING
        "#,
    )
    .bind(new_jti)
    .bind(old_jti)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?
    .rows_affected();

    Ok(rows_affected)
}

/// Replaces any previous reset tokens for the phone with the new hash.
/// Only the SHA-256 of the token is ever stored.
pub async fn replace_reset_token(
    conn: &mut DbConn,
    user_phone: &str,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM auth.password_reset_tokens
        WHERE user_phone = $1
        "#,
    )
    .bind(user_phone)
    .execute(&mut *conn)
    .await
    .map_err(Error::Sqlx)?;

    sqlx::query(
        r#"
        INSERT INTO auth.password_reset_tokens (
            user_phone, token_hash, expires_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(user_phone)
    .bind(token_hash)
    .bind(expires_at)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Finds a live reset token row by hash. Expired rows are not returned.
pub async fn find_valid_reset_token(conn: &mut DbConn, token_hash: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT user_phone
        FROM auth.password_reset_tokens
        WHERE token_hash = $1 AND expires_at > now()
        "#,
    )
    .bind(token_hash)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.map(|(phone,)| phone))
}

/// Deletes revoked refresh tokens whose expiry passed the retention window.
pub async fn delete_expired_revoked_tokens(conn: &mut DbConn, retention_minutes: i64) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        DELETE FROM auth.refresh_tokens
        WHERE revoked = TRUE
          AND expires_at < now() - make_interval(mins => $1::int)
        "#,
    )
    .bind(retention_minutes)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?
    .rows_affected();

    Ok(rows_affected)
}
