/// Type alias for the Postgres connection pool.
pub type DbPool = sqlx::PgPool;

/// Type alias for a single Postgres connection.
pub type DbConn = sqlx::PgConnection;
