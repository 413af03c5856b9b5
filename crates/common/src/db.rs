//! Postgres pool for the release and delivery tables.

use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect to Postgres and bring the schema up to date.
///
/// Migrations run before the pool is handed out, so neither loop ever sees
/// an older schema.
pub async fn connect_postgres(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("failed to apply migrations")?;

    tracing::info!(max_connections, "Connected to PostgreSQL, migrations applied");
    Ok(pool)
}
