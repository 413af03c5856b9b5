//! Redis connection backing the idempotency claims.

use anyhow::Context;
use redis::Client;
use redis::aio::ConnectionManager;

/// Open a reconnecting Redis connection and make sure the server answers.
///
/// The returned manager is cheap to clone; the claim store holds one clone
/// per notifier.
pub async fn connect_redis(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url).context("invalid REDIS_URL")?;
    let addr = client.get_connection_info().addr.to_string();

    let mut manager = ConnectionManager::new(client)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", addr))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .with_context(|| format!("Redis at {} did not answer PING", addr))?;

    tracing::info!(addr = %addr, "Connected to Redis");
    Ok(manager)
}
