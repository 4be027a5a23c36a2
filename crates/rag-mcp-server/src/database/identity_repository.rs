use super::DbPool;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;

/// A user record resolved from a bearer token or an authorized IP.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub user_id: String,
    pub plan: String,
}

/// Access to users, subscriptions, authorized IPs, and the usage log tables.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up the user owning a bearer token, by SHA-256 digest.
    async fn lookup_token(&self, token_hash: &str) -> Result<Option<UserRecord>>;

    /// Plan name for a user id; missing users resolve to `hobby`.
    async fn lookup_user_plan(&self, user_id: &str) -> Result<String>;

    /// Identity pinned to an authorized IP, if any.
    async fn lookup_ip_identity(&self, ip: &str) -> Result<Option<UserRecord>>;

    /// Update `last_used_at` for an authorized IP. Callers fire-and-forget.
    async fn touch_ip(&self, ip: &str, user_id: &str) -> Result<()>;

    /// Events attributed to `identifier` since `since`, summed across the
    /// search and fetch log tables.
    async fn count_events(&self, identifier: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Persist a provider-key eviction so the key stays out of future pools.
    async fn record_key_eviction(&self, key_prefix: &str, reason: &str) -> Result<()>;

    /// Key prefixes evicted in previous runs.
    async fn list_key_evictions(&self) -> Result<Vec<String>>;
}

pub struct IdentityRepository {
    pool: DbPool,
}

impl IdentityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl IdentityStore for IdentityRepository {
    async fn lookup_token(&self, token_hash: &str) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"SELECT u.user_id, u.plan
               FROM api_tokens t
               JOIN users u ON u.user_id = t.user_id
               WHERE t.token_hash = $1 AND t.revoked_at IS NULL"#,
        )
        .bind(token_hash)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    async fn lookup_user_plan(&self, user_id: &str) -> Result<String> {
        let plan = sqlx::query_scalar::<_, String>(
            "SELECT plan FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(plan.unwrap_or_else(|| "hobby".to_string()))
    }

    async fn lookup_ip_identity(&self, ip: &str) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"SELECT u.user_id, u.plan
               FROM ip_authorized a
               JOIN users u ON u.user_id = a.user_id
               WHERE a.ip = $1"#,
        )
        .bind(ip)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(record)
    }

    async fn touch_ip(&self, ip: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ip_authorized SET last_used_at = NOW() WHERE ip = $1 AND user_id = $2",
        )
        .bind(ip)
        .bind(user_id)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    async fn count_events(&self, identifier: &str, since: DateTime<Utc>) -> Result<i64> {
        // One roundtrip; both log tables count toward the same quota.
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT
                (SELECT COUNT(*) FROM search_logs WHERE user_id = $1 AND created_at >= $2)
              + (SELECT COUNT(*) FROM fetch_logs  WHERE user_id = $1 AND created_at >= $2)"#,
        )
        .bind(identifier)
        .bind(since)
        .fetch_one(self.pool.get_pool())
        .await?;

        debug!("{} events for {} since {}", count, identifier, since);

        Ok(count)
    }

    async fn record_key_eviction(&self, key_prefix: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO provider_key_evictions (key_prefix, reason, created_at)
               VALUES ($1, $2, NOW())
               ON CONFLICT (key_prefix) DO NOTHING"#,
        )
        .bind(key_prefix)
        .bind(reason)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    async fn list_key_evictions(&self) -> Result<Vec<String>> {
        let prefixes = sqlx::query_scalar::<_, String>(
            "SELECT key_prefix FROM provider_key_evictions",
        )
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(prefixes)
    }
}
