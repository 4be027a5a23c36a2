use crate::database::IdentityStore;
use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a resolved IP identity stays cached.
const IP_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Anon,
    Token,
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Hobby,
    Pro,
    Enterprise,
    Unknown,
}

/// Window quotas for a plan; `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub weekly: i64,
    pub minute: i64,
}

impl Plan {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hobby" => Self::Hobby,
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hobby => "hobby",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Unknown => "unknown",
        }
    }

    /// Quota table. Unknown plans fall back to hobby quotas.
    pub fn limits(&self) -> PlanLimits {
        match self {
            Self::Pro => PlanLimits {
                weekly: 10_000,
                minute: 20,
            },
            Self::Enterprise => PlanLimits {
                weekly: -1,
                minute: -1,
            },
            Self::Hobby | Self::Unknown => PlanLimits {
                weekly: 10,
                minute: 1,
            },
        }
    }
}

/// The resolved caller of a tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub kind: IdentityKind,
    /// Quota identifier; anonymous callers get `anon_<ip>`.
    pub user_id: String,
    pub plan: Plan,
    pub token_prefix: Option<String>,
}

impl Identity {
    pub fn anonymous(ip: &str) -> Self {
        Self {
            kind: IdentityKind::Anon,
            user_id: format!("anon_{}", ip),
            plan: Plan::Hobby,
            token_prefix: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == IdentityKind::Anon
    }
}

/// Client IP with proxy-header precedence:
/// `cf-connecting-ip`, first `x-forwarded-for` entry, `x-real-ip`, then the
/// socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(ip) = header_value(headers, "cf-connecting-ip") {
        return ip;
    }
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = header_value(headers, "x-real-ip") {
        return ip;
    }
    match peer {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// SHA-256 digest used to match bearer tokens against the identity store.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

struct CachedIdentity {
    identity: Identity,
    expires_at: Instant,
}

/// Classifies each request as token-authenticated, IP-authenticated, or
/// anonymous. Store failures degrade to the next tier instead of failing the
/// request.
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    ip_cache: DashMap<String, CachedIdentity>,
    cache_ttl: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self::with_ttl(store, IP_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn IdentityStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            ip_cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Resolve the caller. `authorization` is the raw Authorization header.
    pub async fn resolve(&self, authorization: Option<&str>, ip: &str) -> Identity {
        if let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                match self.store.lookup_token(&token_digest(token)).await {
                    Ok(Some(record)) => {
                        debug!("Resolved token identity for user {}", record.user_id);
                        return Identity {
                            kind: IdentityKind::Token,
                            user_id: record.user_id,
                            plan: Plan::parse(&record.plan),
                            token_prefix: Some(token_prefix(token)),
                        };
                    }
                    Ok(None) => {
                        debug!("Bearer token not recognized, trying IP tier");
                    }
                    Err(e) => {
                        warn!("Token lookup failed, degrading to IP tier: {}", e);
                    }
                }
            }
        }

        if let Some(identity) = self.resolve_ip(ip).await {
            return identity;
        }

        Identity::anonymous(ip)
    }

    async fn resolve_ip(&self, ip: &str) -> Option<Identity> {
        if ip == "unknown" {
            return None;
        }

        if let Some(entry) = self.ip_cache.get(ip) {
            if entry.expires_at > Instant::now() {
                let identity = entry.identity.clone();
                drop(entry);
                self.spawn_touch(ip, &identity.user_id);
                return Some(identity);
            }
            drop(entry);
            self.ip_cache.remove(ip);
        }

        match self.store.lookup_ip_identity(ip).await {
            Ok(Some(record)) => {
                let identity = Identity {
                    kind: IdentityKind::Ip,
                    user_id: record.user_id,
                    plan: Plan::parse(&record.plan),
                    token_prefix: None,
                };
                self.ip_cache.insert(
                    ip.to_string(),
                    CachedIdentity {
                        identity: identity.clone(),
                        expires_at: Instant::now() + self.cache_ttl,
                    },
                );
                Some(identity)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("IP identity lookup failed, degrading to anonymous: {}", e);
                None
            }
        }
    }

    fn spawn_touch(&self, ip: &str, user_id: &str) {
        let store = self.store.clone();
        let ip = ip.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.touch_ip(&ip, &user_id).await {
                warn!("IP touch failed for {}: {}", ip, e);
            }
        });
    }

    /// Drop expired cache entries. Called from the hourly sweep task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.ip_cache.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.ip_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::identity_repository::MockIdentityStore;
    use crate::database::UserRecord;

    fn record(user_id: &str, plan: &str) -> UserRecord {
        UserRecord {
            user_id: user_id.to_string(),
            plan: plan.to_string(),
        }
    }

    #[test]
    fn plan_table_matches_quota_matrix() {
        assert_eq!(Plan::Hobby.limits(), PlanLimits { weekly: 10, minute: 1 });
        assert_eq!(
            Plan::Pro.limits(),
            PlanLimits {
                weekly: 10_000,
                minute: 20
            }
        );
        assert_eq!(
            Plan::Enterprise.limits(),
            PlanLimits {
                weekly: -1,
                minute: -1
            }
        );
        assert_eq!(Plan::Unknown.limits(), Plan::Hobby.limits());
    }

    #[test]
    fn client_ip_prefers_cloudflare_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "1.2.3.4".parse().unwrap());
        headers.insert("x-forwarded-for", "5.6.7.8, 9.9.9.9".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());

        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn client_ip_takes_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "5.6.7.8, 9.9.9.9".parse().unwrap());

        assert_eq!(client_ip(&headers, None), "5.6.7.8");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[tokio::test]
    async fn bearer_token_takes_precedence_over_ip() {
        let mut store = MockIdentityStore::new();
        store
            .expect_lookup_token()
            .returning(|_| Ok(Some(record("user-1", "pro"))));
        // No lookup_ip_identity expectation: reaching it would panic.

        let resolver = IdentityResolver::new(Arc::new(store));
        let identity = resolver
            .resolve(Some("Bearer tok-123456789"), "1.2.3.4")
            .await;

        assert_eq!(identity.kind, IdentityKind::Token);
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.plan, Plan::Pro);
        assert_eq!(identity.token_prefix.as_deref(), Some("tok-1234"));
    }

    #[tokio::test]
    async fn token_store_error_degrades_to_ip_tier() {
        let mut store = MockIdentityStore::new();
        store
            .expect_lookup_token()
            .returning(|_| Err(anyhow::anyhow!("store down")));
        store
            .expect_lookup_ip_identity()
            .returning(|_| Ok(Some(record("user-2", "enterprise"))));

        let resolver = IdentityResolver::new(Arc::new(store));
        let identity = resolver.resolve(Some("Bearer whatever"), "1.2.3.4").await;

        assert_eq!(identity.kind, IdentityKind::Ip);
        assert_eq!(identity.user_id, "user-2");
        assert_eq!(identity.plan, Plan::Enterprise);
    }

    #[tokio::test]
    async fn unmatched_request_resolves_anonymous() {
        let mut store = MockIdentityStore::new();
        store.expect_lookup_ip_identity().returning(|_| Ok(None));

        let resolver = IdentityResolver::new(Arc::new(store));
        let identity = resolver.resolve(None, "1.2.3.4").await;

        assert_eq!(identity.kind, IdentityKind::Anon);
        assert_eq!(identity.user_id, "anon_1.2.3.4");
        assert_eq!(identity.plan, Plan::Hobby);
    }

    #[tokio::test]
    async fn ip_identity_is_cached_and_touched() {
        let mut store = MockIdentityStore::new();
        store
            .expect_lookup_ip_identity()
            .times(1)
            .returning(|_| Ok(Some(record("user-3", "pro"))));
        store.expect_touch_ip().returning(|_, _| Ok(()));

        let resolver = IdentityResolver::new(Arc::new(store));

        let first = resolver.resolve(None, "9.9.9.9").await;
        let second = resolver.resolve(None, "9.9.9.9").await;

        assert_eq!(first.user_id, "user-3");
        assert_eq!(second.user_id, "user-3");
        assert_eq!(resolver.cached_entries(), 1);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_swept() {
        let mut store = MockIdentityStore::new();
        store
            .expect_lookup_ip_identity()
            .returning(|_| Ok(Some(record("user-4", "hobby"))));

        let resolver =
            IdentityResolver::with_ttl(Arc::new(store), Duration::from_millis(0));
        resolver.resolve(None, "8.8.8.8").await;
        assert_eq!(resolver.cached_entries(), 1);

        resolver.sweep();
        assert_eq!(resolver.cached_entries(), 0);
    }
}
