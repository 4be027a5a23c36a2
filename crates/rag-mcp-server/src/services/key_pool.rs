use crate::database::IdentityStore;
use anyhow::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keys tried per provider call before giving up.
const MAX_KEY_ATTEMPTS: u32 = 3;
/// Retries on the same key for retryable failures.
const MAX_RETRIES_PER_KEY: u32 = 2;
const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 3000;

/// Outcome classification for a single provider attempt.
#[derive(Debug)]
pub enum ProviderFailure {
    /// The key itself was rejected; evict it and move on without delay.
    KeyInvalid(String),
    /// Transient upstream trouble; retry the same key under backoff.
    Retryable(String),
    /// Non-retryable provider rejection.
    Fatal(String),
}

/// Classify an HTTP response that was not a success.
pub fn classify_response(status: u16, body: &str) -> ProviderFailure {
    let body_lower = body.to_lowercase();
    if status == 401
        || status == 403
        || body_lower.contains("unauthorized")
        || body_lower.contains("invalid api key")
    {
        return ProviderFailure::KeyInvalid(format!("status {}: {}", status, truncate(body, 200)));
    }
    if status == 503 || status == 504 {
        return ProviderFailure::Retryable(format!("status {}", status));
    }
    ProviderFailure::Fatal(format!("status {}: {}", status, truncate(body, 200)))
}

/// Classify a transport-level failure (timeout, connection reset, ...).
pub fn classify_transport(err: &reqwest::Error) -> ProviderFailure {
    ProviderFailure::Retryable(err.to_string())
}

/// Exponential backoff: 1000 ms, 2000 ms, capped at 3000 ms.
pub fn backoff_delay(retry: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << retry.min(8));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// First eight characters of a key, for logs and the eviction table.
pub fn key_prefix(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(key.len());
    &key[..end]
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Ordered provider API key pool shared by the embedding and rerank clients.
///
/// The head of the list is the current key. Eviction removes a key from the
/// pool and persists the decision so restarts do not resurrect it.
pub struct KeyPool {
    keys: Mutex<Vec<String>>,
    store: Arc<dyn IdentityStore>,
}

impl KeyPool {
    /// Build the pool from configured keys, dropping any whose prefix was
    /// evicted in a previous run.
    pub fn new(
        configured: Vec<String>,
        evicted_prefixes: &[String],
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        let keys: Vec<String> = configured
            .into_iter()
            .filter(|k| {
                let keep = !evicted_prefixes.iter().any(|p| p == key_prefix(k));
                if !keep {
                    warn!("Skipping previously evicted provider key {}", key_prefix(k));
                }
                keep
            })
            .collect();

        debug!("Provider key pool initialized with {} keys", keys.len());

        Self {
            keys: Mutex::new(keys),
            store,
        }
    }

    /// Current key, i.e. the head of the pool.
    pub fn current(&self) -> Option<String> {
        self.keys.lock().first().cloned()
    }

    pub fn remaining(&self) -> usize {
        self.keys.lock().len()
    }

    /// Move a key that exhausted its retries to the back of the pool so the
    /// next attempt reaches a different key. The key stays in the pool and
    /// becomes current again once the others have had their turn.
    pub fn demote(&self, key: &str) {
        let mut keys = self.keys.lock();
        if let Some(pos) = keys.iter().position(|k| k == key) {
            let key = keys.remove(pos);
            keys.push(key);
        }
    }

    /// Remove a rejected key and persist the eviction. The key is out of the
    /// pool before the write starts, so no caller can pick it up again.
    pub async fn evict(&self, key: &str, reason: &str) {
        {
            let mut keys = self.keys.lock();
            keys.retain(|k| k != key);
        }
        warn!("Evicted provider key {} ({})", key_prefix(key), reason);

        if let Err(e) = self.store.record_key_eviction(key_prefix(key), reason).await {
            warn!("Failed to persist key eviction: {}", e);
        }
    }
}

/// Run a provider call under the shared failover policy: at most three keys,
/// up to two backoff retries per key, immediate rotation on invalid keys.
/// A key that burns its retry budget is demoted to the back of the pool so
/// the remaining attempts reach the other keys.
pub async fn call_with_failover<T, F, Fut>(pool: &KeyPool, op: &'static str, call: F) -> Result<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    for attempt in 1..=MAX_KEY_ATTEMPTS {
        let Some(key) = pool.current() else {
            anyhow::bail!("{}: no provider API keys available", op);
        };

        let mut retries = 0;
        loop {
            match call(key.clone()).await {
                Ok(value) => return Ok(value),
                Err(ProviderFailure::KeyInvalid(msg)) => {
                    pool.evict(&key, &msg).await;
                    break;
                }
                Err(ProviderFailure::Retryable(msg)) => {
                    if retries >= MAX_RETRIES_PER_KEY {
                        warn!(
                            "{}: key {} exhausted retries (attempt {}): {}",
                            op,
                            key_prefix(&key),
                            attempt,
                            msg
                        );
                        // Rotate it out of contention so the next attempt
                        // picks up a different key.
                        pool.demote(&key);
                        break;
                    }
                    let delay = backoff_delay(retries);
                    debug!("{}: retryable failure, backing off {:?}: {}", op, delay, msg);
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(ProviderFailure::Fatal(msg)) => {
                    anyhow::bail!("{} provider error: {}", op, msg);
                }
            }
        }
    }

    anyhow::bail!("{}: failed after {} key attempts", op, MAX_KEY_ATTEMPTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::identity_repository::MockIdentityStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_with(keys: &[&str]) -> KeyPool {
        let mut store = MockIdentityStore::new();
        store.expect_record_key_eviction().returning(|_, _| Ok(()));
        KeyPool::new(
            keys.iter().map(|k| k.to_string()).collect(),
            &[],
            Arc::new(store),
        )
    }

    #[test]
    fn classifies_auth_failures_as_key_invalid() {
        assert!(matches!(
            classify_response(401, ""),
            ProviderFailure::KeyInvalid(_)
        ));
        assert!(matches!(
            classify_response(403, ""),
            ProviderFailure::KeyInvalid(_)
        ));
        assert!(matches!(
            classify_response(400, "Invalid API key provided"),
            ProviderFailure::KeyInvalid(_)
        ));
    }

    #[test]
    fn classifies_upstream_trouble_as_retryable() {
        assert!(matches!(
            classify_response(503, ""),
            ProviderFailure::Retryable(_)
        ));
        assert!(matches!(
            classify_response(504, ""),
            ProviderFailure::Retryable(_)
        ));
    }

    #[test]
    fn classifies_other_client_errors_as_fatal() {
        assert!(matches!(
            classify_response(422, "bad input"),
            ProviderFailure::Fatal(_)
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2), Duration::from_millis(3000));
        assert_eq!(backoff_delay(5), Duration::from_millis(3000));
    }

    #[test]
    fn key_prefix_is_first_eight_chars() {
        assert_eq!(key_prefix("sk-1234567890"), "sk-12345");
        assert_eq!(key_prefix("short"), "short");
    }

    #[test]
    fn startup_filters_previously_evicted_keys() {
        let store = Arc::new(MockIdentityStore::new());
        let pool = KeyPool::new(
            vec!["sk-aaaaaaaa-1".to_string(), "sk-bbbbbbbb-2".to_string()],
            &["sk-aaaaa".to_string()],
            store,
        );
        assert_eq!(pool.remaining(), 1);
        assert_eq!(pool.current().as_deref(), Some("sk-bbbbbbbb-2"));
    }

    #[tokio::test]
    async fn invalid_key_rotates_to_next_without_delay() {
        let pool = pool_with(&["key-one-aa", "key-two-bb"]);
        let calls = AtomicUsize::new(0);

        let result = call_with_failover(&pool, "test", |key| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    assert_eq!(key, "key-one-aa");
                    Err(ProviderFailure::KeyInvalid("status 401".to_string()))
                } else {
                    assert_eq!(key, "key-two-bb");
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(pool.remaining(), 1);
    }

    #[tokio::test]
    async fn fatal_failure_stops_immediately() {
        let pool = pool_with(&["key-one-aa"]);
        let calls = AtomicUsize::new(0);

        let result: Result<i32> = call_with_failover(&pool, "test", |_key| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ProviderFailure::Fatal("status 422".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_respect_retry_budget() {
        let pool = pool_with(&["key-one-aa"]);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<i32> = call_with_failover(&pool, "test", move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(ProviderFailure::Retryable("status 503".to_string())) }
        })
        .await;

        assert!(result.is_err());
        // 3 outer attempts x (1 try + 2 retries); demotion is a no-op with a
        // single key, so every attempt lands on it.
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_retryable_key_yields_to_later_keys() {
        let pool = pool_with(&["key-one-aa", "key-two-bb", "key-three-c"]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = seen.clone();
        let result = call_with_failover(&pool, "test", move |key| {
            recorder.lock().push(key.clone());
            async move {
                if key == "key-three-c" {
                    Ok(7)
                } else {
                    Err(ProviderFailure::Retryable("status 503".to_string()))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);

        // Keys #1 and #2 each burn their full retry budget, then rotate to
        // the back so the next attempt reaches key #3.
        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|k| k.as_str() == "key-one-aa").count(), 3);
        assert_eq!(seen.iter().filter(|k| k.as_str() == "key-two-bb").count(), 3);
        assert_eq!(seen.last().map(String::as_str), Some("key-three-c"));

        // Demotion keeps all keys in the pool.
        assert_eq!(pool.remaining(), 3);
    }
}
