//! The shared key-value store abstraction backing both the rate limiter
//! (§4.4) and the anti-replay gate (§4.5).
//!
//! Both protocols need the same thing from the store: a single
//! server-evaluated script so a multi-step check-then-write is atomic across
//! every gateway instance talking to the same Redis. `KeyValueStore` exposes
//! exactly those two scripts as named operations; `RedisStore` is the real
//! `redis`-crate-backed implementation, `InMemoryStore` is an in-process
//! stand-in used by tests so the property-based suite (spec §8) doesn't need
//! a live Redis.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::Mutex;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayClaimOutcome {
    Fresh,
    Concurrent,
    /// Cached terminal decision, as the JSON string written by `cas_done`.
    Hit(String),
    Mismatch,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn check_and_consume(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u64,
    ) -> Result<RateLimitOutcome, GatewayError>;

    async fn replay_claim(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
    ) -> Result<ReplayClaimOutcome, GatewayError>;

    /// Compare-and-set the terminal decision into an existing `pending`
    /// record. Must not clobber a record holding a different fingerprint
    /// (protects against a replayed pending key from a prior crashed
    /// worker — spec §9).
    async fn replay_cas_done(
        &self,
        key: &str,
        fingerprint: &str,
        decision_json: &str,
        ttl_seconds: u64,
    ) -> Result<(), GatewayError>;

    /// Cheap reachability probe for `GET /readyz`.
    async fn ping(&self) -> Result<(), GatewayError>;
}

// ─── Redis-backed implementation ──────────────────────────────────────────

const RATE_LIMIT_SCRIPT: &str = r#"
local count = redis.call('GET', KEYS[1])
if not count then
    redis.call('SET', KEYS[1], 1, 'EX', ARGV[2])
    return 1
end
count = tonumber(count)
if count < tonumber(ARGV[1]) then
    return redis.call('INCR', KEYS[1])
end
return -1
"#;

const REPLAY_CLAIM_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
    local payload = cjson.encode({fingerprint = ARGV[1], status = 'pending'})
    redis.call('SET', KEYS[1], payload, 'EX', ARGV[2])
    return 'FRESH'
end
local data = cjson.decode(existing)
if data.fingerprint ~= ARGV[1] then
    return 'MISMATCH'
end
if data.status == 'pending' then
    return 'CONCURRENT'
end
return 'HIT:' .. existing
"#;

const REPLAY_CAS_DONE_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
    return 'SKIPPED'
end
local data = cjson.decode(existing)
if data.fingerprint ~= ARGV[1] then
    return 'SKIPPED'
end
local payload = cjson.encode({fingerprint = ARGV[1], status = 'done', decision = ARGV[2]})
redis.call('SET', KEYS[1], payload, 'EX', ARGV[3])
return 'OK'
"#;

pub struct RedisStore {
    conn: Mutex<ConnectionManager>,
    timeout: Duration,
    rate_limit_script: Script,
    replay_claim_script: Script,
    replay_cas_done_script: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::ReplayUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::ReplayUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            timeout,
            rate_limit_script: Script::new(RATE_LIMIT_SCRIPT),
            replay_claim_script: Script::new(REPLAY_CLAIM_SCRIPT),
            replay_cas_done_script: Script::new(REPLAY_CAS_DONE_SCRIPT),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn check_and_consume(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u64,
    ) -> Result<RateLimitOutcome, GatewayError> {
        let fut = async {
            let mut conn = self.conn.lock().await;
            self.rate_limit_script
                .key(key)
                .arg(limit)
                .arg(window_seconds)
                .invoke_async::<_, i64>(&mut *conn)
                .await
                .map_err(|e| GatewayError::RateLimitUnavailable(e.to_string()))
        };
        let result = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GatewayError::RateLimitUnavailable("timed out".into()))??;
        Ok(if result < 0 {
            RateLimitOutcome::Exceeded
        } else {
            RateLimitOutcome::Allowed
        })
    }

    async fn replay_claim(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
    ) -> Result<ReplayClaimOutcome, GatewayError> {
        let fut = async {
            let mut conn = self.conn.lock().await;
            self.replay_claim_script
                .key(key)
                .arg(fingerprint)
                .arg(ttl_seconds)
                .invoke_async::<_, String>(&mut *conn)
                .await
                .map_err(|e| GatewayError::ReplayUnavailable(e.to_string()))
        };
        let raw = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GatewayError::ReplayUnavailable("timed out".into()))??;
        Ok(parse_claim_result(&raw))
    }

    async fn replay_cas_done(
        &self,
        key: &str,
        fingerprint: &str,
        decision_json: &str,
        ttl_seconds: u64,
    ) -> Result<(), GatewayError> {
        let fut = async {
            let mut conn = self.conn.lock().await;
            self.replay_cas_done_script
                .key(key)
                .arg(fingerprint)
                .arg(decision_json)
                .arg(ttl_seconds)
                .invoke_async::<_, String>(&mut *conn)
                .await
                .map_err(|e| GatewayError::ReplayUnavailable(e.to_string()))
        };
        // Best-effort: errors here are logged by the caller only, never
        // propagated into the returned decision (spec §4.8 step 7).
        let _ = tokio::time::timeout(self.timeout, fut).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let fut = async {
            let mut conn = self.conn.lock().await;
            redis::cmd("PING")
                .query_async::<_, String>(&mut *conn)
                .await
                .map_err(|e| GatewayError::ReplayUnavailable(e.to_string()))
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GatewayError::ReplayUnavailable("timed out".into()))??;
        Ok(())
    }
}

fn parse_claim_result(raw: &str) -> ReplayClaimOutcome {
    match raw {
        "FRESH" => ReplayClaimOutcome::Fresh,
        "CONCURRENT" => ReplayClaimOutcome::Concurrent,
        "MISMATCH" => ReplayClaimOutcome::Mismatch,
        other => other
            .strip_prefix("HIT:")
            .map(|json| ReplayClaimOutcome::Hit(json.to_string()))
            .unwrap_or(ReplayClaimOutcome::Mismatch),
    }
}

// ─── In-memory implementation (tests) ─────────────────────────────────────

#[derive(Clone)]
struct Record {
    fingerprint: String,
    status: RecordStatus,
}

#[derive(Clone, PartialEq, Eq)]
enum RecordStatus {
    Pending,
    Done(String),
}

/// Process-local stand-in for Redis, guarded by a single mutex so the
/// "atomic script" semantics are trivially preserved. Used by tests and by
/// the `unavailable` fault-injection wrapper below.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    replay: Arc<Mutex<HashMap<String, Record>>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn check_and_consume(
        &self,
        key: &str,
        _window_seconds: u64,
        limit: u64,
    ) -> Result<RateLimitOutcome, GatewayError> {
        let mut counters = self.counters.lock().await;
        let count = counters.entry(key.to_string()).or_insert(0);
        if *count < limit {
            *count += 1;
            Ok(RateLimitOutcome::Allowed)
        } else {
            Ok(RateLimitOutcome::Exceeded)
        }
    }

    async fn replay_claim(
        &self,
        key: &str,
        fingerprint: &str,
        _ttl_seconds: u64,
    ) -> Result<ReplayClaimOutcome, GatewayError> {
        let mut replay = self.replay.lock().await;
        match replay.get(key) {
            None => {
                replay.insert(
                    key.to_string(),
                    Record {
                        fingerprint: fingerprint.to_string(),
                        status: RecordStatus::Pending,
                    },
                );
                Ok(ReplayClaimOutcome::Fresh)
            }
            Some(rec) if rec.fingerprint != fingerprint => Ok(ReplayClaimOutcome::Mismatch),
            Some(rec) => match &rec.status {
                RecordStatus::Pending => Ok(ReplayClaimOutcome::Concurrent),
                RecordStatus::Done(decision_json) => {
                    Ok(ReplayClaimOutcome::Hit(decision_json.clone()))
                }
            },
        }
    }

    async fn replay_cas_done(
        &self,
        key: &str,
        fingerprint: &str,
        decision_json: &str,
        _ttl_seconds: u64,
    ) -> Result<(), GatewayError> {
        let mut replay = self.replay.lock().await;
        if let Some(rec) = replay.get(key) {
            if rec.fingerprint == fingerprint {
                replay.insert(
                    key.to_string(),
                    Record {
                        fingerprint: fingerprint.to_string(),
                        status: RecordStatus::Done(decision_json.to_string()),
                    },
                );
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Wraps any `KeyValueStore` and makes every call fail with `unavailable`,
/// for exercising the fail-closed/fail-open paths (P5/P6) without a real
/// outage.
pub struct UnavailableStore;

#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn check_and_consume(
        &self,
        _key: &str,
        _window_seconds: u64,
        _limit: u64,
    ) -> Result<RateLimitOutcome, GatewayError> {
        Err(GatewayError::RateLimitUnavailable("store offline".into()))
    }

    async fn replay_claim(
        &self,
        _key: &str,
        _fingerprint: &str,
        _ttl_seconds: u64,
    ) -> Result<ReplayClaimOutcome, GatewayError> {
        Err(GatewayError::ReplayUnavailable("store offline".into()))
    }

    async fn replay_cas_done(
        &self,
        _key: &str,
        _fingerprint: &str,
        _decision_json: &str,
        _ttl_seconds: u64,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::ReplayUnavailable("store offline".into()))
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Err(GatewayError::ReplayUnavailable("store offline".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limit_allows_then_exceeds() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.check_and_consume("k", 3600, 1).await.unwrap(),
            RateLimitOutcome::Allowed
        );
        assert_eq!(
            store.check_and_consume("k", 3600, 1).await.unwrap(),
            RateLimitOutcome::Exceeded
        );
    }

    #[tokio::test]
    async fn replay_fresh_then_mismatch_then_cas() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.replay_claim("r1", "fp-a", 86_400).await.unwrap(),
            ReplayClaimOutcome::Fresh
        );
        assert_eq!(
            store.replay_claim("r1", "fp-b", 86_400).await.unwrap(),
            ReplayClaimOutcome::Mismatch
        );
        store
            .replay_cas_done("r1", "fp-a", r#"{"decision":"ALLOW"}"#, 86_400)
            .await
            .unwrap();
        assert_eq!(
            store.replay_claim("r1", "fp-a", 86_400).await.unwrap(),
            ReplayClaimOutcome::Hit(r#"{"decision":"ALLOW"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn cas_done_refuses_to_clobber_different_fingerprint() {
        let store = InMemoryStore::new();
        store.replay_claim("r1", "fp-a", 86_400).await.unwrap();
        // A crashed worker's pending claim under a different fingerprint
        // must not be overwritten by this one's cas_done.
        store
            .replay_cas_done("r1", "fp-other", r#"{"decision":"DENY"}"#, 86_400)
            .await
            .unwrap();
        assert_eq!(
            store.replay_claim("r1", "fp-a", 86_400).await.unwrap(),
            ReplayClaimOutcome::Concurrent
        );
    }
}
