//! Anti-replay gate: claim/read/mismatch protocol over the shared key-value
//! store (spec §4.5). Idempotent for identical retries, strictly rejecting of
//! payload tampering.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canonical::canonicalize;
use crate::domain::VerifyResponse;
use crate::error::GatewayError;
use crate::kv::{KeyValueStore, ReplayClaimOutcome};

/// Outcome the orchestrator branches on (spec §4.5 "Policy on outcomes").
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Fresh,
    Hit(VerifyResponse),
    Mismatch,
    Concurrent,
    Unavailable,
}

/// Wire shape of an anti-replay record (spec §6): `{fingerprint, status,
/// decision?}`. `decision` carries the full cached `VerifyResponse` as a JSON
/// string — "the cached terminal decision" (spec §3 I4) is read here as the
/// whole outcome, not just the `ALLOW`/`DENY` enum, since P1 (byte-equal
/// replay) requires reproducing `violations`/`reason`/`allowed_outputs` too
/// without re-running the pipeline.
#[derive(Serialize, Deserialize)]
struct CachedRecord {
    fingerprint: String,
    status: String,
    decision: Option<String>,
}

pub struct AntiReplayGate {
    store: Arc<dyn KeyValueStore>,
    enabled: bool,
    ttl_seconds: u64,
}

impl AntiReplayGate {
    pub fn new(store: Arc<dyn KeyValueStore>, enabled: bool, ttl_seconds: u64) -> Self {
        Self {
            store,
            enabled,
            ttl_seconds,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn key(request_id: Uuid) -> String {
        format!("casf:req:{request_id}")
    }

    /// SHA-256 over the canonicalized request body with `request_id`
    /// removed, so identical retries of the same logical call fingerprint
    /// the same regardless of how `request_id` is represented in `body`.
    pub fn fingerprint(body: &Value) -> String {
        let mut stripped = body.clone();
        if let Value::Object(map) = &mut stripped {
            map.remove("request_id");
        }
        let canon = canonicalize(&stripped);
        let mut hasher = Sha256::new();
        hasher.update(canon.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Claim the `request_id` against `fingerprint`. Returns `Fresh` to
    /// proceed, `Unavailable` if the store can't be reached (caller decides
    /// fail-open vs fail-closed based on tool kind), or one of the terminal
    /// outcomes the orchestrator must act on directly.
    pub async fn claim(&self, request_id: Uuid, fingerprint: &str) -> ReplayOutcome {
        if !self.enabled {
            return ReplayOutcome::Fresh;
        }
        match self
            .store
            .replay_claim(&Self::key(request_id), fingerprint, self.ttl_seconds)
            .await
        {
            Ok(ReplayClaimOutcome::Fresh) => ReplayOutcome::Fresh,
            Ok(ReplayClaimOutcome::Concurrent) => ReplayOutcome::Concurrent,
            Ok(ReplayClaimOutcome::Mismatch) => ReplayOutcome::Mismatch,
            Ok(ReplayClaimOutcome::Hit(json)) => match serde_json::from_str::<CachedRecord>(&json) {
                Ok(cached) if cached.fingerprint == fingerprint => cached
                    .decision
                    .as_deref()
                    .and_then(|d| serde_json::from_str::<VerifyResponse>(d).ok())
                    .map(ReplayOutcome::Hit)
                    .unwrap_or(ReplayOutcome::Mismatch),
                _ => ReplayOutcome::Mismatch,
            },
            Err(_) => ReplayOutcome::Unavailable,
        }
    }

    /// After a terminal decision has been reached, cache it. Best-effort:
    /// the orchestrator never alters the returned decision based on this
    /// call's outcome (spec §4.8 step 7).
    pub async fn cache_decision(&self, request_id: Uuid, fingerprint: &str, response: &VerifyResponse) {
        if !self.enabled {
            return;
        }
        let Ok(decision_json) = serde_json::to_string(response) else {
            return;
        };
        let record = CachedRecord {
            fingerprint: fingerprint.to_string(),
            status: "done".to_string(),
            decision: Some(decision_json),
        };
        let Ok(json) = serde_json::to_string(&record) else {
            return;
        };
        let _ = self
            .store
            .replay_cas_done(&Self::key(request_id), fingerprint, &json, self.ttl_seconds)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Decision;
    use crate::kv::InMemoryStore;
    use serde_json::json;

    fn gate() -> AntiReplayGate {
        AntiReplayGate::new(Arc::new(InMemoryStore::new()), true, 86_400)
    }

    fn allow_response() -> VerifyResponse {
        VerifyResponse {
            decision: Decision::Allow,
            violations: Vec::new(),
            reason: String::new(),
            allowed_outputs: Vec::new(),
        }
    }

    #[test]
    fn fingerprint_ignores_request_id() {
        let a = json!({"request_id": "a", "tool": "send_sms", "subject": {"patient_id": "p1"}});
        let b = json!({"request_id": "b", "tool": "send_sms", "subject": {"patient_id": "p1"}});
        assert_eq!(AntiReplayGate::fingerprint(&a), AntiReplayGate::fingerprint(&b));
    }

    #[test]
    fn fingerprint_detects_tampering() {
        let a = json!({"request_id": "a", "tool": "send_sms"});
        let b = json!({"request_id": "a", "tool": "create_appointment"});
        assert_ne!(AntiReplayGate::fingerprint(&a), AntiReplayGate::fingerprint(&b));
    }

    #[tokio::test]
    async fn fresh_then_hit_after_cache_write() {
        let gate = gate();
        let id = Uuid::new_v4();
        let fp = "fp-1";
        assert_eq!(gate.claim(id, fp).await, ReplayOutcome::Fresh);
        let response = allow_response();
        gate.cache_decision(id, fp, &response).await;
        assert_eq!(gate.claim(id, fp).await, ReplayOutcome::Hit(response));
    }

    #[tokio::test]
    async fn mismatched_fingerprint_denies() {
        let gate = gate();
        let id = Uuid::new_v4();
        gate.claim(id, "fp-1").await;
        assert_eq!(gate.claim(id, "fp-2").await, ReplayOutcome::Mismatch);
    }

    #[tokio::test]
    async fn concurrent_claim_while_pending() {
        let gate = gate();
        let id = Uuid::new_v4();
        assert_eq!(gate.claim(id, "fp-1").await, ReplayOutcome::Fresh);
        assert_eq!(gate.claim(id, "fp-1").await, ReplayOutcome::Concurrent);
    }

    #[tokio::test]
    async fn disabled_gate_always_fresh() {
        let gate = AntiReplayGate::new(Arc::new(InMemoryStore::new()), false, 86_400);
        let id = Uuid::new_v4();
        assert_eq!(gate.claim(id, "fp-1").await, ReplayOutcome::Fresh);
        assert_eq!(gate.claim(id, "fp-1").await, ReplayOutcome::Fresh);
    }
}
