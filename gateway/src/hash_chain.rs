//! SHA-256 hash chain linking each audit event to its predecessor (spec §4.2).
//!
//! Grounded on the teacher's own `AuditBlock::compute_hash`/`verify` pair —
//! same "fold a handful of fields through one hasher, hex-encode" shape — but
//! the field list and separator match the CASF wire contract exactly.

use sha2::{Digest, Sha256};

use crate::canonical::{canonical_timestamp, canonicalize};
use crate::domain::{AuditEvent, AuditEventDraft, Decision};

/// `SHA-256(request_id | event_id | ts | actor | action | decision | canonical(payload) | prev_hash)`,
/// lowercase hex.
pub fn compute_hash(prev_hash: &str, draft: &AuditEventDraft) -> String {
    let mut hasher = Sha256::new();
    hasher.update(draft.request_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(draft.event_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_timestamp(draft.ts).as_bytes());
    hasher.update(b"|");
    hasher.update(draft.actor.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.action.as_bytes());
    hasher.update(b"|");
    hasher.update(decision_str(draft.decision).as_bytes());
    hasher.update(b"|");
    hasher.update(canonicalize(&draft.payload).as_bytes());
    hasher.update(b"|");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn decision_str(decision: Decision) -> &'static str {
    match decision {
        Decision::Allow => "ALLOW",
        Decision::Deny => "DENY",
    }
}

/// Build the finished, hashed event from a draft and the known `prev_hash`.
pub fn seal(prev_hash: String, draft: AuditEventDraft) -> AuditEvent {
    let hash = compute_hash(&prev_hash, &draft);
    AuditEvent {
        event_id: draft.event_id,
        request_id: draft.request_id,
        ts: draft.ts,
        actor: draft.actor,
        action: draft.action,
        decision: draft.decision,
        payload: draft.payload,
        prev_hash,
        hash,
    }
}

/// Result of replaying the chain: either every link holds, or the index of
/// the first event whose stored `hash` doesn't match its recomputed hash (or
/// whose `prev_hash` doesn't match the predecessor's `hash`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerdict {
    Intact,
    BrokenAt(usize),
}

/// Recompute every event's hash from its own fields and check (a) the stored
/// hash matches and (b) `prev_hash` matches the predecessor's stored hash.
/// `events` must be in insertion order; the first event must have
/// `prev_hash == ""`.
pub fn verify_chain(events: &[AuditEvent]) -> ChainVerdict {
    let mut expected_prev = String::new();
    for (i, event) in events.iter().enumerate() {
        if event.prev_hash != expected_prev {
            return ChainVerdict::BrokenAt(i);
        }
        let draft = AuditEventDraft {
            event_id: event.event_id,
            request_id: event.request_id,
            ts: event.ts,
            actor: event.actor.clone(),
            action: event.action.clone(),
            decision: event.decision,
            payload: event.payload.clone(),
        };
        let recomputed = compute_hash(&event.prev_hash, &draft);
        if recomputed != event.hash {
            return ChainVerdict::BrokenAt(i);
        }
        expected_prev = event.hash.clone();
    }
    ChainVerdict::Intact
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn draft(request_id: Uuid, payload: serde_json::Value) -> AuditEventDraft {
        AuditEventDraft {
            event_id: Uuid::new_v4(),
            request_id,
            ts: chrono::Utc::now(),
            actor: "role:receptionist".into(),
            action: "list_appointments".into(),
            decision: Decision::Allow,
            payload,
        }
    }

    #[test]
    fn genesis_then_chain_verifies() {
        let e0 = seal(String::new(), draft(Uuid::new_v4(), json!({"n": 1})));
        let e1 = seal(e0.hash.clone(), draft(Uuid::new_v4(), json!({"n": 2})));
        assert_eq!(verify_chain(&[e0, e1]), ChainVerdict::Intact);
    }

    #[test]
    fn tampered_payload_breaks_chain_at_that_index() {
        let e0 = seal(String::new(), draft(Uuid::new_v4(), json!({"n": 1})));
        let mut e1 = seal(e0.hash.clone(), draft(Uuid::new_v4(), json!({"n": 2})));
        e1.payload = json!({"n": 999});
        assert_eq!(verify_chain(&[e0, e1]), ChainVerdict::BrokenAt(1));
    }

    #[test]
    fn hash_is_order_sensitive_on_prev_hash() {
        let e0 = seal(String::new(), draft(Uuid::new_v4(), json!({"n": 1})));
        let e1 = seal("not-the-real-prev-hash".into(), draft(Uuid::new_v4(), json!({"n": 2})));
        assert_eq!(verify_chain(&[e0, e1]), ChainVerdict::BrokenAt(1));
    }

    #[test]
    fn empty_chain_is_intact() {
        assert_eq!(verify_chain(&[]), ChainVerdict::Intact);
    }
}
