//! Threads a request through every stage named in spec §4.8 and assembles
//! the terminal decision. This is the one place that maps a collaborator's
//! `GatewayError` onto wire `ViolationTag`s — no collaborator invents its own
//! tag.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::domain::{AuditEventDraft, Decision, RawVerifyRequest, Tool, VerifyRequest, VerifyResponse, ViolationTag};
use crate::error::FailClosedTrigger;
use crate::kv::RateLimitOutcome;
use crate::metrics::Metrics;
use crate::policy::{PolicyEngineClient, PolicyErrorKind, PolicyInput};
use crate::rate_limit::{RateLimiter, SEND_SMS_LIMIT, SEND_SMS_WINDOW_SECONDS};
use crate::replay::{AntiReplayGate, ReplayOutcome};
use crate::rules::{self, RuleInputs};

pub struct Orchestrator {
    replay: AntiReplayGate,
    rate_limiter: RateLimiter,
    audit: Arc<dyn AuditStore>,
    policy: Arc<dyn PolicyEngineClient>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        replay: AntiReplayGate,
        rate_limiter: RateLimiter,
        audit: Arc<dyn AuditStore>,
        policy: Arc<dyn PolicyEngineClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            replay,
            rate_limiter,
            audit,
            policy,
            metrics,
        }
    }

    /// `raw` must already have passed schema validation — the handler
    /// deserializes `raw_body` into `RawVerifyRequest` and returns HTTP 400
    /// itself on failure, before this is ever called (spec §6, "4xx only for
    /// schema-invalid requests"). An unrecognized *value* for `tool`/`mode`/
    /// `role` is not a schema error; that still flows through here and comes
    /// out as a typed violation from the rules layer.
    pub async fn verify(&self, raw: RawVerifyRequest, raw_body: Value) -> VerifyResponse {
        self.metrics.verify_total.inc();
        self.metrics.verify_in_flight.inc();
        let start = tokio::time::Instant::now();

        let request: VerifyRequest = raw.into();
        let response = self.run(request, raw_body).await;

        self.metrics.record_decision(&response.decision.to_string());
        self.metrics
            .verify_duration_seconds
            .observe(start.elapsed().as_secs_f64());
        self.metrics.verify_in_flight.dec();
        response
    }

    async fn run(&self, request: VerifyRequest, raw_body: Value) -> VerifyResponse {
        let tool_ok = request.tool.as_ref().ok().copied();
        let is_write = tool_ok.map(|t| t.is_write()).unwrap_or(true);

        let mut tags: BTreeSet<ViolationTag> = BTreeSet::new();
        let mut audit_action_override: Option<&'static str> = None;
        let mut terminal_before_downstream = false;
        let mut cache_write_eligible = false;

        // 1. ReplayCheck
        let fingerprint = AntiReplayGate::fingerprint(&raw_body);
        match self.replay.claim(request.request_id, &fingerprint).await {
            ReplayOutcome::Fresh => {
                cache_write_eligible = true;
            }
            ReplayOutcome::Hit(cached) => {
                self.metrics.replay_hit_total.inc();
                return cached;
            }
            ReplayOutcome::Mismatch => {
                self.metrics.replay_mismatch_total.inc();
                tags.insert(ViolationTag::InvReplayPayloadMismatch);
                audit_action_override = Some("REPLAY_DETECTED");
                terminal_before_downstream = true;
            }
            ReplayOutcome::Concurrent => {
                self.metrics.replay_concurrent_total.inc();
                tags.insert(ViolationTag::InvReplayConcurrent);
                terminal_before_downstream = true;
            }
            ReplayOutcome::Unavailable => {
                if is_write {
                    tags.insert(ViolationTag::FailClosed);
                    tags.insert(ViolationTag::InvReplayCheckUnavailable);
                    self.metrics.record_fail_closed(FailClosedTrigger::Redis);
                    terminal_before_downstream = true;
                }
                // read-path fail-open: bypass the gate entirely
            }
        }

        // 2. Invariants
        let rule_outcome = rules::evaluate(&RuleInputs {
            tenant_id: &request.context.tenant_id,
            patient_id: &request.subject.patient_id,
            raw_tool: &request.raw_tool,
            tool: tool_ok,
            raw_role: &request.raw_role,
            role: request.role.as_ref().ok().copied(),
            raw_mode: &request.raw_mode,
            mode: request.mode.as_ref().ok().copied(),
            rate_limit_outcome: None,
        });
        let invariants_failed = !rule_outcome.is_empty();
        tags.extend(rule_outcome);

        let mut skip_downstream = terminal_before_downstream || invariants_failed;

        // 3. RateLimit (send_sms only)
        if !skip_downstream {
            if let Some(Tool::SendSms) = tool_ok {
                let key = RateLimiter::send_sms_key(&request.subject.patient_id);
                match self
                    .rate_limiter
                    .check_and_consume(&key, SEND_SMS_WINDOW_SECONDS, SEND_SMS_LIMIT)
                    .await
                {
                    Ok(RateLimitOutcome::Allowed) => {}
                    Ok(RateLimitOutcome::Exceeded) => {
                        self.metrics.rate_limit_deny_total.inc();
                        tags.insert(ViolationTag::InvNoSmsBurst);
                        skip_downstream = true;
                    }
                    Err(_) => {
                        self.metrics.record_fail_closed(FailClosedTrigger::Redis);
                        tags.insert(ViolationTag::FailClosed);
                        tags.insert(ViolationTag::InvNoSmsBurst);
                        skip_downstream = true;
                    }
                }
            }
        }

        // 4. Policy
        let mut policy_extra: Vec<String> = Vec::new();
        if !skip_downstream {
            let input = PolicyInput {
                request_id: request.request_id.to_string(),
                tool: request.raw_tool.clone(),
                mode: request.raw_mode.clone(),
                role: request.raw_role.clone(),
                patient_id: request.subject.patient_id.clone(),
                tenant_id: request.context.tenant_id.clone(),
                args: request.args.clone(),
            };
            match self.policy.evaluate(&input).await {
                Ok(out) => {
                    if !out.allow {
                        policy_extra = out.violations;
                    }
                }
                Err((kind, _err)) => {
                    self.metrics.record_opa_error(kind.as_str());
                    if is_write {
                        self.metrics.record_fail_closed(FailClosedTrigger::Opa);
                        tags.insert(ViolationTag::FailClosed);
                        tags.insert(if kind == PolicyErrorKind::Timeout {
                            ViolationTag::OpaTimeout
                        } else {
                            ViolationTag::OpaUnavailable
                        });
                    }
                    // read-path fail-open: the policy failure is not held
                    // against the request; rules-layer violations (if any)
                    // still apply.
                }
            }
        }

        // 5. Assemble
        let mut response = VerifyResponse::assemble_all(tags.clone(), policy_extra.clone(), tool_ok);

        // 6. Audit (unconditional for every terminal decision, including the
        // denies produced by steps 1-4 above)
        let actor = format!("role:{}", request.raw_role.to_lowercase());
        let action = audit_action_override
            .map(str::to_string)
            .unwrap_or_else(|| request.raw_tool.clone());

        let payload = json!({
            "request": {
                "tool": request.raw_tool,
                "mode": request.raw_mode,
                "role": request.raw_role,
                "subject": request.subject,
                "context": request.context,
                "args": request.args,
            },
            "response": response,
        });

        let draft = AuditEventDraft {
            event_id: Uuid::new_v4(),
            request_id: request.request_id,
            ts: chrono::Utc::now(),
            actor: actor.clone(),
            action: action.clone(),
            decision: response.decision,
            payload,
        };

        if self.audit.append(draft).await.is_err() {
            self.metrics.record_fail_closed(FailClosedTrigger::Postgres);
            tags.insert(ViolationTag::FailClosed);
            tags.insert(ViolationTag::AuditUnavailable);
            // Reuse the same policy-reported violation strings assembled
            // above — not the 2-arg `assemble`, which would silently drop
            // them from `violations`/`reason` (spec §7, "none are silently
            // swallowed").
            response = VerifyResponse::assemble_all(tags.clone(), policy_extra, tool_ok);

            let retry_payload = json!({
                "request": {
                    "tool": request.raw_tool,
                    "mode": request.raw_mode,
                    "role": request.raw_role,
                    "subject": request.subject,
                    "context": request.context,
                    "args": request.args,
                },
                "response": response,
            });
            let retry_draft = AuditEventDraft {
                event_id: Uuid::new_v4(),
                request_id: request.request_id,
                ts: chrono::Utc::now(),
                actor,
                action,
                decision: response.decision,
                payload: retry_payload,
            };
            if self.audit.append(retry_draft).await.is_err() {
                response.reason = format!("{}| audit_append_failed", response.reason);
            }
        }

        // 7. ReplayCacheWrite — only the instance that actually won the
        // `fresh` claim ever writes the cache (design notes, "Idempotent
        // cache-write races"); a `concurrent`/`mismatch` observer must not.
        if cache_write_eligible {
            self.replay
                .cache_decision(request.request_id, &fingerprint, &response)
                .await;
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::kv::InMemoryStore;
    use crate::policy::test_support::{AllowAllPolicy, UnavailablePolicy};
    use serde_json::json;

    fn orchestrator(policy: Arc<dyn PolicyEngineClient>) -> Orchestrator {
        let kv = Arc::new(InMemoryStore::new());
        Orchestrator::new(
            AntiReplayGate::new(kv.clone(), true, 86_400),
            RateLimiter::new(kv),
            Arc::new(InMemoryAuditStore::new()),
            policy,
            Arc::new(Metrics::new()),
        )
    }

    fn body(tool: &str, mode: &str, role: &str, patient: &str, tenant: &str) -> Value {
        json!({
            "request_id": Uuid::new_v4(),
            "tool": tool,
            "mode": mode,
            "role": role,
            "subject": {"patient_id": patient},
            "args": {},
            "context": {"tenant_id": tenant},
        })
    }

    /// Test-only stand-in for the handler's schema validation: every `body`
    /// built above is well-formed, so parsing it into `RawVerifyRequest`
    /// never fails here the way a genuinely schema-invalid HTTP body would.
    async fn verify_body(orch: &Orchestrator, body: Value) -> VerifyResponse {
        let raw: RawVerifyRequest =
            serde_json::from_value(body.clone()).expect("test bodies are always schema-valid");
        orch.verify(raw, body).await
    }

    #[tokio::test]
    async fn s1_read_only_list_appointments_allows() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let resp = verify_body(
            &orch,
            body("list_appointments", "READ_ONLY", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Allow);
        assert!(resp.violations.is_empty());
        assert_eq!(orch.audit.all_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn s2_write_tool_in_read_only_denies() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let resp = verify_body(
            &orch,
            body("create_appointment", "READ_ONLY", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp.violations.contains(&ViolationTag::ModeReadOnlyNoWrite.to_string()));
    }

    #[tokio::test]
    async fn s3_second_send_sms_in_window_is_denied() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let b1 = body("send_sms", "ALLOW", "RECEPTIONIST", "p1", "t1");
        let first = verify_body(&orch, b1).await;
        assert_eq!(first.decision, Decision::Allow);

        let b2 = body("send_sms", "ALLOW", "RECEPTIONIST", "p1", "t1");
        let second = verify_body(&orch, b2).await;
        assert_eq!(second.decision, Decision::Deny);
        assert!(second.violations.contains(&ViolationTag::InvNoSmsBurst.to_string()));
    }

    #[tokio::test]
    async fn s5_missing_tenant_denies() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let resp = verify_body(
            &orch,
            body("list_appointments", "ALLOW", "RECEPTIONIST", "p1", ""),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp
            .violations
            .contains(&ViolationTag::BadRequestMissingTenantId.to_string()));
    }

    #[tokio::test]
    async fn s6_identical_replay_returns_cached_response_without_new_audit_row() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let mut b = body("list_appointments", "ALLOW", "RECEPTIONIST", "p1", "t1");
        let request_id = b["request_id"].clone();

        let first = verify_body(&orch, b.clone()).await;
        assert_eq!(first.decision, Decision::Allow);
        assert_eq!(orch.audit.all_events().await.unwrap().len(), 1);

        // identical body, same request_id
        b["request_id"] = request_id;
        let second = verify_body(&orch, b).await;
        assert_eq!(second.decision, first.decision);
        assert_eq!(second.violations, first.violations);
        assert_eq!(second.reason, first.reason);
        assert_eq!(second.allowed_outputs, first.allowed_outputs);
        assert_eq!(orch.audit.all_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replayed_request_id_with_different_body_is_denied() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let request_id = Uuid::new_v4();
        let mut b1 = body("list_appointments", "ALLOW", "RECEPTIONIST", "p1", "t1");
        b1["request_id"] = json!(request_id);
        verify_body(&orch, b1).await;

        let mut b2 = body("create_appointment", "ALLOW", "RECEPTIONIST", "p1", "t1");
        b2["request_id"] = json!(request_id);
        let second = verify_body(&orch, b2).await;
        assert_eq!(second.decision, Decision::Deny);
        assert!(second
            .violations
            .contains(&ViolationTag::InvReplayPayloadMismatch.to_string()));
    }

    #[tokio::test]
    async fn read_tool_allows_when_policy_engine_is_offline() {
        let orch = orchestrator(Arc::new(UnavailablePolicy));
        let resp = verify_body(
            &orch,
            body("list_appointments", "ALLOW", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn write_tool_fails_closed_when_policy_engine_is_offline() {
        let orch = orchestrator(Arc::new(UnavailablePolicy));
        let resp = verify_body(
            &orch,
            body("create_appointment", "ALLOW", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp.violations.contains(&ViolationTag::FailClosed.to_string()));
    }

    #[tokio::test]
    async fn kill_switch_denies_even_with_allow_all_policy() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let resp = verify_body(
            &orch,
            body("list_appointments", "KILL_SWITCH", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp.violations.contains(&ViolationTag::ModeKillSwitch.to_string()));
    }

    #[tokio::test]
    async fn unknown_mode_is_a_typed_violation_not_a_silent_deny() {
        let orch = orchestrator(Arc::new(AllowAllPolicy));
        let resp = verify_body(
            &orch,
            body("list_appointments", "BOGUS", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp
            .violations
            .contains(&ViolationTag::BadRequestUnknownMode.to_string()));
    }

    #[tokio::test]
    async fn policy_violations_survive_an_audit_append_failure() {
        use async_trait::async_trait;

        use crate::audit::UnavailableAuditStore;

        struct DenyWithExtraPolicy;
        #[async_trait]
        impl PolicyEngineClient for DenyWithExtraPolicy {
            async fn evaluate(
                &self,
                _input: &crate::policy::PolicyInput,
            ) -> Result<crate::policy::PolicyOutput, (PolicyErrorKind, crate::error::GatewayError)>
            {
                Ok(crate::policy::PolicyOutput {
                    allow: false,
                    violations: vec!["Biz_NoWeekendSurgery".to_string()],
                })
            }

            async fn ping(&self) -> Result<(), crate::error::GatewayError> {
                Ok(())
            }
        }

        let kv = Arc::new(InMemoryStore::new());
        let orch = Orchestrator::new(
            AntiReplayGate::new(kv.clone(), true, 86_400),
            RateLimiter::new(kv),
            Arc::new(UnavailableAuditStore),
            Arc::new(DenyWithExtraPolicy),
            Arc::new(Metrics::new()),
        );

        let resp = verify_body(
            &orch,
            body("create_appointment", "ALLOW", "RECEPTIONIST", "p1", "t1"),
        )
        .await;
        assert_eq!(resp.decision, Decision::Deny);
        assert!(resp.violations.contains(&ViolationTag::AuditUnavailable.to_string()));
        assert!(
            resp.violations.contains(&"Biz_NoWeekendSurgery".to_string()),
            "policy-reported violation must survive an audit append failure, got: {:?}",
            resp.violations
        );
    }
}
