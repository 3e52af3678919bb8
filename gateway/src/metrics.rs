//! Bounded-cardinality Prometheus metrics (spec §6, §9).
//!
//! All label sets are small fixed enums (`decision`, `trigger`, `kind`) — never
//! `tenant_id`, `patient_id`, `request_id`, `tool`, `role`, `user_id`, or
//! `session_id`. Registered once into an explicit `Metrics` value rather than
//! the `prometheus` crate's default global registry, so tests can build a
//! fresh, isolated instance instead of fighting a process-wide singleton.

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry, CounterVec, Encoder, Gauge,
    Histogram, Registry, TextEncoder,
};

use crate::error::FailClosedTrigger;

pub struct Metrics {
    registry: Registry,
    pub verify_total: prometheus::Counter,
    pub verify_decision_total: CounterVec,
    pub replay_hit_total: prometheus::Counter,
    pub replay_mismatch_total: prometheus::Counter,
    pub replay_concurrent_total: prometheus::Counter,
    pub fail_closed_total: CounterVec,
    pub rate_limit_deny_total: prometheus::Counter,
    pub opa_error_total: CounterVec,
    pub verify_in_flight: Gauge,
    pub verify_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let verify_total =
            register_counter_with_registry!("verify_total", "Total verify requests", registry)
                .expect("metric registration is infallible for a fresh registry");
        let verify_decision_total = register_counter_vec_with_registry!(
            "verify_decision_total",
            "Total verify requests by terminal decision",
            &["decision"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let replay_hit_total = register_counter_with_registry!(
            "replay_hit_total",
            "Anti-replay cache hits (idempotent replays)",
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let replay_mismatch_total = register_counter_with_registry!(
            "replay_mismatch_total",
            "Anti-replay fingerprint mismatches (payload tampering)",
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let replay_concurrent_total = register_counter_with_registry!(
            "replay_concurrent_total",
            "Anti-replay concurrent-claim denials",
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let fail_closed_total = register_counter_vec_with_registry!(
            "fail_closed_total",
            "Fail-closed denials by triggering collaborator",
            &["trigger"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let rate_limit_deny_total = register_counter_with_registry!(
            "rate_limit_deny_total",
            "Requests denied by the rate limiter",
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let opa_error_total = register_counter_vec_with_registry!(
            "opa_error_total",
            "Policy engine call failures by kind",
            &["kind"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let verify_in_flight = register_gauge_with_registry!(
            "verify_in_flight",
            "Verify requests currently being processed",
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let verify_duration_seconds = register_histogram_with_registry!(
            "verify_duration_seconds",
            "End-to-end verify request latency",
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");

        Self {
            registry,
            verify_total,
            verify_decision_total,
            replay_hit_total,
            replay_mismatch_total,
            replay_concurrent_total,
            fail_closed_total,
            rate_limit_deny_total,
            opa_error_total,
            verify_in_flight,
            verify_duration_seconds,
        }
    }

    pub fn record_fail_closed(&self, trigger: FailClosedTrigger) {
        self.fail_closed_total
            .with_label_values(&[trigger.as_str()])
            .inc();
    }

    pub fn record_opa_error(&self, kind: &str) {
        self.opa_error_total.with_label_values(&[kind]).inc();
    }

    pub fn record_decision(&self, decision: &str) {
        self.verify_decision_total.with_label_values(&[decision]).inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buf)
            .expect("Prometheus text encoding of in-process metrics cannot fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_has_no_forbidden_labels() {
        let m = Metrics::new();
        m.record_decision("ALLOW");
        m.record_fail_closed(FailClosedTrigger::Redis);
        m.record_opa_error("timeout");
        let text = String::from_utf8(m.encode()).unwrap();
        for forbidden in [
            "tenant_id",
            "patient_id",
            "request_id",
            "tool=",
            "role=",
            "user_id",
            "session_id",
        ] {
            assert!(!text.contains(forbidden), "forbidden label leaked: {forbidden}");
        }
    }
}
