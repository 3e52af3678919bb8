//! Internal error taxonomy. Every fallible collaborator call on the request
//! path returns a `GatewayError` variant; the orchestrator is the single
//! place that maps these onto wire `ViolationTag`s (spec §7) — no collaborator
//! invents its own violation tag.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("anti-replay store unavailable: {0}")]
    ReplayUnavailable(String),

    #[error("rate limiter store unavailable: {0}")]
    RateLimitUnavailable(String),

    #[error("policy engine timed out")]
    PolicyTimeout,

    #[error("policy engine unavailable: {0}")]
    PolicyUnavailable(String),

    #[error("policy engine returned a non-success status: {0}")]
    PolicyBadStatus(u16),

    #[error("policy engine response could not be parsed: {0}")]
    PolicyBadResponse(String),

    #[error("audit store unavailable: {0}")]
    AuditUnavailable(String),
}

/// Which external collaborator a `FAIL_CLOSED` was triggered by — used as the
/// `trigger` label on `fail_closed_total` (spec §6); never carries request
/// data, only a fixed small set of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailClosedTrigger {
    Redis,
    Opa,
    Rules,
    Postgres,
}

impl FailClosedTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailClosedTrigger::Redis => "redis",
            FailClosedTrigger::Opa => "opa",
            FailClosedTrigger::Rules => "rules",
            FailClosedTrigger::Postgres => "postgres",
        }
    }
}
