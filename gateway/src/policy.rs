//! Typed remote call to the external policy engine (spec §4.7). The policy
//! language itself is a black box; this module only classifies how the call
//! can fail and carries back whatever violations it reports.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub request_id: String,
    pub tool: String,
    pub mode: String,
    pub role: String,
    pub patient_id: String,
    pub tenant_id: String,
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyOutput {
    pub allow: bool,
    #[serde(default)]
    pub violations: Vec<String>,
}

/// Which collaborator failure kind tripped — each increments its own
/// `opa_error_total{kind=...}` counter (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyErrorKind {
    Timeout,
    Unavailable,
    BadStatus,
    BadResponse,
}

impl PolicyErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyErrorKind::Timeout => "timeout",
            PolicyErrorKind::Unavailable => "unavailable",
            PolicyErrorKind::BadStatus => "bad_status",
            PolicyErrorKind::BadResponse => "bad_response",
        }
    }
}

#[async_trait]
pub trait PolicyEngineClient: Send + Sync {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyOutput, (PolicyErrorKind, GatewayError)>;

    /// Cheap reachability probe for `GET /readyz`.
    async fn ping(&self) -> Result<(), GatewayError>;
}

pub struct HttpPolicyClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPolicyClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl PolicyEngineClient for HttpPolicyClient {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyOutput, (PolicyErrorKind, GatewayError)> {
        let url = format!("{}/v1/evaluate", self.base_url.trim_end_matches('/'));
        let send = self.client.post(&url).json(input).send();

        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => {
                return Err((
                    PolicyErrorKind::Timeout,
                    GatewayError::PolicyTimeout,
                ))
            }
            Ok(Err(e)) => {
                return Err((
                    PolicyErrorKind::Unavailable,
                    GatewayError::PolicyUnavailable(e.to_string()),
                ))
            }
            Ok(Ok(r)) => r,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err((
                PolicyErrorKind::BadStatus,
                GatewayError::PolicyBadStatus(status),
            ));
        }

        response.json::<PolicyOutput>().await.map_err(|e| {
            (
                PolicyErrorKind::BadResponse,
                GatewayError::PolicyBadResponse(e.to_string()),
            )
        })
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let send = self.client.get(&url).send();
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(r)) if r.status().is_success() => Ok(()),
            Ok(Ok(r)) => Err(GatewayError::PolicyBadStatus(r.status().as_u16())),
            Ok(Err(e)) => Err(GatewayError::PolicyUnavailable(e.to_string())),
            Err(_) => Err(GatewayError::PolicyTimeout),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Always allows with no violations.
    pub struct AllowAllPolicy;

    #[async_trait]
    impl PolicyEngineClient for AllowAllPolicy {
        async fn evaluate(
            &self,
            _input: &PolicyInput,
        ) -> Result<PolicyOutput, (PolicyErrorKind, GatewayError)> {
            Ok(PolicyOutput {
                allow: true,
                violations: Vec::new(),
            })
        }

        async fn ping(&self) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    /// Always fails with a fixed kind, for exercising P5/P6.
    pub struct UnavailablePolicy;

    #[async_trait]
    impl PolicyEngineClient for UnavailablePolicy {
        async fn evaluate(
            &self,
            _input: &PolicyInput,
        ) -> Result<PolicyOutput, (PolicyErrorKind, GatewayError)> {
            Err((
                PolicyErrorKind::Unavailable,
                GatewayError::PolicyUnavailable("offline".into()),
            ))
        }

        async fn ping(&self) -> Result<(), GatewayError> {
            Err(GatewayError::PolicyUnavailable("offline".into()))
        }
    }
}
