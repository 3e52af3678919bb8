//! Wire types for the verification gateway: requests, responses, audit events,
//! and the closed enums (`Mode`, `Role`, `Tool`, `Decision`, `ViolationTag`) that
//! back them. `args` stays opaque `serde_json::Value` — the core never inspects it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution mode under which a request is evaluated.
///
/// Recognized values are exactly `{ALLOW, STEP_UP, READ_ONLY, KILL_SWITCH}`;
/// anything else is a `BadRequest_UnknownMode`, never a silent deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Allow,
    StepUp,
    ReadOnly,
    KillSwitch,
}

impl FromStr for Mode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOW" => Ok(Mode::Allow),
            "STEP_UP" => Ok(Mode::StepUp),
            "READ_ONLY" => Ok(Mode::ReadOnly),
            "KILL_SWITCH" => Ok(Mode::KillSwitch),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Closed set of role tags recognized by the gateway's rules layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Receptionist,
    Clinician,
    Nurse,
    Scheduler,
    Admin,
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEPTIONIST" => Ok(Role::Receptionist),
            "CLINICIAN" => Ok(Role::Clinician),
            "NURSE" => Ok(Role::Nurse),
            "SCHEDULER" => Ok(Role::Scheduler),
            "ADMIN" => Ok(Role::Admin),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A tool's side-effect classification. WRITE tools go through the rate
/// limiter and are fail-closed on infra failure; READ tools fail open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Write,
}

/// Output channel a tool may be permitted to use once allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputChannel {
    Sms,
    Email,
    PatientPortal,
    Ehr,
    Ui,
}

/// Closed set of tool identifiers the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    ListAppointments,
    GetPatientRecord,
    ViewLabResults,
    CreateAppointment,
    CancelAppointment,
    UpdatePatientRecord,
    OrderLabTest,
    SendSms,
}

impl FromStr for Tool {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list_appointments" => Ok(Tool::ListAppointments),
            "get_patient_record" => Ok(Tool::GetPatientRecord),
            "view_lab_results" => Ok(Tool::ViewLabResults),
            "create_appointment" => Ok(Tool::CreateAppointment),
            "cancel_appointment" => Ok(Tool::CancelAppointment),
            "update_patient_record" => Ok(Tool::UpdatePatientRecord),
            "order_lab_test" => Ok(Tool::OrderLabTest),
            "send_sms" => Ok(Tool::SendSms),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl Tool {
    pub fn kind(&self) -> ToolKind {
        match self {
            Tool::ListAppointments | Tool::GetPatientRecord | Tool::ViewLabResults => {
                ToolKind::Read
            }
            Tool::CreateAppointment
            | Tool::CancelAppointment
            | Tool::UpdatePatientRecord
            | Tool::OrderLabTest
            | Tool::SendSms => ToolKind::Write,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind() == ToolKind::Write
    }

    /// Static output set a tool is allowed to use once the decision is ALLOW.
    pub fn allowed_outputs(&self) -> &'static [OutputChannel] {
        match self {
            Tool::ListAppointments => &[OutputChannel::Ui],
            Tool::GetPatientRecord | Tool::ViewLabResults => {
                &[OutputChannel::Ui, OutputChannel::Ehr]
            }
            Tool::CreateAppointment | Tool::CancelAppointment => {
                &[OutputChannel::Ui, OutputChannel::Ehr]
            }
            Tool::UpdatePatientRecord | Tool::OrderLabTest => &[OutputChannel::Ehr],
            Tool::SendSms => &[OutputChannel::Sms],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::ListAppointments => "list_appointments",
            Tool::GetPatientRecord => "get_patient_record",
            Tool::ViewLabResults => "view_lab_results",
            Tool::CreateAppointment => "create_appointment",
            Tool::CancelAppointment => "cancel_appointment",
            Tool::UpdatePatientRecord => "update_patient_record",
            Tool::OrderLabTest => "order_lab_test",
            Tool::SendSms => "send_sms",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An unrecognized value was supplied for a closed-set field. Carries the raw
/// string so it can be echoed back for debugging without panicking.
#[derive(Debug, Clone)]
pub struct UnknownVariant(pub String);

/// Terminal decision returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Deny => write!(f, "DENY"),
        }
    }
}

/// Stable violation tag strings; part of the wire contract (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationTag {
    BadRequestMissingTenantId,
    BadRequestMissingPatientId,
    BadRequestUnknownRole,
    BadRequestUnknownMode,
    ToolUnknown,
    ModeKillSwitch,
    ModeReadOnlyNoWrite,
    InvReplayPayloadMismatch,
    InvReplayConcurrent,
    InvReplayCheckUnavailable,
    InvNoSmsBurst,
    OpaUnavailable,
    OpaTimeout,
    AuditUnavailable,
    FailClosed,
}

impl ViolationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationTag::BadRequestMissingTenantId => "BadRequest_MissingTenantId",
            ViolationTag::BadRequestMissingPatientId => "BadRequest_MissingPatientId",
            ViolationTag::BadRequestUnknownRole => "BadRequest_UnknownRole",
            ViolationTag::BadRequestUnknownMode => "BadRequest_UnknownMode",
            ViolationTag::ToolUnknown => "Tool_Unknown",
            ViolationTag::ModeKillSwitch => "Mode_KillSwitch",
            ViolationTag::ModeReadOnlyNoWrite => "Mode_ReadOnly_NoWrite",
            ViolationTag::InvReplayPayloadMismatch => "Inv_ReplayPayloadMismatch",
            ViolationTag::InvReplayConcurrent => "Inv_ReplayConcurrent",
            ViolationTag::InvReplayCheckUnavailable => "Inv_ReplayCheckUnavailable",
            ViolationTag::InvNoSmsBurst => "Inv_NoSmsBurst",
            ViolationTag::OpaUnavailable => "OPA_Unavailable",
            ViolationTag::OpaTimeout => "OPA_Timeout",
            ViolationTag::AuditUnavailable => "Audit_Unavailable",
            ViolationTag::FailClosed => "FAIL_CLOSED",
        }
    }
}

impl fmt::Display for ViolationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    pub patient_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Raw wire shape of the inbound request, before `tool`/`mode`/`role` are
/// validated against their closed sets. Kept deliberately permissive (plain
/// `String`s) so schema-invalid-but-parseable bodies still reach the rules
/// layer and surface as typed violations rather than a bare 400.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVerifyRequest {
    pub request_id: Uuid,
    pub tool: String,
    pub mode: String,
    pub role: String,
    pub subject: Subject,
    #[serde(default)]
    pub args: serde_json::Value,
    pub context: RequestContext,
}

/// A fully parsed request. `tool`/`mode`/`role` are `Result` rather than the
/// parsed enum directly: an unknown value is itself meaningful input to the
/// rules layer (`Tool_Unknown`, `BadRequest_UnknownMode`, ...), not a parse
/// failure that should short-circuit before invariants run.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub request_id: Uuid,
    pub raw_tool: String,
    pub tool: Result<Tool, UnknownVariant>,
    pub raw_mode: String,
    pub mode: Result<Mode, UnknownVariant>,
    pub raw_role: String,
    pub role: Result<Role, UnknownVariant>,
    pub subject: Subject,
    pub args: serde_json::Value,
    pub context: RequestContext,
}

impl From<RawVerifyRequest> for VerifyRequest {
    fn from(raw: RawVerifyRequest) -> Self {
        Self {
            request_id: raw.request_id,
            tool: Tool::from_str(&raw.tool),
            raw_tool: raw.tool,
            mode: Mode::from_str(&raw.mode),
            raw_mode: raw.mode,
            role: Role::from_str(&raw.role),
            raw_role: raw.role,
            subject: raw.subject,
            args: raw.args,
            context: raw.context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub decision: Decision,
    pub violations: Vec<String>,
    pub reason: String,
    pub allowed_outputs: Vec<OutputChannel>,
}

impl VerifyResponse {
    /// Assemble a response from an accumulated, possibly-empty violation set.
    /// `decision=ALLOW` iff the set is empty (spec §4.8 step 5).
    pub fn assemble(violations: BTreeSet<ViolationTag>, tool: Option<Tool>) -> Self {
        Self::assemble_all(violations, Vec::new(), tool)
    }

    /// Same as `assemble`, but also merges `extra` — opaque violation strings
    /// reported by the external policy engine that don't belong to the
    /// closed `ViolationTag` set. `decision=ALLOW` iff both are empty.
    pub fn assemble_all(
        violations: BTreeSet<ViolationTag>,
        extra: Vec<String>,
        tool: Option<Tool>,
    ) -> Self {
        if violations.is_empty() && extra.is_empty() {
            let allowed_outputs = tool.map(|t| t.allowed_outputs().to_vec()).unwrap_or_default();
            VerifyResponse {
                decision: Decision::Allow,
                violations: Vec::new(),
                reason: String::new(),
                allowed_outputs,
            }
        } else {
            let mut tags: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
            tags.extend(extra);
            tags.sort();
            tags.dedup();
            VerifyResponse {
                decision: Decision::Deny,
                reason: tags.join("|"),
                violations: tags,
                allowed_outputs: Vec::new(),
            }
        }
    }
}

/// An append-only audit record. Once constructed by the hash-chain engine it
/// is immutable; the audit writer only ever inserts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub actor: String,
    pub action: String,
    pub decision: Decision,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Everything needed to compute an `AuditEvent`'s hash before it has one.
pub struct AuditEventDraft {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub actor: String,
    pub action: String,
    pub decision: Decision,
    pub payload: serde_json::Value,
}
