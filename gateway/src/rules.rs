//! Deterministic, network-free hard invariants (spec §4.6). Evaluated
//! in-process, in order, accumulating every violation rather than stopping at
//! the first one — the response reports the full set (spec §4.8 tie-break
//! rules).

use std::collections::BTreeSet;

use crate::domain::{Mode, Role, Tool, ToolKind, ViolationTag};
use crate::rate_limit::RateLimitOutcome;

/// Everything the rules layer needs that isn't already on `VerifyRequest`
/// directly — specifically whether the rate limiter (consulted by the
/// orchestrator before this runs, for `send_sms` only) already said
/// `exceeded`.
pub struct RuleInputs<'a> {
    pub tenant_id: &'a str,
    pub patient_id: &'a str,
    pub raw_tool: &'a str,
    pub tool: Option<Tool>,
    pub raw_role: &'a str,
    pub role: Option<Role>,
    pub raw_mode: &'a str,
    pub mode: Option<Mode>,
    pub rate_limit_outcome: Option<RateLimitOutcome>,
}

/// Evaluate every hard invariant and return the accumulated violation set,
/// exactly the table in spec §4.6.
pub fn evaluate(input: &RuleInputs) -> BTreeSet<ViolationTag> {
    let mut violations = BTreeSet::new();

    if input.tenant_id.is_empty() {
        violations.insert(ViolationTag::BadRequestMissingTenantId);
    }
    if input.patient_id.is_empty() {
        violations.insert(ViolationTag::BadRequestMissingPatientId);
    }
    if input.tool.is_none() {
        violations.insert(ViolationTag::ToolUnknown);
    }
    if input.role.is_none() {
        violations.insert(ViolationTag::BadRequestUnknownRole);
    }
    if input.mode.is_none() {
        violations.insert(ViolationTag::BadRequestUnknownMode);
    }

    if let Some(Mode::KillSwitch) = input.mode {
        violations.insert(ViolationTag::ModeKillSwitch);
    }

    if let (Some(tool), Some(Mode::ReadOnly)) = (input.tool, input.mode) {
        if tool.kind() == ToolKind::Write {
            violations.insert(ViolationTag::ModeReadOnlyNoWrite);
        }
    }

    if let Some(Tool::SendSms) = input.tool {
        if input.rate_limit_outcome == Some(RateLimitOutcome::Exceeded) {
            violations.insert(ViolationTag::InvNoSmsBurst);
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RuleInputs<'static> {
        RuleInputs {
            tenant_id: "t1",
            patient_id: "p1",
            raw_tool: "list_appointments",
            tool: Some(Tool::ListAppointments),
            raw_role: "RECEPTIONIST",
            role: Some(Role::Receptionist),
            raw_mode: "ALLOW",
            mode: Some(Mode::Allow),
            rate_limit_outcome: None,
        }
    }

    #[test]
    fn clean_request_has_no_violations() {
        assert!(evaluate(&base()).is_empty());
    }

    #[test]
    fn missing_tenant_is_flagged() {
        let input = RuleInputs { tenant_id: "", ..base() };
        assert!(evaluate(&input).contains(&ViolationTag::BadRequestMissingTenantId));
    }

    #[test]
    fn write_tool_in_read_only_mode_is_denied() {
        let input = RuleInputs {
            tool: Some(Tool::CreateAppointment),
            raw_tool: "create_appointment",
            mode: Some(Mode::ReadOnly),
            raw_mode: "READ_ONLY",
            ..base()
        };
        assert!(evaluate(&input).contains(&ViolationTag::ModeReadOnlyNoWrite));
    }

    #[test]
    fn read_tool_in_read_only_mode_is_fine() {
        let input = RuleInputs {
            mode: Some(Mode::ReadOnly),
            raw_mode: "READ_ONLY",
            ..base()
        };
        assert!(evaluate(&input).is_empty());
    }

    #[test]
    fn kill_switch_always_denies() {
        let input = RuleInputs {
            mode: Some(Mode::KillSwitch),
            raw_mode: "KILL_SWITCH",
            ..base()
        };
        assert!(evaluate(&input).contains(&ViolationTag::ModeKillSwitch));
    }

    #[test]
    fn step_up_behaves_like_allow_at_rules_layer() {
        let input = RuleInputs {
            mode: Some(Mode::StepUp),
            raw_mode: "STEP_UP",
            ..base()
        };
        assert!(evaluate(&input).is_empty());
    }

    #[test]
    fn send_sms_burst_is_flagged_only_when_exceeded() {
        let input = RuleInputs {
            tool: Some(Tool::SendSms),
            raw_tool: "send_sms",
            rate_limit_outcome: Some(RateLimitOutcome::Exceeded),
            ..base()
        };
        assert!(evaluate(&input).contains(&ViolationTag::InvNoSmsBurst));

        let input2 = RuleInputs {
            rate_limit_outcome: Some(RateLimitOutcome::Allowed),
            ..input
        };
        assert!(!evaluate(&input2).contains(&ViolationTag::InvNoSmsBurst));
    }

    #[test]
    fn unknown_mode_is_flagged_not_silently_denied_some_other_way() {
        let input = RuleInputs {
            mode: None,
            raw_mode: "BOGUS",
            ..base()
        };
        assert!(evaluate(&input).contains(&ViolationTag::BadRequestUnknownMode));
    }

    #[test]
    fn multiple_violations_all_accumulate() {
        let input = RuleInputs {
            tenant_id: "",
            patient_id: "",
            tool: None,
            raw_tool: "bogus_tool",
            ..base()
        };
        let violations = evaluate(&input);
        assert!(violations.contains(&ViolationTag::BadRequestMissingTenantId));
        assert!(violations.contains(&ViolationTag::BadRequestMissingPatientId));
        assert!(violations.contains(&ViolationTag::ToolUnknown));
    }
}
