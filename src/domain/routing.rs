//! Declarative routing rules.
//!
//! A rule is a conjunctive condition over a step outcome plus one action.
//! Rules are evaluated in load order and the first match wins.

use serde::{Deserialize, Serialize};

use super::run::StepStatus;

/// Aggregate result of the gates run after a successful executor attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    /// No required gate failed
    Passed,

    /// At least one required gate failed
    Failed,
}

/// What happened to a step, as seen by the routing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step_id: String,
    pub step_status: StepStatus,
    /// Absent when no gates ran for this attempt
    pub gate_status: Option<GateStatus>,
    pub retry_exhausted: bool,
    pub attempt: u32,
}

/// Conjunction of optional predicates; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_status: Option<GateStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_exhausted: Option<bool>,

    /// Exact step id filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl RoutingCondition {
    /// Check every set predicate against the outcome
    pub fn matches(&self, outcome: &StepOutcome) -> bool {
        if let Some(status) = self.step_status {
            if status != outcome.step_status {
                return false;
            }
        }
        if let Some(gate_status) = self.gate_status {
            if outcome.gate_status != Some(gate_status) {
                return false;
            }
        }
        if let Some(exhausted) = self.retry_exhausted {
            if exhausted != outcome.retry_exhausted {
                return false;
            }
        }
        if let Some(ref step_id) = self.step_id {
            if *step_id != outcome.step_id {
                return false;
            }
        }
        true
    }
}

/// Kinds of routing action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Reset the step to pending, even past its retry budget
    RetryStep,

    /// Run the target step next, ignoring its dependencies
    GotoStep,

    /// Fail the run immediately
    AbortRun,

    /// Block the run pending a human decision
    Escalate,
}

/// Action taken when a rule matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Required for GOTO_STEP; optional retry target for RETRY_STEP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step_id: Option<String>,

    #[serde(default)]
    pub reason: String,
}

impl RoutingAction {
    pub fn retry() -> Self {
        Self {
            action_type: ActionType::RetryStep,
            target_step_id: None,
            reason: String::new(),
        }
    }

    pub fn goto(target: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::GotoStep,
            target_step_id: Some(target.into()),
            reason: String::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::AbortRun,
            target_step_id: None,
            reason: reason.into(),
        }
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Escalate,
            target_step_id: None,
            reason: reason.into(),
        }
    }
}

/// A condition → action rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Unique across every merged rule source
    pub rule_id: String,

    #[serde(default)]
    pub when: RoutingCondition,

    pub action: RoutingAction,
}

impl RoutingRule {
    pub fn new(rule_id: impl Into<String>, when: RoutingCondition, action: RoutingAction) -> Self {
        Self {
            rule_id: rule_id.into(),
            when,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_outcome(exhausted: bool) -> StepOutcome {
        StepOutcome {
            step_id: "build".to_string(),
            step_status: StepStatus::Failed,
            gate_status: None,
            retry_exhausted: exhausted,
            attempt: 1,
        }
    }

    #[test]
    fn test_empty_condition_matches_everything() {
        let when = RoutingCondition::default();
        assert!(when.matches(&failed_outcome(false)));
        assert!(when.matches(&failed_outcome(true)));
    }

    #[test]
    fn test_condition_is_conjunctive() {
        let when = RoutingCondition {
            step_status: Some(StepStatus::Failed),
            retry_exhausted: Some(true),
            step_id: Some("build".to_string()),
            ..Default::default()
        };

        assert!(when.matches(&failed_outcome(true)));
        assert!(!when.matches(&failed_outcome(false)));

        let mut other = failed_outcome(true);
        other.step_id = "deploy".to_string();
        assert!(!when.matches(&other));
    }

    #[test]
    fn test_gate_status_requires_gates_to_have_run() {
        let when = RoutingCondition {
            gate_status: Some(GateStatus::Failed),
            ..Default::default()
        };
        assert!(!when.matches(&failed_outcome(false)));

        let mut gated = failed_outcome(false);
        gated.gate_status = Some(GateStatus::Failed);
        assert!(when.matches(&gated));
    }

    #[test]
    fn test_rule_yaml_format() {
        let yaml = r#"
rule_id: ci.retry_flaky
when:
  step_status: FAILED
  retry_exhausted: true
action:
  type: RETRY_STEP
"#;
        let rule: RoutingRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.action.action_type, ActionType::RetryStep);
        assert_eq!(rule.when.step_status, Some(StepStatus::Failed));
        assert_eq!(rule.when.retry_exhausted, Some(true));
    }
}
