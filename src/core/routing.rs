//! First-match-wins routing over the merged rule list.

use crate::domain::{RoutingRule, StepOutcome};

/// Stateless evaluator over an ordered list of routing rules
#[derive(Debug, Clone, Default)]
pub struct RoutingEngine {
    rules: Vec<RoutingRule>,
}

impl RoutingEngine {
    /// Create an engine; `rules` must already be in priority order
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Return the first rule whose condition matches the outcome
    pub fn evaluate(&self, outcome: &StepOutcome) -> Option<&RoutingRule> {
        self.rules.iter().find(|rule| rule.when.matches(outcome))
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ActionType, GateStatus, RoutingAction, RoutingCondition, StepStatus,
    };

    fn failed(step_id: &str, exhausted: bool) -> StepOutcome {
        StepOutcome {
            step_id: step_id.to_string(),
            step_status: StepStatus::Failed,
            gate_status: None,
            retry_exhausted: exhausted,
            attempt: 1,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let engine = RoutingEngine::new(vec![
            RoutingRule::new(
                "escalate_build",
                RoutingCondition {
                    step_status: Some(StepStatus::Failed),
                    step_id: Some("build".to_string()),
                    ..Default::default()
                },
                RoutingAction::escalate("build broke"),
            ),
            RoutingRule::new(
                "abort_any",
                RoutingCondition {
                    step_status: Some(StepStatus::Failed),
                    ..Default::default()
                },
                RoutingAction::abort("failure"),
            ),
        ]);

        let rule = engine.evaluate(&failed("build", false)).unwrap();
        assert_eq!(rule.rule_id, "escalate_build");

        let rule = engine.evaluate(&failed("test", false)).unwrap();
        assert_eq!(rule.action.action_type, ActionType::AbortRun);
    }

    #[test]
    fn test_no_match() {
        let engine = RoutingEngine::new(vec![RoutingRule::new(
            "retry_exhausted",
            RoutingCondition {
                retry_exhausted: Some(true),
                ..Default::default()
            },
            RoutingAction::retry(),
        )]);

        assert!(engine.evaluate(&failed("build", false)).is_none());
        assert!(RoutingEngine::default().evaluate(&failed("build", true)).is_none());
    }

    #[test]
    fn test_gate_status_condition_requires_gates() {
        let engine = RoutingEngine::new(vec![RoutingRule::new(
            "gate_failed",
            RoutingCondition {
                gate_status: Some(GateStatus::Failed),
                ..Default::default()
            },
            RoutingAction::goto("fix"),
        )]);

        assert!(engine.evaluate(&failed("build", false)).is_none());

        let mut outcome = failed("build", false);
        outcome.gate_status = Some(GateStatus::Failed);
        assert!(engine.evaluate(&outcome).is_some());
    }
}
