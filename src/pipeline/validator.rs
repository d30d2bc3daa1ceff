//! Decision validation (pipeline stage 6).
//!
//! Grounded on the source's `validator.py`: a pure predicate over a
//! selected action and the agent's state, never one that itself mutates
//! control flow. A `Critical` outcome is swapped for a safe fallback by
//! the pipeline's caller, not by the validator.

use crate::pipeline::actions::CandidateAction;
use crate::types::{AgentState, AgentStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Ok,
    Warning(String),
    Critical(String),
}

/// Rejects actions an incapacitated/dead agent cannot take, and flags
/// (without rejecting) actions a cautious agent would normally avoid
/// while critically threatened.
pub fn validate(action: &CandidateAction, agent: &AgentState) -> ValidationOutcome {
    match agent.status {
        AgentStatus::Dead | AgentStatus::Unconscious => {
            return ValidationOutcome::Critical(format!(
                "{} cannot act while {:?}",
                agent.id, agent.status
            ));
        }
        AgentStatus::Incapacitated | AgentStatus::Stunned => {
            return ValidationOutcome::Critical(format!(
                "{} is {:?} and cannot perform {}",
                agent.id, agent.status, action.id
            ));
        }
        _ => {}
    }

    if agent.health == crate::types::HealthStatus::Critical
        && matches!(action.category, crate::pipeline::actions::ActionCategory::Combat)
    {
        return ValidationOutcome::Warning(format!(
            "{} is in critical health and chose a combat action",
            agent.id
        ));
    }

    ValidationOutcome::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::actions::ActionCategory;
    use crate::types::AgentState;

    fn action(category: ActionCategory) -> CandidateAction {
        CandidateAction {
            id: "act".to_string(),
            category,
            criteria_scores: [0.5; 8],
        }
    }

    #[test]
    fn dead_agent_cannot_act() {
        let mut agent = AgentState::new("a1", "faction");
        agent.status = AgentStatus::Dead;
        let outcome = validate(&action(ActionCategory::Social), &agent);
        assert!(matches!(outcome, ValidationOutcome::Critical(_)));
    }

    #[test]
    fn healthy_agent_passes() {
        let agent = AgentState::new("a1", "faction");
        assert_eq!(validate(&action(ActionCategory::Social), &agent), ValidationOutcome::Ok);
    }
}
