//! Threat assessment (pipeline stage 2).
//!
//! Grounded on the source's `threat_assessor.py`: a handful of weighted
//! factors combine into one `ThreatLevel`, then a character's bias can
//! nudge it by exactly one level in either direction.

use crate::types::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    Negligible,
    Low,
    Moderate,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn escalate(self) -> Self {
        match self {
            ThreatLevel::Negligible => ThreatLevel::Low,
            ThreatLevel::Low => ThreatLevel::Moderate,
            ThreatLevel::Moderate => ThreatLevel::High,
            ThreatLevel::High | ThreatLevel::Critical => ThreatLevel::Critical,
        }
    }

    pub fn de_escalate(self) -> Self {
        match self {
            ThreatLevel::Critical => ThreatLevel::High,
            ThreatLevel::High => ThreatLevel::Moderate,
            ThreatLevel::Moderate => ThreatLevel::Low,
            ThreatLevel::Low | ThreatLevel::Negligible => ThreatLevel::Negligible,
        }
    }

    /// `1.0` at `Negligible` rising to `2.0` at `Critical` — the action
    /// evaluation stage's threat modifier.
    pub fn action_modifier(self) -> f64 {
        match self {
            ThreatLevel::Negligible => 1.0,
            ThreatLevel::Low => 1.25,
            ThreatLevel::Moderate => 1.5,
            ThreatLevel::High => 1.75,
            ThreatLevel::Critical => 2.0,
        }
    }

    fn from_score(score: f64) -> Self {
        if score < 0.2 {
            ThreatLevel::Negligible
        } else if score < 0.4 {
            ThreatLevel::Low
        } else if score < 0.6 {
            ThreatLevel::Moderate
        } else if score < 0.8 {
            ThreatLevel::High
        } else {
            ThreatLevel::Critical
        }
    }
}

/// Inputs to one threat assessment, already resolved by the caller from
/// the causal-graph context of the triggering event.
#[derive(Debug, Clone, Default)]
pub struct ThreatInputs {
    pub direct_threat: f64,
    pub location_proximity: f64,
    pub faction_hostility: f64,
    pub vulnerability: f64,
}

/// `direct_threat*0.4 + location_proximity*0.2 + faction_hostility*0.2 +
/// vulnerability*0.2`, then escalated/de-escalated by one level for a
/// paranoid (high caution) or naive (low discipline) agent.
pub fn assess_threat(inputs: &ThreatInputs, agent: &AgentState) -> ThreatLevel {
    let score = inputs.direct_threat * 0.4
        + inputs.location_proximity * 0.2
        + inputs.faction_hostility * 0.2
        + inputs.vulnerability * 0.2;
    let level = ThreatLevel::from_score(score.clamp(0.0, 1.0));

    if agent.personality.caution > 0.3 {
        level.escalate()
    } else if agent.personality.discipline < -0.3 {
        level.de_escalate()
    } else {
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentState, PersonalityTraits};

    fn agent_with(caution: f64, discipline: f64) -> AgentState {
        let mut agent = AgentState::new("a1", "faction");
        agent.personality = PersonalityTraits {
            caution,
            discipline,
            ..Default::default()
        };
        agent
    }

    #[test]
    fn escalates_and_deescalates_by_one_level_at_the_ends() {
        assert_eq!(ThreatLevel::Critical.escalate(), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::Negligible.de_escalate(), ThreatLevel::Negligible);
        assert_eq!(ThreatLevel::Low.escalate(), ThreatLevel::Moderate);
    }

    #[test]
    fn paranoid_agent_escalates_assessment() {
        let cautious = agent_with(0.9, 0.5);
        let inputs = ThreatInputs {
            direct_threat: 0.3,
            location_proximity: 0.3,
            faction_hostility: 0.3,
            vulnerability: 0.3,
        };
        let level = assess_threat(&inputs, &cautious);
        assert!(level >= ThreatLevel::Moderate);
    }
}
