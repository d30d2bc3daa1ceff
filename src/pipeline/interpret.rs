//! Event interpretation (pipeline stage 1).
//!
//! Grounded on the source's `world_interpreter.py`
//! `_determine_active_biases`: personality thresholds (and current
//! stress/morale) select zero or more active biases. The source
//! matches on `paranoia`/`intelligence` personality keys this crate's
//! typed [`PersonalityTraits`] doesn't carry verbatim; `caution` and
//! `discipline` are the nearest typed fields and stand in for them.

use crate::causal_graph::CausalGraph;
use crate::types::{AgentState, Event, EventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Optimistic,
    Pessimistic,
    Paranoid,
    Naive,
    Cynical,
    Idealistic,
    Pragmatic,
    Emotional,
}

/// One interpreted event: the event itself, the causes the causal graph
/// attributes to it, and the biases that colored the reading.
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub event_id: EventId,
    pub causal_predecessors: Vec<EventId>,
    pub biases: Vec<Bias>,
}

/// Personality- and state-based bias selection, mirroring the source's
/// threshold cascade. Traits live in `[-1, 1]` with 0 neutral, so every
/// threshold below is read relative to that midpoint, not to `[0, 1]`.
pub fn active_biases(agent: &AgentState) -> Vec<Bias> {
    let mut biases = Vec::new();
    let p = &agent.personality;

    if p.optimism > 0.4 {
        biases.push(Bias::Optimistic);
    } else if p.optimism < -0.4 {
        biases.push(Bias::Pessimistic);
    }

    if p.caution > 0.3 {
        biases.push(Bias::Paranoid);
    }

    if p.discipline < -0.3 {
        biases.push(Bias::Naive);
    } else if p.discipline > 0.5 {
        biases.push(Bias::Pragmatic);
    }

    if agent.stress > 0.7 {
        biases.push(Bias::Emotional);
    }

    if agent.morale < -0.3 {
        biases.push(Bias::Cynical);
    }

    if p.empathy > 0.5 && p.curiosity > 0.4 {
        biases.push(Bias::Idealistic);
    }

    if biases.is_empty() {
        biases.push(Bias::Pragmatic);
    }
    biases
}

/// Interprets `event` by pulling its causal predecessors from the graph
/// (one hop back) and tagging it with the agent's current biases.
pub async fn interpret(causal_graph: &CausalGraph, event: &Event, agent: &AgentState) -> Interpretation {
    let causal_predecessors = causal_graph.causes_of(&event.id).await;

    Interpretation {
        event_id: event.id.clone(),
        causal_predecessors,
        biases: active_biases(agent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PersonalityTraits;

    #[test]
    fn high_optimism_yields_optimistic_bias() {
        let mut agent = AgentState::new("a1", "faction");
        agent.personality = PersonalityTraits {
            optimism: 0.9,
            ..Default::default()
        };
        assert!(active_biases(&agent).contains(&Bias::Optimistic));
    }

    #[test]
    fn no_strong_traits_falls_back_to_pragmatic() {
        let agent = AgentState::new("a1", "faction");
        assert_eq!(active_biases(&agent), vec![Bias::Pragmatic]);
    }
}
