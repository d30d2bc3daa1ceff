//! Agent Decision Pipeline (C7) — the largest component.
//!
//! A pure per-turn function of `(world_state, agent_context) -> action`,
//! split across a small submodule tree the same way the `clients/`
//! directory splits out a multi-file concern: `interpret` (stage 1),
//! `threat` (stage 2), `goals` (stage 3), `actions` (stages 4-5),
//! `validator` (stage 6).

pub mod actions;
pub mod goals;
pub mod interpret;
pub mod threat;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::Mutex;

use crate::broker::{Broker, LlmRequest};
use crate::causal_graph::CausalGraph;
use crate::pipeline::actions::{select_action, CandidateAction};
use crate::pipeline::interpret::{interpret, Interpretation};
use crate::pipeline::threat::{assess_threat, ThreatInputs};
use crate::pipeline::validator::{validate, ValidationOutcome};
use crate::types::{AgentState, Event, Priority};

/// The result of one pipeline run: the chosen action's id, the
/// validation outcome it passed through (always `Ok` in practice, since
/// a `Critical` outcome is replaced with a wait action before this
/// struct is built), and the stage 1/3 byproducts a caller can use for
/// narration or an audit trail without re-running the pipeline.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action_id: String,
    pub validation: ValidationOutcome,
    pub interpretations: Vec<Interpretation>,
    /// Goal ids in priority order, per stage 3's scoring.
    pub ranked_goal_ids: Vec<String>,
}

impl Decision {
    pub fn wait() -> Self {
        Decision {
            action_id: "wait".to_string(),
            validation: ValidationOutcome::Ok,
            interpretations: Vec::new(),
            ranked_goal_ids: Vec::new(),
        }
    }
}

/// One pipeline per `Runtime`, shared by every agent's turn (the RNG is
/// the only mutable state it owns; everything else is borrowed per
/// call).
pub struct DecisionPipeline {
    causal_graph: Arc<CausalGraph>,
    broker: Arc<Broker>,
    rng: Mutex<SmallRng>,
}

impl DecisionPipeline {
    pub fn new(causal_graph: Arc<CausalGraph>, broker: Arc<Broker>, rng_seed: u64) -> Self {
        DecisionPipeline {
            causal_graph,
            broker,
            rng: Mutex::new(SmallRng::seed_from_u64(rng_seed)),
        }
    }

    /// Runs all six stages in order. `recent_events` drives stage 1,
    /// `threat_inputs` stage 2, `agent.active_goals` stage 3, and
    /// `candidates` stages 4-5.
    pub async fn decide(
        &self,
        agent: &AgentState,
        recent_events: &[Event],
        threat_inputs: &ThreatInputs,
        candidates: &[CandidateAction],
        time_pressure: f64,
    ) -> Decision {
        let mut interpretations = Vec::with_capacity(recent_events.len());
        for event in recent_events {
            interpretations.push(interpret(&self.causal_graph, event, agent).await);
        }

        let threat = assess_threat(threat_inputs, agent);
        let ranked_goals = goals::prioritize_goals(&agent.active_goals);

        let chosen = {
            let mut rng = self.rng.lock().await;
            select_action(candidates, &agent.decision_weights, threat, time_pressure, &mut *rng).cloned()
        };

        let Some(chosen) = chosen else {
            return Decision::wait();
        };

        let ranked_goal_ids = ranked_goals.iter().map(|g| g.id.clone()).collect();

        match validate(&chosen, agent) {
            ValidationOutcome::Critical(_) => Decision::wait(),
            outcome => Decision {
                action_id: chosen.id,
                validation: outcome,
                interpretations,
                ranked_goal_ids,
            },
        }
    }

    /// Asks the broker for a linguistic elaboration of the chosen
    /// action (narration, dialogue line, etc), formatted with the
    /// character context block `spec.md §4.7` describes: identity,
    /// faction, salient personality traits (deviating > 0.2 from
    /// neutral), current state, and at most three goals.
    pub async fn narrate_action(
        &self,
        agent: &AgentState,
        action_id: &str,
    ) -> Result<String, crate::error::BrokerError> {
        let prompt = build_character_prompt(agent, action_id);
        let response = self
            .broker
            .submit(LlmRequest::new("pipeline_narration", prompt, Priority::Normal))
            .await?;
        Ok(response.content)
    }
}

fn build_character_prompt(agent: &AgentState, action_id: &str) -> String {
    let mut prompt = format!("Character: {} ({})\n", agent.id, agent.faction);

    let traits = [
        ("optimism", agent.personality.optimism),
        ("caution", agent.personality.caution),
        ("aggression", agent.personality.aggression),
        ("empathy", agent.personality.empathy),
        ("curiosity", agent.personality.curiosity),
        ("discipline", agent.personality.discipline),
    ];
    let salient: Vec<String> = traits
        .iter()
        .filter(|(_, value)| value.abs() > 0.2)
        .map(|(name, value)| format!("{name}={value:.2}"))
        .collect();
    if !salient.is_empty() {
        prompt.push_str(&format!("Personality: {}\n", salient.join(", ")));
    }

    prompt.push_str(&format!(
        "Status: {:?}, health {:?}, morale {:.2}\n",
        agent.status, agent.health, agent.morale
    ));

    let top_goals: Vec<&str> = goals::prioritize_goals(&agent.active_goals)
        .into_iter()
        .take(3)
        .map(|g| g.description.as_str())
        .collect();
    if !top_goals.is_empty() {
        prompt.push_str(&format!("Goals: {}\n", top_goals.join("; ")));
    }

    prompt.push_str(&format!("Narrate taking the action: {action_id}\n"));
    prompt
}

pub fn default_batch_timeout() -> Duration {
    Duration::from_millis(150)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CostBudget;
    use crate::cache::ResponseCache;
    use crate::clients::mock::MockProvider;
    use crate::pipeline::actions::ActionCategory;
    use crate::types::Goal;

    fn candidate(id: &str) -> CandidateAction {
        CandidateAction {
            id: id.to_string(),
            category: ActionCategory::Social,
            criteria_scores: [0.5; 8],
        }
    }

    async fn pipeline() -> DecisionPipeline {
        let causal_graph = Arc::new(CausalGraph::new());
        let budget = Arc::new(CostBudget::new(10.0, 100.0, 1000));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
        let (broker, wake_rx) = Broker::new(
            budget,
            cache,
            Arc::new(MockProvider::new("**Response 1:** a story unfolds")),
            0.001,
            5,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        broker.clone().spawn(wake_rx);
        DecisionPipeline::new(causal_graph, broker, 42)
    }

    #[tokio::test]
    async fn decide_picks_a_candidate_and_validates_it() {
        let pipeline = pipeline().await;
        let mut agent = AgentState::new("a1", "faction");
        agent.active_goals.push(Goal {
            id: "g1".to_string(),
            description: "survive".to_string(),
            urgency: 0.9,
            importance: 0.9,
            feasibility: 0.9,
            alignment: 0.9,
            opportunity: 0.9,
        });
        let decision = pipeline
            .decide(
                &agent,
                &[],
                &ThreatInputs::default(),
                &[candidate("wait_here"), candidate("move_on")],
                1.0,
            )
            .await;
        assert_eq!(decision.validation, ValidationOutcome::Ok);
        assert_eq!(decision.ranked_goal_ids, vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn recent_events_are_interpreted_and_attached_to_the_decision() {
        let pipeline = pipeline().await;
        let agent = AgentState::new("a1", "faction");
        let event = Event::new("skirmish", None);
        let decision = pipeline
            .decide(
                &agent,
                std::slice::from_ref(&event),
                &ThreatInputs::default(),
                &[candidate("wait_here")],
                1.0,
            )
            .await;
        assert_eq!(decision.interpretations.len(), 1);
        assert_eq!(decision.interpretations[0].event_id, event.id);
    }

    #[tokio::test]
    async fn dead_agent_always_waits() {
        let pipeline = pipeline().await;
        let mut agent = AgentState::new("a1", "faction");
        agent.status = crate::types::AgentStatus::Dead;
        let decision = pipeline
            .decide(&agent, &[], &ThreatInputs::default(), &[candidate("move_on")], 1.0)
            .await;
        assert_eq!(decision.action_id, "wait");
    }
}
