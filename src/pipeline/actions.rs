//! Action evaluation and selection (pipeline stages 4-5).
//!
//! Grounded on the source's `decision_processor.py`
//! `ActionCategory`/criteria-scoring shape: each candidate action is
//! scored against the same eight criteria the agent's
//! [`DecisionWeights`] are defined over, then dot-producted with those
//! weights.

use rand::Rng;

use crate::pipeline::threat::ThreatLevel;
use crate::types::DecisionWeights;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCategory {
    Combat,
    Social,
    Exploration,
    Resource,
    Survival,
    Tactical,
    Diplomatic,
}

#[derive(Debug, Clone)]
pub struct CandidateAction {
    pub id: String,
    pub category: ActionCategory,
    /// One score per criterion, in the same order as
    /// [`DecisionWeights::as_array`]: self_preservation, faction_loyalty,
    /// personal_relationships, mission_success, moral_principles,
    /// resource_acquisition, knowledge_seeking, status_advancement.
    pub criteria_scores: [f64; 8],
}

/// `time_pressure` is `1.0` with no urgency, rising toward `1.5` as a
/// turn's remaining time shrinks — actions become more attractive when
/// time is short if they already scored well, matching the source's
/// "act now" pressure.
pub fn evaluate_action(action: &CandidateAction, weights: &DecisionWeights, threat: ThreatLevel, time_pressure: f64) -> f64 {
    let weight_vector = weights.as_array();
    let dot: f64 = action
        .criteria_scores
        .iter()
        .zip(weight_vector.iter())
        .map(|(score, weight)| score * weight)
        .sum();
    dot * threat.action_modifier() * time_pressure
}

/// Scores every candidate, then picks the top-scoring one; if two or
/// more candidates sit within 15% of the top score, chooses uniformly
/// at random among them using the pipeline's seeded RNG (Testable
/// Property 8: replay with the same seed reproduces the same pick).
pub fn select_action<'a, R: Rng>(
    candidates: &'a [CandidateAction],
    weights: &DecisionWeights,
    threat: ThreatLevel,
    time_pressure: f64,
    rng: &mut R,
) -> Option<&'a CandidateAction> {
    if candidates.is_empty() {
        return None;
    }
    let mut scored: Vec<(&CandidateAction, f64)> = candidates
        .iter()
        .map(|action| (action, evaluate_action(action, weights, threat, time_pressure)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let top_score = scored[0].1;
    let window = top_score.abs() * 0.15;
    let tied: Vec<&CandidateAction> = scored
        .iter()
        .take_while(|(_, score)| top_score - score >= 0.0 && top_score - score <= window)
        .map(|(action, _)| *action)
        .collect();

    if tied.len() <= 1 {
        Some(scored[0].0)
    } else {
        let index = rng.gen_range(0..tied.len());
        Some(tied[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn action(id: &str, scores: [f64; 8]) -> CandidateAction {
        CandidateAction {
            id: id.to_string(),
            category: ActionCategory::Tactical,
            criteria_scores: scores,
        }
    }

    #[test]
    fn selects_top_scoring_action_when_not_tied() {
        let weights = DecisionWeights::default();
        let candidates = vec![
            action("strong", [1.0; 8]),
            action("weak", [0.0; 8]),
        ];
        let mut rng = rand::rngs::SmallRng::seed_from_u64(1);
        let chosen = select_action(&candidates, &weights, ThreatLevel::Negligible, 1.0, &mut rng).unwrap();
        assert_eq!(chosen.id, "strong");
    }

    #[test]
    fn same_seed_reproduces_the_same_tie_break() {
        let weights = DecisionWeights::default();
        let candidates = vec![action("a", [0.5; 8]), action("b", [0.5; 8])];
        let mut rng_a = rand::rngs::SmallRng::seed_from_u64(7);
        let mut rng_b = rand::rngs::SmallRng::seed_from_u64(7);
        let first = select_action(&candidates, &weights, ThreatLevel::Negligible, 1.0, &mut rng_a).unwrap();
        let second = select_action(&candidates, &weights, ThreatLevel::Negligible, 1.0, &mut rng_b).unwrap();
        assert_eq!(first.id, second.id);
    }
}
