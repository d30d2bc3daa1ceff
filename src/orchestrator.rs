//! Turn Orchestrator (C11).
//!
//! Runs one simulation turn: budget reset, world-state snapshot,
//! dialogue-opportunity pairing, one decision-pipeline pass per agent,
//! and a post-turn metrics/summary pass. One `tokio::task::JoinSet` per
//! turn, one task per agent, joined before the turn concludes — a
//! panicking or erroring agent task is caught and recorded as a
//! per-agent failure rather than propagated, so one bad agent never
//! sinks the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::dialogue::{CommunicationType, DialogueContext, DialogueManager};
use crate::pipeline::actions::CandidateAction;
use crate::pipeline::threat::ThreatInputs;
use crate::pipeline::{Decision, DecisionPipeline};
use crate::types::{AgentId, AgentState, Event};

/// Everything the orchestrator needs to run one agent through the
/// decision pipeline for a turn — supplied by the host, since only it
/// knows what happened in the world since the agent's last turn.
pub struct AgentTurnInput {
    pub agent: AgentState,
    pub recent_events: Vec<Event>,
    pub threat_inputs: ThreatInputs,
    pub candidates: Vec<CandidateAction>,
}

#[derive(Debug, Clone)]
pub struct AgentTurnResult {
    pub agent_id: AgentId,
    pub decision: Option<Decision>,
    pub error: Option<String>,
}

/// Snapshot the orchestrator builds before running agents, mirroring
/// the source's `EnhancedWorldState`.
#[derive(Debug, Clone)]
pub struct WorldState {
    pub turn_number: u64,
    pub positions: HashMap<AgentId, Option<String>>,
    pub active_dialogues: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnMetrics {
    pub dialogues_attempted: usize,
    pub successful_dialogues: usize,
    pub coordination_effectiveness: f64,
    pub average_dialogue_quality: f64,
}

pub struct TurnResult {
    pub turn_number: u64,
    pub world_state: WorldState,
    pub agent_results: Vec<AgentTurnResult>,
    pub metrics: TurnMetrics,
    pub summary: String,
    pub elapsed: Duration,
}

struct PerfHistory {
    recent: std::collections::VecDeque<Duration>,
}

const PERF_HISTORY_CAP: usize = 10;
const PERF_TREND_WINDOW: usize = 5;

impl PerfHistory {
    fn new() -> Self {
        PerfHistory {
            recent: std::collections::VecDeque::new(),
        }
    }

    fn record(&mut self, duration: Duration) {
        if self.recent.len() >= PERF_HISTORY_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
    }

    /// `improving`/`degrading`/`stable` by comparing the last
    /// `PERF_TREND_WINDOW` turns against the `PERF_TREND_WINDOW`
    /// before that, mirroring the source's rolling trend classifier.
    fn trend(&self) -> &'static str {
        if self.recent.len() < PERF_TREND_WINDOW * 2 {
            return "stable";
        }
        let samples: Vec<Duration> = self.recent.iter().cloned().collect();
        let n = samples.len();
        let recent_avg = avg(&samples[n - PERF_TREND_WINDOW..]);
        let prior_avg = avg(&samples[n - 2 * PERF_TREND_WINDOW..n - PERF_TREND_WINDOW]);
        if recent_avg < prior_avg * 0.9 {
            "improving"
        } else if recent_avg > prior_avg * 1.1 {
            "degrading"
        } else {
            "stable"
        }
    }
}

fn avg(samples: &[Duration]) -> f64 {
    samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64
}

/// Reserves a safety buffer so the orchestrator stops requesting
/// LLM-backed dialogue rounds before it actually runs out of turn
/// time, mirroring the source's `PerformanceBudget`.
const TURN_TIME_SAFETY_BUFFER: Duration = Duration::from_millis(500);

pub struct TurnOrchestrator {
    pipeline: Arc<DecisionPipeline>,
    dialogue_manager: Arc<DialogueManager>,
    budget: Arc<crate::budget::CostBudget>,
    max_turn_time: Duration,
    fast_mode_threshold: Duration,
    turn_number: std::sync::atomic::AtomicU64,
    perf: tokio::sync::Mutex<PerfHistory>,
}

impl TurnOrchestrator {
    pub fn new(
        pipeline: Arc<DecisionPipeline>,
        dialogue_manager: Arc<DialogueManager>,
        budget: Arc<crate::budget::CostBudget>,
        max_turn_time: Duration,
        fast_mode_threshold: Duration,
    ) -> Self {
        TurnOrchestrator {
            pipeline,
            dialogue_manager,
            budget,
            max_turn_time,
            fast_mode_threshold,
            turn_number: std::sync::atomic::AtomicU64::new(0),
            perf: tokio::sync::Mutex::new(PerfHistory::new()),
        }
    }

    /// Runs one full turn end to end per `spec.md §4.11`'s eight-step
    /// sequence.
    pub async fn run_turn(&self, mut agents: Vec<AgentTurnInput>) -> TurnResult {
        let turn_start = Instant::now();
        self.budget.start_turn().await;
        let turn_number = self.turn_number.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;

        info!(
            "turn {turn_number} starting with {} active agent(s)",
            agents.iter().filter(|a| a.agent.status == crate::types::AgentStatus::Active).count()
        );

        let world_state = WorldState {
            turn_number,
            positions: agents.iter().map(|a| (a.agent.id.clone(), a.agent.location.clone())).collect(),
            active_dialogues: Vec::new(),
        };

        let (dialogue_metrics, world_state) = self.run_dialogue_opportunities(&agents, world_state, turn_start).await;

        let agent_results = self.run_agent_pipelines(std::mem::take(&mut agents)).await;

        let elapsed = turn_start.elapsed();
        {
            let mut perf = self.perf.lock().await;
            perf.record(elapsed);
        }

        let failed = agent_results.iter().filter(|r| r.error.is_some()).count();
        let summary = format!(
            "turn {turn_number}: {} agent(s) decided, {} failed, {} dialogue(s) attempted ({} successful), \
             perf trend {}",
            agent_results.len(),
            failed,
            dialogue_metrics.dialogues_attempted,
            dialogue_metrics.successful_dialogues,
            self.perf.lock().await.trend(),
        );
        info!("{summary}");

        TurnResult {
            turn_number,
            world_state,
            agent_results,
            metrics: dialogue_metrics,
            summary,
            elapsed,
        }
    }

    /// Pairs the first two available agents, two at a time, capped at
    /// 2 pairs per turn — the source's "pair the first two available"
    /// heuristic, explicitly sanctioned by `spec.md §9`'s open
    /// question on dialogue-opportunity selection.
    async fn run_dialogue_opportunities(
        &self,
        agents: &[AgentTurnInput],
        mut world_state: WorldState,
        turn_start: Instant,
    ) -> (TurnMetrics, WorldState) {
        let available: Vec<AgentId> = agents
            .iter()
            .filter(|a| a.agent.status == crate::types::AgentStatus::Active)
            .map(|a| a.agent.id.clone())
            .collect();

        let mut pairs = Vec::new();
        let mut iter = available.into_iter();
        while pairs.len() < 2 {
            let (Some(a), Some(b)) = (iter.next(), iter.next()) else {
                break;
            };
            pairs.push((a, b));
        }

        let mut metrics = TurnMetrics::default();
        let mut quality_sum = 0.0;
        let mut quality_count = 0;

        for (initiator, target) in pairs {
            metrics.dialogues_attempted += 1;
            let id = self
                .dialogue_manager
                .start(initiator.clone(), vec![target], CommunicationType::Dialogue)
                .await;
            world_state.active_dialogues.push(id.clone());

            let remaining_time = self.remaining_time(turn_start);
            let force_fast = remaining_time < self.fast_mode_threshold;
            let budget_snapshot = self.budget.snapshot().await;

            if self
                .dialogue_manager
                .advance(
                    &id,
                    &DialogueContext::default(),
                    remaining_time,
                    budget_snapshot.remaining_turn_budget,
                    force_fast,
                )
                .await
                .is_ok()
            {
                if let Some(dialogue) = self.dialogue_manager.get(&id).await {
                    if let Some(quality) = dialogue.quality_score {
                        metrics.successful_dialogues += 1;
                        quality_sum += quality;
                        quality_count += 1;
                    }
                }
            }
        }

        metrics.coordination_effectiveness = metrics.successful_dialogues as f64 / (agents.len().max(1) as f64);
        metrics.average_dialogue_quality = if quality_count > 0 { quality_sum / quality_count as f64 } else { 0.0 };
        (metrics, world_state)
    }

    /// One `tokio::spawn` per agent, joined via a `JoinSet`. A
    /// `JoinError` (panic) or a pipeline error is attributed to that
    /// agent and recorded; every other agent's result is unaffected.
    async fn run_agent_pipelines(&self, agents: Vec<AgentTurnInput>) -> Vec<AgentTurnResult> {
        let mut set: JoinSet<AgentTurnResult> = JoinSet::new();

        for input in agents {
            let pipeline = self.pipeline.clone();
            set.spawn(async move {
                let agent_id = input.agent.id.clone();
                let decision = pipeline
                    .decide(
                        &input.agent,
                        &input.recent_events,
                        &input.threat_inputs,
                        &input.candidates,
                        1.0,
                    )
                    .await;
                AgentTurnResult {
                    agent_id,
                    decision: Some(decision),
                    error: None,
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    error!("an agent pipeline task panicked: {join_error}");
                    results.push(AgentTurnResult {
                        agent_id: "unknown".to_string(),
                        decision: None,
                        error: Some(join_error.to_string()),
                    });
                }
            }
        }
        results
    }

    fn remaining_time(&self, turn_start: Instant) -> Duration {
        let elapsed = turn_start.elapsed();
        let remaining = self.max_turn_time.saturating_sub(elapsed);
        remaining.saturating_sub(TURN_TIME_SAFETY_BUFFER)
    }

    /// Whether a batch of `estimated` cost could still be requested
    /// this turn without blowing the safety buffer — gates whether to
    /// attempt one more LLM-backed round before forcing fast mode.
    pub async fn is_batch_budget_available(&self, estimated_cost: f64, turn_start: Instant) -> bool {
        if self.remaining_time(turn_start) == Duration::ZERO {
            warn!("turn time safety buffer exhausted, denying further LLM batches this turn");
            return false;
        }
        self.budget.allows(estimated_cost).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CostBudget;
    use crate::cache::ResponseCache;
    use crate::causal_graph::CausalGraph;
    use crate::clients::mock::MockProvider;
    use crate::pipeline::actions::ActionCategory;
    use crate::types::AgentState;

    fn candidate(id: &str) -> CandidateAction {
        CandidateAction {
            id: id.to_string(),
            category: ActionCategory::Social,
            criteria_scores: [0.5; 8],
        }
    }

    async fn orchestrator() -> TurnOrchestrator {
        let causal_graph = Arc::new(CausalGraph::new());
        let budget = Arc::new(CostBudget::new(10.0, 100.0, 1000));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
        let (broker, wake_rx) = crate::broker::Broker::new(
            budget.clone(),
            cache,
            Arc::new(MockProvider::new("**Response 1:** a story unfolds")),
            0.001,
            5,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        broker.clone().spawn(wake_rx);
        let pipeline = Arc::new(DecisionPipeline::new(causal_graph, broker.clone(), 7));
        let dialogue_manager = Arc::new(DialogueManager::new(broker, 100));
        TurnOrchestrator::new(pipeline, dialogue_manager, budget, Duration::from_secs(5), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn turn_survives_a_mix_of_agents_and_reports_all_of_them() {
        let orchestrator = orchestrator().await;
        let agents = vec![
            AgentTurnInput {
                agent: AgentState::new("a1", "faction"),
                recent_events: Vec::new(),
                threat_inputs: ThreatInputs::default(),
                candidates: vec![candidate("wait_here"), candidate("move_on")],
            },
            AgentTurnInput {
                agent: AgentState::new("a2", "faction"),
                recent_events: Vec::new(),
                threat_inputs: ThreatInputs::default(),
                candidates: vec![candidate("wait_here")],
            },
        ];
        let result = orchestrator.run_turn(agents).await;
        assert_eq!(result.agent_results.len(), 2);
        assert!(result.agent_results.iter().all(|r| r.error.is_none()));
    }

    #[tokio::test]
    async fn dialogue_opportunities_cap_at_two_pairs() {
        let orchestrator = orchestrator().await;
        let agents: Vec<AgentTurnInput> = (0..10)
            .map(|i| AgentTurnInput {
                agent: AgentState::new(format!("a{i}"), "faction"),
                recent_events: Vec::new(),
                threat_inputs: ThreatInputs::default(),
                candidates: vec![candidate("wait_here")],
            })
            .collect();
        let result = orchestrator.run_turn(agents).await;
        assert_eq!(result.metrics.dialogues_attempted, 2);
    }
}
