//! Dialogue Manager (C10).
//!
//! Stateful two-agent (or small-group) conversations, grounded on the
//! source's `dialogue_manager.py` `DialogueManager`: LLM mode builds a
//! contextual prompt, submits it to the Broker, and parses a
//! transcript plus `**Outcome:**` / `**Relationship Impact:**` lines
//! back out; fast mode skips the Broker entirely and returns a canned
//! outcome keyed by [`CommunicationType`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::broker::{Broker, LlmRequest};
use crate::error::DialogueError;
use crate::types::{AgentId, Priority};

pub type DialogueId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationType {
    Dialogue,
    Negotiation,
    Collaboration,
    InformationSharing,
    Emotional,
    Strategic,
}

impl CommunicationType {
    /// The source's exact canned strings — reproduced verbatim since
    /// nothing else specifies wording for fast mode.
    fn canned_outcome(self) -> &'static str {
        match self {
            CommunicationType::Dialogue => "Had a constructive conversation",
            CommunicationType::Negotiation => "Reached a tentative agreement",
            CommunicationType::Collaboration => "Agreed to work together",
            CommunicationType::InformationSharing => "Exchanged valuable information",
            CommunicationType::Emotional => "Shared emotional support",
            CommunicationType::Strategic => "Discussed strategic options",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Default)]
pub struct DialogueContext {
    pub urgent: bool,
    pub conflict: bool,
}

#[derive(Debug, Clone)]
pub struct Dialogue {
    pub id: DialogueId,
    pub communication_type: CommunicationType,
    pub participants: Vec<AgentId>,
    pub initiator: AgentId,
    pub state: DialogueState,
    pub transcript: Vec<String>,
    pub outcome: Option<String>,
    pub relationship_impact: Option<String>,
    pub exchanges: u32,
    pub quality_score: Option<f64>,
}

const OUTCOME_PREFIX: &str = "**Outcome:**";
const IMPACT_PREFIX: &str = "**Relationship Impact:**";

struct Inner {
    active: HashMap<DialogueId, Dialogue>,
    history: VecDeque<Dialogue>,
}

pub struct DialogueManager {
    broker: std::sync::Arc<Broker>,
    history_cap: usize,
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl DialogueManager {
    pub fn new(broker: std::sync::Arc<Broker>, history_cap: usize) -> Self {
        DialogueManager {
            broker,
            history_cap,
            seq: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    pub async fn start(
        &self,
        initiator: impl Into<AgentId>,
        participants: Vec<AgentId>,
        communication_type: CommunicationType,
    ) -> DialogueId {
        let initiator = initiator.into();
        let id = format!("dialogue_{}", self.seq.fetch_add(1, Ordering::SeqCst));
        let dialogue = Dialogue {
            id: id.clone(),
            communication_type,
            participants,
            initiator,
            state: DialogueState::Active,
            transcript: Vec::new(),
            outcome: None,
            relationship_impact: None,
            exchanges: 0,
            quality_score: None,
        };
        self.inner.lock().await.active.insert(id.clone(), dialogue);
        id
    }

    /// Advances `id` by one exchange. Runs LLM mode unless
    /// `force_fast` is set, `remaining_turn_time` is under 1s, or
    /// `remaining_cost_budget` is under $0.02 (`spec.md §4.10`).
    pub async fn advance(
        &self,
        id: &str,
        context: &DialogueContext,
        remaining_turn_time: Duration,
        remaining_cost_budget: f64,
        force_fast: bool,
    ) -> Result<(), DialogueError> {
        let fast = force_fast || remaining_turn_time < Duration::from_secs(1) || remaining_cost_budget < 0.02;

        if fast {
            self.advance_fast(id).await
        } else {
            self.advance_llm(id, context).await
        }
    }

    async fn advance_fast(&self, id: &str) -> Result<(), DialogueError> {
        let mut inner = self.inner.lock().await;
        let dialogue = inner.active.get_mut(id).ok_or_else(|| DialogueError::NotFound(id.to_string()))?;
        dialogue.transcript.push(dialogue.communication_type.canned_outcome().to_string());
        dialogue.outcome = Some(dialogue.communication_type.canned_outcome().to_string());
        dialogue.exchanges += 1;
        dialogue.state = DialogueState::Completed;
        dialogue.quality_score = Some(score_quality(dialogue));
        debug!("dialogue {id} concluded via fast mode");
        self.retire(&mut inner, id);
        Ok(())
    }

    async fn advance_llm(&self, id: &str, context: &DialogueContext) -> Result<(), DialogueError> {
        let (prompt, priority) = {
            let inner = self.inner.lock().await;
            let dialogue = inner.active.get(id).ok_or_else(|| DialogueError::NotFound(id.to_string()))?;
            (build_dialogue_prompt(dialogue), dialogue_priority(dialogue.communication_type, context))
        };

        let response = self
            .broker
            .submit(LlmRequest::new("dialogue_turn", prompt, priority))
            .await;

        let mut inner = self.inner.lock().await;
        let dialogue = inner.active.get_mut(id).ok_or_else(|| DialogueError::NotFound(id.to_string()))?;

        match response {
            Ok(response) => {
                apply_llm_result(dialogue, &response.content);
                dialogue.exchanges += 1;
                if dialogue.outcome.is_some() {
                    dialogue.state = DialogueState::Completed;
                    dialogue.quality_score = Some(score_quality(dialogue));
                }
            }
            Err(e) => {
                warn!("dialogue {id} LLM turn failed, falling back to fast mode: {e}");
                dialogue.transcript.push(dialogue.communication_type.canned_outcome().to_string());
                dialogue.outcome = Some(dialogue.communication_type.canned_outcome().to_string());
                dialogue.exchanges += 1;
                dialogue.state = DialogueState::Completed;
                dialogue.quality_score = Some(score_quality(dialogue));
            }
        }

        if dialogue.state == DialogueState::Completed {
            self.retire(&mut inner, id);
        }
        Ok(())
    }

    fn retire(&self, inner: &mut Inner, id: &str) {
        if let Some(dialogue) = inner.active.remove(id) {
            inner.history.push_back(dialogue);
            while inner.history.len() > self.history_cap {
                inner.history.pop_front();
            }
        }
    }

    /// Force-completes every still-active dialogue in fast mode before
    /// returning, so a `Runtime` shutdown never leaves a dialogue
    /// dangling mid-conversation.
    pub async fn shutdown(&self) {
        let ids: Vec<DialogueId> = self.inner.lock().await.active.keys().cloned().collect();
        for id in ids {
            let _ = self.advance_fast(&id).await;
        }
    }

    pub async fn get(&self, id: &str) -> Option<Dialogue> {
        let inner = self.inner.lock().await;
        inner.active.get(id).or_else(|| inner.history.iter().find(|d| d.id == id)).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }
}

/// `Negotiation`/`Strategic` types, or a context flagged `urgent`/
/// `conflict`, get `High` priority; everything else gets `Normal` —
/// the source's `_determine_dialogue_priority`.
fn dialogue_priority(kind: CommunicationType, context: &DialogueContext) -> Priority {
    if matches!(kind, CommunicationType::Negotiation | CommunicationType::Strategic)
        || context.urgent
        || context.conflict
    {
        Priority::High
    } else {
        Priority::Normal
    }
}

fn build_dialogue_prompt(dialogue: &Dialogue) -> String {
    let mut prompt = format!(
        "Continue a {:?} between {} (participants: {:?}).\n",
        dialogue.communication_type, dialogue.initiator, dialogue.participants
    );
    if !dialogue.transcript.is_empty() {
        prompt.push_str("Transcript so far:\n");
        for line in &dialogue.transcript {
            prompt.push_str(&format!("{line}\n"));
        }
    }
    prompt.push_str(
        "\nWrite the next exchange. If the conversation concludes, end with a line \
         \"**Outcome:** <summary>\" and, if relationships changed, a line \
         \"**Relationship Impact:** <summary>\".\n",
    );
    prompt
}

/// Line-scan for the two labeled prefixes; every other non-empty line
/// mentioning a participant's id becomes a transcript line — matching
/// the source's `_process_llm_dialogue_result`.
fn apply_llm_result(dialogue: &mut Dialogue, content: &str) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(outcome) = line.strip_prefix(OUTCOME_PREFIX) {
            dialogue.outcome = Some(outcome.trim().to_string());
        } else if let Some(impact) = line.strip_prefix(IMPACT_PREFIX) {
            dialogue.relationship_impact = Some(impact.trim().to_string());
        } else if dialogue.participants.iter().any(|p| line.contains(p.as_str())) || line.contains(dialogue.initiator.as_str())
        {
            dialogue.transcript.push(line.to_string());
        }
    }
}

/// Base `0.5`, `+0.1` each for content length > 200 chars, a
/// non-trivial outcome (> 20 chars), any relationship-impact text, and
/// `>= 2` exchanges.
fn score_quality(dialogue: &Dialogue) -> f64 {
    let mut score = 0.5;
    let content_len: usize = dialogue.transcript.iter().map(|l| l.len()).sum();
    if content_len > 200 {
        score += 0.1;
    }
    if dialogue.outcome.as_ref().is_some_and(|o| o.len() > 20) {
        score += 0.1;
    }
    if dialogue.relationship_impact.is_some() {
        score += 0.1;
    }
    if dialogue.exchanges >= 2 {
        score += 0.1;
    }
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CostBudget;
    use crate::cache::ResponseCache;
    use crate::clients::mock::MockProvider;
    use std::sync::Arc;

    async fn manager(response: &str) -> DialogueManager {
        let budget = Arc::new(CostBudget::new(10.0, 100.0, 1000));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
        let (broker, wake_rx) = Broker::new(
            budget,
            cache,
            Arc::new(MockProvider::new(response)),
            0.001,
            5,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        broker.clone().spawn(wake_rx);
        DialogueManager::new(broker, 100)
    }

    #[tokio::test]
    async fn fast_mode_uses_canned_outcome() {
        let manager = manager("unused").await;
        let id = manager
            .start("alice", vec!["bob".to_string()], CommunicationType::Negotiation)
            .await;
        manager
            .advance(&id, &DialogueContext::default(), Duration::from_secs(5), 1.0, true)
            .await
            .unwrap();
        let dialogue = manager.get(&id).await.unwrap();
        assert_eq!(dialogue.outcome.as_deref(), Some("Reached a tentative agreement"));
        assert_eq!(dialogue.state, DialogueState::Completed);
    }

    #[tokio::test]
    async fn low_time_budget_forces_fast_mode_even_without_force_flag() {
        let manager = manager("unused").await;
        let id = manager
            .start("alice", vec!["bob".to_string()], CommunicationType::Dialogue)
            .await;
        manager
            .advance(&id, &DialogueContext::default(), Duration::from_millis(10), 1.0, false)
            .await
            .unwrap();
        let dialogue = manager.get(&id).await.unwrap();
        assert_eq!(dialogue.outcome.as_deref(), Some("Had a constructive conversation"));
    }

    #[tokio::test]
    async fn llm_mode_parses_outcome_and_impact_lines() {
        let manager = manager(
            "bob: Let's trade supplies.\n**Outcome:** Reached a tentative agreement\n**Relationship Impact:** Trust improved",
        )
        .await;
        let id = manager
            .start("alice", vec!["bob".to_string()], CommunicationType::Dialogue)
            .await;
        manager
            .advance(&id, &DialogueContext::default(), Duration::from_secs(5), 1.0, false)
            .await
            .unwrap();
        let dialogue = manager.get(&id).await.unwrap();
        assert_eq!(dialogue.outcome.as_deref(), Some("Reached a tentative agreement"));
        assert_eq!(dialogue.relationship_impact.as_deref(), Some("Trust improved"));
        assert!(dialogue.transcript.iter().any(|l| l.contains("bob")));
    }

    #[test]
    fn negotiation_and_strategic_get_high_priority() {
        let context = DialogueContext::default();
        assert_eq!(dialogue_priority(CommunicationType::Negotiation, &context), Priority::High);
        assert_eq!(dialogue_priority(CommunicationType::Strategic, &context), Priority::High);
        assert_eq!(dialogue_priority(CommunicationType::Dialogue, &context), Priority::Normal);
    }

    #[test]
    fn urgent_context_escalates_any_type() {
        let context = DialogueContext {
            urgent: true,
            conflict: false,
        };
        assert_eq!(dialogue_priority(CommunicationType::Dialogue, &context), Priority::High);
    }
}
