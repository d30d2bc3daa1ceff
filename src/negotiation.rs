//! Negotiation Engine (C8).
//!
//! Multi-round proposal/response sessions between agents, grounded on
//! the source's `negotiation.py` `AgentNegotiationEngine`: an
//! in-progress session accumulates proposals and responses until every
//! targeted agent has answered the latest proposal, at which point
//! [`NegotiationEngine::evaluate`] decides whether the session
//! resolves, fails, promotes a counter-proposal, or asks the Broker to
//! mediate a compromise.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::broker::{Broker, LlmRequest};
use crate::error::NegotiationError;
use crate::types::{AgentId, Priority};

pub type SessionId = String;
pub type ProposalId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initiated,
    InProgress,
    Deadlock,
    Resolved,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Resolved | SessionStatus::Failed | SessionStatus::Deadlock | SessionStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Accept,
    Reject,
    Counter,
    Conditional,
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposer: AgentId,
    pub content: HashMap<String, Value>,
    pub target_agents: HashSet<AgentId>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub proposal_id: ProposalId,
    pub responder: AgentId,
    pub kind: ResponseKind,
    pub content: HashMap<String, Value>,
    /// Present when `kind` is `Counter`/`Conditional`: the responder's
    /// proposed replacement content.
    pub counter_proposal: Option<HashMap<String, Value>>,
}

pub struct Session {
    pub id: SessionId,
    pub topic: String,
    pub participants: HashSet<AgentId>,
    pub status: SessionStatus,
    pub proposals: Vec<Proposal>,
    pub responses: Vec<Response>,
    pub resolution: Option<HashMap<String, Value>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub timeout: Duration,
}

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const REPUTATION_RESOLVE_DELTA: f64 = 0.1;
const REPUTATION_FAIL_DELTA: f64 = 0.05;
const DEFAULT_REPUTATION: f64 = 0.5;

struct Inner {
    active: HashMap<SessionId, Session>,
    history: VecDeque<Session>,
    reputation: HashMap<AgentId, f64>,
}

/// Multi-round proposal/response state machine, shared (via `Arc`)
/// between whatever component identifies a conflict (the Causal Graph,
/// the Orchestrator) and opens a session here.
pub struct NegotiationEngine {
    broker: Arc<Broker>,
    round_cap: u32,
    history_cap: usize,
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl NegotiationEngine {
    pub fn new(broker: Arc<Broker>, round_cap: u32, history_cap: usize) -> Self {
        NegotiationEngine {
            broker,
            round_cap,
            history_cap,
            seq: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                history: VecDeque::new(),
                reputation: HashMap::new(),
            }),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.seq.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn reputation_of(&self, agent: &str) -> f64 {
        let inner = self.inner.lock().await;
        *inner.reputation.get(agent).unwrap_or(&DEFAULT_REPUTATION)
    }

    /// Opens a session with one initial proposal, targeting every
    /// agent in `targets`. `initiator` is itself a participant even
    /// though it is not a target of its own proposal.
    pub async fn initiate(
        &self,
        initiator: impl Into<AgentId>,
        targets: Vec<AgentId>,
        topic: impl Into<String>,
        content: HashMap<String, Value>,
    ) -> SessionId {
        let initiator = initiator.into();
        let session_id = self.next_id("negotiation");
        let now = chrono::Utc::now();

        let mut participants: HashSet<AgentId> = targets.iter().cloned().collect();
        participants.insert(initiator.clone());

        let proposal = Proposal {
            id: self.next_id("proposal"),
            proposer: initiator.clone(),
            content,
            target_agents: targets.into_iter().collect(),
            expires_at: now + chrono::Duration::from_std(DEFAULT_SESSION_TIMEOUT).unwrap(),
        };

        let session = Session {
            id: session_id.clone(),
            topic: topic.into(),
            participants,
            status: SessionStatus::Initiated,
            proposals: vec![proposal],
            responses: Vec::new(),
            resolution: None,
            created_at: now,
            updated_at: now,
            timeout: DEFAULT_SESSION_TIMEOUT,
        };

        info!("negotiation {session_id} initiated by {initiator}");
        self.inner.lock().await.active.insert(session_id.clone(), session);
        session_id
    }

    /// Records a response to `proposal_id`, then re-evaluates the
    /// owning session's status. Returns the session's status after
    /// evaluation so the caller can react to a same-call resolution.
    pub async fn respond(
        &self,
        proposal_id: &str,
        responder: impl Into<AgentId>,
        kind: ResponseKind,
        content: HashMap<String, Value>,
        counter_proposal: Option<HashMap<String, Value>>,
    ) -> Result<SessionStatus, NegotiationError> {
        let responder = responder.into();
        let mut inner = self.inner.lock().await;

        let session_id = inner
            .active
            .values()
            .find(|s| s.proposals.iter().any(|p| p.id == proposal_id))
            .map(|s| s.id.clone())
            .ok_or_else(|| NegotiationError::UnknownSession(proposal_id.to_string()))?;

        {
            let session = inner.active.get(&session_id).unwrap();
            if !session.participants.contains(&responder) {
                return Err(NegotiationError::NotAParticipant(responder));
            }
            if session.status.is_terminal() {
                return Err(NegotiationError::AlreadyTerminal(session_id));
            }
        }

        {
            let session = inner.active.get_mut(&session_id).unwrap();
            session.responses.push(Response {
                id: format!("response_{}", self.seq.fetch_add(1, Ordering::SeqCst)),
                proposal_id: proposal_id.to_string(),
                responder,
                kind,
                content,
                counter_proposal,
            });
            session.updated_at = chrono::Utc::now();
            session.status = SessionStatus::InProgress;
        }

        self.evaluate_locked(&mut inner, &session_id).await;
        Ok(inner.active.get(&session_id).map(|s| s.status).unwrap_or(SessionStatus::Resolved))
    }

    /// Re-checks timeout and round cap, then — once every target of the
    /// latest proposal has responded — decides resolution, counter
    /// promotion, mediation, or failure per `spec.md §4.8`.
    async fn evaluate_locked(&self, inner: &mut Inner, session_id: &str) {
        let now = chrono::Utc::now();

        {
            let session = inner.active.get(session_id).unwrap();
            let elapsed = now.signed_duration_since(session.created_at);
            if elapsed > chrono::Duration::from_std(session.timeout).unwrap_or_default() {
                let mut session = inner.active.remove(session_id).unwrap();
                session.status = SessionStatus::Timeout;
                warn!("negotiation {session_id} timed out");
                Self::finalize(inner, session);
                return;
            }
            if session.proposals.len() as u32 > self.round_cap {
                let mut session = inner.active.remove(session_id).unwrap();
                session.status = SessionStatus::Deadlock;
                warn!("negotiation {session_id} hit round cap {}", self.round_cap);
                Self::finalize(inner, session);
                return;
            }
        }

        let latest_proposal = {
            let session = inner.active.get(session_id).unwrap();
            session.proposals.last().cloned()
        };
        let Some(latest_proposal) = latest_proposal else {
            return;
        };

        let responses: Vec<Response> = {
            let session = inner.active.get(session_id).unwrap();
            session
                .responses
                .iter()
                .filter(|r| r.proposal_id == latest_proposal.id)
                .cloned()
                .collect()
        };

        if responses.len() < latest_proposal.target_agents.len() {
            return;
        }

        let accepts = responses.iter().filter(|r| r.kind == ResponseKind::Accept).count();
        let rejects = responses.iter().filter(|r| r.kind == ResponseKind::Reject).count();
        let counters: Vec<&Response> = responses
            .iter()
            .filter(|r| matches!(r.kind, ResponseKind::Counter | ResponseKind::Conditional))
            .collect();

        if accepts == responses.len() {
            let participants = inner.active.get(session_id).unwrap().participants.clone();
            for agent in &participants {
                let entry = inner.reputation.entry(agent.clone()).or_insert(DEFAULT_REPUTATION);
                *entry = (*entry + REPUTATION_RESOLVE_DELTA).clamp(0.0, 1.0);
            }
            let mut session = inner.active.remove(session_id).unwrap();
            session.status = SessionStatus::Resolved;
            session.resolution = Some(latest_proposal.content.clone());
            info!("negotiation {session_id} resolved by unanimous acceptance");
            Self::finalize(inner, session);
        } else if rejects > accepts && !counters.is_empty() {
            let best = counters
                .iter()
                .max_by(|a, b| {
                    viability(a.counter_proposal.as_ref())
                        .partial_cmp(&viability(b.counter_proposal.as_ref()))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap();
            let content = best.counter_proposal.clone().unwrap_or_default();
            let proposer = best.responder.clone();
            let session = inner.active.get_mut(session_id).unwrap();
            let targets: HashSet<AgentId> = session
                .participants
                .iter()
                .filter(|a| **a != proposer)
                .cloned()
                .collect();
            let new_proposal = Proposal {
                id: format!("proposal_{}", self.seq.fetch_add(1, Ordering::SeqCst)),
                proposer,
                content,
                target_agents: targets,
                expires_at: now + chrono::Duration::from_std(session.timeout / 2).unwrap_or_default(),
            };
            debug!("negotiation {session_id} promoting best counter-proposal");
            session.proposals.push(new_proposal);
            session.updated_at = now;
        } else if rejects > accepts {
            let participants = inner.active.get(session_id).unwrap().participants.clone();
            for agent in &participants {
                let entry = inner.reputation.entry(agent.clone()).or_insert(DEFAULT_REPUTATION);
                *entry = (*entry - REPUTATION_FAIL_DELTA).clamp(0.0, 1.0);
            }
            let mut session = inner.active.remove(session_id).unwrap();
            session.status = SessionStatus::Failed;
            info!("negotiation {session_id} failed: rejections dominate with no counter");
            Self::finalize(inner, session);
        } else {
            self.mediate_locked(inner, session_id, &latest_proposal, &responses).await;
        }
    }

    /// Mixed responses with no dominant reject/counter path: asks the
    /// Broker for a compromise proposal. Mediation failure (a broker
    /// error, or an unparseable response) ends the session in deadlock
    /// rather than retrying indefinitely.
    async fn mediate_locked(&self, inner: &mut Inner, session_id: &str, latest: &Proposal, responses: &[Response]) {
        let session = inner.active.get(session_id).unwrap();
        let prompt = build_mediation_prompt(&session.topic, latest, responses);
        let timeout = session.timeout;

        let result = self
            .broker
            .submit(LlmRequest::new("negotiation_mediation", prompt, Priority::High))
            .await;

        match result {
            Ok(response) => match serde_json::from_str::<HashMap<String, Value>>(&response.content) {
                Ok(content) => {
                    let session = inner.active.get_mut(session_id).unwrap();
                    let new_proposal = Proposal {
                        id: format!("proposal_{}", self.seq.fetch_add(1, Ordering::SeqCst)),
                        proposer: "mediator".to_string(),
                        content,
                        target_agents: session.participants.clone(),
                        expires_at: chrono::Utc::now() + chrono::Duration::from_std(timeout / 2).unwrap_or_default(),
                    };
                    info!("negotiation {session_id} received a mediated compromise proposal");
                    session.proposals.push(new_proposal);
                    session.updated_at = chrono::Utc::now();
                }
                Err(_) => {
                    warn!("negotiation {session_id} mediation returned an unparseable proposal");
                    let mut session = inner.active.remove(session_id).unwrap();
                    session.status = SessionStatus::Deadlock;
                    Self::finalize(inner, session);
                }
            },
            Err(e) => {
                warn!("negotiation {session_id} mediation failed: {e}");
                let mut session = inner.active.remove(session_id).unwrap();
                session.status = SessionStatus::Deadlock;
                Self::finalize(inner, session);
            }
        }
    }

    fn finalize(inner: &mut Inner, session: Session) {
        inner.history.push_back(session);
    }

    /// Forces a lazy timeout/round-cap check on every active session,
    /// for callers (the Orchestrator) that want terminal sessions
    /// swept out even without a fresh response arriving.
    pub async fn sweep_timeouts(&self) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<SessionId> = inner.active.keys().cloned().collect();
        for id in ids {
            self.evaluate_locked(&mut inner, &id).await;
        }
        while inner.history.len() > self.history_cap {
            inner.history.pop_front();
        }
    }

    pub async fn session_status(&self, id: &str) -> Option<SessionStatus> {
        let inner = self.inner.lock().await;
        if let Some(session) = inner.active.get(id) {
            return Some(session.status);
        }
        inner.history.iter().find(|s| s.id == id).map(|s| s.status)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// The id of the proposal a responder currently needs to answer for
    /// an active session — callers that open a session with
    /// [`NegotiationEngine::initiate`] only get the session id back, so
    /// they need this to drive [`NegotiationEngine::respond`].
    pub async fn latest_proposal_id(&self, session_id: &str) -> Option<ProposalId> {
        let inner = self.inner.lock().await;
        inner.active.get(session_id)?.proposals.last().map(|p| p.id.clone())
    }
}

/// `0.5 base + 0.2 if benefits_offered non-empty - 0.1*n_requirements`,
/// clamped `[0, 1]` — the source's `_evaluate_proposal_viability`.
fn viability(proposal: Option<&HashMap<String, Value>>) -> f64 {
    let Some(proposal) = proposal else {
        return 0.0;
    };
    let mut score = 0.5;
    if let Some(Value::Array(items)) = proposal.get("benefits_offered") {
        if !items.is_empty() {
            score += 0.2;
        }
    }
    if let Some(Value::Array(items)) = proposal.get("requirements") {
        score -= (0.1 * items.len() as f64).min(0.3);
    }
    score.clamp(0.0, 1.0)
}

fn build_mediation_prompt(topic: &str, latest: &Proposal, responses: &[Response]) -> String {
    let mut prompt = format!(
        "You are mediating a negotiation over \"{topic}\". The latest proposal from {} is:\n{:?}\n\n",
        latest.proposer, latest.content
    );
    prompt.push_str("Responses so far:\n");
    for response in responses {
        prompt.push_str(&format!("- {} responded {:?}: {:?}\n", response.responder, response.kind, response.content));
    }
    prompt.push_str(
        "\nPropose a compromise as a JSON object (no prose) with fields matching the \
         original proposal's shape, adjusted to address the rejecting parties' concerns.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CostBudget;
    use crate::cache::ResponseCache;
    use crate::clients::mock::MockProvider;

    async fn engine(response: &str) -> Arc<NegotiationEngine> {
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
        Arc::new(NegotiationEngine::new(broker, 5, 100))
    }

    #[tokio::test]
    async fn unanimous_accept_resolves_and_raises_reputation() {
        let engine = engine("unused").await;
        let session_id = engine
            .initiate("alice", vec!["bob".to_string()], "territory", HashMap::new())
            .await;
        let proposal_id = {
            let inner = engine.inner.lock().await;
            inner.active[&session_id].proposals[0].id.clone()
        };
        let status = engine
            .respond(&proposal_id, "bob", ResponseKind::Accept, HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::Resolved);
        assert!(engine.reputation_of("bob").await > DEFAULT_REPUTATION);
    }

    #[tokio::test]
    async fn reject_without_counter_fails() {
        let engine = engine("unused").await;
        let session_id = engine
            .initiate("alice", vec!["bob".to_string()], "territory", HashMap::new())
            .await;
        let proposal_id = {
            let inner = engine.inner.lock().await;
            inner.active[&session_id].proposals[0].id.clone()
        };
        let status = engine
            .respond(&proposal_id, "bob", ResponseKind::Reject, HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::Failed);
        assert!(engine.reputation_of("bob").await < DEFAULT_REPUTATION);
    }

    #[tokio::test]
    async fn reject_with_counter_promotes_it() {
        let engine = engine("unused").await;
        let session_id = engine
            .initiate("alice", vec!["bob".to_string()], "territory", HashMap::new())
            .await;
        let proposal_id = {
            let inner = engine.inner.lock().await;
            inner.active[&session_id].proposals[0].id.clone()
        };
        let mut counter = HashMap::new();
        counter.insert("type".to_string(), Value::String("split".to_string()));
        let status = engine
            .respond(&proposal_id, "bob", ResponseKind::Reject, HashMap::new(), Some(counter))
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::InProgress);
        let inner = engine.inner.lock().await;
        assert_eq!(inner.active[&session_id].proposals.len(), 2);
    }

    #[tokio::test]
    async fn non_participant_response_is_rejected() {
        let engine = engine("unused").await;
        let session_id = engine
            .initiate("alice", vec!["bob".to_string()], "territory", HashMap::new())
            .await;
        let proposal_id = {
            let inner = engine.inner.lock().await;
            inner.active[&session_id].proposals[0].id.clone()
        };
        let result = engine
            .respond(&proposal_id, "mallory", ResponseKind::Accept, HashMap::new(), None)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn viability_rewards_benefits_and_penalizes_requirements() {
        let mut proposal = HashMap::new();
        proposal.insert("benefits_offered".to_string(), Value::Array(vec![Value::String("gold".into())]));
        proposal.insert("requirements".to_string(), Value::Array(vec![Value::String("oath".into())]));
        let score = viability(Some(&proposal));
        assert!((score - 0.6).abs() < 1e-9);
    }
}
