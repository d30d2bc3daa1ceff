//! Canonical data model shared by every component.
//!
//! Per the design notes, the runtime never lets duck-typed events or
//! dict-like payloads cross an internal boundary: there is exactly one
//! `Event` record, one `Agent` state record, and so on. Conversions from
//! host-supplied maps happen only at the edges the host actually touches
//! (`Runtime::submit_event`, character-data ingestion); everything inside
//! the core passes these types around by value or by id.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for an [`Event`] in the causal graph.
pub type EventId = String;
/// Opaque identifier for an agent.
pub type AgentId = String;

/// Generates a fresh event id. Ids are opaque strings per the data model;
/// a UUID gives global uniqueness without implying any ordering semantics
/// (ordering is carried by `timestamp`, never by the id itself).
pub fn new_event_id() -> EventId {
    Uuid::new_v4().to_string()
}

/// A directed causal relation between two events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CausalRelation {
    DirectCause,
    IndirectCause,
    Enabler,
    Catalyst,
    Inhibitor,
    Amplifier,
    Contradiction,
}

/// A node in the causal graph. Immutable after creation: nothing in this
/// crate ever hands out `&mut Event` once it has been appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: String,
    pub actor: Option<AgentId>,
    pub participants: HashSet<AgentId>,
    pub location: Option<String>,
    pub payload: HashMap<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub confidence: f64,
    pub narrative_weight: f64,
}

impl Event {
    pub fn new(kind: impl Into<String>, actor: Option<AgentId>) -> Self {
        let actor_set: HashSet<AgentId> = actor.iter().cloned().collect();
        Event {
            id: new_event_id(),
            kind: kind.into(),
            actor,
            participants: actor_set,
            location: None,
            payload: HashMap::new(),
            timestamp: chrono::Utc::now(),
            confidence: 1.0,
            narrative_weight: 0.5,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_participants(mut self, participants: HashSet<AgentId>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_narrative_weight(mut self, weight: f64) -> Self {
        self.narrative_weight = weight.clamp(0.0, 1.0);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `requires:[...]` preconditions read off the payload, for the
    /// Coherence Checker's precondition rule.
    pub fn requires(&self) -> Vec<String> {
        match self.payload.get("requires") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A directed causal edge, cause -> effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub source: EventId,
    pub target: EventId,
    pub relation: CausalRelation,
    pub strength: f64,
    pub confidence: f64,
    pub delay: std::time::Duration,
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Injured,
    Unconscious,
    Dead,
    Resting,
    Stunned,
    Incapacitated,
    Fleeing,
    Hiding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Injured,
    Critical,
    Dead,
    Recovering,
}

/// A single recorded state transition, kept in the agent's bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub at: chrono::DateTime<chrono::Utc>,
    pub from: String,
    pub to: String,
}

/// An active goal on an agent's goal list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub urgency: f64,
    pub importance: f64,
    pub feasibility: f64,
    pub alignment: f64,
    pub opportunity: f64,
}

impl Goal {
    /// `urgency*0.3 + importance*0.25 + feasibility*0.2 + alignment*0.15 + opportunity*0.1`
    pub fn priority_score(&self) -> f64 {
        self.urgency * 0.3
            + self.importance * 0.25
            + self.feasibility * 0.2
            + self.alignment * 0.15
            + self.opportunity * 0.1
    }
}

/// Personality traits, each in `[-1, 1]` with 0 being neutral. Only the
/// traits feeding the decision weights below are modeled explicitly;
/// unknown/extra traits a host wants to track belong in character data
/// the host keeps outside this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecisionWeights {
    pub self_preservation: f64,
    pub faction_loyalty: f64,
    pub personal_relationships: f64,
    pub mission_success: f64,
    pub moral_principles: f64,
    pub resource_acquisition: f64,
    pub knowledge_seeking: f64,
    pub status_advancement: f64,
}

impl Default for DecisionWeights {
    fn default() -> Self {
        DecisionWeights {
            self_preservation: 0.8,
            faction_loyalty: 0.6,
            personal_relationships: 0.5,
            mission_success: 0.7,
            moral_principles: 0.4,
            resource_acquisition: 0.3,
            knowledge_seeking: 0.5,
            status_advancement: 0.4,
        }
    }
}

impl DecisionWeights {
    pub fn as_array(&self) -> [f64; 8] {
        [
            self.self_preservation,
            self.faction_loyalty,
            self.personal_relationships,
            self.mission_success,
            self.moral_principles,
            self.resource_acquisition,
            self.knowledge_seeking,
            self.status_advancement,
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalityTraits {
    pub optimism: f64,
    pub caution: f64,
    pub aggression: f64,
    pub empathy: f64,
    pub curiosity: f64,
    pub discipline: f64,
}

/// Owned by exactly one pipeline instance; cross-agent effects propagate
/// only through the Event Bus and the Causal Graph, never a back-pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub faction: String,
    pub personality: PersonalityTraits,
    pub decision_weights: DecisionWeights,
    pub location: Option<String>,
    pub status: AgentStatus,
    pub health: HealthStatus,
    pub morale: f64,
    pub active_goals: Vec<Goal>,
    pub relationships: HashMap<AgentId, f64>,
    pub stress: f64,
    #[serde(skip)]
    pub recent_transitions: std::collections::VecDeque<StateTransition>,
}

pub const TRANSITION_RING_CAPACITY: usize = 100;

impl AgentState {
    pub fn new(id: impl Into<String>, faction: impl Into<String>) -> Self {
        AgentState {
            id: id.into(),
            faction: faction.into(),
            personality: PersonalityTraits::default(),
            decision_weights: DecisionWeights::default(),
            location: None,
            status: AgentStatus::Active,
            health: HealthStatus::Healthy,
            morale: 0.0,
            active_goals: Vec::new(),
            relationships: HashMap::new(),
            stress: 0.0,
            recent_transitions: std::collections::VecDeque::new(),
        }
    }

    pub fn set_morale(&mut self, value: f64) {
        self.morale = value.clamp(-1.0, 1.0);
    }

    pub fn set_relationship(&mut self, other: &str, value: f64) {
        self.relationships
            .insert(other.to_string(), value.clamp(-1.0, 1.0));
    }

    pub fn record_transition(&mut self, from: impl Into<String>, to: impl Into<String>) {
        if self.recent_transitions.len() >= TRANSITION_RING_CAPACITY {
            self.recent_transitions.pop_front();
        }
        self.recent_transitions.push_back(StateTransition {
            at: chrono::Utc::now(),
            from: from.into(),
            to: to.into(),
        });
    }
}

/// Priority of an LLM request; ordered `Critical < High < Normal < Low <
/// Background` for scheduling (lower variant = scheduled first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

/// A wall-clock instant used at internal suspension points. Kept distinct
/// from `chrono::DateTime` (used at serialization boundaries) since
/// `Instant` cannot be serialized and should not be.
pub type Deadline = Instant;
