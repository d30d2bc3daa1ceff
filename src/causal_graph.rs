//! Causal Graph (C6).
//!
//! A directed graph of [`Event`]s over [`CausalEdge`]s, plus three
//! secondary indices (by one-hour timestamp bucket, by actor, by
//! location) grounded directly on the source's `causal_graph.py`.
//! Guarded by a single `tokio::sync::RwLock`: many readers run
//! `chain_from`/`influential_events`/`predict_next` concurrently, one
//! writer appends at a time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{CausalEdge, CausalRelation, Event, EventId};

/// Serializable copy of the graph's nodes and edges, used by
/// [`CausalGraph::snapshot`]/[`CausalGraph::restore_into`] for the host
/// boundary's persisted-state round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CausalGraphSnapshot {
    pub events: Vec<Event>,
    pub edges: Vec<CausalEdge>,
}

const INFERENCE_WINDOW_SECS: f64 = 3600.0;
const INFERENCE_STRENGTH_THRESHOLD: f64 = 0.3;
const INFLUENCE_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct NarrativePatterns {
    pub conflict_nodes: Vec<EventId>,
    pub catalyst_events: Vec<EventId>,
    pub convergence_points: Vec<EventId>,
}

#[derive(Debug, Clone)]
pub struct PredictedSuccessor {
    pub event_id: EventId,
    pub probability: f64,
}

struct CausalGraphInner {
    nodes: HashMap<EventId, Event>,
    edges: HashMap<(EventId, EventId), CausalEdge>,
    temporal_index: HashMap<i64, Vec<EventId>>,
    actor_index: HashMap<String, Vec<EventId>>,
    location_index: HashMap<String, Vec<EventId>>,
}

impl CausalGraphInner {
    fn new() -> Self {
        CausalGraphInner {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            temporal_index: HashMap::new(),
            actor_index: HashMap::new(),
            location_index: HashMap::new(),
        }
    }

    fn time_bucket(event: &Event) -> i64 {
        event.timestamp.timestamp() / 3600
    }

    fn outgoing(&self, id: &EventId) -> Vec<&CausalEdge> {
        self.edges.values().filter(|e| &e.source == id).collect()
    }

    fn incoming(&self, id: &EventId) -> Vec<&CausalEdge> {
        self.edges.values().filter(|e| &e.target == id).collect()
    }

    fn out_degree(&self, id: &EventId) -> usize {
        self.outgoing(id).len()
    }
}

pub struct CausalGraph {
    inner: RwLock<CausalGraphInner>,
}

impl CausalGraph {
    pub fn new() -> Self {
        CausalGraph {
            inner: RwLock::new(CausalGraphInner::new()),
        }
    }

    /// Appends an event, indexing it, then runs causal inference
    /// against every candidate cause within the last hour that shares
    /// an actor or location.
    pub async fn add_event(&self, event: Event) {
        let mut inner = self.inner.write().await;
        let bucket = CausalGraphInner::time_bucket(&event);

        let candidates: Vec<EventId> = inner
            .nodes
            .values()
            .filter(|other| {
                let shares_actor = event.actor.is_some() && event.actor == other.actor;
                let shares_location = event.location.is_some() && event.location == other.location;
                let within_window =
                    (event.timestamp - other.timestamp).num_seconds().abs() as f64 <= INFERENCE_WINDOW_SECS;
                within_window && (shares_actor || shares_location) && other.id != event.id
            })
            .map(|other| other.id.clone())
            .collect();

        inner.temporal_index.entry(bucket).or_default().push(event.id.clone());
        if let Some(actor) = &event.actor {
            inner.actor_index.entry(actor.clone()).or_default().push(event.id.clone());
        }
        if let Some(location) = &event.location {
            inner
                .location_index
                .entry(location.clone())
                .or_default()
                .push(event.id.clone());
        }

        let new_edges: Vec<CausalEdge> = candidates
            .iter()
            .filter_map(|cause_id| {
                let cause = inner.nodes.get(cause_id)?;
                let same_actor = event.actor.is_some() && event.actor == cause.actor;
                let same_location = event.location.is_some() && event.location == cause.location;
                let participant_overlap = cause.participants.intersection(&event.participants).count();
                let logical_pair = is_logical_pair(&cause.kind, &event.kind);
                let delta = (event.timestamp - cause.timestamp).num_seconds().abs() as f64;
                let temporal_proximity = (1.0 - delta / INFERENCE_WINDOW_SECS).max(0.0);

                let strength = (same_actor as u8 as f64) * 0.4
                    + (same_location as u8 as f64) * 0.3
                    + 0.1 * participant_overlap as f64
                    + (logical_pair as u8 as f64) * 0.2
                    + 0.1 * temporal_proximity;

                if strength > INFERENCE_STRENGTH_THRESHOLD {
                    let relation = decide_relation(&cause.kind, &event.kind, same_actor, logical_pair);
                    Some(CausalEdge {
                        source: cause.id.clone(),
                        target: event.id.clone(),
                        relation,
                        strength: strength.min(1.0),
                        confidence: cause.confidence.min(event.confidence),
                        delay: std::time::Duration::from_secs_f64(delta),
                    })
                } else {
                    None
                }
            })
            .collect();

        inner.nodes.insert(event.id.clone(), event);
        for edge in new_edges {
            inner.edges.insert((edge.source.clone(), edge.target.clone()), edge);
        }
    }

    pub async fn add_edge(&self, edge: CausalEdge) -> Result<(), String> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&edge.source) || !inner.nodes.contains_key(&edge.target) {
            return Err(format!(
                "cannot add edge {} -> {}: missing endpoint",
                edge.source, edge.target
            ));
        }
        inner.edges.insert((edge.source.clone(), edge.target.clone()), edge);
        Ok(())
    }

    /// A serializable copy of every event and edge, for the host
    /// boundary's persisted-state round trip (`spec.md §6.3`). Events
    /// and edges already derive `Serialize`/`Deserialize`; the indices
    /// are not carried since `restore_into` rebuilds them deterministically.
    pub async fn snapshot(&self) -> CausalGraphSnapshot {
        let inner = self.inner.read().await;
        CausalGraphSnapshot {
            events: inner.nodes.values().cloned().collect(),
            edges: inner.edges.values().cloned().collect(),
        }
    }

    /// Replaces this graph's state in place with `snapshot`'s, rebuilding
    /// the secondary indices but not re-running causal inference — the
    /// snapshot's edges are trusted as already-decided. Other components
    /// (`Broker`, `CoherenceChecker`, `DecisionPipeline`) hold an `Arc` to
    /// this same graph, so restoring has to mutate through that `Arc`
    /// rather than hand back a new, disconnected instance.
    pub async fn restore_into(&self, snapshot: CausalGraphSnapshot) {
        let mut inner = self.inner.write().await;
        *inner = CausalGraphInner::new();
        for event in snapshot.events {
            let bucket = CausalGraphInner::time_bucket(&event);
            inner.temporal_index.entry(bucket).or_default().push(event.id.clone());
            if let Some(actor) = &event.actor {
                inner.actor_index.entry(actor.clone()).or_default().push(event.id.clone());
            }
            if let Some(location) = &event.location {
                inner
                    .location_index
                    .entry(location.clone())
                    .or_default()
                    .push(event.id.clone());
            }
            inner.nodes.insert(event.id.clone(), event);
        }
        for edge in snapshot.edges {
            inner.edges.insert((edge.source.clone(), edge.target.clone()), edge);
        }
    }

    pub async fn get_event(&self, id: &str) -> Option<Event> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    /// Every recorded event with the given actor (or location), newest
    /// first, for rule checks that need "what did this actor/location
    /// last do" without walking the whole graph.
    pub async fn events_by_actor(&self, actor: &str) -> Vec<Event> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .actor_index
            .get(actor)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// Immediate causes of `id`: the source end of every edge whose
    /// target is `id`, for callers (the decision pipeline's
    /// interpretation stage) that need "what caused this" rather than
    /// `chain_from`'s forward "what did this cause."
    pub async fn causes_of(&self, id: &str) -> Vec<EventId> {
        let inner = self.inner.read().await;
        inner.incoming(&id.to_string()).iter().map(|e| e.source.clone()).collect()
    }

    pub async fn events_by_location(&self, location: &str) -> Vec<Event> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .location_index
            .get(location)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// DFS collecting every growing path prefix (not just maximal
    /// paths), bounded at `max_depth`.
    pub async fn chain_from(&self, start: &str, max_depth: usize) -> Vec<Vec<EventId>> {
        let inner = self.inner.read().await;
        let mut paths = Vec::new();
        let mut stack = vec![vec![start.to_string()]];
        while let Some(path) = stack.pop() {
            paths.push(path.clone());
            if path.len() > max_depth {
                continue;
            }
            let last = path.last().unwrap();
            for edge in inner.outgoing(last) {
                if !path.contains(&edge.target) {
                    let mut next = path.clone();
                    next.push(edge.target.clone());
                    stack.push(next);
                }
            }
        }
        paths
    }

    /// Events within `window` sorted by `out_degree · narrative_weight ·
    /// confidence`, filtered above 1.0 — the full product used for both
    /// filter and sort key, per the literal spec reading.
    pub async fn influential_events(&self, window: std::time::Duration) -> Vec<EventId> {
        let inner = self.inner.read().await;
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let mut scored: Vec<(EventId, f64)> = inner
            .nodes
            .values()
            .filter(|e| e.timestamp >= cutoff)
            .map(|e| {
                let score = inner.out_degree(&e.id) as f64 * e.narrative_weight * e.confidence;
                (e.id.clone(), score)
            })
            .filter(|(_, score)| *score > INFLUENCE_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn patterns(&self) -> NarrativePatterns {
        let inner = self.inner.read().await;
        let mut patterns = NarrativePatterns::default();

        for id in inner.nodes.keys() {
            let incoming = inner.incoming(id);
            if incoming.len() > 1
                && incoming
                    .iter()
                    .any(|e| e.relation == CausalRelation::Contradiction)
            {
                patterns.conflict_nodes.push(id.clone());
            }
            if inner
                .outgoing(id)
                .iter()
                .any(|e| e.relation == CausalRelation::Catalyst)
            {
                patterns.catalyst_events.push(id.clone());
            }
            if incoming.len() >= 3 {
                let distinct_actors: std::collections::HashSet<&Option<String>> = incoming
                    .iter()
                    .filter_map(|e| inner.nodes.get(&e.source))
                    .map(|n| &n.actor)
                    .collect();
                if distinct_actors.len() >= 2 {
                    patterns.convergence_points.push(id.clone());
                }
            }
        }
        patterns
    }

    /// Top 5 influential events, each expanded via `chain_from(depth=2)`;
    /// every chain of length > 1 contributes its second hop as a
    /// candidate, scored `edge.strength · edge.confidence ·
    /// source.confidence`, returning the top 10 by probability.
    pub async fn predict_next(&self, window: std::time::Duration) -> Vec<PredictedSuccessor> {
        let top_influential: Vec<EventId> = self.influential_events(window).await.into_iter().take(5).collect();

        let inner = self.inner.read().await;
        let mut candidates = Vec::new();
        for event_id in &top_influential {
            let mut stack = vec![vec![event_id.clone()]];
            while let Some(path) = stack.pop() {
                if path.len() > 2 {
                    continue;
                }
                let last = path.last().unwrap();
                for edge in inner.outgoing(last) {
                    if path.len() == 1 {
                        if let Some(source) = inner.nodes.get(event_id) {
                            candidates.push(PredictedSuccessor {
                                event_id: edge.target.clone(),
                                probability: edge.strength * edge.confidence * source.confidence,
                            });
                        }
                    }
                    let mut next = path.clone();
                    next.push(edge.target.clone());
                    stack.push(next);
                }
            }
        }
        candidates.sort_by(|a, b| b.probability.partial_cmp(&a.probability).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(10);
        candidates
    }
}

impl Default for CausalGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn is_logical_pair(cause_kind: &str, effect_kind: &str) -> bool {
    matches!(
        (cause_kind, effect_kind),
        ("threat", "flee")
            | ("threat", "defend")
            | ("request", "response")
            | ("attack", "retaliate")
            | ("offer", "accept")
            | ("offer", "reject")
    )
}

fn decide_relation(cause_kind: &str, effect_kind: &str, same_actor: bool, logical_pair: bool) -> CausalRelation {
    if contradictory_kinds(cause_kind, effect_kind) {
        CausalRelation::Contradiction
    } else if same_actor {
        CausalRelation::DirectCause
    } else if logical_pair {
        CausalRelation::Enabler
    } else {
        CausalRelation::IndirectCause
    }
}

fn contradictory_kinds(a: &str, b: &str) -> bool {
    matches!(
        (a, b),
        ("promise", "betrayal") | ("betrayal", "promise") | ("truce", "attack") | ("attack", "truce")
    )
}
