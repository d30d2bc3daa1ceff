//! Narrative Coherence Checker (C9).
//!
//! Runs a fixed set of consistency rules against each new [`Event`]
//! before it is considered admitted, grounded on the source's
//! `narrative_coherence.py` `NarrativeCoherenceEngine`: temporal
//! ordering, co-location, and precondition rules run first and are
//! cheap (co-location exempts `move`-kind events, since a move is
//! exactly how an actor legitimately crosses locations inside the
//! window); a single LLM-mediated correction pass runs only when one of
//! them fails, and only ever adjusts `kind`, `payload`, or `location`
//! — never `actor`, `participants`, or `timestamp`, which the caller
//! supplied and this checker has no business rewriting.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::broker::{Broker, LlmRequest};
use crate::causal_graph::CausalGraph;
use crate::error::CoherenceError;
use crate::types::{AgentId, Event, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Temporal,
    CoLocation,
    Precondition,
}

#[derive(Debug, Clone)]
pub struct RuleViolation {
    pub rule: RuleKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacterArcStage {
    Introduction,
    Exploration,
    Conflict,
    SocialDevelopment,
    Learning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterArc {
    pub agent: AgentId,
    pub event_count: usize,
    pub stage: CharacterArcStage,
    /// Kinds of the most recent events for this actor, newest last,
    /// capped at `ARC_STAGE_EVERY` — the window the stage tag is
    /// re-derived from every `ARC_STAGE_EVERY` events.
    recent_kinds: VecDeque<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotThread {
    pub id: String,
    pub events: Vec<String>,
    pub locations: HashSet<String>,
    pub actors: HashSet<AgentId>,
}

/// Serializable copy of every character arc and plot thread, for the
/// host boundary's persisted-state round trip (`spec.md §6.3`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoherenceSnapshot {
    pub arcs: Vec<CharacterArc>,
    pub threads: Vec<PlotThread>,
}

const ARC_STAGE_EVERY: usize = 5;

/// Keyword-matches the actor's last `ARC_STAGE_EVERY` event kinds, same
/// priority order as the source's `_analyze_character_development_stage`:
/// combat/conflict kinds win over social/negotiate kinds, which win over
/// discover/learn kinds; anything else defaults to exploration.
fn derive_arc_stage(recent_kinds: &VecDeque<String>) -> CharacterArcStage {
    let lower: Vec<String> = recent_kinds.iter().map(|k| k.to_lowercase()).collect();
    if lower.iter().any(|k| k.contains("combat") || k.contains("conflict")) {
        CharacterArcStage::Conflict
    } else if lower.iter().any(|k| k.contains("social") || k.contains("negotiate")) {
        CharacterArcStage::SocialDevelopment
    } else if lower.iter().any(|k| k.contains("discover") || k.contains("learn")) {
        CharacterArcStage::Learning
    } else {
        CharacterArcStage::Exploration
    }
}

const PLOT_THREAD_WEIGHT_GATE: f64 = 0.5;

struct Inner {
    arcs: HashMap<AgentId, CharacterArc>,
    threads: Vec<PlotThread>,
}

/// One default rule set plus a bounded amount of derived narrative
/// bookkeeping (arcs, plot threads) that accumulates as events are
/// checked. Shares the `CausalGraph` and `Broker` the rest of the
/// runtime uses rather than keeping its own copies.
pub struct CoherenceChecker {
    causal_graph: std::sync::Arc<CausalGraph>,
    broker: std::sync::Arc<Broker>,
    inner: Mutex<Inner>,
}

impl CoherenceChecker {
    pub fn new(causal_graph: std::sync::Arc<CausalGraph>, broker: std::sync::Arc<Broker>) -> Self {
        CoherenceChecker {
            causal_graph,
            broker,
            inner: Mutex::new(Inner {
                arcs: HashMap::new(),
                threads: Vec::new(),
            }),
        }
    }

    /// Runs every default rule against `event`. On a clean pass,
    /// returns `event` unchanged (after updating arcs/threads). On a
    /// violation, asks the Broker for a one-shot correction restricted
    /// to `kind`/`payload`/`location`; if that correction itself fails
    /// to resolve the violation, returns `CoherenceError`.
    pub async fn check(&self, event: Event) -> Result<Event, CoherenceError> {
        let violations = self.run_rules(&event).await;
        let event = if violations.is_empty() {
            event
        } else {
            warn!(
                "coherence violations on event {}: {:?}",
                event.id,
                violations.iter().map(|v| &v.detail).collect::<Vec<_>>()
            );
            self.correct(event, &violations).await?
        };

        self.update_bookkeeping(&event).await;
        Ok(event)
    }

    async fn run_rules(&self, event: &Event) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        if event.timestamp > chrono::Utc::now() {
            violations.push(RuleViolation {
                rule: RuleKind::Temporal,
                detail: format!(
                    "event {} is timestamped {} which is after now",
                    event.id, event.timestamp
                ),
            });
        }

        if let (Some(actor), Some(location)) = (&event.actor, &event.location) {
            let recent_elsewhere = if event.kind == "move" {
                None
            } else {
                self.causal_graph
                    .events_by_actor(actor)
                    .await
                    .into_iter()
                    .filter(|other| other.id != event.id)
                    .find(|other| {
                        other.location.as_deref().is_some_and(|loc| loc != location)
                            && (event.timestamp - other.timestamp).num_seconds().abs() < 60
                    })
            };
            if let Some(other) = recent_elsewhere {
                violations.push(RuleViolation {
                    rule: RuleKind::CoLocation,
                    detail: format!(
                        "actor {} is at {} in event {} but was at {:?} in event {} moments earlier",
                        actor, location, event.id, other.location, other.id
                    ),
                });
            }
        }

        for requirement in event.requires() {
            let satisfied = if let Some(actor) = &event.actor {
                self.causal_graph
                    .events_by_actor(actor)
                    .await
                    .iter()
                    .any(|prior| prior.timestamp <= event.timestamp && prior.kind == requirement)
            } else {
                false
            };
            if !satisfied {
                violations.push(RuleViolation {
                    rule: RuleKind::Precondition,
                    detail: format!("event {} requires prior '{}' which was not found", event.id, requirement),
                });
            }
        }

        violations
    }

    /// Asks the Broker to rewrite `kind`/`payload`/`location` so the
    /// event no longer violates the listed rules, then re-runs the
    /// rules once against the correction. A second failure is
    /// surfaced rather than looped on, matching the "one-shot" design
    /// in `spec.md §4.9`.
    async fn correct(&self, mut event: Event, violations: &[RuleViolation]) -> Result<Event, CoherenceError> {
        let prompt = build_correction_prompt(&event, violations);
        let response = self
            .broker
            .submit(LlmRequest::new("coherence_correction", prompt, Priority::High))
            .await
            .map_err(|e| CoherenceError::CorrectionFailed(e.to_string()))?;

        let correction: HashMap<String, Value> = serde_json::from_str(&response.content)
            .map_err(|e| CoherenceError::CorrectionFailed(format!("unparseable correction: {e}")))?;

        if let Some(Value::String(kind)) = correction.get("kind") {
            event.kind = kind.clone();
        }
        if let Some(Value::String(location)) = correction.get("location") {
            event.location = Some(location.clone());
        }
        if let Some(Value::Object(payload)) = correction.get("payload") {
            for (key, value) in payload {
                event.payload.insert(key.clone(), value.clone());
            }
        }

        let remaining = self.run_rules(&event).await;
        if !remaining.is_empty() {
            return Err(CoherenceError::CorrectionFailed(format!(
                "{} violation(s) survived correction",
                remaining.len()
            )));
        }
        debug!("event {} corrected to resolve {} violation(s)", event.id, violations.len());
        Ok(event)
    }

    async fn update_bookkeeping(&self, event: &Event) {
        let mut inner = self.inner.lock().await;

        if let Some(actor) = &event.actor {
            let arc = inner.arcs.entry(actor.clone()).or_insert_with(|| CharacterArc {
                agent: actor.clone(),
                event_count: 0,
                stage: CharacterArcStage::Introduction,
                recent_kinds: VecDeque::new(),
            });
            arc.event_count += 1;
            arc.recent_kinds.push_back(event.kind.clone());
            while arc.recent_kinds.len() > ARC_STAGE_EVERY {
                arc.recent_kinds.pop_front();
            }
            if arc.event_count % ARC_STAGE_EVERY == 0 {
                arc.stage = derive_arc_stage(&arc.recent_kinds);
            }
        }

        if event.narrative_weight <= PLOT_THREAD_WEIGHT_GATE {
            return;
        }

        let joined = inner.threads.iter_mut().find(|thread| {
            event.location.as_ref().is_some_and(|loc| thread.locations.contains(loc))
                || !thread.actors.is_disjoint(&event.participants)
                || thread.actors.iter().any(|a| event.actor.as_deref() == Some(a))
        });

        match joined {
            Some(thread) => {
                thread.events.push(event.id.clone());
                if let Some(location) = &event.location {
                    thread.locations.insert(location.clone());
                }
                thread.actors.extend(event.participants.iter().cloned());
                if let Some(actor) = &event.actor {
                    thread.actors.insert(actor.clone());
                }
            }
            None => {
                let mut actors = event.participants.clone();
                if let Some(actor) = &event.actor {
                    actors.insert(actor.clone());
                }
                inner.threads.push(PlotThread {
                    id: format!("thread_{}", inner.threads.len()),
                    events: vec![event.id.clone()],
                    locations: event.location.iter().cloned().collect(),
                    actors,
                });
            }
        }
    }

    pub async fn character_arcs(&self) -> Vec<CharacterArc> {
        self.inner.lock().await.arcs.values().cloned().collect()
    }

    pub async fn plot_threads(&self) -> Vec<PlotThread> {
        self.inner.lock().await.threads.clone()
    }

    pub async fn snapshot(&self) -> CoherenceSnapshot {
        let inner = self.inner.lock().await;
        CoherenceSnapshot {
            arcs: inner.arcs.values().cloned().collect(),
            threads: inner.threads.clone(),
        }
    }

    /// Replaces this checker's arcs and plot threads in place — other
    /// components hold an `Arc` to this same checker, so restoring has
    /// to mutate through it rather than hand back a new instance.
    pub async fn restore_into(&self, snapshot: CoherenceSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.arcs = snapshot.arcs.into_iter().map(|arc| (arc.agent.clone(), arc)).collect();
        inner.threads = snapshot.threads;
    }
}

fn build_correction_prompt(event: &Event, violations: &[RuleViolation]) -> String {
    let mut prompt = format!(
        "Event {} (kind={}, location={:?}) violates narrative coherence:\n",
        event.id, event.kind, event.location
    );
    for violation in violations {
        prompt.push_str(&format!("- {:?}: {}\n", violation.rule, violation.detail));
    }
    prompt.push_str(
        "\nReturn a JSON object (no prose) with only the fields that need to change among \
         \"kind\", \"location\", and \"payload\", adjusted so the violations above no longer apply.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CostBudget;
    use crate::cache::ResponseCache;
    use crate::clients::mock::MockProvider;
    use std::sync::Arc;
    use std::time::Duration;

    async fn checker(response: &str) -> CoherenceChecker {
        let graph = Arc::new(CausalGraph::new());
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
        CoherenceChecker::new(graph, broker)
    }

    #[tokio::test]
    async fn clean_event_passes_through_unchanged() {
        let checker = checker("unused").await;
        let event = Event::new("move", Some("alice".to_string())).with_location("camp");
        let checked = checker.check(event.clone()).await.unwrap();
        assert_eq!(checked.kind, "move");
    }

    #[tokio::test]
    async fn co_location_violation_triggers_correction() {
        // The correction reinterprets the event as a `move` between the
        // two locations, which the rule treats as a legitimate way to
        // cross locations inside the window — resolving the violation.
        let checker = checker(r#"{"kind": "move"}"#).await;
        let graph = checker.causal_graph.clone();
        let first = Event::new("scout", Some("alice".to_string())).with_location("ridge");
        graph.add_event(first.clone()).await;

        let mut second = Event::new("fight", Some("alice".to_string())).with_location("camp");
        second.timestamp = first.timestamp + chrono::Duration::seconds(5);
        let checked = checker.check(second).await.unwrap();
        assert_eq!(checked.kind, "move");
        assert_eq!(checked.location.as_deref(), Some("camp"));
    }

    #[tokio::test]
    async fn move_kind_event_is_exempt_from_co_location_rule() {
        let checker = checker("unused").await;
        let graph = checker.causal_graph.clone();
        let first = Event::new("scout", Some("alice".to_string())).with_location("ridge");
        graph.add_event(first.clone()).await;

        let mut second = Event::new("move", Some("alice".to_string())).with_location("camp");
        second.timestamp = first.timestamp + chrono::Duration::seconds(5);
        let checked = checker.check(second).await.unwrap();
        assert_eq!(checked.location.as_deref(), Some("camp"));
    }

    #[tokio::test]
    async fn unresolvable_precondition_surfaces_an_error() {
        let checker = checker(r#"{"payload": {}}"#).await;
        let event = Event::new("open_vault", Some("alice".to_string()))
            .with_payload("requires", serde_json::json!(["find_key"]));
        let result = checker.check(event).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn arcs_advance_stage_every_five_events() {
        let checker = checker("unused").await;
        let base = chrono::Utc::now() - chrono::Duration::seconds(10);
        let kinds = ["scout", "scout", "negotiate", "social_chat", "combat_strike"];
        for (i, kind) in kinds.iter().enumerate() {
            let mut event = Event::new(*kind, Some("alice".to_string()));
            event.timestamp = base + chrono::Duration::seconds(i as i64);
            checker.check(event).await.unwrap();
        }
        let arcs = checker.character_arcs().await;
        let alice = arcs.iter().find(|a| a.agent == "alice").unwrap();
        assert_eq!(alice.stage, CharacterArcStage::Conflict);
    }

    #[tokio::test]
    async fn arc_stage_defaults_to_exploration_without_matching_keywords() {
        let checker = checker("unused").await;
        let base = chrono::Utc::now() - chrono::Duration::seconds(10);
        for i in 0..5 {
            let mut event = Event::new(format!("beat_{i}"), Some("alice".to_string()));
            event.timestamp = base + chrono::Duration::seconds(i);
            checker.check(event).await.unwrap();
        }
        let arcs = checker.character_arcs().await;
        let alice = arcs.iter().find(|a| a.agent == "alice").unwrap();
        assert_eq!(alice.stage, CharacterArcStage::Exploration);
    }

    #[tokio::test]
    async fn future_timestamped_event_is_rejected() {
        let checker = checker(r#"{"kind": "move"}"#).await;
        let mut event = Event::new("scout", Some("alice".to_string()));
        event.timestamp = chrono::Utc::now() + chrono::Duration::seconds(60);
        let result = checker.check(event).await;
        assert!(result.is_err());
    }
}
