//! Runtime (A3) — the single composition root.
//!
//! Replaces the source's process-level globals (a module-level
//! `AgentNegotiationEngine`, a module-level `NarrativeCoherenceEngine`,
//! and so on) with one owned instance per component, wired together
//! here exactly once per simulation. Every other module takes its
//! collaborators as constructor arguments and never reaches for global
//! state, so this is the only place the whole object graph is visible.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::budget::BudgetSnapshot;
use crate::cache::ResponseCache;
use crate::causal_graph::{CausalGraph, CausalGraphSnapshot};
use crate::clients::mock::MockProvider;
use crate::coherence::{CoherenceChecker, CoherenceSnapshot};
use crate::config::Config;
use crate::dialogue::DialogueManager;
use crate::error::SimError;
use crate::event_bus::EventBus;
use crate::memory::{MemoryStore, MemoryStoreSnapshot};
use crate::negotiation::NegotiationEngine;
use crate::orchestrator::{AgentTurnInput, TurnOrchestrator, TurnResult};
use crate::pipeline::DecisionPipeline;
use crate::provider::ProviderAdapter;
use crate::types::{AgentId, Event};

/// Everything the host boundary needs to persist and later restore: the
/// causal graph, every agent's memory store, character arcs and plot
/// threads, and the cost meters (`spec.md §6.3`). Agent state itself is
/// owned by the host, not `Runtime` (see `AgentTurnInput`), so it is not
/// part of this snapshot — the host already round-trips it however it
/// round-trips the rest of its own character data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub causal_graph: CausalGraphSnapshot,
    pub coherence: CoherenceSnapshot,
    pub budget: BudgetSnapshot,
    pub memories: HashMap<AgentId, MemoryStoreSnapshot>,
}

/// A fully wired simulation. Construct with [`Runtime::new`] (a real
/// provider) or [`Runtime::with_provider`] (for tests, or a host that
/// wants to supply its own [`ProviderAdapter`]); drive it turn by turn
/// with [`Runtime::run_turn`], feed it events with
/// [`Runtime::submit_event`], and shut it down with
/// [`Runtime::shutdown`] once done.
pub struct Runtime {
    pub config: Config,
    pub budget: Arc<crate::budget::CostBudget>,
    pub cache: Arc<ResponseCache>,
    pub broker: Arc<Broker>,
    pub causal_graph: Arc<CausalGraph>,
    pub coherence: Arc<CoherenceChecker>,
    pub negotiation: Arc<NegotiationEngine>,
    pub dialogue: Arc<DialogueManager>,
    pub pipeline: Arc<DecisionPipeline>,
    pub event_bus: Arc<EventBus>,
    pub orchestrator: Arc<TurnOrchestrator>,
    memories: Mutex<HashMap<AgentId, MemoryStore>>,
    broker_handle: tokio::task::JoinHandle<()>,
}

/// `cost_per_1k_tokens` used to price batch responses through the
/// Broker; not part of `Config` since it is a provider pricing fact,
/// not a simulation policy knob.
const DEFAULT_COST_PER_1K_TOKENS: f64 = 0.002;

impl Runtime {
    /// Wires every component together against a real Gemini binding.
    pub fn new(config: Config, gemini_api_key: impl Into<String>, gemini_model: impl Into<String>) -> Self {
        let provider = Arc::new(crate::clients::gemini::GeminiProvider::new(gemini_api_key, gemini_model));
        Self::with_provider(config, provider)
    }

    /// Wires every component together against an arbitrary
    /// [`ProviderAdapter`] — the path used by tests (with
    /// [`MockProvider`]) and by hosts binding their own provider.
    pub fn with_provider(config: Config, provider: Arc<dyn ProviderAdapter>) -> Self {
        let budget = Arc::new(crate::budget::CostBudget::new(
            config.max_cost_per_turn,
            config.max_total_cost,
            config.max_requests_per_hour,
        ));
        let cache = Arc::new(ResponseCache::new(config.cache_ttl, config.cache_capacity));

        let (broker, wake_rx) = Broker::new(
            budget.clone(),
            cache.clone(),
            provider,
            DEFAULT_COST_PER_1K_TOKENS,
            config.max_batch_size,
            config.batch_timeout,
            config.broker_wait_timeout,
        );
        let broker_handle = broker.clone().spawn(wake_rx);

        let causal_graph = Arc::new(CausalGraph::new());
        let coherence = Arc::new(CoherenceChecker::new(causal_graph.clone(), broker.clone()));
        let negotiation = Arc::new(NegotiationEngine::new(broker.clone(), config.negotiation_round_cap, 200));
        let dialogue = Arc::new(DialogueManager::new(broker.clone(), config.dialogue_history_cap));
        let pipeline = Arc::new(DecisionPipeline::new(causal_graph.clone(), broker.clone(), config.rng_seed));
        let event_bus = Arc::new(EventBus::new(config.event_bus_sync_threshold, config.event_bus_queue_capacity));
        let orchestrator = Arc::new(TurnOrchestrator::new(
            pipeline.clone(),
            dialogue.clone(),
            budget.clone(),
            config.max_turn_time,
            config.fast_mode_threshold,
        ));

        info!("runtime initialized");

        Runtime {
            config,
            budget,
            cache,
            broker,
            causal_graph,
            coherence,
            negotiation,
            dialogue,
            pipeline,
            event_bus,
            orchestrator,
            memories: Mutex::new(HashMap::new()),
            broker_handle,
        }
    }

    /// Convenience constructor for tests and demos: an in-memory
    /// provider returning a fixed canned response.
    pub fn with_mock_provider(config: Config, canned_response: impl Into<String>) -> Self {
        Self::with_provider(config, Arc::new(MockProvider::new(canned_response)))
    }

    /// Submits an event to the Causal Graph through the Coherence
    /// Checker, then fans it out on the Event Bus under a topic named
    /// after the event's kind. Returns the (possibly corrected) event
    /// actually admitted.
    pub async fn submit_event(&self, event: Event) -> Result<Event, SimError> {
        let checked = self.coherence.check(event).await?;
        self.causal_graph.add_event(checked.clone()).await;
        self.event_bus.publish(&checked.kind, checked.clone()).await;
        Ok(checked)
    }

    /// Lazily creates (or reuses) the named agent's memory store, then
    /// runs `f` against it. Owning one `MemoryStore` per agent here,
    /// rather than inside `AgentState`, keeps `AgentState` cheap to
    /// clone and pass around the pipeline.
    pub async fn with_agent_memory<R>(&self, agent_id: &str, f: impl FnOnce(&mut MemoryStore) -> R) -> R {
        let mut memories = self.memories.lock().await;
        let store = memories
            .entry(agent_id.to_string())
            .or_insert_with(|| MemoryStore::new(agent_id, self.config.memory_capacity, self.config.working_memory_size));
        f(store)
    }

    pub async fn run_turn(&self, agents: Vec<AgentTurnInput>) -> TurnResult {
        self.orchestrator.run_turn(agents).await
    }

    /// Captures the causal graph, character arcs/plot threads, cost
    /// meters, and every agent's memory store — the persisted-state
    /// round trip the host boundary is free to use (`spec.md §6.3`).
    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let memories = self.memories.lock().await;
        RuntimeSnapshot {
            causal_graph: self.causal_graph.snapshot().await,
            coherence: self.coherence.snapshot().await,
            budget: self.budget.snapshot().await,
            memories: memories.iter().map(|(id, store)| (id.clone(), store.snapshot())).collect(),
        }
    }

    /// Restores every component's state from `snapshot` in place. Every
    /// other component holds an `Arc` to this same `CausalGraph`/
    /// `CoherenceChecker`/`CostBudget`, so this mutates through those
    /// `Arc`s rather than replacing them — a fresh `Runtime` with new
    /// instances would leave the broker, pipeline, and coherence checker
    /// still pointing at the pre-restore state.
    pub async fn restore(&self, snapshot: RuntimeSnapshot) {
        self.causal_graph.restore_into(snapshot.causal_graph).await;
        self.coherence.restore_into(snapshot.coherence).await;
        self.budget.restore_into(&snapshot.budget).await;
        let mut memories = self.memories.lock().await;
        memories.clear();
        for (agent_id, store_snapshot) in snapshot.memories {
            memories.insert(agent_id, MemoryStore::restore(store_snapshot));
        }
        info!("runtime state restored from snapshot");
    }

    /// Force-completes any still-active dialogue and sweeps stale
    /// negotiation sessions, then aborts the broker's background
    /// batching loop. A `Runtime` should not be used after this call.
    pub async fn shutdown(&self) {
        self.dialogue.shutdown().await;
        self.negotiation.sweep_timeouts().await;
        self.broker_handle.abort();
        info!("runtime shut down");
    }
}
