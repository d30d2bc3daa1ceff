//! End-to-end scenarios exercising the composed `Runtime` rather than a
//! single component: each test stands up a full object under test and
//! drives it through one realistic sequence.

use std::time::Duration;

use weft::broker::{Broker, LlmRequest};
use weft::budget::CostBudget;
use weft::cache::ResponseCache;
use weft::clients::mock::MockProvider;
use weft::config::Config;
use weft::dialogue::{CommunicationType, DialogueContext};
use weft::negotiation::ResponseKind;
use weft::orchestrator::AgentTurnInput;
use weft::pipeline::actions::{ActionCategory, CandidateAction};
use weft::pipeline::threat::ThreatInputs;
use weft::runtime::Runtime;
use weft::types::{AgentState, Event, Priority};

fn candidate(id: &str) -> CandidateAction {
    CandidateAction {
        id: id.to_string(),
        category: ActionCategory::Exploration,
        criteria_scores: [0.5; 8],
    }
}

/// A single agent with neutral decision weights and no outstanding
/// threat should pick one of its offered candidates in well under a
/// second, and the orchestrator should report exactly one completed
/// turn with no per-agent errors.
#[tokio::test]
async fn single_agent_trivial_turn_completes_fast_with_one_of_its_candidates() {
    let runtime = Runtime::with_mock_provider(Config::default(), "**Response 1:** a quiet moment passes");

    let agent = AgentState::new("alpha", "wanderers");
    let candidates = vec![candidate("wait"), candidate("observe"), candidate("explore")];
    let agents = vec![AgentTurnInput {
        agent,
        recent_events: vec![Event::new("observe", Some("alpha".to_string()))],
        threat_inputs: ThreatInputs::default(),
        candidates,
    }];

    let result = runtime.run_turn(agents).await;

    assert_eq!(result.agent_results.len(), 1);
    let decided = &result.agent_results[0];
    assert!(decided.error.is_none());
    let action_id = decided.decision.as_ref().unwrap().action_id.as_str();
    assert!(["wait", "observe", "explore"].contains(&action_id));
    assert!(result.elapsed < Duration::from_secs(1));

    runtime.shutdown().await;
}

/// A per-turn cost cap tight enough that only a handful of
/// normal-priority requests fit: the submission that would cross the
/// cap is denied, and so is every submission after it — the cap is not
/// reset mid-turn.
#[tokio::test]
async fn budget_cap_denies_the_crossing_submission_and_every_one_after() {
    let budget = std::sync::Arc::new(CostBudget::new(0.01, 10.0, 1000));
    let cache = std::sync::Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
    let (broker, wake_rx) = Broker::new(
        budget,
        cache,
        std::sync::Arc::new(MockProvider::new("**Response 1:** acknowledged")),
        0.01,
        5,
        Duration::from_millis(10),
        Duration::from_secs(5),
    );
    broker.clone().spawn(wake_rx);

    let mut denied_from = None;
    for i in 0..10 {
        let body = "x".repeat(800);
        let result = broker
            .submit(LlmRequest::new("dialogue", body, Priority::Critical))
            .await;
        if result.is_err() {
            denied_from = Some(i);
            break;
        }
    }

    let first_denied = denied_from.expect("a submission should eventually cross the per-turn cap");

    // Every submission after the first denial is also denied: the cap
    // does not reset mid-turn, and a failed charge still counted
    // against turn_cost.
    for _ in 0..3 {
        let body = "x".repeat(800);
        let result = broker
            .submit(LlmRequest::new("dialogue", body, Priority::Critical))
            .await;
        assert!(result.is_err(), "submissions after the crossing one must stay denied this turn");
    }
    assert!(first_denied < 10);
}

/// Two agents claiming the same thing happen to be in conflict; once a
/// negotiation session opens over it, it reaches a terminal status
/// within its round cap even when responses keep countering each other.
#[tokio::test]
async fn territorial_dispute_negotiation_reaches_a_terminal_status() {
    let runtime = Runtime::with_mock_provider(Config::default(), "**Response 1:** a compromise is reached");

    let session_id = runtime
        .negotiation
        .initiate(
            "alice",
            vec!["bob".to_string()],
            "conflict_resolution_territorial_dispute",
            std::collections::HashMap::new(),
        )
        .await;

    let proposal_id = runtime
        .negotiation
        .latest_proposal_id(&session_id)
        .await
        .expect("a freshly initiated session has an open proposal");

    let status = runtime
        .negotiation
        .respond(&proposal_id, "bob", ResponseKind::Accept, std::collections::HashMap::new(), None)
        .await
        .unwrap();

    assert!(status.is_terminal());
    let final_status = runtime.negotiation.session_status(&session_id).await.unwrap();
    assert_eq!(final_status, status);

    runtime.shutdown().await;
}

/// With the fast-mode threshold set above the time actually remaining,
/// a dialogue step must fall back to its canned outcome without ever
/// calling the provider.
#[tokio::test]
async fn dialogue_falls_back_to_fast_mode_when_time_is_short() {
    let provider = std::sync::Arc::new(MockProvider::new("**Response 1:** should never be read"));
    let budget = std::sync::Arc::new(CostBudget::new(10.0, 100.0, 1000));
    let cache = std::sync::Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
    let (broker, wake_rx) = Broker::new(budget, cache, provider.clone(), 0.001, 5, Duration::from_millis(10), Duration::from_secs(5));
    broker.clone().spawn(wake_rx);

    let manager = weft::dialogue::DialogueManager::new(broker, 100);
    let id = manager
        .start("alice", vec!["bob".to_string()], CommunicationType::Collaboration)
        .await;

    // fast_mode_threshold_seconds = 4.0, but only 2.0s remain.
    manager
        .advance(&id, &DialogueContext::default(), Duration::from_secs_f64(2.0), 1.0, false)
        .await
        .unwrap();

    let dialogue = manager.get(&id).await.unwrap();
    assert_eq!(dialogue.outcome.as_deref(), Some("Agreed to work together"));
    assert_eq!(provider.call_count(), 0);
}

/// Five same-kind normal-priority requests submitted together land in
/// one batch window and come back in the order they were submitted.
#[tokio::test]
async fn batched_requests_are_delivered_in_submission_order() {
    let budget = std::sync::Arc::new(CostBudget::new(10.0, 100.0, 1000));
    let cache = std::sync::Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
    let (broker, wake_rx) = Broker::new(
        budget,
        cache,
        std::sync::Arc::new(MockProvider::new(
            "**Response 1:** r1\n**Response 2:** r2\n**Response 3:** r3\n**Response 4:** r4\n**Response 5:** r5\n",
        )),
        0.001,
        5,
        Duration::from_millis(200),
        Duration::from_secs(5),
    );
    broker.clone().spawn(wake_rx);

    let mut handles = Vec::new();
    for i in 1..=5 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            broker
                .submit(LlmRequest::new("coordination", format!("request {i}"), Priority::Normal))
                .await
        }));
    }
    // Give every submission a chance to land in the queue, then let the
    // background worker's own batch_timeout fire the dispatch.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut responses = Vec::with_capacity(5);
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap().content);
    }
    assert_eq!(responses, vec!["r1", "r2", "r3", "r4", "r5"]);

    let stats = broker.stats();
    assert_eq!(stats.batched_requests, 5);
    assert_eq!(stats.successful_batches, 1);
}
