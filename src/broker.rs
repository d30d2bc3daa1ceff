//! LLM Broker (C4) — the hot path.
//!
//! A priority queue of pending requests, a background batching worker,
//! and a table of pending result handles. Generalizes a fan-out/join
//! pattern from "fan requests out to N agents, join all" to "drain a
//! priority queue, group by kind, dispatch one call per group."

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::budget::CostBudget;
use crate::cache::{CacheKey, ResponseCache};
use crate::error::BrokerError;
use crate::provider::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::types::Priority;

pub type RequestId = String;

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub kind: String,
    pub prompt: String,
    pub priority: Priority,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

impl LlmRequest {
    pub fn new(kind: impl Into<String>, prompt: impl Into<String>, priority: Priority) -> Self {
        LlmRequest {
            kind: kind.into(),
            prompt: prompt.into(),
            priority,
            temperature: 0.7,
            max_output_tokens: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub cost: f64,
    pub tokens: u64,
}

struct PendingRequest {
    id: RequestId,
    request: LlmRequest,
    responder: oneshot::Sender<Result<LlmResponse, BrokerError>>,
}

struct QueueEntry {
    priority: Priority,
    seq: u64,
    pending: PendingRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    /// `BinaryHeap` is a max-heap; we want the lowest `Priority` value
    /// (Critical) and the earliest `seq` popped first, so we order on
    /// `Reverse((priority, seq))`.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Reverse((self.priority, self.seq)).cmp(&Reverse((other.priority, other.seq)))
    }
}

static RESPONSE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\*\*Response\s+(\d+):\*\*\s*(.*?)(?=\*\*Response\s+\d+:|\z)").unwrap()
});

struct SharedState {
    queue: BinaryHeap<QueueEntry>,
}

/// Counters surfaced to a host's metrics snapshot (`spec.md §8` S5:
/// `batched_requests`, `successful_batches`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    pub batched_requests: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
}

/// The central batching scheduler. One instance shared (via `Arc`)
/// between submitters and the background worker task spawned by
/// [`Broker::spawn`].
pub struct Broker {
    budget: Arc<CostBudget>,
    cache: Arc<ResponseCache>,
    provider: Arc<dyn ProviderAdapter>,
    cost_per_1k_tokens: f64,
    max_batch_size: usize,
    batch_timeout: Duration,
    wait_timeout: Duration,
    seq: AtomicU64,
    state: Mutex<SharedState>,
    wake: mpsc::UnboundedSender<()>,
    batched_requests: AtomicU64,
    successful_batches: AtomicU64,
    failed_batches: AtomicU64,
}

impl Broker {
    pub fn new(
        budget: Arc<CostBudget>,
        cache: Arc<ResponseCache>,
        provider: Arc<dyn ProviderAdapter>,
        cost_per_1k_tokens: f64,
        max_batch_size: usize,
        batch_timeout: Duration,
        wait_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Broker {
            budget,
            cache,
            provider,
            cost_per_1k_tokens,
            max_batch_size,
            batch_timeout,
            wait_timeout,
            seq: AtomicU64::new(0),
            state: Mutex::new(SharedState {
                queue: BinaryHeap::new(),
            }),
            wake,
            batched_requests: AtomicU64::new(0),
            successful_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });
        (broker, wake_rx)
    }

    /// Batching counters for a host's metrics snapshot.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            batched_requests: self.batched_requests.load(Ordering::SeqCst),
            successful_batches: self.successful_batches.load(Ordering::SeqCst),
            failed_batches: self.failed_batches.load(Ordering::SeqCst),
        }
    }

    /// Spawns the background batching loop. Returns a handle the
    /// `Runtime` holds to abort it on shutdown.
    pub fn spawn(self: &Arc<Self>, mut wake_rx: mpsc::UnboundedReceiver<()>) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(broker.batch_timeout) => {}
                    woken = wake_rx.recv() => {
                        if woken.is_none() {
                            break;
                        }
                    }
                }
                broker.drain_and_dispatch().await;
            }
        })
    }

    /// Submits a request. Critical priority, or High priority when the
    /// queue is shallow (depth < 2), bypasses the queue and is served
    /// immediately on the caller's task.
    pub async fn submit(&self, request: LlmRequest) -> Result<LlmResponse, BrokerError> {
        if !self.budget.rate_allows().await {
            return Err(BrokerError::Budget(crate::error::BudgetError::RateLimited {
                requests_last_hour: self.budget.requests_last_hour().await,
                cap: self.budget.max_requests_per_hour(),
            }));
        }

        let estimated_tokens = crate::provider::estimate_tokens(&request.prompt) + request.max_output_tokens as u64;
        let estimated_cost = (estimated_tokens as f64 / 1000.0) * self.cost_per_1k_tokens;
        if !self.budget.allows(estimated_cost).await {
            let snapshot = self.budget.snapshot().await;
            let err = if snapshot.remaining_total_budget < estimated_cost {
                crate::error::BudgetError::TotalCapExceeded {
                    total_cost: snapshot.total_cost + estimated_cost,
                    cap: snapshot.total_cost + snapshot.remaining_total_budget,
                }
            } else {
                crate::error::BudgetError::TurnCapExceeded {
                    turn_cost: snapshot.turn_cost + estimated_cost,
                    cap: snapshot.turn_cost + snapshot.remaining_turn_budget,
                }
            };
            return Err(BrokerError::Budget(err));
        }

        let depth = self.state.lock().await.queue.len();
        if request.priority == Priority::Critical
            || (request.priority == Priority::High && depth < 2)
        {
            return self.dispatch_group(request.kind.clone(), vec![request]).await.pop().unwrap();
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}_{}", request.kind, seq);
        {
            let mut state = self.state.lock().await;
            state.queue.push(QueueEntry {
                priority: request.priority,
                seq,
                pending: PendingRequest {
                    id,
                    request,
                    responder: tx,
                },
            });
        }
        let _ = self.wake.send(());

        match tokio::time::timeout(self.wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Timeout),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn drain_and_dispatch(&self) {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock().await;
            let mut out = Vec::new();
            while out.len() < self.max_batch_size {
                match state.queue.pop() {
                    Some(entry) => out.push(entry.pending),
                    None => break,
                }
            }
            out
        };
        if drained.is_empty() {
            return;
        }

        let mut groups: HashMap<String, Vec<PendingRequest>> = HashMap::new();
        for pending in drained {
            groups.entry(pending.request.kind.clone()).or_default().push(pending);
        }

        for (kind, group) in groups {
            let requests: Vec<LlmRequest> = group.iter().map(|p| p.request.clone()).collect();
            let ids: Vec<RequestId> = group.iter().map(|p| p.id.clone()).collect();
            self.batched_requests.fetch_add(requests.len() as u64, Ordering::SeqCst);
            let results = self.dispatch_group(kind, requests).await;
            if results.iter().all(|r| r.is_ok()) {
                self.successful_batches.fetch_add(1, Ordering::SeqCst);
            } else {
                self.failed_batches.fetch_add(1, Ordering::SeqCst);
            }
            for ((_, result), pending) in ids.into_iter().zip(results).zip(group) {
                let _ = pending.responder.send(result);
            }
        }
    }

    /// Dispatches one provider call for a same-kind group and returns
    /// one result per request, in the same order as `requests`.
    async fn dispatch_group(
        &self,
        kind: String,
        requests: Vec<LlmRequest>,
    ) -> Vec<Result<LlmResponse, BrokerError>> {
        let n = requests.len();
        let prompt = build_batch_prompt(&kind, &requests);
        let temperature = requests.first().map(|r| r.temperature).unwrap_or(0.7);
        let max_tokens: u32 = requests.iter().map(|r| r.max_output_tokens).sum();

        let cache_key = CacheKey::new(&prompt, self.provider.model_name(), temperature, "text");
        let provider = self.provider.clone();
        let provider_request = ProviderRequest::new(prompt.clone())
            .with_temperature(temperature)
            .with_max_output_tokens(max_tokens);

        let call_result: Result<ProviderResponse, crate::error::ProviderError> = self
            .cache
            .get_or_fetch(cache_key, move || async move { provider.call(provider_request).await })
            .await;

        let response = match call_result {
            Ok(response) => response,
            Err(e) => {
                let err = BrokerError::from(e);
                return vec![Err(err); n];
            }
        };

        let total_tokens = response.prompt_tokens + response.completion_tokens;
        let total_cost = (total_tokens as f64 / 1000.0) * self.cost_per_1k_tokens;
        if let Err(e) = self.budget.charge(&kind, total_cost, total_tokens).await {
            let err = BrokerError::from(e);
            return vec![Err(err); n];
        }

        let per_request_cost = total_cost / n as f64;
        let per_request_tokens = total_tokens / n as u64;

        let segments = split_batch_response(&response.content, n);
        segments
            .into_iter()
            .map(|segment| match segment {
                Some(content) => Ok(LlmResponse {
                    content,
                    cost: per_request_cost,
                    tokens: per_request_tokens,
                }),
                None => Err(BrokerError::Malformed(format!(
                    "batch of {n} requests produced fewer than {n} response segments"
                ))),
            })
            .collect()
    }
}

/// `## Request N (ID: …)` sections followed by a response-format
/// instruction naming `**Response N:** …`.
fn build_batch_prompt(kind: &str, requests: &[LlmRequest]) -> String {
    let mut prompt = format!("You will answer {} related \"{kind}\" requests.\n\n", requests.len());
    for (i, request) in requests.iter().enumerate() {
        prompt.push_str(&format!("## Request {} (ID: {kind}_{i})\n{}\n\n", i + 1, request.prompt));
    }
    prompt.push_str(&format!(
        "Respond to each request in turn using exactly this format, one block per request:\n\
         **Response N:** <your answer to request N>\n\
         Produce all {} responses.\n",
        requests.len()
    ));
    prompt
}

/// Splits a batch response into `n` ordered segments using the numbered
/// `**Response N:**` markers. A `None` at index `i` means the response
/// had no matching segment for request `i` (a short or malformed
/// batch), which the caller turns into `BrokerError::Malformed`.
fn split_batch_response(content: &str, n: usize) -> Vec<Option<String>> {
    let mut found: HashMap<usize, String> = HashMap::new();
    for capture in RESPONSE_MARKER.captures_iter(content) {
        if let (Some(index), Some(text)) = (capture.get(1), capture.get(2)) {
            if let Ok(i) = index.as_str().parse::<usize>() {
                if i >= 1 && i <= n {
                    found.insert(i - 1, text.as_str().trim().to_string());
                }
            }
        }
    }
    (0..n).map(|i| found.remove(&i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockProvider;

    fn make_broker(provider: MockProvider) -> Arc<Broker> {
        let budget = Arc::new(CostBudget::new(10.0, 100.0, 1000));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
        let (broker, _wake_rx) = Broker::new(
            budget,
            cache,
            Arc::new(provider),
            0.001,
            5,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        broker
    }

    #[test]
    fn split_batch_response_recovers_all_segments() {
        let content = "**Response 1:** hello\n**Response 2:** world\n";
        let segments = split_batch_response(content, 2);
        assert_eq!(segments, vec![Some("hello".to_string()), Some("world".to_string())]);
    }

    #[test]
    fn split_batch_response_reports_missing_suffix() {
        let content = "**Response 1:** only one\n";
        let segments = split_batch_response(content, 2);
        assert_eq!(segments[0], Some("only one".to_string()));
        assert_eq!(segments[1], None);
    }

    #[tokio::test]
    async fn over_budget_submission_is_denied_before_any_provider_call_or_cache_fill() {
        let budget = Arc::new(CostBudget::new(0.0001, 10.0, 1000));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 100));
        let provider = Arc::new(MockProvider::new("**Response 1:** ok"));
        let (broker, _wake_rx) = Broker::new(
            budget,
            cache.clone(),
            provider.clone(),
            1.0,
            5,
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        let result = broker
            .submit(LlmRequest::new("dialogue", "hello there", Priority::Critical))
            .await;
        assert!(matches!(result, Err(BrokerError::Budget(_))));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn critical_request_bypasses_the_queue() {
        let broker = make_broker(MockProvider::new("**Response 1:** ok"));
        let response = broker
            .submit(LlmRequest::new("dialogue", "hi", Priority::Critical))
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn queued_requests_are_batched_and_split() {
        let broker = make_broker(MockProvider::new(
            "**Response 1:** first\n**Response 2:** second\n",
        ));
        let (broker_a, broker_b) = (broker.clone(), broker.clone());
        let a = tokio::spawn(async move { broker_a.submit(LlmRequest::new("dialogue", "a", Priority::Normal)).await });
        let b = tokio::spawn(async move { broker_b.submit(LlmRequest::new("dialogue", "b", Priority::Normal)).await });
        broker.drain_and_dispatch().await;
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        let mut contents = vec![ra.unwrap().content, rb.unwrap().content];
        contents.sort();
        assert_eq!(contents, vec!["first".to_string(), "second".to_string()]);

        let stats = broker.stats();
        assert_eq!(stats.batched_requests, 2);
        assert_eq!(stats.successful_batches, 1);
    }
}
