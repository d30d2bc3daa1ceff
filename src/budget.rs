//! Cost & Budget Meters (C1).
//!
//! Tracks per-turn and total monetary cost, per-kind token/cost/request
//! counters, and a sliding request-rate window. `charge` always records
//! the charge first and evaluates the cap second — that ordering is what
//! lets exactly one crossing request through per turn (Testable Property
//! 1) instead of silently rejecting the request whose cost would tip the
//! balance.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::BudgetError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostStats {
    pub cost: f64,
    pub tokens: u64,
    pub requests: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub turn_cost: f64,
    pub total_cost: f64,
    pub remaining_turn_budget: f64,
    pub remaining_total_budget: f64,
    pub by_kind: HashMap<String, CostStats>,
}

impl BudgetSnapshot {
    /// Cost efficiency metrics derived from the per-kind maps — ambient
    /// telemetry, read-only, no caller in the turn sequence depends on it.
    pub fn cost_per_token_by_kind(&self) -> HashMap<String, f64> {
        self.by_kind
            .iter()
            .filter(|(_, s)| s.tokens > 0)
            .map(|(k, s)| (k.clone(), s.cost / s.tokens as f64))
            .collect()
    }

    pub fn avg_cost_per_request_by_kind(&self) -> HashMap<String, f64> {
        self.by_kind
            .iter()
            .filter(|(_, s)| s.requests > 0)
            .map(|(k, s)| (k.clone(), s.cost / s.requests as f64))
            .collect()
    }
}

struct Inner {
    turn_cost: f64,
    total_cost: f64,
    by_kind: HashMap<String, CostStats>,
    request_times: VecDeque<Instant>,
}

/// Guards short critical sections (single counter update, single deque
/// push) with a `tokio::sync::Mutex`, per the concurrency model's
/// "atomic counter updates" shared-resource policy.
pub struct CostBudget {
    max_cost_per_turn: f64,
    max_total_cost: f64,
    max_requests_per_hour: u32,
    inner: Mutex<Inner>,
}

impl CostBudget {
    pub fn new(max_cost_per_turn: f64, max_total_cost: f64, max_requests_per_hour: u32) -> Self {
        CostBudget {
            max_cost_per_turn,
            max_total_cost,
            max_requests_per_hour,
            inner: Mutex::new(Inner {
                turn_cost: 0.0,
                total_cost: 0.0,
                by_kind: HashMap::new(),
                request_times: VecDeque::new(),
            }),
        }
    }

    /// Resets `turn_cost` only; `total_cost` persists across turns.
    pub async fn start_turn(&self) {
        self.inner.lock().await.turn_cost = 0.0;
    }

    /// Records the charge unconditionally, then reports whether the
    /// result is still within budget. A `false` return does not undo the
    /// charge: the caller (the Broker) treats it as "deny further
    /// requests this turn," not "this charge never happened."
    pub async fn charge(&self, kind: &str, cost: f64, tokens: u64) -> Result<(), BudgetError> {
        let mut inner = self.inner.lock().await;
        inner.turn_cost += cost;
        inner.total_cost += cost;

        let entry = inner.by_kind.entry(kind.to_string()).or_default();
        entry.cost += cost;
        entry.tokens += tokens;
        entry.requests += 1;

        inner.request_times.push_back(Instant::now());

        if inner.turn_cost > self.max_cost_per_turn {
            warn!(
                "turn cost exceeded: ${:.4} > ${:.4}",
                inner.turn_cost, self.max_cost_per_turn
            );
            return Err(BudgetError::TurnCapExceeded {
                turn_cost: inner.turn_cost,
                cap: self.max_cost_per_turn,
            });
        }
        if inner.total_cost > self.max_total_cost {
            warn!(
                "total cost exceeded: ${:.4} > ${:.4}",
                inner.total_cost, self.max_total_cost
            );
            return Err(BudgetError::TotalCapExceeded {
                total_cost: inner.total_cost,
                cap: self.max_total_cost,
            });
        }
        Ok(())
    }

    /// Pure: does not mutate any counter. Checks both the projected turn
    /// cost and the projected total cost against their caps.
    pub async fn allows(&self, estimated_additional_cost: f64) -> bool {
        let inner = self.inner.lock().await;
        let projected_turn = inner.turn_cost + estimated_additional_cost;
        let projected_total = inner.total_cost + estimated_additional_cost;
        projected_turn <= self.max_cost_per_turn && projected_total <= self.max_total_cost
    }

    /// True when fewer than `max_requests_per_hour` submissions fall in
    /// the last 60 minutes. Prunes timestamps older than the window
    /// lazily, on read, rather than scanning an ever-growing history.
    pub async fn rate_allows(&self) -> bool {
        self.requests_last_hour().await < self.max_requests_per_hour
    }

    /// Submissions recorded in the last 60 minutes, after pruning stale
    /// timestamps. Exposed so a caller denying a request on
    /// [`rate_allows`](Self::rate_allows) can report the actual count
    /// rather than a placeholder.
    pub async fn requests_last_hour(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        let cutoff = Instant::now() - Duration::from_secs(3600);
        while matches!(inner.request_times.front(), Some(t) if *t < cutoff) {
            inner.request_times.pop_front();
        }
        inner.request_times.len() as u32
    }

    pub fn max_requests_per_hour(&self) -> u32 {
        self.max_requests_per_hour
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().await;
        BudgetSnapshot {
            turn_cost: inner.turn_cost,
            total_cost: inner.total_cost,
            remaining_turn_budget: (self.max_cost_per_turn - inner.turn_cost).max(0.0),
            remaining_total_budget: (self.max_total_cost - inner.total_cost).max(0.0),
            by_kind: inner.by_kind.clone(),
        }
    }

    /// Restores `turn_cost`/`total_cost`/per-kind stats in place from a
    /// snapshot, for the host boundary's persisted-state round trip
    /// (`spec.md §6.3`). The hourly rate window is not part of the
    /// snapshot and restarts empty: a window time-shifted by however
    /// long the snapshot/restore cycle took would not mean anything once
    /// replayed into a new process.
    pub async fn restore_into(&self, snapshot: &BudgetSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.turn_cost = snapshot.turn_cost;
        inner.total_cost = snapshot.total_cost;
        inner.by_kind = snapshot.by_kind.clone();
        inner.request_times.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn charge_allows_exactly_one_crossing_request() {
        let budget = CostBudget::new(0.10, 1.0, 100);
        for _ in 0..9 {
            assert!(budget.charge("dialogue", 0.01, 10).await.is_ok());
        }
        // 9 * 0.01 = 0.09, still under 0.10; the 10th crosses it.
        let result = budget.charge("dialogue", 0.02, 10).await;
        assert!(result.is_err());
        let snapshot = budget.snapshot().await;
        assert!(snapshot.turn_cost > 0.10);
    }

    #[tokio::test]
    async fn start_turn_resets_only_turn_cost() {
        let budget = CostBudget::new(0.10, 1.0, 100);
        budget.charge("dialogue", 0.05, 10).await.unwrap();
        budget.start_turn().await;
        let snapshot = budget.snapshot().await;
        assert_eq!(snapshot.turn_cost, 0.0);
        assert_eq!(snapshot.total_cost, 0.05);
    }

    #[tokio::test]
    async fn allows_is_pure() {
        let budget = CostBudget::new(0.10, 1.0, 100);
        assert!(budget.allows(0.05).await);
        assert!(!budget.allows(0.20).await);
        // Neither call should have mutated any counter.
        let snapshot = budget.snapshot().await;
        assert_eq!(snapshot.turn_cost, 0.0);
    }

    #[tokio::test]
    async fn restore_into_rebuilds_cost_counters() {
        let budget = CostBudget::new(1.0, 10.0, 100);
        budget.charge("dialogue", 0.3, 100).await.unwrap();
        let snapshot = budget.snapshot().await;

        let restored = CostBudget::new(1.0, 10.0, 100);
        restored.restore_into(&snapshot).await;
        let restored_snapshot = restored.snapshot().await;
        assert_eq!(restored_snapshot.turn_cost, 0.3);
        assert_eq!(restored_snapshot.total_cost, 0.3);
        assert_eq!(restored_snapshot.by_kind["dialogue"].requests, 1);
    }

    #[tokio::test]
    async fn rate_allows_respects_hourly_cap() {
        let budget = CostBudget::new(10.0, 100.0, 2);
        assert!(budget.rate_allows().await);
        budget.charge("dialogue", 0.01, 1).await.unwrap();
        assert!(budget.rate_allows().await);
        budget.charge("dialogue", 0.01, 1).await.unwrap();
        assert!(!budget.rate_allows().await);
    }
}
