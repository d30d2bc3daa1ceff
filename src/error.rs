//! Error taxonomy.
//!
//! Every component defines its own small error enum with a hand-written
//! [`std::fmt::Display`] and [`std::error::Error`] impl — no `thiserror`,
//! matching the rest of this crate's error handling. [`SimError`]
//! aggregates them for callers that cross component boundaries (the
//! `Runtime`'s public methods, mostly).

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetError {
    TurnCapExceeded { turn_cost: f64, cap: f64 },
    TotalCapExceeded { total_cost: f64, cap: f64 },
    RateLimited { requests_last_hour: u32, cap: u32 },
}

impl fmt::Display for BudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetError::TurnCapExceeded { turn_cost, cap } => {
                write!(f, "turn cost ${:.4} exceeds cap ${:.4}", turn_cost, cap)
            }
            BudgetError::TotalCapExceeded { total_cost, cap } => {
                write!(f, "total cost ${:.4} exceeds cap ${:.4}", total_cost, cap)
            }
            BudgetError::RateLimited {
                requests_last_hour,
                cap,
            } => write!(
                f,
                "{} requests in the last hour exceeds cap {}",
                requests_last_hour, cap
            ),
        }
    }
}

impl Error for BudgetError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Auth(String),
    RateLimit,
    Timeout,
    Server(u16),
    MalformedResponse(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "provider authentication failed: {}", msg),
            ProviderError::RateLimit => write!(f, "provider rate limit hit"),
            ProviderError::Timeout => write!(f, "provider call timed out"),
            ProviderError::Server(status) => write!(f, "provider server error (HTTP {})", status),
            ProviderError::MalformedResponse(msg) => {
                write!(f, "malformed provider response: {}", msg)
            }
        }
    }
}

impl Error for ProviderError {}

impl ProviderError {
    pub fn retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimit | ProviderError::Server(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimit => "rate_limit",
            ProviderError::Timeout => "timeout",
            ProviderError::Server(_) => "server",
            ProviderError::MalformedResponse(_) => "malformed_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    Budget(BudgetError),
    Provider(ProviderError),
    /// Retries inside the adapter were exhausted.
    LlmUnavailable,
    Timeout,
    Malformed(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Budget(e) => write!(f, "budget denied: {}", e),
            BrokerError::Provider(e) => write!(f, "provider error: {}", e),
            BrokerError::LlmUnavailable => write!(f, "llm unavailable after retries"),
            BrokerError::Timeout => write!(f, "request timed out waiting for a result"),
            BrokerError::Malformed(msg) => write!(f, "malformed batch response: {}", msg),
        }
    }
}

impl Error for BrokerError {}

impl From<BudgetError> for BrokerError {
    fn from(e: BudgetError) -> Self {
        BrokerError::Budget(e)
    }
}

impl From<ProviderError> for BrokerError {
    fn from(e: ProviderError) -> Self {
        BrokerError::Provider(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoherenceError {
    TemporalViolation(String),
    CoLocationViolation(String),
    PreconditionUnsatisfied(String),
    CorrectionFailed(String),
}

impl fmt::Display for CoherenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoherenceError::TemporalViolation(msg) => write!(f, "temporal violation: {}", msg),
            CoherenceError::CoLocationViolation(msg) => {
                write!(f, "co-location violation: {}", msg)
            }
            CoherenceError::PreconditionUnsatisfied(msg) => {
                write!(f, "precondition unsatisfied: {}", msg)
            }
            CoherenceError::CorrectionFailed(msg) => write!(f, "correction failed: {}", msg),
        }
    }
}

impl Error for CoherenceError {}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationError {
    UnknownSession(String),
    NotAParticipant(String),
    AlreadyTerminal(String),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::UnknownSession(id) => write!(f, "unknown negotiation session: {}", id),
            NegotiationError::NotAParticipant(id) => {
                write!(f, "{} is not a participant in this session", id)
            }
            NegotiationError::AlreadyTerminal(id) => {
                write!(f, "session {} is already in a terminal state", id)
            }
        }
    }
}

impl Error for NegotiationError {}

#[derive(Debug, Clone, PartialEq)]
pub enum DialogueError {
    NotFound(String),
}

impl fmt::Display for DialogueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogueError::NotFound(id) => write!(f, "dialogue not found: {}", id),
        }
    }
}

impl Error for DialogueError {}

/// Aggregate error surfaced at the `Runtime`'s public boundary. No
/// variant here ever corresponds to a panic escaping a turn: pipeline
/// panics are caught at the orchestrator and recorded, never converted
/// into a `SimError` that unwinds further.
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    Budget(BudgetError),
    Provider(ProviderError),
    Broker(BrokerError),
    Coherence(CoherenceError),
    Negotiation(NegotiationError),
    Dialogue(DialogueError),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Budget(e) => write!(f, "{}", e),
            SimError::Provider(e) => write!(f, "{}", e),
            SimError::Broker(e) => write!(f, "{}", e),
            SimError::Coherence(e) => write!(f, "{}", e),
            SimError::Negotiation(e) => write!(f, "{}", e),
            SimError::Dialogue(e) => write!(f, "{}", e),
        }
    }
}

impl Error for SimError {}

impl SimError {
    /// Stable category tag for metrics (`spec.md §7`: "metrics count each
    /// failure category separately").
    pub fn category(&self) -> &'static str {
        match self {
            SimError::Budget(_) => "budget_denied",
            SimError::Provider(e) => e.category(),
            SimError::Broker(BrokerError::LlmUnavailable) => "llm_unavailable",
            SimError::Broker(BrokerError::Timeout) => "timeout",
            SimError::Broker(_) => "broker_error",
            SimError::Coherence(_) => "coherence_failure",
            SimError::Negotiation(_) => "negotiation_error",
            SimError::Dialogue(_) => "dialogue_error",
        }
    }
}

macro_rules! impl_from_for_sim_error {
    ($variant:ident, $inner:ty) => {
        impl From<$inner> for SimError {
            fn from(e: $inner) -> Self {
                SimError::$variant(e)
            }
        }
    };
}

impl_from_for_sim_error!(Budget, BudgetError);
impl_from_for_sim_error!(Provider, ProviderError);
impl_from_for_sim_error!(Broker, BrokerError);
impl_from_for_sim_error!(Coherence, CoherenceError);
impl_from_for_sim_error!(Negotiation, NegotiationError);
impl_from_for_sim_error!(Dialogue, DialogueError);
