//! Typed error taxonomy
//!
//! Gate failures are values returned to callers, never panics. Each rejection
//! names exactly one failing gate and the metric or threshold involved.

use rust_decimal::Decimal;
use serde::Serialize;

/// Which trade-limiter counter was breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitCounter {
    BotDaily,
    UserDaily,
    ExchangeBurst,
}

impl std::fmt::Display for LimitCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitCounter::BotDaily => write!(f, "max_trades_per_bot_daily"),
            LimitCounter::UserDaily => write!(f, "max_trades_per_user_daily"),
            LimitCounter::ExchangeBurst => write!(f, "burst_limit_orders_per_exchange"),
        }
    }
}

/// Containment kind reported by the circuit-breaker gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Containment {
    Paused,
    Quarantined,
}

impl std::fmt::Display for Containment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Containment::Paused => write!(f, "paused"),
            Containment::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Rejection from one of the four admission gates
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GateRejection {
    #[error("duplicate order: idempotency key {key} already exists")]
    DuplicateOrder { key: String },

    #[error("insufficient edge: expected {expected_edge_bps} bps < total cost {total_cost_bps} bps")]
    InsufficientEdge {
        expected_edge_bps: Decimal,
        total_cost_bps: Decimal,
    },

    #[error("limit exceeded: {counter} at {used}/{max}")]
    LimitExceeded {
        counter: LimitCounter,
        used: u32,
        max: u32,
    },

    #[error("circuit tripped: entity is {containment}")]
    CircuitTripped { containment: Containment },
}

impl GateRejection {
    /// Name of the failing gate, for rejection reporting
    pub fn gate_name(&self) -> &'static str {
        match self {
            GateRejection::DuplicateOrder { .. } => "idempotency",
            GateRejection::InsufficientEdge { .. } => "fee_coverage",
            GateRejection::LimitExceeded { .. } => "trade_limiter",
            GateRejection::CircuitTripped { .. } => "circuit_breaker",
        }
    }
}

/// Exchange submission failure with transient/permanent classification
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[error("exchange rejection: {message} (transient: {transient})")]
pub struct ExchangeError {
    pub message: String,
    pub transient: bool,
}

impl ExchangeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Why an order did not result in a fill
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderRejection {
    #[error(transparent)]
    Gate(#[from] GateRejection),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
}

/// Ledger write or verification failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger integrity: {0}")]
    Integrity(String),
}

/// Illegal bot lifecycle move; the state never changes on a rejected request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid transition: cannot {action} bot in {status} state")]
pub struct TransitionError {
    pub action: &'static str,
    pub status: String,
}
