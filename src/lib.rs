//! Trade Governor Library
//!
//! Ledger-guarded order admission and bot-lifecycle engine for a fleet of
//! trading bots: every unit of capital is accounted for exactly once, no bot
//! trades past its configured limits, and losing bots are contained before
//! they exhaust capital.

pub mod allocator;
pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod state;

// Re-export main types for convenience
pub use allocator::{AllocationOutcome, AllocationResult, CapitalAllocator};
pub use breaker::{BreakerEngine, BreakerEntity, BreakerMetrics, CircuitBreakerRecord};
pub use config::GovernorConfig;
pub use engine::{Governor, PortfolioSummary, SubmitOutcome};
pub use error::{
    Containment, ExchangeError, GateRejection, LedgerError, LimitCounter, OrderRejection,
    TransitionError,
};
pub use events::{EngineEvent, EventBus};
pub use exchange::{ExchangeConnector, ExchangeFill, OrderTicket, OrderType, PaperExchange, Side};
pub use ledger::{Fill, LedgerEvent, LedgerEventKind, LedgerStore};
pub use lifecycle::{BotRegistry, BotState, BotStatus};
pub use pipeline::{AdmissionPipeline, OrderRequest, PendingStatus};
