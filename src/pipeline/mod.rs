//! Order Admission Pipeline
//!
//! Every order passes four gates in a fixed order: idempotency, fee
//! coverage, trade limiter, circuit breaker. The first failing gate aborts
//! with a typed rejection; nothing after it runs. Only a fully admitted
//! order reaches the exchange, and only an exchange fill reaches the ledger.

mod limits;
mod pending;

pub use limits::{LimitsUsage, TradeLimiter};
pub use pending::{PendingOrder, PendingOrderStore, PendingStatus};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerEngine, BreakerEntity};
use crate::config::{ExecutionConfig, FeeConfig, LimitsConfig};
use crate::error::{Containment, GateRejection, OrderRejection};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{ExchangeConnector, OrderTicket, OrderType, Side};
use crate::ledger::{Fill, LedgerStore};
use crate::lifecycle::{BotRegistry, BotStatus};
use crate::metrics::{names, MetricsCollector};

/// Order proposed by a trading loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub order_type: OrderType,
    pub idempotency_key: String,
    /// Caller-predicted edge in basis points, checked against total costs
    pub expected_edge_bps: Decimal,
    pub is_paper: bool,
}

/// A fully admitted, executed order
#[derive(Debug, Clone)]
pub struct AdmittedOrder {
    pub order_id: Uuid,
    pub fill: Fill,
}

/// The four-gate admission pipeline
pub struct AdmissionPipeline {
    fees: FeeConfig,
    exchange_timeout: Duration,
    pending: PendingOrderStore,
    limiter: TradeLimiter,
    ledger: Arc<LedgerStore>,
    registry: Arc<BotRegistry>,
    breaker: Arc<BreakerEngine>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl AdmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fees: FeeConfig,
        limits: LimitsConfig,
        execution: &ExecutionConfig,
        ledger: Arc<LedgerStore>,
        registry: Arc<BotRegistry>,
        breaker: Arc<BreakerEngine>,
        events: EventBus,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            fees,
            exchange_timeout: Duration::from_secs(execution.exchange_timeout_secs),
            pending: PendingOrderStore::new(),
            limiter: TradeLimiter::new(limits),
            ledger,
            registry,
            breaker,
            events,
            metrics,
        }
    }

    /// Run an order through the gates and, on a full pass, the exchange
    pub async fn submit(
        &self,
        req: OrderRequest,
        connector: &dyn ExchangeConnector,
    ) -> Result<AdmittedOrder, OrderRejection> {
        // Gate 1: idempotency - atomic insert-if-absent
        if let Err(rejection) = self
            .pending
            .try_insert(&req.idempotency_key, req.bot_id, req.user_id)
            .await
        {
            self.metrics
                .increment(names::ORDERS_REJECTED_IDEMPOTENCY, 1)
                .await;
            return Err(rejection.into());
        }

        // Gate 2: fee coverage - no side effects beyond the pending record
        let total_cost_bps = self.fees.total_cost_bps(&req.exchange, &req.symbol);
        if req.expected_edge_bps < total_cost_bps {
            let rejection = GateRejection::InsufficientEdge {
                expected_edge_bps: req.expected_edge_bps,
                total_cost_bps,
            };
            self.reject(&req, names::ORDERS_REJECTED_FEE_COVERAGE, &rejection)
                .await;
            return Err(rejection.into());
        }

        // Gate 3: trade limiter - atomic check-and-increment
        let active_bots = self.registry.active_bots_on_exchange(&req.exchange).await;
        if let Err(rejection) = self
            .limiter
            .check_and_admit(req.bot_id, req.user_id, &req.exchange, active_bots, Utc::now())
            .await
        {
            self.reject(&req, names::ORDERS_REJECTED_LIMITER, &rejection)
                .await;
            return Err(rejection.into());
        }

        // Gate 4: circuit breaker - fresh state, last gate before submission
        if let Some(containment) = self.containment_for(&req).await {
            let rejection = GateRejection::CircuitTripped { containment };
            self.reject(&req, names::ORDERS_REJECTED_BREAKER, &rejection)
                .await;
            return Err(rejection.into());
        }

        self.pending
            .transition(&req.idempotency_key, PendingStatus::Submitted, None)
            .await
            .ok();

        let order_id = Uuid::new_v4();
        let ticket = OrderTicket {
            symbol: req.symbol.clone(),
            side: req.side,
            amount: req.amount,
            order_type: req.order_type,
        };

        let submitted = tokio::time::timeout(self.exchange_timeout, connector.submit_order(&ticket))
            .await
            .unwrap_or_else(|_| {
                Err(crate::error::ExchangeError::transient(
                    "exchange submission timed out",
                ))
            });

        match submitted {
            Ok(exec) => {
                let fill = Fill {
                    id: Uuid::new_v4(),
                    user_id: req.user_id,
                    bot_id: req.bot_id,
                    exchange: req.exchange.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    amount: exec.amount,
                    price: exec.price,
                    fee: exec.fee,
                    fee_currency: exec.fee_currency.clone(),
                    order_id,
                    idempotency_key: req.idempotency_key.clone(),
                    is_paper: req.is_paper,
                    timestamp: Utc::now(),
                };

                self.ledger.append_fill(fill.clone()).await?;
                self.pending
                    .transition(&req.idempotency_key, PendingStatus::Filled, None)
                    .await
                    .ok();
                self.metrics.increment(names::ORDERS_ADMITTED, 1).await;

                info!(
                    "Order {} filled: bot {} {} {} {} @ {}",
                    order_id, req.bot_id, req.side, exec.amount, req.symbol, exec.price
                );

                self.events.emit(EngineEvent::TradeExecuted {
                    user_id: req.user_id,
                    bot_id: req.bot_id,
                    order_id,
                    exchange: req.exchange.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    amount: exec.amount,
                    price: exec.price,
                    fee: exec.fee,
                });

                let summary = self.ledger.summary(req.user_id).await;
                self.events.emit(EngineEvent::ProfitUpdated {
                    user_id: req.user_id,
                    realized_pnl: summary.realized_pnl,
                    equity: summary.equity,
                });

                Ok(AdmittedOrder { order_id, fill })
            }
            Err(err) => {
                // External failure: mark the order failed, never touch the
                // ledger. The caller retries with a new idempotency key.
                warn!(
                    "Order for bot {} failed at exchange {}: {}",
                    req.bot_id, req.exchange, err
                );
                self.pending
                    .transition(
                        &req.idempotency_key,
                        PendingStatus::Failed,
                        Some(&err.to_string()),
                    )
                    .await
                    .ok();
                self.breaker.record_error(req.bot_id).await;
                self.metrics.increment(names::ORDERS_FAILED_EXCHANGE, 1).await;
                Err(err.into())
            }
        }
    }

    /// Fresh containment check: bot lifecycle status plus the user-level
    /// breaker record, read at admission time
    async fn containment_for(&self, req: &OrderRequest) -> Option<Containment> {
        match self.registry.status(req.bot_id).await {
            Some(BotStatus::Active) => {}
            Some(BotStatus::Quarantined) => return Some(Containment::Quarantined),
            // Paused, never-started, stopped, or unknown bots do not trade
            _ => return Some(Containment::Paused),
        }
        if self
            .breaker
            .is_tripped(BreakerEntity::User(req.user_id))
            .await
        {
            return Some(Containment::Quarantined);
        }
        None
    }

    /// Cancel the pending order a failed gate leaves behind
    async fn reject(&self, req: &OrderRequest, counter: &str, rejection: &GateRejection) {
        self.pending
            .transition(
                &req.idempotency_key,
                PendingStatus::Cancelled,
                Some(&rejection.to_string()),
            )
            .await
            .ok();
        self.metrics.increment(counter, 1).await;
    }

    pub async fn pending_order(&self, idempotency_key: &str) -> Option<PendingOrder> {
        self.pending.get(idempotency_key).await
    }

    pub async fn bot_limits_usage(&self, bot_id: Uuid) -> LimitsUsage {
        self.limiter.bot_usage(bot_id, Utc::now()).await
    }

    pub async fn user_limits_usage(&self, user_id: Uuid) -> LimitsUsage {
        self.limiter.user_usage(user_id, Utc::now()).await
    }
}
