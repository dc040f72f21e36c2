//! Governor - the engine facade
//!
//! Wires the ledger, admission pipeline, circuit breaker, lifecycle
//! registry, and capital allocator together, and runs the scheduled tasks.
//! This is the surface the API layer, schedulers, and admin tooling call.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::allocator::{AllocationResult, CapitalAllocator};
use crate::breaker::{BreakerEngine, BreakerEntity, BreakerMetrics, TripSeverity};
use crate::config::GovernorConfig;
use crate::error::{OrderRejection, TransitionError};
use crate::events::{EngineEvent, EventBus, EventEnvelope};
use crate::exchange::ExchangeConnector;
use crate::ledger::{
    IntegrityReport, LedgerEvent, LedgerStore, ReconciliationReport, UserSummary,
};
use crate::lifecycle::{BotRegistry, BotState, BotStatus, BulkOutcome};
use crate::metrics::{names, MetricsCollector};
use crate::pipeline::{AdmissionPipeline, LimitsUsage, OrderRequest};

/// Result shape returned to order-submitting callers
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub success: bool,
    pub order_id: Option<Uuid>,
    pub gate_failed: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Ledger-derived portfolio summary for one user
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub fees_total: Decimal,
    pub unrealized_pnl: Decimal,
    pub drawdown_current_pct: Decimal,
    pub drawdown_max_pct: Decimal,
}

impl From<UserSummary> for PortfolioSummary {
    fn from(s: UserSummary) -> Self {
        Self {
            equity: s.equity,
            realized_pnl: s.realized_pnl,
            fees_total: s.fees_total,
            unrealized_pnl: s.unrealized_pnl,
            drawdown_current_pct: s.drawdown_current_pct,
            drawdown_max_pct: s.drawdown_max_pct,
        }
    }
}

/// The assembled engine
pub struct Governor {
    config: GovernorConfig,
    ledger: Arc<LedgerStore>,
    registry: Arc<BotRegistry>,
    breaker: Arc<BreakerEngine>,
    pipeline: AdmissionPipeline,
    allocator: CapitalAllocator,
    connectors: HashMap<String, Arc<dyn ExchangeConnector>>,
    events: EventBus,
    metrics: MetricsCollector,
    // Scheduled tasks must never overlap themselves
    sweep_lock: Mutex<()>,
    alloc_lock: Mutex<()>,
}

impl Governor {
    /// Assemble the engine. Connector-published fee schedules and rate
    /// limits seed any table entries the config does not set explicitly.
    pub fn new(
        mut config: GovernorConfig,
        connectors: HashMap<String, Arc<dyn ExchangeConnector>>,
    ) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        for (name, conn) in &connectors {
            config
                .fees
                .taker_fee_bps
                .entry(name.clone())
                .or_insert_with(|| conn.fee_schedule().taker_fee_bps);
            config
                .limits
                .exchange_rate_limits
                .entry(name.clone())
                .or_insert_with(|| conn.rate_limit());
        }

        let (events, events_rx) = EventBus::new();
        let metrics = MetricsCollector::new();
        let ledger = Arc::new(LedgerStore::new());
        let registry = Arc::new(BotRegistry::new());
        let breaker = Arc::new(BreakerEngine::new(config.breaker.clone()));

        let pipeline = AdmissionPipeline::new(
            config.fees.clone(),
            config.limits.clone(),
            &config.execution,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&breaker),
            events.clone(),
            metrics.clone(),
        );
        let allocator = CapitalAllocator::new(
            config.allocator.clone(),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            events.clone(),
        );

        let governor = Self {
            config,
            ledger,
            registry,
            breaker,
            pipeline,
            allocator,
            connectors,
            events,
            metrics,
            sweep_lock: Mutex::new(()),
            alloc_lock: Mutex::new(()),
        };
        (governor, events_rx)
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<BotRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<BreakerEngine> {
        &self.breaker
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Record user funding in the ledger
    pub async fn fund(&self, user_id: Uuid, amount: Decimal, description: &str) {
        self.ledger
            .append_event(LedgerEvent::funding(user_id, amount, description))
            .await;
    }

    /// Record a verified withdrawal in the ledger
    pub async fn withdraw(&self, user_id: Uuid, amount: Decimal, description: &str) {
        self.ledger
            .append_event(LedgerEvent::withdrawal(user_id, amount, description))
            .await;
    }

    /// Create a bot and record its starting capital as an allocation
    pub async fn register_bot(
        &self,
        user_id: Uuid,
        exchange: &str,
        starting_capital: Decimal,
    ) -> BotState {
        let bot_id = Uuid::new_v4();
        let state = self
            .registry
            .register(bot_id, user_id, exchange, starting_capital)
            .await;
        self.ledger
            .append_event(LedgerEvent::allocation(
                user_id,
                bot_id,
                starting_capital,
                "initial capital",
            ))
            .await;
        state
    }

    /// Submit an order through the four admission gates
    pub async fn submit_order(&self, req: OrderRequest) -> SubmitOutcome {
        let Some(connector) = self.connectors.get(&req.exchange).cloned() else {
            return SubmitOutcome {
                success: false,
                order_id: None,
                gate_failed: None,
                rejection_reason: Some(
                    OrderRejection::UnknownExchange(req.exchange.clone()).to_string(),
                ),
            };
        };

        let user_id = req.user_id;
        let bot_id = req.bot_id;
        let result = self.pipeline.submit(req, connector.as_ref()).await;

        // A fill (or an exchange error) can move a bot across a threshold;
        // re-evaluate before the next order for this bot is admitted
        match &result {
            Ok(_) | Err(OrderRejection::Exchange(_)) => {
                self.evaluate_bot(bot_id).await;
                self.evaluate_user(user_id).await;
            }
            _ => {}
        }

        match result {
            Ok(admitted) => SubmitOutcome {
                success: true,
                order_id: Some(admitted.order_id),
                gate_failed: None,
                rejection_reason: None,
            },
            Err(OrderRejection::Gate(gate)) => SubmitOutcome {
                success: false,
                order_id: None,
                gate_failed: Some(gate.gate_name().to_string()),
                rejection_reason: Some(gate.to_string()),
            },
            Err(other) => SubmitOutcome {
                success: false,
                order_id: None,
                gate_failed: None,
                rejection_reason: Some(other.to_string()),
            },
        }
    }

    pub async fn portfolio_summary(&self, user_id: Uuid) -> PortfolioSummary {
        self.ledger.summary(user_id).await.into()
    }

    pub async fn start_bot(&self, bot_id: Uuid) -> Result<BotState, TransitionError> {
        self.registry.start(bot_id).await
    }

    pub async fn pause_bot(
        &self,
        bot_id: Uuid,
        reason: &str,
    ) -> Result<BotState, TransitionError> {
        let state = self.registry.pause(bot_id, reason, true).await?;
        self.events.emit(EngineEvent::BotPaused {
            bot_id,
            reason: reason.to_string(),
            by_user: true,
        });
        Ok(state)
    }

    pub async fn resume_bot(&self, bot_id: Uuid) -> Result<BotState, TransitionError> {
        let state = self.registry.resume(bot_id).await?;
        self.events.emit(EngineEvent::BotResumed { bot_id });
        Ok(state)
    }

    pub async fn stop_bot(&self, bot_id: Uuid, reason: &str) -> Result<BotState, TransitionError> {
        self.registry.stop(bot_id, reason).await
    }

    /// Quarantined -> Paused, with the operator's reason preserved in the
    /// breaker history. A separate `resume_bot` is still required.
    pub async fn reset_quarantine(
        &self,
        bot_id: Uuid,
        reason: &str,
    ) -> Result<BotState, TransitionError> {
        let state = self.registry.reset_quarantine(bot_id, reason).await?;
        self.breaker
            .record_reset(BreakerEntity::Bot(bot_id), reason)
            .await;
        Ok(state)
    }

    pub async fn pause_all(&self, user_id: Uuid, reason: &str) -> Vec<BulkOutcome> {
        let outcomes = self.registry.pause_all(user_id, reason).await;
        for outcome in outcomes.iter().filter(|o| o.result.is_ok()) {
            self.events.emit(EngineEvent::BotPaused {
                bot_id: outcome.bot_id,
                reason: reason.to_string(),
                by_user: true,
            });
        }
        outcomes
    }

    pub async fn resume_all(&self, user_id: Uuid) -> Vec<BulkOutcome> {
        let outcomes = self.registry.resume_all(user_id).await;
        for outcome in outcomes.iter().filter(|o| o.result.is_ok()) {
            self.events.emit(EngineEvent::BotResumed {
                bot_id: outcome.bot_id,
            });
        }
        outcomes
    }

    /// Daily trade budget usage: for one bot, or the whole user when no
    /// bot is given
    pub async fn limits_usage(&self, user_id: Uuid, bot_id: Option<Uuid>) -> LimitsUsage {
        match bot_id {
            Some(bot_id) => self.pipeline.bot_limits_usage(bot_id).await,
            None => self.pipeline.user_limits_usage(user_id).await,
        }
    }

    /// Manual reinvestment trigger; serialized with the scheduled run
    pub async fn trigger_reinvestment(&self, user_id: Uuid) -> AllocationResult {
        let _guard = self.alloc_lock.lock().await;
        let result = self.allocator.run(user_id).await;
        self.metrics.increment(names::ALLOCATOR_RUNS, 1).await;
        result
    }

    pub async fn reconcile(&self, user_id: Uuid) -> ReconciliationReport {
        self.reconcile_with(user_id, None).await
    }

    /// Reconcile against an optional secondary balance source
    pub async fn reconcile_with(
        &self,
        user_id: Uuid,
        secondary_equity: Option<Decimal>,
    ) -> ReconciliationReport {
        let threshold =
            Decimal::try_from(self.config.execution.reconcile_threshold_pct).unwrap_or_default();
        self.ledger
            .reconcile(user_id, threshold, secondary_equity)
            .await
    }

    pub async fn verify_integrity(&self, user_id: Uuid) -> IntegrityReport {
        self.ledger.verify_integrity(user_id).await
    }

    /// Gather ledger metrics for one bot and trip the breaker on breach
    pub async fn evaluate_bot(&self, bot_id: Uuid) {
        let Some(bot) = self.registry.get(bot_id).await else {
            return;
        };
        // Stopped and never-started bots have nothing to contain; an
        // already-quarantined bot stays put until reset
        if !matches!(bot.status, BotStatus::Active | BotStatus::Paused) {
            return;
        }

        let metrics = self.gather_metrics(&bot).await;
        let thresholds = self.config.breaker.thresholds_for(&bot.exchange);
        let Some(decision) = self.breaker.evaluate(&metrics, &thresholds) else {
            return;
        };

        let entity = BreakerEntity::Bot(bot_id);
        if !self.breaker.record_trip(entity, &decision, metrics).await {
            // Already tripped; no status change
            return;
        }
        self.metrics.increment(names::BREAKER_TRIPS, 1).await;
        self.events.emit(EngineEvent::CircuitBreakerTripped {
            entity_type: entity.entity_type().to_string(),
            entity_id: bot_id,
            reason: decision.reason.clone(),
            metadata: serde_json::to_value(metrics).unwrap_or_default(),
        });

        match decision.severity {
            TripSeverity::Hard => match self.registry.quarantine(bot_id, &decision.reason).await {
                Ok(_) => self.events.emit(EngineEvent::BotQuarantined {
                    bot_id,
                    reason: decision.reason.clone(),
                }),
                Err(e) => error!("Failed to quarantine bot {}: {}", bot_id, e),
            },
            TripSeverity::Soft => match self.registry.pause(bot_id, &decision.reason, false).await
            {
                Ok(_) => self.events.emit(EngineEvent::BotPaused {
                    bot_id,
                    reason: decision.reason.clone(),
                    by_user: false,
                }),
                Err(e) => error!("Failed to pause bot {}: {}", bot_id, e),
            },
        }
    }

    /// User-level containment: a hard drawdown breach across the whole
    /// portfolio trips the user entity, which the breaker gate rejects on
    pub async fn evaluate_user(&self, user_id: Uuid) {
        let summary = self.ledger.summary(user_id).await;
        let thresholds = self.config.breaker.thresholds_for("");
        if summary.drawdown_current_pct < thresholds.max_drawdown_pct {
            return;
        }

        let metrics = BreakerMetrics {
            drawdown_pct: summary.drawdown_current_pct,
            ..Default::default()
        };
        let decision = crate::breaker::TripDecision {
            severity: TripSeverity::Hard,
            reason: format!(
                "max_drawdown_percent breached at user level: {}% >= {}%",
                summary.drawdown_current_pct, thresholds.max_drawdown_pct
            ),
        };
        let entity = BreakerEntity::User(user_id);
        if self.breaker.record_trip(entity, &decision, metrics).await {
            self.metrics.increment(names::BREAKER_TRIPS, 1).await;
            self.events.emit(EngineEvent::CircuitBreakerTripped {
                entity_type: entity.entity_type().to_string(),
                entity_id: user_id,
                reason: decision.reason,
                metadata: serde_json::to_value(metrics).unwrap_or_default(),
            });
        }
    }

    async fn gather_metrics(&self, bot: &BotState) -> BreakerMetrics {
        let ledger_metrics = self.ledger.bot_metrics(bot.user_id, bot.bot_id).await;

        let midnight = Utc::now()
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        let today_net = self
            .ledger
            .realized_net_since(bot.user_id, Some(bot.bot_id), midnight)
            .await;
        let daily_loss_pct = if today_net < Decimal::ZERO && bot.current_capital > Decimal::ZERO {
            -today_net / bot.current_capital * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        BreakerMetrics {
            drawdown_pct: ledger_metrics.drawdown_current_pct,
            daily_loss_pct,
            consecutive_losses: ledger_metrics.consecutive_losses,
            errors_per_hour: self.breaker.errors_per_hour(bot.bot_id).await,
        }
    }

    /// One circuit-breaker sweep over every containable bot. Returns false
    /// when a previous sweep is still running.
    pub async fn sweep(&self) -> bool {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            warn!("Breaker sweep still running, skipping this trigger");
            return false;
        };

        for bot in self.registry.all_bots().await {
            self.evaluate_bot(bot.bot_id).await;
        }
        for user_id in self.registry.user_ids().await {
            self.evaluate_user(user_id).await;
        }
        true
    }

    /// Scheduled allocator pass over every known user. Returns false when
    /// a previous pass is still running.
    pub async fn allocator_tick(&self) -> bool {
        let Ok(_guard) = self.alloc_lock.try_lock() else {
            warn!("Allocator pass still running, skipping this trigger");
            return false;
        };

        for user_id in self.registry.user_ids().await {
            let result = self.allocator.run(user_id).await;
            match result.outcome {
                crate::allocator::AllocationOutcome::AlreadyRan => {
                    self.metrics.increment(names::ALLOCATOR_SKIPS, 1).await;
                }
                _ => {
                    self.metrics.increment(names::ALLOCATOR_RUNS, 1).await;
                }
            }
        }
        true
    }

    /// Spawn the breaker sweep and allocator cadence tasks
    pub fn spawn_schedulers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let sweeper = Arc::clone(self);
        let sweep_interval = Duration::from_secs(self.config.execution.sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        }));

        let allocator = Arc::clone(self);
        let alloc_interval = Duration::from_secs(self.config.execution.allocator_tick_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(alloc_interval);
            loop {
                ticker.tick().await;
                allocator.allocator_tick().await;
            }
        }));

        info!(
            "Schedulers started: sweep every {}s, allocator check every {}s",
            self.config.execution.sweep_interval_secs, self.config.execution.allocator_tick_secs
        );
        handles
    }
}
