//! Capital Allocator - scheduled reinvestment of realized profit
//!
//! Reads realized profit from the ledger since the last completed run,
//! ranks the Active bots by recent performance, and redistributes a
//! configured share of the profit to the top performers. One run per
//! cadence window per user; a retried trigger inside the window is a no-op.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{AllocationSplit, AllocatorConfig};
use crate::events::{EngineEvent, EventBus};
use crate::ledger::{LedgerEvent, LedgerStore};
use crate::lifecycle::{BotRegistry, BotStatus};

/// One bot's share of a reinvestment
#[derive(Debug, Clone, Serialize)]
pub struct BotShare {
    pub bot_id: Uuid,
    pub amount: Decimal,
}

/// Why a run did or did not allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOutcome {
    Completed,
    BelowThreshold,
    NoEligibleBots,
    /// The cadence window already has a recorded run
    AlreadyRan,
}

/// Recorded run, kept for idempotent scheduling and audit
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub window_key: i64,
    pub ran_at: DateTime<Utc>,
    pub outcome: AllocationOutcome,
    pub total_profit: Decimal,
    pub total_allocated: Decimal,
    pub shares: Vec<BotShare>,
    /// Baseline for the next run's profit delta
    pub cumulative_realized_net: Decimal,
}

/// What a trigger returned
#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    pub outcome: AllocationOutcome,
    pub total_profit: Decimal,
    pub total_allocated: Decimal,
    pub shares: Vec<BotShare>,
}

/// Scheduled reinvestment job
pub struct CapitalAllocator {
    config: AllocatorConfig,
    ledger: Arc<LedgerStore>,
    registry: Arc<BotRegistry>,
    events: EventBus,
    runs: Mutex<Vec<AllocationRun>>,
}

impl CapitalAllocator {
    pub fn new(
        config: AllocatorConfig,
        ledger: Arc<LedgerStore>,
        registry: Arc<BotRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            ledger,
            registry,
            events,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Run the allocation for one user at the current time
    pub async fn run(&self, user_id: Uuid) -> AllocationResult {
        self.run_at(user_id, Utc::now()).await
    }

    /// Run the allocation with an explicit clock
    pub async fn run_at(&self, user_id: Uuid, now: DateTime<Utc>) -> AllocationResult {
        let cadence_secs = self.config.cadence_hours as i64 * 3600;
        let window_key = now.timestamp().div_euclid(cadence_secs);

        // The runs log is held for the whole run: concurrent triggers
        // serialize, and the loser sees the recorded run
        let mut runs = self.runs.lock().await;

        if runs
            .iter()
            .any(|r| r.user_id == user_id && r.window_key == window_key)
        {
            debug!(
                "Allocator already ran for user {} in window {}",
                user_id, window_key
            );
            return AllocationResult {
                outcome: AllocationOutcome::AlreadyRan,
                total_profit: Decimal::ZERO,
                total_allocated: Decimal::ZERO,
                shares: Vec::new(),
            };
        }

        let baseline = runs
            .iter()
            .rev()
            .find(|r| r.user_id == user_id && r.outcome == AllocationOutcome::Completed)
            .map(|r| r.cumulative_realized_net)
            .unwrap_or(Decimal::ZERO);

        let summary = self.ledger.summary(user_id).await;
        let current_net = summary.realized_pnl - summary.fees_total;
        let profit = current_net - baseline;

        if profit < self.config.reinvest_threshold {
            info!(
                "Allocator no-op for user {}: profit {} below threshold {}",
                user_id, profit, self.config.reinvest_threshold
            );
            runs.push(self.record(
                user_id,
                window_key,
                now,
                AllocationOutcome::BelowThreshold,
                profit,
                Decimal::ZERO,
                Vec::new(),
                baseline,
            ));
            return AllocationResult {
                outcome: AllocationOutcome::BelowThreshold,
                total_profit: profit,
                total_allocated: Decimal::ZERO,
                shares: Vec::new(),
            };
        }

        // Rank Active bots by realized performance over the lookback;
        // paused, stopped, and quarantined bots are excluded entirely
        let lookback_start = now - Duration::hours(self.config.performance_lookback_hours as i64);
        let mut ranked: Vec<(Uuid, Decimal)> = Vec::new();
        for bot in self.registry.bots_for_user(user_id).await {
            if bot.status != BotStatus::Active {
                continue;
            }
            let pnl = self
                .ledger
                .realized_net_since(user_id, Some(bot.bot_id), lookback_start)
                .await;
            ranked.push((bot.bot_id, pnl));
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(self.config.reinvest_top_n);

        if ranked.is_empty() {
            info!("Allocator no-op for user {}: no eligible bots", user_id);
            runs.push(self.record(
                user_id,
                window_key,
                now,
                AllocationOutcome::NoEligibleBots,
                profit,
                Decimal::ZERO,
                Vec::new(),
                baseline,
            ));
            return AllocationResult {
                outcome: AllocationOutcome::NoEligibleBots,
                total_profit: profit,
                total_allocated: Decimal::ZERO,
                shares: Vec::new(),
            };
        }

        let total_allocated = profit * self.config.reinvest_percentage / Decimal::from(100);
        let shares = split_shares(total_allocated, &ranked, self.config.split);

        for share in &shares {
            self.ledger
                .append_event(LedgerEvent::allocation(
                    user_id,
                    share.bot_id,
                    share.amount,
                    "profit reinvestment",
                ))
                .await;
            self.registry.add_capital(share.bot_id, share.amount).await;
        }

        info!(
            "Allocator completed for user {}: {} across {} bots",
            user_id,
            total_allocated,
            shares.len()
        );
        self.events.emit(EngineEvent::ReinvestmentCompleted {
            user_id,
            total_allocated,
            bot_count: shares.len(),
        });

        runs.push(self.record(
            user_id,
            window_key,
            now,
            AllocationOutcome::Completed,
            profit,
            total_allocated,
            shares.clone(),
            current_net,
        ));

        AllocationResult {
            outcome: AllocationOutcome::Completed,
            total_profit: profit,
            total_allocated,
            shares,
        }
    }

    /// Recorded runs for a user, oldest first
    pub async fn runs_for_user(&self, user_id: Uuid) -> Vec<AllocationRun> {
        self.runs
            .lock()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        user_id: Uuid,
        window_key: i64,
        ran_at: DateTime<Utc>,
        outcome: AllocationOutcome,
        total_profit: Decimal,
        total_allocated: Decimal,
        shares: Vec<BotShare>,
        cumulative_realized_net: Decimal,
    ) -> AllocationRun {
        AllocationRun {
            id: Uuid::new_v4(),
            user_id,
            window_key,
            ran_at,
            outcome,
            total_profit,
            total_allocated,
            shares,
            cumulative_realized_net,
        }
    }
}

/// Split the allocation across the ranked bots. Equal split by default;
/// proportional weights by positive PnL, falling back to equal when no bot
/// has a positive weight. The last share absorbs rounding dust so the total
/// is conserved exactly.
fn split_shares(
    total: Decimal,
    ranked: &[(Uuid, Decimal)],
    split: AllocationSplit,
) -> Vec<BotShare> {
    let n = ranked.len();
    let weights: Option<Vec<Decimal>> = match split {
        AllocationSplit::Equal => None,
        AllocationSplit::Proportional => {
            let positive: Vec<Decimal> = ranked
                .iter()
                .map(|(_, pnl)| (*pnl).max(Decimal::ZERO))
                .collect();
            let sum: Decimal = positive.iter().copied().sum();
            if sum > Decimal::ZERO {
                Some(positive.iter().map(|w| *w / sum).collect())
            } else {
                None
            }
        }
    };

    let mut shares = Vec::with_capacity(n);
    let mut allocated = Decimal::ZERO;
    for (i, (bot_id, _)) in ranked.iter().enumerate() {
        let amount = if i == n - 1 {
            total - allocated
        } else {
            let fraction = weights
                .as_ref()
                .map(|w| w[i])
                .unwrap_or_else(|| Decimal::ONE / Decimal::from(n as u64));
            (total * fraction).round_dp(8)
        };
        allocated += amount;
        shares.push(BotShare {
            bot_id: *bot_id,
            amount,
        });
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::exchange::Side;
    use crate::ledger::Fill;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn fill(user_id: Uuid, bot_id: Uuid, side: Side, amount: &str, price: &str) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            user_id,
            bot_id,
            exchange: "paper".to_string(),
            symbol: "BTC/USD".to_string(),
            side,
            amount: dec(amount),
            price: dec(price),
            fee: Decimal::ZERO,
            fee_currency: "USD".to_string(),
            order_id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4().to_string(),
            is_paper: true,
            timestamp: Utc::now(),
        }
    }

    /// Give a bot `profit` of realized PnL via one round trip
    async fn book_profit(ledger: &LedgerStore, user_id: Uuid, bot_id: Uuid, profit: &str) {
        ledger
            .append_fill(fill(user_id, bot_id, Side::Buy, "1", "1000"))
            .await
            .unwrap();
        let exit = dec("1000") + dec(profit);
        ledger
            .append_fill(fill(user_id, bot_id, Side::Sell, "1", &exit.to_string()))
            .await
            .unwrap();
    }

    struct Fixture {
        allocator: CapitalAllocator,
        ledger: Arc<LedgerStore>,
        registry: Arc<BotRegistry>,
        user_id: Uuid,
    }

    async fn fixture(config: AllocatorConfig) -> Fixture {
        let ledger = Arc::new(LedgerStore::new());
        let registry = Arc::new(BotRegistry::new());
        let (events, _rx) = EventBus::new();
        let allocator =
            CapitalAllocator::new(config, Arc::clone(&ledger), Arc::clone(&registry), events);
        Fixture {
            allocator,
            ledger,
            registry,
            user_id: Uuid::new_v4(),
        }
    }

    async fn active_bot(f: &Fixture) -> Uuid {
        let bot_id = Uuid::new_v4();
        f.registry
            .register(bot_id, f.user_id, "paper", dec("1000"))
            .await;
        f.registry.start(bot_id).await.unwrap();
        bot_id
    }

    #[tokio::test]
    async fn test_reinvestment_scenario() {
        // 900 profit, threshold 500, top 3, 80% -> 720 split three ways
        let f = fixture(AllocatorConfig::default()).await;

        let top1 = active_bot(&f).await;
        let top2 = active_bot(&f).await;
        let top3 = active_bot(&f).await;
        let straggler = active_bot(&f).await;

        let quarantined = active_bot(&f).await;
        f.registry
            .quarantine(quarantined, "drawdown breach")
            .await
            .unwrap();

        book_profit(&f.ledger, f.user_id, top1, "400").await;
        book_profit(&f.ledger, f.user_id, top2, "300").await;
        book_profit(&f.ledger, f.user_id, top3, "250").await;
        book_profit(&f.ledger, f.user_id, straggler, "-50").await;

        let result = f.allocator.run(f.user_id).await;
        assert_eq!(result.outcome, AllocationOutcome::Completed);
        assert_eq!(result.total_profit, dec("900"));
        assert_eq!(result.total_allocated, dec("720"));
        assert_eq!(result.shares.len(), 3);
        for share in &result.shares {
            assert_eq!(share.amount, dec("240"));
            assert_ne!(share.bot_id, quarantined);
            assert_ne!(share.bot_id, straggler);
        }

        // One Allocation ledger event per share; bot capital increased
        let top1_state = f.registry.get(top1).await.unwrap();
        assert_eq!(top1_state.current_capital, dec("1240"));
        let metrics = f.ledger.bot_metrics(f.user_id, top1).await;
        assert_eq!(metrics.capital_base, dec("240"));
    }

    #[tokio::test]
    async fn test_below_threshold_is_recorded_noop() {
        let f = fixture(AllocatorConfig::default()).await;
        let bot = active_bot(&f).await;
        book_profit(&f.ledger, f.user_id, bot, "100").await;

        let result = f.allocator.run(f.user_id).await;
        assert_eq!(result.outcome, AllocationOutcome::BelowThreshold);
        assert_eq!(result.total_allocated, Decimal::ZERO);

        let runs = f.allocator.runs_for_user(f.user_id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, AllocationOutcome::BelowThreshold);
    }

    #[tokio::test]
    async fn test_second_trigger_in_window_is_skipped() {
        let f = fixture(AllocatorConfig::default()).await;
        let bot = active_bot(&f).await;
        book_profit(&f.ledger, f.user_id, bot, "900").await;

        let now = Utc::now();
        let first = f.allocator.run_at(f.user_id, now).await;
        assert_eq!(first.outcome, AllocationOutcome::Completed);

        let retried = f.allocator.run_at(f.user_id, now).await;
        assert_eq!(retried.outcome, AllocationOutcome::AlreadyRan);
        assert_eq!(retried.total_allocated, Decimal::ZERO);

        // Only one completed run recorded; capital granted once
        let runs = f.allocator.runs_for_user(f.user_id).await;
        assert_eq!(runs.len(), 1);
        let state = f.registry.get(bot).await.unwrap();
        assert_eq!(state.current_capital, dec("1720"));
    }

    #[tokio::test]
    async fn test_next_window_uses_profit_delta() {
        let f = fixture(AllocatorConfig::default()).await;
        let bot = active_bot(&f).await;
        book_profit(&f.ledger, f.user_id, bot, "900").await;

        let now = Utc::now();
        f.allocator.run_at(f.user_id, now).await;

        // No new profit: next window sees a zero delta
        let next_window = now + Duration::hours(25);
        let result = f.allocator.run_at(f.user_id, next_window).await;
        assert_eq!(result.outcome, AllocationOutcome::BelowThreshold);
        assert_eq!(result.total_profit, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_proportional_split() {
        let config = AllocatorConfig {
            split: AllocationSplit::Proportional,
            reinvest_top_n: 2,
            ..AllocatorConfig::default()
        };
        let f = fixture(config).await;
        let strong = active_bot(&f).await;
        let weak = active_bot(&f).await;
        book_profit(&f.ledger, f.user_id, strong, "600").await;
        book_profit(&f.ledger, f.user_id, weak, "200").await;

        let result = f.allocator.run(f.user_id).await;
        assert_eq!(result.outcome, AllocationOutcome::Completed);
        // 800 profit, 80% = 640 split 3:1
        assert_eq!(result.total_allocated, dec("640"));
        let strong_share = result.shares.iter().find(|s| s.bot_id == strong).unwrap();
        let weak_share = result.shares.iter().find(|s| s.bot_id == weak).unwrap();
        assert_eq!(strong_share.amount, dec("480"));
        assert_eq!(weak_share.amount, dec("160"));
    }

    #[tokio::test]
    async fn test_no_eligible_bots_recorded() {
        let f = fixture(AllocatorConfig::default()).await;
        let bot = active_bot(&f).await;
        book_profit(&f.ledger, f.user_id, bot, "900").await;
        f.registry.pause(bot, "manual", true).await.unwrap();

        let result = f.allocator.run(f.user_id).await;
        assert_eq!(result.outcome, AllocationOutcome::NoEligibleBots);
        assert_eq!(result.total_allocated, Decimal::ZERO);
    }

    #[test]
    fn test_equal_split_conserves_total() {
        let bots: Vec<(Uuid, Decimal)> = (0..3).map(|_| (Uuid::new_v4(), dec("1"))).collect();
        let shares = split_shares(dec("100"), &bots, AllocationSplit::Equal);
        let total: Decimal = shares.iter().map(|s| s.amount).sum();
        assert_eq!(total, dec("100"));
    }
}
