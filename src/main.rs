//! Trade Governor - paper-trading demo loop
//!
//! Assembles the engine with a paper exchange, registers a small fleet,
//! and drives orders through the admission pipeline while the schedulers
//! (breaker sweep, capital allocator) run alongside:
//! 1. Load configuration from file/environment
//! 2. Fund the demo user and start the bots
//! 3. Propose paper orders on an interval
//! 4. Write state snapshots for observability

use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use trade_governor::exchange::{ExchangeConnector, OrderType};
use trade_governor::pipeline::OrderRequest;
use trade_governor::state::{GovernorSnapshot, SessionStats, StateWriter};
use trade_governor::{BotStatus, Governor, GovernorConfig, PaperExchange, Side};

const SYMBOLS: [&str; 3] = ["BTC/USD", "ETH/USD", "SOL/USD"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting Trade Governor...");

    let config = GovernorConfig::load().unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        GovernorConfig::default()
    });

    let workspace_dir =
        std::env::var("GOVERNOR_WORKSPACE").unwrap_or_else(|_| "./governor-workspace".to_string());

    // Paper exchange with posted starting prices
    let paper = Arc::new(PaperExchange::new("paper", Decimal::from(25), 60));
    paper.set_price("BTC/USD", Decimal::from(68_000)).await;
    paper.set_price("ETH/USD", Decimal::from(3_500)).await;
    paper.set_price("SOL/USD", Decimal::from(150)).await;

    let mut connectors: HashMap<String, Arc<dyn ExchangeConnector>> = HashMap::new();
    connectors.insert(
        "paper".to_string(),
        Arc::clone(&paper) as Arc<dyn ExchangeConnector>,
    );

    let (governor, mut events_rx) = Governor::new(config, connectors);
    let governor = Arc::new(governor);

    // Drain engine events to the log; a real deployment forwards these to
    // the notification service
    tokio::spawn(async move {
        while let Some(envelope) = events_rx.recv().await {
            info!(
                "event {} at {}",
                envelope.event.event_type(),
                envelope.timestamp
            );
        }
    });

    // Demo fleet: one user, three bots on the paper exchange
    let user_id = Uuid::new_v4();
    governor
        .fund(user_id, Decimal::from(10_000), "demo funding")
        .await;
    let mut bot_ids = Vec::new();
    for _ in 0..3 {
        let bot = governor
            .register_bot(user_id, "paper", Decimal::from(1_000))
            .await;
        governor.start_bot(bot.bot_id).await?;
        bot_ids.push(bot.bot_id);
    }
    info!("Fleet started: user {} with {} bots", user_id, bot_ids.len());

    let scheduler_handles = governor.spawn_schedulers();

    let state = StateWriter::new(&workspace_dir);
    state.init().await?;

    // Trading interval (propose an order every 15 seconds)
    let mut trading_interval = interval(Duration::from_secs(15));
    // Snapshot interval
    let mut snapshot_interval = interval(Duration::from_secs(30));

    let mut next_bot = 0usize;
    loop {
        tokio::select! {
            _ = trading_interval.tick() => {
                let bot_id = bot_ids[next_bot % bot_ids.len()];
                next_bot += 1;
                propose_order(&governor, &paper, user_id, bot_id).await;
            }
            _ = snapshot_interval.tick() => {
                if let Err(e) = write_snapshot(&governor, &state, user_id).await {
                    error!("Snapshot write failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    for handle in scheduler_handles {
        handle.abort();
    }
    Ok(())
}

/// Drift prices and push one order through the admission pipeline
async fn propose_order(
    governor: &Arc<Governor>,
    paper: &Arc<PaperExchange>,
    user_id: Uuid,
    bot_id: Uuid,
) {
    let (symbol, side, edge_bps, price) = {
        let mut rng = rand::thread_rng();
        let symbol = SYMBOLS[rng.gen_range(0..SYMBOLS.len())];
        let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        // Most proposals carry enough predicted edge; some get rejected at
        // the fee-coverage gate
        let edge_bps = Decimal::from(rng.gen_range(20..120));
        let base = match symbol {
            "BTC/USD" => 68_000.0,
            "ETH/USD" => 3_500.0,
            _ => 150.0,
        };
        let drift = rng.gen_range(-0.02..0.02);
        let price = Decimal::try_from(base * (1.0 + drift)).unwrap_or(Decimal::from(1));
        (symbol, side, edge_bps, price)
    };

    paper.set_price(symbol, price.round_dp(2)).await;

    let outcome = governor
        .submit_order(OrderRequest {
            user_id,
            bot_id,
            exchange: "paper".to_string(),
            symbol: symbol.to_string(),
            side,
            amount: "0.05".parse().unwrap(),
            order_type: OrderType::Market,
            idempotency_key: Uuid::new_v4().to_string(),
            expected_edge_bps: edge_bps,
            is_paper: true,
        })
        .await;

    if outcome.success {
        info!("Order admitted: {:?}", outcome.order_id);
    } else {
        info!(
            "Order rejected at {:?}: {:?}",
            outcome.gate_failed, outcome.rejection_reason
        );
    }
}

async fn write_snapshot(
    governor: &Arc<Governor>,
    state: &StateWriter,
    user_id: Uuid,
) -> anyhow::Result<()> {
    let bots = governor.registry().bots_for_user(user_id).await;
    let summary = governor.portfolio_summary(user_id).await;
    let usage = governor.limits_usage(user_id, None).await;

    let snapshot = GovernorSnapshot {
        timestamp: chrono::Utc::now().to_rfc3339(),
        status: "running".to_string(),
        bots_active: bots.iter().filter(|b| b.status == BotStatus::Active).count(),
        bots_paused: bots.iter().filter(|b| b.status == BotStatus::Paused).count(),
        bots_quarantined: bots
            .iter()
            .filter(|b| b.status == BotStatus::Quarantined)
            .count(),
        session_stats: SessionStats {
            trades_today: usage.trades_today as u64,
            equity: summary.equity,
            realized_pnl: summary.realized_pnl,
        },
    };
    state.write_now(&snapshot).await
}
