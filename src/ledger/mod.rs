//! Ledger Store - append-only source of truth for capital
//!
//! Fills and ledger events are never updated or deleted; equity, PnL, and
//! drawdown are derived by replay. Per-user aggregates are cached and the
//! cache is invalidated on every write, so a cached read always equals a
//! fresh replay.

mod integrity;
mod pnl;

pub use integrity::{IntegrityCheck, IntegrityReport, ReconciliationReport};
pub use pnl::FifoBook;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::exchange::Side;

/// Immutable record of an executed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub order_id: Uuid,
    pub idempotency_key: String,
    pub is_paper: bool,
    pub timestamp: DateTime<Utc>,
}

/// Capital movement not tied to a trade fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    Funding,
    Withdrawal,
    Allocation,
}

/// Immutable funding/withdrawal/allocation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: LedgerEventKind,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    /// Carries `bot_id` for allocations
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn funding(user_id: Uuid, amount: Decimal, description: &str) -> Self {
        Self::new(user_id, LedgerEventKind::Funding, amount, description, None)
    }

    pub fn withdrawal(user_id: Uuid, amount: Decimal, description: &str) -> Self {
        Self::new(user_id, LedgerEventKind::Withdrawal, amount, description, None)
    }

    pub fn allocation(user_id: Uuid, bot_id: Uuid, amount: Decimal, description: &str) -> Self {
        Self::new(
            user_id,
            LedgerEventKind::Allocation,
            amount,
            description,
            Some(serde_json::json!({ "bot_id": bot_id.to_string() })),
        )
    }

    fn new(
        user_id: Uuid,
        kind: LedgerEventKind,
        amount: Decimal,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            currency: "USD".to_string(),
            description: description.to_string(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Bot referenced by an allocation, from metadata
    pub fn allocation_bot_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()?
            .get("bot_id")?
            .as_str()?
            .parse()
            .ok()
    }
}

/// Derived per-user aggregates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub funding_total: Decimal,
    pub withdrawal_total: Decimal,
    pub realized_pnl: Decimal,
    pub fees_total: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub drawdown_current_pct: Decimal,
    pub drawdown_max_pct: Decimal,
}

/// Ledger-derived metrics for one bot, used by the breaker and allocator
#[derive(Debug, Clone, Serialize)]
pub struct BotLedgerMetrics {
    pub bot_id: Uuid,
    /// Capital allocated to the bot (initial seed + reinvestments)
    pub capital_base: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub unrealized_pnl: Decimal,
    pub consecutive_losses: u32,
    pub drawdown_current_pct: Decimal,
    pub drawdown_max_pct: Decimal,
}

struct Recorded<T> {
    seq: u64,
    rec: T,
}

struct LedgerInner {
    fills: Vec<Recorded<Fill>>,
    events: Vec<Recorded<LedgerEvent>>,
    fill_ids: HashSet<Uuid>,
    fill_keys: HashSet<String>,
    cache: HashMap<Uuid, UserSummary>,
    seq: u64,
}

/// Append-only ledger with cached per-user aggregates
pub struct LedgerStore {
    inner: RwLock<LedgerInner>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                fills: Vec::new(),
                events: Vec::new(),
                fill_ids: HashSet::new(),
                fill_keys: HashSet::new(),
                cache: HashMap::new(),
                seq: 0,
            }),
        }
    }

    /// Append a fill; rejects a duplicate id or idempotency key
    pub async fn append_fill(&self, fill: Fill) -> Result<Uuid, LedgerError> {
        let mut inner = self.inner.write().await;

        if inner.fill_ids.contains(&fill.id) {
            return Err(LedgerError::Integrity(format!(
                "duplicate fill id {}",
                fill.id
            )));
        }
        if inner.fill_keys.contains(&fill.idempotency_key) {
            return Err(LedgerError::Integrity(format!(
                "idempotency key {} already filled",
                fill.idempotency_key
            )));
        }

        debug!(
            "Ledger fill: user {} bot {} {} {} {} @ {}",
            fill.user_id, fill.bot_id, fill.side, fill.amount, fill.symbol, fill.price
        );

        let id = fill.id;
        let user_id = fill.user_id;
        inner.fill_ids.insert(fill.id);
        inner.fill_keys.insert(fill.idempotency_key.clone());
        inner.seq += 1;
        let seq = inner.seq;
        inner.fills.push(Recorded { seq, rec: fill });
        inner.cache.remove(&user_id);
        Ok(id)
    }

    /// Append a funding/withdrawal/allocation event
    pub async fn append_event(&self, event: LedgerEvent) -> Uuid {
        let mut inner = self.inner.write().await;
        info!(
            "Ledger event: user {} {:?} {} ({})",
            event.user_id, event.kind, event.amount, event.description
        );
        let id = event.id;
        let user_id = event.user_id;
        inner.seq += 1;
        let seq = inner.seq;
        inner.events.push(Recorded { seq, rec: event });
        inner.cache.remove(&user_id);
        id
    }

    /// Cached per-user aggregates; recomputed by replay on cache miss
    pub async fn summary(&self, user_id: Uuid) -> UserSummary {
        {
            let inner = self.inner.read().await;
            if let Some(cached) = inner.cache.get(&user_id) {
                return cached.clone();
            }
        }
        let mut inner = self.inner.write().await;
        if let Some(cached) = inner.cache.get(&user_id) {
            return cached.clone();
        }
        let summary = replay_user(&inner, user_id);
        inner.cache.insert(user_id, summary.clone());
        summary
    }

    /// Full replay from genesis, bypassing the cache
    pub async fn summary_replay(&self, user_id: Uuid) -> UserSummary {
        let inner = self.inner.read().await;
        replay_user(&inner, user_id)
    }

    /// Replayed metrics for a single bot
    pub async fn bot_metrics(&self, user_id: Uuid, bot_id: Uuid) -> BotLedgerMetrics {
        let inner = self.inner.read().await;
        replay_bot(&inner, user_id, bot_id)
    }

    /// FIFO realized PnL for a user, or one of their bots
    pub async fn realized_pnl(&self, user_id: Uuid, bot_id: Option<Uuid>) -> Decimal {
        match bot_id {
            Some(bot_id) => self.bot_metrics(user_id, bot_id).await.realized_pnl,
            None => self.summary(user_id).await.realized_pnl,
        }
    }

    /// Drawdown as `(current_pct, max_pct)` against the running peak
    pub async fn drawdown(&self, user_id: Uuid, bot_id: Option<Uuid>) -> (Decimal, Decimal) {
        match bot_id {
            Some(bot_id) => {
                let m = self.bot_metrics(user_id, bot_id).await;
                (m.drawdown_current_pct, m.drawdown_max_pct)
            }
            None => {
                let s = self.summary(user_id).await;
                (s.drawdown_current_pct, s.drawdown_max_pct)
            }
        }
    }

    /// Realized PnL net of fees for fills at or after `since`
    pub async fn realized_net_since(
        &self,
        user_id: Uuid,
        bot_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Decimal {
        let inner = self.inner.read().await;
        let mut book = FifoBook::new();
        let mut base = Decimal::ZERO;
        let mut snapped = false;

        for fill in ordered_fills(&inner, user_id, bot_id) {
            if !snapped && fill.timestamp >= since {
                base = book.realized_net();
                snapped = true;
            }
            book.apply(&fill.symbol, fill.side, fill.amount, fill.price, fill.fee);
        }

        if snapped {
            book.realized_net() - base
        } else {
            Decimal::ZERO
        }
    }

    pub async fn fill_count(&self, user_id: Uuid) -> usize {
        let inner = self.inner.read().await;
        inner
            .fills
            .iter()
            .filter(|f| f.rec.user_id == user_id)
            .count()
    }

    pub async fn fills_for_bot(&self, user_id: Uuid, bot_id: Uuid) -> Vec<Fill> {
        let inner = self.inner.read().await;
        ordered_fills(&inner, user_id, Some(bot_id))
            .into_iter()
            .cloned()
            .collect()
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Fills for a user (optionally one bot) in replay order
fn ordered_fills<'a>(
    inner: &'a LedgerInner,
    user_id: Uuid,
    bot_id: Option<Uuid>,
) -> Vec<&'a Fill> {
    let mut fills: Vec<&Recorded<Fill>> = inner
        .fills
        .iter()
        .filter(|f| f.rec.user_id == user_id && bot_id.map_or(true, |b| f.rec.bot_id == b))
        .collect();
    fills.sort_by_key(|f| (f.rec.timestamp, f.seq));
    fills.into_iter().map(|f| &f.rec).collect()
}

enum ReplayEntry<'a> {
    Fill(&'a Fill),
    Event(&'a LedgerEvent),
}

/// Merged fill/event stream for a user in replay order
fn ordered_entries<'a>(inner: &'a LedgerInner, user_id: Uuid) -> Vec<ReplayEntry<'a>> {
    let mut entries: Vec<(DateTime<Utc>, u64, ReplayEntry<'a>)> = Vec::new();
    for f in inner.fills.iter().filter(|f| f.rec.user_id == user_id) {
        entries.push((f.rec.timestamp, f.seq, ReplayEntry::Fill(&f.rec)));
    }
    for e in inner.events.iter().filter(|e| e.rec.user_id == user_id) {
        entries.push((e.rec.timestamp, e.seq, ReplayEntry::Event(&e.rec)));
    }
    entries.sort_by_key(|(ts, seq, _)| (*ts, *seq));
    entries.into_iter().map(|(_, _, e)| e).collect()
}

fn drawdown_pct(peak: Decimal, equity: Decimal) -> Decimal {
    if peak > Decimal::ZERO && equity < peak {
        (peak - equity) / peak * Decimal::from(100)
    } else {
        Decimal::ZERO
    }
}

/// Replay a user's full history: equity, PnL, and drawdown from genesis
fn replay_user(inner: &LedgerInner, user_id: Uuid) -> UserSummary {
    let mut book = FifoBook::new();
    let mut funding = Decimal::ZERO;
    let mut withdrawals = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;
    let mut equity = Decimal::ZERO;

    for entry in ordered_entries(inner, user_id) {
        let mut withdrawal_amount = None;
        match entry {
            ReplayEntry::Fill(f) => {
                book.apply(&f.symbol, f.side, f.amount, f.price, f.fee);
            }
            ReplayEntry::Event(e) => match e.kind {
                LedgerEventKind::Funding => funding += e.amount,
                LedgerEventKind::Withdrawal => {
                    withdrawals += e.amount;
                    withdrawal_amount = Some(e.amount);
                }
                // Internal capital movement; user equity unchanged
                LedgerEventKind::Allocation => {}
            },
        }

        equity = funding - withdrawals + book.realized_pnl - book.fees + book.unrealized_pnl();

        // The peak only decreases on a verified withdrawal; a withdrawal is
        // not a loss
        peak = match withdrawal_amount {
            Some(amount) => (peak - amount).max(equity),
            None => peak.max(equity),
        };
        max_dd = max_dd.max(drawdown_pct(peak, equity));
    }

    UserSummary {
        user_id,
        funding_total: funding,
        withdrawal_total: withdrawals,
        realized_pnl: book.realized_pnl,
        fees_total: book.fees,
        unrealized_pnl: book.unrealized_pnl(),
        equity,
        drawdown_current_pct: drawdown_pct(peak, equity),
        drawdown_max_pct: max_dd,
    }
}

/// Replay one bot's history: allocations seed the capital base, fills move
/// the bot's equity curve
fn replay_bot(inner: &LedgerInner, user_id: Uuid, bot_id: Uuid) -> BotLedgerMetrics {
    let mut book = FifoBook::new();
    let mut base = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;
    let mut equity = Decimal::ZERO;

    for entry in ordered_entries(inner, user_id) {
        match entry {
            ReplayEntry::Fill(f) if f.bot_id == bot_id => {
                book.apply(&f.symbol, f.side, f.amount, f.price, f.fee);
            }
            ReplayEntry::Event(e)
                if e.kind == LedgerEventKind::Allocation
                    && e.allocation_bot_id() == Some(bot_id) =>
            {
                base += e.amount;
            }
            _ => continue,
        }

        equity = base + book.realized_pnl - book.fees + book.unrealized_pnl();
        peak = peak.max(equity);
        max_dd = max_dd.max(drawdown_pct(peak, equity));
    }

    BotLedgerMetrics {
        bot_id,
        capital_base: base,
        realized_pnl: book.realized_pnl,
        fees: book.fees,
        unrealized_pnl: book.unrealized_pnl(),
        consecutive_losses: book.consecutive_losses,
        drawdown_current_pct: drawdown_pct(peak, equity),
        drawdown_max_pct: max_dd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn fill(user_id: Uuid, bot_id: Uuid, side: Side, amount: &str, price: &str, fee: &str) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            user_id,
            bot_id,
            exchange: "paper".to_string(),
            symbol: "BTC/USD".to_string(),
            side,
            amount: dec(amount),
            price: dec(price),
            fee: dec(fee),
            fee_currency: "USD".to_string(),
            order_id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4().to_string(),
            is_paper: true,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_funding_only_equity() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::funding(user_id, dec("10000"), "initial"))
            .await;

        let summary = ledger.summary(user_id).await;
        assert_eq!(summary.equity, dec("10000"));
        assert_eq!(summary.realized_pnl, Decimal::ZERO);
        assert_eq!(summary.drawdown_current_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_round_trip_equity_scenario() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::funding(user_id, dec("10000"), "initial"))
            .await;

        // Buy 0.01 BTC at 500k, sell at 510k, both at 25 bps
        let buy_fee = dec("500000") * dec("0.01") * dec("0.0025");
        let sell_fee = dec("510000") * dec("0.01") * dec("0.0025");
        ledger
            .append_fill(fill(user_id, bot_id, Side::Buy, "0.01", "500000", "12.5"))
            .await
            .unwrap();
        ledger
            .append_fill(fill(user_id, bot_id, Side::Sell, "0.01", "510000", "12.75"))
            .await
            .unwrap();

        let summary = ledger.summary(user_id).await;
        let net = dec("100") - buy_fee - sell_fee;
        assert_eq!(summary.realized_pnl, dec("100"));
        assert_eq!(summary.fees_total, buy_fee + sell_fee);
        assert_eq!(summary.equity, dec("10000") + net);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();

        let mut first = fill(user_id, bot_id, Side::Buy, "1", "100", "0");
        first.idempotency_key = "key-1".to_string();
        ledger.append_fill(first).await.unwrap();

        let mut dup = fill(user_id, bot_id, Side::Buy, "1", "100", "0");
        dup.idempotency_key = "key-1".to_string();
        let err = ledger.append_fill(dup).await.unwrap_err();
        assert!(matches!(err, LedgerError::Integrity(_)));
        assert_eq!(ledger.fill_count(user_id).await, 1);
    }

    #[tokio::test]
    async fn test_cache_equals_replay_at_every_point() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::funding(user_id, dec("10000"), "initial"))
            .await;

        let prices = ["100", "110", "95", "120", "90"];
        for (i, price) in prices.iter().enumerate() {
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            ledger
                .append_fill(fill(user_id, bot_id, side, "2", price, "1"))
                .await
                .unwrap();

            let cached = ledger.summary(user_id).await;
            let replayed = ledger.summary_replay(user_id).await;
            assert_eq!(cached, replayed, "cache drifted after fill {}", i);
        }
    }

    #[tokio::test]
    async fn test_withdrawal_lowers_peak_not_drawdown() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::funding(user_id, dec("10000"), "initial"))
            .await;
        ledger
            .append_event(LedgerEvent::withdrawal(user_id, dec("4000"), "payout"))
            .await;

        let summary = ledger.summary(user_id).await;
        assert_eq!(summary.equity, dec("6000"));
        // Withdrawing is not a drawdown
        assert_eq!(summary.drawdown_current_pct, Decimal::ZERO);
        assert_eq!(summary.drawdown_max_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_bot_drawdown_from_allocation_base() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::allocation(user_id, bot_id, dec("1000"), "seed"))
            .await;

        // Lose 150 on a round trip: equity 1000 -> 850
        ledger
            .append_fill(fill(user_id, bot_id, Side::Buy, "1", "1000", "0"))
            .await
            .unwrap();
        ledger
            .append_fill(fill(user_id, bot_id, Side::Sell, "1", "850", "0"))
            .await
            .unwrap();

        let metrics = ledger.bot_metrics(user_id, bot_id).await;
        assert_eq!(metrics.capital_base, dec("1000"));
        assert_eq!(metrics.realized_pnl, dec("-150"));
        assert_eq!(metrics.drawdown_current_pct, dec("15"));
        assert_eq!(metrics.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_allocation_does_not_change_user_equity() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();
        ledger
            .append_event(LedgerEvent::funding(user_id, dec("10000"), "initial"))
            .await;
        ledger
            .append_event(LedgerEvent::allocation(user_id, bot_id, dec("2000"), "seed"))
            .await;

        let summary = ledger.summary(user_id).await;
        assert_eq!(summary.equity, dec("10000"));
    }

    #[tokio::test]
    async fn test_realized_net_since() {
        let ledger = LedgerStore::new();
        let user_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();

        ledger
            .append_fill(fill(user_id, bot_id, Side::Buy, "1", "100", "0"))
            .await
            .unwrap();
        ledger
            .append_fill(fill(user_id, bot_id, Side::Sell, "1", "150", "0"))
            .await
            .unwrap();

        let cutoff = Utc::now();
        // Nothing after the cutoff yet
        assert_eq!(
            ledger.realized_net_since(user_id, None, cutoff).await,
            Decimal::ZERO
        );

        ledger
            .append_fill(fill(user_id, bot_id, Side::Buy, "1", "100", "0"))
            .await
            .unwrap();
        ledger
            .append_fill(fill(user_id, bot_id, Side::Sell, "1", "130", "0"))
            .await
            .unwrap();

        assert_eq!(
            ledger.realized_net_since(user_id, None, cutoff).await,
            dec("30")
        );
        // The pre-cutoff profit is excluded
        assert_eq!(
            ledger
                .realized_net_since(user_id, None, cutoff - chrono::Duration::days(1))
                .await,
            dec("80")
        );
    }
}
