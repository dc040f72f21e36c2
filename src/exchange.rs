//! Exchange connector boundary
//!
//! The engine talks to exchanges through `ExchangeConnector`; real
//! implementations live outside this crate. `PaperExchange` simulates fills
//! for paper trading and tests.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ExchangeError;

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order pricing instruction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// What the pipeline hands to a connector after admission
#[derive(Debug, Clone, Serialize)]
pub struct OrderTicket {
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub order_type: OrderType,
}

/// Executed trade reported back by the connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeFill {
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
}

/// Published fee schedule for an exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub taker_fee_bps: Decimal,
}

/// Exchange connector contract
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Published fee schedule, used to seed fee-coverage config
    fn fee_schedule(&self) -> FeeSchedule;

    /// External rate limit (orders per burst window) divided across the
    /// active bots on this exchange by the trade limiter
    fn rate_limit(&self) -> u32;

    async fn submit_order(&self, ticket: &OrderTicket) -> Result<ExchangeFill, ExchangeError>;
}

/// Simulated exchange for paper trading
///
/// Fills market orders at the posted price plus a small random slippage and
/// charges the schedule's taker fee.
pub struct PaperExchange {
    name: String,
    taker_fee_bps: Decimal,
    rate_limit: u32,
    prices: RwLock<HashMap<String, Decimal>>,
    /// Next submission fails with this error when set (test hook)
    injected_failure: StdMutex<Option<ExchangeError>>,
}

impl PaperExchange {
    pub fn new(name: &str, taker_fee_bps: Decimal, rate_limit: u32) -> Self {
        Self {
            name: name.to_string(),
            taker_fee_bps,
            rate_limit,
            prices: RwLock::new(HashMap::new()),
            injected_failure: StdMutex::new(None),
        }
    }

    /// Post or update the simulated market price for a symbol
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Make the next submission fail (test hook)
    pub fn inject_failure(&self, error: ExchangeError) {
        *self.injected_failure.lock().unwrap() = Some(error);
    }

    fn slippage_factor(&self, side: Side) -> Decimal {
        // Up to 3 bps against the taker
        let bps: i64 = rand::thread_rng().gen_range(0..=3);
        let drift = Decimal::new(bps, 4);
        match side {
            Side::Buy => Decimal::ONE + drift,
            Side::Sell => Decimal::ONE - drift,
        }
    }
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            taker_fee_bps: self.taker_fee_bps,
        }
    }

    fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    async fn submit_order(&self, ticket: &OrderTicket) -> Result<ExchangeFill, ExchangeError> {
        if let Some(err) = self.injected_failure.lock().unwrap().take() {
            return Err(err);
        }

        let posted = self
            .prices
            .read()
            .await
            .get(&ticket.symbol)
            .copied()
            .ok_or_else(|| {
                ExchangeError::permanent(format!("no market for symbol {}", ticket.symbol))
            })?;

        let price = match ticket.order_type {
            OrderType::Market => posted * self.slippage_factor(ticket.side),
            OrderType::Limit { price } => {
                // Simulated book: a limit crossing the posted price fills at
                // the limit, otherwise it is rejected rather than resting
                let crosses = match ticket.side {
                    Side::Buy => price >= posted,
                    Side::Sell => price <= posted,
                };
                if !crosses {
                    return Err(ExchangeError::permanent(format!(
                        "limit {} does not cross posted price {}",
                        price, posted
                    )));
                }
                price
            }
        };

        let notional = price * ticket.amount;
        let fee = notional * self.taker_fee_bps / Decimal::from(10_000);

        debug!(
            "Paper fill: {} {} {} @ {} (fee {})",
            ticket.side, ticket.amount, ticket.symbol, price, fee
        );

        Ok(ExchangeFill {
            price,
            amount: ticket.amount,
            fee,
            fee_currency: "USD".to_string(),
        })
    }
}

/// Log the connector roster at startup
pub fn log_connectors(connectors: &HashMap<String, std::sync::Arc<dyn ExchangeConnector>>) {
    for (name, conn) in connectors {
        info!(
            "Exchange connector: {} | taker fee {} bps | rate limit {}/window",
            name,
            conn.fee_schedule().taker_fee_bps,
            conn.rate_limit()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_ticket(side: Side, order_type: OrderType) -> OrderTicket {
        OrderTicket {
            symbol: "BTC/USD".to_string(),
            side,
            amount: "0.01".parse().unwrap(),
            order_type,
        }
    }

    #[tokio::test]
    async fn test_market_fill_with_fee() {
        let exchange = PaperExchange::new("paper", Decimal::from(25), 60);
        exchange.set_price("BTC/USD", Decimal::from(500_000)).await;

        let fill = exchange
            .submit_order(&btc_ticket(Side::Buy, OrderType::Market))
            .await
            .unwrap();

        assert_eq!(fill.amount, "0.01".parse::<Decimal>().unwrap());
        // Slippage is bounded at 3 bps
        assert!(fill.price >= Decimal::from(500_000));
        assert!(fill.price <= "500150".parse::<Decimal>().unwrap());
        // Fee is 25 bps of notional
        let expected_fee = fill.price * fill.amount * Decimal::from(25) / Decimal::from(10_000);
        assert_eq!(fill.fee, expected_fee);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_permanent_rejection() {
        let exchange = PaperExchange::new("paper", Decimal::from(25), 60);
        let err = exchange
            .submit_order(&btc_ticket(Side::Buy, OrderType::Market))
            .await
            .unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn test_limit_order_crossing() {
        let exchange = PaperExchange::new("paper", Decimal::from(10), 60);
        exchange.set_price("BTC/USD", Decimal::from(500_000)).await;

        // Buy limit above posted price crosses and fills at the limit
        let fill = exchange
            .submit_order(&btc_ticket(
                Side::Buy,
                OrderType::Limit {
                    price: Decimal::from(501_000),
                },
            ))
            .await
            .unwrap();
        assert_eq!(fill.price, Decimal::from(501_000));

        // Buy limit below posted price does not cross
        let err = exchange
            .submit_order(&btc_ticket(
                Side::Buy,
                OrderType::Limit {
                    price: Decimal::from(499_000),
                },
            ))
            .await
            .unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let exchange = PaperExchange::new("paper", Decimal::from(25), 60);
        exchange.set_price("BTC/USD", Decimal::from(500_000)).await;
        exchange.inject_failure(ExchangeError::transient("gateway timeout"));

        let err = exchange
            .submit_order(&btc_ticket(Side::Buy, OrderType::Market))
            .await
            .unwrap_err();
        assert!(err.transient);

        // Next submission succeeds
        assert!(exchange
            .submit_order(&btc_ticket(Side::Buy, OrderType::Market))
            .await
            .is_ok());
    }
}
