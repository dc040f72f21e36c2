//! FIFO matching for realized and unrealized PnL
//!
//! Each sell consumes the oldest unmatched buys for its symbol; unmatched
//! quantity carries forward as the open position. A sell past the long
//! inventory opens a short lot, matched symmetrically by later buys.

use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

use crate::exchange::Side;

#[derive(Debug, Clone)]
struct Lot {
    amount: Decimal,
    price: Decimal,
    long: bool,
}

/// Running FIFO book over a fill stream
#[derive(Debug, Default)]
pub struct FifoBook {
    lots: HashMap<String, VecDeque<Lot>>,
    last_price: HashMap<String, Decimal>,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Trailing count of losing matches, reset by any non-losing match
    pub consecutive_losses: u32,
}

impl FifoBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fill in chronological order
    pub fn apply(&mut self, symbol: &str, side: Side, amount: Decimal, price: Decimal, fee: Decimal) {
        self.fees += fee;
        self.last_price.insert(symbol.to_string(), price);

        let incoming_long = side == Side::Buy;
        let lots = self.lots.entry(symbol.to_string()).or_default();
        let mut remaining = amount;

        while remaining > Decimal::ZERO {
            match lots.front_mut() {
                Some(front) if front.long != incoming_long => {
                    let matched = remaining.min(front.amount);
                    // Closing a long: sell price minus entry. Closing a
                    // short: entry minus buy price.
                    let delta = if front.long {
                        (price - front.price) * matched
                    } else {
                        (front.price - price) * matched
                    };
                    self.realized_pnl += delta;
                    if delta < Decimal::ZERO {
                        self.consecutive_losses += 1;
                    } else {
                        self.consecutive_losses = 0;
                    }

                    front.amount -= matched;
                    remaining -= matched;
                    if front.amount.is_zero() {
                        lots.pop_front();
                    }
                }
                _ => {
                    lots.push_back(Lot {
                        amount: remaining,
                        price,
                        long: incoming_long,
                    });
                    remaining = Decimal::ZERO;
                }
            }
        }
    }

    /// Open inventory marked at the last traded price per symbol
    pub fn unrealized_pnl(&self) -> Decimal {
        let mut total = Decimal::ZERO;
        for (symbol, lots) in &self.lots {
            let Some(mark) = self.last_price.get(symbol) else {
                continue;
            };
            for lot in lots {
                total += if lot.long {
                    (*mark - lot.price) * lot.amount
                } else {
                    (lot.price - *mark) * lot.amount
                };
            }
        }
        total
    }

    /// Signed open position for a symbol (negative when short)
    pub fn open_position(&self, symbol: &str) -> Decimal {
        self.lots
            .get(symbol)
            .map(|lots| {
                lots.iter()
                    .map(|l| if l.long { l.amount } else { -l.amount })
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// Realized PnL net of fees
    pub fn realized_net(&self) -> Decimal {
        self.realized_pnl - self.fees
    }
}
