//! Trade limiter - daily and burst counters
//!
//! Check and increment happen inside one critical section so concurrent
//! submissions can never overshoot a counter. Daily counters reset at UTC
//! day boundaries; the burst counter rolls with a sliding window.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{GateRejection, LimitCounter};

/// Counter usage exposed to operators
#[derive(Debug, Clone, Serialize)]
pub struct LimitsUsage {
    pub trades_today: u32,
    pub max_trades: u32,
    pub remaining: u32,
}

struct LimiterInner {
    bot_daily: HashMap<(Uuid, NaiveDate), u32>,
    user_daily: HashMap<(Uuid, NaiveDate), u32>,
    burst: HashMap<(String, Uuid), VecDeque<DateTime<Utc>>>,
}

/// Keyed, atomically updated counter store
pub struct TradeLimiter {
    config: LimitsConfig,
    inner: Mutex<LimiterInner>,
}

impl TradeLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LimiterInner {
                bot_daily: HashMap::new(),
                user_daily: HashMap::new(),
                burst: HashMap::new(),
            }),
        }
    }

    /// Check all three counters and claim a slot in each, atomically.
    ///
    /// The exchange-wide rate limit is divided across the bots currently
    /// active on that exchange so the whole account stays inside the
    /// exchange's real limit.
    pub async fn check_and_admit(
        &self,
        bot_id: Uuid,
        user_id: Uuid,
        exchange: &str,
        active_bots_on_exchange: u32,
        now: DateTime<Utc>,
    ) -> Result<(), GateRejection> {
        let day = now.date_naive();
        let window = Duration::seconds(self.config.burst_limit_window_seconds as i64);
        let per_bot_burst =
            self.config.exchange_rate_limit(exchange) / active_bots_on_exchange.max(1);

        let mut inner = self.inner.lock().await;

        let bot_used = inner.bot_daily.get(&(bot_id, day)).copied().unwrap_or(0);
        if bot_used >= self.config.max_trades_per_bot_daily {
            return Err(GateRejection::LimitExceeded {
                counter: LimitCounter::BotDaily,
                used: bot_used,
                max: self.config.max_trades_per_bot_daily,
            });
        }

        let user_used = inner.user_daily.get(&(user_id, day)).copied().unwrap_or(0);
        if user_used >= self.config.max_trades_per_user_daily {
            return Err(GateRejection::LimitExceeded {
                counter: LimitCounter::UserDaily,
                used: user_used,
                max: self.config.max_trades_per_user_daily,
            });
        }

        let burst_key = (exchange.to_string(), bot_id);
        let cutoff = now - window;
        let burst = inner.burst.entry(burst_key).or_default();
        while burst.front().is_some_and(|t| *t < cutoff) {
            burst.pop_front();
        }
        let burst_used = burst.len() as u32;
        if burst_used >= per_bot_burst {
            return Err(GateRejection::LimitExceeded {
                counter: LimitCounter::ExchangeBurst,
                used: burst_used,
                max: per_bot_burst,
            });
        }

        // All three pass: claim the slots before releasing the lock
        burst.push_back(now);
        *inner.bot_daily.entry((bot_id, day)).or_insert(0) += 1;
        *inner.user_daily.entry((user_id, day)).or_insert(0) += 1;

        // Drop exhausted day buckets
        inner.bot_daily.retain(|(_, d), _| *d == day);
        inner.user_daily.retain(|(_, d), _| *d == day);

        Ok(())
    }

    /// Daily usage for one bot
    pub async fn bot_usage(&self, bot_id: Uuid, now: DateTime<Utc>) -> LimitsUsage {
        let inner = self.inner.lock().await;
        let used = inner
            .bot_daily
            .get(&(bot_id, now.date_naive()))
            .copied()
            .unwrap_or(0);
        LimitsUsage {
            trades_today: used,
            max_trades: self.config.max_trades_per_bot_daily,
            remaining: self.config.max_trades_per_bot_daily.saturating_sub(used),
        }
    }

    /// Daily usage for one user across all bots
    pub async fn user_usage(&self, user_id: Uuid, now: DateTime<Utc>) -> LimitsUsage {
        let inner = self.inner.lock().await;
        let used = inner
            .user_daily
            .get(&(user_id, now.date_naive()))
            .copied()
            .unwrap_or(0);
        LimitsUsage {
            trades_today: used,
            max_trades: self.config.max_trades_per_user_daily,
            remaining: self.config.max_trades_per_user_daily.saturating_sub(used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small_config() -> LimitsConfig {
        LimitsConfig {
            max_trades_per_bot_daily: 3,
            max_trades_per_user_daily: 5,
            exchange_rate_limits: HashMap::new(),
            default_exchange_rate_limit: 100,
            burst_limit_window_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_bot_daily_exhaustion_and_utc_reset() {
        let limiter = TradeLimiter::new(small_config());
        let bot_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..3 {
            limiter
                .check_and_admit(bot_id, user_id, "paper", 1, now)
                .await
                .unwrap();
        }

        let err = limiter
            .check_and_admit(bot_id, user_id, "paper", 1, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateRejection::LimitExceeded {
                counter: LimitCounter::BotDaily,
                used: 3,
                max: 3,
            }
        ));

        // The counter resets at the next UTC day boundary
        let tomorrow = now + Duration::days(1);
        limiter
            .check_and_admit(bot_id, user_id, "paper", 1, tomorrow)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_user_daily_spans_bots() {
        let limiter = TradeLimiter::new(small_config());
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        // Two bots, 5 user trades total allowed
        for i in 0..5 {
            let bot_id = if i % 2 == 0 {
                Uuid::from_u128(1)
            } else {
                Uuid::from_u128(2)
            };
            limiter
                .check_and_admit(bot_id, user_id, "paper", 2, now)
                .await
                .unwrap();
        }

        let err = limiter
            .check_and_admit(Uuid::from_u128(3), user_id, "paper", 3, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateRejection::LimitExceeded {
                counter: LimitCounter::UserDaily,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_burst_limit_divided_across_bots() {
        let mut config = small_config();
        config.max_trades_per_bot_daily = 100;
        config.max_trades_per_user_daily = 100;
        config
            .exchange_rate_limits
            .insert("kraken".to_string(), 6);
        let limiter = TradeLimiter::new(config);

        let bot_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        // 3 active bots on kraken: floor(6 / 3) = 2 orders per bot per window
        limiter
            .check_and_admit(bot_id, user_id, "kraken", 3, now)
            .await
            .unwrap();
        limiter
            .check_and_admit(bot_id, user_id, "kraken", 3, now)
            .await
            .unwrap();
        let err = limiter
            .check_and_admit(bot_id, user_id, "kraken", 3, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateRejection::LimitExceeded {
                counter: LimitCounter::ExchangeBurst,
                used: 2,
                max: 2,
            }
        ));

        // The window slides: the same order is admitted a window later
        let later = now + Duration::seconds(61);
        limiter
            .check_and_admit(bot_id, user_id, "kraken", 3, later)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_overshoot_under_concurrency() {
        let mut config = small_config();
        config.max_trades_per_bot_daily = 10;
        config.max_trades_per_user_daily = 10;
        let limiter = Arc::new(TradeLimiter::new(config));
        let bot_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter
                        .check_and_admit(bot_id, user_id, "paper", 1, now)
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        // The counter can never be read, checked, and incremented separately
        assert_eq!(admitted, 10);
        assert_eq!(limiter.bot_usage(bot_id, now).await.remaining, 0);
    }
}
