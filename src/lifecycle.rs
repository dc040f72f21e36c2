//! Bot lifecycle state machine
//!
//! The registry owns every status mutation; the circuit breaker and the
//! capital allocator only request transitions through it. Each transition
//! persists the status, a timestamp, and a reason.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TransitionError;

/// Bot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    /// Created but never started
    New,
    Active,
    Paused,
    /// Terminal
    Stopped,
    /// Requires an explicit manual reset
    Quarantined,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::New => write!(f, "new"),
            BotStatus::Active => write!(f, "active"),
            BotStatus::Paused => write!(f, "paused"),
            BotStatus::Stopped => write!(f, "stopped"),
            BotStatus::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Persisted state for one bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub bot_id: Uuid,
    pub user_id: Uuid,
    pub exchange: String,
    pub status: BotStatus,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub paused_by_user: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub quarantine_reason: Option<String>,
    pub current_capital: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one bot within a bulk operation
#[derive(Debug, Clone)]
pub struct BulkOutcome {
    pub bot_id: Uuid,
    pub result: Result<BotStatus, TransitionError>,
}

/// Registry of all bot states
pub struct BotRegistry {
    bots: RwLock<HashMap<Uuid, BotState>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self {
            bots: RwLock::new(HashMap::new()),
        }
    }

    /// Create a bot in the `New` state with its starting capital
    pub async fn register(
        &self,
        bot_id: Uuid,
        user_id: Uuid,
        exchange: &str,
        starting_capital: Decimal,
    ) -> BotState {
        let state = BotState {
            bot_id,
            user_id,
            exchange: exchange.to_string(),
            status: BotStatus::New,
            paused_at: None,
            pause_reason: None,
            paused_by_user: false,
            stopped_at: None,
            stop_reason: None,
            quarantined_at: None,
            quarantine_reason: None,
            current_capital: starting_capital,
            created_at: Utc::now(),
        };
        info!(
            "Registered bot {} for user {} on {} with capital {}",
            bot_id, user_id, exchange, starting_capital
        );
        self.bots.write().await.insert(bot_id, state.clone());
        state
    }

    pub async fn get(&self, bot_id: Uuid) -> Option<BotState> {
        self.bots.read().await.get(&bot_id).cloned()
    }

    /// Current status read under the registry lock; the circuit-breaker
    /// gate depends on this being fresh
    pub async fn status(&self, bot_id: Uuid) -> Option<BotStatus> {
        self.bots.read().await.get(&bot_id).map(|b| b.status)
    }

    pub async fn bots_for_user(&self, user_id: Uuid) -> Vec<BotState> {
        let mut bots: Vec<BotState> = self
            .bots
            .read()
            .await
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        bots
    }

    /// Every registered bot
    pub async fn all_bots(&self) -> Vec<BotState> {
        let mut bots: Vec<BotState> = self.bots.read().await.values().cloned().collect();
        bots.sort_by_key(|b| b.created_at);
        bots
    }

    /// Distinct users with at least one registered bot
    pub async fn user_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .bots
            .read()
            .await
            .values()
            .map(|b| b.user_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of Active bots on an exchange, used to divide the exchange's
    /// rate limit per bot
    pub async fn active_bots_on_exchange(&self, exchange: &str) -> u32 {
        self.bots
            .read()
            .await
            .values()
            .filter(|b| b.exchange == exchange && b.status == BotStatus::Active)
            .count() as u32
    }

    /// `New` -> `Active`
    pub async fn start(&self, bot_id: Uuid) -> Result<BotState, TransitionError> {
        self.transition(bot_id, "start", |bot| match bot.status {
            BotStatus::New => {
                bot.status = BotStatus::Active;
                Ok(())
            }
            _ => Err(()),
        })
        .await
    }

    /// `Active` -> `Paused`; a no-op when already paused
    pub async fn pause(
        &self,
        bot_id: Uuid,
        reason: &str,
        by_user: bool,
    ) -> Result<BotState, TransitionError> {
        let reason = reason.to_string();
        self.transition(bot_id, "pause", move |bot| match bot.status {
            BotStatus::Active => {
                bot.status = BotStatus::Paused;
                bot.paused_at = Some(Utc::now());
                bot.pause_reason = Some(reason.clone());
                bot.paused_by_user = by_user;
                Ok(())
            }
            BotStatus::Paused => Ok(()),
            _ => Err(()),
        })
        .await
    }

    /// `Paused` -> `Active`; a quarantined bot must be reset first
    pub async fn resume(&self, bot_id: Uuid) -> Result<BotState, TransitionError> {
        self.transition(bot_id, "resume", |bot| match bot.status {
            BotStatus::Paused => {
                bot.status = BotStatus::Active;
                bot.paused_at = None;
                bot.pause_reason = None;
                bot.paused_by_user = false;
                Ok(())
            }
            _ => Err(()),
        })
        .await
    }

    /// Any non-terminal state -> `Stopped` (terminal)
    pub async fn stop(&self, bot_id: Uuid, reason: &str) -> Result<BotState, TransitionError> {
        let reason = reason.to_string();
        self.transition(bot_id, "stop", move |bot| match bot.status {
            BotStatus::Stopped => Err(()),
            _ => {
                bot.status = BotStatus::Stopped;
                bot.stopped_at = Some(Utc::now());
                bot.stop_reason = Some(reason.clone());
                Ok(())
            }
        })
        .await
    }

    /// `Active`/`Paused` -> `Quarantined`; invoked only by the circuit
    /// breaker. A soft pause must not block escalation to quarantine.
    pub async fn quarantine(
        &self,
        bot_id: Uuid,
        reason: &str,
    ) -> Result<BotState, TransitionError> {
        let reason = reason.to_string();
        self.transition(bot_id, "quarantine", move |bot| match bot.status {
            BotStatus::Active | BotStatus::Paused => {
                bot.status = BotStatus::Quarantined;
                bot.quarantined_at = Some(Utc::now());
                bot.quarantine_reason = Some(reason.clone());
                Ok(())
            }
            _ => Err(()),
        })
        .await
    }

    /// `Quarantined` -> `Paused` only; an explicit `resume` is still
    /// required to reach `Active`
    pub async fn reset_quarantine(
        &self,
        bot_id: Uuid,
        reason: &str,
    ) -> Result<BotState, TransitionError> {
        let reason = reason.to_string();
        self.transition(bot_id, "reset_quarantine", move |bot| match bot.status {
            BotStatus::Quarantined => {
                bot.status = BotStatus::Paused;
                bot.paused_at = Some(Utc::now());
                bot.pause_reason = Some(reason.clone());
                bot.paused_by_user = false;
                bot.quarantined_at = None;
                Ok(())
            }
            _ => Err(()),
        })
        .await
    }

    /// Increase a bot's working capital (allocator reinvestment)
    pub async fn add_capital(&self, bot_id: Uuid, amount: Decimal) -> Option<Decimal> {
        let mut bots = self.bots.write().await;
        let bot = bots.get_mut(&bot_id)?;
        bot.current_capital += amount;
        info!(
            "Bot {} capital increased by {} to {}",
            bot_id, amount, bot.current_capital
        );
        Some(bot.current_capital)
    }

    /// Pause every bot of a user; reports per-bot outcomes instead of
    /// failing the batch
    pub async fn pause_all(&self, user_id: Uuid, reason: &str) -> Vec<BulkOutcome> {
        let ids: Vec<Uuid> = self
            .bots_for_user(user_id)
            .await
            .into_iter()
            .map(|b| b.bot_id)
            .collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for bot_id in ids {
            let result = self.pause(bot_id, reason, true).await.map(|s| s.status);
            outcomes.push(BulkOutcome { bot_id, result });
        }
        outcomes
    }

    /// Resume every paused bot of a user; per-bot outcomes
    pub async fn resume_all(&self, user_id: Uuid) -> Vec<BulkOutcome> {
        let ids: Vec<Uuid> = self
            .bots_for_user(user_id)
            .await
            .into_iter()
            .map(|b| b.bot_id)
            .collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for bot_id in ids {
            let result = self.resume(bot_id).await.map(|s| s.status);
            outcomes.push(BulkOutcome { bot_id, result });
        }
        outcomes
    }

    /// Apply a guarded transition atomically per bot
    async fn transition<F>(
        &self,
        bot_id: Uuid,
        action: &'static str,
        apply: F,
    ) -> Result<BotState, TransitionError>
    where
        F: FnOnce(&mut BotState) -> Result<(), ()>,
    {
        let mut bots = self.bots.write().await;
        let bot = bots.get_mut(&bot_id).ok_or_else(|| TransitionError {
            action,
            status: "unknown".to_string(),
        })?;

        let from = bot.status;
        match apply(bot) {
            Ok(()) => {
                if bot.status != from {
                    info!("Bot {} {}: {} -> {}", bot_id, action, from, bot.status);
                }
                Ok(bot.clone())
            }
            Err(()) => {
                warn!("Bot {} rejected {} from {}", bot_id, action, from);
                Err(TransitionError {
                    action,
                    status: from.to_string(),
                })
            }
        }
    }
}

impl Default for BotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
