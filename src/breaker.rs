//! Circuit Breaker - per-bot/per-user fault containment
//!
//! Soft threshold breaches (daily loss, consecutive losses) pause the bot;
//! hard breaches (max drawdown, error storm) quarantine it. Every change of
//! trip status appends to an immutable history.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BreakerConfig, BreakerThresholds};

/// Entity a breaker record applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "entity_type", content = "entity_id", rename_all = "snake_case")]
pub enum BreakerEntity {
    Bot(Uuid),
    User(Uuid),
}

impl BreakerEntity {
    pub fn entity_type(&self) -> &'static str {
        match self {
            BreakerEntity::Bot(_) => "bot",
            BreakerEntity::User(_) => "user",
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            BreakerEntity::Bot(id) | BreakerEntity::User(id) => *id,
        }
    }
}

/// Metrics snapshot taken at evaluation time
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BreakerMetrics {
    pub drawdown_pct: Decimal,
    pub daily_loss_pct: Decimal,
    pub consecutive_losses: u32,
    pub errors_per_hour: u32,
}

/// How severe the breach is, deciding pause vs quarantine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripSeverity {
    /// Resumable by the user
    Soft,
    /// Requires an explicit manual reset
    Hard,
}

/// A breach found by `evaluate`
#[derive(Debug, Clone, Serialize)]
pub struct TripDecision {
    pub severity: TripSeverity,
    pub reason: String,
}

/// One entry in the append-only trip/reset history
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerRecord {
    pub id: Uuid,
    pub entity: BreakerEntity,
    pub is_tripped: bool,
    pub trip_reason: Option<String>,
    pub metrics: Option<BreakerMetrics>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub reset_reason: Option<String>,
}

/// Breaker evaluation engine with append-only history
pub struct BreakerEngine {
    config: BreakerConfig,
    history: RwLock<Vec<CircuitBreakerRecord>>,
    errors: Mutex<HashMap<Uuid, VecDeque<DateTime<Utc>>>>,
}

impl BreakerEngine {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            history: RwLock::new(Vec::new()),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Record an exchange/submission error for a bot's error-rate window
    pub async fn record_error(&self, bot_id: Uuid) {
        self.record_error_at(bot_id, Utc::now()).await
    }

    pub async fn record_error_at(&self, bot_id: Uuid, at: DateTime<Utc>) {
        let mut errors = self.errors.lock().await;
        let window = errors.entry(bot_id).or_default();
        window.push_back(at);
        let cutoff = at - Duration::hours(1);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
    }

    /// Errors recorded for a bot in the trailing hour
    pub async fn errors_per_hour(&self, bot_id: Uuid) -> u32 {
        self.errors_per_hour_at(bot_id, Utc::now()).await
    }

    pub async fn errors_per_hour_at(&self, bot_id: Uuid, now: DateTime<Utc>) -> u32 {
        let errors = self.errors.lock().await;
        let cutoff = now - Duration::hours(1);
        errors
            .get(&bot_id)
            .map(|w| w.iter().filter(|t| **t >= cutoff).count() as u32)
            .unwrap_or(0)
    }

    /// Compare metrics against thresholds. Hard triggers win over soft.
    pub fn evaluate(
        &self,
        metrics: &BreakerMetrics,
        thresholds: &BreakerThresholds,
    ) -> Option<TripDecision> {
        if metrics.drawdown_pct >= thresholds.max_drawdown_pct {
            return Some(TripDecision {
                severity: TripSeverity::Hard,
                reason: format!(
                    "max_drawdown_percent breached: {}% >= {}%",
                    metrics.drawdown_pct, thresholds.max_drawdown_pct
                ),
            });
        }
        if metrics.errors_per_hour >= thresholds.max_errors_per_hour {
            return Some(TripDecision {
                severity: TripSeverity::Hard,
                reason: format!(
                    "errors_per_hour breached: {} >= {}",
                    metrics.errors_per_hour, thresholds.max_errors_per_hour
                ),
            });
        }
        if metrics.daily_loss_pct >= thresholds.daily_loss_pct {
            return Some(TripDecision {
                severity: TripSeverity::Soft,
                reason: format!(
                    "daily_loss_percent breached: {}% >= {}%",
                    metrics.daily_loss_pct, thresholds.daily_loss_pct
                ),
            });
        }
        if metrics.consecutive_losses >= thresholds.max_consecutive_losses {
            return Some(TripDecision {
                severity: TripSeverity::Soft,
                reason: format!(
                    "consecutive_losses breached: {} >= {}",
                    metrics.consecutive_losses, thresholds.max_consecutive_losses
                ),
            });
        }
        None
    }

    /// Current trip state: the latest record for the entity
    pub async fn is_tripped(&self, entity: BreakerEntity) -> bool {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.entity == entity)
            .map(|r| r.is_tripped)
            .unwrap_or(false)
    }

    /// Append a trip record; returns false when the entity is already
    /// tripped (no status change, no record)
    pub async fn record_trip(
        &self,
        entity: BreakerEntity,
        decision: &TripDecision,
        metrics: BreakerMetrics,
    ) -> bool {
        let mut history = self.history.write().await;
        let already_tripped = history
            .iter()
            .rev()
            .find(|r| r.entity == entity)
            .map(|r| r.is_tripped)
            .unwrap_or(false);
        if already_tripped {
            return false;
        }

        warn!(
            "Circuit breaker tripped for {} {}: {}",
            entity.entity_type(),
            entity.entity_id(),
            decision.reason
        );
        history.push(CircuitBreakerRecord {
            id: Uuid::new_v4(),
            entity,
            is_tripped: true,
            trip_reason: Some(decision.reason.clone()),
            metrics: Some(metrics),
            tripped_at: Some(Utc::now()),
            reset_at: None,
            reset_reason: None,
        });
        true
    }

    /// Append a reset record; returns false when the entity is not tripped
    pub async fn record_reset(&self, entity: BreakerEntity, reason: &str) -> bool {
        let mut history = self.history.write().await;
        let tripped = history
            .iter()
            .rev()
            .find(|r| r.entity == entity)
            .map(|r| r.is_tripped)
            .unwrap_or(false);
        if !tripped {
            return false;
        }

        info!(
            "Circuit breaker reset for {} {}: {}",
            entity.entity_type(),
            entity.entity_id(),
            reason
        );
        history.push(CircuitBreakerRecord {
            id: Uuid::new_v4(),
            entity,
            is_tripped: false,
            trip_reason: None,
            metrics: None,
            tripped_at: None,
            reset_at: Some(Utc::now()),
            reset_reason: Some(reason.to_string()),
        });
        true
    }

    /// Full history for an entity, oldest first; never edited
    pub async fn history(&self, entity: BreakerEntity) -> Vec<CircuitBreakerRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.entity == entity)
            .cloned()
            .collect()
    }
}
