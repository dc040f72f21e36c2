//! Typed engine events
//!
//! The core emits events over a channel; delivery to the notification
//! collaborator is its concern, not ours. A dropped receiver never blocks
//! the hot path.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::exchange::Side;

/// Events emitted by the pipeline, breaker, lifecycle, and allocator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeExecuted {
        user_id: Uuid,
        bot_id: Uuid,
        order_id: Uuid,
        exchange: String,
        symbol: String,
        side: Side,
        amount: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    BotPaused {
        bot_id: Uuid,
        reason: String,
        by_user: bool,
    },
    BotResumed {
        bot_id: Uuid,
    },
    BotQuarantined {
        bot_id: Uuid,
        reason: String,
    },
    CircuitBreakerTripped {
        entity_type: String,
        entity_id: Uuid,
        reason: String,
        metadata: serde_json::Value,
    },
    ReinvestmentCompleted {
        user_id: Uuid,
        total_allocated: Decimal,
        bot_count: usize,
    },
    ProfitUpdated {
        user_id: Uuid,
        realized_pnl: Decimal,
        equity: Decimal,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::TradeExecuted { .. } => "trade_executed",
            EngineEvent::BotPaused { .. } => "bot_paused",
            EngineEvent::BotResumed { .. } => "bot_resumed",
            EngineEvent::BotQuarantined { .. } => "bot_quarantined",
            EngineEvent::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            EngineEvent::ReinvestmentCompleted { .. } => "reinvestment_completed",
            EngineEvent::ProfitUpdated { .. } => "profit_updated",
        }
    }
}

/// Envelope with the emission timestamp
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Sender half handed to every component
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventBus {
    /// Create the bus; the receiver goes to the notification collaborator
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("Emitting event: {}", event.event_type());
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        // Receiver gone means nobody is listening; core correctness is
        // independent of delivery
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (bus, mut rx) = EventBus::new();
        let bot_id = Uuid::new_v4();

        bus.emit(EngineEvent::BotPaused {
            bot_id,
            reason: "daily loss".to_string(),
            by_user: false,
        });
        bus.emit(EngineEvent::BotResumed { bot_id });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event.event_type(), "bot_paused");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event.event_type(), "bot_resumed");
    }

    #[test]
    fn test_emit_without_receiver_is_harmless() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(EngineEvent::BotResumed {
            bot_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::ReinvestmentCompleted {
            user_id: Uuid::new_v4(),
            total_allocated: Decimal::from(720),
            bot_count: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"reinvestment_completed\""));
        assert!(json.contains("\"total_allocated\":\"720\""));
    }
}
