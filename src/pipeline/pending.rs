//! Pending-order store with exactly-once admission
//!
//! One PendingOrder per idempotency key, enforced by an atomic
//! insert-if-absent. Status transitions are monotonic: a final status never
//! regresses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GateRejection, TransitionError};

/// Pending-order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Failed,
}

impl PendingStatus {
    /// Final statuses never transition again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PendingStatus::Filled | PendingStatus::Cancelled | PendingStatus::Failed
        )
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingStatus::Pending => write!(f, "pending"),
            PendingStatus::Submitted => write!(f, "submitted"),
            PendingStatus::Filled => write!(f, "filled"),
            PendingStatus::Cancelled => write!(f, "cancelled"),
            PendingStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Order admitted past the idempotency gate
#[derive(Debug, Clone, Serialize)]
pub struct PendingOrder {
    pub idempotency_key: String,
    pub bot_id: Uuid,
    pub user_id: Uuid,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Store keyed by idempotency key
pub struct PendingOrderStore {
    orders: Mutex<HashMap<String, PendingOrder>>,
}

impl PendingOrderStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic insert-if-absent. A concurrent loser observes the existing
    /// key and gets `DuplicateOrder`, whatever the existing status is.
    pub async fn try_insert(
        &self,
        idempotency_key: &str,
        bot_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), GateRejection> {
        let mut orders = self.orders.lock().await;
        if orders.contains_key(idempotency_key) {
            return Err(GateRejection::DuplicateOrder {
                key: idempotency_key.to_string(),
            });
        }
        let now = Utc::now();
        orders.insert(
            idempotency_key.to_string(),
            PendingOrder {
                idempotency_key: idempotency_key.to_string(),
                bot_id,
                user_id,
                status: PendingStatus::Pending,
                created_at: now,
                updated_at: now,
                last_error: None,
            },
        );
        debug!("Pending order created for key {}", idempotency_key);
        Ok(())
    }

    /// Move an order to a new status; final statuses never regress
    pub async fn transition(
        &self,
        idempotency_key: &str,
        status: PendingStatus,
        error: Option<&str>,
    ) -> Result<PendingOrder, TransitionError> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(idempotency_key)
            .ok_or_else(|| TransitionError {
                action: "transition_pending",
                status: "unknown".to_string(),
            })?;

        if order.status.is_final() {
            return Err(TransitionError {
                action: "transition_pending",
                status: order.status.to_string(),
            });
        }

        debug!(
            "Pending order {}: {} -> {}",
            idempotency_key, order.status, status
        );
        order.status = status;
        order.updated_at = Utc::now();
        if let Some(e) = error {
            order.last_error = Some(e.to_string());
        }
        Ok(order.clone())
    }

    pub async fn get(&self, idempotency_key: &str) -> Option<PendingOrder> {
        self.orders.lock().await.get(idempotency_key).cloned()
    }
}

impl Default for PendingOrderStore {
    fn default() -> Self {
        Self::new()
    }
}
